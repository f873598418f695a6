//! 编排器：对外唯一入口
//!
//! invoke 流程：初始化（只执行一次）→ 按操作熔断闸门 → 校验 / 自动修正 → 结果缓存 →
//! 派发（worker 池或直连底座，带超时）→ 失败时交给 ErrorRecoverySystem → 结果归一化 → 写缓存。
//! 运行期错误不以 Err 返回，而是体现在 OperationResult 中；每次调用输出一行 JSON 审计日志。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capability::{Capabilities, CapabilityProbe, ConfigSelector, OperatingConfig};
use crate::config::AppConfig;
use crate::core::{Admission, ExecError, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use crate::memory::{LodLevel, MemoryManager, MemoryStats};
use crate::pool::{PoolStats, Task, WorkerPool};
use crate::recovery::{
    classify, ErrorCategory, ErrorRecoverySystem, GeometryRelaxStrategy, RecoveryExecutor,
    RecoveryStats, ValidationContext,
};
use crate::substrate::{ComputeSubstrate, Mesh, Operation, OperationKind, SubstrateError, WorkerFactory};

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Performance {
    pub duration_ms: u64,
    pub memory_delta_mb: f64,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationError {
    pub category: ErrorCategory,
    pub message: String,
    pub recoverable: bool,
}

/// 一次调用的结果；失败时 data 为 None、error 给出归类后的原因
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult<T = Value> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<OperationError>,
    pub request_id: String,
    pub performance: Performance,
    pub fallback_used: bool,
    pub retry_count: u32,
    pub warnings: Vec<String>,
}

impl<T> OperationResult<T> {
    /// 保留状态与簿记字段，丢弃 data（换成另一种载荷类型）
    fn without_data<U>(self) -> OperationResult<U> {
        OperationResult {
            success: self.success,
            data: None,
            error: self.error,
            request_id: self.request_id,
            performance: self.performance,
            fallback_used: self.fallback_used,
            retry_count: self.retry_count,
            warnings: self.warnings,
        }
    }
}

/// 网格结果：实际返回的 LOD 级别与网格
#[derive(Debug, Clone, Serialize)]
pub struct TessellationOutput {
    pub lod: LodLevel,
    pub mesh: Mesh,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub initialized: bool,
    pub capabilities: Option<Capabilities>,
    pub operating: Option<OperatingConfig>,
    pub invocations: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub pool: Option<PoolStats>,
    pub memory: Option<MemoryStats>,
    pub recovery: RecoveryStats,
}

/// 初始化后固定的运行期组件
struct Runtime {
    capabilities: Capabilities,
    operating: OperatingConfig,
    memory: Arc<MemoryManager>,
    pool: Option<Arc<WorkerPool>>,
}

pub struct Orchestrator {
    config: AppConfig,
    substrate: Arc<dyn ComputeSubstrate>,
    factory: Arc<dyn WorkerFactory>,
    probe: CapabilityProbe,
    recovery: ErrorRecoverySystem,
    shutdown: Arc<ShutdownManager>,
    runtime: OnceCell<Runtime>,
    invocations: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
}

/// run 的产出：对外结果，加上实际执行的操作与成功的恢复策略
struct Invocation {
    result: OperationResult,
    /// 校验修正后的操作；校验前即失败时为 None
    effective: Option<Operation>,
    strategy: Option<&'static str>,
}

impl From<OperationResult> for Invocation {
    fn from(result: OperationResult) -> Self {
        Self {
            result,
            effective: None,
            strategy: None,
        }
    }
}

/// 半开试探名额：调用方在结果出来前被取消时归还，避免熔断器停在"试探在途"
struct TrialSlot<'a> {
    recovery: &'a ErrorRecoverySystem,
    operation: &'a str,
    held: bool,
}

impl TrialSlot<'_> {
    /// 结果已记入熔断器
    fn settle(&mut self) {
        self.held = false;
    }
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            debug!(operation = self.operation, "Abandoned circuit trial released");
            self.recovery.release_trial(self.operation);
        }
    }
}

fn mesh_key(shape_id: &str, tolerance: f64) -> String {
    format!("{}@{}", shape_id, tolerance)
}

/// 单次调用过程中的簿记
struct Call {
    request_id: String,
    operation: String,
    started: Instant,
    bytes_before: u64,
    warnings: Vec<String>,
}

impl Orchestrator {
    pub(crate) fn new(
        config: AppConfig,
        substrate: Arc<dyn ComputeSubstrate>,
        factory: Arc<dyn WorkerFactory>,
        probe: CapabilityProbe,
        recovery: ErrorRecoverySystem,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        Self {
            config,
            substrate,
            factory,
            probe,
            recovery,
            shutdown,
            runtime: OnceCell::new(),
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// 探测 → 选择运行模式 → 内存管理器 → worker 池 → 后台循环；只执行一次
    pub async fn initialize(&self) -> Result<(), ExecError> {
        self.runtime().await.map(|_| ())
    }

    async fn runtime(&self) -> Result<&Runtime, ExecError> {
        if self.shutdown.is_shutdown() {
            return Err(ExecError::Shutdown);
        }
        self.runtime.get_or_try_init(|| self.build_runtime()).await
    }

    async fn build_runtime(&self) -> Result<Runtime, ExecError> {
        let capabilities = self.probe.detect();
        if !capabilities.compute_available {
            error!("Compute substrate unavailable, refusing to start");
            return Err(ExecError::Initialization(
                "compute substrate unavailable".to_string(),
            ));
        }
        let operating = ConfigSelector::select(&capabilities);

        let memory = Arc::new(
            MemoryManager::new(self.config.cache.clone(), operating.memory_budget_mb)
                .with_usage_source(Arc::clone(&self.substrate)),
        );
        memory.sample_usage();
        memory.start_maintenance(self.shutdown.child_token());

        let pool = if self.config.orchestrator.use_worker_pool {
            let (min, max) = self.config.pool.resolve_bounds(operating.worker_count_hint);
            let pool = WorkerPool::new(
                self.config.pool.clone(),
                min,
                max,
                operating.mode,
                Arc::clone(&self.factory),
                self.shutdown.child_token(),
            );
            pool.initialize().await?;
            Some(pool)
        } else {
            None
        };

        info!(
            mode = ?operating.mode,
            workers = operating.worker_count_hint,
            budget_mb = operating.memory_budget_mb,
            pool = pool.is_some(),
            "Orchestrator initialized"
        );
        Ok(Runtime {
            capabilities,
            operating,
            memory,
            pool,
        })
    }

    /// 执行一个操作；运行期失败体现在返回值中
    pub async fn invoke(&self, name: &str, params: Value) -> OperationResult {
        self.run(name, params).await.result
    }

    async fn run(&self, name: &str, params: Value) -> Invocation {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let mut operation = Operation::new(name, params);
        let mut call = Call {
            request_id: Uuid::new_v4().to_string(),
            operation: operation.name().to_string(),
            started: Instant::now(),
            bytes_before: 0,
            warnings: Vec::new(),
        };

        let runtime = match self.runtime().await {
            Ok(runtime) => runtime,
            Err(e) => return self.fail(&call, None, &operation, e, false, 0).into(),
        };
        call.bytes_before = runtime.memory.total_bytes();

        let context = ValidationContext {
            pressure: runtime.memory.pressure(),
        };
        let report = self.recovery.validate(&operation, &context);
        call.warnings.extend(report.warnings.iter().cloned());
        if !report.valid && !report.fixable {
            let err = ExecError::Validation(report.errors.join("; "));
            return self.fail(&call, Some(runtime), &operation, err, false, 0).into();
        }
        if let Some(fix) = report.suggested_fix {
            for problem in &report.errors {
                call.warnings.push(format!("auto-fixed: {}", problem));
            }
            debug!(operation = %call.operation, params = %fix, "Applying parameter fix");
            operation = operation.with_params(fix);
        }

        // 缓存命中不触达底座，不受熔断影响
        let cacheable = self.config.orchestrator.enable_cache && operation.kind().is_cacheable();
        let cache_key = operation.cache_key();
        if cacheable {
            if let Some(hit) = runtime.memory.get_result(&cache_key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                let result = self.succeed(&call, runtime, hit, true, false, 0);
                return Invocation {
                    result,
                    effective: Some(operation),
                    strategy: None,
                };
            }
        }

        let admission = self.recovery.admit(&call.operation);
        if admission == Admission::Rejected {
            debug!(operation = %call.operation, "Circuit open, failing fast");
            let err = ExecError::CircuitOpen(call.operation.clone());
            return self.fail(&call, Some(runtime), &operation, err, false, 0).into();
        }
        let mut trial = TrialSlot {
            recovery: &self.recovery,
            operation: &call.operation,
            held: admission == Admission::Trial,
        };

        let dispatched = self.dispatch(runtime, &operation).await;
        let settled = match dispatched {
            Ok(value) => {
                self.recovery.record_success(&call.operation);
                Ok((value, false, 0, None))
            }
            Err(e) => {
                debug!(operation = %call.operation, error = %e, "Dispatch failed, recovering");
                let outcome = self.recovery.handle_error(e, &operation, self).await;
                match (outcome.recovered, outcome.result, outcome.final_error) {
                    (true, Some(value), _) => {
                        Ok((value, true, outcome.retry_count, outcome.strategy))
                    }
                    (_, _, final_error) => Err((
                        final_error.unwrap_or_else(|| {
                            ExecError::InvalidResult("recovery produced no result".to_string())
                        }),
                        outcome.retry_count,
                    )),
                }
            }
        };
        trial.settle();

        let (raw, fallback_used, retry_count, strategy) = match settled {
            Ok(done) => done,
            Err((err, retry_count)) => {
                return self
                    .fail(&call, Some(runtime), &operation, err, retry_count > 0, retry_count)
                    .into();
            }
        };

        let data = match normalize(raw) {
            Ok(data) => data,
            Err(e) => {
                self.recovery.record_error(classify(&e, &operation, retry_count));
                return self
                    .fail(&call, Some(runtime), &operation, e, fallback_used, retry_count)
                    .into();
            }
        };

        // 放宽参数后的结果不代表原参数，不入缓存
        if cacheable && strategy != Some(GeometryRelaxStrategy::NAME) {
            let priority = operation.kind().default_priority();
            runtime.memory.cache_result(&cache_key, data.clone(), priority);
            if let Some(shape_id) = data.get("id").and_then(Value::as_str) {
                runtime.memory.cache_shape(shape_id, data.clone(), priority);
            }
        }

        let result = self.succeed(&call, runtime, data, false, fallback_used, retry_count);
        Invocation {
            result,
            effective: Some(operation),
            strategy,
        }
    }

    /// 网格化：先查网格缓存（"{shape_id}@{tolerance}"），未命中则执行 TESSELLATE 并生成 LOD；
    /// 返回当前内存压力下合适的级别
    ///
    /// 网格按实际使用的弦差入缓存；经几何放宽恢复得到的网格只返回、不入缓存。
    pub async fn tessellate(&self, shape_id: &str, tolerance: f64) -> OperationResult<TessellationOutput> {
        let key = mesh_key(shape_id, tolerance);
        if let Ok(runtime) = self.runtime().await {
            if let Some((lod, mesh)) = runtime.memory.get_mesh(&key, LodLevel::High) {
                self.invocations.fetch_add(1, Ordering::Relaxed);
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                let call = Call {
                    request_id: Uuid::new_v4().to_string(),
                    operation: OperationKind::Tessellate.name().to_string(),
                    started: Instant::now(),
                    bytes_before: runtime.memory.total_bytes(),
                    warnings: Vec::new(),
                };
                let hit = self.succeed(&call, runtime, Value::Null, true, false, 0);
                return OperationResult {
                    data: Some(TessellationOutput { lod, mesh }),
                    ..hit.without_data()
                };
            }
        }

        let Invocation {
            mut result,
            effective,
            strategy,
        } = self
            .run(
                OperationKind::Tessellate.name(),
                json!({"shapeId": shape_id, "tolerance": tolerance}),
            )
            .await;
        let data = result.data.take();
        let (Some(runtime), Some(data)) = (self.runtime.get(), data) else {
            return result.without_data();
        };

        let mesh = match serde_json::from_value::<Mesh>(data) {
            Ok(mesh) => mesh,
            Err(e) => {
                warn!(shape_id, error = %e, "Tessellation result is not a mesh");
                let mut failed = result.without_data();
                failed.success = false;
                failed.error = Some(OperationError {
                    category: ErrorCategory::Geometry,
                    message: format!("Invalid result: tessellation did not return a mesh ({})", e),
                    recoverable: true,
                });
                return failed;
            }
        };

        let lod = if strategy == Some(GeometryRelaxStrategy::NAME) {
            debug!(shape_id, "Relaxed mesh served without caching");
            runtime.memory.build_lod(mesh)
        } else {
            let used = effective
                .as_ref()
                .and_then(|op| op.param_f64("tolerance"))
                .unwrap_or(tolerance);
            let (lod, _) = runtime.memory.cache_mesh(
                &mesh_key(shape_id, used),
                mesh,
                OperationKind::Tessellate.default_priority(),
            );
            lod
        };
        let (level, served) = lod.select(LodLevel::High, runtime.memory.pressure());
        let output = TessellationOutput {
            lod: level,
            mesh: served.clone(),
        };
        OperationResult {
            data: Some(output),
            ..result.without_data()
        }
    }

    /// 按 id 查询已缓存的形体
    pub async fn shape(&self, shape_id: &str) -> Option<Value> {
        let runtime = self.runtime.get()?;
        runtime.memory.get_shape(shape_id)
    }

    pub fn recovery(&self) -> &ErrorRecoverySystem {
        &self.recovery
    }

    pub fn memory(&self) -> Option<Arc<MemoryManager>> {
        self.runtime.get().map(|r| Arc::clone(&r.memory))
    }

    pub fn pool(&self) -> Option<Arc<WorkerPool>> {
        self.runtime.get().and_then(|r| r.pool.clone())
    }

    fn task_timeout(&self) -> std::time::Duration {
        self.config
            .orchestrator
            .operation_timeout()
            .min(self.config.pool.task_timeout())
    }

    async fn dispatch(&self, runtime: &Runtime, operation: &Operation) -> Result<Value, ExecError> {
        match &runtime.pool {
            Some(pool) => {
                let task = Task::new(operation.clone(), self.task_timeout())
                    .with_mode(runtime.operating.mode);
                pool.execute(task).await
            }
            None => self.call_direct(operation).await,
        }
    }

    /// 不经过 worker 池，直接在底座上执行
    async fn call_direct(&self, operation: &Operation) -> Result<Value, ExecError> {
        let limit = self.config.orchestrator.operation_timeout();
        let call = async {
            match operation.kind() {
                OperationKind::Tessellate => {
                    let shape_id = operation.param_str("shapeId").unwrap_or_default();
                    let tolerance = operation
                        .param_f64("tolerance")
                        .unwrap_or(crate::recovery::DEFAULT_TOLERANCE);
                    let mesh = self.substrate.tessellate(shape_id, tolerance).await?;
                    serde_json::to_value(mesh).map_err(|e| {
                        SubstrateError::new(format!("Failed to encode mesh: {}", e))
                    })
                }
                _ => {
                    self.substrate
                        .invoke(operation.name(), operation.params())
                        .await
                }
            }
        };
        match timeout(limit, call).await {
            Ok(result) => result.map_err(ExecError::Substrate),
            Err(_) => Err(ExecError::Timeout {
                operation: operation.name().to_string(),
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    fn memory_delta_mb(call: &Call, runtime: Option<&Runtime>) -> f64 {
        let Some(runtime) = runtime else {
            return 0.0;
        };
        let after = runtime.memory.total_bytes() as f64;
        (after - call.bytes_before as f64) / MB
    }

    fn audit(&self, call: &Call, ok: bool, performance: &Performance, fallback_used: bool, retry_count: u32) {
        let audit = json!({
            "event": "operation_audit",
            "request_id": call.request_id,
            "operation": call.operation,
            "ok": ok,
            "cache_hit": performance.cache_hit,
            "fallback_used": fallback_used,
            "retry_count": retry_count,
            "duration_ms": performance.duration_ms,
        });
        info!(audit = %audit, "operation");
    }

    fn succeed(
        &self,
        call: &Call,
        runtime: &Runtime,
        data: Value,
        cache_hit: bool,
        fallback_used: bool,
        retry_count: u32,
    ) -> OperationResult {
        let performance = Performance {
            duration_ms: call.started.elapsed().as_millis() as u64,
            memory_delta_mb: Self::memory_delta_mb(call, Some(runtime)),
            cache_hit,
        };
        self.audit(call, true, &performance, fallback_used, retry_count);
        OperationResult {
            success: true,
            data: Some(data),
            error: None,
            request_id: call.request_id.clone(),
            performance,
            fallback_used,
            retry_count,
            warnings: call.warnings.clone(),
        }
    }

    fn fail(
        &self,
        call: &Call,
        runtime: Option<&Runtime>,
        operation: &Operation,
        err: ExecError,
        fallback_used: bool,
        retry_count: u32,
    ) -> OperationResult {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let classified = classify(&err, operation, retry_count);
        // 派发与归一化阶段的错误已在别处记入历史
        if matches!(
            err,
            ExecError::Validation(_)
                | ExecError::CircuitOpen(_)
                | ExecError::Initialization(_)
                | ExecError::Shutdown
        ) {
            self.recovery.record_error(classified.clone());
        }
        let performance = Performance {
            duration_ms: call.started.elapsed().as_millis() as u64,
            memory_delta_mb: Self::memory_delta_mb(call, runtime),
            cache_hit: false,
        };
        self.audit(call, false, &performance, fallback_used, retry_count);
        OperationResult {
            success: false,
            data: None,
            error: Some(OperationError {
                category: classified.category,
                message: classified.message,
                recoverable: classified.recoverable,
            }),
            request_id: call.request_id.clone(),
            performance,
            fallback_used,
            retry_count,
            warnings: call.warnings.clone(),
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        let runtime = self.runtime.get();
        OrchestratorStats {
            initialized: runtime.is_some(),
            capabilities: runtime.map(|r| r.capabilities),
            operating: runtime.map(|r| r.operating),
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            pool: runtime.and_then(|r| r.pool.as_ref().map(|p| p.stats())),
            memory: runtime.map(|r| r.memory.stats()),
            recovery: self.recovery.stats(),
        }
    }

    /// 取消后台循环，终止 worker，清空缓存
    pub async fn shutdown(&self) {
        let mut coordinator = ShutdownCoordinator::new(Arc::clone(&self.shutdown))
            .with_cleanup_timeout(self.config.orchestrator.cleanup_timeout());
        if let Some(runtime) = self.runtime.get() {
            if let Some(pool) = &runtime.pool {
                coordinator.register(Arc::clone(pool) as _);
            }
            coordinator.register(Arc::clone(&runtime.memory) as _);
        }
        coordinator.shutdown(ShutdownReason::Requested).await;
    }
}

#[async_trait]
impl RecoveryExecutor for Orchestrator {
    async fn retry(&self, operation: &Operation) -> Result<Value, ExecError> {
        let runtime = self.runtime().await?;
        self.dispatch(runtime, operation).await
    }

    async fn direct(&self, operation: &Operation) -> Result<Value, ExecError> {
        self.call_direct(operation).await
    }

    async fn relieve_memory(&self) {
        if let Some(runtime) = self.runtime.get() {
            runtime.memory.relieve();
        }
    }

    async fn reset_substrate(&self) -> Result<(), ExecError> {
        info!("Resetting compute substrate");
        self.substrate.reset().await.map_err(ExecError::Substrate)
    }
}

/// 结果归一化：拆开传输信封，标量 / 数组包成 {"value": …}，空结果视为无效
pub fn normalize(raw: Value) -> Result<Value, ExecError> {
    match raw {
        Value::Null => Err(ExecError::InvalidResult("empty result".to_string())),
        Value::Object(mut map)
            if map.get("success").map_or(false, Value::is_boolean)
                && (map.contains_key("result") || map.contains_key("error")) =>
        {
            if map.get("success").and_then(Value::as_bool) == Some(true) {
                normalize(map.remove("result").unwrap_or(Value::Null))
            } else {
                let message = map
                    .get("error")
                    .and_then(|e| e.get("message").and_then(Value::as_str).or_else(|| e.as_str()))
                    .unwrap_or("unknown error")
                    .to_string();
                Err(ExecError::Substrate(SubstrateError::new(message)))
            }
        }
        Value::Object(map) => Ok(Value::Object(map)),
        other => Ok(json!({ "value": other })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OrchestratorBuilder;
    use crate::substrate::MockSubstrate;
    use std::time::Duration;

    fn build(substrate: Arc<MockSubstrate>, tweak: impl FnOnce(&mut AppConfig)) -> Arc<Orchestrator> {
        let mut config = AppConfig::default();
        config.pool.min_workers = 1;
        config.pool.max_workers = 2;
        config.recovery.backoff_base_ms = 1;
        tweak(&mut config);
        OrchestratorBuilder::new(config)
            .with_substrate(substrate)
            .build()
            .unwrap()
    }

    fn box_params() -> Value {
        json!({"width": 10.0, "height": 20.0, "depth": 30.0})
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(json!({"id": "a"})).unwrap(), json!({"id": "a"}));
        assert_eq!(normalize(json!(3)).unwrap(), json!({"value": 3}));
        assert_eq!(normalize(json!([1, 2])).unwrap(), json!({"value": [1, 2]}));
        assert_eq!(
            normalize(json!({"id": 1, "success": true, "result": {"id": "b"}})).unwrap(),
            json!({"id": "b"})
        );
        assert_eq!(
            normalize(json!({"success": true, "result": 7})).unwrap(),
            json!({"value": 7})
        );
        let err = normalize(json!({"success": false, "error": {"message": "bad face"}})).unwrap_err();
        assert!(err.to_string().contains("bad face"));
        assert!(matches!(normalize(Value::Null), Err(ExecError::InvalidResult(_))));
        // 普通对象里恰好有 success 字段但不是信封
        assert_eq!(
            normalize(json!({"success": "yes"})).unwrap(),
            json!({"success": "yes"})
        );
    }

    #[tokio::test]
    async fn test_invoke_success_then_cache_hit() {
        let substrate = Arc::new(MockSubstrate::new());
        let orch = build(substrate.clone(), |_| {});

        let first = orch.invoke("MAKE_BOX", box_params()).await;
        assert!(first.success);
        assert!(!first.performance.cache_hit);
        assert_eq!(first.data.as_ref().unwrap()["operation"], "MAKE_BOX");

        let second = orch.invoke("MAKE_BOX", box_params()).await;
        assert!(second.success);
        assert!(second.performance.cache_hit);
        assert_eq!(second.data, first.data);
        assert_ne!(second.request_id, first.request_id);
        assert_eq!(substrate.invoke_calls(), 1);

        let shape_id = first.data.unwrap()["id"].as_str().unwrap().to_string();
        assert!(orch.shape(&shape_id).await.is_some());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation_failure_never_reaches_substrate() {
        let substrate = Arc::new(MockSubstrate::new());
        let orch = build(substrate.clone(), |_| {});

        let result = orch.invoke("MAKE_BOX", json!({"width": 1.0})).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.category, ErrorCategory::Validation);
        assert!(!error.recoverable);
        assert_eq!(substrate.total_calls(), 0);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_fix_negative_dimension() {
        let substrate = Arc::new(MockSubstrate::new());
        let orch = build(substrate.clone(), |_| {});

        let result = orch.invoke("MAKE_SPHERE", json!({"radius": -4.0})).await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["params"]["radius"], 4.0);
        assert!(result.warnings.iter().any(|w| w.starts_with("auto-fixed")));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovers_from_transient_network_error() {
        let substrate = Arc::new(MockSubstrate::new());
        substrate.fail_next(1, "network connection reset");
        let orch = build(substrate.clone(), |_| {});

        let result = orch.invoke("MAKE_BOX", box_params()).await;
        assert!(result.success);
        assert!(result.fallback_used);
        assert_eq!(result.retry_count, 1);
        assert_eq!(substrate.invoke_calls(), 2);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_substrate_failure_resets_and_retries() {
        let substrate = Arc::new(MockSubstrate::new());
        substrate.fail_next(1, "wasm trap: unreachable");
        let orch = build(substrate.clone(), |_| {});

        let result = orch.invoke("MAKE_CYLINDER", json!({"radius": 1.0, "height": 2.0})).await;
        assert!(result.success);
        assert_eq!(substrate.reset_calls(), 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_without_pool_calls_substrate_directly() {
        let substrate = Arc::new(MockSubstrate::new());
        let orch = build(substrate.clone(), |c| c.orchestrator.use_worker_pool = false);

        let result = orch.invoke("MAKE_BOX", box_params()).await;
        assert!(result.success);
        assert!(orch.pool().is_none());
        assert!(orch.stats().pool.is_none());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_unavailable_substrate_fails_initialization() {
        let substrate = Arc::new(MockSubstrate::new().unavailable());
        let orch = build(substrate.clone(), |_| {});

        assert!(matches!(orch.initialize().await, Err(ExecError::Initialization(_))));
        let result = orch.invoke("MAKE_BOX", box_params()).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().category, ErrorCategory::ComputeSubstrate);
        assert_eq!(substrate.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_tessellate_caches_lod() {
        let substrate = Arc::new(MockSubstrate::new().with_mesh_triangles(2000));
        let orch = build(substrate.clone(), |_| {});

        let first = orch.tessellate("box_1", 0.1).await;
        assert!(first.success);
        let output = first.data.unwrap();
        assert_eq!(output.lod, LodLevel::High);
        assert_eq!(output.mesh.triangle_count(), 2000);

        let second = orch.tessellate("box_1", 0.1).await;
        assert!(second.performance.cache_hit);
        assert_eq!(substrate.tessellate_calls(), 1);

        orch.memory()
            .unwrap()
            .force_pressure(Some(crate::memory::MemoryPressure::High));
        let third = orch.tessellate("box_1", 0.1).await;
        let output = third.data.unwrap();
        assert_eq!(output.lod, LodLevel::Low);
        assert_eq!(output.mesh.triangle_count(), 500);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_tessellate_failure_reported() {
        let substrate = Arc::new(MockSubstrate::new());
        substrate.fail_always("Invalid shape handle");
        let orch = build(substrate, |_| {});

        let result = orch.tessellate("missing", 0.1).await;
        assert!(!result.success);
        assert!(result.data.is_none());
        assert_eq!(result.error.unwrap().category, ErrorCategory::Validation);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_operation_timeout_is_reported() {
        let substrate = Arc::new(MockSubstrate::new().with_delay(Duration::from_millis(200)));
        let orch = build(substrate, |c| {
            c.orchestrator.operation_timeout_ms = 20;
            c.recovery.max_retries_per_strategy = 0;
        });

        let result = orch.invoke("MAKE_BOX", box_params()).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().category, ErrorCategory::Timeout);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let orch = build(Arc::new(MockSubstrate::new()), |_| {});
        assert!(orch.invoke("MAKE_BOX", box_params()).await.success);
        orch.shutdown().await;

        let result = orch.invoke("MAKE_BOX", box_params()).await;
        assert!(!result.success);
        assert!(orch.stats().pool.unwrap().total_workers == 0);
    }
}
