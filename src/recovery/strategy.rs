//! 恢复策略
//!
//! 每个策略声明自己适用的错误类别与最多尝试次数；真正的重试动作通过 RecoveryExecutor 回到编排层执行。

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::ExecError;
use crate::recovery::{ClassifiedError, ErrorCategory};
use crate::substrate::{Operation, OperationKind};

/// 编排层提供的恢复动作
#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    /// 按正常路径重新执行（走 worker 池）
    async fn retry(&self, operation: &Operation) -> Result<Value, ExecError>;

    /// 绕过 worker 池直接调用底座
    async fn direct(&self, operation: &Operation) -> Result<Value, ExecError>;

    /// 立即释放缓存内存
    async fn relieve_memory(&self);

    async fn reset_substrate(&self) -> Result<(), ExecError>;
}

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, error: &ClassifiedError) -> bool;

    /// 策略自身的尝试上限（会被配置截断）
    fn max_retries(&self) -> u32;

    /// attempt 从 0 开始
    async fn attempt(
        &self,
        operation: &Operation,
        error: &ClassifiedError,
        executor: &dyn RecoveryExecutor,
        attempt: u32,
    ) -> Result<Value, ExecError>;
}

/// 内存类错误：先清理缓存再重试
pub struct MemoryReliefStrategy;

#[async_trait]
impl RecoveryStrategy for MemoryReliefStrategy {
    fn name(&self) -> &'static str {
        "memory_relief"
    }

    fn applies_to(&self, error: &ClassifiedError) -> bool {
        error.category == ErrorCategory::Memory
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn attempt(
        &self,
        operation: &Operation,
        _error: &ClassifiedError,
        executor: &dyn RecoveryExecutor,
        _attempt: u32,
    ) -> Result<Value, ExecError> {
        executor.relieve_memory().await;
        executor.retry(operation).await
    }
}

/// worker 故障或超时：绕过池直接执行
pub struct PoolBypassStrategy;

#[async_trait]
impl RecoveryStrategy for PoolBypassStrategy {
    fn name(&self) -> &'static str {
        "pool_bypass"
    }

    fn applies_to(&self, error: &ClassifiedError) -> bool {
        matches!(error.category, ErrorCategory::Worker | ErrorCategory::Timeout)
    }

    fn max_retries(&self) -> u32 {
        1
    }

    async fn attempt(
        &self,
        operation: &Operation,
        _error: &ClassifiedError,
        executor: &dyn RecoveryExecutor,
        _attempt: u32,
    ) -> Result<Value, ExecError> {
        executor.direct(operation).await
    }
}

/// 底座异常：重置底座后重试
pub struct SubstrateResetStrategy;

#[async_trait]
impl RecoveryStrategy for SubstrateResetStrategy {
    fn name(&self) -> &'static str {
        "substrate_reset"
    }

    fn applies_to(&self, error: &ClassifiedError) -> bool {
        error.category == ErrorCategory::ComputeSubstrate
    }

    fn max_retries(&self) -> u32 {
        1
    }

    async fn attempt(
        &self,
        operation: &Operation,
        _error: &ClassifiedError,
        executor: &dyn RecoveryExecutor,
        _attempt: u32,
    ) -> Result<Value, ExecError> {
        executor.reset_substrate().await?;
        executor.retry(operation).await
    }
}

/// 几何失败：逐次放宽精度类参数后重试
pub struct GeometryRelaxStrategy;

impl GeometryRelaxStrategy {
    pub const NAME: &'static str = "geometry_relax";

    /// 第 n 次尝试：弦差 ×2^(n+1)，圆角 / 倒角尺寸 ×0.5^(n+1)，布尔运算增大模糊容差
    pub fn relax(operation: &Operation, attempt: u32) -> Operation {
        let factor = 2f64.powi(attempt as i32 + 1);
        let mut params = match operation.params() {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let scale = |params: &mut Map<String, Value>, key: &str, by: f64| {
            if let Some(v) = params.get(key).and_then(Value::as_f64) {
                params.insert(key.to_string(), Value::from(v * by));
            }
        };
        match operation.kind() {
            OperationKind::Tessellate => {
                let tolerance = params
                    .get("tolerance")
                    .and_then(Value::as_f64)
                    .unwrap_or(crate::recovery::DEFAULT_TOLERANCE);
                params.insert("tolerance".to_string(), Value::from(tolerance * factor));
            }
            OperationKind::Fillet => scale(&mut params, "radius", 1.0 / factor),
            OperationKind::Chamfer => scale(&mut params, "distance", 1.0 / factor),
            OperationKind::BooleanUnion
            | OperationKind::BooleanSubtract
            | OperationKind::BooleanIntersect => {
                params.insert("fuzzyValue".to_string(), Value::from(1.0e-6 * factor));
            }
            _ => {}
        }
        operation.with_params(Value::Object(params))
    }
}

#[async_trait]
impl RecoveryStrategy for GeometryRelaxStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn applies_to(&self, error: &ClassifiedError) -> bool {
        error.category == ErrorCategory::Geometry
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn attempt(
        &self,
        operation: &Operation,
        _error: &ClassifiedError,
        executor: &dyn RecoveryExecutor,
        attempt: u32,
    ) -> Result<Value, ExecError> {
        let relaxed = Self::relax(operation, attempt);
        tracing::debug!(operation = operation.name(), params = %relaxed.params(), "Retrying with relaxed parameters");
        executor.retry(&relaxed).await
    }
}

/// 网络 / 超时 / 未知：原样重试
pub struct RetryWithBackoffStrategy;

#[async_trait]
impl RecoveryStrategy for RetryWithBackoffStrategy {
    fn name(&self) -> &'static str {
        "retry_with_backoff"
    }

    fn applies_to(&self, error: &ClassifiedError) -> bool {
        matches!(
            error.category,
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Unknown
        )
    }

    fn max_retries(&self) -> u32 {
        3
    }

    async fn attempt(
        &self,
        operation: &Operation,
        _error: &ClassifiedError,
        executor: &dyn RecoveryExecutor,
        _attempt: u32,
    ) -> Result<Value, ExecError> {
        executor.retry(operation).await
    }
}

/// 默认策略链（按此顺序尝试）
pub fn default_strategies() -> Vec<Box<dyn RecoveryStrategy>> {
    vec![
        Box::new(MemoryReliefStrategy),
        Box::new(PoolBypassStrategy),
        Box::new(SubstrateResetStrategy),
        Box::new(GeometryRelaxStrategy),
        Box::new(RetryWithBackoffStrategy),
    ]
}
