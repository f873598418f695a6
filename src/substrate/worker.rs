//! Worker 抽象：init（WorkerFactory::spawn）/ invoke / health / terminate
//!
//! 每个 worker 是隔离的执行上下文，池只通过 WorkerHandle 与其交互。
//! SubstrateWorker 是进程内实现：多个 worker 共享同一个计算底座，回复统一走传输信封。

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::capability::OperatingMode;
use crate::core::WorkerId;
use crate::substrate::{ComputeSubstrate, Operation, OperationKind, WorkerResponse};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// 底座执行失败，消息原样保留以便归类
    #[error("{message}")]
    Failed {
        code: Option<String>,
        message: String,
    },

    #[error("Worker {0} terminated")]
    Terminated(WorkerId),

    #[error("Health probe failed: {0}")]
    Health(String),
}

/// 健康探针结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerHealth {
    pub memory_used_mb: u64,
}

#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn id(&self) -> WorkerId;

    async fn invoke(&self, operation: &Operation) -> Result<Value, WorkerError>;

    /// 轻量健康探针
    async fn health(&self) -> Result<WorkerHealth, WorkerError>;

    async fn terminate(&self);
}

/// Worker 工厂：spawn 即 worker 的初始化步骤
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn spawn(
        &self,
        id: WorkerId,
        mode: OperatingMode,
    ) -> Result<Arc<dyn WorkerHandle>, WorkerError>;
}

/// 进程内 worker
pub struct SubstrateWorker {
    id: WorkerId,
    mode: OperatingMode,
    substrate: Arc<dyn ComputeSubstrate>,
    terminated: AtomicBool,
    next_message_id: AtomicU64,
}

impl SubstrateWorker {
    pub fn new(id: WorkerId, mode: OperatingMode, substrate: Arc<dyn ComputeSubstrate>) -> Self {
        Self {
            id,
            mode,
            substrate,
            terminated: AtomicBool::new(false),
            next_message_id: AtomicU64::new(1),
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    async fn run(&self, operation: &Operation, message_id: u64) -> WorkerResponse {
        let outcome = match operation.kind() {
            OperationKind::Tessellate => {
                let shape_id = operation.param_str("shapeId").unwrap_or_default();
                let tolerance = operation.param_f64("tolerance").unwrap_or(0.1);
                self.substrate
                    .tessellate(shape_id, tolerance)
                    .await
                    .and_then(|mesh| {
                        serde_json::to_value(mesh).map_err(|e| {
                            crate::substrate::SubstrateError::new(format!(
                                "Failed to encode mesh: {}",
                                e
                            ))
                        })
                    })
            }
            _ => {
                self.substrate
                    .invoke(operation.name(), operation.params())
                    .await
            }
        };

        match outcome {
            Ok(result) => WorkerResponse::ok(message_id, result),
            Err(e) => WorkerResponse::err(message_id, &e),
        }
    }
}

#[async_trait]
impl WorkerHandle for SubstrateWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn invoke(&self, operation: &Operation) -> Result<Value, WorkerError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(WorkerError::Terminated(self.id));
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        self.run(operation, message_id).await.into_result()
    }

    async fn health(&self) -> Result<WorkerHealth, WorkerError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(WorkerError::Terminated(self.id));
        }
        if !self.substrate.is_available() {
            return Err(WorkerError::Health("compute substrate unavailable".to_string()));
        }
        Ok(WorkerHealth {
            memory_used_mb: self.substrate.memory_usage_mb().unwrap_or(0),
        })
    }

    async fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            tracing::debug!(worker = %self.id, "Worker terminated");
        }
    }
}

/// 生产 SubstrateWorker 的工厂，记录累计创建数量
pub struct SubstrateWorkerFactory {
    substrate: Arc<dyn ComputeSubstrate>,
    spawned: AtomicUsize,
}

impl SubstrateWorkerFactory {
    pub fn new(substrate: Arc<dyn ComputeSubstrate>) -> Self {
        Self {
            substrate,
            spawned: AtomicUsize::new(0),
        }
    }

    /// 累计创建的 worker 数
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerFactory for SubstrateWorkerFactory {
    async fn spawn(
        &self,
        id: WorkerId,
        mode: OperatingMode,
    ) -> Result<Arc<dyn WorkerHandle>, WorkerError> {
        if !self.substrate.is_available() {
            return Err(WorkerError::Spawn("compute substrate unavailable".to_string()));
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(worker = %id, ?mode, "Spawned worker");
        Ok(Arc::new(SubstrateWorker::new(id, mode, Arc::clone(&self.substrate))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MockSubstrate;
    use serde_json::json;

    #[tokio::test]
    async fn test_worker_routes_tessellate() {
        let substrate = Arc::new(MockSubstrate::new().with_mesh_triangles(20));
        let worker = SubstrateWorker::new(
            WorkerId::new(),
            OperatingMode::SingleThreadedSafe,
            substrate.clone(),
        );

        let op = Operation::new("TESSELLATE", json!({"shapeId": "s1", "tolerance": 0.5}));
        let value = worker.invoke(&op).await.unwrap();
        let mesh: crate::substrate::Mesh = serde_json::from_value(value).unwrap();
        assert_eq!(mesh.triangle_count(), 20);
        assert_eq!(substrate.tessellate_calls(), 1);
        assert_eq!(substrate.invoke_calls(), 0);
    }

    #[tokio::test]
    async fn test_worker_propagates_failure_message() {
        let substrate = Arc::new(MockSubstrate::new());
        substrate.fail_next(1, "boolean operation failed: degenerate face");
        let worker = SubstrateWorker::new(WorkerId::new(), OperatingMode::Minimal, substrate);

        let op = Operation::new("BOOLEAN_UNION", json!({"base": "a", "tool": "b"}));
        let err = worker.invoke(&op).await.unwrap_err();
        assert!(err.to_string().contains("degenerate face"));
    }

    #[tokio::test]
    async fn test_terminated_worker_rejects() {
        let worker = SubstrateWorker::new(
            WorkerId::new(),
            OperatingMode::Minimal,
            Arc::new(MockSubstrate::new()),
        );
        worker.terminate().await;
        let op = Operation::new("MAKE_SPHERE", json!({"radius": 1.0}));
        assert!(matches!(worker.invoke(&op).await, Err(WorkerError::Terminated(_))));
        assert!(worker.health().await.is_err());
    }

    #[tokio::test]
    async fn test_factory_counts_spawns() {
        let factory = SubstrateWorkerFactory::new(Arc::new(MockSubstrate::new()));
        factory.spawn(WorkerId::new(), OperatingMode::Minimal).await.unwrap();
        factory.spawn(WorkerId::new(), OperatingMode::Minimal).await.unwrap();
        assert_eq!(factory.spawned(), 2);
    }
}
