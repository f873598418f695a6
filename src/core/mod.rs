//! 核心层：错误类型、熔断器、标识、优雅关闭、编排器与构建器

pub mod builder;
pub mod circuit_breaker;
pub mod error;
pub mod ids;
pub mod orchestrator;
pub mod shutdown;

pub use builder::OrchestratorBuilder;
pub use circuit_breaker::{Admission, BreakerState, CircuitBreaker};
pub use error::ExecError;
pub use ids::{TaskId, WorkerId};
pub use orchestrator::{
    normalize, OperationError, OperationResult, Orchestrator, OrchestratorStats, Performance,
    TessellationOutput,
};
pub use shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
