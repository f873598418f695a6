//! 执行层错误类型
//!
//! 与 ErrorRecoverySystem 配合：typed 错误按变体直接归类，底座抛出的不透明错误按消息关键词归类。

use thiserror::Error;

use crate::recovery::ErrorCategory;
use crate::substrate::{SubstrateError, WorkerError};

/// 一次 invoke 过程中可能出现的错误（校验、超时、worker、底座、熔断等）
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Operation '{operation}' timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Timed out after {waited_ms} ms waiting for a free worker")]
    QueueTimeout { waited_ms: u64 },

    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Circuit breaker open for operation '{0}'")]
    CircuitOpen(String),

    /// 初始化阶段的致命错误（如探测不到可用的计算底座），直接中止启动
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Invalid result: {0}")]
    InvalidResult(String),

    #[error("Service is shutting down")]
    Shutdown,
}

impl ExecError {
    /// 能从变体直接确定的错误类别；None 表示需要按消息关键词归类
    pub fn category_hint(&self) -> Option<ErrorCategory> {
        match self {
            ExecError::Validation(_) => Some(ErrorCategory::Validation),
            ExecError::Timeout { .. } | ExecError::QueueTimeout { .. } => {
                Some(ErrorCategory::Timeout)
            }
            ExecError::CircuitOpen(_) | ExecError::Initialization(_) => {
                Some(ErrorCategory::ComputeSubstrate)
            }
            ExecError::InvalidResult(_) => Some(ErrorCategory::Geometry),
            ExecError::Shutdown => Some(ErrorCategory::Worker),
            ExecError::Worker(WorkerError::Failed { .. }) => None,
            ExecError::Worker(_) => Some(ErrorCategory::Worker),
            ExecError::Substrate(_) => None,
        }
    }

    /// 熔断或关闭导致的失败不应再进入恢复链
    pub fn is_fail_fast(&self) -> bool {
        matches!(self, ExecError::CircuitOpen(_) | ExecError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_hint() {
        let err = ExecError::Validation("radius missing".into());
        assert_eq!(err.category_hint(), Some(ErrorCategory::Validation));

        let err = ExecError::QueueTimeout { waited_ms: 10 };
        assert_eq!(err.category_hint(), Some(ErrorCategory::Timeout));

        let err = ExecError::Substrate(SubstrateError::new("out of memory"));
        assert_eq!(err.category_hint(), None);
    }

    #[test]
    fn test_display_is_transparent_for_substrate() {
        let err: ExecError = SubstrateError::new("boolean failed").into();
        assert_eq!(err.to_string(), "boolean failed");
        assert!(!err.is_fail_fast());
        assert!(ExecError::CircuitOpen("X".into()).is_fail_fast());
    }
}
