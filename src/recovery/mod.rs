//! 错误恢复：执行前校验、错误归类、按操作熔断与恢复策略链

pub mod error;
pub mod strategy;
pub mod system;
pub mod validation;

pub use error::{classify, ClassifiedError, ErrorCategory, ErrorContext, Severity};
pub use strategy::{
    default_strategies, GeometryRelaxStrategy, MemoryReliefStrategy, PoolBypassStrategy,
    RecoveryExecutor, RecoveryStrategy, RetryWithBackoffStrategy, SubstrateResetStrategy,
};
pub use system::{ErrorRecoverySystem, RecoveryOutcome, RecoveryStats};
pub use validation::{
    GeometricBoundsRule, MemoryPressureRule, RequiredFieldsRule, TessellationToleranceRule,
    ValidationContext, ValidationReport, ValidationRule, Validator, DEFAULT_TOLERANCE,
    MAX_DIMENSION,
};
