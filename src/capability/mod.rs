//! 能力探测与运行模式选择

pub mod probe;
pub mod selector;

pub use probe::{Capabilities, CapabilityProbe};
pub use selector::{
    ConfigSelector, OperatingConfig, OperatingMode, HIGH_TIER_MEMORY_MB, LOW_TIER_MEMORY_MB,
    MID_TIER_MEMORY_MB,
};
