//! 运行模式选择：能力快照 → OperatingConfig
//!
//! 纯函数，规则按顺序匹配（先匹配先生效），clamp 公式决定 worker 数上限，调用方依赖它避免超额订阅。

use serde::{Deserialize, Serialize};

use crate::capability::Capabilities;

/// 高 / 中 / 低三档内存预算（MB）
pub const HIGH_TIER_MEMORY_MB: u64 = 2048;
pub const MID_TIER_MEMORY_MB: u64 = 1024;
pub const LOW_TIER_MEMORY_MB: u64 = 512;

/// 运行模式；同时作为 worker 的模式标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// 共享内存 + 并行 + 隔离齐备
    FullConcurrent,
    /// 底座可用但不具备完整并发条件
    SingleThreadedSafe,
    Minimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperatingConfig {
    pub mode: OperatingMode,
    pub worker_count_hint: usize,
    pub memory_budget_mb: u64,
    pub use_threads: bool,
    pub enable_vector_ops: bool,
}

pub struct ConfigSelector;

impl ConfigSelector {
    pub fn select(caps: &Capabilities) -> OperatingConfig {
        let cores = caps.logical_cores.max(1);

        if caps.shared_memory_supported && caps.parallelism_supported && caps.isolation_enabled {
            return OperatingConfig {
                mode: OperatingMode::FullConcurrent,
                worker_count_hint: cores.min(8),
                memory_budget_mb: HIGH_TIER_MEMORY_MB,
                use_threads: true,
                enable_vector_ops: caps.vector_instructions_supported,
            };
        }

        if caps.compute_available {
            return OperatingConfig {
                mode: OperatingMode::SingleThreadedSafe,
                worker_count_hint: cores.min(4),
                memory_budget_mb: MID_TIER_MEMORY_MB,
                use_threads: false,
                enable_vector_ops: caps.vector_instructions_supported,
            };
        }

        OperatingConfig {
            mode: OperatingMode::Minimal,
            worker_count_hint: 2,
            memory_budget_mb: LOW_TIER_MEMORY_MB,
            use_threads: false,
            enable_vector_ops: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(shared: bool, parallel: bool, isolated: bool, compute: bool, cores: usize) -> Capabilities {
        Capabilities {
            parallelism_supported: parallel,
            shared_memory_supported: shared,
            vector_instructions_supported: true,
            estimated_memory_ceiling_mb: 4096,
            isolation_enabled: isolated,
            compute_available: compute,
            logical_cores: cores,
        }
    }

    #[test]
    fn test_full_concurrent_clamps_to_eight() {
        let config = ConfigSelector::select(&caps(true, true, true, true, 32));
        assert_eq!(config.mode, OperatingMode::FullConcurrent);
        assert_eq!(config.worker_count_hint, 8);
        assert_eq!(config.memory_budget_mb, HIGH_TIER_MEMORY_MB);
        assert!(config.use_threads);

        let config = ConfigSelector::select(&caps(true, true, true, true, 6));
        assert_eq!(config.worker_count_hint, 6);
    }

    #[test]
    fn test_missing_isolation_falls_to_single_threaded() {
        let config = ConfigSelector::select(&caps(true, true, false, true, 16));
        assert_eq!(config.mode, OperatingMode::SingleThreadedSafe);
        assert_eq!(config.worker_count_hint, 4);
        assert_eq!(config.memory_budget_mb, MID_TIER_MEMORY_MB);
        assert!(!config.use_threads);

        let config = ConfigSelector::select(&caps(false, true, true, true, 2));
        assert_eq!(config.worker_count_hint, 2);
    }

    #[test]
    fn test_minimal_mode() {
        let config = ConfigSelector::select(&caps(false, false, false, false, 64));
        assert_eq!(config.mode, OperatingMode::Minimal);
        assert_eq!(config.worker_count_hint, 2);
        assert_eq!(config.memory_budget_mb, LOW_TIER_MEMORY_MB);
        assert!(!config.enable_vector_ops);
    }

    #[test]
    fn test_deterministic() {
        let c = caps(true, false, true, true, 3);
        assert_eq!(ConfigSelector::select(&c), ConfigSelector::select(&c));
    }
}
