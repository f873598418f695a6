//! 内存压力等级

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl MemoryPressure {
    /// 按已用 / 预算比例分档：60% / 75% / 90%
    pub fn from_usage(used_bytes: u64, budget_bytes: u64) -> Self {
        if budget_bytes == 0 {
            return if used_bytes == 0 {
                MemoryPressure::Low
            } else {
                MemoryPressure::Critical
            };
        }
        let ratio = used_bytes as f64 / budget_bytes as f64;
        if ratio >= 0.9 {
            MemoryPressure::Critical
        } else if ratio >= 0.75 {
            MemoryPressure::High
        } else if ratio >= 0.6 {
            MemoryPressure::Medium
        } else {
            MemoryPressure::Low
        }
    }

    /// high 及以上触发激进维护
    pub fn is_elevated(self) -> bool {
        self >= MemoryPressure::High
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryPressure::Low => "low",
            MemoryPressure::Medium => "medium",
            MemoryPressure::High => "high",
            MemoryPressure::Critical => "critical",
        }
    }
}
