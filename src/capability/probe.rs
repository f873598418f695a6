//! 运行时能力探测
//!
//! 每项特性独立探测：线程并行、跨线程共享内存、SIMD 指令、可分配内存上限、进程隔离标志。
//! 任一探测失败只把该字段降级为 false / 默认值，从不向上抛错。结果在探测器生命周期内缓存，仅 invalidate() 可清除。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::CapabilitySection;
use crate::substrate::ComputeSubstrate;

/// 能力快照（不可变）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub parallelism_supported: bool,
    pub shared_memory_supported: bool,
    pub vector_instructions_supported: bool,
    pub estimated_memory_ceiling_mb: u64,
    pub isolation_enabled: bool,
    /// 计算底座是否可用
    pub compute_available: bool,
    pub logical_cores: usize,
}

impl Capabilities {
    /// 什么都不支持时的降级快照
    pub fn minimal() -> Self {
        Self {
            parallelism_supported: false,
            shared_memory_supported: false,
            vector_instructions_supported: false,
            estimated_memory_ceiling_mb: 0,
            isolation_enabled: false,
            compute_available: false,
            logical_cores: 1,
        }
    }
}

pub struct CapabilityProbe {
    settings: CapabilitySection,
    substrate: Option<Arc<dyn ComputeSubstrate>>,
    cached: Mutex<Option<Capabilities>>,
}

impl CapabilityProbe {
    pub fn new(settings: CapabilitySection) -> Self {
        Self {
            settings,
            substrate: None,
            cached: Mutex::new(None),
        }
    }

    /// 绑定计算底座，用于判断 compute_available
    pub fn with_substrate(mut self, substrate: Arc<dyn ComputeSubstrate>) -> Self {
        self.substrate = Some(substrate);
        self
    }

    /// 探测能力；首次调用后结果被缓存
    pub fn detect(&self) -> Capabilities {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(caps) = *cached {
            return caps;
        }

        let caps = Capabilities {
            parallelism_supported: probe_parallelism(),
            shared_memory_supported: probe_shared_memory(),
            vector_instructions_supported: probe_vector_instructions(),
            estimated_memory_ceiling_mb: probe_memory_ceiling(
                self.settings.memory_probe_step_mb,
                self.settings.memory_probe_max_mb,
            ),
            isolation_enabled: probe_isolation(&self.settings.isolation_env),
            compute_available: self
                .substrate
                .as_ref()
                .map_or(true, |s| s.is_available()),
            logical_cores: logical_cores(),
        };
        tracing::info!(?caps, "Capabilities detected");
        *cached = Some(caps);
        caps
    }

    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// 能在新线程上执行一个计算单元，且有多于一个逻辑核
fn probe_parallelism() -> bool {
    let spawned = std::thread::Builder::new()
        .name("geoexec-probe".into())
        .spawn(|| (1u64..=16).sum::<u64>())
        .ok()
        .and_then(|handle| handle.join().ok());
    spawned == Some(136) && logical_cores() > 1
}

/// 跨线程写入的原子值在 join 后可见
fn probe_shared_memory() -> bool {
    let shared = Arc::new(AtomicU64::new(0));
    let writer = Arc::clone(&shared);
    let joined = std::thread::Builder::new()
        .spawn(move || writer.store(42, Ordering::Release))
        .ok()
        .map(|handle| handle.join().is_ok())
        .unwrap_or(false);
    joined && shared.load(Ordering::Acquire) == 42
}

fn probe_vector_instructions() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("sse4.1")
    }
    #[cfg(target_arch = "aarch64")]
    {
        std::arch::is_aarch64_feature_detected!("neon")
    }
    #[cfg(target_arch = "wasm32")]
    {
        cfg!(target_feature = "simd128")
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "wasm32")))]
    {
        false
    }
}

/// 逐步加倍尝试预留内存，记录最后一次成功的大小（MB）；每次预留立即释放
fn probe_memory_ceiling(step_mb: u64, max_mb: u64) -> u64 {
    let step_mb = step_mb.max(1);
    let mut size_mb = step_mb;
    let mut last_ok = 0;
    while size_mb <= max_mb {
        let mut buffer: Vec<u8> = Vec::new();
        let bytes = usize::try_from(size_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX);
        if buffer.try_reserve_exact(bytes).is_err() {
            break;
        }
        drop(buffer);
        last_ok = size_mb;
        size_mb = size_mb.saturating_mul(2);
    }
    last_ok
}

fn probe_isolation(env_name: &str) -> bool {
    std::env::var(env_name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MockSubstrate;

    #[test]
    fn test_detect_is_memoized() {
        let probe = CapabilityProbe::new(CapabilitySection::default());
        let a = probe.detect();
        let b = probe.detect();
        assert_eq!(a, b);
        assert!(a.logical_cores >= 1);
        assert!(a.compute_available);
    }

    #[test]
    fn test_unavailable_substrate() {
        let probe = CapabilityProbe::new(CapabilitySection::default())
            .with_substrate(Arc::new(MockSubstrate::new().unavailable()));
        assert!(!probe.detect().compute_available);
    }

    #[test]
    fn test_memory_ceiling_respects_max() {
        let ceiling = probe_memory_ceiling(1, 8);
        assert!(ceiling <= 8);
        assert!(ceiling >= 1);
        assert_eq!(probe_memory_ceiling(16, 8), 0);
    }

    #[test]
    fn test_isolation_flag() {
        std::env::set_var("GEOEXEC_TEST_ISOLATION_FLAG", "true");
        assert!(probe_isolation("GEOEXEC_TEST_ISOLATION_FLAG"));
        std::env::set_var("GEOEXEC_TEST_ISOLATION_FLAG", "0");
        assert!(!probe_isolation("GEOEXEC_TEST_ISOLATION_FLAG"));
        assert!(!probe_isolation("GEOEXEC_TEST_ISOLATION_FLAG_MISSING"));
    }

    #[test]
    fn test_invalidate() {
        let probe = CapabilityProbe::new(CapabilitySection::default());
        probe.detect();
        probe.invalidate();
        assert!(probe.cached.lock().unwrap().is_none());
    }
}
