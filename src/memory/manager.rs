//! MemoryManager：三级缓存 + 内存压力 + 定期维护
//!
//! - shapes：以形体 id 为键，保存底座返回的形体句柄
//! - meshes：以 "{shape_id}@{tolerance}" 为键，保存 MeshLod
//! - results：以操作缓存键为键，保存归一化后的操作结果
//!
//! 每一级各持一把锁。压力 = (缓存总字节 + 最近一次采样的底座用量) / 运行预算，
//! 采样在每次维护开始时进行；可被 force_pressure 覆盖。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::core::ShutdownCleanup;
use crate::memory::{BoundedCache, CacheStats, LodLevel, MemoryPressure, MeshLod};
use crate::substrate::{ComputeSubstrate, Mesh};

const MB: u64 = 1024 * 1024;

/// 一次维护的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// 维护开始时的压力
    pub pressure: MemoryPressure,
    pub evicted: usize,
    pub degraded_meshes: usize,
    pub aggressive: bool,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub shapes: CacheStats,
    pub meshes: CacheStats,
    pub results: CacheStats,
    pub total_bytes: u64,
    /// 最近一次采样到的底座内存
    pub sampled_bytes: u64,
    pub budget_bytes: u64,
    pub pressure: MemoryPressure,
    pub maintenance_runs: u64,
}

pub struct MemoryManager {
    config: CacheConfig,
    budget_bytes: AtomicU64,
    usage_source: Option<Arc<dyn ComputeSubstrate>>,
    sampled_bytes: AtomicU64,
    shapes: BoundedCache<Value>,
    meshes: BoundedCache<MeshLod>,
    results: BoundedCache<Value>,
    forced_pressure: Mutex<Option<MemoryPressure>>,
    last_maintenance: Mutex<Option<Instant>>,
    maintenance_runs: AtomicU64,
}

impl MemoryManager {
    pub fn new(config: CacheConfig, budget_mb: u64) -> Self {
        let shapes = BoundedCache::new(
            "shapes",
            config.shape_max_entries,
            (config.shape_max_mb * MB) as usize,
            config.cleanup_threshold,
            config.max_evictions_per_pass,
        );
        let meshes = BoundedCache::new(
            "meshes",
            config.mesh_max_entries,
            (config.mesh_max_mb * MB) as usize,
            config.cleanup_threshold,
            config.max_evictions_per_pass,
        );
        let results = BoundedCache::new(
            "results",
            config.result_max_entries,
            (config.result_max_mb * MB) as usize,
            config.cleanup_threshold,
            config.max_evictions_per_pass,
        );
        Self {
            config,
            budget_bytes: AtomicU64::new(budget_mb * MB),
            usage_source: None,
            sampled_bytes: AtomicU64::new(0),
            shapes,
            meshes,
            results,
            forced_pressure: Mutex::new(None),
            last_maintenance: Mutex::new(None),
            maintenance_runs: AtomicU64::new(0),
        }
    }

    /// 底座上报的内存用量计入压力
    pub fn with_usage_source(mut self, source: Arc<dyn ComputeSubstrate>) -> Self {
        self.usage_source = Some(source);
        self
    }

    /// 读取底座当前用量并保存；底座不上报时保持上次的值
    pub fn sample_usage(&self) -> u64 {
        let reported = self
            .usage_source
            .as_ref()
            .and_then(|source| source.memory_usage_mb());
        if let Some(mb) = reported {
            self.sampled_bytes.store(mb * MB, Ordering::Relaxed);
        }
        self.sampled_bytes.load(Ordering::Relaxed)
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes.load(Ordering::Relaxed)
    }

    pub fn cache_shape(&self, shape_id: &str, shape: Value, priority: u32) -> bool {
        self.shapes.insert(shape_id, shape, priority).is_inserted()
    }

    pub fn get_shape(&self, shape_id: &str) -> Option<Value> {
        self.shapes.get(shape_id)
    }

    pub fn cache_result(&self, key: &str, result: Value, priority: u32) -> bool {
        self.results.insert(key, result, priority).is_inserted()
    }

    pub fn get_result(&self, key: &str) -> Option<Value> {
        self.results.get(key)
    }

    /// 按配置的级数与三角形阈值生成 LOD（不入缓存）
    pub fn build_lod(&self, mesh: Mesh) -> MeshLod {
        MeshLod::build(mesh, self.config.lod_levels.max(1), self.config.lod_triangle_threshold)
    }

    /// 生成 LOD 后入缓存；返回 LOD 与是否入缓存（超出容量时被拒绝，调用方仍可直接使用 LOD）
    pub fn cache_mesh(&self, key: &str, mesh: Mesh, priority: u32) -> (MeshLod, bool) {
        let lod = self.build_lod(mesh);
        let inserted = self.meshes.insert(key, lod.clone(), priority).is_inserted();
        if !inserted {
            warn!(key, "Mesh cache rejected entry");
        }
        (lod, inserted)
    }

    /// 按当前压力在不高于 requested 的级别中选取网格
    pub fn get_mesh(&self, key: &str, requested: LodLevel) -> Option<(LodLevel, Mesh)> {
        let lod = self.meshes.get(key)?;
        let pressure = self.pressure();
        let (level, mesh) = lod.select(requested, pressure);
        debug!(key, ?level, pressure = pressure.as_str(), "Mesh served from cache");
        Some((level, mesh.clone()))
    }

    pub fn total_bytes(&self) -> u64 {
        (self.shapes.total_bytes() + self.meshes.total_bytes() + self.results.total_bytes()) as u64
    }

    pub fn pressure(&self) -> MemoryPressure {
        let forced = *self.forced_pressure.lock().unwrap_or_else(|e| e.into_inner());
        forced.unwrap_or_else(|| {
            let used = self.total_bytes() + self.sampled_bytes.load(Ordering::Relaxed);
            MemoryPressure::from_usage(used, self.budget_bytes())
        })
    }

    /// 强制压力等级（None 恢复按用量计算）
    pub fn force_pressure(&self, pressure: Option<MemoryPressure>) {
        *self.forced_pressure.lock().unwrap_or_else(|e| e.into_inner()) = pressure;
        if let Some(p) = pressure {
            info!(pressure = p.as_str(), "Memory pressure forced");
        }
    }

    /// 去抖维护：距上次维护不足 maintenance_debounce 时跳过并返回 None
    pub fn maintain(&self) -> Option<MaintenanceReport> {
        {
            let mut last = self.last_maintenance.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.saturating_duration_since(prev) < self.config.maintenance_debounce() {
                    return None;
                }
            }
            *last = Some(now);
        }
        Some(self.run_maintenance(false))
    }

    /// 立即按激进策略维护（不去抖、不看压力），用于内存类错误恢复
    pub fn relieve(&self) -> MaintenanceReport {
        *self.last_maintenance.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.run_maintenance(true)
    }

    fn run_maintenance(&self, force_aggressive: bool) -> MaintenanceReport {
        self.sample_usage();
        let pressure = self.pressure();
        let bytes_before = self.total_bytes();
        let aggressive = force_aggressive || pressure.is_elevated();
        let max_age = if aggressive {
            self.config.aggressive_max_age()
        } else {
            self.config.normal_max_age()
        };

        let mut evicted = self.shapes.evict_older_than(max_age)
            + self.meshes.evict_older_than(max_age)
            + self.results.evict_older_than(max_age);
        if aggressive {
            evicted += self.shrink_full_tiers();
        }
        let degraded_meshes = if aggressive {
            self.meshes.update_all(MeshLod::degrade)
        } else {
            0
        };

        self.maintenance_runs.fetch_add(1, Ordering::Relaxed);
        let report = MaintenanceReport {
            pressure,
            evicted,
            degraded_meshes,
            aggressive,
            bytes_before,
            bytes_after: self.total_bytes(),
        };
        if evicted > 0 || degraded_meshes > 0 {
            info!(
                pressure = pressure.as_str(),
                evicted,
                degraded_meshes,
                bytes_after = report.bytes_after,
                "Memory maintenance"
            );
        } else {
            debug!(pressure = pressure.as_str(), "Memory maintenance: nothing to do");
        }
        report
    }

    /// 占用超过激进阈值的缓存层按评分收缩到常规阈值
    fn shrink_full_tiers(&self) -> usize {
        let high = self.config.aggressive_cleanup_threshold;
        let target = self.config.cleanup_threshold;
        let mut evicted = 0;
        if self.shapes.utilization() > high {
            evicted += self.shapes.shrink_to(target);
        }
        if self.meshes.utilization() > high {
            evicted += self.meshes.shrink_to(target);
        }
        if self.results.utilization() > high {
            evicted += self.results.shrink_to(target);
        }
        evicted
    }

    /// 周期维护循环，随 token 取消
    pub fn start_maintenance(self: &Arc<Self>, token: CancellationToken) {
        let manager = Arc::clone(self);
        let period = self.config.maintenance_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.maintain();
                    }
                }
            }
            debug!("Memory maintenance loop stopped");
        });
    }

    pub fn clear(&self) -> usize {
        self.shapes.clear() + self.meshes.clear() + self.results.clear()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            shapes: self.shapes.stats(),
            meshes: self.meshes.stats(),
            results: self.results.stats(),
            total_bytes: self.total_bytes(),
            sampled_bytes: self.sampled_bytes.load(Ordering::Relaxed),
            budget_bytes: self.budget_bytes(),
            pressure: self.pressure(),
            maintenance_runs: self.maintenance_runs.load(Ordering::Relaxed),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for MemoryManager {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let cleared = self.clear();
        info!(cleared, "Caches cleared");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MemoryManager"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{sample_mesh, MockSubstrate};
    use serde_json::json;
    use std::time::Duration;

    fn manager() -> MemoryManager {
        MemoryManager::new(CacheConfig::default(), 1024)
    }

    #[test]
    fn test_result_cache_roundtrip_counts_hit() {
        let m = manager();
        assert!(m.get_result("MAKE_BOX:abc").is_none());
        m.cache_result("MAKE_BOX:abc", json!({"id": "box_1"}), 5);
        assert_eq!(m.get_result("MAKE_BOX:abc").unwrap()["id"], "box_1");
        let stats = m.stats();
        assert_eq!(stats.results.hits, 1);
        assert_eq!(stats.results.misses, 1);
    }

    #[test]
    fn test_pressure_from_budget() {
        let m = MemoryManager::new(CacheConfig::default(), 1);
        assert_eq!(m.pressure(), MemoryPressure::Low);
        // 约 0.95 MB 的网格
        let mesh = sample_mesh(20_000);
        assert!(mesh.size_bytes() as u64 > MB * 9 / 10);
        m.cache_mesh("s@0.1", mesh, 5);
        assert_eq!(m.pressure(), MemoryPressure::Critical);
    }

    #[test]
    fn test_pressure_includes_sampled_substrate_usage() {
        let substrate = Arc::new(MockSubstrate::new().with_memory_mb(700));
        let m = MemoryManager::new(CacheConfig::default(), 1024).with_usage_source(substrate.clone());
        // 未采样前只看缓存
        assert_eq!(m.pressure(), MemoryPressure::Low);

        assert_eq!(m.sample_usage(), 700 * MB);
        assert_eq!(m.pressure(), MemoryPressure::Medium);

        substrate.set_memory_mb(950);
        let report = m.maintain().unwrap();
        assert_eq!(report.pressure, MemoryPressure::Critical);
        assert!(report.aggressive);
        assert_eq!(m.stats().sampled_bytes, 950 * MB);

        substrate.set_memory_mb(100);
        m.sample_usage();
        assert_eq!(m.pressure(), MemoryPressure::Low);
    }

    #[test]
    fn test_mesh_served_by_pressure() {
        let m = manager();
        m.cache_mesh("s@0.1", sample_mesh(2000), 5);

        let (level, mesh) = m.get_mesh("s@0.1", LodLevel::High).unwrap();
        assert_eq!(level, LodLevel::High);
        assert_eq!(mesh.triangle_count(), 2000);

        m.force_pressure(Some(MemoryPressure::Critical));
        let (level, mesh) = m.get_mesh("s@0.1", LodLevel::High).unwrap();
        assert_eq!(level, LodLevel::Bounds);
        assert_eq!(mesh.vertex_count(), 8);

        m.force_pressure(None);
        assert_eq!(m.pressure(), MemoryPressure::Low);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_is_debounced() {
        let m = manager();
        assert!(m.maintain().is_some());
        assert!(m.maintain().is_none());
        tokio::time::advance(Duration::from_millis(5_001)).await;
        assert!(m.maintain().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggressive_maintenance_under_critical_pressure() {
        let m = manager();
        m.cache_result("old", json!({"v": 1}), 5);
        m.cache_result("pinned", json!({"v": 2}), 10);
        m.cache_mesh("s@0.1", sample_mesh(2000), 5);
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        m.cache_mesh("t@0.1", sample_mesh(2000), 5);

        m.force_pressure(Some(MemoryPressure::Critical));
        let report = m.maintain().unwrap();
        assert!(report.aggressive);
        assert_eq!(report.evicted, 2);
        assert_eq!(report.degraded_meshes, 1);

        assert!(m.get_result("pinned").is_some());
        assert!(m.get_result("old").is_none());
        m.force_pressure(None);
        let (level, _) = m.get_mesh("t@0.1", LodLevel::High).unwrap();
        assert_eq!(level, LodLevel::Medium);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_maintenance_keeps_recent_entries() {
        let m = manager();
        m.cache_result("a", json!({"v": 1}), 5);
        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        let report = m.maintain().unwrap();
        assert!(!report.aggressive);
        assert_eq!(report.evicted, 0);

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        let report = m.maintain().unwrap();
        assert_eq!(report.evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relieve_ignores_pressure_and_debounce() {
        let m = manager();
        m.cache_mesh("s@0.1", sample_mesh(2000), 5);
        assert!(m.maintain().is_some());
        let report = m.relieve();
        assert_eq!(report.pressure, MemoryPressure::Low);
        assert!(report.aggressive);
        assert_eq!(report.degraded_meshes, 1);
        assert!(report.bytes_after < report.bytes_before);
    }

    #[tokio::test]
    async fn test_aggressive_maintenance_shrinks_full_tier() {
        // 插入时不做软淘汰，缓存一直填到硬上限
        let config = CacheConfig {
            result_max_entries: 10,
            max_evictions_per_pass: 0,
            ..CacheConfig::default()
        };
        let m = MemoryManager::new(config, 1024);
        for i in 0..10 {
            assert!(m.cache_result(&format!("k{}", i), json!({"v": i}), 5));
        }
        assert!(!m.cache_result("k10", json!({"v": 10}), 5));

        let report = m.maintain().unwrap();
        assert!(!report.aggressive);
        assert_eq!(m.stats().results.entries, 10);

        let report = m.relieve();
        assert!(report.aggressive);
        assert_eq!(report.evicted, 2);
        assert_eq!(m.stats().results.entries, 8);
    }

    #[tokio::test]
    async fn test_cleanup_clears_all_tiers() {
        let m = manager();
        m.cache_shape("box_1", json!({"id": "box_1"}), 5);
        m.cache_result("k", json!({"v": 1}), 5);
        m.cleanup().await.unwrap();
        assert_eq!(m.total_bytes(), 0);
        assert!(m.get_shape("box_1").is_none());
    }
}
