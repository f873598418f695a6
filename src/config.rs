//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `GEOEXEC__*` 覆盖（双下划线表示嵌套，如 `GEOEXEC__POOL__MAX_WORKERS=6`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub capability: CapabilitySection,
}

/// [pool] 段：Worker 池规模、健康检查与超时
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// 0 表示由能力探测得到的 worker_count_hint 决定
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// 单个 worker 处理的任务数上限，达到后回收重建
    #[serde(default = "default_max_tasks_per_worker")]
    pub max_tasks_per_worker: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// 健康探针上报的内存超过该值（MB）即标记 memory_pressure
    #[serde(default = "default_memory_pressure_threshold_mb")]
    pub memory_pressure_threshold_mb: u64,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// 排队等待空闲 worker 的全局超时
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,
    /// 连续失败多少次后 worker 熔断
    #[serde(default = "default_worker_failure_threshold")]
    pub worker_failure_threshold: u32,
    /// 累计失败超过该值则替换 worker
    #[serde(default = "default_worker_replace_after_errors")]
    pub worker_replace_after_errors: u64,
}

fn default_min_workers() -> usize {
    2
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_max_tasks_per_worker() -> u64 {
    100
}

fn default_health_check_interval_ms() -> u64 {
    10_000
}

fn default_cleanup_interval_ms() -> u64 {
    30_000
}

fn default_memory_pressure_threshold_mb() -> u64 {
    512
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_queue_timeout_ms() -> u64 {
    60_000
}

fn default_queue_poll_interval_ms() -> u64 {
    10
}

fn default_worker_failure_threshold() -> u32 {
    3
}

fn default_worker_replace_after_errors() -> u64 {
    5
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: 0,
            idle_timeout_ms: default_idle_timeout_ms(),
            max_tasks_per_worker: default_max_tasks_per_worker(),
            health_check_interval_ms: default_health_check_interval_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            memory_pressure_threshold_mb: default_memory_pressure_threshold_mb(),
            task_timeout_ms: default_task_timeout_ms(),
            queue_timeout_ms: default_queue_timeout_ms(),
            queue_poll_interval_ms: default_queue_poll_interval_ms(),
            worker_failure_threshold: default_worker_failure_threshold(),
            worker_replace_after_errors: default_worker_replace_after_errors(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms.max(1))
    }

    /// 结合能力探测的 worker 数建议，得到最终的 (min, max)；保证 1 <= min <= max
    pub fn resolve_bounds(&self, worker_count_hint: usize) -> (usize, usize) {
        let max = if self.max_workers == 0 {
            worker_count_hint.max(1)
        } else {
            self.max_workers
        };
        let min = self.min_workers.clamp(1, max);
        (min, max)
    }
}

/// [cache] 段：三级缓存容量、清理阈值与 LOD
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_shape_max_entries")]
    pub shape_max_entries: usize,
    #[serde(default = "default_mesh_max_entries")]
    pub mesh_max_entries: usize,
    #[serde(default = "default_result_max_entries")]
    pub result_max_entries: usize,
    #[serde(default = "default_shape_max_mb")]
    pub shape_max_mb: u64,
    #[serde(default = "default_mesh_max_mb")]
    pub mesh_max_mb: u64,
    #[serde(default = "default_result_max_mb")]
    pub result_max_mb: u64,
    /// 插入前预计占用超过容量的该比例即触发淘汰
    #[serde(default = "default_cleanup_threshold")]
    pub cleanup_threshold: f64,
    #[serde(default = "default_aggressive_cleanup_threshold")]
    pub aggressive_cleanup_threshold: f64,
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    /// 两次维护之间的最小间隔（去抖）
    #[serde(default = "default_maintenance_debounce_ms")]
    pub maintenance_debounce_ms: u64,
    /// 除 bounds 外保留的细节级别数：3 = high/medium/low
    #[serde(default = "default_lod_levels")]
    pub lod_levels: usize,
    /// 三角形数超过该值才生成降采样 LOD
    #[serde(default = "default_lod_triangle_threshold")]
    pub lod_triangle_threshold: usize,
    #[serde(default = "default_max_evictions_per_pass")]
    pub max_evictions_per_pass: usize,
    #[serde(default = "default_aggressive_max_age_secs")]
    pub aggressive_max_age_secs: u64,
    #[serde(default = "default_normal_max_age_secs")]
    pub normal_max_age_secs: u64,
}

fn default_shape_max_entries() -> usize {
    500
}

fn default_mesh_max_entries() -> usize {
    200
}

fn default_result_max_entries() -> usize {
    1000
}

fn default_shape_max_mb() -> u64 {
    128
}

fn default_mesh_max_mb() -> u64 {
    256
}

fn default_result_max_mb() -> u64 {
    64
}

fn default_cleanup_threshold() -> f64 {
    0.8
}

fn default_aggressive_cleanup_threshold() -> f64 {
    0.9
}

fn default_maintenance_interval_ms() -> u64 {
    60_000
}

fn default_maintenance_debounce_ms() -> u64 {
    5_000
}

fn default_lod_levels() -> usize {
    3
}

fn default_lod_triangle_threshold() -> usize {
    1000
}

fn default_max_evictions_per_pass() -> usize {
    5
}

fn default_aggressive_max_age_secs() -> u64 {
    300
}

fn default_normal_max_age_secs() -> u64 {
    1800
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shape_max_entries: default_shape_max_entries(),
            mesh_max_entries: default_mesh_max_entries(),
            result_max_entries: default_result_max_entries(),
            shape_max_mb: default_shape_max_mb(),
            mesh_max_mb: default_mesh_max_mb(),
            result_max_mb: default_result_max_mb(),
            cleanup_threshold: default_cleanup_threshold(),
            aggressive_cleanup_threshold: default_aggressive_cleanup_threshold(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            maintenance_debounce_ms: default_maintenance_debounce_ms(),
            lod_levels: default_lod_levels(),
            lod_triangle_threshold: default_lod_triangle_threshold(),
            max_evictions_per_pass: default_max_evictions_per_pass(),
            aggressive_max_age_secs: default_aggressive_max_age_secs(),
            normal_max_age_secs: default_normal_max_age_secs(),
        }
    }
}

impl CacheConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }

    pub fn maintenance_debounce(&self) -> Duration {
        Duration::from_millis(self.maintenance_debounce_ms)
    }

    pub fn aggressive_max_age(&self) -> Duration {
        Duration::from_secs(self.aggressive_max_age_secs)
    }

    pub fn normal_max_age(&self) -> Duration {
        Duration::from_secs(self.normal_max_age_secs)
    }
}

/// [recovery] 段：重试预算、退避与按操作熔断
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// 每个恢复策略的最大重试次数上限（策略自身的上限会被它截断）
    #[serde(default = "default_max_retries_per_strategy")]
    pub max_retries_per_strategy: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// 指数退避的上限
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_cooldown_ms")]
    pub circuit_cooldown_ms: u64,
    #[serde(default = "default_error_history_size")]
    pub error_history_size: usize,
}

fn default_max_retries_per_strategy() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_cooldown_ms() -> u64 {
    30_000
}

fn default_error_history_size() -> usize {
    100
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries_per_strategy: default_max_retries_per_strategy(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_cooldown_ms: default_circuit_cooldown_ms(),
            error_history_size: default_error_history_size(),
        }
    }
}

impl RecoveryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// 第 attempt 次（从 0 开始）重试前的等待：base × 2^attempt，不超过 backoff_max
    pub fn backoff(&self, attempt: u32) -> Duration {
        let max = Duration::from_millis(self.backoff_max_ms);
        self.backoff_base()
            .checked_mul(2u32.saturating_pow(attempt))
            .map_or(max, |d| d.min(max))
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// false 时直接调用计算底座，不经过 Worker 池
    #[serde(default = "default_true")]
    pub use_worker_pool: bool,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enable_cache: bool,
    /// 单个清理任务（终止 worker、清空缓存）的等待上限
    #[serde(default = "default_cleanup_timeout_ms")]
    pub cleanup_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_cleanup_timeout_ms() -> u64 {
    5_000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            use_worker_pool: true,
            operation_timeout_ms: default_operation_timeout_ms(),
            enable_cache: true,
            cleanup_timeout_ms: default_cleanup_timeout_ms(),
        }
    }
}

impl OrchestratorSection {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}

/// [capability] 段：能力探测参数
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilitySection {
    /// 进程隔离标志所在的环境变量名，值为 1 / true 时视为已隔离
    #[serde(default = "default_isolation_env")]
    pub isolation_env: String,
    #[serde(default = "default_memory_probe_step_mb")]
    pub memory_probe_step_mb: u64,
    #[serde(default = "default_memory_probe_max_mb")]
    pub memory_probe_max_mb: u64,
}

fn default_isolation_env() -> String {
    "GEOEXEC_ISOLATED".to_string()
}

fn default_memory_probe_step_mb() -> u64 {
    64
}

fn default_memory_probe_max_mb() -> u64 {
    1024
}

impl Default for CapabilitySection {
    fn default() -> Self {
        Self {
            isolation_env: default_isolation_env(),
            memory_probe_step_mb: default_memory_probe_step_mb(),
            memory_probe_max_mb: default_memory_probe_max_mb(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 GEOEXEC__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 GEOEXEC__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("GEOEXEC")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.pool.min_workers, 2);
        assert_eq!(config.pool.worker_failure_threshold, 3);
        assert_eq!(config.cache.max_evictions_per_pass, 5);
        assert_eq!(config.recovery.circuit_failure_threshold, 5);
        assert!(config.orchestrator.use_worker_pool);
    }

    #[test]
    fn test_resolve_bounds() {
        let mut pool = PoolConfig::default();
        assert_eq!(pool.resolve_bounds(4), (2, 4));
        assert_eq!(pool.resolve_bounds(1), (1, 1));
        pool.max_workers = 6;
        pool.min_workers = 0;
        assert_eq!(pool.resolve_bounds(4), (1, 6));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut recovery = RecoveryConfig::default();
        assert_eq!(recovery.backoff(0), Duration::from_millis(100));
        assert_eq!(recovery.backoff(3), Duration::from_millis(800));
        assert_eq!(recovery.backoff(10), Duration::from_secs(30));

        // 乘法溢出时退回上限
        recovery.backoff_base_ms = u64::MAX / 2;
        assert_eq!(recovery.backoff(40), Duration::from_secs(30));
        assert_eq!(recovery.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pool]\nmin_workers = 3\nmax_workers = 5\n\n[cache]\nlod_levels = 2\n"
        )
        .unwrap();

        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.pool.min_workers, 3);
        assert_eq!(config.pool.max_workers, 5);
        assert_eq!(config.cache.lod_levels, 2);
        // 未出现的段保持默认值
        assert_eq!(config.recovery.backoff_base_ms, 100);
    }
}
