//! Worker 记录：池对每个 worker 的簿记（忙闲、计数、熔断、内存压力）
//!
//! 只在持有池内部锁时修改。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::capability::OperatingMode;
use crate::core::{CircuitBreaker, WorkerId};
use crate::substrate::WorkerHandle;

pub struct Worker {
    pub id: WorkerId,
    pub handle: Arc<dyn WorkerHandle>,
    pub busy: bool,
    pub last_used_at: Instant,
    pub task_count: u64,
    /// 生命周期内累计失败次数（成功不清零），超过阈值即替换
    pub total_errors: u64,
    pub memory_pressure: bool,
    pub mode: OperatingMode,
    pub avg_task_duration_ms: f64,
    successes: u64,
    /// 无冷却的熔断器：连续失败达阈值打开，下一次成功关闭
    breaker: CircuitBreaker,
}

impl Worker {
    pub fn new(
        handle: Arc<dyn WorkerHandle>,
        mode: OperatingMode,
        failure_threshold: u32,
        busy: bool,
    ) -> Self {
        Self {
            id: handle.id(),
            handle,
            busy,
            last_used_at: Instant::now(),
            task_count: 0,
            total_errors: 0,
            memory_pressure: false,
            mode,
            avg_task_duration_ms: 0.0,
            successes: 0,
            breaker: CircuitBreaker::new(failure_threshold, None),
        }
    }

    /// 连续失败次数
    pub fn error_count(&self) -> u32 {
        self.breaker.consecutive_failures()
    }

    pub fn circuit_tripped(&self) -> bool {
        self.breaker.is_open()
    }

    /// 空闲、无内存压力、未熔断
    pub fn is_available(&self) -> bool {
        !self.busy && !self.memory_pressure && !self.circuit_tripped()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        if self.busy {
            Duration::ZERO
        } else {
            now.saturating_duration_since(self.last_used_at)
        }
    }

    /// 任务计数由池在 release 时累加；这里只更新耗时均值与熔断器
    pub fn record_success(&mut self, elapsed: Duration) {
        self.successes += 1;
        let ms = elapsed.as_secs_f64() * 1000.0;
        let n = self.successes as f64;
        self.avg_task_duration_ms += (ms - self.avg_task_duration_ms) / n;
        self.breaker.record_success();
    }

    /// 记录失败（任务失败或健康探测失败），返回本次是否导致熔断
    pub fn record_failure(&mut self) -> bool {
        let was_open = self.breaker.is_open();
        self.total_errors += 1;
        let open = self.breaker.record_failure();
        open && !was_open
    }

    pub fn snapshot(&self, now: Instant) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            busy: self.busy,
            task_count: self.task_count,
            error_count: self.error_count(),
            total_errors: self.total_errors,
            memory_pressure: self.memory_pressure,
            mode: self.mode,
            avg_task_duration_ms: self.avg_task_duration_ms,
            circuit_breaker_tripped: self.circuit_tripped(),
            idle_ms: self.idle_for(now).as_millis() as u64,
        }
    }
}

/// 对外暴露的 worker 只读快照
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub busy: bool,
    pub task_count: u64,
    pub error_count: u32,
    pub total_errors: u64,
    pub memory_pressure: bool,
    pub mode: OperatingMode,
    pub avg_task_duration_ms: f64,
    pub circuit_breaker_tripped: bool,
    pub idle_ms: u64,
}
