//! 熔断器：失败计数门
//!
//! 同一类型两种用法：
//! - Worker 级：无冷却，连续失败达阈值后打开，下一次成功关闭
//! - 操作级：有冷却，打开后冷却期满进入半开，放行一次试探；成功关闭，失败重新打开

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// 一次放行判定的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Pass,
    /// 半开状态下的唯一试探；调用方未能完成时需 release_trial
    Trial,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    /// None 表示不会自动进入半开
    cooldown: Option<Duration>,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    state: BreakerState,
    /// 半开状态下是否已有试探请求在途
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Option<Duration>) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            last_failure_at: None,
            state: BreakerState::Closed,
            trial_in_flight: false,
        }
    }

    /// 当前状态（冷却期满的 Open 视为 HalfOpen）
    pub fn state(&self) -> BreakerState {
        match (self.state, self.cooldown, self.last_failure_at) {
            (BreakerState::Open, Some(cooldown), Some(at)) if at.elapsed() >= cooldown => {
                BreakerState::HalfOpen
            }
            (state, _, _) => state,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// 放行判定；半开时只放行一个试探
    pub fn admit(&mut self) -> Admission {
        match self.state() {
            BreakerState::Closed => Admission::Pass,
            BreakerState::Open => Admission::Rejected,
            BreakerState::HalfOpen => {
                self.state = BreakerState::HalfOpen;
                if self.trial_in_flight {
                    Admission::Rejected
                } else {
                    self.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    pub fn allows(&mut self) -> bool {
        self.admit() != Admission::Rejected
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            tracing::debug!(
                failures = self.consecutive_failures,
                "Circuit breaker closed after success"
            );
        }
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
        self.trial_in_flight = false;
    }

    /// 记录一次失败，返回记录后熔断器是否处于打开状态
    pub fn record_failure(&mut self) -> bool {
        let was_half_open = self.state() == BreakerState::HalfOpen;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(Instant::now());
        self.trial_in_flight = false;

        if was_half_open || self.consecutive_failures >= self.threshold {
            self.state = BreakerState::Open;
        }
        self.state == BreakerState::Open
    }

    /// 归还半开试探名额（放行后未真正执行）
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn reset(&mut self) {
        self.record_success();
        self.last_failure_at = None;
    }
}
