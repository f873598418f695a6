//! ErrorRecoverySystem：校验 + 归类 + 按操作熔断 + 策略链
//!
//! handle_error 流程：归类 → 记入历史 → 熔断计数 → 熔断已打开或不可恢复则停止 →
//! 按注册顺序尝试适用的策略，每个策略的尝试次数受 (操作, 策略) 维度的预算约束，两次尝试之间指数退避。
//! 任一次成功即关闭该操作的熔断器并清空其预算。

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::core::{Admission, BreakerState, CircuitBreaker, ExecError};
use crate::recovery::{
    classify, default_strategies, ClassifiedError, RecoveryExecutor, RecoveryStrategy,
    ValidationContext, ValidationReport, Validator,
};
use crate::substrate::Operation;

/// 一次恢复的结果
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub recovered: bool,
    pub result: Option<Value>,
    pub final_error: Option<ExecError>,
    pub retry_count: u32,
    /// 成功的策略名；未恢复时为最后尝试的策略
    pub strategy: Option<&'static str>,
}

impl RecoveryOutcome {
    fn failed(error: ExecError, retry_count: u32, strategy: Option<&'static str>) -> Self {
        Self {
            recovered: false,
            result: None,
            final_error: Some(error),
            retry_count,
            strategy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStats {
    pub history_len: usize,
    pub total_errors: u64,
    pub recoveries: u64,
    pub open_circuits: Vec<String>,
}

#[derive(Default)]
struct RecoveryState {
    breakers: HashMap<String, CircuitBreaker>,
    /// (操作, 策略) → 已用尝试次数
    budgets: HashMap<(String, &'static str), u32>,
    history: VecDeque<ClassifiedError>,
    total_errors: u64,
    recoveries: u64,
}

pub struct ErrorRecoverySystem {
    config: RecoveryConfig,
    validator: Validator,
    strategies: Vec<Box<dyn RecoveryStrategy>>,
    state: Mutex<RecoveryState>,
}

impl ErrorRecoverySystem {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            validator: Validator::default(),
            strategies: default_strategies(),
            state: Mutex::new(RecoveryState::default()),
        }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// 在链尾追加策略
    pub fn with_strategy(mut self, strategy: Box<dyn RecoveryStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    fn state(&self) -> MutexGuard<'_, RecoveryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn validate(&self, operation: &Operation, context: &ValidationContext) -> ValidationReport {
        self.validator.validate(operation, context)
    }

    fn new_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.config.circuit_failure_threshold,
            Some(self.config.circuit_cooldown()),
        )
    }

    /// 派发前的熔断闸门；半开时只放行一个试探
    pub fn admit(&self, operation: &str) -> Admission {
        let mut state = self.state();
        match state.breakers.get_mut(operation) {
            Some(breaker) => breaker.admit(),
            None => Admission::Pass,
        }
    }

    pub fn allows(&self, operation: &str) -> bool {
        self.admit(operation) != Admission::Rejected
    }

    /// 试探调用在得出结果前被放弃时归还名额
    pub fn release_trial(&self, operation: &str) {
        if let Some(breaker) = self.state().breakers.get_mut(operation) {
            breaker.release_trial();
        }
    }

    pub fn circuit_state(&self, operation: &str) -> BreakerState {
        self.state()
            .breakers
            .get(operation)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    pub fn consecutive_failures(&self, operation: &str) -> u32 {
        self.state()
            .breakers
            .get(operation)
            .map(|b| b.consecutive_failures())
            .unwrap_or(0)
    }

    /// 成功：关闭熔断器并清空该操作的重试预算
    pub fn record_success(&self, operation: &str) {
        let mut state = self.state();
        if let Some(breaker) = state.breakers.get_mut(operation) {
            breaker.record_success();
        }
        state.budgets.retain(|(op, _), _| op != operation);
    }

    /// 记录失败，返回熔断器是否因此处于打开状态
    fn record_failure(&self, operation: &str) -> bool {
        let fresh = self.new_breaker();
        let mut state = self.state();
        let breaker = state
            .breakers
            .entry(operation.to_string())
            .or_insert(fresh);
        let was_open = breaker.is_open();
        let open = breaker.record_failure();
        if open && !was_open {
            warn!(
                operation,
                failures = breaker.consecutive_failures(),
                "Circuit breaker opened"
            );
        }
        open
    }

    /// 只记入历史，不影响熔断（用于校验失败等未触达底座的错误）
    pub fn record_error(&self, error: ClassifiedError) {
        let capacity = self.config.error_history_size.max(1);
        let mut state = self.state();
        state.total_errors += 1;
        while state.history.len() >= capacity {
            state.history.pop_front();
        }
        state.history.push_back(error);
    }

    pub fn error_history(&self) -> Vec<ClassifiedError> {
        self.state().history.iter().cloned().collect()
    }

    /// 取预算：未超上限时占用一次并返回本次的 attempt 序号
    fn take_budget(&self, operation: &str, strategy: &'static str, max: u32) -> Option<u32> {
        let mut state = self.state();
        let used = state
            .budgets
            .entry((operation.to_string(), strategy))
            .or_insert(0);
        if *used >= max {
            return None;
        }
        let attempt = *used;
        *used += 1;
        Some(attempt)
    }

    pub async fn handle_error(
        &self,
        error: ExecError,
        operation: &Operation,
        executor: &dyn RecoveryExecutor,
    ) -> RecoveryOutcome {
        let op_name = operation.name().to_string();
        let mut classified = classify(&error, operation, 0);
        self.record_error(classified.clone());

        if error.is_fail_fast() {
            return RecoveryOutcome::failed(error, 0, None);
        }
        let open = self.record_failure(&op_name);
        if open || !classified.recoverable {
            debug!(
                operation = %op_name,
                category = classified.category.as_str(),
                open,
                "Not attempting recovery"
            );
            return RecoveryOutcome::failed(error, 0, None);
        }

        let mut last_error = error;
        let mut retry_count = 0;
        let mut last_strategy = None;

        for strategy in &self.strategies {
            if !strategy.applies_to(&classified) {
                continue;
            }
            let max = strategy.max_retries().min(self.config.max_retries_per_strategy);

            while let Some(attempt) = self.take_budget(&op_name, strategy.name(), max) {
                retry_count += 1;
                last_strategy = Some(strategy.name());
                let backoff = self.config.backoff(attempt);
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }

                debug!(
                    operation = %op_name,
                    strategy = strategy.name(),
                    attempt,
                    "Attempting recovery"
                );
                match strategy.attempt(operation, &classified, executor, attempt).await {
                    Ok(value) => {
                        self.record_success(&op_name);
                        self.state().recoveries += 1;
                        info!(
                            operation = %op_name,
                            strategy = strategy.name(),
                            retry_count,
                            "Recovered"
                        );
                        return RecoveryOutcome {
                            recovered: true,
                            result: Some(value),
                            final_error: None,
                            retry_count,
                            strategy: Some(strategy.name()),
                        };
                    }
                    Err(e) => {
                        classified = classify(&e, operation, retry_count);
                        self.record_error(classified.clone());
                        let open = self.record_failure(&op_name);
                        last_error = e;
                        if open || !classified.recoverable {
                            return RecoveryOutcome::failed(last_error, retry_count, last_strategy);
                        }
                        if !strategy.applies_to(&classified) {
                            break;
                        }
                    }
                }
            }
        }

        warn!(
            operation = %op_name,
            retry_count,
            error = %last_error,
            "Recovery exhausted"
        );
        RecoveryOutcome::failed(last_error, retry_count, last_strategy)
    }

    pub fn stats(&self) -> RecoveryStats {
        let state = self.state();
        let mut open_circuits: Vec<String> = state
            .breakers
            .iter()
            .filter(|(_, b)| b.state() != BreakerState::Closed)
            .map(|(op, _)| op.clone())
            .collect();
        open_circuits.sort();
        RecoveryStats {
            history_len: state.history.len(),
            total_errors: state.total_errors,
            recoveries: state.recoveries,
            open_circuits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::ErrorCategory;
    use crate::substrate::SubstrateError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 前 failures 次 retry 失败，之后成功
    struct ScriptedExecutor {
        failures: usize,
        message: &'static str,
        retries: AtomicUsize,
        directs: AtomicUsize,
        reliefs: AtomicUsize,
        resets: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(failures: usize, message: &'static str) -> Self {
            Self {
                failures,
                message,
                retries: AtomicUsize::new(0),
                directs: AtomicUsize::new(0),
                reliefs: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
            }
        }

        fn outcome(&self, n: usize) -> Result<Value, ExecError> {
            if n < self.failures {
                Err(ExecError::Substrate(SubstrateError::new(self.message)))
            } else {
                Ok(json!({"id": "ok"}))
            }
        }
    }

    #[async_trait]
    impl RecoveryExecutor for ScriptedExecutor {
        async fn retry(&self, _operation: &Operation) -> Result<Value, ExecError> {
            let n = self.retries.fetch_add(1, Ordering::SeqCst);
            self.outcome(n)
        }

        async fn direct(&self, _operation: &Operation) -> Result<Value, ExecError> {
            self.directs.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"id": "direct"}))
        }

        async fn relieve_memory(&self) {
            self.reliefs.fetch_add(1, Ordering::SeqCst);
        }

        async fn reset_substrate(&self) -> Result<(), ExecError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(max_retries: u32, threshold: u32) -> RecoveryConfig {
        RecoveryConfig {
            max_retries_per_strategy: max_retries,
            backoff_base_ms: 100,
            backoff_max_ms: 30_000,
            circuit_failure_threshold: threshold,
            circuit_cooldown_ms: 30_000,
            error_history_size: 10,
        }
    }

    fn op() -> Operation {
        Operation::new("MAKE_BOX", json!({"width": 1, "height": 1, "depth": 1}))
    }

    fn substrate_err(message: &str) -> ExecError {
        ExecError::Substrate(SubstrateError::new(message))
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_retried_until_success() {
        let system = ErrorRecoverySystem::new(config(3, 10));
        let executor = ScriptedExecutor::new(1, "network connection reset");
        let outcome = system
            .handle_error(substrate_err("network connection reset"), &op(), &executor)
            .await;
        assert!(outcome.recovered);
        assert_eq!(outcome.retry_count, 2);
        assert_eq!(outcome.strategy, Some("retry_with_backoff"));
        // 成功后熔断计数清零
        assert_eq!(system.consecutive_failures("MAKE_BOX"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_exponential() {
        let system = ErrorRecoverySystem::new(config(3, 10));
        let executor = ScriptedExecutor::new(10, "connection refused");
        let started = tokio::time::Instant::now();
        let outcome = system
            .handle_error(substrate_err("connection refused"), &op(), &executor)
            .await;
        assert!(!outcome.recovered);
        assert_eq!(outcome.retry_count, 3);
        // 100 + 200 + 400 ms
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700));
        assert!(elapsed < Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_not_retried() {
        let system = ErrorRecoverySystem::new(config(3, 10));
        let executor = ScriptedExecutor::new(0, "");
        let outcome = system
            .handle_error(ExecError::Validation("bad".into()), &op(), &executor)
            .await;
        assert!(!outcome.recovered);
        assert_eq!(outcome.retry_count, 0);
        assert_eq!(executor.retries.load(Ordering::SeqCst), 0);
        assert_eq!(system.error_history()[0].category, ErrorCategory::Validation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_error_relieves_then_retries() {
        let system = ErrorRecoverySystem::new(config(3, 10));
        let executor = ScriptedExecutor::new(0, "");
        let outcome = system
            .handle_error(substrate_err("out of memory"), &op(), &executor)
            .await;
        assert!(outcome.recovered);
        assert_eq!(outcome.strategy, Some("memory_relief"));
        assert_eq!(executor.reliefs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_error_bypasses_pool() {
        let system = ErrorRecoverySystem::new(config(3, 10));
        let executor = ScriptedExecutor::new(0, "");
        let err = ExecError::Worker(crate::substrate::WorkerError::Spawn("no slot".into()));
        let outcome = system.handle_error(err, &op(), &executor).await;
        assert!(outcome.recovered);
        assert_eq!(outcome.strategy, Some("pool_bypass"));
        assert_eq!(executor.directs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_substrate_error_resets() {
        let system = ErrorRecoverySystem::new(config(3, 10));
        let executor = ScriptedExecutor::new(0, "");
        let outcome = system
            .handle_error(substrate_err("wasm trap"), &op(), &executor)
            .await;
        assert!(outcome.recovered);
        assert_eq!(outcome.strategy, Some("substrate_reset"));
        assert_eq!(executor.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_persists_across_calls() {
        let system = ErrorRecoverySystem::new(config(2, 100));
        let executor = ScriptedExecutor::new(100, "connection lost");
        let first = system
            .handle_error(substrate_err("connection lost"), &op(), &executor)
            .await;
        assert_eq!(first.retry_count, 2);
        let second = system
            .handle_error(substrate_err("connection lost"), &op(), &executor)
            .await;
        assert_eq!(second.retry_count, 0);

        system.record_success("MAKE_BOX");
        let third = system
            .handle_error(substrate_err("connection lost"), &op(), &executor)
            .await;
        assert_eq!(third.retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_half_opens() {
        let system = ErrorRecoverySystem::new(config(0, 3));
        let executor = ScriptedExecutor::new(0, "");
        for _ in 0..3 {
            assert!(system.allows("MAKE_BOX"));
            system
                .handle_error(substrate_err("kernel fault"), &op(), &executor)
                .await;
        }
        assert_eq!(system.circuit_state("MAKE_BOX"), BreakerState::Open);
        assert!(!system.allows("MAKE_BOX"));
        assert_eq!(system.stats().open_circuits, vec!["MAKE_BOX".to_string()]);

        tokio::time::advance(Duration::from_millis(30_001)).await;
        assert_eq!(system.circuit_state("MAKE_BOX"), BreakerState::HalfOpen);
        assert_eq!(system.admit("MAKE_BOX"), Admission::Trial);
        // 半开只放行一个试探
        assert!(!system.allows("MAKE_BOX"));
        system.release_trial("MAKE_BOX");
        assert_eq!(system.admit("MAKE_BOX"), Admission::Trial);

        system.record_success("MAKE_BOX");
        assert_eq!(system.circuit_state("MAKE_BOX"), BreakerState::Closed);
        assert_eq!(system.consecutive_failures("MAKE_BOX"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded() {
        let system = ErrorRecoverySystem::new(config(0, 1000));
        let executor = ScriptedExecutor::new(0, "");
        for _ in 0..15 {
            system
                .handle_error(substrate_err("boom"), &op(), &executor)
                .await;
        }
        assert_eq!(system.error_history().len(), 10);
        assert_eq!(system.stats().total_errors, 15);
    }
}
