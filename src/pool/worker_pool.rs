//! WorkerPool：有界 worker 池
//!
//! 分派顺序：同模式可用 worker → 任意可用 worker → 任意空闲 worker（含已熔断，最后手段）
//! → 未达上限则新建 → 入队等待。队列非空时新任务直接入队，保证先来先服务。
//!
//! 池状态由一把 std Mutex 保护，临界区内不跨 await；新建 worker 先在锁内预占名额（pending_spawns），
//! 锁外完成 spawn，因此并发分派不会超过 max_workers。后台健康检查与空闲清理只用 try_lock，
//! 拿不到锁就跳过本轮，不阻塞分派。

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::OperatingMode;
use crate::config::PoolConfig;
use crate::core::{ExecError, ShutdownCleanup, TaskId, WorkerId};
use crate::pool::{Task, TaskQueue, Worker, WorkerSnapshot};
use crate::substrate::{WorkerError, WorkerFactory, WorkerHandle, WorkerHealth};

/// 池运行统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub min_workers: usize,
    pub max_workers: usize,
    pub total_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub pending_spawns: usize,
    pub tripped_workers: usize,
    pub pressured_workers: usize,
    pub queued_tasks: usize,
    pub peak_queue_depth: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    /// 超时后才返回、被丢弃的结果数
    pub stale_results: u64,
    pub workers_created: u64,
    pub workers_replaced: u64,
    pub workers_terminated: u64,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<Worker>,
    pending_spawns: usize,
    queue: TaskQueue,
    shutting_down: bool,
    counters: PoolStats,
}

impl PoolState {
    fn size(&self) -> usize {
        self.workers.len() + self.pending_spawns
    }

    fn position(&self, id: WorkerId) -> Option<usize> {
        self.workers.iter().position(|w| w.id == id)
    }
}

/// 排队登记：调用方在排队期间放弃（future 被丢弃）时自动出队并唤醒下一个
struct QueueSlot<'a> {
    pool: &'a WorkerPool,
    priority: u32,
    task_id: TaskId,
    queued: bool,
}

impl QueueSlot<'_> {
    fn leave(&mut self, state: &mut PoolState) {
        state.queue.remove(self.priority, self.task_id);
        self.queued = false;
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if !self.queued {
            return;
        }
        let removed = self.pool.state().queue.remove(self.priority, self.task_id);
        if removed {
            debug!(task = %self.task_id, "Queued task abandoned");
            self.pool.notify.notify_waiters();
        }
    }
}

/// 预占的新建名额：spawn 完成前被丢弃时归还
struct SpawnReservation<'a> {
    pool: &'a WorkerPool,
    held: bool,
}

impl SpawnReservation<'_> {
    fn settle(&mut self, state: &mut PoolState) {
        if self.held {
            state.pending_spawns = state.pending_spawns.saturating_sub(1);
            self.held = false;
        }
    }
}

impl Drop for SpawnReservation<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        {
            let mut state = self.pool.state();
            state.pending_spawns = state.pending_spawns.saturating_sub(1);
        }
        self.pool.notify.notify_waiters();
    }
}

/// 已占用的 worker
struct Lease {
    worker_id: WorkerId,
    handle: Arc<dyn WorkerHandle>,
}

enum Claim {
    Ready(Lease),
    /// 已预占名额，需在锁外新建
    Spawn(WorkerId),
    Wait,
}

enum QueueStep {
    Ready(Lease),
    Spawn(WorkerId),
    Pending,
    Expired,
    Closed,
}

pub struct WorkerPool {
    config: PoolConfig,
    min_workers: usize,
    max_workers: usize,
    default_mode: OperatingMode,
    factory: Arc<dyn WorkerFactory>,
    state: Mutex<PoolState>,
    notify: Notify,
    token: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        min_workers: usize,
        max_workers: usize,
        default_mode: OperatingMode,
        factory: Arc<dyn WorkerFactory>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let max_workers = max_workers.max(1);
        let min_workers = min_workers.clamp(1, max_workers);
        Arc::new(Self {
            config,
            min_workers,
            max_workers,
            default_mode,
            factory,
            state: Mutex::new(PoolState::default()),
            notify: Notify::new(),
            token,
        })
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 后台循环用：锁被占用时返回 None
    fn try_state(&self) -> Option<MutexGuard<'_, PoolState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// 预热 min_workers 个 worker 并启动后台循环；一个都起不来视为初始化失败
    pub async fn initialize(self: &Arc<Self>) -> Result<(), ExecError> {
        let created = self.top_up().await;
        if created == 0 && self.state().workers.is_empty() {
            return Err(ExecError::Initialization(
                "no worker could be spawned".to_string(),
            ));
        }
        self.start_background_tasks();
        info!(
            min = self.min_workers,
            max = self.max_workers,
            mode = ?self.default_mode,
            "Worker pool initialized"
        );
        Ok(())
    }

    fn start_background_tasks(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let token = self.token.clone();
        let period = self.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.run_health_checks().await;
                    }
                }
            }
            debug!("Health check loop stopped");
        });

        let pool = Arc::clone(self);
        let token = self.token.clone();
        let period = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.cleanup_idle().await;
                    }
                }
            }
            debug!("Idle cleanup loop stopped");
        });
    }

    /// 执行任务：占用 worker → 在独立任务中执行 → 在 task.timeout 内等待结果
    ///
    /// 超时后调用方立即拿到 Timeout；worker 仍跑完当前任务后才被释放，迟到的结果丢弃。
    pub async fn execute(self: &Arc<Self>, task: Task) -> Result<serde_json::Value, ExecError> {
        let lease = self.acquire(&task).await?;
        let worker_id = lease.worker_id;
        let (tx, rx) = oneshot::channel();
        let pool = Arc::clone(self);
        let operation = task.operation.clone();
        let task_id = task.id;

        tokio::spawn(async move {
            let started = Instant::now();
            let result = lease.handle.invoke(&operation).await;
            pool.release(lease.worker_id, result.is_ok(), started.elapsed())
                .await;
            if tx.send(result).is_err() {
                debug!(task = %task_id, worker = %worker_id, "Discarding stale result");
                pool.state().counters.stale_results += 1;
            }
        });

        match timeout(task.timeout, rx).await {
            Ok(Ok(result)) => result.map_err(ExecError::Worker),
            Ok(Err(_)) => Err(ExecError::Worker(WorkerError::Terminated(worker_id))),
            Err(_) => {
                self.state().counters.tasks_timed_out += 1;
                warn!(
                    task = %task.id,
                    worker = %worker_id,
                    operation = task.operation.name(),
                    "Task timed out"
                );
                Err(ExecError::Timeout {
                    operation: task.operation.name().to_string(),
                    timeout_ms: task.timeout.as_millis() as u64,
                })
            }
        }
    }

    fn claim(&self, state: &mut PoolState, preferred: Option<OperatingMode>) -> Claim {
        let pick = preferred
            .and_then(|mode| {
                state
                    .workers
                    .iter()
                    .position(|w| w.is_available() && w.mode == mode)
            })
            .or_else(|| state.workers.iter().position(|w| w.is_available()))
            .or_else(|| state.workers.iter().position(|w| !w.busy));

        if let Some(idx) = pick {
            let worker = &mut state.workers[idx];
            worker.busy = true;
            worker.last_used_at = Instant::now();
            if worker.circuit_tripped() {
                debug!(worker = %worker.id, "Dispatching to tripped worker as last resort");
            }
            return Claim::Ready(Lease {
                worker_id: worker.id,
                handle: Arc::clone(&worker.handle),
            });
        }

        if state.size() < self.max_workers {
            state.pending_spawns += 1;
            return Claim::Spawn(WorkerId::new());
        }

        Claim::Wait
    }

    async fn acquire(&self, task: &Task) -> Result<Lease, ExecError> {
        let claim = {
            let mut state = self.state();
            if state.shutting_down {
                return Err(ExecError::Shutdown);
            }
            let claim = if state.queue.is_empty() {
                self.claim(&mut state, task.preferred_mode)
            } else {
                Claim::Wait
            };
            if matches!(claim, Claim::Wait) {
                state.queue.push(task.priority, task.id);
                let depth = state.queue.len();
                if depth > state.counters.peak_queue_depth {
                    state.counters.peak_queue_depth = depth;
                }
                debug!(task = %task.id, priority = task.priority, depth, "Task queued");
            }
            claim
        };

        match claim {
            Claim::Ready(lease) => Ok(lease),
            Claim::Spawn(id) => self.spawn_leased(id, task.preferred_mode).await,
            Claim::Wait => {
                let slot = QueueSlot {
                    pool: self,
                    priority: task.priority,
                    task_id: task.id,
                    queued: true,
                };
                self.wait_in_queue(task, slot).await
            }
        }
    }

    async fn wait_in_queue(&self, task: &Task, mut slot: QueueSlot<'_>) -> Result<Lease, ExecError> {
        let queued_at = Instant::now();
        let deadline = queued_at + self.config.queue_timeout();
        let poll = self.config.queue_poll_interval();

        loop {
            let notified = self.notify.notified();
            let step = {
                let mut state = self.state();
                if state.shutting_down {
                    slot.leave(&mut state);
                    QueueStep::Closed
                } else {
                    let mut step = QueueStep::Pending;
                    if state.queue.head() == Some(task.id) {
                        step = match self.claim(&mut state, task.preferred_mode) {
                            Claim::Ready(lease) => QueueStep::Ready(lease),
                            Claim::Spawn(id) => QueueStep::Spawn(id),
                            Claim::Wait => QueueStep::Pending,
                        };
                        if !matches!(step, QueueStep::Pending) {
                            slot.leave(&mut state);
                        }
                    }
                    if matches!(step, QueueStep::Pending) && Instant::now() >= deadline {
                        slot.leave(&mut state);
                        step = QueueStep::Expired;
                    }
                    step
                }
            };

            match step {
                QueueStep::Ready(lease) => {
                    // 队首已出队，唤醒下一个
                    self.notify.notify_waiters();
                    return Ok(lease);
                }
                QueueStep::Spawn(id) => {
                    self.notify.notify_waiters();
                    return self.spawn_leased(id, task.preferred_mode).await;
                }
                QueueStep::Expired => {
                    self.notify.notify_waiters();
                    let waited_ms = queued_at.elapsed().as_millis() as u64;
                    warn!(task = %task.id, waited_ms, "Gave up waiting for a free worker");
                    return Err(ExecError::QueueTimeout { waited_ms });
                }
                QueueStep::Closed => return Err(ExecError::Shutdown),
                QueueStep::Pending => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = notified => {}
                _ = sleep(poll.min(remaining)) => {}
            }
        }
    }

    /// 为当前任务新建 worker（名额已预占），创建后直接归该任务使用
    async fn spawn_leased(
        &self,
        id: WorkerId,
        preferred: Option<OperatingMode>,
    ) -> Result<Lease, ExecError> {
        let mut reservation = SpawnReservation {
            pool: self,
            held: true,
        };
        let mode = preferred.unwrap_or(self.default_mode);
        let spawned = self.factory.spawn(id, mode).await;

        let outcome = {
            let mut state = self.state();
            reservation.settle(&mut state);
            match spawned {
                Ok(handle) if !state.shutting_down => {
                    state.counters.workers_created += 1;
                    state.workers.push(Worker::new(
                        Arc::clone(&handle),
                        mode,
                        self.config.worker_failure_threshold,
                        true,
                    ));
                    Ok(Lease {
                        worker_id: handle.id(),
                        handle,
                    })
                }
                Ok(handle) => Err((Some(handle), ExecError::Shutdown)),
                Err(e) => Err((None, ExecError::Worker(e))),
            }
        };

        match outcome {
            Ok(lease) => {
                info!(worker = %lease.worker_id, ?mode, "Worker created on demand");
                Ok(lease)
            }
            Err((orphan, err)) => {
                warn!(worker = %id, error = %err, "Worker spawn failed");
                // 名额已归还，让排队者有机会重新申请
                self.notify.notify_waiters();
                if let Some(handle) = orphan {
                    handle.terminate().await;
                }
                Err(err)
            }
        }
    }

    /// 任务结束：更新计数与熔断状态，必要时替换 worker，然后唤醒排队者
    async fn release(&self, worker_id: WorkerId, success: bool, elapsed: Duration) {
        let retired = {
            let mut state = self.state();
            let Some(idx) = state.position(worker_id) else {
                return;
            };
            let replace_after = self.config.worker_replace_after_errors;
            let max_tasks = self.config.max_tasks_per_worker;
            let worker = &mut state.workers[idx];
            worker.busy = false;
            worker.last_used_at = Instant::now();

            worker.task_count += 1;
            if success {
                worker.record_success(elapsed);
            } else if worker.record_failure() {
                warn!(
                    worker = %worker_id,
                    errors = worker.error_count(),
                    "Worker circuit breaker tripped"
                );
            }

            let reason = if worker.total_errors > replace_after {
                Some("too many errors")
            } else if worker.task_count >= max_tasks {
                Some("task budget exhausted")
            } else {
                None
            };

            if success {
                state.counters.tasks_completed += 1;
            } else {
                state.counters.tasks_failed += 1;
            }

            match reason {
                Some(reason) if !state.shutting_down => {
                    let old = state.workers.remove(idx);
                    state.pending_spawns += 1;
                    state.counters.workers_replaced += 1;
                    info!(worker = %worker_id, reason, "Replacing worker");
                    Some((old.handle, old.mode))
                }
                _ => None,
            }
        };

        if let Some((handle, mode)) = retired {
            self.replace(handle, mode).await;
        }
        self.notify.notify_waiters();
    }

    /// 终止旧 worker 并以新 id 重建（名额已由调用方预占）
    async fn replace(&self, old: Arc<dyn WorkerHandle>, mode: OperatingMode) {
        old.terminate().await;
        let id = WorkerId::new();
        let spawned = self.factory.spawn(id, mode).await;
        let orphan = {
            let mut state = self.state();
            state.pending_spawns = state.pending_spawns.saturating_sub(1);
            state.counters.workers_terminated += 1;
            match spawned {
                Ok(handle) if !state.shutting_down => {
                    state.counters.workers_created += 1;
                    state.workers.push(Worker::new(
                        handle,
                        mode,
                        self.config.worker_failure_threshold,
                        false,
                    ));
                    None
                }
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "Replacement worker failed to spawn");
                    None
                }
            }
        };
        if let Some(handle) = orphan {
            handle.terminate().await;
        }
    }

    /// 补足到 min_workers，返回新建数量
    async fn top_up(&self) -> usize {
        let reserved = {
            let mut state = self.state();
            if state.shutting_down {
                return 0;
            }
            let missing = self.min_workers.saturating_sub(state.size());
            state.pending_spawns += missing;
            missing
        };
        if reserved == 0 {
            return 0;
        }

        let spawns = (0..reserved).map(|_| {
            let id = WorkerId::new();
            async move { (id, self.factory.spawn(id, self.default_mode).await) }
        });
        let results = futures_util::future::join_all(spawns).await;

        let mut created = 0;
        let mut state = self.state();
        state.pending_spawns = state.pending_spawns.saturating_sub(reserved);
        for (id, result) in results {
            match result {
                Ok(handle) => {
                    state.workers.push(Worker::new(
                        handle,
                        self.default_mode,
                        self.config.worker_failure_threshold,
                        false,
                    ));
                    state.counters.workers_created += 1;
                    created += 1;
                }
                Err(e) => warn!(worker = %id, error = %e, "Failed to spawn worker"),
            }
        }
        drop(state);
        if created > 0 {
            self.notify.notify_waiters();
        }
        created
    }

    /// 探测所有空闲 worker：更新内存压力，替换失联或有压力且已用尽任务预算的 worker
    ///
    /// 返回本轮探测的 worker 数；状态锁被占用时跳过本轮并返回 0。
    pub async fn run_health_checks(&self) -> usize {
        let targets: Vec<(WorkerId, Arc<dyn WorkerHandle>)> = match self.try_state() {
            Some(state) => state
                .workers
                .iter()
                .filter(|w| !w.busy)
                .map(|w| (w.id, Arc::clone(&w.handle)))
                .collect(),
            None => {
                debug!("Pool busy, skipping health check");
                return 0;
            }
        };

        let mut reports: Vec<(WorkerId, Result<WorkerHealth, WorkerError>)> =
            Vec::with_capacity(targets.len());
        for (id, handle) in &targets {
            reports.push((*id, handle.health().await));
        }

        let retired = {
            let Some(mut state) = self.try_state() else {
                debug!("Pool busy, dropping health results");
                return targets.len();
            };
            let threshold = self.config.memory_pressure_threshold_mb;
            let max_tasks = self.config.max_tasks_per_worker;
            let replace_after = self.config.worker_replace_after_errors;
            let mut retired = Vec::new();

            for (id, report) in reports {
                let Some(idx) = state.position(id) else {
                    continue;
                };
                let worker = &mut state.workers[idx];
                if worker.busy {
                    continue;
                }
                let replace = match report {
                    Ok(health) => {
                        let pressured = health.memory_used_mb > threshold;
                        if pressured && !worker.memory_pressure {
                            warn!(
                                worker = %id,
                                memory_mb = health.memory_used_mb,
                                "Worker under memory pressure"
                            );
                        }
                        worker.memory_pressure = pressured;
                        pressured && worker.task_count >= max_tasks
                    }
                    Err(e) => {
                        warn!(worker = %id, error = %e, "Worker health probe failed");
                        worker.record_failure();
                        worker.total_errors > replace_after
                    }
                };
                if replace && !state.shutting_down {
                    let old = state.workers.remove(idx);
                    state.pending_spawns += 1;
                    state.counters.workers_replaced += 1;
                    retired.push((old.handle, old.mode));
                }
            }
            retired
        };

        for (handle, mode) in retired {
            info!(worker = %handle.id(), "Replacing unhealthy worker");
            self.replace(handle, mode).await;
        }
        targets.len()
    }

    /// 终止空闲超时的 worker（不低于 min_workers），并补足到 min_workers
    ///
    /// 返回终止数量；状态锁被占用时跳过本轮。
    pub async fn cleanup_idle(&self) -> usize {
        let removed: Vec<Arc<dyn WorkerHandle>> = {
            let Some(mut state) = self.try_state() else {
                debug!("Pool busy, skipping idle cleanup");
                return 0;
            };
            if state.shutting_down {
                return 0;
            }
            let now = Instant::now();
            let idle_timeout = self.config.idle_timeout();
            let mut removable = state.size().saturating_sub(self.min_workers);
            let mut removed = Vec::new();
            let mut idx = 0;
            while idx < state.workers.len() && removable > 0 {
                if state.workers[idx].idle_for(now) > idle_timeout {
                    let worker = state.workers.remove(idx);
                    removed.push(worker.handle);
                    removable -= 1;
                } else {
                    idx += 1;
                }
            }
            state.counters.workers_terminated += removed.len() as u64;
            removed
        };

        for handle in &removed {
            handle.terminate().await;
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Terminated idle workers");
        }
        self.top_up().await;
        removed.len()
    }

    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        self.state().workers.iter().map(|w| w.snapshot(now)).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        let busy = state.workers.iter().filter(|w| w.busy).count();
        PoolStats {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            total_workers: state.workers.len(),
            busy_workers: busy,
            idle_workers: state.workers.len() - busy,
            pending_spawns: state.pending_spawns,
            tripped_workers: state.workers.iter().filter(|w| w.circuit_tripped()).count(),
            pressured_workers: state.workers.iter().filter(|w| w.memory_pressure).count(),
            queued_tasks: state.queue.len(),
            ..state.counters.clone()
        }
    }

    /// 停止后台循环，让排队任务以 Shutdown 失败，并终止全部 worker
    pub async fn shutdown(&self) {
        self.token.cancel();
        let workers = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.queue.clear();
            let workers: Vec<Worker> = state.workers.drain(..).collect();
            state.counters.workers_terminated += workers.len() as u64;
            workers
        };
        self.notify.notify_waiters();
        for worker in &workers {
            worker.handle.terminate().await;
        }
        info!(terminated = workers.len(), "Worker pool shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.state().shutting_down
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for WorkerPool {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "WorkerPool"
    }
}
