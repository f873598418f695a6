//! 优雅关闭
//!
//! 后台循环（健康检查、空闲清理、缓存维护）都挂在 ShutdownManager 的子 token 上，
//! 关闭时先统一取消，再按注册顺序执行清理任务（终止 worker、清空缓存）。清理只执行一次。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 调用方显式 shutdown()
    Requested,
    /// Ctrl+C / SIGTERM
    Signal,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Requested => f.write_str("requested"),
            ShutdownReason::Signal => f.write_str("signal"),
        }
    }
}

/// 关闭信号：一个根 token，加上"清理是否已执行"的标记
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    cleaned: AtomicBool,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 子 token：随根 token 一起取消，也可单独取消
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.token.is_cancelled() {
            info!(%reason, "Shutdown triggered");
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 首次调用返回 true；之后的调用方不再重复清理
    fn claim_cleanup(&self) -> bool {
        !self.cleaned.swap(true, Ordering::SeqCst)
    }

    /// Ctrl+C 与 SIGTERM 都只取消 token；资源由持有者随后 shutdown 释放
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::Signal);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    cleanup_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            cleanup_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    pub fn register(&mut self, task: Arc<dyn ShutdownCleanup>) {
        self.tasks.push(task);
    }

    /// 取消后台循环，然后依次清理；单个任务超时或失败只记日志
    pub async fn shutdown(&self, reason: ShutdownReason) {
        self.manager.shutdown(reason);
        if !self.manager.claim_cleanup() {
            return;
        }

        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.cleanup_timeout, task.cleanup()).await {
                Ok(Ok(())) => info!(task = name, "Cleanup finished"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Cleanup failed"),
                Err(_) => warn!(
                    task = name,
                    timeout_ms = self.cleanup_timeout.as_millis() as u64,
                    "Cleanup timed out"
                ),
            }
        }
    }
}
