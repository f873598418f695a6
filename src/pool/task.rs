//! 池任务

use std::time::Duration;

use crate::capability::OperatingMode;
use crate::core::TaskId;
use crate::substrate::Operation;

/// 提交给 WorkerPool 的任务；入队后不可变
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub operation: Operation,
    pub priority: u32,
    pub timeout: Duration,
    /// 优先选择该模式的 worker；新建 worker 时也使用该模式
    pub preferred_mode: Option<OperatingMode>,
}

impl Task {
    /// 默认优先级取自操作种类
    pub fn new(operation: Operation, timeout: Duration) -> Self {
        Self {
            id: TaskId::new(),
            priority: operation.kind().default_priority(),
            operation,
            timeout,
            preferred_mode: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mode(mut self, mode: OperatingMode) -> Self {
        self.preferred_mode = Some(mode);
        self
    }
}
