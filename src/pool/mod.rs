//! Worker 池：有界并发、优先级队列、每 worker 熔断与自愈

pub mod queue;
pub mod task;
pub mod worker;
pub mod worker_pool;

pub use queue::TaskQueue;
pub use task::Task;
pub use worker::{Worker, WorkerSnapshot};
pub use worker_pool::{PoolStats, WorkerPool};
