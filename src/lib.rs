//! Geoexec - 几何计算弹性执行层
//!
//! 模块划分：
//! - **capability**: 运行时能力探测与运行模式选择
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、熔断器、优雅关闭、编排器
//! - **memory**: 三级有界缓存、网格 LOD、内存压力
//! - **observability**: 日志初始化
//! - **pool**: Worker 池（优先级队列、每 worker 熔断、健康检查）
//! - **recovery**: 执行前校验、错误归类、恢复策略链
//! - **substrate**: 计算底座抽象、操作词表、网格与 Mock 实现

pub mod capability;
pub mod config;
pub mod core;
pub mod memory;
pub mod observability;
pub mod pool;
pub mod recovery;
pub mod substrate;

pub use crate::core::{ExecError, OperationResult, Orchestrator, OrchestratorBuilder};
