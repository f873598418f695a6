//! 计算底座抽象
//!
//! 执行层把底层几何内核视为不透明的异步函数：invoke(op, params) 与 tessellate(shape, tol)，两者都可能失败。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::substrate::Mesh;

/// 底座抛出的错误；消息文本用于错误归类
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct SubstrateError {
    pub code: Option<String>,
    pub message: String,
    pub details: Option<Value>,
}

impl SubstrateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// 计算底座 trait
#[async_trait]
pub trait ComputeSubstrate: Send + Sync {
    async fn invoke(&self, operation: &str, params: &Value) -> Result<Value, SubstrateError>;

    async fn tessellate(&self, shape_id: &str, tolerance: f64) -> Result<Mesh, SubstrateError>;

    /// 底座是否可用；不可用时编排器初始化直接失败
    fn is_available(&self) -> bool {
        true
    }

    /// 重新初始化底座（恢复策略使用）；默认无操作
    async fn reset(&self) -> Result<(), SubstrateError> {
        Ok(())
    }

    /// 底座当前内存占用（MB），无法得知时为 None
    fn memory_usage_mb(&self) -> Option<u64> {
        None
    }
}
