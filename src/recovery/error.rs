//! 错误分类：固定类别 + 默认严重度 + 是否可恢复
//!
//! typed 错误按变体直接归类；底座抛出的不透明错误按消息关键词归类，
//! 关键词按 validation → timeout → memory → worker → substrate → network → geometry 的顺序匹配。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::ExecError;
use crate::substrate::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Memory,
    ComputeSubstrate,
    Validation,
    Geometry,
    Worker,
    Network,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

const KEYWORDS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Validation,
        &["validation", "invalid", "required", "missing", "must be"],
    ),
    (ErrorCategory::Timeout, &["timed out", "timeout", "deadline"]),
    (
        ErrorCategory::Memory,
        &["out of memory", "memory", "allocation", "oom"],
    ),
    (ErrorCategory::Worker, &["worker", "terminated", "spawn"]),
    (
        ErrorCategory::ComputeSubstrate,
        &["substrate", "kernel", "wasm", "trap", "not initialized", "unreachable"],
    ),
    (
        ErrorCategory::Network,
        &["network", "connection", "fetch", "socket", "econnreset"],
    ),
    (
        ErrorCategory::Geometry,
        &["geometry", "boolean", "degenerate", "face", "edge", "shape", "tessellat", "intersect"],
    ),
];

impl ErrorCategory {
    pub fn default_severity(self) -> Severity {
        match self {
            ErrorCategory::ComputeSubstrate => Severity::Critical,
            ErrorCategory::Memory | ErrorCategory::Worker => Severity::High,
            ErrorCategory::Validation
            | ErrorCategory::Geometry
            | ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Unknown => Severity::Medium,
        }
    }

    /// 校验错误重试无意义
    pub fn is_recoverable(self) -> bool {
        !matches!(self, ErrorCategory::Validation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Memory => "memory",
            ErrorCategory::ComputeSubstrate => "compute_substrate",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Geometry => "geometry",
            ErrorCategory::Worker => "worker",
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// 按消息关键词归类
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::Unknown)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    pub operation: String,
    pub params: Value,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

/// 归类后的错误，同时作为错误历史记录
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub recoverable: bool,
    pub context: ErrorContext,
}

pub fn classify(error: &ExecError, operation: &Operation, retry_count: u32) -> ClassifiedError {
    let message = error.to_string();
    let category = error
        .category_hint()
        .unwrap_or_else(|| ErrorCategory::from_message(&message));
    ClassifiedError {
        category,
        severity: category.default_severity(),
        recoverable: category.is_recoverable() && !error.is_fail_fast(),
        message,
        context: ErrorContext {
            operation: operation.name().to_string(),
            params: operation.params().clone(),
            timestamp: Utc::now(),
            retry_count,
        },
    }
}
