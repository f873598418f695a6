//! Worker 传输消息
//!
//! 成功：`{id, success: true, result}`；失败：`{id, success: false, error: {code, message, details}}`。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::substrate::{SubstrateError, WorkerError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl WorkerResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: &SubstrateError) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(ErrorPayload {
                code: error.code.clone().unwrap_or_else(|| "SUBSTRATE_ERROR".to_string()),
                message: error.message.clone(),
                details: error.details.clone(),
            }),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, WorkerError> {
        serde_json::from_str(raw).map_err(|e| WorkerError::Failed {
            code: Some("MALFORMED_RESPONSE".to_string()),
            message: format!("Malformed worker response: {}", e),
        })
    }

    /// 拆开信封；success=false 但缺少 error 字段时给出通用错误
    pub fn into_result(self) -> Result<Value, WorkerError> {
        if self.success {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        match self.error {
            Some(payload) => Err(WorkerError::Failed {
                code: Some(payload.code),
                message: payload.message,
            }),
            None => Err(WorkerError::Failed {
                code: None,
                message: format!("Worker reported failure for message {}", self.id),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_failure_message() {
        let raw = r#"{"id": 7, "success": false, "error": {"code": "OCC", "message": "boolean operation failed"}}"#;
        let response = WorkerResponse::from_json(raw).unwrap();
        assert_eq!(response.id, 7);
        match response.into_result() {
            Err(WorkerError::Failed { code, message }) => {
                assert_eq!(code.as_deref(), Some("OCC"));
                assert!(message.contains("boolean"));
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_success_serializes_without_error_field() {
        let response = WorkerResponse::ok(1, json!({"id": "shape_1"}));
        let text = serde_json::to_string(&response).unwrap();
        assert!(!text.contains("error"));
        assert_eq!(response.into_result().unwrap()["id"], "shape_1");
    }

    #[test]
    fn test_malformed_message() {
        assert!(WorkerResponse::from_json("not json").is_err());
    }
}
