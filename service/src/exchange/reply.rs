//! Replies sealed back to the caller.
//!
//! A reply is either a result or a failure, never both. On the wire:
//! `{"error": false, "result": {...}}` or `{"error": true, "failure": {...}}`.

use serde::{Deserialize, Serialize};

/// Whether the caller can fix the problem or the operation itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Bad session, token, upload or precondition.
    Input,
    /// The store operation failed or its outcome is unknown.
    Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub category: FailureCategory,
    /// Stable snake_case identifier for client-side handling.
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawReply", into = "RawReply")]
pub enum Reply {
    Success(serde_json::Value),
    Failure(Failure),
}

impl Reply {
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

#[derive(Serialize, Deserialize)]
struct RawReply {
    error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<Failure>,
}

impl From<Reply> for RawReply {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Success(result) => Self {
                error: false,
                result: Some(result),
                failure: None,
            },
            Reply::Failure(failure) => Self {
                error: true,
                result: None,
                failure: Some(failure),
            },
        }
    }
}

impl TryFrom<RawReply> for Reply {
    type Error = String;

    fn try_from(raw: RawReply) -> Result<Self, Self::Error> {
        match (raw.error, raw.result, raw.failure) {
            (false, Some(result), None) => Ok(Self::Success(result)),
            (true, None, Some(failure)) => Ok(Self::Failure(failure)),
            _ => Err("reply must carry exactly one of result or failure, matching its error flag"
                .to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_shape() {
        let value = serde_json::to_value(Reply::Success(json!({"ok": 1}))).expect("json");
        assert_eq!(value, json!({"error": false, "result": {"ok": 1}}));
    }

    #[test]
    fn failure_shape() {
        let reply = Reply::Failure(Failure {
            category: FailureCategory::Operation,
            code: "store_operation_failed".to_string(),
            message: "disk full".to_string(),
        });
        let value = serde_json::to_value(&reply).expect("json");
        assert_eq!(
            value,
            json!({
                "error": true,
                "failure": {
                    "category": "operation",
                    "code": "store_operation_failed",
                    "message": "disk full"
                }
            })
        );
        let back: Reply = serde_json::from_value(value).expect("parse");
        assert_eq!(back, reply);
    }

    #[test]
    fn both_fields_are_rejected() {
        let both = json!({
            "error": false,
            "result": {},
            "failure": {"category": "input", "code": "x", "message": "y"}
        });
        assert!(serde_json::from_value::<Reply>(both).is_err());
    }

    #[test]
    fn mismatched_flag_is_rejected() {
        let value = json!({"error": true, "result": {}});
        assert!(serde_json::from_value::<Reply>(value).is_err());
        let value = json!({"error": false});
        assert!(serde_json::from_value::<Reply>(value).is_err());
    }
}
