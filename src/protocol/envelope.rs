use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RpcFault;

/// Reply body: exactly one of `{"msg": ...}` or `{"err": ...}`.
///
/// The `Err` variant is tried first during deserialization, matching the
/// original protocol's "error wins" reading of the body. A body carrying
/// neither key is a malformed reply and fails to parse; the client rejects
/// the pending call with that parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyEnvelope {
    // ---
    /// Application failure, serialized by the server.
    Err { err: RpcFault },

    /// Successful result value.
    Msg { msg: Value },
}

impl ReplyEnvelope {
    /// Build a success reply.
    pub fn msg(value: Value) -> Self {
        Self::Msg { msg: value }
    }

    /// Build a failure reply.
    pub fn err(fault: RpcFault) -> Self {
        Self::Err { err: fault }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_msg_shape() {
        // ---
        let env = ReplyEnvelope::msg(json!({"a": 2}));
        let body = serde_json::to_value(&env).unwrap();
        assert_eq!(body, json!({"msg": {"a": 2}}));

        match serde_json::from_value(body).unwrap() {
            ReplyEnvelope::Msg { msg } => assert_eq!(msg, json!({"a": 2})),
            other => panic!("expected msg variant, got {other:?}"),
        }
    }

    #[test]
    fn test_err_shape_wins() {
        // ---
        let body = json!({"err": {"message": "boom", "code": 7}});

        match serde_json::from_value(body).unwrap() {
            ReplyEnvelope::Err { err } => {
                assert_eq!(err.message, "boom");
                assert_eq!(err.details.get("code"), Some(&json!(7)));
            }
            other => panic!("expected err variant, got {other:?}"),
        }
    }

    #[test]
    fn test_err_without_message_defaults_to_unknown() {
        // ---
        let body = json!({"err": {}});

        match serde_json::from_value(body).unwrap() {
            ReplyEnvelope::Err { err } => assert_eq!(err.message, "unknown"),
            other => panic!("expected err variant, got {other:?}"),
        }
    }

    #[test]
    fn test_neither_key_is_malformed() {
        // ---
        let body = json!({"result": 1});
        assert!(serde_json::from_value::<ReplyEnvelope>(body).is_err());
    }

    #[test]
    fn test_null_msg_is_a_valid_result() {
        // ---
        let body = json!({"msg": null});
        match serde_json::from_value(body).unwrap() {
            ReplyEnvelope::Msg { msg } => assert_eq!(msg, Value::Null),
            other => panic!("expected msg variant, got {other:?}"),
        }
    }
}
