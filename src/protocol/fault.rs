use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::Error;

fn unknown_message() -> String {
    "unknown".to_string()
}

/// Transmissible form of an application failure.
///
/// A fault carries a human-readable `message`, an optional `stack`, and
/// every additional property of the original failure flattened into
/// `details`. The contract is that any property present on the original
/// error round-trips to the client — except the stack, which is stripped on
/// the way out unless the server was built with
/// [`ServerOptions::send_error_stack`](crate::ServerOptions).
///
/// A wire fault with no `message` property deserializes as `"unknown"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFault {
    // ---
    /// Failure description, used as the `Display` form.
    #[serde(default = "unknown_message")]
    pub message: String,

    /// Captured stack or backtrace text, if any. Never sent unless the
    /// server explicitly opts in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// All remaining properties of the original failure.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl RpcFault {
    /// Create a fault with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            details: Map::new(),
        }
    }

    /// Attach an extra property that will round-trip to the caller.
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Attach stack text. Only transmitted when the server opts in.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Translate a local error into its wire form.
    ///
    /// Remote faults pass through with their properties intact so a relayed
    /// failure keeps its shape; any other error contributes its display
    /// text. The stack is stripped unless `include_stack` is set.
    pub(crate) fn from_error(error: &Error, include_stack: bool) -> Self {
        let fault = match error {
            Error::Remote(fault) => fault.clone(),
            other => Self::new(other.to_string()),
        };
        fault.into_wire(include_stack)
    }

    /// Strip the stack unless explicitly kept.
    pub(crate) fn into_wire(mut self, include_stack: bool) -> Self {
        if !include_stack {
            self.stack = None;
        }
        self
    }
}

impl fmt::Display for RpcFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RpcFault {}

impl From<RpcFault> for Error {
    fn from(fault: RpcFault) -> Self {
        Error::Remote(fault)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_properties_round_trip() {
        // ---
        let fault = RpcFault::new("B is not set")
            .with_detail("code", json!("EINVAL"))
            .with_detail("attempt", json!(3));

        let wire = serde_json::to_value(&fault).unwrap();
        assert_eq!(
            wire,
            json!({"message": "B is not set", "code": "EINVAL", "attempt": 3})
        );

        let back: RpcFault = serde_json::from_value(wire).unwrap();
        assert_eq!(back.message, "B is not set");
        assert_eq!(back.details.get("code"), Some(&json!("EINVAL")));
        assert_eq!(back.details.get("attempt"), Some(&json!(3)));
    }

    #[test]
    fn test_stack_stripped_by_default() {
        // ---
        let fault = RpcFault::new("boom").with_stack("at line 1");
        let wire = fault.into_wire(false);
        assert!(wire.stack.is_none());

        let body = serde_json::to_value(&wire).unwrap();
        assert!(body.get("stack").is_none());
    }

    #[test]
    fn test_stack_sent_when_opted_in() {
        // ---
        let fault = RpcFault::new("boom").with_stack("at line 1");
        let wire = fault.into_wire(true);
        assert_eq!(wire.stack.as_deref(), Some("at line 1"));
    }

    #[test]
    fn test_remote_faults_pass_through_from_error() {
        // ---
        let original = RpcFault::new("nested").with_detail("hop", json!(1));
        let translated = RpcFault::from_error(&Error::Remote(original), false);
        assert_eq!(translated.message, "nested");
        assert_eq!(translated.details.get("hop"), Some(&json!(1)));

        let plain = RpcFault::from_error(&Error::TimeExpired, false);
        assert_eq!(plain.message, "time expired");
        assert!(plain.details.is_empty());
    }
}
