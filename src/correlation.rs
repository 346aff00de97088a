use std::borrow::Borrow;
use std::fmt;

use uuid::Uuid;

/// Token linking an RPC request to its eventual reply.
///
/// Generated fresh per call and carried in message properties; the transport
/// treats it as opaque text. The only property the protocol needs is
/// uniqueness among the calls pending on one client, which a random UUID
/// provides with margin to spare.
///
/// `Borrow<str>` lets the pending-call registry look entries up directly by
/// the string taken from an inbound reply, without rebuilding an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh, unique correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as text, as it appears in message properties.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
