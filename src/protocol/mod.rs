//! Wire-level protocol types.
//!
//! Requests travel as plain JSON bodies; replies are shaped as exactly one
//! of `{"msg": <result>}` or `{"err": <serialized error>}` and carry the
//! request's correlation id in their message properties.

mod envelope;
mod fault;

pub use envelope::ReplyEnvelope;
pub use fault::RpcFault;
