//! Concrete transport implementations.
//!
//! The in-memory transport is always available and defines the reference
//! semantics for the [`Transport`](crate::Transport) contract; the AMQP
//! transport (feature `transport_amqp`) maps the same contract onto a
//! `lapin` connection with automatic reconnection.

mod memory;

pub use memory::{MemoryTransport, PublishRecord};

#[cfg(feature = "transport_amqp")]
mod amqp;

#[cfg(feature = "transport_amqp")]
pub(crate) use amqp::AmqpTransport;
