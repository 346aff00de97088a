//! RPC client: request issuing, reply correlation, TTL expiry.

mod pending;
mod rpc_client;

pub use rpc_client::{RpcClient, SendOptions};
