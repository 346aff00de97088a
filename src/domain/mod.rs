//! Domain abstractions shared by the client and server layers.

mod transport;

pub use transport::{
    //
    AckMode,
    Channel,
    ChannelSetup,
    ConnectionEvent,
    ConsumerHandle,
    Delivery,
    MessageProperties,
    QueueOptions,
    SetupFn,
    SetupFuture,
    Transport,
    TransportPtr,
};

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Mutex poisoning indicates that another task panicked while holding the
/// lock. The state protected by these locks (pending-call maps, channel
/// state cells, consume-task handles) has no invariants spanning multiple
/// fields; the worst outcome of continuing is a dropped or unmatched reply.
/// This also avoids propagating non-`Send` poison errors across async
/// boundaries.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
