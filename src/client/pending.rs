use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::domain::lock_ignore_poison;
use crate::{log_debug, CorrelationId, Error, Result};

/// One outstanding call.
///
/// The oneshot sender is the resolve/reject pair: `send(Ok(..))` resolves
/// the caller, `send(Err(..))` rejects it. The entry owns the sender
/// exclusively until it is taken, so each call settles at most once.
struct PendingCall {
    // ---
    reply_tx: oneshot::Sender<Result<Value>>,
    deadline: Option<Instant>,
}

/// TTL-indexed store of outstanding calls keyed by correlation id.
///
/// `take()` is the single removal point, used both by reply matching and by
/// the expiry sweep. Removal under the map lock is unconditional once
/// triggered, so concurrent firing of sweep and reply-arrival for the same
/// id is safe without further coordination: the first to act wins, the
/// second observes absence and does nothing.
pub(super) struct PendingCalls {
    // ---
    calls: Mutex<HashMap<CorrelationId, PendingCall>>,
}

impl PendingCalls {
    // ---

    /// Create a new empty registry.
    pub fn new() -> Self {
        // ---
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new pending call.
    ///
    /// `ttl_secs` of `0` means the call never expires locally. Returns the
    /// receiver the caller awaits.
    pub fn register(
        &self,
        correlation_id: CorrelationId,
        ttl_secs: u64,
    ) -> oneshot::Receiver<Result<Value>> {
        // ---
        let (tx, rx) = oneshot::channel();

        let deadline = (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(ttl_secs));

        let mut calls = lock_ignore_poison(&self.calls);
        calls.insert(
            correlation_id,
            PendingCall {
                reply_tx: tx,
                deadline,
            },
        );
        rx
    }

    /// Remove and return the settlement channel for a call.
    ///
    /// Accepts the id as borrowed text so reply matching needs no allocation.
    /// Returns `None` when the id is unknown — already settled, expired, or
    /// foreign — in which case the caller must do nothing.
    pub fn take(&self, correlation_id: &str) -> Option<oneshot::Sender<Result<Value>>> {
        // ---
        let mut calls = lock_ignore_poison(&self.calls);
        calls.remove(correlation_id).map(|call| call.reply_tx)
    }

    /// Expire every entry whose deadline has passed, rejecting it with
    /// [`Error::TimeExpired`]. Returns the number of expired calls.
    pub fn sweep(&self, now: Instant) -> usize {
        // ---
        let expired: Vec<(CorrelationId, PendingCall)> = {
            let mut calls = lock_ignore_poison(&self.calls);

            let ids: Vec<CorrelationId> = calls
                .iter()
                .filter(|(_, call)| call.deadline.is_some_and(|deadline| deadline <= now))
                .map(|(id, _)| id.clone())
                .collect();

            ids.into_iter()
                .filter_map(|id| calls.remove(&id).map(|call| (id, call)))
                .collect()
        };

        let count = expired.len();
        for (id, call) in expired {
            log_debug!("call expired before a reply arrived (correlation_id: {id})");
            // The receiver may already be gone if the caller was dropped.
            let _ = call.reply_tx.send(Err(Error::TimeExpired));
        }
        count
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        // ---
        lock_ignore_poison(&self.calls).len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_register_and_take() {
        // ---
        let pending = PendingCalls::new();
        let id = CorrelationId::generate();

        let mut rx = pending.register(id.clone(), 0);
        assert_eq!(pending.len(), 1);

        let tx = pending.take(id.as_str()).expect("entry present");
        assert_eq!(pending.len(), 0);

        tx.send(Ok(serde_json::json!({"a": 2}))).unwrap();
        let value = rx.try_recv().unwrap().unwrap();
        assert_eq!(value, serde_json::json!({"a": 2}));
    }

    #[test]
    fn test_take_is_idempotent() {
        // ---
        let pending = PendingCalls::new();
        let id = CorrelationId::generate();

        let _rx = pending.register(id.clone(), 0);
        assert!(pending.take(id.as_str()).is_some());

        // Second take observes absence; a late reply or a racing sweep is a no-op.
        assert!(pending.take(id.as_str()).is_none());
    }

    #[test]
    fn test_take_unknown_id() {
        // ---
        let pending = PendingCalls::new();
        assert!(pending.take(CorrelationId::generate().as_str()).is_none());
    }

    #[test]
    fn test_sweep_rejects_expired_with_time_expired() {
        // ---
        let pending = PendingCalls::new();
        let id = CorrelationId::generate();

        let mut rx = pending.register(id, 1);
        assert_eq!(pending.sweep(Instant::now()), 0, "not yet expired");

        let later = Instant::now() + Duration::from_secs(2);
        assert_eq!(pending.sweep(later), 1);
        assert_eq!(pending.len(), 0);

        match rx.try_recv().unwrap() {
            Err(Error::TimeExpired) => {}
            other => panic!("expected TimeExpired, got {other:?}"),
        }
    }

    #[test]
    fn test_sweep_skips_infinite_ttl() {
        // ---
        let pending = PendingCalls::new();
        let _rx = pending.register(CorrelationId::generate(), 0);

        let far_future = Instant::now() + Duration::from_secs(24 * 3600);
        assert_eq!(pending.sweep(far_future), 0);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_no_collisions_among_many_concurrent_calls() {
        // ---
        let pending = PendingCalls::new();
        let mut receivers = Vec::with_capacity(10_000);

        for _ in 0..10_000 {
            receivers.push(pending.register(CorrelationId::generate(), 0));
        }

        // Every registration landed in its own slot.
        assert_eq!(pending.len(), 10_000);
    }
}
