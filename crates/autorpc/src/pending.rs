//! # Pending-call registry
//!
//! Service-wide map of in-flight outbound calls keyed by call id. Ids are
//! drawn from a uniform random source (63-bit, non-zero) and inserted
//! through the vacant-entry path, so a collision simply retries.
//!
//! ## Invariants
//! - A record is removed from the map before its completion runs, so a
//!   reentrant outbound call made from within a completion sees a clean
//!   registry, and each id completes at most once.
//! - Records remember which connection issued them, so a closing
//!   connection can reject exactly its own orphans.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;

use serde_json::value::RawValue;

use autorpc_wire::CallId;

use crate::conn::ConnectionId;
use crate::error::CallError;
use crate::error::RpcError;

/// Call ids fit in 63 bits so they survive peers that parse them into
/// signed integers.
const ID_MASK: u64 = u64::MAX >> 1;

/// How a pending call is completed.
pub(crate) enum Outcome {
    /// Return fragments from a successful response, not yet decoded.
    Returns(Vec<Box<RawValue>>),
    Failed(CallError),
}

/// The completion shim stored for one outbound call. Decodes the typed
/// returns and invokes the user's completion exactly once; the resolve
/// path reports decode or count mismatches back to the dispatch loop.
pub(crate) type CompleteFn =
    Box<dyn FnOnce(Outcome) -> std::result::Result<(), RpcError> + Send>;

pub(crate) struct PendingCall {
    pub(crate) conn: ConnectionId,
    complete: std::sync::Mutex<CompleteFn>,
}

impl PendingCall {
    fn into_complete(self) -> CompleteFn {
        self.complete
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Delivers return fragments to the completion. An error means the
    /// fragments did not match the expected returns; the completion has
    /// already been rejected with it.
    pub(crate) fn resolve(self, data: Vec<Box<RawValue>>) -> std::result::Result<(), RpcError> {
        (self.into_complete())(Outcome::Returns(data))
    }

    pub(crate) fn reject(self, error: CallError) {
        let _ = (self.into_complete())(Outcome::Failed(error));
    }
}

pub(crate) struct PendingCalls {
    entries: DashMap<CallId, PendingCall>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Allocates a fresh call id and registers the completion under it.
    pub(crate) fn register(&self, conn: ConnectionId, complete: CompleteFn) -> CallId {
        let mut rng = rand::thread_rng();
        loop {
            let id = CallId(rng.gen::<u64>() & ID_MASK);
            if id.0 == 0 {
                continue;
            }

            match self.entries.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(PendingCall {
                        conn,
                        complete: std::sync::Mutex::new(complete),
                    });
                    return id;
                }
            }
        }
    }

    /// Removes and returns the record for an id, freeing the id for reuse.
    pub(crate) fn take(&self, id: CallId) -> Option<PendingCall> {
        self.entries.remove(&id).map(|(_, record)| record)
    }

    /// Removes every record issued by the given connection.
    pub(crate) fn drain_connection(&self, conn: ConnectionId) -> Vec<PendingCall> {
        let ids: Vec<CallId> = self
            .entries
            .iter()
            .filter(|entry| entry.value().conn == conn)
            .map(|entry| *entry.key())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.entries.remove_if(&id, |_, record| record.conn == conn))
            .map(|(_, record)| record)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    fn noop() -> CompleteFn {
        Box::new(|_| Ok(()))
    }

    #[test]
    fn test_register_allocates_distinct_nonzero_ids() {
        let pending = PendingCalls::new();
        let conn = ConnectionId(1);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let id = pending.register(conn, noop());
            assert_ne!(id.0, 0);
            assert!(id.0 <= ID_MASK);
            assert!(seen.insert(id), "id {} allocated twice while pending", id);
        }
        assert_eq!(pending.len(), 64);
    }

    #[test]
    fn test_take_frees_id() {
        let pending = PendingCalls::new();
        let id = pending.register(ConnectionId(1), noop());

        assert!(pending.take(id).is_some());
        assert!(pending.take(id).is_none());
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_drain_connection_is_selective() {
        let pending = PendingCalls::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counting = |hits: Arc<AtomicUsize>| -> CompleteFn {
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        pending.register(ConnectionId(1), counting(hits.clone()));
        pending.register(ConnectionId(1), counting(hits.clone()));
        let survivor = pending.register(ConnectionId(2), counting(hits.clone()));

        let drained = pending.drain_connection(ConnectionId(1));
        assert_eq!(drained.len(), 2);
        for record in drained {
            record.reject(CallError::ConnectionClosed);
        }

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(pending.len(), 1);
        assert!(pending.take(survivor).is_some());
    }
}
