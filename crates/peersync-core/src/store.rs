//! The local store as seen by the sync layer
//!
//! [`LocalStore`] is everything the orchestrator needs from the replica's
//! database. [`StoreGate`] lets the sync layer be constructed before the store
//! has finished opening; every store-dependent call awaits it.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{SyncError, SyncResult};
use crate::types::{ChangeRecord, PeerRecord, PeerUpdate, SiteId};

/// Operations the sync layer performs against the local replica
pub trait LocalStore: Send + Sync + 'static {
    /// This replica's site id
    fn site_id(&self) -> SiteId;

    /// Name announced to peers
    fn device_name(&self) -> SyncResult<String>;

    /// Cursor for `peer`, 0 if the peer is unknown
    fn peer_version(&self, peer: &SiteId) -> SyncResult<u64>;

    /// All known peers, in store order
    fn list_peers(&self) -> SyncResult<Vec<PeerRecord>>;

    /// Changes authored by `origin` with `db_version > cursor`
    fn changes_since(&self, origin: &SiteId, cursor: u64) -> SyncResult<Vec<ChangeRecord>>;

    /// Apply `changes` and raise each `(origin, version)` cursor in one
    /// transaction. On error nothing is applied.
    fn apply_changes_atomic(
        &self,
        changes: &[ChangeRecord],
        cursors: &[(SiteId, u64)],
    ) -> SyncResult<usize>;

    /// Merge a partial update into a peer's record
    fn upsert_peer(&self, id: &SiteId, update: &PeerUpdate) -> SyncResult<PeerRecord>;
}

/// Write half of a [`StoreGate`]. Dropping it unopened fails every waiter.
pub struct StoreOpener<S> {
    tx: watch::Sender<Option<Arc<S>>>,
}

impl<S> StoreOpener<S> {
    /// Open the gate
    pub fn ready(self, store: Arc<S>) {
        self.tx.send_replace(Some(store));
    }
}

/// One-shot readiness gate for the local store
pub struct StoreGate<S> {
    rx: watch::Receiver<Option<Arc<S>>>,
}

impl<S> Clone for StoreGate<S> {
    fn clone(&self) -> Self {
        Self { rx: self.rx.clone() }
    }
}

impl<S> StoreGate<S> {
    /// A gate that is already open
    pub fn ready(store: Arc<S>) -> Self {
        let (_tx, rx) = watch::channel(Some(store));
        Self { rx }
    }

    /// A closed gate and the opener that will open it
    pub fn pending() -> (StoreOpener<S>, Self) {
        let (tx, rx) = watch::channel(None);
        (StoreOpener { tx }, Self { rx })
    }

    /// The store, if the gate is already open
    pub fn try_get(&self) -> Option<Arc<S>> {
        self.rx.borrow().clone()
    }

    /// Wait until the store is ready
    pub async fn wait(&self) -> SyncResult<Arc<S>> {
        let mut rx = self.rx.clone();
        let guard = rx
            .wait_for(|store| store.is_some())
            .await
            .map_err(|_| SyncError::StoreUnavailable)?;
        guard.clone().ok_or(SyncError::StoreUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ready_gate_resolves_immediately() {
        let gate = StoreGate::ready(Arc::new(7u32));
        assert_eq!(*gate.wait().await.unwrap(), 7);
        assert!(gate.try_get().is_some());
    }

    #[tokio::test]
    async fn test_pending_gate_waits_for_opener() {
        let (opener, gate) = StoreGate::<u32>::pending();
        assert!(gate.try_get().is_none());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        opener.ready(Arc::new(42));
        assert_eq!(*waiter.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_dropped_opener_fails_waiters() {
        let (opener, gate) = StoreGate::<u32>::pending();
        drop(opener);
        assert!(matches!(gate.wait().await, Err(SyncError::StoreUnavailable)));
    }
}
