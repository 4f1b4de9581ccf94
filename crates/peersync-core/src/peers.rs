//! Peer directory: an observable mirror of the store's peer table
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  upsert(id, PeerUpdate)                                          │
//! │  1. Await the store gate                                         │
//! │  2. Merge the update into the stored record (version = max)      │
//! │  3. Re-read the peer table                                       │
//! │  4. Publish the snapshot to every subscriber                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads go straight to the store; the watch channel only carries snapshots
//! for observers such as a UI.

use tokio::sync::watch;

use crate::error::SyncResult;
use crate::store::{LocalStore, StoreGate};
use crate::types::{PeerRecord, PeerUpdate, SiteId};

/// Observable view of the known peers
pub struct PeerDirectory<S> {
    store: StoreGate<S>,
    snapshot: watch::Sender<Vec<PeerRecord>>,
}

impl<S> Clone for PeerDirectory<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

impl<S: LocalStore> PeerDirectory<S> {
    pub fn new(store: StoreGate<S>) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self { store, snapshot }
    }

    /// All known peers, in store order
    pub async fn list_peers(&self) -> SyncResult<Vec<PeerRecord>> {
        self.store.wait().await?.list_peers()
    }

    /// Cursor for `id`, 0 if the peer is unknown
    pub async fn version(&self, id: &SiteId) -> SyncResult<u64> {
        self.store.wait().await?.peer_version(id)
    }

    /// Merge `update` into the peer's record and publish a fresh snapshot
    pub async fn upsert(&self, id: &SiteId, update: PeerUpdate) -> SyncResult<PeerRecord> {
        let store = self.store.wait().await?;
        let record = store.upsert_peer(id, &update)?;
        tracing::debug!(peer = %id.short(), version = record.version, "Peer record updated");
        self.publish(store.list_peers()?);
        Ok(record)
    }

    /// Re-read the store and publish a snapshot
    pub async fn refresh(&self) -> SyncResult<()> {
        let peers = self.list_peers().await?;
        self.publish(peers);
        Ok(())
    }

    /// Subscribe to peer list snapshots
    pub fn subscribe(&self) -> watch::Receiver<Vec<PeerRecord>> {
        self.snapshot.subscribe()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.snapshot.borrow().clone()
    }

    fn publish(&self, peers: Vec<PeerRecord>) {
        // send_replace keeps the value even with no live receivers
        self.snapshot.send_replace(peers);
    }
}
