//! Peer Storage - the peer table and per-peer cursors
//!
//! Records are keyed by site id bytes. Each record carries the order in which
//! the peer was first seen so listings keep insertion order.

use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::{Storage, COUNTERS_TABLE};
use crate::error::SyncError;
use crate::types::{PeerRecord, PeerUpdate, SiteId};

/// Table for peer records (key: site id bytes, value: serialized StoredPeer)
pub(crate) const PEERS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("peers");

const PEER_ORDER_KEY: &str = "peer_order";

#[derive(Debug, Serialize, Deserialize)]
struct StoredPeer {
    name: Option<String>,
    version: u64,
    last_seen: i64,
    order: u64,
}

impl StoredPeer {
    fn into_record(self, id: SiteId) -> PeerRecord {
        PeerRecord {
            id,
            name: self.name,
            version: self.version,
            last_seen: self.last_seen,
        }
    }
}

/// Merge `update` into the record for `id` inside an open write transaction,
/// creating the record if it doesn't exist.
pub(super) fn upsert_in(
    write_txn: &WriteTransaction,
    id: &SiteId,
    update: &PeerUpdate,
) -> Result<PeerRecord, SyncError> {
    let mut table = write_txn.open_table(PEERS_TABLE)?;

    let existing = match table.get(id.as_bytes().as_slice())? {
        Some(data) => Some(postcard::from_bytes::<StoredPeer>(data.value())?),
        None => None,
    };

    let (mut record, order) = match existing {
        Some(stored) => {
            let order = stored.order;
            (stored.into_record(*id), order)
        }
        None => {
            let mut counters = write_txn.open_table(COUNTERS_TABLE)?;
            let order = counters.get(PEER_ORDER_KEY)?.map(|v| v.value()).unwrap_or(0);
            counters.insert(PEER_ORDER_KEY, order + 1)?;
            (PeerRecord::new(*id), order)
        }
    };
    record.apply(update);

    let stored = StoredPeer {
        name: record.name.clone(),
        version: record.version,
        last_seen: record.last_seen,
        order,
    };
    let serialized = postcard::to_allocvec(&stored)?;
    table.insert(id.as_bytes().as_slice(), serialized.as_slice())?;

    Ok(record)
}

impl Storage {
    /// Merge a partial update into a peer's record, creating it if absent.
    ///
    /// The version never decreases. The local site can't be a peer of itself.
    pub fn upsert_peer(&self, id: &SiteId, update: &PeerUpdate) -> Result<PeerRecord, SyncError> {
        if *id == self.site_id() {
            return Err(SyncError::InvalidOperation(
                "cannot record the local site as a peer".to_string(),
            ));
        }

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let record = upsert_in(&write_txn, id, update)?;
        write_txn.commit()?;
        Ok(record)
    }

    /// Load a peer record by site id
    pub fn load_peer(&self, id: &SiteId) -> Result<Option<PeerRecord>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(PEERS_TABLE)?;

        if let Some(data) = table.get(id.as_bytes().as_slice())? {
            let stored: StoredPeer = postcard::from_bytes(data.value())?;
            Ok(Some(stored.into_record(*id)))
        } else {
            Ok(None)
        }
    }

    /// List all peers in the order they were first recorded
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(PEERS_TABLE)?;

        let mut peers = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let id = SiteId::from_slice(key.value())?;
            let stored: StoredPeer = postcard::from_bytes(value.value())?;
            peers.push((stored.order, stored.into_record(id)));
        }
        peers.sort_by_key(|(order, _)| *order);

        Ok(peers.into_iter().map(|(_, record)| record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_upsert_creates_with_defaults() {
        let (storage, _temp) = create_test_storage();
        let peer = SiteId::random();

        let record = storage.upsert_peer(&peer, &PeerUpdate::touch()).unwrap();
        assert_eq!(record.version, 0);
        assert!(record.name.is_none());

        let loaded = storage.load_peer(&peer).unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_upsert_keeps_max_version() {
        let (storage, _temp) = create_test_storage();
        let peer = SiteId::random();

        storage.upsert_peer(&peer, &PeerUpdate::version(7)).unwrap();
        let record = storage
            .upsert_peer(&peer, &PeerUpdate::version(4).with_name("phone"))
            .unwrap();

        assert_eq!(record.version, 7);
        assert_eq!(record.name.as_deref(), Some("phone"));
    }

    #[test]
    fn test_list_peers_in_insertion_order() {
        let (storage, _temp) = create_test_storage();
        let ids: Vec<SiteId> = (0..5).map(|_| SiteId::random()).collect();

        for id in &ids {
            storage.upsert_peer(id, &PeerUpdate::touch()).unwrap();
        }
        // Updating an early peer must not move it
        storage.upsert_peer(&ids[0], &PeerUpdate::version(3)).unwrap();

        let listed: Vec<SiteId> = storage.list_peers().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_local_site_is_not_a_peer() {
        let (storage, _temp) = create_test_storage();
        let local = storage.site_id();

        assert!(storage.upsert_peer(&local, &PeerUpdate::touch()).is_err());
        assert!(storage.list_peers().unwrap().is_empty());
    }
}
