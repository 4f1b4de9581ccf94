//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - The site identity and device name
//! - The replicated dataset (column-level cells)
//! - The change log, keyed by origin and sequence number
//! - The peer table with per-peer cursors

use crate::error::SyncError;
use crate::identity::SiteKey;
use crate::store::LocalStore;
use crate::types::{ChangeRecord, PeerRecord, PeerUpdate, SiteId};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

// Submodules
mod cells;
mod peers;

use cells::{CELLS_TABLE, CHANGES_TABLE};
use peers::PEERS_TABLE;

pub use cells::Row;

// Table definitions
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const COUNTERS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
    site_key: SiteKey,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("site_id", &self.site_key.site_id())
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Site key storage key (there's only one identity per store)
    const SITE_KEY: &'static str = "site_key";
    const DEVICE_NAME_KEY: &'static str = "device_name";

    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file and all tables
    /// - Load the site identity, generating one on first open
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(COUNTERS_TABLE)?;
            let _ = write_txn.open_table(CELLS_TABLE)?;
            let _ = write_txn.open_table(CHANGES_TABLE)?;
            let _ = write_txn.open_table(PEERS_TABLE)?;
        }
        write_txn.commit()?;

        let site_key = Self::load_or_create_site_key(&db)?;
        tracing::debug!(site = %site_key.site_id().short(), "Storage opened");

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            site_key,
        })
    }

    fn load_or_create_site_key(db: &Database) -> Result<SiteKey, SyncError> {
        let write_txn = db.begin_write()?;
        let key = {
            let mut table = write_txn.open_table(META_TABLE)?;
            let existing = match table.get(Self::SITE_KEY)? {
                Some(v) => {
                    let bytes: [u8; 32] = v.value().try_into().map_err(|_| {
                        SyncError::Storage("stored site key has wrong length".to_string())
                    })?;
                    Some(SiteKey::from_bytes(bytes))
                }
                None => None,
            };
            match existing {
                Some(key) => key,
                None => {
                    let key = SiteKey::generate();
                    table.insert(Self::SITE_KEY, key.to_bytes().as_slice())?;
                    tracing::info!(site = %key.site_id(), "Generated new site identity");
                    key
                }
            }
        };
        write_txn.commit()?;
        Ok(key)
    }

    /// Shared handle to the database, for the per-table submodules
    pub(crate) fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }

    /// This replica's site id
    pub fn site_id(&self) -> SiteId {
        self.site_key.site_id()
    }

    /// This replica's identity, for binding a transport
    pub fn site_key(&self) -> &SiteKey {
        &self.site_key
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Device Name
    // ═══════════════════════════════════════════════════════════════════════

    /// The name announced to peers. Defaults to `peer-<short site id>`.
    pub fn device_name(&self) -> Result<String, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;

        match table.get(Self::DEVICE_NAME_KEY)? {
            Some(v) => String::from_utf8(v.value().to_vec())
                .map_err(|e| SyncError::Serialization(e.to_string())),
            None => Ok(format!("peer-{}", self.site_id().short())),
        }
    }

    /// Persist the name announced to peers
    pub fn set_device_name(&self, name: &str) -> Result<(), SyncError> {
        if name.trim().is_empty() {
            return Err(SyncError::InvalidOperation(
                "device name cannot be empty".to_string(),
            ));
        }

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(Self::DEVICE_NAME_KEY, name.as_bytes())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Merge
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply a batch of remote changes and raise the given cursors, all in one
    /// transaction.
    ///
    /// Returns the number of cells whose value changed. If any change is
    /// invalid the transaction is dropped uncommitted and nothing from the
    /// batch, cursors included, becomes visible.
    pub fn apply_changes_atomic(
        &self,
        changes: &[ChangeRecord],
        cursors: &[(SiteId, u64)],
    ) -> Result<usize, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let updated = cells::merge_changes(&write_txn, changes)?;
        for (site, version) in cursors {
            peers::upsert_in(&write_txn, site, &PeerUpdate::version(*version))?;
        }
        write_txn.commit()?;
        Ok(updated)
    }
}

impl LocalStore for Storage {
    fn site_id(&self) -> SiteId {
        Storage::site_id(self)
    }

    fn device_name(&self) -> Result<String, SyncError> {
        Storage::device_name(self)
    }

    fn peer_version(&self, peer: &SiteId) -> Result<u64, SyncError> {
        Ok(self.load_peer(peer)?.map(|p| p.version).unwrap_or(0))
    }

    fn list_peers(&self) -> Result<Vec<PeerRecord>, SyncError> {
        Storage::list_peers(self)
    }

    fn changes_since(&self, origin: &SiteId, cursor: u64) -> Result<Vec<ChangeRecord>, SyncError> {
        Storage::changes_since(self, origin, cursor)
    }

    fn apply_changes_atomic(
        &self,
        changes: &[ChangeRecord],
        cursors: &[(SiteId, u64)],
    ) -> Result<usize, SyncError> {
        Storage::apply_changes_atomic(self, changes, cursors)
    }

    fn upsert_peer(&self, id: &SiteId, update: &PeerUpdate) -> Result<PeerRecord, SyncError> {
        Storage::upsert_peer(self, id, update)
    }
}
