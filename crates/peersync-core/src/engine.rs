//! Main SyncEngine - the primary entry point for peersync
//!
//! SyncEngine coordinates Storage, IrohTransport and the SyncOrchestrator for:
//! - Persistent storage of the replica's cells and change log
//! - The directory of known peers and their cursors
//! - Periodic pull-based sync over direct QUIC connections
//!
//! # Example
//!
//! ```ignore
//! use peersync_core::{SyncConfig, SyncEngine, Value};
//!
//! let mut engine = SyncEngine::new(SyncConfig::default()).await?;
//!
//! // Local edits never wait on the network
//! engine.write_cell("workout", "w1", "title", Value::Text("Legs".into()))?;
//!
//! // Bind the endpoint and start the heartbeat
//! engine.start_networking().await?;
//! engine.add_peer(&peer_id, Some("laptop")).await?;
//! engine.trigger_sync_now().await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use iroh::EndpointAddr;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::storage::{Row, Storage};
use crate::store::StoreGate;
use crate::sync::{RoundSummary, SyncEvent, SyncOrchestrator};
use crate::transport::quic::IrohTransport;
use crate::types::{ChangeRecord, PeerRecord, PeerUpdate, SiteId, Value};

/// Networking half of the engine, present once started
struct Network {
    transport: Arc<IrohTransport>,
    orchestrator: SyncOrchestrator<Storage, IrohTransport>,
}

/// Main entry point for peersync
///
/// Opening the engine only opens the store, so local reads and edits work
/// offline. [`SyncEngine::start_networking`] binds the endpoint and starts
/// syncing with every peer in the directory.
pub struct SyncEngine {
    config: SyncConfig,
    storage: Arc<Storage>,
    network: Option<Network>,
}

impl SyncEngine {
    /// Open the store under `config.data_dir`
    pub async fn new(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;

        let storage = Storage::new(config.database_path())?;
        if let Some(name) = &config.device_name {
            storage.set_device_name(name)?;
        }

        info!(
            site = %storage.site_id().short(),
            data_dir = %config.data_dir.display(),
            "Opened replica"
        );

        Ok(Self {
            config,
            storage: Arc::new(storage),
            network: None,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn site_id(&self) -> SiteId {
        self.storage.site_id()
    }

    pub fn device_name(&self) -> SyncResult<String> {
        self.storage.device_name()
    }

    /// Change the name announced to peers. Takes effect from the next request.
    pub fn set_device_name(&self, name: &str) -> SyncResult<()> {
        self.storage.set_device_name(name)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local Data
    // ═══════════════════════════════════════════════════════════════════════

    pub fn write_cell(
        &self,
        table: &str,
        row: &str,
        column: &str,
        value: Value,
    ) -> SyncResult<ChangeRecord> {
        self.storage.write_cell(table, row, column, value)
    }

    pub fn write_row(
        &self,
        table: &str,
        row: &str,
        columns: &[(&str, Value)],
    ) -> SyncResult<Vec<ChangeRecord>> {
        self.storage.write_row(table, row, columns)
    }

    pub fn read_cell(&self, table: &str, row: &str, column: &str) -> SyncResult<Option<Value>> {
        self.storage.read_cell(table, row, column)
    }

    pub fn read_row(&self, table: &str, row: &str) -> SyncResult<BTreeMap<String, Value>> {
        self.storage.read_row(table, row)
    }

    pub fn list_rows(&self, table: &str) -> SyncResult<Vec<Row>> {
        self.storage.list_rows(table)
    }

    /// Changes authored by `origin` past `cursor`
    pub fn changes_since(&self, origin: &SiteId, cursor: u64) -> SyncResult<Vec<ChangeRecord>> {
        self.storage.changes_since(origin, cursor)
    }

    /// Changes this replica authored past `cursor`
    pub fn local_changes(&self, cursor: u64) -> SyncResult<Vec<ChangeRecord>> {
        self.storage.changes_since(&self.site_id(), cursor)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peers
    // ═══════════════════════════════════════════════════════════════════════

    /// Add a peer to the directory, or rename a known one
    pub async fn add_peer(&self, id: &SiteId, name: Option<&str>) -> SyncResult<PeerRecord> {
        let update = match name {
            Some(name) => PeerUpdate::name(name),
            None => PeerUpdate::touch(),
        };

        let record = match &self.network {
            Some(network) => network.orchestrator.directory().upsert(id, update).await?,
            None => self.storage.upsert_peer(id, &update)?,
        };
        info!(peer = %id.short(), name = %record.display_name(), "Peer added");
        Ok(record)
    }

    pub fn list_peers(&self) -> SyncResult<Vec<PeerRecord>> {
        self.storage.list_peers()
    }

    /// Cursor for `peer`, 0 if unknown
    pub fn peer_version(&self, peer: &SiteId) -> SyncResult<u64> {
        Ok(self.storage.load_peer(peer)?.map(|p| p.version).unwrap_or(0))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Networking
    // ═══════════════════════════════════════════════════════════════════════

    /// Bind the endpoint and start the orchestrator. Calling it again is a no-op.
    pub async fn start_networking(&mut self) -> SyncResult<()> {
        if self.network.is_some() {
            debug!("Networking already active");
            return Ok(());
        }

        let transport = Arc::new(
            IrohTransport::bind(self.storage.site_key(), self.config.max_frame_bytes).await?,
        );
        let orchestrator = SyncOrchestrator::new(
            StoreGate::ready(self.storage.clone()),
            transport.clone(),
            self.config.clone(),
        );
        orchestrator.directory().refresh().await?;
        orchestrator.start();

        self.network = Some(Network {
            transport,
            orchestrator,
        });
        info!(site = %self.site_id().short(), "Networking started");
        Ok(())
    }

    pub fn is_networking_active(&self) -> bool {
        self.network.is_some()
    }

    fn network(&self) -> SyncResult<&Network> {
        self.network
            .as_ref()
            .ok_or_else(|| SyncError::InvalidOperation("networking is not started".to_string()))
    }

    /// Our endpoint address, for sharing with peers out of band
    pub fn endpoint_addr(&self) -> SyncResult<EndpointAddr> {
        Ok(self.network()?.transport.endpoint_addr())
    }

    /// Register a direct address hint for a peer
    pub fn add_peer_addr(&self, addr: EndpointAddr) -> SyncResult<()> {
        self.network()?.transport.add_peer_addr(addr);
        Ok(())
    }

    /// Run one heartbeat round immediately
    pub async fn trigger_sync_now(&self) -> SyncResult<RoundSummary> {
        Ok(self.network()?.orchestrator.trigger_sync_now().await)
    }

    /// Subscribe to sync events
    pub fn subscribe_events(&self) -> SyncResult<broadcast::Receiver<SyncEvent>> {
        Ok(self.network()?.orchestrator.subscribe())
    }

    /// Subscribe to peer list snapshots
    pub fn subscribe_peers(&self) -> SyncResult<watch::Receiver<Vec<PeerRecord>>> {
        Ok(self.network()?.orchestrator.subscribe_peers())
    }

    /// Open connections, by peer
    pub fn connected_peers(&self) -> Vec<SiteId> {
        self.network
            .as_ref()
            .map(|n| n.orchestrator.connections().connected_peers())
            .unwrap_or_default()
    }

    /// Stop syncing and close the endpoint
    pub async fn shutdown(&mut self) {
        if let Some(network) = self.network.take() {
            network.orchestrator.shutdown();
            network.transport.shutdown().await;
            info!("Networking stopped");
        }
    }
}
