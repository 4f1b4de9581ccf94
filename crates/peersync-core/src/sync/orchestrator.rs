//! Sync orchestrator
//!
//! Drives the heartbeat, issues requests, interprets inbound messages and
//! commits their results through the store and the peer directory.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncOrchestrator                                                │
//! │  ├── heartbeat: one pending timer                               │
//! │  │   └── broadcast() → sync_peer(id) per peer, each in a task   │
//! │  ├── dispatch: one task consuming ConnectionEvents              │
//! │  │   ├── Opened  → record peer, send request                    │
//! │  │   ├── Frame   → changes / request / name                     │
//! │  │   └── Closed  → peer back to Idle                            │
//! │  ├── accept: inbound channels → ConnectionManager               │
//! │  └── event_tx: broadcast::Sender<SyncEvent>                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failure while syncing one peer is logged and counted in the round
//! summary. It never stops the heartbeat or delays the other peers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionEvent, ConnectionManager, PeerConnection};
use super::events::{PeerSyncState, RoundSummary, SyncEvent};
use super::merge::merge_batch;
use super::protocol::{Message, SyncRequest, WireMessage};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::peers::PeerDirectory;
use crate::store::{LocalStore, StoreGate};
use crate::transport::Transport;
use crate::types::{ChangeRecord, PeerRecord, PeerUpdate, SiteId};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Inner<S, T> {
    store: StoreGate<S>,
    directory: PeerDirectory<S>,
    connections: ConnectionManager<T>,
    config: SyncConfig,
    states: RwLock<HashMap<SiteId, PeerSyncState>>,
    event_tx: broadcast::Sender<SyncEvent>,
    connection_events: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Coordinates sync with every known peer
///
/// # Example
///
/// ```ignore
/// let orchestrator = SyncOrchestrator::new(store, transport, config);
/// let mut events = orchestrator.subscribe();
/// orchestrator.start();
///
/// while let Ok(event) = events.recv().await {
///     if let SyncEvent::ChangesApplied { from, .. } = event {
///         println!("dataset changed by {}", from.short());
///     }
/// }
/// ```
pub struct SyncOrchestrator<S, T> {
    inner: Arc<Inner<S, T>>,
}

impl<S, T> Clone for SyncOrchestrator<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: LocalStore, T: Transport> SyncOrchestrator<S, T> {
    pub fn new(store: StoreGate<S>, transport: Arc<T>, config: SyncConfig) -> Self {
        let (connections, connection_events) = ConnectionManager::new(transport, &config);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                directory: PeerDirectory::new(store.clone()),
                store,
                connections,
                config,
                states: RwLock::new(HashMap::new()),
                event_tx,
                connection_events: Mutex::new(Some(connection_events)),
                heartbeat: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn local_id(&self) -> SiteId {
        self.inner.connections.local_id()
    }

    pub fn directory(&self) -> &PeerDirectory<S> {
        &self.inner.directory
    }

    pub fn connections(&self) -> &ConnectionManager<T> {
        &self.inner.connections
    }

    /// Subscribe to sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Subscribe to peer list snapshots
    pub fn subscribe_peers(&self) -> watch::Receiver<Vec<PeerRecord>> {
        self.inner.directory.subscribe()
    }

    /// Request state of `peer`. An expired request reads as Idle.
    pub fn sync_state(&self, peer: &SiteId) -> PeerSyncState {
        self.inner
            .states
            .read()
            .get(peer)
            .copied()
            .unwrap_or_default()
            .expire(Instant::now(), self.inner.config.request_timeout)
    }

    fn set_state(&self, peer: SiteId, state: PeerSyncState) {
        self.inner.states.write().insert(peer, state);
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Spawn the dispatch and accept loops and start the heartbeat.
    ///
    /// The loops are spawned once; calling this again only restarts the heartbeat.
    pub fn start(&self) {
        if let Some(events) = self.inner.connection_events.lock().take() {
            let dispatch = tokio::spawn(self.clone().dispatch_loop(events));
            let accept = tokio::spawn(self.clone().accept_loop());
            self.inner.tasks.lock().extend([dispatch, accept]);
            info!(site = %self.local_id().short(), "Sync orchestrator started");
        }
        self.start_heartbeat();
    }

    /// Cancel any pending heartbeat and start a new one.
    ///
    /// The first round runs immediately; the next is scheduled
    /// `heartbeat_interval` after each round completes.
    ///
    /// Aborting a heartbeat mid-round also aborts that round's peer tasks.
    pub fn start_heartbeat(&self) {
        if self.is_shut_down() {
            warn!("Not starting heartbeat: orchestrator is shut down");
            return;
        }

        let mut heartbeat = self.inner.heartbeat.lock();
        if let Some(previous) = heartbeat.take() {
            previous.abort();
        }

        let this = self.clone();
        let interval = self.inner.config.heartbeat_interval;
        *heartbeat = Some(tokio::spawn(async move {
            loop {
                this.broadcast().await;
                tokio::time::sleep(interval).await;
            }
        }));
        debug!(?interval, "Heartbeat armed");
    }

    /// Stop all tasks and close every connection.
    ///
    /// Tasks spawned for a round or a send stop at their next suspension
    /// point, and no connection is registered afterwards.
    pub fn shutdown(&self) {
        info!("Shutting down sync orchestrator");
        self.inner.shutdown.cancel();
        if let Some(heartbeat) = self.inner.heartbeat.lock().take() {
            heartbeat.abort();
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.connections.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wrap `task` so that it is dropped when the orchestrator shuts down
    fn until_shutdown<F: Future>(&self, task: F) -> impl Future<Output = Option<F::Output>> {
        let shutdown = self.inner.shutdown.clone();
        async move {
            tokio::select! {
                _ = shutdown.cancelled() => None,
                output = task => Some(output),
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Heartbeat
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one round immediately
    pub async fn trigger_sync_now(&self) -> RoundSummary {
        self.broadcast().await
    }

    /// Send a request to every known peer.
    ///
    /// Each peer is synced in its own task so an error, panic or stall for one
    /// peer can't affect the others. Dropping the round aborts those tasks.
    pub async fn broadcast(&self) -> RoundSummary {
        let peers = match self.inner.directory.list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "Skipping heartbeat round: peer list unavailable");
                return RoundSummary::default();
            }
        };

        let local = self.local_id();
        let mut round = JoinSet::new();
        let mut summary = RoundSummary::default();
        for peer in peers.into_iter().filter(|peer| peer.id != local) {
            let this = self.clone();
            round.spawn(self.until_shutdown(async move {
                (peer.id, this.sync_peer(peer.id).await)
            }));
            summary.attempted += 1;
        }

        while let Some(result) = round.join_next().await {
            match result {
                Ok(Some((_, Ok(())))) => summary.succeeded += 1,
                Ok(Some((peer, Err(e)))) => {
                    debug!(peer = %peer.short(), error = %e, "Peer skipped this round");
                    summary.failed += 1;
                }
                Ok(None) => {
                    debug!("Sync task cancelled by shutdown");
                    summary.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Sync task failed");
                    summary.failed += 1;
                }
            }
        }

        debug!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Heartbeat round complete"
        );
        self.emit(SyncEvent::RoundCompleted(summary));
        summary
    }

    /// Send `{request: cursor, name}` to `peer`, connecting first if needed
    pub async fn sync_peer(&self, peer: SiteId) -> SyncResult<()> {
        let conn = self
            .inner
            .connections
            .get_or_connect(peer)
            .await
            .ok_or_else(|| SyncError::PeerConnection(format!("{} is unreachable", peer.short())))?;

        let request = self.build_request(&peer).await?;
        let version = request.request.map(|r| r.version).unwrap_or(0);
        conn.send(request).await?;
        self.set_state(
            peer,
            PeerSyncState::RequestSent {
                version,
                since: Instant::now(),
            },
        );
        debug!(peer = %peer.short(), version, "Sent sync request");
        Ok(())
    }

    async fn build_request(&self, peer: &SiteId) -> SyncResult<Message> {
        let store = self.inner.store.wait().await?;
        let version = store.peer_version(peer)?;
        let name = store.device_name()?;
        Ok(Message::request(version).with_name(name))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Dispatch
    // ═══════════════════════════════════════════════════════════════════════

    async fn accept_loop(self) {
        let transport = self.inner.connections.transport().clone();
        while let Some(channel) = transport.accept().await {
            debug!(peer = %channel.peer.short(), "Inbound channel");
            self.inner.connections.accept_inbound(channel);
        }
        debug!("Transport stopped accepting");
    }

    async fn dispatch_loop(self, mut events: mpsc::Receiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Opened(conn) => self.on_opened(conn).await,
                ConnectionEvent::Frame { peer, bytes } => self.on_frame(peer, bytes).await,
                ConnectionEvent::Closed { peer } => {
                    self.inner.states.write().remove(&peer);
                    self.emit(SyncEvent::PeerDisconnected { peer });
                }
            }
        }
    }

    /// A connection opened: record the peer and start a data exchange
    async fn on_opened(&self, conn: PeerConnection) {
        let peer = conn.peer();
        if let Err(e) = self.inner.directory.upsert(&peer, PeerUpdate::touch()).await {
            warn!(peer = %peer.short(), error = %e, "Failed to record peer");
        }
        self.emit(SyncEvent::PeerConnected {
            peer,
            direction: conn.direction(),
        });

        match self.build_request(&peer).await {
            Ok(request) => {
                let version = request.request.map(|r| r.version).unwrap_or(0);
                self.set_state(
                    peer,
                    PeerSyncState::RequestSent {
                        version,
                        since: Instant::now(),
                    },
                );
                self.spawn_send(conn, request);
            }
            Err(e) => warn!(peer = %peer.short(), error = %e, "Failed to build sync request"),
        }
    }

    async fn on_frame(&self, peer: SiteId, bytes: Bytes) {
        let message = match WireMessage::decode(&bytes) {
            Ok(wire) => wire.into_inner(),
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, len = bytes.len(), "Dropping undecodable frame");
                return;
            }
        };
        if message.is_empty() {
            debug!(peer = %peer.short(), "Ignoring empty message");
            return;
        }

        let store = match self.inner.store.wait().await {
            Ok(store) => store,
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "Dropping message: store unavailable");
                return;
            }
        };

        let Message {
            changes,
            request,
            name,
        } = message;

        if let Some(changes) = changes {
            self.handle_changes(&*store, peer, changes).await;
        }
        if let Some(request) = request {
            self.handle_request(&*store, peer, request);
        }
        if let Some(name) = name {
            if let Err(e) = self.inner.directory.upsert(&peer, PeerUpdate::name(name)).await {
                warn!(peer = %peer.short(), error = %e, "Failed to record peer name");
            }
        }
    }

    async fn handle_changes(&self, store: &S, peer: SiteId, changes: Vec<ChangeRecord>) {
        self.set_state(peer, PeerSyncState::Idle);
        let received = changes.len();

        match merge_batch(store, changes) {
            Ok(outcome) => {
                if outcome.applied == 0 {
                    debug!(peer = %peer.short(), received, "Nothing to merge");
                    return;
                }
                info!(
                    peer = %peer.short(),
                    changes = outcome.applied,
                    updated = outcome.updated,
                    "Applied changes"
                );
                if let Err(e) = self.inner.directory.refresh().await {
                    warn!(error = %e, "Failed to refresh peer directory");
                }
                self.emit(SyncEvent::ChangesApplied {
                    from: peer,
                    changes: outcome.applied,
                    updated: outcome.updated,
                    cursors: outcome.cursors,
                });
            }
            Err(e) => {
                warn!(peer = %peer.short(), received, error = %e, "Rejected change batch");
                self.emit(SyncEvent::MergeRejected {
                    from: peer,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Answer with our own changes past the requested cursor
    fn handle_request(&self, store: &S, peer: SiteId, request: SyncRequest) {
        let Some(conn) = self.inner.connections.get(&peer) else {
            debug!(peer = %peer.short(), "Request from a peer with no open connection");
            return;
        };

        match store.changes_since(&store.site_id(), request.version) {
            Ok(changes) => {
                debug!(
                    peer = %peer.short(),
                    since = request.version,
                    changes = changes.len(),
                    "Answering sync request"
                );
                self.spawn_send(conn, Message::changes(changes));
            }
            Err(e) => warn!(peer = %peer.short(), error = %e, "Failed to read changes"),
        }
    }

    /// Queue a message without holding up the dispatch loop
    fn spawn_send(&self, conn: PeerConnection, message: Message) {
        tokio::spawn(self.until_shutdown(async move {
            if let Err(e) = conn.send(message).await {
                warn!(peer = %conn.peer().short(), error = %e, "Send failed");
            }
        }));
    }
}
