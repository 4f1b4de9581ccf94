//! Connection manager
//!
//! Owns the table of live connections, one per peer. Each entry is either a
//! pending outbound attempt or an open connection:
//!
//! ```text
//!            get_or_connect(p)                 Opened within handshake timeout
//!  (none) ───────────────────▶ Connecting ─────────────────────────────────▶ Open
//!     ▲                            │                                          │
//!     │        timeout / error     │                  Closed / Error           │
//!     └────────────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Callers that ask for a peer while an attempt is in flight wait on that same
//! attempt, so concurrent requests never dial twice. When both sides dial each
//! other at once, both keep the connection initiated by the lower site id.
//!
//! Everything that happens on an open connection is reported as a
//! [`ConnectionEvent`] on a single queue, consumed by the orchestrator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::sync::protocol::{Message, WireMessage};
use crate::transport::{Channel, ChannelEvent, Direction, Transport};
use crate::types::SiteId;

/// Capacity of the queue from connections to the orchestrator
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Something that happened on an open connection
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A connection was registered and is ready for sending
    Opened(PeerConnection),
    /// A frame arrived from `peer`
    Frame { peer: SiteId, bytes: Bytes },
    /// The connection to `peer` closed or failed and its entry was removed
    Closed { peer: SiteId },
}

/// Sending half of an open connection
#[derive(Debug, Clone)]
pub struct PeerConnection {
    peer: SiteId,
    id: u64,
    direction: Direction,
    outbound: mpsc::Sender<Bytes>,
    send_timeout: Duration,
}

impl PeerConnection {
    pub fn peer(&self) -> SiteId {
        self.peer
    }

    /// Unique id of this connection within the manager
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Encode and queue a message for the peer
    pub async fn send(&self, message: Message) -> SyncResult<()> {
        let bytes = WireMessage::new(message).encode()?;
        self.outbound
            .send_timeout(Bytes::from(bytes), self.send_timeout)
            .await
            .map_err(|e| {
                SyncError::PeerConnection(format!("send to {} failed: {}", self.peer.short(), e))
            })
    }
}

impl PartialEq for PeerConnection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerConnection {}

#[derive(Debug, Clone)]
enum Attempt {
    Pending,
    Done(Option<PeerConnection>),
}

enum Slot {
    Connecting {
        attempt: u64,
        ready: watch::Receiver<Attempt>,
    },
    Open {
        conn: PeerConnection,
        reader: AbortHandle,
    },
}

struct Inner<T> {
    transport: Arc<T>,
    local: SiteId,
    handshake_timeout: Duration,
    send_timeout: Duration,
    table: Mutex<HashMap<SiteId, Slot>>,
    next_id: AtomicU64,
    events: mpsc::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
}

/// Table of live connections keyed by peer
pub struct ConnectionManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager and the queue its connection events are delivered on
    pub fn new(transport: Arc<T>, config: &SyncConfig) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let manager = Self {
            inner: Arc::new(Inner {
                local: transport.local_id(),
                transport,
                handshake_timeout: config.handshake_timeout,
                send_timeout: config.send_timeout,
                table: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events,
                shutdown: CancellationToken::new(),
            }),
        };
        (manager, events_rx)
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn local_id(&self) -> SiteId {
        self.inner.local
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lookup
    // ═══════════════════════════════════════════════════════════════════════

    /// Return the open connection to `peer`, dialing it if needed.
    ///
    /// Returns `None` if the attempt failed or timed out. Callers arriving
    /// while an attempt is in flight share its outcome.
    pub async fn get_or_connect(&self, peer: SiteId) -> Option<PeerConnection> {
        if peer == self.inner.local {
            warn!("Refusing to connect to the local site");
            return None;
        }
        if self.is_shut_down() {
            debug!(peer = %peer.short(), "Not connecting: manager is shut down");
            return None;
        }

        let ready = {
            let mut table = self.inner.table.lock();
            match table.get(&peer) {
                Some(Slot::Open { conn, .. }) => return Some(conn.clone()),
                Some(Slot::Connecting { ready, .. }) => ready.clone(),
                None => {
                    let attempt = self.next_id();
                    let (done, ready) = watch::channel(Attempt::Pending);
                    table.insert(
                        peer,
                        Slot::Connecting {
                            attempt,
                            ready: ready.clone(),
                        },
                    );
                    tokio::spawn(self.clone().run_outbound(peer, attempt, done));
                    ready
                }
            }
        };

        Self::wait_for(ready).await
    }

    async fn wait_for(mut ready: watch::Receiver<Attempt>) -> Option<PeerConnection> {
        let conn = match ready.wait_for(|state| matches!(state, Attempt::Done(_))).await {
            Ok(state) => match &*state {
                Attempt::Done(conn) => conn.clone(),
                Attempt::Pending => None,
            },
            Err(_) => None,
        };
        conn
    }

    /// The open connection to `peer`, without dialing
    pub fn get(&self, peer: &SiteId) -> Option<PeerConnection> {
        match self.inner.table.lock().get(peer) {
            Some(Slot::Open { conn, .. }) => Some(conn.clone()),
            _ => None,
        }
    }

    pub fn is_connected(&self, peer: &SiteId) -> bool {
        self.get(peer).is_some()
    }

    /// True if the table holds any entry for `peer`, pending or open
    pub fn has_entry(&self, peer: &SiteId) -> bool {
        self.inner.table.lock().contains_key(peer)
    }

    /// Peers with an open connection
    pub fn connected_peers(&self) -> Vec<SiteId> {
        self.inner
            .table
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open { .. }))
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.connected_peers().len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Handshake
    // ═══════════════════════════════════════════════════════════════════════

    async fn run_outbound(self, peer: SiteId, attempt: u64, done: watch::Sender<Attempt>) {
        let transport = self.inner.transport.clone();
        let handshake = tokio::time::timeout(self.inner.handshake_timeout, async {
            let mut channel = transport.connect(peer).await?;
            await_open(&mut channel).await?;
            Ok::<_, SyncError>(channel)
        });
        let opened = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                debug!(peer = %peer.short(), "Connection attempt cancelled");
                self.abandon(peer, attempt);
                done.send_replace(Attempt::Done(None));
                return;
            }
            opened = handshake => opened,
        };

        let conn = match opened {
            Ok(Ok(channel)) => self
                .register(channel)
                .or_else(|| self.abandon(peer, attempt)),
            Ok(Err(e)) => {
                warn!(peer = %peer.short(), error = %e, "Connection attempt failed");
                self.abandon(peer, attempt)
            }
            Err(_) => {
                let err = SyncError::HandshakeTimeout(peer);
                warn!(peer = %peer.short(), error = %err, "Connection attempt timed out");
                self.abandon(peer, attempt)
            }
        };

        done.send_replace(Attempt::Done(conn));
    }

    /// Register a channel opened by a remote peer. The handshake runs in the
    /// background under the same deadline as outbound attempts.
    pub fn accept_inbound(&self, channel: Channel) {
        if channel.peer == self.inner.local {
            warn!("Dropping inbound channel from the local site");
            return;
        }
        tokio::spawn(self.clone().run_inbound(channel));
    }

    async fn run_inbound(self, mut channel: Channel) {
        let peer = channel.peer;
        let handshake = tokio::time::timeout(self.inner.handshake_timeout, await_open(&mut channel));
        let opened = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return,
            opened = handshake => opened,
        };
        match opened {
            Ok(Ok(())) => {
                self.register(channel);
            }
            Ok(Err(e)) => warn!(peer = %peer.short(), error = %e, "Inbound handshake failed"),
            Err(_) => warn!(peer = %peer.short(), "Inbound handshake timed out"),
        }
    }

    /// Drop a failed attempt's entry, unless another connection took its place
    fn abandon(&self, peer: SiteId, attempt: u64) -> Option<PeerConnection> {
        let mut table = self.inner.table.lock();
        let (is_ours, open) = match table.get(&peer) {
            Some(Slot::Connecting { attempt: current, .. }) => (*current == attempt, None),
            Some(Slot::Open { conn, .. }) => (false, Some(conn.clone())),
            None => (false, None),
        };
        if is_ours {
            table.remove(&peer);
        }
        open
    }

    /// Whether `new` should replace `existing`.
    ///
    /// Both ends apply the same rule so they settle on the same connection.
    fn prefer_new(&self, existing: &PeerConnection, new: &PeerConnection) -> bool {
        let initiator = |conn: &PeerConnection| match conn.direction {
            Direction::Outbound => self.inner.local,
            Direction::Inbound => conn.peer,
        };
        let (old_initiator, new_initiator) = (initiator(existing), initiator(new));

        if old_initiator == new_initiator {
            // The peer dialed again: its previous connection is stale
            new.direction == Direction::Inbound
        } else {
            new_initiator < old_initiator
        }
    }

    /// Install an opened channel, returning the connection that ends up in
    /// the table for its peer.
    ///
    /// After shutdown the channel is dropped instead, which closes it.
    fn register(&self, channel: Channel) -> Option<PeerConnection> {
        let Channel {
            peer,
            direction,
            outbound,
            events,
        } = channel;
        let conn = PeerConnection {
            peer,
            id: self.next_id(),
            direction,
            outbound,
            send_timeout: self.inner.send_timeout,
        };

        let mut table = self.inner.table.lock();
        // Checked under the lock: shutdown cancels before draining the table
        if self.is_shut_down() {
            debug!(peer = %peer.short(), id = conn.id, "Dropping channel opened after shutdown");
            return None;
        }
        if let Some(Slot::Open {
            conn: existing,
            reader,
        }) = table.remove(&peer)
        {
            if !self.prefer_new(&existing, &conn) {
                debug!(
                    peer = %peer.short(),
                    kept = existing.id,
                    dropped = conn.id,
                    "Keeping existing connection"
                );
                let kept = existing.clone();
                table.insert(
                    peer,
                    Slot::Open {
                        conn: existing,
                        reader,
                    },
                );
                return Some(kept);
            }
            debug!(peer = %peer.short(), replaced = existing.id, "Replacing connection");
            reader.abort();
        }

        let reader = tokio::spawn(self.clone().read_loop(conn.clone(), events)).abort_handle();
        table.insert(
            peer,
            Slot::Open {
                conn: conn.clone(),
                reader,
            },
        );

        info!(peer = %peer.short(), ?direction, id = conn.id, "Connection open");
        Some(conn)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Open connections
    // ═══════════════════════════════════════════════════════════════════════

    async fn read_loop(self, conn: PeerConnection, mut events: mpsc::Receiver<ChannelEvent>) {
        let peer = conn.peer;
        let id = conn.id;
        // register() spawns this task while holding the table lock
        drop(self.inner.table.lock());
        if self.inner.events.send(ConnectionEvent::Opened(conn)).await.is_err() {
            self.remove_if_current(peer, id);
            return;
        }

        let error = loop {
            match events.recv().await {
                Some(ChannelEvent::Data(bytes)) => {
                    let event = ConnectionEvent::Frame { peer, bytes };
                    if self.inner.events.send(event).await.is_err() {
                        self.remove_if_current(peer, id);
                        return;
                    }
                }
                Some(ChannelEvent::Opened) => {}
                Some(ChannelEvent::Closed) | None => break None,
                Some(ChannelEvent::Error(e)) => break Some(e),
            }
        };

        match error {
            Some(e) => warn!(peer = %peer.short(), id, error = %e, "Connection failed"),
            None => info!(peer = %peer.short(), id, "Connection closed"),
        }

        if self.remove_if_current(peer, id) {
            let _ = self.inner.events.send(ConnectionEvent::Closed { peer }).await;
        }
    }

    fn remove_if_current(&self, peer: SiteId, id: u64) -> bool {
        let mut table = self.inner.table.lock();
        let is_current = matches!(table.get(&peer), Some(Slot::Open { conn, .. }) if conn.id == id);
        if is_current {
            table.remove(&peer);
        }
        is_current
    }

    /// Close the connection to `peer`, if any
    pub async fn close(&self, peer: &SiteId) {
        let removed = self.inner.table.lock().remove(peer);
        if let Some(Slot::Open { reader, .. }) = removed {
            reader.abort();
            info!(peer = %peer.short(), "Connection closed locally");
            let _ = self.inner.events.send(ConnectionEvent::Closed { peer: *peer }).await;
        }
    }

    /// Stop for good: fail pending attempts, refuse new connections and
    /// close every open one
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.close_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Close every connection and drop pending attempts
    pub fn close_all(&self) {
        let drained: Vec<Slot> = self.inner.table.lock().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            if let Slot::Open { reader, .. } = slot {
                reader.abort();
            }
        }
    }
}

/// Wait for the transport to acknowledge the channel
async fn await_open(channel: &mut Channel) -> SyncResult<()> {
    loop {
        match channel.events.recv().await {
            Some(ChannelEvent::Opened) => return Ok(()),
            Some(ChannelEvent::Data(_)) => {
                debug!(peer = %channel.peer.short(), "Dropping frame received before open");
            }
            Some(ChannelEvent::Closed) | None => {
                return Err(SyncError::PeerConnection(format!(
                    "{} closed before opening",
                    channel.peer.short()
                )))
            }
            Some(ChannelEvent::Error(e)) => return Err(SyncError::PeerConnection(e)),
        }
    }
}
