//! Point-to-point transports
//!
//! A transport hands out [`Channel`]s: an ordered, reliable, bidirectional
//! frame stream to one peer, plus the lifecycle events of that stream. The
//! sync layer never sees anything below this interface.
//!
//! Two implementations ship with the crate:
//! - [`quic::IrohTransport`] - QUIC connections between sites
//! - [`memory::MemoryNetwork`] - an in-process mesh with fault injection

use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::SyncResult;
use crate::types::SiteId;

pub mod quic;
pub mod memory;

/// Capacity of the per-channel frame and event queues
pub(crate) const CHANNEL_CAPACITY: usize = 64;

/// Who opened a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer
    Outbound,
    /// The peer dialed us
    Inbound,
}

/// Lifecycle and data events of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The transport acknowledged the channel as open
    Opened,
    /// One frame from the peer
    Data(Bytes),
    /// The channel was closed cleanly
    Closed,
    /// The channel failed
    Error(String),
}

/// One channel to a peer.
///
/// Frames queued on `outbound` are delivered in order. Dropping every clone of
/// `outbound` closes the channel.
#[derive(Debug)]
pub struct Channel {
    pub peer: SiteId,
    pub direction: Direction,
    pub outbound: mpsc::Sender<Bytes>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

impl Channel {
    /// Create both ends of a channel's queues. The returned halves are the
    /// transport side: the receiver for outbound frames and the sender for events.
    pub(crate) fn pair(
        peer: SiteId,
        direction: Direction,
    ) -> (Self, mpsc::Receiver<Bytes>, mpsc::Sender<ChannelEvent>) {
        let (outbound, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                peer,
                direction,
                outbound,
                events,
            },
            outbound_rx,
            events_tx,
        )
    }
}

/// Source of channels to peers, keyed by site id
pub trait Transport: Send + Sync + 'static {
    /// Our own site id on this transport
    fn local_id(&self) -> SiteId;

    /// Start dialing `peer`.
    ///
    /// Returns as soon as the attempt is under way. Whether it succeeded is
    /// reported later through [`ChannelEvent::Opened`] or [`ChannelEvent::Error`].
    fn connect(&self, peer: SiteId) -> impl Future<Output = SyncResult<Channel>> + Send;

    /// Next channel opened by a remote peer. `None` once the transport is shut down.
    fn accept(&self) -> impl Future<Output = Option<Channel>> + Send;
}
