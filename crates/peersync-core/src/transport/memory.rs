//! In-process transport
//!
//! A [`MemoryNetwork`] connects any number of [`MemoryTransport`]s living in
//! the same process. Frames are moved between tasks through tokio channels,
//! keeping per-channel ordering. Faults can be injected per site to simulate
//! unreachable or refusing peers.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Channel, ChannelEvent, Direction, Transport, CHANNEL_CAPACITY};
use crate::error::SyncResult;
use crate::types::SiteId;

/// Injected failure for dials to one site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The dial never completes: no event is ever delivered
    Silent,
    /// The dial fails immediately
    Refuse,
}

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<SiteId, mpsc::Sender<Channel>>,
    faults: HashMap<SiteId, Fault>,
    dials: HashMap<SiteId, usize>,
    /// Event senders of silent dials per target, held so their channels stay pending
    parked: HashMap<SiteId, Vec<mpsc::Sender<ChannelEvent>>>,
}

/// Shared in-process mesh
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a site to the network
    pub fn transport(&self, id: SiteId) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.state.lock().listeners.insert(id, tx);
        MemoryTransport {
            id,
            network: self.clone(),
            inbound: tokio::sync::Mutex::new(rx),
        }
    }

    /// Inject a fault for dials to `id`, or clear it with `None`
    pub fn set_fault(&self, id: SiteId, fault: Option<Fault>) {
        let mut state = self.state.lock();
        match fault {
            Some(fault) => {
                state.faults.insert(id, fault);
            }
            None => {
                state.faults.remove(&id);
                state.parked.remove(&id);
            }
        }
    }

    /// Number of dials made to `id` so far
    pub fn dial_count(&self, id: &SiteId) -> usize {
        self.state.lock().dials.get(id).copied().unwrap_or(0)
    }

    /// Silent dials to `id` whose channel is still held by the dialer
    pub fn pending_dials(&self, id: &SiteId) -> usize {
        self.state
            .lock()
            .parked
            .get(id)
            .map_or(0, |parked| parked.iter().filter(|events| !events.is_closed()).count())
    }

    /// Detach a site: later dials to it fail
    pub fn remove(&self, id: &SiteId) {
        self.state.lock().listeners.remove(id);
    }

    async fn dial(&self, from: SiteId, to: SiteId) -> SyncResult<Channel> {
        let (local, local_out, local_events) = Channel::pair(to, Direction::Outbound);

        let listener = {
            let mut state = self.state.lock();
            *state.dials.entry(to).or_insert(0) += 1;

            match state.faults.get(&to).copied() {
                Some(Fault::Silent) => {
                    // Senders whose dialer dropped its channel are released
                    let parked = state.parked.entry(to).or_default();
                    parked.retain(|events| !events.is_closed());
                    parked.push(local_events);
                    return Ok(local);
                }
                Some(Fault::Refuse) => None,
                None => state.listeners.get(&to).cloned(),
            }
        };

        let Some(listener) = listener else {
            let _ = local_events
                .send(ChannelEvent::Error(format!("{} is unreachable", to.short())))
                .await;
            return Ok(local);
        };

        let (remote, remote_out, remote_events) = Channel::pair(from, Direction::Inbound);
        if listener.send(remote).await.is_err() {
            let _ = local_events
                .send(ChannelEvent::Error(format!("{} stopped listening", to.short())))
                .await;
            return Ok(local);
        }

        let _ = remote_events.send(ChannelEvent::Opened).await;
        let _ = local_events.send(ChannelEvent::Opened).await;

        tokio::spawn(pump(local_out, remote_events));
        tokio::spawn(pump(remote_out, local_events));

        Ok(local)
    }
}

/// Move frames from one side's outbound queue to the other side's events.
///
/// Ends with `Closed` once the sending side drops its queue. A receiver that
/// went away ends the pump, which drops the queue and closes the other
/// direction in turn.
async fn pump(mut frames: mpsc::Receiver<Bytes>, events: mpsc::Sender<ChannelEvent>) {
    while let Some(frame) = frames.recv().await {
        if events.send(ChannelEvent::Data(frame)).await.is_err() {
            return;
        }
    }
    let _ = events.send(ChannelEvent::Closed).await;
}

/// One site's attachment to a [`MemoryNetwork`]
pub struct MemoryTransport {
    id: SiteId,
    network: MemoryNetwork,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> SiteId {
        self.id
    }

    async fn connect(&self, peer: SiteId) -> SyncResult<Channel> {
        self.network.dial(self.id, peer).await
    }

    async fn accept(&self) -> Option<Channel> {
        self.inbound.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let network = MemoryNetwork::new();
        let (a_id, b_id) = (SiteId::random(), SiteId::random());
        let a = network.transport(a_id);
        let b = network.transport(b_id);

        let mut outbound = a.connect(b_id).await.unwrap();
        let mut inbound = b.accept().await.unwrap();
        assert_eq!(inbound.peer, a_id);
        assert_eq!(inbound.direction, Direction::Inbound);

        assert_eq!(outbound.events.recv().await, Some(ChannelEvent::Opened));
        assert_eq!(inbound.events.recv().await, Some(ChannelEvent::Opened));

        outbound.outbound.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(
            inbound.events.recv().await,
            Some(ChannelEvent::Data(Bytes::from_static(b"ping")))
        );

        inbound.outbound.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(
            outbound.events.recv().await,
            Some(ChannelEvent::Data(Bytes::from_static(b"pong")))
        );
    }

    #[tokio::test]
    async fn test_dropping_outbound_closes_remote() {
        let network = MemoryNetwork::new();
        let (a_id, b_id) = (SiteId::random(), SiteId::random());
        let a = network.transport(a_id);
        let b = network.transport(b_id);

        let outbound = a.connect(b_id).await.unwrap();
        let mut inbound = b.accept().await.unwrap();
        assert_eq!(inbound.events.recv().await, Some(ChannelEvent::Opened));

        drop(outbound);
        assert_eq!(inbound.events.recv().await, Some(ChannelEvent::Closed));
    }

    #[tokio::test]
    async fn test_unknown_peer_errors() {
        let network = MemoryNetwork::new();
        let a = network.transport(SiteId::random());

        let mut channel = a.connect(SiteId::random()).await.unwrap();
        assert!(matches!(channel.events.recv().await, Some(ChannelEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_faults() {
        let network = MemoryNetwork::new();
        let (a_id, b_id) = (SiteId::random(), SiteId::random());
        let a = network.transport(a_id);
        let _b = network.transport(b_id);

        network.set_fault(b_id, Some(Fault::Refuse));
        let mut refused = a.connect(b_id).await.unwrap();
        assert!(matches!(refused.events.recv().await, Some(ChannelEvent::Error(_))));

        network.set_fault(b_id, Some(Fault::Silent));
        let mut silent = a.connect(b_id).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), silent.events.recv()).await;
        assert!(waited.is_err());

        assert_eq!(network.dial_count(&b_id), 2);
    }

    #[tokio::test]
    async fn test_abandoned_silent_dials_are_released() {
        let network = MemoryNetwork::new();
        let (a_id, b_id) = (SiteId::random(), SiteId::random());
        let a = network.transport(a_id);
        network.set_fault(b_id, Some(Fault::Silent));

        for _ in 0..5 {
            drop(a.connect(b_id).await.unwrap());
        }
        let _held = a.connect(b_id).await.unwrap();

        assert_eq!(network.dial_count(&b_id), 6);
        assert_eq!(network.pending_dials(&b_id), 1);
        assert_eq!(network.state.lock().parked[&b_id].len(), 1);

        network.set_fault(b_id, None);
        assert_eq!(network.pending_dials(&b_id), 0);
    }
}
