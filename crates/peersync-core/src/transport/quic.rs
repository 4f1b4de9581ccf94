//! QUIC transport over iroh
//!
//! Each channel is one iroh connection carrying a single bidirectional
//! stream of length-delimited frames. The endpoint is bound with the site's
//! secret key, so a peer's [`SiteId`] is also the address we dial.

use std::future::Future;

use bytes::Bytes;
use futures::SinkExt;
use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, PublicKey};
use n0_future::StreamExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::{Channel, ChannelEvent, Direction, Transport, CHANNEL_CAPACITY};
use crate::error::{SyncError, SyncResult};
use crate::identity::SiteKey;
use crate::types::SiteId;

/// ALPN for the sync protocol
pub const SYNC_ALPN: &[u8] = b"/peersync/sync/1";

/// Transport over iroh QUIC connections
pub struct IrohTransport {
    endpoint: Endpoint,
    router: Router,
    static_provider: StaticProvider,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
    local_id: SiteId,
    max_frame_bytes: usize,
}

impl IrohTransport {
    /// Bind an endpoint with the site's key and start accepting sync connections
    pub async fn bind(key: &SiteKey, max_frame_bytes: usize) -> SyncResult<Self> {
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(key.secret_key())
            .alpns(vec![SYNC_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handler = SyncProtocolHandler {
            inbound: inbound_tx,
            max_frame_bytes,
        };
        let router = Router::builder(endpoint.clone())
            .accept(SYNC_ALPN, handler)
            .spawn();

        Ok(Self {
            endpoint,
            router,
            static_provider,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            local_id: key.site_id(),
            max_frame_bytes,
        })
    }

    /// Our address, for handing to peers out of band
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Add a peer's address to static discovery
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        info!(
            peer = %endpoint_addr.id,
            addrs = endpoint_addr.addrs.len(),
            "Adding peer address to static discovery"
        );
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    /// Stop accepting and close every connection
    pub async fn shutdown(&self) {
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Router shutdown failed");
        }
        self.endpoint.close().await;
    }
}

impl Transport for IrohTransport {
    fn local_id(&self) -> SiteId {
        self.local_id
    }

    fn connect(&self, peer: SiteId) -> impl Future<Output = SyncResult<Channel>> + Send {
        let endpoint = self.endpoint.clone();
        let max_frame_bytes = self.max_frame_bytes;

        async move {
            let public_key = PublicKey::from_bytes(peer.as_bytes())
                .map_err(|e| SyncError::InvalidSiteId(e.to_string()))?;
            let (channel, outbound_rx, events_tx) = Channel::pair(peer, Direction::Outbound);

            tokio::spawn(async move {
                debug!(peer = %peer.short(), "Dialing peer");
                let conn = match endpoint.connect(public_key, SYNC_ALPN).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = events_tx.send(ChannelEvent::Error(format!("connect: {}", e))).await;
                        return;
                    }
                };
                let (send, recv) = match conn.open_bi().await {
                    Ok(streams) => streams,
                    Err(e) => {
                        let _ = events_tx.send(ChannelEvent::Error(format!("open_bi: {}", e))).await;
                        return;
                    }
                };
                if events_tx.send(ChannelEvent::Opened).await.is_err() {
                    return;
                }
                run_stream(conn, send, recv, outbound_rx, events_tx, max_frame_bytes).await;
            });

            Ok(channel)
        }
    }

    async fn accept(&self) -> Option<Channel> {
        self.inbound.lock().await.recv().await
    }
}

/// Drive one stream until either side closes it
async fn run_stream(
    conn: Connection,
    send: SendStream,
    recv: RecvStream,
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<ChannelEvent>,
    max_frame_bytes: usize,
) {
    let codec = || {
        LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_bytes)
            .new_codec()
    };
    let mut writer = FramedWrite::new(send, codec());
    let mut reader = FramedRead::new(recv, codec());

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        let _ = events.send(ChannelEvent::Error(format!("write: {}", e))).await;
                        break;
                    }
                }
                None => {
                    // Local side is done with this channel
                    let _ = SinkExt::<Bytes>::close(&mut writer).await;
                    break;
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(frame)) => {
                    if events.send(ChannelEvent::Data(frame.freeze())).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let _ = events.send(ChannelEvent::Error(format!("read: {}", e))).await;
                    break;
                }
                None => {
                    let _ = events.send(ChannelEvent::Closed).await;
                    break;
                }
            },
        }
    }

    conn.close(0u32.into(), b"closed");
}

/// Router handler that turns accepted connections into inbound channels
#[derive(Debug, Clone)]
struct SyncProtocolHandler {
    inbound: mpsc::Sender<Channel>,
    max_frame_bytes: usize,
}

impl ProtocolHandler for SyncProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl Future<Output = Result<(), AcceptError>> + Send {
        let inbound = self.inbound.clone();
        let max_frame_bytes = self.max_frame_bytes;

        async move {
            let remote_id = conn.remote_id();
            debug!(peer = %remote_id, "Router accepting sync connection");

            let (send, recv) = conn.accept_bi().await.map_err(AcceptError::from_err)?;

            let peer = SiteId::from_bytes(*remote_id.as_bytes());
            let (channel, outbound_rx, events_tx) = Channel::pair(peer, Direction::Inbound);
            let _ = events_tx.send(ChannelEvent::Opened).await;

            if inbound.send(channel).await.is_err() {
                return Err(AcceptError::from_err(SyncError::Network(
                    "transport is shutting down".to_string(),
                )));
            }

            // The connection lives as long as this handler runs
            run_stream(conn, send, recv, outbound_rx, events_tx, max_frame_bytes).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_id_is_site_id() {
        let key = SiteKey::generate();
        let transport = IrohTransport::bind(&key, 1024).await.unwrap();

        assert_eq!(transport.local_id(), key.site_id());
        assert_eq!(transport.endpoint_addr().id.as_bytes(), key.site_id().as_bytes());

        transport.shutdown().await;
    }
}
