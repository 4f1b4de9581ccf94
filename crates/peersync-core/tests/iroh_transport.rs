//! QUIC transport tests
//!
//! Two real iroh endpoints on localhost, introduced through static discovery.
//! Every step runs under a timeout so a broken network setup fails instead of
//! hanging.

use std::time::Duration;

use bytes::Bytes;
use peersync_core::{
    Channel, ChannelEvent, Direction, IrohTransport, SiteKey, SyncConfig, Transport,
};

const STEP_TIMEOUT: Duration = Duration::from_secs(20);

async fn bind() -> (IrohTransport, SiteKey) {
    let key = SiteKey::generate();
    let transport = tokio::time::timeout(
        STEP_TIMEOUT,
        IrohTransport::bind(&key, SyncConfig::default().max_frame_bytes),
    )
    .await
    .expect("bind timed out")
    .expect("bind failed");
    (transport, key)
}

async fn next_event(channel: &mut Channel) -> Option<ChannelEvent> {
    tokio::time::timeout(STEP_TIMEOUT, channel.events.recv())
        .await
        .expect("timed out waiting for channel event")
}

#[tokio::test]
async fn test_frames_cross_a_quic_connection() {
    let (a, _) = bind().await;
    let (b, b_key) = bind().await;
    a.add_peer_addr(b.endpoint_addr());

    let mut outbound = a.connect(b_key.site_id()).await.unwrap();
    assert_eq!(outbound.direction, Direction::Outbound);
    assert_eq!(next_event(&mut outbound).await, Some(ChannelEvent::Opened));

    // The stream reaches the remote with its first frame
    outbound
        .outbound
        .send(Bytes::from_static(b"hello"))
        .await
        .unwrap();

    let mut inbound = tokio::time::timeout(STEP_TIMEOUT, b.accept())
        .await
        .expect("accept timed out")
        .expect("transport stopped");
    assert_eq!(inbound.peer, a.local_id());
    assert_eq!(inbound.direction, Direction::Inbound);
    assert_eq!(next_event(&mut inbound).await, Some(ChannelEvent::Opened));
    assert_eq!(
        next_event(&mut inbound).await,
        Some(ChannelEvent::Data(Bytes::from_static(b"hello")))
    );

    inbound
        .outbound
        .send(Bytes::from_static(b"world"))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut outbound).await,
        Some(ChannelEvent::Data(Bytes::from_static(b"world")))
    );

    // Dropping our sender finishes the stream; the remote sees it close
    drop(outbound.outbound);
    assert_eq!(next_event(&mut inbound).await, Some(ChannelEvent::Closed));

    a.shutdown().await;
    b.shutdown().await;
}
