//! Black-box two-peer sync tests, driven entirely in-process over an
//! in-memory duplex stream standing in for a real transport — the same
//! bridging idiom used to adapt a QUIC stream to `AsyncRead + AsyncWrite`
//! elsewhere in this codebase, just without the QUIC.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

use peervault_sync::config::PeerManagerConfig;
use peervault_sync::demo_support::{InMemoryBlobStore, InMemoryDocumentStore};
use peervault_sync::events::{EventBus, SessionEvent};
use peervault_sync::session::{SessionIdentity, SyncSession};
use peervault_sync::traits::BlobStore;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn identity(our: &str, peer: &str) -> SessionIdentity {
    SessionIdentity {
        our_node_id: our.to_string(),
        our_ticket: Some(format!("{our}@ticket")),
        our_hostname: Some(format!("{our}-host")),
        our_nickname: None,
        peer_node_id: peer.to_string(),
        peer_is_read_only: false,
    }
}

async fn wait_for<F: Fn(&SessionEvent) -> bool>(
    rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    matches: F,
) -> SessionEvent {
    timeout(TEST_TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("event bus closed before the expected event arrived");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for expected session event")
}

#[tokio::test]
async fn two_peers_exchange_updates_and_blobs_then_go_live() {
    let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);

    let doc_a = Arc::new(InMemoryDocumentStore::new("shared-vault"));
    let doc_b = Arc::new(InMemoryDocumentStore::new("shared-vault"));
    doc_a.apply_local_update(b"hello from a".to_vec());

    let blobs_a = Arc::new(InMemoryBlobStore::new());
    let blobs_b = Arc::new(InMemoryBlobStore::new());
    let blob_hash = blobs_a.insert_local(b"blob-bytes".to_vec(), Some("text/plain".into()));

    let config = Arc::new(PeerManagerConfig::default());
    let events_a: EventBus<SessionEvent> = EventBus::default();
    let events_b: EventBus<SessionEvent> = EventBus::default();
    let mut events_a_rx = events_a.subscribe();
    let mut events_b_rx = events_b.subscribe();

    let close_a = Arc::new(Notify::new());
    let close_b = Arc::new(Notify::new());
    let (_gossip_tx_a, gossip_rx_a) = mpsc::unbounded_channel();
    let (_gossip_tx_b, gossip_rx_b) = mpsc::unbounded_channel();

    let mut session_a = SyncSession::new(
        stream_a,
        identity("node-a", "node-b"),
        doc_a.clone(),
        Some(blobs_a.clone()),
        config.clone(),
        events_a.clone(),
        None,
        close_a.clone(),
        gossip_rx_a,
    );
    let mut session_b = SyncSession::new(
        stream_b,
        identity("node-b", "node-a"),
        doc_b.clone(),
        Some(blobs_b.clone()),
        config.clone(),
        events_b.clone(),
        None,
        close_b.clone(),
        gossip_rx_b,
    );

    let handle_a = tokio::spawn(async move { session_a.start_sync().await });
    let handle_b = tokio::spawn(async move { session_b.handle_incoming_sync().await });

    wait_for(&mut events_a_rx, |e| matches!(e, SessionEvent::SyncComplete { .. })).await;
    wait_for(&mut events_b_rx, |e| matches!(e, SessionEvent::SyncComplete { .. })).await;
    wait_for(&mut events_b_rx, |e| matches!(e, SessionEvent::BlobReceived { .. })).await;

    assert_eq!(doc_b.export_updates().await, b"hello from a".to_vec());
    assert_eq!(blobs_b.get(&blob_hash).await, Some(b"blob-bytes".to_vec()));

    close_a.notify_one();
    close_b.notify_one();
    timeout(TEST_TIMEOUT, handle_a).await.expect("session a did not stop in time").ok();
    timeout(TEST_TIMEOUT, handle_b).await.expect("session b did not stop in time").ok();
}

#[tokio::test]
async fn live_loop_relays_update_emitted_after_initial_sync() {
    let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);

    let doc_a = Arc::new(InMemoryDocumentStore::new("shared-vault"));
    let doc_b = Arc::new(InMemoryDocumentStore::new("shared-vault"));

    let config = Arc::new(PeerManagerConfig::default());
    let events_a: EventBus<SessionEvent> = EventBus::default();
    let events_b: EventBus<SessionEvent> = EventBus::default();
    let mut events_a_rx = events_a.subscribe();

    let close_a = Arc::new(Notify::new());
    let close_b = Arc::new(Notify::new());
    let (_gossip_tx_a, gossip_rx_a) = mpsc::unbounded_channel();
    let (_gossip_tx_b, gossip_rx_b) = mpsc::unbounded_channel();

    let mut session_a = SyncSession::new(
        stream_a,
        identity("node-a", "node-b"),
        doc_a.clone(),
        None,
        config.clone(),
        events_a.clone(),
        None,
        close_a.clone(),
        gossip_rx_a,
    );
    let mut session_b = SyncSession::new(
        stream_b,
        identity("node-b", "node-a"),
        doc_b.clone(),
        None,
        config.clone(),
        events_b.clone(),
        None,
        close_b.clone(),
        gossip_rx_b,
    );

    let handle_a = tokio::spawn(async move { session_a.start_sync().await });
    let handle_b = tokio::spawn(async move { session_b.handle_incoming_sync().await });

    // Wait for a's own state change to Live: its local-update subscription
    // is wired up just after, so this bounds the race against the push below.
    wait_for(&mut events_a_rx, |e| {
        matches!(e, SessionEvent::StateChange { state, .. } if *state == peervault_sync::events::SessionState::Live)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    doc_a.apply_local_update(b"live update".to_vec());

    timeout(Duration::from_secs(2), async {
        loop {
            if doc_b.export_updates().await == b"live update".to_vec() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("live update never arrived at b");

    close_a.notify_one();
    close_b.notify_one();
    timeout(TEST_TIMEOUT, handle_a).await.expect("session a did not stop in time").ok();
    timeout(TEST_TIMEOUT, handle_b).await.expect("session b did not stop in time").ok();
}

#[tokio::test]
async fn vault_mismatch_without_adoption_ends_the_session_in_error() {
    let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);

    let doc_a = Arc::new(InMemoryDocumentStore::new("vault-a"));
    let doc_b = Arc::new(InMemoryDocumentStore::new("vault-b"));

    let config = Arc::new(PeerManagerConfig::default());
    let events_a: EventBus<SessionEvent> = EventBus::default();
    let events_b: EventBus<SessionEvent> = EventBus::default();

    let close_a = Arc::new(Notify::new());
    let close_b = Arc::new(Notify::new());
    let (_gossip_tx_a, gossip_rx_a) = mpsc::unbounded_channel();
    let (_gossip_tx_b, gossip_rx_b) = mpsc::unbounded_channel();

    let mut session_a = SyncSession::new(
        stream_a,
        identity("node-a", "node-b"),
        doc_a,
        None,
        config.clone(),
        events_a,
        None,
        close_a,
        gossip_rx_a,
    );
    let mut session_b = SyncSession::new(
        stream_b,
        identity("node-b", "node-a"),
        doc_b,
        None,
        config,
        events_b,
        None,
        close_b,
        gossip_rx_b,
    );

    let handle_a = tokio::spawn(async move { session_a.start_sync().await });
    let handle_b = tokio::spawn(async move { session_b.handle_incoming_sync().await });

    let result_a = timeout(TEST_TIMEOUT, handle_a).await.expect("session a hung").unwrap();
    let result_b = timeout(TEST_TIMEOUT, handle_b).await.expect("session b hung").unwrap();

    assert!(result_a.is_err());
    assert!(result_b.is_err());
}
