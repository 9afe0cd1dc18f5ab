//! Typed event channels replacing an ad-hoc string-keyed event bus.
//!
//! Each event kind is one variant of a flat enum, broadcast to every
//! subscriber; unsubscribe is simply dropping the receiver side.

use tokio::sync::broadcast;

use crate::peer_record::{KnownPeerAnnouncement, KnownPeerInfo, PeerState, Quality};

/// Events a [`crate::session::SyncSession`] emits about its own progress.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChange { node_id: String, state: SessionState },
    SyncComplete { node_id: String },
    SyncProgress(SyncProgress),
    TicketReceived { node_id: String, ticket: String },
    PeerInfo { node_id: String, hostname: Option<String>, nickname: Option<String> },
    PeerRemoved { node_id: String, reason: Option<String> },
    BlobReceived { node_id: String, hash: String },
    Error { node_id: String, message: String },
    /// A peer gossip fact arrived over this session's live loop. `node_id`
    /// is the session's own peer (the gossip's source), not the peer the
    /// announcement is about.
    PeerAnnouncement { node_id: String, announcement: KnownPeerAnnouncement },
    /// A ping/pong round trip completed.
    Rtt { node_id: String, rtt_ms: f64 },
    /// A ping went unanswered before the next ping was due.
    PingTimeout { node_id: String },
    /// A live-loop micro-batch of local updates was flushed to the peer.
    LiveUpdatesFlushed { node_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    ExchangingVersions,
    Syncing,
    Live,
    Error,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct SyncProgress {
    pub blobs_to_send: u64,
    pub blobs_sent: u64,
    pub blobs_to_receive: u64,
    pub blobs_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Events the peer manager emits to the host application.
#[derive(Debug, Clone)]
pub enum HostEvent {
    PeerConnected { node_id: String },
    PeerDisconnected { node_id: String, reason: Option<String> },
    PeerSynced { node_id: String },
    PeerError { node_id: String, error: String },
    PeerPairingRequest { node_id: String },
    PeerPairingAccepted { node_id: String },
    PeerPairingDenied { node_id: String },
    PeerDiscovered(KnownPeerInfo),
    PeerHealthChange { node_id: String, quality: Quality, previous_quality: Option<Quality> },
    VaultAdoptionRequest { node_id: String, peer_vault_id: String, our_vault_id: String },
    StatusChange(HostStatus),
    BlobReceived { hash: String },
    LiveUpdates,
    PeerStateChange { node_id: String, state: PeerState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Idle,
    Syncing,
    Offline,
    Error,
}

/// Broadcast channel pair for one event kind. Subscribers call
/// `subscribe()` and hold the receiver; dropping it unsubscribes.
#[derive(Debug, Clone)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Emits unconditionally; a send with no subscribers is a no-op.
    pub fn emit(&self, event: T) {
        let _ = self.sender.send(event);
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let bus: EventBus<HostEvent> = EventBus::default();
        bus.emit(HostEvent::LiveUpdates);
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus: EventBus<SessionEvent> = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(SessionEvent::SyncComplete {
            node_id: "n1".into(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::SyncComplete { node_id } if node_id == "n1"));
    }

    #[tokio::test]
    async fn dropping_receiver_unsubscribes() {
        let bus: EventBus<SessionEvent> = EventBus::default();
        let rx = bus.subscribe();
        drop(rx);
        bus.emit(SessionEvent::SyncComplete {
            node_id: "n1".into(),
        });
        // No subscribers remain; emit must not panic or block.
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus: EventBus<SessionEvent> = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.emit(SessionEvent::SyncComplete {
            node_id: "n1".into(),
        });
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }
}
