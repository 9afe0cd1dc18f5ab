//! Owns the set of known peers, active sessions, discovery/tombstone
//! state, and every periodic timer. Mediates between the transport and
//! sync sessions, and enforces pairing/rate-limit policy.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PeerManagerConfig;
use crate::error::SyncError;
use crate::events::{EventBus, HostEvent, HostStatus, SessionEvent, SessionState};
use crate::gossip::AnnouncementGuard;
use crate::peer_record::{
    AnnouncementKind, DiscoveredPeerEntry, KnownPeerAnnouncement, KnownPeerInfo, PeerHealth,
    PeerRecord, PeerState, Tombstone, TombstoneReason,
};
use crate::session::{SessionIdentity, SyncSession, VaultAdoptionRequest};
use crate::traits::{BlobStore, Connection, DocumentStore, StorageAdapter, Transport};
use crate::traits::{STORAGE_KEY_DISCOVERED_PEERS, STORAGE_KEY_PEERS, STORAGE_KEY_TOMBSTONES};

/// Outstanding pairing request awaiting a user decision.
pub struct PendingPairingRequest {
    pub node_id: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Default)]
struct RateLimitEntry {
    recent_requests: VecDeque<DateTime<Utc>>,
    denial_count: u32,
    last_denied_at: Option<DateTime<Utc>>,
}

/// Reason a session closed, driving the reconnect backoff choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Clean,
    Error,
}

struct ManagerState {
    peers: HashMap<String, PeerRecord>,
    discovered: HashMap<String, DiscoveredPeerEntry>,
    tombstones: HashMap<String, Tombstone>,
    pending_pairing: HashMap<String, PendingPairingRequest>,
    rate_limits: HashMap<String, RateLimitEntry>,
    reconnect_attempts: HashMap<String, (u32, DateTime<Utc>)>,
    session_close_signals: HashMap<String, Arc<Notify>>,
    in_flight_add_peer: HashSet<String>,
    announcement_guard: AnnouncementGuard,
    initialized: bool,
    shutting_down: bool,
    /// Outbound gossip channel into each live session, keyed by peer node id.
    gossip_txs: HashMap<String, mpsc::UnboundedSender<KnownPeerAnnouncement>>,
    /// Node ids of peers whose session is currently in the `Live` phase.
    live_peers: HashSet<String>,
    /// Whether we were the initiator for each currently-running session.
    session_is_initiator: HashMap<String, bool>,
    /// Scheduled reconnect tasks, keyed by peer node id.
    reconnect_timers: HashMap<String, JoinHandle<()>>,
    /// Node ids currently being attempted by the discovery connection queue.
    discovery_queue_inflight: HashSet<String>,
    periodic_handles: Vec<JoinHandle<()>>,
    /// Last `HostStatus` emitted via `StatusChange`, so repeats are suppressed.
    last_status: Option<HostStatus>,
}

impl ManagerState {
    fn new(config: &PeerManagerConfig) -> Self {
        ManagerState {
            peers: HashMap::new(),
            discovered: HashMap::new(),
            tombstones: HashMap::new(),
            pending_pairing: HashMap::new(),
            rate_limits: HashMap::new(),
            reconnect_attempts: HashMap::new(),
            session_close_signals: HashMap::new(),
            in_flight_add_peer: HashSet::new(),
            announcement_guard: AnnouncementGuard::new(
                chrono::Duration::from_std(config.announcement_dedup_window).unwrap_or_default(),
                config.announcement_rate_limit_per_minute,
            ),
            initialized: false,
            shutting_down: false,
            gossip_txs: HashMap::new(),
            live_peers: HashSet::new(),
            session_is_initiator: HashMap::new(),
            reconnect_timers: HashMap::new(),
            discovery_queue_inflight: HashSet::new(),
            periodic_handles: Vec::new(),
            last_status: None,
        }
    }
}

/// Serialized form of the three JSON-array persistence blobs.
#[derive(Serialize, Deserialize)]
struct PersistedPeers(Vec<PeerRecord>);
#[derive(Serialize, Deserialize)]
struct PersistedDiscovered(Vec<DiscoveredPeerEntry>);
#[derive(Serialize, Deserialize)]
struct PersistedTombstones(Vec<Tombstone>);

pub struct PeerManager<T: Transport> {
    transport: Arc<T>,
    document: Arc<dyn DocumentStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    storage: Arc<dyn StorageAdapter>,
    config: Arc<PeerManagerConfig>,
    host_events: EventBus<HostEvent>,
    session_events: EventBus<SessionEvent>,
    vault_adoption_tx: mpsc::UnboundedSender<VaultAdoptionRequest>,
    state: Mutex<ManagerState>,
    discovery_semaphore: Semaphore,
}

impl<T: Transport> PeerManager<T> {
    pub fn new(
        transport: Arc<T>,
        document: Arc<dyn DocumentStore>,
        blobs: Option<Arc<dyn BlobStore>>,
        storage: Arc<dyn StorageAdapter>,
        config: PeerManagerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<VaultAdoptionRequest>) {
        let (vault_adoption_tx, vault_adoption_rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);
        let discovery_semaphore = Semaphore::new(config.discovery_max_concurrent.max(1));
        let manager = PeerManager {
            transport,
            document,
            blobs,
            storage,
            state: Mutex::new(ManagerState::new(&config)),
            config,
            host_events: EventBus::default(),
            session_events: EventBus::default(),
            vault_adoption_tx,
            discovery_semaphore,
        };
        (manager, vault_adoption_rx)
    }

    pub fn subscribe_host_events(&self) -> tokio::sync::broadcast::Receiver<HostEvent> {
        self.host_events.subscribe()
    }

    pub fn our_node_id(&self) -> String {
        self.transport.node_id()
    }

    // ── Initialization / shutdown ───────────────────────────────────

    /// Idempotent: a second call while already initialized is a no-op;
    /// a call while a prior instance is shutting down awaits that future.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        {
            let mut state = self.state.lock().await;
            if state.initialized {
                return Ok(());
            }
            state.initialized = true;
        }
        self.load_persisted_state().await?;
        info!(node_id = %self.our_node_id(), "peer manager initialized");
        Ok(())
    }

    /// Cancels every periodic task and reconnect timer spawned by
    /// [`Self::spawn_background_tasks`], closes every session, flushes
    /// pending writes, and clears all tracking maps. Safe to call more
    /// than once.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if state.shutting_down || !state.initialized {
            return Ok(());
        }
        state.shutting_down = true;
        for signal in state.session_close_signals.values() {
            signal.notify_one();
        }
        state.session_close_signals.clear();
        state.pending_pairing.clear();
        state.in_flight_add_peer.clear();
        state.gossip_txs.clear();
        state.live_peers.clear();
        state.session_is_initiator.clear();
        state.discovery_queue_inflight.clear();
        for (_, handle) in state.reconnect_timers.drain() {
            handle.abort();
        }
        for handle in state.periodic_handles.drain(..) {
            handle.abort();
        }
        state.initialized = false;
        state.shutting_down = false;
        drop(state);
        self.save_peers().await.ok();
        self.save_discovered().await.ok();
        self.save_tombstones().await.ok();
        Ok(())
    }

    // ── Persistence ──────────────────────────────────────────────────

    async fn load_persisted_state(&self) -> Result<(), SyncError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if let Some(bytes) = self.storage.read(STORAGE_KEY_PEERS).await? {
            if let Ok(parsed) = serde_json::from_slice::<PersistedPeers>(&bytes) {
                for record in parsed.0 {
                    state.peers.insert(record.node_id.clone(), record);
                }
            }
        }
        if let Some(bytes) = self.storage.read(STORAGE_KEY_TOMBSTONES).await? {
            if let Ok(parsed) = serde_json::from_slice::<PersistedTombstones>(&bytes) {
                for tombstone in parsed.0 {
                    if tombstone.is_live(now, chrono::Duration::from_std(self.config.tombstone_ttl).unwrap_or_default()) {
                        state.tombstones.insert(tombstone.node_id.clone(), tombstone);
                    }
                }
            }
        }
        if let Some(bytes) = self.storage.read(STORAGE_KEY_DISCOVERED_PEERS).await? {
            if let Ok(parsed) = serde_json::from_slice::<PersistedDiscovered>(&bytes) {
                for entry in parsed.0 {
                    if !state.tombstones.contains_key(&entry.info.node_id)
                        && !state.peers.contains_key(&entry.info.node_id)
                        && !entry.is_expired(now, chrono::Duration::from_std(self.config.discovered_peer_ttl).unwrap_or_default())
                    {
                        state.discovered.insert(entry.info.node_id.clone(), entry);
                    }
                }
            }
        }
        Ok(())
    }

    async fn save_peers(&self) -> Result<(), SyncError> {
        let state = self.state.lock().await;
        let records: Vec<PeerRecord> = state.peers.values().cloned().collect();
        drop(state);
        let bytes = serde_json::to_vec(&PersistedPeers(records))
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        self.storage.write(STORAGE_KEY_PEERS, &bytes).await
    }

    async fn save_discovered(&self) -> Result<(), SyncError> {
        let state = self.state.lock().await;
        let entries: Vec<DiscoveredPeerEntry> = state.discovered.values().cloned().collect();
        drop(state);
        let bytes = serde_json::to_vec(&PersistedDiscovered(entries))
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        self.storage.write(STORAGE_KEY_DISCOVERED_PEERS, &bytes).await
    }

    async fn save_tombstones(&self) -> Result<(), SyncError> {
        let state = self.state.lock().await;
        let entries: Vec<Tombstone> = state.tombstones.values().cloned().collect();
        drop(state);
        let bytes = serde_json::to_vec(&PersistedTombstones(entries))
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        self.storage.write(STORAGE_KEY_TOMBSTONES, &bytes).await
    }

    // ── Deterministic initiator selection ───────────────────────────

    /// True if the local node must be the initiator for a connection to
    /// `peer_node_id` (the lexicographically smaller node id initiates).
    pub fn we_should_initiate(&self, peer_node_id: &str) -> bool {
        self.our_node_id().as_str() < peer_node_id
    }

    // ── Tombstones ───────────────────────────────────────────────────

    pub async fn is_tombstoned(&self, node_id: &str) -> bool {
        let state = self.state.lock().await;
        match state.tombstones.get(node_id) {
            Some(tombstone) => tombstone.is_live(
                Utc::now(),
                chrono::Duration::from_std(self.config.tombstone_ttl).unwrap_or_default(),
            ),
            None => false,
        }
    }

    pub async fn remove_peer(&self, node_id: &str, reason: TombstoneReason) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        state.peers.remove(node_id);
        state.discovered.remove(node_id);
        if let Some(signal) = state.session_close_signals.remove(node_id) {
            signal.notify_one();
        }
        state.tombstones.insert(
            node_id.to_string(),
            Tombstone {
                node_id: node_id.to_string(),
                removed_at: Utc::now(),
                reason,
            },
        );
        drop(state);
        self.save_peers().await.ok();
        self.save_tombstones().await.ok();
        self.host_events.emit(HostEvent::PeerDisconnected {
            node_id: node_id.to_string(),
            reason: Some(format!("{reason:?}")),
        });
        Ok(())
    }

    /// Applies a received peer-left/removed gossip: tombstones locally and
    /// silently closes any active session, without re-propagating.
    pub async fn apply_remote_removal(&self, node_id: &str) {
        let _ = self.remove_peer(node_id, TombstoneReason::Left).await;
    }

    // ── Discovery ────────────────────────────────────────────────────

    /// Processes a gossip-learned peer. Ignored outright if tombstoned or
    /// already known. Returns the info if this was a genuinely new entry,
    /// so callers can decide whether to chase it with a connection.
    pub async fn process_discovered_peer(&self, info: KnownPeerInfo) -> Option<KnownPeerInfo> {
        let mut state = self.state.lock().await;
        if state.tombstones.contains_key(&info.node_id) {
            let live = state.tombstones[&info.node_id].is_live(
                Utc::now(),
                chrono::Duration::from_std(self.config.tombstone_ttl).unwrap_or_default(),
            );
            if live {
                return None;
            }
            state.tombstones.remove(&info.node_id);
        }
        if state.peers.contains_key(&info.node_id) {
            return None;
        }
        state.discovered.insert(
            info.node_id.clone(),
            DiscoveredPeerEntry {
                info: info.clone(),
                discovered_at: Utc::now(),
            },
        );
        drop(state);
        self.host_events.emit(HostEvent::PeerDiscovered(info.clone()));
        Some(info)
    }

    /// Admits a received announcement through the dedup/rate-limit guard,
    /// converts it into a discovered-peer entry if it passes, and, for a
    /// newly discovered peer we should initiate to, queues a connection
    /// attempt.
    pub async fn handle_announcement(self: &Arc<Self>, announcement: KnownPeerAnnouncement, source_node_id: &str) {
        let admitted = {
            let mut state = self.state.lock().await;
            state
                .announcement_guard
                .admit(&announcement.node_id, source_node_id, Utc::now())
        };
        if !admitted {
            return;
        }
        if announcement.node_id == self.our_node_id() {
            return;
        }
        let _ = announcement.kind; // all three flavors are treated identically by discovery
        let node_id = announcement.node_id.clone();
        let ticket = announcement.ticket.clone();
        let newly_discovered = self
            .process_discovered_peer(KnownPeerInfo {
                node_id: announcement.node_id,
                ticket: announcement.ticket,
                last_seen: announcement.last_seen,
            })
            .await;
        if newly_discovered.is_some() && self.we_should_initiate(&node_id) {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.attempt_discovery_connect(node_id, ticket).await;
            });
        }
    }

    // ── Pairing rate limiting ───────────────────────────────────────

    /// Layer 1-4 of the pairing rate limit. `Ok(())` means the request may
    /// proceed to create a pending pairing request.
    pub async fn check_pairing_rate_limit(&self, node_id: &str) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;

        if state.pending_pairing.len() >= self.config.max_pending_requests {
            return Err(SyncError::RateLimited);
        }

        let now = Utc::now();
        let entry = state.rate_limits.entry(node_id.to_string()).or_default();

        if let Some(last_denied_at) = entry.last_denied_at {
            if entry.denial_count > 0 {
                let backoff = self.config.denial_backoff_for(entry.denial_count);
                let backoff = chrono::Duration::from_std(backoff).unwrap_or_default();
                if now.signed_duration_since(last_denied_at) < backoff {
                    return Err(SyncError::RateLimited);
                }
            }
        }

        let window = chrono::Duration::from_std(self.config.pairing_request_window).unwrap_or_default();
        entry.recent_requests.retain(|t| now.signed_duration_since(*t) < window);
        if entry.recent_requests.len() >= self.config.pairing_max_requests_per_window {
            return Err(SyncError::RateLimited);
        }

        if entry.recent_requests.len() >= self.config.max_tracked_peers {
            entry.recent_requests.pop_front();
        }
        entry.recent_requests.push_back(now);
        Ok(())
    }

    pub async fn accept_pairing(&self, node_id: &str) {
        let mut state = self.state.lock().await;
        state.rate_limits.remove(node_id);
        state.pending_pairing.remove(node_id);
        drop(state);
        self.host_events.emit(HostEvent::PeerPairingAccepted {
            node_id: node_id.to_string(),
        });
    }

    pub async fn deny_pairing(&self, node_id: &str) {
        let mut state = self.state.lock().await;
        state.pending_pairing.remove(node_id);
        let entry = state.rate_limits.entry(node_id.to_string()).or_default();
        entry.denial_count += 1;
        entry.last_denied_at = Some(Utc::now());
        drop(state);
        self.host_events.emit(HostEvent::PeerPairingDenied {
            node_id: node_id.to_string(),
        });
    }

    /// Inbound connection classification: known / discovered / pairing.
    pub async fn classify_inbound(&self, node_id: &str) -> InboundClass {
        let mut state = self.state.lock().await;
        if let Some(record) = state.peers.get_mut(node_id) {
            if !record.trusted {
                return InboundClass::Rejected;
            }
            record.touch_last_seen(Utc::now());
            return InboundClass::Known;
        }
        if let Some(entry) = state.discovered.remove(node_id) {
            let mut record = PeerRecord::new(node_id, Utc::now());
            record.ticket = Some(entry.info.ticket);
            record.state = PeerState::Connecting;
            state.peers.insert(node_id.to_string(), record);
            return InboundClass::Discovered;
        }
        drop(state);

        match self.check_pairing_rate_limit(node_id).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.pending_pairing.insert(
                    node_id.to_string(),
                    PendingPairingRequest {
                        node_id: node_id.to_string(),
                        requested_at: Utc::now(),
                    },
                );
                drop(state);
                self.host_events.emit(HostEvent::PeerPairingRequest {
                    node_id: node_id.to_string(),
                });
                InboundClass::PendingPairing
            }
            Err(_) => InboundClass::RateLimited,
        }
    }

    // ── Reconnect scheduling ─────────────────────────────────────────

    /// Backoff to apply after a session closes, and whether the reconnect
    /// attempt budget is exhausted.
    pub async fn reconnect_backoff(&self, node_id: &str, reason: CloseReason) -> Option<Duration> {
        let mut state = self.state.lock().await;
        match reason {
            CloseReason::Clean => Some(self.config.clean_disconnect_backoff),
            CloseReason::Error => {
                let now = Utc::now();
                let entry = state
                    .reconnect_attempts
                    .entry(node_id.to_string())
                    .or_insert((0, now));
                entry.0 += 1;
                entry.1 = now;
                if entry.0 > self.config.max_reconnect_attempts {
                    return None;
                }
                Some(self.config.reconnect_backoff_for(entry.0))
            }
        }
    }

    pub async fn reset_reconnect_attempts(&self, node_id: &str) {
        let mut state = self.state.lock().await;
        state.reconnect_attempts.remove(node_id);
    }

    // ── Outbound add_peer ────────────────────────────────────────────

    /// Connects to `ticket`'s issuer and starts an initiator sync session.
    /// Guarded against concurrent calls with the same ticket; if a session
    /// is already live for the resulting node id, returns without starting
    /// a second one.
    pub async fn add_peer(self: &Arc<Self>, ticket: String) -> Result<(), SyncError> {
        {
            let mut state = self.state.lock().await;
            if !state.in_flight_add_peer.insert(ticket.clone()) {
                return Err(SyncError::DuplicateOperation(ticket));
            }
        }

        let result = self.add_peer_inner(&ticket).await;

        let mut state = self.state.lock().await;
        state.in_flight_add_peer.remove(&ticket);
        result
    }

    async fn add_peer_inner(self: &Arc<Self>, ticket: &str) -> Result<(), SyncError> {
        let connection = self.transport.connect_with_ticket(ticket).await?;
        let node_id = connection.peer_node_id().to_string();

        {
            let state = self.state.lock().await;
            if state.session_close_signals.contains_key(&node_id) {
                return Ok(());
            }
        }

        {
            let mut state = self.state.lock().await;
            let record = state
                .peers
                .entry(node_id.clone())
                .or_insert_with(|| PeerRecord::new(&node_id, Utc::now()));
            record.ticket = Some(ticket.to_string());
            record.touch_last_seen(Utc::now());
        }

        let stream = connection.open_stream().await?;
        self.run_session(node_id, stream, true).await
    }

    // ── Session execution ────────────────────────────────────────────

    async fn run_session<S>(self: &Arc<Self>, peer_node_id: String, stream: S, is_initiator: bool) -> Result<(), SyncError>
    where
        S: crate::traits::SyncStream + 'static,
    {
        let close_signal = Arc::new(Notify::new());
        let (gossip_tx, gossip_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().await;
            state
                .session_close_signals
                .insert(peer_node_id.clone(), close_signal.clone());
            state.gossip_txs.insert(peer_node_id.clone(), gossip_tx);
            state.session_is_initiator.insert(peer_node_id.clone(), is_initiator);
        }

        let identity = SessionIdentity {
            our_node_id: self.our_node_id(),
            our_ticket: None,
            our_hostname: self.config.our_hostname.clone(),
            our_nickname: self.config.our_nickname.clone(),
            peer_node_id: peer_node_id.clone(),
            peer_is_read_only: false,
        };

        let mut session = SyncSession::new(
            stream,
            identity,
            self.document.clone(),
            self.blobs.clone(),
            self.config.clone(),
            self.session_events.clone(),
            Some(self.vault_adoption_tx.clone()),
            close_signal,
            gossip_rx,
        );

        let result = if is_initiator {
            session.start_sync().await
        } else {
            session.handle_incoming_sync().await
        };

        let close_reason = match &result {
            Ok(()) => CloseReason::Clean,
            Err(_) => CloseReason::Error,
        };

        {
            let mut state = self.state.lock().await;
            state.session_close_signals.remove(&peer_node_id);
            state.gossip_txs.remove(&peer_node_id);
            state.session_is_initiator.remove(&peer_node_id);
            state.live_peers.remove(&peer_node_id);
            if let Some(record) = state.peers.get_mut(&peer_node_id) {
                record.state = match close_reason {
                    CloseReason::Clean => PeerState::Offline,
                    CloseReason::Error => PeerState::Error,
                };
            }
        }
        self.refresh_status().await;

        match &result {
            Ok(()) => {
                self.reset_reconnect_attempts(&peer_node_id).await;
            }
            Err(e) => {
                warn!(node_id = %peer_node_id, error = %e, "sync session ended with error");
                self.host_events.emit(HostEvent::PeerError {
                    node_id: peer_node_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        self.host_events.emit(HostEvent::PeerDisconnected {
            node_id: peer_node_id.clone(),
            reason: None,
        });
        self.schedule_reconnect(peer_node_id, close_reason).await;

        result
    }

    // ── Inbound connections ──────────────────────────────────────────

    /// Subscribes to the transport's inbound connections and dispatches
    /// each to [`Self::handle_incoming_connection`] on its own task. Runs
    /// until the subscription ends (transport shutdown) or the manager is
    /// dropped.
    pub async fn run_inbound_loop(self: Arc<Self>) {
        let mut incoming = self.transport.subscribe_incoming_connections().await;
        while let Some(connection) = incoming.recv().await {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.handle_incoming_connection(connection).await;
            });
        }
    }

    async fn handle_incoming_connection(self: &Arc<Self>, connection: T::Connection) {
        let node_id = connection.peer_node_id().to_string();
        match self.classify_inbound(&node_id).await {
            InboundClass::Known | InboundClass::Discovered => {
                match connection.open_stream().await {
                    Ok(stream) => {
                        if let Err(e) = self.run_session(node_id.clone(), stream, false).await {
                            warn!(node_id = %node_id, error = %e, "inbound sync session failed");
                        }
                    }
                    Err(e) => warn!(node_id = %node_id, error = %e, "failed to open inbound stream"),
                }
            }
            InboundClass::PendingPairing => {
                info!(node_id = %node_id, "pairing request awaiting user decision");
            }
            InboundClass::RateLimited | InboundClass::Rejected => {
                connection.close().await;
            }
        }
    }

    /// Closes every active session and clears maps; idempotent, safe to
    /// call repeatedly.
    pub async fn close_all_sessions(&self) {
        let mut state = self.state.lock().await;
        for signal in state.session_close_signals.values() {
            signal.notify_one();
        }
        state.session_close_signals.clear();
    }

    // ── Background tasks ─────────────────────────────────────────────

    /// Starts the session-event listener and every periodic timer. Call
    /// once after `initialize()`, on an `Arc`-wrapped manager; handles are
    /// stored internally and aborted by `shutdown()`.
    pub async fn spawn_background_tasks(self: &Arc<Self>) {
        self.spawn_session_event_listener().await;
        self.spawn_periodic_tasks().await;
    }

    async fn spawn_session_event_listener(self: &Arc<Self>) {
        let manager = self.clone();
        let mut events = self.session_events.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => manager.handle_session_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session event listener lagged, dropped events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.state.lock().await.periodic_handles.push(handle);
    }

    async fn spawn_periodic_tasks(self: &Arc<Self>) {
        let reannounce = {
            let manager = self.clone();
            let interval = self.config.reannounce_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    manager.reannounce_live_peers().await;
                }
            })
        };
        let reconcile = {
            let manager = self.clone();
            let interval = self.config.reconcile_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    manager.reconcile_all_peers().await;
                }
            })
        };
        let repair = {
            let manager = self.clone();
            let interval = self.config.repair_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    manager.repair_connections().await;
                }
            })
        };
        let cleanup = {
            let manager = self.clone();
            let interval = self.config.cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    manager.sweep_stale_entries().await;
                }
            })
        };

        self.state
            .lock()
            .await
            .periodic_handles
            .extend([reannounce, reconcile, repair, cleanup]);
    }

    async fn handle_session_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::StateChange { node_id, state } => {
                let peer_state = match state {
                    SessionState::Live => PeerState::Synced,
                    SessionState::Syncing | SessionState::ExchangingVersions => PeerState::Syncing,
                    SessionState::Error => PeerState::Error,
                    SessionState::Closed => PeerState::Offline,
                    SessionState::Idle | SessionState::Connecting => PeerState::Connecting,
                };
                {
                    let mut state_guard = self.state.lock().await;
                    if let Some(record) = state_guard.peers.get_mut(&node_id) {
                        record.state = peer_state;
                    }
                }
                self.host_events.emit(HostEvent::PeerStateChange {
                    node_id: node_id.clone(),
                    state: peer_state,
                });
                self.refresh_status().await;
                if state == SessionState::Live {
                    self.on_session_live(&node_id).await;
                }
            }
            SessionEvent::PeerAnnouncement { node_id, announcement } => {
                self.handle_announcement(announcement, &node_id).await;
            }
            SessionEvent::TicketReceived { node_id, ticket } => {
                let mut state = self.state.lock().await;
                if let Some(record) = state.peers.get_mut(&node_id) {
                    record.ticket = Some(ticket);
                }
            }
            SessionEvent::PeerInfo { node_id, hostname, nickname } => {
                let mut state = self.state.lock().await;
                if let Some(record) = state.peers.get_mut(&node_id) {
                    record.hostname = hostname;
                    record.nickname = nickname;
                }
            }
            SessionEvent::SyncComplete { node_id } => {
                {
                    let mut state = self.state.lock().await;
                    if let Some(record) = state.peers.get_mut(&node_id) {
                        record.mark_synced(Utc::now());
                    }
                }
                self.host_events.emit(HostEvent::PeerSynced { node_id });
            }
            SessionEvent::BlobReceived { hash, .. } => {
                self.host_events.emit(HostEvent::BlobReceived { hash });
            }
            SessionEvent::PeerRemoved { node_id, .. } => {
                self.apply_remote_removal(&node_id).await;
                self.refresh_status().await;
            }
            SessionEvent::Rtt { node_id, rtt_ms } => {
                self.update_peer_health(&node_id, |health| health.record_rtt(rtt_ms)).await;
            }
            SessionEvent::PingTimeout { node_id } => {
                self.update_peer_health(&node_id, |health| health.record_failed_ping()).await;
            }
            SessionEvent::LiveUpdatesFlushed { .. } => {
                self.host_events.emit(HostEvent::LiveUpdates);
            }
            SessionEvent::SyncProgress(_) | SessionEvent::Error { .. } => {}
        }
    }

    /// Applies a health update and emits `PeerHealthChange` iff the
    /// derived quality actually changed.
    async fn update_peer_health(&self, node_id: &str, update: impl FnOnce(&mut PeerHealth)) {
        let mut state = self.state.lock().await;
        let Some(record) = state.peers.get_mut(node_id) else {
            return;
        };
        let previous_quality = record.health.as_ref().map(|h| h.quality());
        let health = record.health.get_or_insert_with(PeerHealth::default);
        update(health);
        let new_quality = health.quality();
        drop(state);
        if previous_quality != Some(new_quality) {
            self.host_events.emit(HostEvent::PeerHealthChange {
                node_id: node_id.to_string(),
                quality: new_quality,
                previous_quality,
            });
        }
    }

    /// Recomputes [`Self::overall_status`] and emits `StatusChange` iff it
    /// differs from the last value emitted.
    async fn refresh_status(&self) {
        let mut state = self.state.lock().await;
        let status = Self::compute_status(&state);
        if state.last_status != Some(status) {
            state.last_status = Some(status);
            drop(state);
            self.host_events.emit(HostEvent::StatusChange(status));
        }
    }

    fn compute_status(state: &ManagerState) -> HostStatus {
        if state.peers.values().any(|p| p.state == PeerState::Error) {
            return HostStatus::Error;
        }
        if state.peers.values().any(|p| p.state == PeerState::Syncing) {
            return HostStatus::Syncing;
        }
        if state.peers.is_empty() {
            return HostStatus::Idle;
        }
        HostStatus::Offline
    }

    /// Called the moment a session reaches `Live`: announces the new peer
    /// to every *other* live session as `joined`, and, in the reverse
    /// direction, feeds the newly-live session every other currently-live
    /// peer as `discovered` — so the swarm converges on the new member
    /// immediately instead of waiting for the next gossip timer.
    async fn on_session_live(&self, node_id: &str) {
        let mut state = self.state.lock().await;
        let was_live = !state.live_peers.insert(node_id.to_string());

        let joined_announcement = state.peers.get(node_id).and_then(|p| {
            p.ticket.clone().map(|ticket| KnownPeerAnnouncement {
                kind: AnnouncementKind::Joined,
                node_id: p.node_id.clone(),
                ticket,
                last_seen: p.last_seen,
            })
        });
        let discovered_for_new_peer: Vec<KnownPeerAnnouncement> = state
            .live_peers
            .iter()
            .filter(|id| id.as_str() != node_id)
            .filter_map(|id| state.peers.get(id))
            .filter_map(|p| {
                p.ticket.clone().map(|ticket| KnownPeerAnnouncement {
                    kind: AnnouncementKind::Discovered,
                    node_id: p.node_id.clone(),
                    ticket,
                    last_seen: p.last_seen,
                })
            })
            .collect();
        let other_live_txs: Vec<mpsc::UnboundedSender<KnownPeerAnnouncement>> = state
            .live_peers
            .iter()
            .filter(|id| id.as_str() != node_id)
            .filter_map(|id| state.gossip_txs.get(id).cloned())
            .collect();
        let new_peer_tx = state.gossip_txs.get(node_id).cloned();
        drop(state);

        if !was_live {
            self.host_events.emit(HostEvent::PeerConnected {
                node_id: node_id.to_string(),
            });
        }

        if let Some(announcement) = joined_announcement {
            for tx in &other_live_txs {
                let _ = tx.send(announcement.clone());
            }
        }
        if let Some(tx) = new_peer_tx {
            for announcement in discovered_for_new_peer {
                let _ = tx.send(announcement);
            }
        }
    }

    /// Periodic: resends every live peer to every *other* live session as
    /// `discovered`, recovering from gossip a peer might have missed.
    async fn reannounce_live_peers(&self) {
        let state = self.state.lock().await;
        let live: Vec<String> = state.live_peers.iter().cloned().collect();
        let mut per_target = Vec::with_capacity(live.len());
        for target in &live {
            let announcements: Vec<KnownPeerAnnouncement> = live
                .iter()
                .filter(|id| *id != target)
                .filter_map(|id| state.peers.get(id))
                .filter_map(|p| {
                    p.ticket.clone().map(|ticket| KnownPeerAnnouncement {
                        kind: AnnouncementKind::Discovered,
                        node_id: p.node_id.clone(),
                        ticket,
                        last_seen: p.last_seen,
                    })
                })
                .collect();
            if let Some(tx) = state.gossip_txs.get(target).cloned() {
                per_target.push((tx, announcements));
            }
        }
        drop(state);
        for (tx, announcements) in per_target {
            for announcement in announcements {
                let _ = tx.send(announcement);
            }
        }
    }

    /// Periodic anti-entropy: re-broadcasts the full known-peer set
    /// (including non-live peers) to every live session as `updated`,
    /// healing any gossip messages a peer might have missed.
    async fn reconcile_all_peers(&self) {
        let state = self.state.lock().await;
        let targets: Vec<String> = state.live_peers.iter().cloned().collect();
        let mut per_target = Vec::with_capacity(targets.len());
        for target in &targets {
            let announcements: Vec<KnownPeerAnnouncement> = state
                .peers
                .values()
                .filter(|p| &p.node_id != target && p.ticket.is_some())
                .map(|p| KnownPeerAnnouncement {
                    kind: AnnouncementKind::Updated,
                    node_id: p.node_id.clone(),
                    ticket: p.ticket.clone().unwrap_or_default(),
                    last_seen: p.last_seen,
                })
                .collect();
            if let Some(tx) = state.gossip_txs.get(target).cloned() {
                per_target.push((tx, announcements));
            }
        }
        drop(state);
        for (tx, announcements) in per_target {
            for announcement in announcements {
                let _ = tx.send(announcement);
            }
        }
    }

    /// Chases a gossip-learned peer with a staggered, semaphore-limited
    /// connection attempt. Stagger is derived from the node id so that
    /// many nodes discovering the same peer at once don't all dial
    /// simultaneously.
    async fn attempt_discovery_connect(self: Arc<Self>, node_id: String, ticket: String) {
        {
            let mut state = self.state.lock().await;
            if !state.discovery_queue_inflight.insert(node_id.clone()) {
                return;
            }
        }

        let stagger = stagger_ms(&node_id, self.config.discovery_stagger_max);
        if !stagger.is_zero() {
            tokio::time::sleep(stagger).await;
        }

        let _permit = self.discovery_semaphore.acquire().await.expect("discovery semaphore never closed");

        for attempt in 1..=self.config.discovery_retry_attempts {
            {
                let state = self.state.lock().await;
                if state.live_peers.contains(&node_id) || state.shutting_down {
                    break;
                }
            }
            match self.add_peer(ticket.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    debug!(node_id = %node_id, attempt, error = %e, "discovery connect attempt failed");
                    if attempt < self.config.discovery_retry_attempts {
                        tokio::time::sleep(self.config.discovery_backoff_for(attempt)).await;
                    }
                }
            }
        }

        let mut state = self.state.lock().await;
        state.discovery_queue_inflight.remove(&node_id);
    }

    /// Schedules a reconnect attempt after a session closes, if we are the
    /// deterministic initiator for this peer and the attempt budget isn't
    /// exhausted. A new call for the same `node_id` replaces any pending
    /// timer.
    async fn schedule_reconnect(self: &Arc<Self>, node_id: String, reason: CloseReason) {
        if !self.we_should_initiate(&node_id) {
            return;
        }
        let Some(backoff) = self.reconnect_backoff(&node_id, reason).await else {
            warn!(node_id = %node_id, "reconnect attempt budget exhausted, giving up");
            return;
        };
        let ticket = {
            let state = self.state.lock().await;
            state.peers.get(&node_id).and_then(|p| p.ticket.clone())
        };
        let Some(ticket) = ticket else { return };

        let manager = self.clone();
        let node_id_for_task = node_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let live = {
                let state = manager.state.lock().await;
                state.live_peers.contains(&node_id_for_task) || state.shutting_down
            };
            if live {
                return;
            }
            if let Err(e) = manager.add_peer(ticket).await {
                debug!(node_id = %node_id_for_task, error = %e, "scheduled reconnect failed");
            }
        });

        let mut state = self.state.lock().await;
        if let Some(old) = state.reconnect_timers.insert(node_id, handle) {
            old.abort();
        }
    }

    /// Periodic: reconnects any trusted peer that has gone idle without an
    /// active session, reconnect timer, or in-flight discovery attempt.
    async fn repair_connections(self: &Arc<Self>) {
        let now = Utc::now();
        let idle_threshold = chrono::Duration::seconds(60);
        let candidates: Vec<(String, String)> = {
            let state = self.state.lock().await;
            state
                .peers
                .values()
                .filter(|p| {
                    p.trusted
                        && !state.live_peers.contains(&p.node_id)
                        && !state.reconnect_timers.contains_key(&p.node_id)
                        && !state.discovery_queue_inflight.contains(&p.node_id)
                        && now.signed_duration_since(p.last_seen) >= idle_threshold
                })
                .filter_map(|p| p.ticket.clone().map(|ticket| (p.node_id.clone(), ticket)))
                .collect()
        };
        for (node_id, ticket) in candidates {
            if self.we_should_initiate(&node_id) {
                let manager = self.clone();
                tokio::spawn(async move {
                    manager.attempt_discovery_connect(node_id, ticket).await;
                });
            }
        }
    }

    /// Periodic: ages out stale bookkeeping so the tracking maps don't
    /// grow unbounded across a long-running process.
    async fn sweep_stale_entries(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        state.reconnect_attempts.retain(|_, (_, last)| now.signed_duration_since(*last) < chrono::Duration::hours(1));

        let denial_cap = chrono::Duration::from_std(self.config.pairing_denial_backoff_cap).unwrap_or_default();
        let request_window = chrono::Duration::from_std(self.config.pairing_request_window).unwrap_or_default();
        state.rate_limits.retain(|_, entry| {
            let denial_stale = entry
                .last_denied_at
                .map_or(true, |t| now.signed_duration_since(t) >= denial_cap);
            entry.recent_requests.retain(|t| now.signed_duration_since(*t) < request_window);
            !denial_stale || !entry.recent_requests.is_empty()
        });

        let tombstone_ttl = chrono::Duration::from_std(self.config.tombstone_ttl).unwrap_or_default();
        state.tombstones.retain(|_, t| t.is_live(now, tombstone_ttl));

        let discovered_ttl = chrono::Duration::from_std(self.config.discovered_peer_ttl).unwrap_or_default();
        state.discovered.retain(|_, e| !e.is_expired(now, discovered_ttl));

        state.announcement_guard.sweep(now);
    }

    // ── Status ────────────────────────────────────────────────────────

    pub async fn get_peers(&self) -> Vec<PeerRecord> {
        let state = self.state.lock().await;
        state.peers.values().cloned().collect()
    }

    pub async fn get_discovered_peers(&self) -> Vec<DiscoveredPeerEntry> {
        let state = self.state.lock().await;
        state.discovered.values().cloned().collect()
    }

    pub async fn overall_status(&self) -> HostStatus {
        let state = self.state.lock().await;
        Self::compute_status(&state)
    }
}

/// Deterministic per-node stagger so a discovery broadcast reaching many
/// nodes at once doesn't make them all dial the same peer simultaneously.
/// Uses an FNV-1a hash of the node id, modulo `max`.
fn stagger_ms(node_id: &str, max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in node_id.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    Duration::from_millis(hash % max_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundClass {
    Known,
    Discovered,
    PendingPairing,
    RateLimited,
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct NullDocumentStore;

    #[async_trait]
    impl DocumentStore for NullDocumentStore {
        async fn get_vault_id(&self) -> String {
            "vault".into()
        }
        async fn set_vault_id(&self, _vault_id: &str) {}
        async fn get_version_bytes(&self) -> Vec<u8> {
            vec![]
        }
        async fn export_updates(&self) -> Vec<u8> {
            vec![]
        }
        async fn import_updates(&self, _updates: &[u8]) -> Result<(), SyncError> {
            Ok(())
        }
        async fn get_all_blob_hashes(&self) -> HashSet<String> {
            HashSet::new()
        }
        async fn subscribe_local_updates(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        }
    }

    struct InMemoryStorage {
        data: StdMutex<HashMap<String, Vec<u8>>>,
    }

    impl InMemoryStorage {
        fn new() -> Self {
            InMemoryStorage {
                data: StdMutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl StorageAdapter for InMemoryStorage {
        async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }
        async fn write(&self, key: &str, value: &[u8]) -> Result<(), SyncError> {
            self.data.lock().unwrap().insert(key.to_string(), value.to_vec());
            Ok(())
        }
    }

    struct FakeConnection;
    #[async_trait]
    impl Connection for FakeConnection {
        type Stream = tokio::io::DuplexStream;
        fn peer_node_id(&self) -> &str {
            "peer-b"
        }
        fn connection_kind(&self) -> crate::traits::ConnectionKind {
            crate::traits::ConnectionKind::Direct
        }
        async fn open_stream(&self) -> Result<Self::Stream, SyncError> {
            let (a, _b) = tokio::io::duplex(1024);
            Ok(a)
        }
        async fn rtt(&self) -> Option<std::time::Duration> {
            None
        }
        fn is_open(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    struct FakeTransport;
    #[async_trait]
    impl Transport for FakeTransport {
        type Connection = FakeConnection;
        fn node_id(&self) -> String {
            "peer-a".into()
        }
        async fn generate_ticket(&self) -> Result<String, SyncError> {
            Ok("ticket".into())
        }
        async fn connect_with_ticket(&self, _ticket: &str) -> Result<Self::Connection, SyncError> {
            Ok(FakeConnection)
        }
        async fn pending_stream_count(&self, _connection: &Self::Connection) -> usize {
            0
        }
        async fn subscribe_incoming_connections(
            &self,
        ) -> mpsc::UnboundedReceiver<Self::Connection> {
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        }
    }

    fn make_manager() -> PeerManager<FakeTransport> {
        let (manager, _rx) = PeerManager::new(
            Arc::new(FakeTransport),
            Arc::new(NullDocumentStore),
            None,
            Arc::new(InMemoryStorage::new()),
            PeerManagerConfig::default(),
        );
        manager
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let manager = make_manager();
        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let manager = make_manager();
        manager.initialize().await.unwrap();
        manager.shutdown().await.unwrap();
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn deterministic_initiator_uses_lexicographic_order() {
        let manager = make_manager();
        assert!(!manager.we_should_initiate("peer-0")); // "peer-a" > "peer-0"
        assert!(manager.we_should_initiate("peer-z")); // "peer-a" < "peer-z"
    }

    #[tokio::test]
    async fn tombstoned_peer_blocks_rediscovery() {
        let manager = make_manager();
        manager.initialize().await.unwrap();
        manager.remove_peer("node-n", TombstoneReason::Removed).await.unwrap();
        assert!(manager.is_tombstoned("node-n").await);

        manager
            .process_discovered_peer(KnownPeerInfo {
                node_id: "node-n".into(),
                ticket: "t".into(),
                last_seen: Utc::now(),
            })
            .await;
        let discovered = manager.get_discovered_peers().await;
        assert!(discovered.iter().all(|e| e.info.node_id != "node-n"));
    }

    #[tokio::test]
    async fn pairing_rate_limit_rejects_fourth_request_in_window() {
        let manager = make_manager();
        manager.initialize().await.unwrap();
        assert!(manager.check_pairing_rate_limit("node-n").await.is_ok());
        assert!(manager.check_pairing_rate_limit("node-n").await.is_ok());
        assert!(manager.check_pairing_rate_limit("node-n").await.is_ok());
        assert!(manager.check_pairing_rate_limit("node-n").await.is_err());
    }

    #[tokio::test]
    async fn global_pending_pairing_cap_enforced() {
        let manager = make_manager();
        manager.initialize().await.unwrap();
        for i in 0..10 {
            manager.classify_inbound(&format!("node-{i}")).await;
        }
        let class = manager.classify_inbound("node-overflow").await;
        assert_eq!(class, InboundClass::RateLimited);
    }

    #[tokio::test]
    async fn denial_backoff_blocks_subsequent_requests() {
        let manager = make_manager();
        manager.initialize().await.unwrap();
        manager.deny_pairing("node-n").await;
        manager.deny_pairing("node-n").await;
        manager.deny_pairing("node-n").await;
        // After 3 denials, backoff is 30s * 2^2 = 120s, so an immediate retry is rejected.
        assert!(manager.check_pairing_rate_limit("node-n").await.is_err());
    }

    #[tokio::test]
    async fn accept_pairing_clears_rate_limit_history() {
        let manager = make_manager();
        manager.initialize().await.unwrap();
        manager.check_pairing_rate_limit("node-n").await.unwrap();
        manager.deny_pairing("node-n").await;
        manager.accept_pairing("node-n").await;
        assert!(manager.check_pairing_rate_limit("node-n").await.is_ok());
    }

    #[tokio::test]
    async fn persistence_round_trip() {
        let storage = Arc::new(InMemoryStorage::new());
        let (manager, _rx) = PeerManager::new(
            Arc::new(FakeTransport),
            Arc::new(NullDocumentStore),
            None,
            storage.clone(),
            PeerManagerConfig::default(),
        );
        manager.initialize().await.unwrap();
        manager.remove_peer("node-n", TombstoneReason::Removed).await.unwrap();

        let (manager2, _rx2) = PeerManager::new(
            Arc::new(FakeTransport),
            Arc::new(NullDocumentStore),
            None,
            storage,
            PeerManagerConfig::default(),
        );
        manager2.initialize().await.unwrap();
        assert!(manager2.is_tombstoned("node-n").await);
    }

    #[tokio::test]
    async fn clean_disconnect_does_not_increment_reconnect_attempts() {
        let manager = make_manager();
        manager.initialize().await.unwrap();
        manager.reconnect_backoff("node-n", CloseReason::Clean).await;
        manager.reconnect_backoff("node-n", CloseReason::Clean).await;
        let state = manager.state.lock().await;
        assert!(!state.reconnect_attempts.contains_key("node-n"));
    }

    #[tokio::test]
    async fn error_disconnect_increments_and_caps_reconnect_attempts() {
        let manager = make_manager();
        manager.initialize().await.unwrap();
        for _ in 0..10 {
            manager.reconnect_backoff("node-n", CloseReason::Error).await;
        }
        let exhausted = manager.reconnect_backoff("node-n", CloseReason::Error).await;
        assert!(exhausted.is_none());
    }
}
