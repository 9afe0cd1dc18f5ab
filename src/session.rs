//! The per-peer sync session state machine: version exchange, document
//! update exchange, blob reconciliation, live replication.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PeerManagerConfig;
use crate::error::SyncError;
use crate::events::{EventBus, SessionEvent, SessionState, SyncProgress};
use crate::peer_record::{AnnouncementKind, KnownPeerAnnouncement};
use crate::traits::{BlobStore, DocumentStore, SyncStream};
use crate::wire::{self, DiscoveryEntry, ErrorCode, Frame, Message, PeerDiscoveryBlock};

/// A request to the host to resolve a vault-id mismatch. Responding `true`
/// adopts the peer's vault id; dropping the sender (or replying after the
/// session's timeout) is treated as a deny.
#[derive(Debug)]
pub struct VaultAdoptionRequest {
    pub node_id: String,
    pub peer_vault_id: String,
    pub our_vault_id: String,
    pub respond: oneshot::Sender<bool>,
}

/// Identity and policy fields a session needs at construction; owned by
/// the peer manager, which knows the local node's identity and the
/// per-peer trust policy.
pub struct SessionIdentity {
    pub our_node_id: String,
    pub our_ticket: Option<String>,
    pub our_hostname: Option<String>,
    pub our_nickname: Option<String>,
    pub peer_node_id: String,
    pub peer_is_read_only: bool,
}

pub struct SyncSession<S: SyncStream> {
    stream: S,
    identity: SessionIdentity,
    is_initiator: bool,
    state: SessionState,
    document: Arc<dyn DocumentStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    config: Arc<PeerManagerConfig>,
    events: EventBus<SessionEvent>,
    vault_adoption_requests: Option<mpsc::UnboundedSender<VaultAdoptionRequest>>,
    pending: PendingBatch,
    ping_seq: u32,
    progress: SyncProgress,
    trace_session_id: String,
    close_signal: Arc<Notify>,
    /// Outbound gossip fed in by the peer manager while this session is
    /// live; relayed to the peer as a `VERSION_INFO` discovery tail.
    gossip_rx: mpsc::UnboundedReceiver<KnownPeerAnnouncement>,
    /// Sequence number and send time of the most recent unanswered ping.
    ping_sent_at: Option<(u32, Instant)>,
}

#[derive(Default)]
struct PendingBatch {
    updates: Vec<Vec<u8>>,
    bytes: usize,
}

impl PendingBatch {
    fn push(&mut self, update: Vec<u8>) {
        self.bytes += update.len();
        self.updates.push(update);
    }

    fn should_flush(&self, max_entries: usize, max_bytes: usize) -> bool {
        self.updates.len() >= max_entries || self.bytes >= max_bytes
    }

    fn take(&mut self) -> Vec<Vec<u8>> {
        self.bytes = 0;
        std::mem::take(&mut self.updates)
    }

    fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

enum LiveExit {
    Closed,
}

impl<S: SyncStream> SyncSession<S> {
    pub fn new(
        stream: S,
        identity: SessionIdentity,
        document: Arc<dyn DocumentStore>,
        blobs: Option<Arc<dyn BlobStore>>,
        config: Arc<PeerManagerConfig>,
        events: EventBus<SessionEvent>,
        vault_adoption_requests: Option<mpsc::UnboundedSender<VaultAdoptionRequest>>,
        close_signal: Arc<Notify>,
        gossip_rx: mpsc::UnboundedReceiver<KnownPeerAnnouncement>,
    ) -> Self {
        let trace_session_id = format!(
            "{}-{:08x}",
            identity.peer_node_id,
            rand::thread_rng().gen::<u32>()
        );
        SyncSession {
            stream,
            identity,
            is_initiator: false,
            state: SessionState::Idle,
            document,
            blobs,
            config,
            events,
            vault_adoption_requests,
            pending: PendingBatch::default(),
            ping_seq: 0,
            progress: SyncProgress::default(),
            trace_session_id,
            close_signal,
            gossip_rx,
            ping_sent_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn progress(&self) -> &SyncProgress {
        &self.progress
    }

    /// Runs the full protocol as the connecting (initiator) side. Only
    /// valid from `Idle`.
    pub async fn start_sync(&mut self) -> Result<(), SyncError> {
        if self.state != SessionState::Idle {
            return Err(SyncError::Protocol("start_sync called outside idle state".into()));
        }
        self.is_initiator = true;
        self.run().await
    }

    /// Runs the full protocol as the accepting side. Only valid from
    /// `Idle`.
    pub async fn handle_incoming_sync(&mut self) -> Result<(), SyncError> {
        if self.state != SessionState::Idle {
            return Err(SyncError::Protocol("handle_incoming_sync called outside idle state".into()));
        }
        self.is_initiator = false;
        self.run().await
    }

    async fn run(&mut self) -> Result<(), SyncError> {
        match self.run_phases().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.set_state(SessionState::Error);
                self.events.emit(SessionEvent::Error {
                    node_id: self.identity.peer_node_id.clone(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_phases(&mut self) -> Result<(), SyncError> {
        self.exchange_versions().await?;
        self.exchange_updates().await?;
        self.reconcile_blobs().await?;
        match self.live_loop().await? {
            LiveExit::Closed => {
                self.set_state(SessionState::Closed);
            }
        }
        Ok(())
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.events.emit(SessionEvent::StateChange {
            node_id: self.identity.peer_node_id.clone(),
            state,
        });
    }

    // ── Frame I/O ────────────────────────────────────────────────────

    async fn send_message(&mut self, message: &Message) -> Result<(), SyncError> {
        let frame = Frame {
            timestamp_ms: wire::now_ms(),
            message: message.clone(),
        };
        let bytes = wire::serialize(&frame);
        write_length_prefixed(&mut self.stream, &bytes).await
    }

    async fn recv_message(&mut self) -> Result<Message, SyncError> {
        let bytes = read_length_prefixed(&mut self.stream, self.config.receive_timeout).await?;
        let frame = wire::deserialize(&bytes)
            .map_err(|e| SyncError::InvalidMessage(e.to_string()))?;
        Ok(frame.message)
    }

    /// Used only by the live loop, which has no receive timeout and relies
    /// on ping/pong for liveness instead.
    async fn recv_message_live(&mut self) -> Result<Message, SyncError> {
        let bytes = read_length_prefixed_no_timeout(&mut self.stream).await?;
        let frame = wire::deserialize(&bytes)
            .map_err(|e| SyncError::InvalidMessage(e.to_string()))?;
        Ok(frame.message)
    }

    // ── Phase 1: version exchange ───────────────────────────────────

    async fn exchange_versions(&mut self) -> Result<(), SyncError> {
        self.set_state(SessionState::ExchangingVersions);
        let our_vault_id = self.document.get_vault_id().await;
        let our_version = self.document.get_version_bytes().await;
        let our_msg = Message::VersionInfo {
            vault_id: our_vault_id.clone(),
            version: our_version,
            ticket: self.identity.our_ticket.clone(),
            hostname: self.identity.our_hostname.clone(),
            nickname: self.identity.our_nickname.clone(),
            discovery: None,
        };

        let peer_msg = if self.is_initiator {
            self.send_message(&our_msg).await?;
            self.recv_message().await?
        } else {
            let peer_msg = self.recv_message().await?;
            self.send_message(&our_msg).await?;
            peer_msg
        };

        let (peer_vault_id, ticket, hostname, nickname) = match peer_msg {
            Message::VersionInfo {
                vault_id,
                ticket,
                hostname,
                nickname,
                ..
            } => (vault_id, ticket, hostname, nickname),
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected VERSION_INFO, got {other:?}"
                )))
            }
        };

        if let Some(ticket) = &ticket {
            self.events.emit(SessionEvent::TicketReceived {
                node_id: self.identity.peer_node_id.clone(),
                ticket: ticket.clone(),
            });
        }
        self.events.emit(SessionEvent::PeerInfo {
            node_id: self.identity.peer_node_id.clone(),
            hostname: hostname.map(|h| wire::sanitize_display_string(&h)),
            nickname: nickname.map(|n| wire::sanitize_display_string(&n)),
        });

        if peer_vault_id != our_vault_id {
            if !self.config.allow_vault_adoption {
                self.send_message(&Message::Error {
                    code: ErrorCode::VaultMismatch,
                    message: "Vault ID mismatch".into(),
                })
                .await
                .ok();
                return Err(SyncError::VaultMismatch);
            }

            let accepted = self.request_vault_adoption(&peer_vault_id, &our_vault_id).await;
            if !accepted {
                self.send_message(&Message::Error {
                    code: ErrorCode::VaultMismatch,
                    message: "Vault ID mismatch".into(),
                })
                .await
                .ok();
                return Err(SyncError::VaultMismatch);
            }
            self.document.set_vault_id(&peer_vault_id).await;
        }

        Ok(())
    }

    async fn request_vault_adoption(&self, peer_vault_id: &str, our_vault_id: &str) -> bool {
        let Some(tx) = &self.vault_adoption_requests else {
            return false;
        };
        let (respond_tx, respond_rx) = oneshot::channel();
        let request = VaultAdoptionRequest {
            node_id: self.identity.peer_node_id.clone(),
            peer_vault_id: peer_vault_id.to_string(),
            our_vault_id: our_vault_id.to_string(),
            respond: respond_tx,
        };
        if tx.send(request).is_err() {
            return false;
        }
        match tokio::time::timeout(self.config.vault_adoption_timeout, respond_rx).await {
            Ok(Ok(accepted)) => accepted,
            _ => false,
        }
    }

    // ── Phase 2: document update exchange ───────────────────────────

    async fn exchange_updates(&mut self) -> Result<(), SyncError> {
        self.set_state(SessionState::Syncing);
        let our_updates = self.document.export_updates().await;
        let our_msg = Message::Updates {
            op_count: if our_updates.is_empty() { 0 } else { 1 },
            data: our_updates,
        };

        let peer_msg = if self.is_initiator {
            self.send_message(&our_msg).await?;
            self.recv_message().await?
        } else {
            let peer_msg = self.recv_message().await?;
            self.send_message(&our_msg).await?;
            peer_msg
        };

        match peer_msg {
            Message::Updates { data, .. } => {
                if !self.identity.peer_is_read_only && !data.is_empty() {
                    self.document.import_updates(&data).await?;
                }
            }
            Message::Error { code, message } => {
                return Err(SyncError::Protocol(format!("peer error {code:?}: {message}")))
            }
            other => {
                return Err(SyncError::Protocol(format!("expected UPDATES, got {other:?}")))
            }
        }

        let our_final_version = self.document.get_version_bytes().await;
        let complete_msg = Message::SyncComplete {
            version: our_final_version,
        };

        if self.is_initiator {
            self.send_message(&complete_msg).await?;
            self.expect_sync_complete().await?;
        } else {
            self.expect_sync_complete().await?;
            self.send_message(&complete_msg).await?;
        }

        self.events.emit(SessionEvent::SyncComplete {
            node_id: self.identity.peer_node_id.clone(),
        });
        Ok(())
    }

    async fn expect_sync_complete(&mut self) -> Result<(), SyncError> {
        match self.recv_message().await? {
            Message::SyncComplete { .. } => Ok(()),
            Message::Error { code, message } => {
                Err(SyncError::Protocol(format!("peer error {code:?}: {message}")))
            }
            other => Err(SyncError::Protocol(format!(
                "expected SYNC_COMPLETE, got {other:?}"
            ))),
        }
    }

    // ── Phase 3: blob reconciliation ────────────────────────────────

    async fn reconcile_blobs(&mut self) -> Result<(), SyncError> {
        let Some(blobs) = self.blobs.clone() else {
            return Ok(());
        };

        let our_hashes = blobs.list().await;
        let our_hashes_msg = Message::BlobHashes {
            hashes: our_hashes.iter().cloned().collect(),
        };

        let peer_hashes: HashSet<String> = if self.is_initiator {
            self.send_message(&our_hashes_msg).await?;
            self.expect_blob_hashes().await?
        } else {
            let h = self.expect_blob_hashes().await?;
            self.send_message(&our_hashes_msg).await?;
            h
        };

        let missing_from_us: Vec<String> = peer_hashes.difference(&our_hashes).cloned().collect();
        let request_msg = Message::BlobRequest {
            hashes: missing_from_us,
        };

        let peer_requested: Vec<String> = if self.is_initiator {
            self.send_message(&request_msg).await?;
            self.expect_blob_request().await?
        } else {
            let r = self.expect_blob_request().await?;
            self.send_message(&request_msg).await?;
            r
        };

        self.progress.blobs_to_send = peer_requested.len() as u64;

        if self.is_initiator {
            self.send_requested_blobs(&blobs, &peer_requested).await?;
            self.receive_blobs(&blobs).await?;
        } else {
            self.receive_blobs(&blobs).await?;
            self.send_requested_blobs(&blobs, &peer_requested).await?;
        }

        Ok(())
    }

    async fn expect_blob_hashes(&mut self) -> Result<HashSet<String>, SyncError> {
        match self.recv_message().await? {
            Message::BlobHashes { hashes } => Ok(hashes.into_iter().collect()),
            other => Err(SyncError::Protocol(format!(
                "expected BLOB_HASHES, got {other:?}"
            ))),
        }
    }

    async fn expect_blob_request(&mut self) -> Result<Vec<String>, SyncError> {
        match self.recv_message().await? {
            Message::BlobRequest { hashes } => Ok(hashes),
            other => Err(SyncError::Protocol(format!(
                "expected BLOB_REQUEST, got {other:?}"
            ))),
        }
    }

    async fn send_requested_blobs(
        &mut self,
        blobs: &Arc<dyn BlobStore>,
        requested: &[String],
    ) -> Result<(), SyncError> {
        for batch in requested.chunks(self.config.blob_batch_size) {
            let loaded = load_blob_batch(blobs, batch).await;

            for (hash, data) in loaded {
                let Some(data) = data else {
                    warn!(hash = %hash, "blob requested but missing locally, skipping");
                    continue;
                };
                let mime = blobs.get_meta(&hash).await.and_then(|m| m.mime);
                if let Err(e) = self.send_blob_with_retry(&hash, mime, &data).await {
                    warn!(hash = %hash, error = %e, "blob send exhausted retries");
                    continue;
                }
                self.progress.blobs_sent += 1;
                self.progress.bytes_sent += data.len() as u64;
            }
        }

        self.send_message(&Message::BlobSyncComplete {
            blob_count: self.progress.blobs_sent as u32,
        })
        .await
    }

    async fn send_blob_with_retry(
        &mut self,
        hash: &str,
        mime: Option<String>,
        data: &[u8],
    ) -> Result<(), SyncError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let message = Message::BlobData {
                hash: hash.to_string(),
                mime: mime.clone(),
                data: data.to_vec(),
            };
            match self.send_message(&message).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.blob_retry_attempts => {
                    tokio::time::sleep(self.config.blob_retry_base_delay * attempt).await;
                    debug!(hash = %hash, attempt, "retrying blob send after {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn receive_blobs(&mut self, blobs: &Arc<dyn BlobStore>) -> Result<(), SyncError> {
        loop {
            match self.recv_message().await? {
                Message::BlobData { hash, mime, data } => {
                    let ok = blobs.verify_and_add(&data, &hash, mime.as_deref()).await;
                    if ok {
                        self.progress.blobs_received += 1;
                        self.progress.bytes_received += data.len() as u64;
                        self.events.emit(SessionEvent::BlobReceived {
                            node_id: self.identity.peer_node_id.clone(),
                            hash,
                        });
                    } else {
                        warn!(hash = %hash, "blob integrity check failed, dropping");
                    }
                }
                Message::BlobSyncComplete { .. } => return Ok(()),
                Message::Error { code, message } => {
                    return Err(SyncError::Protocol(format!("peer error {code:?}: {message}")))
                }
                other => {
                    return Err(SyncError::Protocol(format!(
                        "expected BLOB_DATA or BLOB_SYNC_COMPLETE, got {other:?}"
                    )))
                }
            }
        }
    }

    // ── Phase 4: live replication ────────────────────────────────────

    async fn live_loop(&mut self) -> Result<LiveExit, SyncError> {
        self.set_state(SessionState::Live);
        let mut local_updates_rx = self.document.subscribe_local_updates().await;
        let mut ping_timer = tokio::time::interval(self.config.ping_interval);
        ping_timer.tick().await;
        let mut flush_deadline: Option<Instant> = None;
        let mut consecutive_errors = 0u32;
        let close_signal = self.close_signal.clone();
        let mut local_updates_done = false;
        let mut gossip_done = false;

        loop {
            tokio::select! {
                biased;

                _ = close_signal.notified() => {
                    self.flush_pending().await.ok();
                    return Ok(LiveExit::Closed);
                }

                maybe_update = local_updates_rx.recv(), if !local_updates_done => {
                    match maybe_update {
                        Some(update) => {
                            self.pending.push(update);
                            if flush_deadline.is_none() {
                                flush_deadline = Some(Instant::now() + self.config.flush_interval);
                            }
                            if self.pending.should_flush(self.config.flush_max_entries, self.config.flush_max_bytes) {
                                self.flush_pending().await?;
                                flush_deadline = None;
                            }
                        }
                        None => {
                            // Document store dropped its subscription; nothing more to replicate live.
                            local_updates_done = true;
                        }
                    }
                }

                maybe_announcement = self.gossip_rx.recv(), if !gossip_done => {
                    match maybe_announcement {
                        Some(announcement) => {
                            self.send_gossip(announcement).await?;
                        }
                        None => {
                            // Peer manager dropped its gossip sender (session ending or shutdown).
                            gossip_done = true;
                        }
                    }
                }

                _ = sleep_until_opt(flush_deadline) => {
                    self.flush_pending().await?;
                    flush_deadline = None;
                }

                _ = ping_timer.tick() => {
                    if self.ping_sent_at.take().is_some() {
                        self.events.emit(SessionEvent::PingTimeout {
                            node_id: self.identity.peer_node_id.clone(),
                        });
                    }
                    self.ping_seq = self.ping_seq.wrapping_add(1);
                    self.ping_sent_at = Some((self.ping_seq, Instant::now()));
                    self.send_message(&Message::Ping { seq: self.ping_seq }).await?;
                }

                frame = self.recv_message_retrying(&mut consecutive_errors) => {
                    match frame? {
                        Some(message) => {
                            if let ControlFlow::Break(exit) = self.dispatch_live_message(message).await? {
                                self.flush_pending().await.ok();
                                return Ok(exit);
                            }
                        }
                        None => continue,
                    }
                }
            }
        }
    }

    /// Relays one gossip fact to the peer by reusing the `VERSION_INFO`
    /// discovery tail outside of the version-exchange phase.
    async fn send_gossip(&mut self, announcement: KnownPeerAnnouncement) -> Result<(), SyncError> {
        let our_vault_id = self.document.get_vault_id().await;
        let message = Message::VersionInfo {
            vault_id: our_vault_id,
            version: Vec::new(),
            ticket: None,
            hostname: None,
            nickname: None,
            discovery: Some(discovery_block_from_announcements(&[announcement])),
        };
        self.send_message(&message).await
    }

    /// Reads one frame, internally retrying transient failures with
    /// backoff up to the configured budget. `Ok(None)` means "retried
    /// once, poll again" so the caller's select loop stays responsive to
    /// the other branches between attempts.
    async fn recv_message_retrying(
        &mut self,
        consecutive_errors: &mut u32,
    ) -> Result<Option<Message>, SyncError> {
        match self.recv_message_live().await {
            Ok(message) => {
                *consecutive_errors = 0;
                Ok(Some(message))
            }
            Err(e) if e.is_transient() && *consecutive_errors < self.config.live_loop_max_retries => {
                *consecutive_errors += 1;
                let backoff = self.config.live_loop_backoff_for(*consecutive_errors);
                let jitter_ms = rand::thread_rng()
                    .gen_range(0..=self.config.live_loop_retry_jitter.as_millis() as i64 * 2)
                    - self.config.live_loop_retry_jitter.as_millis() as i64;
                let delay = backoff.as_millis() as i64 + jitter_ms;
                tokio::time::sleep(Duration::from_millis(delay.max(0) as u64)).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch_live_message(
        &mut self,
        message: Message,
    ) -> Result<ControlFlow<LiveExit>, SyncError> {
        match message {
            Message::Updates { data, .. } => {
                if !self.identity.peer_is_read_only && !data.is_empty() {
                    self.document.import_updates(&data).await?;
                    let have = self.blobs_present_locally().await;
                    let referenced = self.document.get_all_blob_hashes().await;
                    let missing: Vec<String> = referenced.difference(&have).cloned().collect();
                    if !missing.is_empty() {
                        self.send_message(&Message::BlobRequest { hashes: missing }).await?;
                    }
                }
                Ok(ControlFlow::Continue(()))
            }
            Message::BlobRequest { hashes } => {
                if let Some(blobs) = self.blobs.clone() {
                    self.send_requested_blobs_live(&blobs, &hashes).await?;
                }
                Ok(ControlFlow::Continue(()))
            }
            Message::BlobData { hash, mime, data } => {
                if let Some(blobs) = self.blobs.clone() {
                    let ok = blobs.verify_and_add(&data, &hash, mime.as_deref()).await;
                    if ok {
                        self.progress.blobs_received += 1;
                        self.progress.bytes_received += data.len() as u64;
                        self.events.emit(SessionEvent::BlobReceived {
                            node_id: self.identity.peer_node_id.clone(),
                            hash,
                        });
                    } else {
                        warn!(hash = %hash, "live blob integrity check failed, dropping");
                    }
                }
                Ok(ControlFlow::Continue(()))
            }
            Message::Ping { seq } => {
                self.send_message(&Message::Pong { seq }).await?;
                Ok(ControlFlow::Continue(()))
            }
            Message::Pong { seq } => {
                if let Some((pending_seq, sent_at)) = self.ping_sent_at {
                    if pending_seq == seq {
                        self.ping_sent_at = None;
                        self.events.emit(SessionEvent::Rtt {
                            node_id: self.identity.peer_node_id.clone(),
                            rtt_ms: sent_at.elapsed().as_secs_f64() * 1000.0,
                        });
                    }
                }
                Ok(ControlFlow::Continue(()))
            }
            Message::Error { code, message } => {
                Err(SyncError::Protocol(format!("peer error {code:?}: {message}")))
            }
            Message::PeerRemoved { reason } => {
                self.events.emit(SessionEvent::PeerRemoved {
                    node_id: self.identity.peer_node_id.clone(),
                    reason,
                });
                Ok(ControlFlow::Break(LiveExit::Closed))
            }
            Message::VersionInfo { discovery: Some(block), .. } => {
                for announcement in announcements_from_discovery_block(&block) {
                    self.events.emit(SessionEvent::PeerAnnouncement {
                        node_id: self.identity.peer_node_id.clone(),
                        announcement,
                    });
                }
                Ok(ControlFlow::Continue(()))
            }
            other => {
                debug!(?other, "ignoring unknown message type in live loop");
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    async fn blobs_present_locally(&self) -> HashSet<String> {
        match &self.blobs {
            Some(b) => b.list().await,
            None => HashSet::new(),
        }
    }

    async fn send_requested_blobs_live(
        &mut self,
        blobs: &Arc<dyn BlobStore>,
        hashes: &[String],
    ) -> Result<(), SyncError> {
        for hash in hashes {
            let Some(data) = blobs.get(hash).await else {
                continue;
            };
            let mime = blobs.get_meta(hash).await.and_then(|m| m.mime);
            if let Err(e) = self.send_blob_with_retry(hash, mime, &data).await {
                warn!(hash = %hash, error = %e, "live blob send exhausted retries");
                continue;
            }
            self.progress.blobs_sent += 1;
            self.progress.bytes_sent += data.len() as u64;
        }
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<(), SyncError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let updates = self.pending.take();
        info!(
            count = updates.len(),
            session = %self.trace_session_id,
            from = %self.identity.our_node_id,
            to = %self.identity.peer_node_id,
            "flushing live update batch"
        );
        for update in updates {
            let op_count = if update.is_empty() { 0 } else { 1 };
            self.send_message(&Message::Updates { op_count, data: update })
                .await?;
        }
        self.events.emit(SessionEvent::LiveUpdatesFlushed {
            node_id: self.identity.peer_node_id.clone(),
        });
        Ok(())
    }
}

fn discovery_block_from_announcements(announcements: &[KnownPeerAnnouncement]) -> PeerDiscoveryBlock {
    PeerDiscoveryBlock {
        peers: announcements
            .iter()
            .map(|a| DiscoveryEntry {
                node_id: a.node_id.clone(),
                ticket: a.ticket.clone(),
                last_seen_ms: a.last_seen.timestamp_millis().max(0) as u64,
                kind: match a.kind {
                    AnnouncementKind::Joined => wire::DISCOVERY_KIND_JOINED,
                    AnnouncementKind::Discovered => wire::DISCOVERY_KIND_DISCOVERED,
                    AnnouncementKind::Updated => wire::DISCOVERY_KIND_UPDATED,
                },
            })
            .collect(),
    }
}

fn announcements_from_discovery_block(block: &PeerDiscoveryBlock) -> Vec<KnownPeerAnnouncement> {
    block
        .peers
        .iter()
        .map(|entry| KnownPeerAnnouncement {
            kind: match entry.kind {
                wire::DISCOVERY_KIND_JOINED => AnnouncementKind::Joined,
                wire::DISCOVERY_KIND_UPDATED => AnnouncementKind::Updated,
                _ => AnnouncementKind::Discovered,
            },
            node_id: entry.node_id.clone(),
            ticket: entry.ticket.clone(),
            last_seen: chrono::DateTime::<chrono::Utc>::from_timestamp_millis(entry.last_seen_ms as i64)
                .unwrap_or_else(chrono::Utc::now),
        })
        .collect()
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending::<()>().await,
    }
}

/// Loads a batch of blobs concurrently (one task per hash), matching the
/// parallel-load / sequential-send pipeline.
async fn load_blob_batch(
    blobs: &Arc<dyn BlobStore>,
    batch: &[String],
) -> Vec<(String, Option<Vec<u8>>)> {
    let mut set = tokio::task::JoinSet::new();
    for hash in batch {
        let blobs = blobs.clone();
        let hash = hash.clone();
        set.spawn(async move {
            let data = blobs.get(&hash).await;
            (hash, data)
        });
    }
    let mut out = Vec::with_capacity(batch.len());
    while let Some(result) = set.join_next().await {
        if let Ok(pair) = result {
            out.push(pair);
        }
    }
    out
}

const LENGTH_PREFIX_LEN: usize = 4;
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

async fn write_length_prefixed<S: SyncStream>(stream: &mut S, frame: &[u8]) -> Result<(), SyncError> {
    let len = frame.len() as u32;
    stream.write_all(&len.to_be_bytes()).await.map_err(SyncError::Io)?;
    stream.write_all(frame).await.map_err(SyncError::Io)?;
    stream.flush().await.map_err(SyncError::Io)?;
    Ok(())
}

async fn read_length_prefixed<S: SyncStream>(
    stream: &mut S,
    timeout: Duration,
) -> Result<Vec<u8>, SyncError> {
    let read = async {
        let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
        stream.read_exact(&mut len_buf).await.map_err(SyncError::Io)?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(SyncError::InvalidMessage(format!(
                "frame length {len} exceeds maximum"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await.map_err(SyncError::Io)?;
        Ok(buf)
    };
    match tokio::time::timeout(timeout, read).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout),
    }
}

/// Unbounded-duration variant used by the live loop, which has no receive
/// timeout and relies on ping/pong for liveness instead.
async fn read_length_prefixed_no_timeout<S: SyncStream>(stream: &mut S) -> Result<Vec<u8>, SyncError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    stream.read_exact(&mut len_buf).await.map_err(SyncError::Io)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(SyncError::InvalidMessage(format!(
            "frame length {len} exceeds maximum"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await.map_err(SyncError::Io)?;
    Ok(buf)
}
