//! Tunables for the sync session and peer manager, with defaults matching
//! the documented constants, plus a small CLI surface for the demo binary.

use std::time::Duration;

/// Every knob the sync core exposes. Fields are public so an embedder can
/// override individual values directly; `with_*` methods are provided for
/// chained construction.
#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    /// How long a tombstone suppresses rediscovery of its `node_id`.
    pub tombstone_ttl: Duration,
    /// How long a discovered-peer entry lives without a connection.
    pub discovered_peer_ttl: Duration,
    /// Per-peer rate-limit / reconnect-attempt ledger cap.
    pub max_tracked_peers: usize,
    /// Global cap on simultaneously pending pairing requests.
    pub max_pending_requests: usize,
    /// Live-session keepalive interval.
    pub ping_interval: Duration,
    /// Micro-batch flush timer.
    pub flush_interval: Duration,
    /// Micro-batch flush threshold by entry count.
    pub flush_max_entries: usize,
    /// Micro-batch flush threshold by cumulative byte count.
    pub flush_max_bytes: usize,
    /// Blob load/send pipeline batch size.
    pub blob_batch_size: usize,
    /// Per-blob send retry count.
    pub blob_retry_attempts: u32,
    /// Per-blob retry base delay (multiplied by attempt number).
    pub blob_retry_base_delay: Duration,
    /// Consecutive transient-error budget in the live loop.
    pub live_loop_max_retries: u32,
    /// Live-loop backoff base delay, doubled per attempt.
    pub live_loop_retry_base_delay: Duration,
    /// Live-loop backoff jitter (applied as +/-).
    pub live_loop_retry_jitter: Duration,
    /// Live-loop backoff ceiling.
    pub live_loop_retry_cap: Duration,
    /// Gossip re-announcement period.
    pub reannounce_interval: Duration,
    /// Gossip anti-entropy reconciliation period.
    pub reconcile_interval: Duration,
    /// Connection-repair sweep period.
    pub repair_interval: Duration,
    /// Discovery queue per-attempt stagger ceiling.
    pub discovery_stagger_max: Duration,
    /// Discovery queue concurrency.
    pub discovery_max_concurrent: usize,
    /// Discovery queue retry count.
    pub discovery_retry_attempts: u32,
    /// Discovery queue retry base delay, doubled per attempt.
    pub discovery_retry_base_delay: Duration,
    /// Pairing-request sliding window.
    pub pairing_request_window: Duration,
    /// Max pairing requests from one peer within the window.
    pub pairing_max_requests_per_window: usize,
    /// Denial backoff base, doubled per prior denial.
    pub pairing_denial_backoff_base: Duration,
    /// Denial backoff ceiling.
    pub pairing_denial_backoff_cap: Duration,
    /// Reconnect attempt budget before giving up on a peer.
    pub max_reconnect_attempts: u32,
    /// Flat backoff used after a clean disconnect (sleep/wake survival).
    pub clean_disconnect_backoff: Duration,
    /// Error-path reconnect backoff base, doubled per attempt.
    pub reconnect_backoff_base: Duration,
    /// Error-path reconnect backoff ceiling.
    pub reconnect_backoff_cap: Duration,
    /// Default receive timeout outside the live loop.
    pub receive_timeout: Duration,
    /// Timeout wrapping every `close`.
    pub close_timeout: Duration,
    /// Timeout for the vault-adoption confirmation callback (deny on expiry).
    pub vault_adoption_timeout: Duration,
    /// Timeout for opening the optional vault-key-exchange stream.
    pub key_exchange_timeout: Duration,
    /// Timeout for inbound stream-type detection.
    pub stream_type_detection_timeout: Duration,
    /// Announcement dedup window.
    pub announcement_dedup_window: Duration,
    /// Per-source announcement rate limit (count per minute).
    pub announcement_rate_limit_per_minute: usize,
    /// Stale-tracking-entry sweep period.
    pub cleanup_interval: Duration,
    /// Whether a vault-id mismatch may be resolved by adoption.
    pub allow_vault_adoption: bool,
    /// Hostname this node advertises to peers during version exchange.
    pub our_hostname: Option<String>,
    /// Nickname this node advertises to peers during version exchange.
    pub our_nickname: Option<String>,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        PeerManagerConfig {
            tombstone_ttl: Duration::from_secs(60 * 60),
            discovered_peer_ttl: Duration::from_secs(5 * 60),
            max_tracked_peers: 100,
            max_pending_requests: 10,
            ping_interval: Duration::from_secs(15),
            flush_interval: Duration::from_millis(15),
            flush_max_entries: 100,
            flush_max_bytes: 1024 * 1024,
            blob_batch_size: 8,
            blob_retry_attempts: 3,
            blob_retry_base_delay: Duration::from_millis(500),
            live_loop_max_retries: 5,
            live_loop_retry_base_delay: Duration::from_millis(500),
            live_loop_retry_jitter: Duration::from_millis(100),
            live_loop_retry_cap: Duration::from_secs(30),
            reannounce_interval: Duration::from_secs(2 * 60),
            reconcile_interval: Duration::from_secs(5 * 60),
            repair_interval: Duration::from_secs(30),
            discovery_stagger_max: Duration::from_millis(500),
            discovery_max_concurrent: 3,
            discovery_retry_attempts: 3,
            discovery_retry_base_delay: Duration::from_secs(2),
            pairing_request_window: Duration::from_secs(60),
            pairing_max_requests_per_window: 3,
            pairing_denial_backoff_base: Duration::from_secs(30),
            pairing_denial_backoff_cap: Duration::from_secs(60 * 60),
            max_reconnect_attempts: 10,
            clean_disconnect_backoff: Duration::from_secs(5),
            reconnect_backoff_base: Duration::from_millis(500),
            reconnect_backoff_cap: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            vault_adoption_timeout: Duration::from_secs(5 * 60),
            key_exchange_timeout: Duration::from_secs(30),
            stream_type_detection_timeout: Duration::from_secs(10),
            announcement_dedup_window: Duration::from_secs(5 * 60),
            announcement_rate_limit_per_minute: 20,
            cleanup_interval: Duration::from_secs(60),
            allow_vault_adoption: false,
            our_hostname: None,
            our_nickname: None,
        }
    }
}

impl PeerManagerConfig {
    pub fn with_allow_vault_adoption(mut self, allow: bool) -> Self {
        self.allow_vault_adoption = allow;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.our_hostname = Some(hostname.into());
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    /// Denial backoff for the `k`-th prior denial (1-indexed), capped.
    pub fn denial_backoff_for(&self, prior_denials: u32) -> Duration {
        if prior_denials == 0 {
            return Duration::ZERO;
        }
        let exp = prior_denials.saturating_sub(1).min(16);
        let scaled = self.pairing_denial_backoff_base.as_millis() as u64 * (1u64 << exp);
        Duration::from_millis(scaled).min(self.pairing_denial_backoff_cap)
    }

    /// Backoff for live-loop retry attempt `n` (1-indexed), pre-jitter.
    pub fn live_loop_backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self.live_loop_retry_base_delay.as_millis() as u64 * (1u64 << exp);
        Duration::from_millis(scaled).min(self.live_loop_retry_cap)
    }

    /// Backoff for reconnect attempt `n` (1-indexed) after an error close.
    pub fn reconnect_backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self.reconnect_backoff_base.as_millis() as u64 * (1u64 << exp);
        Duration::from_millis(scaled).min(self.reconnect_backoff_cap)
    }

    /// Discovery-queue retry backoff for attempt `n` (1-indexed).
    pub fn discovery_backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self.discovery_retry_base_delay.as_millis() as u64 * (1u64 << exp);
        Duration::from_millis(scaled)
    }
}

/// CLI arguments for the demo node binary.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "peervault-demo-node", about = "Two-node sync core demo")]
pub struct DemoArgs {
    /// Directory used for this node's persisted peer/blob/document state.
    #[arg(long, env = "PEERVAULT_DATA_DIR")]
    pub data_dir: std::path::PathBuf,

    /// Vault id this node starts with.
    #[arg(long, env = "PEERVAULT_VAULT_ID", default_value = "default-vault")]
    pub vault_id: String,

    /// Display hostname advertised to peers.
    #[arg(long, env = "PEERVAULT_HOSTNAME")]
    pub hostname: Option<String>,

    /// Ticket of a peer to connect to on startup, if any.
    #[arg(long)]
    pub connect_ticket: Option<String>,

    /// Allow adopting a peer's vault id on mismatch.
    #[arg(long, default_value_t = false)]
    pub allow_vault_adoption: bool,

    /// Local address to listen on. Port 0 picks an ephemeral port, printed
    /// to the log so the peer ticket can be copied to another node.
    #[arg(long, env = "PEERVAULT_LISTEN_ADDR", default_value = "127.0.0.1:0")]
    pub listen_addr: std::net::SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_backoff_after_three_denials_is_two_minutes() {
        let cfg = PeerManagerConfig::default();
        // After 3 denials: 30s * 2^2 = 120s.
        assert_eq!(cfg.denial_backoff_for(3), Duration::from_secs(120));
    }

    #[test]
    fn denial_backoff_caps_at_one_hour() {
        let cfg = PeerManagerConfig::default();
        assert_eq!(cfg.denial_backoff_for(20), Duration::from_secs(60 * 60));
    }

    #[test]
    fn denial_backoff_zero_when_no_prior_denials() {
        let cfg = PeerManagerConfig::default();
        assert_eq!(cfg.denial_backoff_for(0), Duration::ZERO);
    }

    #[test]
    fn live_loop_backoff_doubles_and_caps() {
        let cfg = PeerManagerConfig::default();
        assert_eq!(cfg.live_loop_backoff_for(1), Duration::from_millis(500));
        assert_eq!(cfg.live_loop_backoff_for(2), Duration::from_millis(1000));
        assert_eq!(cfg.live_loop_backoff_for(7), Duration::from_secs(30));
    }

    #[test]
    fn defaults_match_documented_constants() {
        let cfg = PeerManagerConfig::default();
        assert_eq!(cfg.max_tracked_peers, 100);
        assert_eq!(cfg.max_pending_requests, 10);
        assert_eq!(cfg.flush_max_entries, 100);
        assert_eq!(cfg.flush_max_bytes, 1024 * 1024);
        assert_eq!(cfg.blob_batch_size, 8);
        assert_eq!(cfg.max_reconnect_attempts, 10);
        assert_eq!(cfg.pairing_max_requests_per_window, 3);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let cfg = PeerManagerConfig::default()
            .with_allow_vault_adoption(true)
            .with_max_reconnect_attempts(3);
        assert!(cfg.allow_vault_adoption);
        assert_eq!(cfg.max_reconnect_attempts, 3);
    }
}
