//! Data-model types owned by the peer manager: peer records, tombstones,
//! discovered-peer entries, and peer health tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const HEALTH_HISTORY_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Unknown,
    Connecting,
    Syncing,
    Synced,
    Offline,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Disconnected,
    Poor,
    Fair,
    Good,
    Excellent,
}

/// Rolling RTT history and derived connection quality for one peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerHealth {
    #[serde(skip)]
    rtt_samples_ms: VecDeque<f64>,
    pub average_rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub consecutive_failed_pings: u32,
}

impl PeerHealth {
    pub fn record_rtt(&mut self, rtt_ms: f64) {
        self.consecutive_failed_pings = 0;
        if self.rtt_samples_ms.len() == HEALTH_HISTORY_CAP {
            self.rtt_samples_ms.pop_front();
        }
        self.rtt_samples_ms.push_back(rtt_ms);
        self.recompute();
    }

    pub fn record_failed_ping(&mut self) {
        self.consecutive_failed_pings += 1;
    }

    fn recompute(&mut self) {
        let n = self.rtt_samples_ms.len();
        if n == 0 {
            self.average_rtt_ms = None;
            self.jitter_ms = None;
            return;
        }
        let sum: f64 = self.rtt_samples_ms.iter().sum();
        let avg = sum / n as f64;
        let variance = self
            .rtt_samples_ms
            .iter()
            .map(|v| (v - avg).powi(2))
            .sum::<f64>()
            / n as f64;
        self.average_rtt_ms = Some(avg);
        self.jitter_ms = Some(variance.sqrt());
    }

    pub fn quality(&self) -> Quality {
        if self.consecutive_failed_pings >= 3 {
            return Quality::Disconnected;
        }
        match self.average_rtt_ms {
            None => Quality::Fair,
            Some(avg) if avg < 50.0 => Quality::Excellent,
            Some(avg) if avg < 150.0 => Quality::Good,
            Some(avg) if avg < 400.0 => Quality::Fair,
            Some(_) => Quality::Poor,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BandwidthCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A peer this node has paired with or auto-accepted. `node_id` is
/// immutable once the record exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub node_id: String,
    pub hostname: Option<String>,
    pub nickname: Option<String>,
    pub ticket: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_synced: Option<DateTime<Utc>>,
    pub trusted: bool,
    pub state: PeerState,
    pub health: Option<PeerHealth>,
    pub bandwidth: Option<BandwidthCounters>,
}

impl PeerRecord {
    pub fn new(node_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let node_id = node_id.into();
        PeerRecord {
            node_id,
            hostname: None,
            nickname: None,
            ticket: None,
            first_seen: now,
            last_seen: now,
            last_synced: None,
            trusted: true,
            state: PeerState::Unknown,
            health: None,
            bandwidth: None,
        }
    }

    pub fn touch_last_seen(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.touch_last_seen(now);
        self.last_synced = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TombstoneReason {
    Removed,
    Left,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub node_id: String,
    pub removed_at: DateTime<Utc>,
    pub reason: TombstoneReason,
}

impl Tombstone {
    pub fn is_live(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.removed_at) < ttl
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownPeerInfo {
    pub node_id: String,
    pub ticket: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPeerEntry {
    pub info: KnownPeerInfo,
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredPeerEntry {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.discovered_at) >= ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncementKind {
    Joined,
    Discovered,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownPeerAnnouncement {
    pub kind: AnnouncementKind,
    pub node_id: String,
    pub ticket: String,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_record_invariant_first_seen_le_last_seen() {
        let now = Utc::now();
        let mut rec = PeerRecord::new("node-a", now);
        let later = now + chrono::Duration::seconds(10);
        rec.touch_last_seen(later);
        assert!(rec.first_seen <= rec.last_seen);
    }

    #[test]
    fn peer_record_touch_last_seen_never_goes_backward() {
        let now = Utc::now();
        let mut rec = PeerRecord::new("node-a", now);
        let earlier = now - chrono::Duration::seconds(10);
        rec.touch_last_seen(earlier);
        assert_eq!(rec.last_seen, now);
    }

    #[test]
    fn mark_synced_implies_last_synced_le_last_seen() {
        let now = Utc::now();
        let mut rec = PeerRecord::new("node-a", now);
        rec.mark_synced(now);
        assert!(rec.last_synced.unwrap() <= rec.last_seen);
    }

    #[test]
    fn tombstone_expires_after_ttl() {
        let removed_at = Utc::now() - chrono::Duration::minutes(61);
        let tombstone = Tombstone {
            node_id: "n".into(),
            removed_at,
            reason: TombstoneReason::Removed,
        };
        assert!(!tombstone.is_live(Utc::now(), chrono::Duration::hours(1)));
    }

    #[test]
    fn tombstone_live_within_ttl() {
        let removed_at = Utc::now() - chrono::Duration::minutes(5);
        let tombstone = Tombstone {
            node_id: "n".into(),
            removed_at,
            reason: TombstoneReason::Removed,
        };
        assert!(tombstone.is_live(Utc::now(), chrono::Duration::hours(1)));
    }

    #[test]
    fn health_quality_degrades_with_failed_pings() {
        let mut health = PeerHealth::default();
        health.record_rtt(10.0);
        assert_eq!(health.quality(), Quality::Excellent);
        health.record_failed_ping();
        health.record_failed_ping();
        health.record_failed_ping();
        assert_eq!(health.quality(), Quality::Disconnected);
    }

    #[test]
    fn health_history_caps_at_twenty_samples() {
        let mut health = PeerHealth::default();
        for i in 0..30 {
            health.record_rtt(i as f64);
        }
        assert_eq!(health.rtt_samples_ms.len(), HEALTH_HISTORY_CAP);
    }

    #[test]
    fn discovered_peer_entry_expires_after_five_minutes() {
        let discovered_at = Utc::now() - chrono::Duration::minutes(6);
        let entry = DiscoveredPeerEntry {
            info: KnownPeerInfo {
                node_id: "n".into(),
                ticket: "t".into(),
                last_seen: Utc::now(),
            },
            discovered_at,
        };
        assert!(entry.is_expired(Utc::now(), chrono::Duration::minutes(5)));
    }
}
