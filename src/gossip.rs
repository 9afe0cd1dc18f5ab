//! Peer gossip: announcement deduplication and per-source rate limiting.
//!
//! Kept separate from `peer_manager` because both the dedup window and
//! the rate-limit ledger are pure bookkeeping with no I/O, easy to reason
//! about and test in isolation.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

/// Deduplicates `(announced_node_id, source_node_id)` pairs for a fixed
/// window, and separately rate-limits per-source announcement volume.
pub struct AnnouncementGuard {
    seen: HashMap<(String, String), DateTime<Utc>>,
    per_source: HashMap<String, VecDeque<DateTime<Utc>>>,
    dedup_window: chrono::Duration,
    rate_limit_per_minute: usize,
}

impl AnnouncementGuard {
    pub fn new(dedup_window: chrono::Duration, rate_limit_per_minute: usize) -> Self {
        AnnouncementGuard {
            seen: HashMap::new(),
            per_source: HashMap::new(),
            dedup_window,
            rate_limit_per_minute,
        }
    }

    /// Returns true if this announcement should be processed: it is
    /// neither a recent duplicate nor over its source's rate limit.
    /// Recording happens as a side effect of a successful check.
    pub fn admit(&mut self, announced_node_id: &str, source_node_id: &str, now: DateTime<Utc>) -> bool {
        let key = (announced_node_id.to_string(), source_node_id.to_string());
        if let Some(seen_at) = self.seen.get(&key) {
            if now.signed_duration_since(*seen_at) < self.dedup_window {
                return false;
            }
        }

        let window = self
            .per_source
            .entry(source_node_id.to_string())
            .or_default();
        let one_minute_ago = now - chrono::Duration::minutes(1);
        while window.front().is_some_and(|t| *t < one_minute_ago) {
            window.pop_front();
        }
        if window.len() >= self.rate_limit_per_minute {
            return false;
        }
        window.push_back(now);

        self.seen.insert(key, now);
        true
    }

    /// Evicts dedup entries and empty rate-limit windows older than the
    /// configured thresholds; piggybacked on the periodic stale-entry
    /// sweep.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        self.seen
            .retain(|_, seen_at| now.signed_duration_since(*seen_at) < self.dedup_window);
        self.per_source.retain(|_, window| {
            let one_minute_ago = now - chrono::Duration::minutes(1);
            window.retain(|t| *t >= one_minute_ago);
            !window.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_announcement_is_admitted() {
        let mut guard = AnnouncementGuard::new(chrono::Duration::minutes(5), 20);
        assert!(guard.admit("peer-a", "source-x", Utc::now()));
    }

    #[test]
    fn duplicate_within_window_is_rejected() {
        let mut guard = AnnouncementGuard::new(chrono::Duration::minutes(5), 20);
        let now = Utc::now();
        assert!(guard.admit("peer-a", "source-x", now));
        assert!(!guard.admit("peer-a", "source-x", now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn duplicate_after_window_is_readmitted() {
        let mut guard = AnnouncementGuard::new(chrono::Duration::minutes(5), 20);
        let now = Utc::now();
        assert!(guard.admit("peer-a", "source-x", now));
        assert!(guard.admit("peer-a", "source-x", now + chrono::Duration::minutes(6)));
    }

    #[test]
    fn different_source_is_not_deduplicated() {
        let mut guard = AnnouncementGuard::new(chrono::Duration::minutes(5), 20);
        let now = Utc::now();
        assert!(guard.admit("peer-a", "source-x", now));
        assert!(guard.admit("peer-a", "source-y", now));
    }

    #[test]
    fn per_source_rate_limit_enforced() {
        let mut guard = AnnouncementGuard::new(chrono::Duration::minutes(5), 2);
        let now = Utc::now();
        assert!(guard.admit("peer-a", "source-x", now));
        assert!(guard.admit("peer-b", "source-x", now));
        assert!(!guard.admit("peer-c", "source-x", now));
    }

    #[test]
    fn sweep_removes_stale_entries() {
        let mut guard = AnnouncementGuard::new(chrono::Duration::minutes(5), 20);
        let old = Utc::now() - chrono::Duration::minutes(10);
        guard.admit("peer-a", "source-x", old);
        guard.sweep(Utc::now());
        assert!(guard.seen.is_empty());
    }
}
