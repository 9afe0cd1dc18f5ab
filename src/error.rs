//! Error taxonomy for the sync core.
//!
//! One flat enum, one variant per failure kind: no nested causes beyond
//! `#[from]`, a `#[error("...")]` string per variant.

use thiserror::Error;

/// Errors raised by the wire codec, sync session, and peer manager.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation timed out")]
    Timeout,

    #[error("vault id mismatch")]
    VaultMismatch,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited")]
    RateLimited,

    #[error("blob integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("duplicate operation: {0}")]
    DuplicateOperation(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Classify whether this error should be retried with backoff inside
    /// the live loop. The non-transient keyword list is checked first — it
    /// dominates.
    pub fn is_transient(&self) -> bool {
        is_transient_message(&self.to_string())
    }
}

const NON_TRANSIENT_KEYWORDS: &[&str] = &[
    "protocol",
    "mismatch",
    "invalid",
    "denied",
    "removed",
    "vault id",
];

const TRANSIENT_KEYWORDS: &[&str] = &[
    "timeout",
    "network",
    "connection",
    "econnreset",
    "econnrefused",
    "enotconn",
    "ehostunreach",
    "enetunreach",
    "epipe",
    "temporarily",
    "stream",
    "closed unexpectedly",
    "aborted",
    "reset by peer",
    "broken pipe",
];

/// Keyword-based classification, operating on a message's lowercase
/// `Display` text. Exposed standalone so callers that only have a string
/// (e.g. an error surfaced from the transport) can classify it too.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    if NON_TRANSIENT_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return false;
    }
    TRANSIENT_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_timeout_is_transient() {
        assert!(is_transient_message("connection timed out"));
        assert!(is_transient_message("broken pipe"));
        assert!(is_transient_message("ECONNRESET"));
    }

    #[test]
    fn protocol_errors_are_not_transient() {
        assert!(!is_transient_message("protocol error: unexpected message type"));
        assert!(!is_transient_message("vault id mismatch"));
        assert!(!is_transient_message("peer was removed"));
    }

    #[test]
    fn non_transient_dominates_even_with_transient_words() {
        // Contains "connection" (transient) AND "denied" (non-transient).
        assert!(!is_transient_message("connection denied"));
    }

    #[test]
    fn unrelated_messages_are_not_transient() {
        assert!(!is_transient_message("internal error"));
    }
}
