//! External collaborators the sync core is abstracted over: transport,
//! document store, blob store, and persistent key/value storage.
//!
//! The concrete transport is monomorphized per `PeerManager<T: Transport>`
//! rather than boxed, so these traits use native `async fn` without
//! needing object safety.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SyncError;

/// Bidirectional framed byte stream bound to one peer connection.
pub trait SyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SyncStream for T {}

/// Classification of how a connection reaches its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Direct,
    Relay,
    Mixed,
    None,
}

/// Handle to one established connection: carries the remote node id and
/// lets the caller open additional streams on it.
#[async_trait]
pub trait Connection: Send + Sync {
    type Stream: SyncStream + 'static;

    fn peer_node_id(&self) -> &str;
    fn connection_kind(&self) -> ConnectionKind;
    async fn open_stream(&self) -> Result<Self::Stream, SyncError>;
    async fn rtt(&self) -> Option<std::time::Duration>;
    fn is_open(&self) -> bool;
    async fn close(&self);
}

/// The reliable byte-stream transport identifying peers by node id.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    fn node_id(&self) -> String;
    async fn generate_ticket(&self) -> Result<String, SyncError>;
    async fn connect_with_ticket(&self, ticket: &str) -> Result<Self::Connection, SyncError>;

    /// Number of streams queued by the transport before any callback was
    /// registered for a connection; drained once on registration.
    async fn pending_stream_count(&self, connection: &Self::Connection) -> usize;

    /// Subscribes to inbound connections. Dropping the receiver
    /// unsubscribes.
    async fn subscribe_incoming_connections(
        &self,
    ) -> tokio::sync::mpsc::UnboundedReceiver<Self::Connection>;
}

/// Abstract CRDT document store: version vectors, update export/import,
/// and a local-update notification hook.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_vault_id(&self) -> String;
    async fn set_vault_id(&self, vault_id: &str);
    async fn get_version_bytes(&self) -> Vec<u8>;
    async fn export_updates(&self) -> Vec<u8>;
    async fn import_updates(&self, updates: &[u8]) -> Result<(), SyncError>;
    /// Every blob hash currently referenced by the document.
    async fn get_all_blob_hashes(&self) -> HashSet<String>;
    /// Subscribes to locally produced updates, delivered in commit order.
    /// Dropping the returned receiver unsubscribes.
    async fn subscribe_local_updates(&self) -> tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>;
}

/// Content-addressed blob store, optional per session.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn list(&self) -> HashSet<String>;
    async fn get_missing(&self, hashes: &HashSet<String>) -> HashSet<String>;
    async fn get(&self, hash: &str) -> Option<Vec<u8>>;
    async fn get_meta(&self, hash: &str) -> Option<BlobMeta>;
    /// Verifies `hash(data) == expected_hash` before admitting it; returns
    /// false (and does not store) on mismatch.
    async fn verify_and_add(&self, data: &[u8], expected_hash: &str, mime: Option<&str>) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct BlobMeta {
    pub mime: Option<String>,
}

/// Byte key/value persistence adapter for peer manager state.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError>;
    async fn write(&self, key: &str, value: &[u8]) -> Result<(), SyncError>;
}

pub const STORAGE_KEY_PEERS: &str = "peervault-peers";
pub const STORAGE_KEY_DISCOVERED_PEERS: &str = "peervault-discovered-peers";
pub const STORAGE_KEY_TOMBSTONES: &str = "peervault-peer-tombstones";
