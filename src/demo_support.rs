//! Minimal in-memory/in-process implementations of the external traits,
//! used by the demo binary and by integration tests. Not part of the
//! sync core itself.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::SyncError;
use crate::traits::{BlobMeta, BlobStore, Connection, ConnectionKind, DocumentStore, StorageAdapter, Transport};

/// A trivial document store: holds one opaque "changeset" blob as its
/// entire history and forwards local writes to subscribers verbatim.
/// Good enough to drive the sync protocol end to end without a real CRDT.
pub struct InMemoryDocumentStore {
    vault_id: Mutex<String>,
    changes: Mutex<Vec<u8>>,
    blob_hashes: Mutex<HashSet<String>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl InMemoryDocumentStore {
    pub fn new(vault_id: impl Into<String>) -> Self {
        InMemoryDocumentStore {
            vault_id: Mutex::new(vault_id.into()),
            changes: Mutex::new(Vec::new()),
            blob_hashes: Mutex::new(HashSet::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Simulates a local edit: appends to the changeset and notifies
    /// every live subscriber, the way a real CRDT's commit hook would.
    pub fn apply_local_update(&self, update: Vec<u8>) {
        self.changes.lock().unwrap().extend_from_slice(&update);
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(update.clone()).is_ok());
    }

    pub fn reference_blob(&self, hash: impl Into<String>) {
        self.blob_hashes.lock().unwrap().insert(hash.into());
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_vault_id(&self) -> String {
        self.vault_id.lock().unwrap().clone()
    }

    async fn set_vault_id(&self, vault_id: &str) {
        *self.vault_id.lock().unwrap() = vault_id.to_string();
    }

    async fn get_version_bytes(&self) -> Vec<u8> {
        self.changes.lock().unwrap().clone()
    }

    async fn export_updates(&self) -> Vec<u8> {
        self.changes.lock().unwrap().clone()
    }

    async fn import_updates(&self, updates: &[u8]) -> Result<(), SyncError> {
        self.changes.lock().unwrap().extend_from_slice(updates);
        Ok(())
    }

    async fn get_all_blob_hashes(&self) -> HashSet<String> {
        self.blob_hashes.lock().unwrap().clone()
    }

    async fn subscribe_local_updates(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

/// Content-addressed blob store keyed by lowercase hex SHA-256.
pub struct InMemoryBlobStore {
    blobs: Mutex<std::collections::HashMap<String, (Vec<u8>, Option<String>)>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        InMemoryBlobStore {
            blobs: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn hash_of(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    pub fn insert_local(&self, data: Vec<u8>, mime: Option<String>) -> String {
        let hash = Self::hash_of(&data);
        self.blobs.lock().unwrap().insert(hash.clone(), (data, mime));
        hash
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn list(&self) -> HashSet<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }

    async fn get_missing(&self, hashes: &HashSet<String>) -> HashSet<String> {
        let have = self.blobs.lock().unwrap();
        hashes.iter().filter(|h| !have.contains_key(*h)).cloned().collect()
    }

    async fn get(&self, hash: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(hash).map(|(data, _)| data.clone())
    }

    async fn get_meta(&self, hash: &str) -> Option<BlobMeta> {
        self.blobs
            .lock()
            .unwrap()
            .get(hash)
            .map(|(_, mime)| BlobMeta { mime: mime.clone() })
    }

    async fn verify_and_add(&self, data: &[u8], expected_hash: &str, mime: Option<&str>) -> bool {
        if Self::hash_of(data) != expected_hash {
            return false;
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(expected_hash.to_string(), (data.to_vec(), mime.map(str::to_string)));
        true
    }
}

/// File-backed key/value storage adapter: one file per key under a root
/// directory.
pub struct FileStorageAdapter {
    root: std::path::PathBuf,
}

impl FileStorageAdapter {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        FileStorageAdapter { root: root.into() }
    }

    fn path_for(&self, key: &str) -> std::path::PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

#[async_trait]
impl StorageAdapter for FileStorageAdapter {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Io(e)),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), SyncError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(SyncError::Io)?;
        tokio::fs::write(self.path_for(key), value).await.map_err(SyncError::Io)
    }
}

/// Plain TCP transport for the demo binary. One bidirectional stream per
/// connection; a `TcpStream` is already `AsyncRead + AsyncWrite`, so there's
/// no bridging layer to speak of. Tickets are `node_id@host:port`; identity
/// is exchanged with a tiny length-prefixed handshake before the connection
/// is handed back.
pub struct DemoConnection {
    peer_node_id: String,
    stream: AsyncMutex<Option<TcpStream>>,
    open: AtomicBool,
}

#[async_trait]
impl Connection for DemoConnection {
    type Stream = TcpStream;

    fn peer_node_id(&self) -> &str {
        &self.peer_node_id
    }

    fn connection_kind(&self) -> ConnectionKind {
        ConnectionKind::Direct
    }

    async fn open_stream(&self) -> Result<TcpStream, SyncError> {
        self.stream
            .lock()
            .await
            .take()
            .ok_or_else(|| SyncError::Transport("stream already taken".into()))
    }

    async fn rtt(&self) -> Option<std::time::Duration> {
        None
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
        self.stream.lock().await.take();
    }
}

async fn handshake(stream: &mut TcpStream, my_node_id: &str) -> std::io::Result<String> {
    let (mut rd, mut wr) = stream.split();
    let write_fut = async {
        let bytes = my_node_id.as_bytes();
        wr.write_u16(bytes.len() as u16).await?;
        wr.write_all(bytes).await
    };
    let read_fut = async {
        let len = rd.read_u16().await?;
        let mut buf = vec![0u8; len as usize];
        rd.read_exact(&mut buf).await?;
        String::from_utf8(buf)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-utf8 node id"))
    };
    let (w, r) = tokio::join!(write_fut, read_fut);
    w?;
    r
}

pub struct DemoTransport {
    node_id: String,
    local_addr: SocketAddr,
    incoming_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<DemoConnection>>>,
}

impl DemoTransport {
    /// Binds a listener and spawns its accept loop. The accept loop runs
    /// for the lifetime of the returned transport; there is no explicit
    /// stop short of dropping the process, matching the demo's scope.
    pub async fn bind(node_id: String, bind_addr: SocketAddr) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let accept_node_id = node_id.clone();

        tokio::spawn(async move {
            loop {
                let (mut stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "demo transport accept failed");
                        break;
                    }
                };
                let tx = tx.clone();
                let my_id = accept_node_id.clone();
                tokio::spawn(async move {
                    match handshake(&mut stream, &my_id).await {
                        Ok(peer_node_id) => {
                            tracing::info!(%peer_addr, %peer_node_id, "inbound demo connection");
                            let conn = DemoConnection {
                                peer_node_id,
                                stream: AsyncMutex::new(Some(stream)),
                                open: AtomicBool::new(true),
                            };
                            let _ = tx.send(conn);
                        }
                        Err(e) => {
                            tracing::warn!(%peer_addr, error = %e, "inbound demo handshake failed");
                        }
                    }
                });
            }
        });

        Ok(Arc::new(DemoTransport {
            node_id,
            local_addr,
            incoming_rx: AsyncMutex::new(Some(rx)),
        }))
    }

    fn parse_ticket(ticket: &str) -> Result<(String, SocketAddr), SyncError> {
        let (node_id, addr) = ticket
            .split_once('@')
            .ok_or_else(|| SyncError::InvalidMessage(format!("malformed ticket: {ticket}")))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| SyncError::InvalidMessage(format!("malformed ticket address: {addr}")))?;
        Ok((node_id.to_string(), addr))
    }
}

#[async_trait]
impl Transport for DemoTransport {
    type Connection = DemoConnection;

    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    async fn generate_ticket(&self) -> Result<String, SyncError> {
        Ok(format!("{}@{}", self.node_id, self.local_addr))
    }

    async fn connect_with_ticket(&self, ticket: &str) -> Result<DemoConnection, SyncError> {
        let (_claimed_node_id, addr) = Self::parse_ticket(ticket)?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let peer_node_id = handshake(&mut stream, &self.node_id)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(DemoConnection {
            peer_node_id,
            stream: AsyncMutex::new(Some(stream)),
            open: AtomicBool::new(true),
        })
    }

    async fn pending_stream_count(&self, _connection: &DemoConnection) -> usize {
        0
    }

    async fn subscribe_incoming_connections(&self) -> mpsc::UnboundedReceiver<DemoConnection> {
        match self.incoming_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                let (_tx, rx) = mpsc::unbounded_channel();
                rx
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn document_store_local_update_reaches_subscriber() {
        let store = InMemoryDocumentStore::new("vault-1");
        let mut rx = store.subscribe_local_updates().await;
        store.apply_local_update(vec![1, 2, 3]);
        let update = rx.recv().await.unwrap();
        assert_eq!(update, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn blob_store_rejects_mismatched_hash() {
        let store = InMemoryBlobStore::new();
        let ok = store.verify_and_add(b"hello", "not-the-real-hash", None).await;
        assert!(!ok);
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn blob_store_accepts_matching_hash() {
        let store = InMemoryBlobStore::new();
        let hash = InMemoryBlobStore::hash_of(b"hello");
        let ok = store.verify_and_add(b"hello", &hash, Some("text/plain")).await;
        assert!(ok);
        assert_eq!(store.get(&hash).await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn file_storage_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorageAdapter::new(dir.path());
        storage.write("k", b"v").await.unwrap();
        assert_eq!(storage.read("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(storage.read("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn demo_transport_handshake_exchanges_node_ids() {
        let listener_side = DemoTransport::bind("node-b".to_string(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let ticket = listener_side.generate_ticket().await.unwrap();

        let dialer_side = DemoTransport::bind("node-a".to_string(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut incoming = listener_side.subscribe_incoming_connections().await;

        let outbound = dialer_side.connect_with_ticket(&ticket).await.unwrap();
        assert_eq!(outbound.peer_node_id(), "node-b");

        let inbound = incoming.recv().await.unwrap();
        assert_eq!(inbound.peer_node_id(), "node-a");
    }
}
