//! Binary wire framing for the sync protocol.
//!
//! Every frame: `u8 type, u64_be timestamp_ms`, then a type-specific
//! payload. Length-prefixed fields use 16- or 32-bit big-endian unsigned
//! counts. The codec never suspends and never scans for message
//! boundaries — the transport's own framing delimits one message.
//!
//! Follows the same shape as a dedicated binary peer-protocol crate:
//! explicit message IDs, `byteorder::BE` for multi-byte fields, and a
//! flat `thiserror` enum for the one way deserialization can fail.

use byteorder::{ByteOrder, BE};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const HEADER_LEN: usize = 9; // 1 (type) + 8 (timestamp)

const TYPE_VERSION_INFO: u8 = 0x01;
const TYPE_UPDATES: u8 = 0x02;
const TYPE_SNAPSHOT_REQUEST: u8 = 0x03;
const TYPE_SNAPSHOT: u8 = 0x04;
const TYPE_SNAPSHOT_CHUNK: u8 = 0x05;
const TYPE_SYNC_COMPLETE: u8 = 0x06;
const TYPE_ERROR: u8 = 0x07;
const TYPE_PING: u8 = 0x08;
const TYPE_PONG: u8 = 0x09;
const TYPE_BLOB_HASHES: u8 = 0x10;
const TYPE_BLOB_REQUEST: u8 = 0x11;
const TYPE_BLOB_DATA: u8 = 0x12;
const TYPE_BLOB_SYNC_COMPLETE: u8 = 0x13;
const TYPE_PEER_REMOVED: u8 = 0x20;

/// Maximum length a single peer-provided display string is allowed to be
/// after sanitization (control chars stripped, then capped at this with
/// "..." appended on truncation).
pub const MAX_SANITIZED_STRING_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageDecodeError {
    #[error("frame too short: {0} bytes, need at least {HEADER_LEN}")]
    TooShort(usize),
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("length field exceeds remaining buffer")]
    LengthOutOfBounds,
    #[error("field is not valid utf-8")]
    InvalidUtf8,
}

/// Protocol-level error codes carried by the ERROR message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unknown = 0,
    VersionMismatch = 1,
    VaultMismatch = 2,
    InvalidMessage = 3,
    InternalError = 4,
}

impl ErrorCode {
    fn from_u8(v: u8) -> ErrorCode {
        match v {
            1 => ErrorCode::VersionMismatch,
            2 => ErrorCode::VaultMismatch,
            3 => ErrorCode::InvalidMessage,
            4 => ErrorCode::InternalError,
            _ => ErrorCode::Unknown,
        }
    }
}

/// A single content-addressed blob hash as carried on the wire (hex or
/// opaque string form — the codec treats it as an opaque UTF-8 string).
pub type BlobHash = String;

/// Optional peer-discovery tail carried by some `VERSION_INFO` revisions.
/// The exact framing of this block is an explicit open question (see
/// `DESIGN.md`); we resolve it here by also reusing `VERSION_INFO`'s
/// discovery tail as the on-wire carrier for live gossip (announcements of
/// peers joining, being discovered, or having their ticket updated), which
/// is why each entry carries a kind and a timestamp rather than being a
/// bare `(node_id, ticket)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerDiscoveryBlock {
    pub peers: Vec<DiscoveryEntry>,
}

/// One gossiped peer fact: who, their current ticket, when last seen, and
/// under what circumstance (see `DISCOVERY_KIND_*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEntry {
    pub node_id: String,
    pub ticket: String,
    pub last_seen_ms: u64,
    pub kind: u8,
}

pub const DISCOVERY_KIND_JOINED: u8 = 0;
pub const DISCOVERY_KIND_DISCOVERED: u8 = 1;
pub const DISCOVERY_KIND_UPDATED: u8 = 2;

/// One decoded/encoded protocol message, paired with its frame timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    VersionInfo {
        vault_id: String,
        version: Vec<u8>,
        ticket: Option<String>,
        hostname: Option<String>,
        nickname: Option<String>,
        discovery: Option<PeerDiscoveryBlock>,
    },
    Updates {
        op_count: u32,
        data: Vec<u8>,
    },
    SnapshotRequest,
    Snapshot {
        total_size: u32,
        data: Vec<u8>,
    },
    SnapshotChunk {
        chunk_idx: u32,
        total_chunks: u32,
        data: Vec<u8>,
    },
    SyncComplete {
        version: Vec<u8>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Ping {
        seq: u32,
    },
    Pong {
        seq: u32,
    },
    BlobHashes {
        hashes: Vec<BlobHash>,
    },
    BlobRequest {
        hashes: Vec<BlobHash>,
    },
    BlobData {
        hash: BlobHash,
        mime: Option<String>,
        data: Vec<u8>,
    },
    BlobSyncComplete {
        blob_count: u32,
    },
    PeerRemoved {
        reason: Option<String>,
    },
}

/// A decoded frame: the message plus the millisecond timestamp it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub timestamp_ms: u64,
    pub message: Message,
}

/// Current wall-clock time in milliseconds, for stamping outgoing frames.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Encoding helpers ─────────────────────────────────────────────────

fn push_u16_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let mut len_buf = [0u8; 2];
    BE::write_u16(&mut len_buf, bytes.len() as u16);
    buf.extend_from_slice(&len_buf);
    buf.extend_from_slice(bytes);
}

fn push_u32_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let mut len_buf = [0u8; 4];
    BE::write_u32(&mut len_buf, bytes.len() as u32);
    buf.extend_from_slice(&len_buf);
    buf.extend_from_slice(bytes);
}

fn push_u32_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    let mut len_buf = [0u8; 4];
    BE::write_u32(&mut len_buf, data.len() as u32);
    buf.extend_from_slice(&len_buf);
    buf.extend_from_slice(data);
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BE::write_u32(&mut b, v);
    buf.extend_from_slice(&b);
}

/// Serialize a message into a single opaque frame. Total on every variant.
pub fn serialize(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    let (type_byte, mut body) = encode_body(&frame.message);
    buf.push(type_byte);
    let mut ts = [0u8; 8];
    BE::write_u64(&mut ts, frame.timestamp_ms);
    buf.extend_from_slice(&ts);
    buf.append(&mut body);
    buf
}

fn encode_body(message: &Message) -> (u8, Vec<u8>) {
    let mut buf = Vec::new();
    let type_byte = match message {
        Message::VersionInfo {
            vault_id,
            version,
            ticket,
            hostname,
            nickname,
            discovery,
        } => {
            push_u32_str(&mut buf, vault_id);
            push_u32_bytes(&mut buf, version);
            if let Some(t) = ticket {
                push_u32_str(&mut buf, t);
            }
            if let Some(h) = hostname {
                push_u32_str(&mut buf, h);
            }
            if let Some(n) = nickname {
                push_u32_str(&mut buf, n);
            }
            if let Some(block) = discovery {
                push_u32(&mut buf, block.peers.len() as u32);
                for entry in &block.peers {
                    push_u32_str(&mut buf, &entry.node_id);
                    push_u32_str(&mut buf, &entry.ticket);
                    let mut ts = [0u8; 8];
                    BE::write_u64(&mut ts, entry.last_seen_ms);
                    buf.extend_from_slice(&ts);
                    buf.push(entry.kind);
                }
            }
            TYPE_VERSION_INFO
        }
        Message::Updates { op_count, data } => {
            push_u32(&mut buf, *op_count);
            push_u32_bytes(&mut buf, data);
            TYPE_UPDATES
        }
        Message::SnapshotRequest => TYPE_SNAPSHOT_REQUEST,
        Message::Snapshot { total_size, data } => {
            push_u32(&mut buf, *total_size);
            push_u32_bytes(&mut buf, data);
            TYPE_SNAPSHOT
        }
        Message::SnapshotChunk {
            chunk_idx,
            total_chunks,
            data,
        } => {
            push_u32(&mut buf, *chunk_idx);
            push_u32(&mut buf, *total_chunks);
            push_u32_bytes(&mut buf, data);
            TYPE_SNAPSHOT_CHUNK
        }
        Message::SyncComplete { version } => {
            push_u32_bytes(&mut buf, version);
            TYPE_SYNC_COMPLETE
        }
        Message::Error { code, message } => {
            buf.push(*code as u8);
            push_u32_str(&mut buf, message);
            TYPE_ERROR
        }
        Message::Ping { seq } => {
            push_u32(&mut buf, *seq);
            TYPE_PING
        }
        Message::Pong { seq } => {
            push_u32(&mut buf, *seq);
            TYPE_PONG
        }
        Message::BlobHashes { hashes } => {
            push_u32(&mut buf, hashes.len() as u32);
            for h in hashes {
                push_u16_str(&mut buf, h);
            }
            TYPE_BLOB_HASHES
        }
        Message::BlobRequest { hashes } => {
            push_u32(&mut buf, hashes.len() as u32);
            for h in hashes {
                push_u16_str(&mut buf, h);
            }
            TYPE_BLOB_REQUEST
        }
        Message::BlobData { hash, mime, data } => {
            push_u16_str(&mut buf, hash);
            push_u16_str(&mut buf, mime.as_deref().unwrap_or(""));
            push_u32_bytes(&mut buf, data);
            TYPE_BLOB_DATA
        }
        Message::BlobSyncComplete { blob_count } => {
            push_u32(&mut buf, *blob_count);
            TYPE_BLOB_SYNC_COMPLETE
        }
        Message::PeerRemoved { reason } => {
            if let Some(r) = reason {
                push_u32_str(&mut buf, r);
            }
            TYPE_PEER_REMOVED
        }
    };
    (type_byte, buf)
}

// ── Decoding ─────────────────────────────────────────────────────────

/// Cursor over an immutable byte slice with bounds-checked big-endian reads.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn has_remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    fn read_u8(&mut self) -> Result<u8, MessageDecodeError> {
        if self.remaining() < 1 {
            return Err(MessageDecodeError::LengthOutOfBounds);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u16(&mut self) -> Result<u16, MessageDecodeError> {
        if self.remaining() < 2 {
            return Err(MessageDecodeError::LengthOutOfBounds);
        }
        let v = BE::read_u16(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(v)
    }

    fn read_u32(&mut self) -> Result<u32, MessageDecodeError> {
        if self.remaining() < 4 {
            return Err(MessageDecodeError::LengthOutOfBounds);
        }
        let v = BE::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    fn read_u64(&mut self) -> Result<u64, MessageDecodeError> {
        if self.remaining() < 8 {
            return Err(MessageDecodeError::LengthOutOfBounds);
        }
        let v = BE::read_u64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], MessageDecodeError> {
        if self.remaining() < len {
            return Err(MessageDecodeError::LengthOutOfBounds);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u16_str(&mut self) -> Result<String, MessageDecodeError> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| MessageDecodeError::InvalidUtf8)
    }

    fn read_u32_str(&mut self) -> Result<String, MessageDecodeError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| MessageDecodeError::InvalidUtf8)
    }

    fn read_u32_bytes(&mut self) -> Result<Vec<u8>, MessageDecodeError> {
        let len = self.read_u32()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }
}

/// Deserialize a single opaque frame. Unknown type, a frame shorter than
/// the header, or any length field exceeding the remaining buffer all
/// yield `InvalidMessage`-equivalent errors (callers map these to
/// `SyncError::InvalidMessage`).
pub fn deserialize(buf: &[u8]) -> Result<Frame, MessageDecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(MessageDecodeError::TooShort(buf.len()));
    }
    let mut cur = Cursor::new(buf);
    let type_byte = cur.read_u8()?;
    let timestamp_ms = cur.read_u64()?;

    let message = match type_byte {
        TYPE_VERSION_INFO => {
            let vault_id = cur.read_u32_str()?;
            let version = cur.read_u32_bytes()?;
            // Optional tail fields are present iff enough bytes remain —
            // this is the forward-compatibility rule: we try to read each
            // in order and simply stop (keeping what we parsed) the moment
            // there isn't enough left for the next one.
            let mut ticket = None;
            let mut hostname = None;
            let mut nickname = None;
            let mut discovery = None;
            if cur.has_remaining() {
                if let Ok(t) = cur.read_u32_str() {
                    ticket = Some(t);
                    if cur.has_remaining() {
                        if let Ok(h) = cur.read_u32_str() {
                            hostname = Some(h);
                            if cur.has_remaining() {
                                if let Ok(n) = cur.read_u32_str() {
                                    nickname = Some(n);
                                    if cur.has_remaining() {
                                        if let Ok(count) = cur.read_u32() {
                                            let mut peers = Vec::with_capacity(count as usize);
                                            let mut ok = true;
                                            for _ in 0..count {
                                                match (
                                                    cur.read_u32_str(),
                                                    cur.read_u32_str(),
                                                    cur.read_u64(),
                                                    cur.read_u8(),
                                                ) {
                                                    (Ok(id), Ok(tk), Ok(ts), Ok(kind)) => {
                                                        peers.push(DiscoveryEntry {
                                                            node_id: id,
                                                            ticket: tk,
                                                            last_seen_ms: ts,
                                                            kind,
                                                        })
                                                    }
                                                    _ => {
                                                        ok = false;
                                                        break;
                                                    }
                                                }
                                            }
                                            if ok {
                                                discovery = Some(PeerDiscoveryBlock { peers });
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Message::VersionInfo {
                vault_id,
                version,
                ticket,
                hostname,
                nickname,
                discovery,
            }
        }
        TYPE_UPDATES => {
            let op_count = cur.read_u32()?;
            let data = cur.read_u32_bytes()?;
            Message::Updates { op_count, data }
        }
        TYPE_SNAPSHOT_REQUEST => Message::SnapshotRequest,
        TYPE_SNAPSHOT => {
            let total_size = cur.read_u32()?;
            let data = cur.read_u32_bytes()?;
            Message::Snapshot { total_size, data }
        }
        TYPE_SNAPSHOT_CHUNK => {
            let chunk_idx = cur.read_u32()?;
            let total_chunks = cur.read_u32()?;
            let data = cur.read_u32_bytes()?;
            Message::SnapshotChunk {
                chunk_idx,
                total_chunks,
                data,
            }
        }
        TYPE_SYNC_COMPLETE => {
            let version = cur.read_u32_bytes()?;
            Message::SyncComplete { version }
        }
        TYPE_ERROR => {
            let code = ErrorCode::from_u8(cur.read_u8()?);
            let message = cur.read_u32_str()?;
            Message::Error { code, message }
        }
        TYPE_PING => Message::Ping { seq: cur.read_u32()? },
        TYPE_PONG => Message::Pong { seq: cur.read_u32()? },
        TYPE_BLOB_HASHES => {
            let n = cur.read_u32()?;
            let mut hashes = Vec::with_capacity(n as usize);
            for _ in 0..n {
                hashes.push(cur.read_u16_str()?);
            }
            Message::BlobHashes { hashes }
        }
        TYPE_BLOB_REQUEST => {
            let n = cur.read_u32()?;
            let mut hashes = Vec::with_capacity(n as usize);
            for _ in 0..n {
                hashes.push(cur.read_u16_str()?);
            }
            Message::BlobRequest { hashes }
        }
        TYPE_BLOB_DATA => {
            let hash = cur.read_u16_str()?;
            let mime_raw = cur.read_u16_str()?;
            let mime = if mime_raw.is_empty() { None } else { Some(mime_raw) };
            let data = cur.read_u32_bytes()?;
            Message::BlobData { hash, mime, data }
        }
        TYPE_BLOB_SYNC_COMPLETE => Message::BlobSyncComplete {
            blob_count: cur.read_u32()?,
        },
        TYPE_PEER_REMOVED => {
            let reason = if cur.has_remaining() {
                cur.read_u32_str().ok()
            } else {
                None
            };
            Message::PeerRemoved { reason }
        }
        other => return Err(MessageDecodeError::UnknownType(other)),
    };

    Ok(Frame {
        timestamp_ms,
        message,
    })
}

/// Strip control characters and cap a peer-provided display string at
/// `MAX_SANITIZED_STRING_LEN`, appending `"..."` when truncated.
pub fn sanitize_display_string(input: &str) -> String {
    let cleaned: String = input.chars().filter(|c| !c.is_control()).collect();
    if cleaned.chars().count() <= MAX_SANITIZED_STRING_LEN {
        return cleaned;
    }
    let truncated: String = cleaned.chars().take(MAX_SANITIZED_STRING_LEN).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let frame = Frame {
            timestamp_ms: 1_700_000_000_123,
            message,
        };
        let bytes = serialize(&frame);
        let decoded = deserialize(&bytes).expect("must decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn version_info_roundtrip_minimal() {
        roundtrip(Message::VersionInfo {
            vault_id: "V".into(),
            version: vec![],
            ticket: None,
            hostname: None,
            nickname: None,
            discovery: None,
        });
    }

    #[test]
    fn version_info_roundtrip_full_tail() {
        roundtrip(Message::VersionInfo {
            vault_id: "vault-😀".into(),
            version: vec![1, 2, 3],
            ticket: Some("T_A".into()),
            hostname: Some("laptop".into()),
            nickname: Some("alice".into()),
            discovery: Some(PeerDiscoveryBlock {
                peers: vec![DiscoveryEntry {
                    node_id: "node-a".into(),
                    ticket: "ticket-a".into(),
                    last_seen_ms: 1_700_000_000_000,
                    kind: DISCOVERY_KIND_DISCOVERED,
                }],
            }),
        });
    }

    #[test]
    fn updates_roundtrip_empty() {
        roundtrip(Message::Updates {
            op_count: 0,
            data: vec![],
        });
    }

    #[test]
    fn updates_roundtrip_nonempty() {
        roundtrip(Message::Updates {
            op_count: 3,
            data: vec![9, 9, 9, 9, 9],
        });
    }

    #[test]
    fn snapshot_request_roundtrip() {
        roundtrip(Message::SnapshotRequest);
    }

    #[test]
    fn blob_hashes_roundtrip() {
        roundtrip(Message::BlobHashes {
            hashes: vec!["abc123".into(), "def456".into()],
        });
    }

    #[test]
    fn blob_data_roundtrip_with_mime() {
        roundtrip(Message::BlobData {
            hash: "h1".into(),
            mime: Some("image/png".into()),
            data: vec![0xff, 0xd8],
        });
    }

    #[test]
    fn blob_data_roundtrip_without_mime() {
        roundtrip(Message::BlobData {
            hash: "h1".into(),
            mime: None,
            data: vec![],
        });
    }

    #[test]
    fn error_roundtrip() {
        roundtrip(Message::Error {
            code: ErrorCode::VaultMismatch,
            message: "Vault ID mismatch".into(),
        });
    }

    #[test]
    fn peer_removed_roundtrip_with_and_without_reason() {
        roundtrip(Message::PeerRemoved {
            reason: Some("removed by user".into()),
        });
        roundtrip(Message::PeerRemoved { reason: None });
    }

    #[test]
    fn ping_pong_roundtrip() {
        roundtrip(Message::Ping { seq: 42 });
        roundtrip(Message::Pong { seq: 42 });
    }

    #[test]
    fn timestamp_is_preserved_exactly() {
        let frame = Frame {
            timestamp_ms: 1_234_567_890_123,
            message: Message::SnapshotRequest,
        };
        let bytes = serialize(&frame);
        let decoded = deserialize(&bytes).unwrap();
        assert_eq!(decoded.timestamp_ms, 1_234_567_890_123);
    }

    #[test]
    fn unknown_type_is_invalid_message() {
        let mut bytes = vec![0xAB];
        bytes.extend_from_slice(&[0u8; 8]);
        let err = deserialize(&bytes).unwrap_err();
        assert_eq!(err, MessageDecodeError::UnknownType(0xAB));
    }

    #[test]
    fn truncated_header_is_invalid_message() {
        let bytes = vec![0x08, 0, 0, 0]; // type + 3 bytes of timestamp
        let err = deserialize(&bytes).unwrap_err();
        assert!(matches!(err, MessageDecodeError::TooShort(_)));
    }

    #[test]
    fn length_field_exceeding_buffer_is_invalid_message() {
        let mut bytes = vec![TYPE_UPDATES];
        bytes.extend_from_slice(&[0u8; 8]); // timestamp
        bytes.extend_from_slice(&5u32.to_be_bytes()); // op_count
        bytes.extend_from_slice(&1000u32.to_be_bytes()); // data_len claims 1000 bytes
        bytes.extend_from_slice(&[1, 2, 3]); // but only 3 are present
        let err = deserialize(&bytes).unwrap_err();
        assert_eq!(err, MessageDecodeError::LengthOutOfBounds);
    }

    #[test]
    fn trailing_unknown_bytes_do_not_break_known_prefix() {
        let frame = Frame {
            timestamp_ms: 42,
            message: Message::VersionInfo {
                vault_id: "V".into(),
                version: vec![],
                ticket: Some("T".into()),
                hostname: None,
                nickname: None,
                discovery: None,
            },
        };
        let mut bytes = serialize(&frame);
        bytes.extend_from_slice(b"future-extension-bytes");
        let decoded = deserialize(&bytes).unwrap();
        assert_eq!(decoded.message, frame.message);
    }

    #[test]
    fn sanitize_strips_control_chars_and_caps_length() {
        assert_eq!(sanitize_display_string("hello\tworld\n"), "helloworld");
        let long = "a".repeat(100);
        let sanitized = sanitize_display_string(&long);
        assert_eq!(sanitized.len(), 64 + 3);
        assert!(sanitized.ends_with("..."));
    }

    #[test]
    fn sanitize_leaves_short_strings_alone() {
        assert_eq!(sanitize_display_string("alice"), "alice");
    }
}
