//! Peer-to-peer synchronization core for a distributed vault.
//!
//! Three pieces, leaves first: [`wire`] (binary frame codec), [`session`]
//! (the per-peer protocol state machine), and [`peer_manager`] (peer
//! lifecycle, gossip, pairing policy). The CRDT engine, transport, blob
//! backing store, and persistence are external collaborators, expressed
//! as traits in [`traits`].

pub mod config;
pub mod demo_support;
pub mod error;
pub mod events;
pub mod gossip;
pub mod peer_manager;
pub mod peer_record;
pub mod session;
pub mod traits;
pub mod wire;

pub use config::PeerManagerConfig;
pub use error::SyncError;
pub use peer_manager::PeerManager;
pub use session::SyncSession;
