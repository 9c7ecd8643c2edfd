//! # Rune Relic Session Authentication
//!
//! Admits remote peers over UDP and TCP and validates their traffic once admitted.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  RUNE RELIC AUTH LAYER                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  crypto/          - Keyed primitives                         │
//! │  ├── mac.rs       - ChaCha20-Poly1305 MAC engine (IV resync) │
//! │  ├── kdf.rs       - HKDF session key derivation              │
//! │  └── replay.rs    - Inbound replay windows                   │
//! │                                                              │
//! │  auth/            - Handshake (lock-free)                    │
//! │  ├── stage.rs     - Stages and predecessor table             │
//! │  ├── connection.rs- Per-socket stage register + context slot │
//! │  ├── peer.rs      - Immutable per-peer key context           │
//! │  ├── envelope.rs  - Pre-authentication packet wrapper        │
//! │  ├── packet.rs    - Handshake / authenticated framing        │
//! │  ├── directory.rs - Identity directory, key exchange seams   │
//! │  └── handshake.rs - Responder state machine and initiator    │
//! │                                                              │
//! │  network/         - Networking (tokio)                       │
//! │  ├── config.rs    - Environment configuration                │
//! │  └── server.rs    - UDP listener + connection table          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! The stage register of each connection is the only synchronization point of
//! the handshake: every transition is a single compare-and-swap, and among any
//! number of threads racing the same transition exactly one wins. Key contexts
//! are immutable once built and are replaced wholesale, never mutated.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod auth;
pub mod crypto;
pub mod network;

// Re-export commonly used types
pub use auth::connection::ConnectionState;
pub use auth::handshake::{HandshakeOutcome, HandshakeProtocol, Initiator};
pub use auth::peer::PeerKeyContext;
pub use auth::stage::AuthStage;
pub use crypto::mac::MacEngine;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identifier of the entity a peer logs in as.
pub type EntityId = u64;

/// Identifier of the socket a packet arrived on.
pub type SocketId = u64;
