//! Cryptographic Primitives
//!
//! Keyed building blocks used by the handshake and by post-handshake traffic.
//! Nothing in here knows about connections or stages.

pub mod kdf;
pub mod mac;
pub mod replay;

pub use kdf::{DirectionalKeys, HkdfKeyDeriver, KdfError, KeyDeriver, Role, SharedSecret};
pub use mac::{Digest, MacEngine, MacError, MacKey, DIGEST_SIZE, IV_SIZE, MAC_KEY_SIZE};
pub use replay::{ReplayWindow, StreamHighWater};
