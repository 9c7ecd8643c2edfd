//! Identity Directory and Key Exchange
//!
//! Seams for the two collaborators the handshake consults: the directory that
//! vouches for a claimed entity id, and the key exchange that turns a peer's
//! key-agreement payload into a shared secret. Each has a small reference
//! implementation used by the daemon and the tests.

use std::collections::BTreeMap;
use std::path::Path;

use hkdf::Hkdf;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::kdf::SharedSecret;
use crate::EntityId;

/// Directory entry for one peer.
#[derive(Clone)]
pub struct PeerRecord {
    /// Entity the record belongs to.
    pub entity_id: EntityId,
    /// Pre-shared or certified key material. Opaque to the handshake.
    pub key_material: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecord")
            .field("entity_id", &self.entity_id)
            .field("key_material", &format_args!("<{} bytes>", self.key_material.len()))
            .finish()
    }
}

/// Lookup from claimed entity id to key material.
pub trait IdentityDirectory: Send + Sync {
    /// Record for `entity_id`, or `None` if the entity is unknown.
    fn lookup(&self, entity_id: EntityId) -> Option<PeerRecord>;
}

/// Identity of this endpoint as seen by the key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Local entity id.
    pub entity_id: EntityId,
}

/// Key exchange errors.
#[derive(Debug, Error)]
pub enum KeyExchangeError {
    /// Payload shorter than the exchange requires.
    #[error("key agreement payload too short: need {needed} bytes, got {actual}")]
    PayloadTooShort {
        /// Minimum length.
        needed: usize,
        /// Received length.
        actual: usize,
    },

    /// Peer record carries no key material.
    #[error("peer {0} has no key material")]
    MissingKeyMaterial(EntityId),

    /// Secret derivation failed.
    #[error("shared secret derivation failed")]
    Derivation,
}

/// Turns a peer's key-agreement payload into raw shared-secret bytes.
pub trait KeyExchange: Send + Sync {
    /// Produce the shared secret for `peer` from its `payload`.
    fn exchange(
        &self,
        payload: &[u8],
        local: &LocalIdentity,
        peer: &PeerRecord,
    ) -> Result<SharedSecret, KeyExchangeError>;
}

// =============================================================================
// STATIC DIRECTORY
// =============================================================================

/// Directory loading errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Directory file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory file is not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A key is not valid hex.
    #[error("invalid key for entity {entity_id}: {source}")]
    InvalidKey {
        /// Entity whose key failed to parse.
        entity_id: EntityId,
        /// Hex decoding error.
        source: hex::FromHexError,
    },

    /// A key is empty.
    #[error("empty key for entity {0}")]
    EmptyKey(EntityId),

    /// Entity id 0 marks a context with no identity and cannot be registered.
    #[error("entity id 0 is reserved")]
    ReservedEntity,

    /// The same entity appears twice.
    #[error("duplicate entity {0}")]
    DuplicateEntity(EntityId),
}

#[derive(Deserialize)]
struct DirectoryFile {
    peers: Vec<DirectoryEntry>,
}

#[derive(Deserialize)]
struct DirectoryEntry {
    entity_id: EntityId,
    key: String,
}

/// In-memory directory of pre-shared keys.
///
/// JSON form:
///
/// ```json
/// { "peers": [ { "entity_id": 1001, "key": "00112233..." } ] }
/// ```
#[derive(Default)]
pub struct StaticDirectory {
    peers: BTreeMap<EntityId, Zeroizing<Vec<u8>>>,
}

impl StaticDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a peer. Returns `false` for the reserved id 0.
    pub fn insert(&mut self, entity_id: EntityId, key_material: impl Into<Vec<u8>>) -> bool {
        if entity_id == 0 {
            return false;
        }
        self.peers.insert(entity_id, Zeroizing::new(key_material.into()));
        true
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Parse the JSON form.
    pub fn from_json_str(json: &str) -> Result<Self, DirectoryError> {
        let file: DirectoryFile = serde_json::from_str(json)?;
        let mut directory = Self::new();

        for entry in file.peers {
            if entry.entity_id == 0 {
                return Err(DirectoryError::ReservedEntity);
            }
            let key = hex::decode(entry.key.trim()).map_err(|source| DirectoryError::InvalidKey {
                entity_id: entry.entity_id,
                source,
            })?;
            if key.is_empty() {
                return Err(DirectoryError::EmptyKey(entry.entity_id));
            }
            if directory.peers.contains_key(&entry.entity_id) {
                return Err(DirectoryError::DuplicateEntity(entry.entity_id));
            }
            directory.insert(entry.entity_id, key);
        }

        Ok(directory)
    }

    /// Load the JSON form from a file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

impl IdentityDirectory for StaticDirectory {
    fn lookup(&self, entity_id: EntityId) -> Option<PeerRecord> {
        self.peers.get(&entity_id).map(|key| PeerRecord {
            entity_id,
            key_material: key.clone(),
        })
    }
}

impl std::fmt::Debug for StaticDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticDirectory")
            .field("entities", &self.peers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// PRE-SHARED KEY EXCHANGE
// =============================================================================

/// Minimum key-agreement payload length (the random salt).
pub const MIN_SALT_LEN: usize = 16;

/// Shared secret size produced by [`PreSharedKeyExchange`].
pub const PSK_SECRET_LEN: usize = 32;

const PSK_LABEL: &[u8] = b"RUNE_RELIC_PSK_V1";

/// Stand-in key exchange over a pre-shared key.
///
/// The payload is a fresh random salt chosen by the initiator. The secret is
/// HKDF-SHA256 of the peer's key with that salt, bound to both entity ids in
/// ascending order so either end derives the same bytes. This gives freshness
/// per handshake but no forward secrecy.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreSharedKeyExchange;

impl KeyExchange for PreSharedKeyExchange {
    fn exchange(
        &self,
        payload: &[u8],
        local: &LocalIdentity,
        peer: &PeerRecord,
    ) -> Result<SharedSecret, KeyExchangeError> {
        if payload.len() < MIN_SALT_LEN {
            return Err(KeyExchangeError::PayloadTooShort {
                needed: MIN_SALT_LEN,
                actual: payload.len(),
            });
        }
        if peer.key_material.is_empty() {
            return Err(KeyExchangeError::MissingKeyMaterial(peer.entity_id));
        }

        let low = local.entity_id.min(peer.entity_id);
        let high = local.entity_id.max(peer.entity_id);
        let mut info = Vec::with_capacity(PSK_LABEL.len() + 16);
        info.extend_from_slice(PSK_LABEL);
        info.extend_from_slice(&low.to_be_bytes());
        info.extend_from_slice(&high.to_be_bytes());

        let hk = Hkdf::<Sha256>::new(Some(payload), &peer.key_material);
        let mut secret = Zeroizing::new(vec![0u8; PSK_SECRET_LEN]);
        hk.expand(&info, &mut secret[..])
            .map_err(|_| KeyExchangeError::Derivation)?;
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIRECTORY_JSON: &str = r#"{
        "peers": [
            { "entity_id": 1001, "key": "000102030405060708090a0b0c0d0e0f" },
            { "entity_id": 1002, "key": "ffeeddccbbaa99887766554433221100" }
        ]
    }"#;

    fn record(entity_id: EntityId, key: &[u8]) -> PeerRecord {
        PeerRecord {
            entity_id,
            key_material: Zeroizing::new(key.to_vec()),
        }
    }

    #[test]
    fn test_directory_from_json() {
        let directory = StaticDirectory::from_json_str(DIRECTORY_JSON).unwrap();
        assert_eq!(directory.len(), 2);

        let peer = directory.lookup(1001).unwrap();
        assert_eq!(peer.entity_id, 1001);
        assert_eq!(peer.key_material[..4], [0, 1, 2, 3]);
        assert!(directory.lookup(9999).is_none());
    }

    #[test]
    fn test_directory_rejects_bad_entries() {
        let bad_hex = r#"{"peers":[{"entity_id":1,"key":"zz"}]}"#;
        assert!(matches!(
            StaticDirectory::from_json_str(bad_hex),
            Err(DirectoryError::InvalidKey { entity_id: 1, .. })
        ));

        let empty = r#"{"peers":[{"entity_id":1,"key":""}]}"#;
        assert!(matches!(StaticDirectory::from_json_str(empty), Err(DirectoryError::EmptyKey(1))));

        let reserved = r#"{"peers":[{"entity_id":0,"key":"00"}]}"#;
        assert!(matches!(
            StaticDirectory::from_json_str(reserved),
            Err(DirectoryError::ReservedEntity)
        ));

        let duplicate = r#"{"peers":[{"entity_id":3,"key":"00"},{"entity_id":3,"key":"01"}]}"#;
        assert!(matches!(
            StaticDirectory::from_json_str(duplicate),
            Err(DirectoryError::DuplicateEntity(3))
        ));

        assert!(matches!(StaticDirectory::from_json_str("not json"), Err(DirectoryError::Json(_))));
    }

    #[test]
    fn test_directory_file_missing() {
        let result = StaticDirectory::from_json_file("/nonexistent/rune-relic/directory.json");
        assert!(matches!(result, Err(DirectoryError::Io(_))));
    }

    #[test]
    fn test_insert_reserved_id() {
        let mut directory = StaticDirectory::new();
        assert!(!directory.insert(0, vec![1]));
        assert!(directory.insert(5, vec![1]));
        assert!(directory.lookup(0).is_none());
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_debug_redacts_keys() {
        let text = format!("{:?}", record(7, &[0xAB; 8]));
        assert!(text.contains("8 bytes"));
        assert!(!text.contains("171"));
    }

    #[test]
    fn test_psk_exchange_is_symmetric() {
        let key = [0x42u8; 32];
        let salt = [7u8; MIN_SALT_LEN];

        // Responder 1 sees peer 2, initiator 2 sees peer 1, same pre-shared key
        let at_responder = PreSharedKeyExchange
            .exchange(&salt, &LocalIdentity { entity_id: 1 }, &record(2, &key))
            .unwrap();
        let at_initiator = PreSharedKeyExchange
            .exchange(&salt, &LocalIdentity { entity_id: 2 }, &record(1, &key))
            .unwrap();

        assert_eq!(at_responder.len(), PSK_SECRET_LEN);
        assert_eq!(*at_responder, *at_initiator);
    }

    #[test]
    fn test_psk_exchange_depends_on_salt_and_ids() {
        let key = [0x42u8; 32];
        let local = LocalIdentity { entity_id: 1 };
        let a = PreSharedKeyExchange.exchange(&[1; 16], &local, &record(2, &key)).unwrap();
        let b = PreSharedKeyExchange.exchange(&[2; 16], &local, &record(2, &key)).unwrap();
        let c = PreSharedKeyExchange.exchange(&[1; 16], &local, &record(3, &key)).unwrap();
        assert_ne!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_psk_exchange_failures() {
        let local = LocalIdentity { entity_id: 1 };
        assert!(matches!(
            PreSharedKeyExchange.exchange(&[0; 4], &local, &record(2, &[1; 32])),
            Err(KeyExchangeError::PayloadTooShort { needed: 16, actual: 4 })
        ));
        assert!(matches!(
            PreSharedKeyExchange.exchange(&[0; 16], &local, &record(2, &[])),
            Err(KeyExchangeError::MissingKeyMaterial(2))
        ));
    }
}
