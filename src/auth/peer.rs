//! Peer Key Context
//!
//! Everything this side knows about one remote peer: who it is, where it
//! connects from, when, and the key material used to check and stamp its
//! traffic. A context never changes its identity or keys after construction.
//! Re-keying builds a new context and swaps it into the connection, so holders
//! of the old one keep a consistent view.
//!
//! The outbound UDP sequence and the inbound replay state are the only
//! mutable fields, and both are atomics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::auth::config::AuthConfig;
use crate::crypto::kdf::DirectionalKeys;
use crate::crypto::mac::{Digest, MacEngine, MacError, DIGEST_SIZE};
use crate::crypto::replay::{ReplayWindow, StreamHighWater};
use crate::EntityId;

/// Top bit of a nonce; set for stream (TCP) nonces, clear for datagram (UDP) ones.
///
/// Both hashers of a context share one key, so their nonces must never meet.
pub const STREAM_NONCE_FLAG: u64 = 1 << 63;

/// Tag a stream position as a TCP nonce.
#[inline]
pub const fn stream_nonce(position: u64) -> u64 {
    position | STREAM_NONCE_FLAG
}

/// Current time as Unix milliseconds.
pub fn unix_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Transport a packet travelled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Datagrams: lossy and reordered.
    Udp,
    /// Stream: ordered, nonces follow stream position.
    Tcp,
}

impl Transport {
    /// Whether `nonce` belongs to this transport's nonce space.
    #[inline]
    pub fn owns_nonce(self, nonce: u64) -> bool {
        match self {
            Transport::Udp => nonce & STREAM_NONCE_FLAG == 0,
            Transport::Tcp => nonce & STREAM_NONCE_FLAG != 0,
        }
    }
}

/// Verify / hash capabilities bound to one peer's keys.
pub trait KeyMaterial: Send + Sync {
    /// Check a digest produced by the peer.
    fn verify(&self, digest: &Digest, message: &[u8], nonce: u64) -> bool;

    /// Stamp an outbound datagram.
    fn hash_udp(&self, message: &[u8], nonce: u64) -> Result<Digest, MacError>;

    /// Stamp an outbound stream message.
    fn hash_tcp(&self, message: &[u8], nonce: u64) -> Result<Digest, MacError>;
}

/// Key material backed by one [`MacEngine`] per capability.
///
/// Engines carry IV state, so each sits behind its own lock; the lock is held
/// only for one resynchronize-and-digest sequence.
pub struct SessionKeys {
    verifier: Mutex<MacEngine>,
    udp: Mutex<MacEngine>,
    tcp: Mutex<MacEngine>,
}

impl SessionKeys {
    /// Bind engines to freshly derived keys.
    pub fn new(keys: &DirectionalKeys) -> Self {
        Self {
            verifier: Mutex::new(MacEngine::new(&keys.inbound)),
            udp: Mutex::new(MacEngine::new(&keys.outbound)),
            tcp: Mutex::new(MacEngine::new(&keys.outbound)),
        }
    }
}

impl KeyMaterial for SessionKeys {
    fn verify(&self, digest: &Digest, message: &[u8], nonce: u64) -> bool {
        self.verifier.lock().verify_digest(digest, message, nonce)
    }

    fn hash_udp(&self, message: &[u8], nonce: u64) -> Result<Digest, MacError> {
        self.udp.lock().calculate_digest(message, nonce)
    }

    fn hash_tcp(&self, message: &[u8], nonce: u64) -> Result<Digest, MacError> {
        self.tcp.lock().calculate_digest(message, nonce)
    }
}

/// Result of checking one inbound packet against a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundVerdict {
    /// Digest verified and the nonce was fresh.
    Accepted,
    /// Digest did not verify, the nonce was in the wrong space, or the context has no keys.
    Forged,
    /// Digest verified but the nonce was already seen or is too old.
    Replayed,
}

/// Per-peer identity and key context.
pub struct PeerKeyContext {
    entity_id: EntityId,
    address: SocketAddr,
    timestamp: u64,
    keys: Option<Box<dyn KeyMaterial>>,
    udp_sequence: AtomicU64,
    udp_window: ReplayWindow,
    tcp_high_water: StreamHighWater,
}

impl PeerKeyContext {
    /// Context for a peer that has claimed `entity_id` but has no keys yet.
    pub fn partial(entity_id: EntityId, address: SocketAddr, timestamp: u64) -> Self {
        Self {
            entity_id,
            address,
            timestamp,
            keys: None,
            udp_sequence: AtomicU64::new(0),
            udp_window: ReplayWindow::new(1, 0),
            tcp_high_water: StreamHighWater::new(),
        }
    }

    /// Context for a peer whose keys have been derived.
    pub fn complete(
        entity_id: EntityId,
        keys: impl KeyMaterial + 'static,
        address: SocketAddr,
        timestamp: u64,
        config: &AuthConfig,
    ) -> Self {
        Self {
            entity_id,
            address,
            timestamp,
            keys: Some(Box::new(keys)),
            udp_sequence: AtomicU64::new(0),
            udp_window: ReplayWindow::new(config.replay_slots, config.replay_max_gap),
            tcp_high_water: StreamHighWater::new(),
        }
    }

    /// New context for the same peer with rotated keys.
    ///
    /// The sequence counter and replay state start over, which is safe because
    /// the key is new.
    pub fn rekeyed(&self, keys: impl KeyMaterial + 'static, config: &AuthConfig) -> Self {
        Self::complete(self.entity_id, keys, self.address, self.timestamp, config)
    }

    /// Entity the peer claimed, or authenticated as once the context is complete.
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// Remote address of the peer.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// When the connection was established (Unix milliseconds).
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Milliseconds elapsed since the connection was established.
    pub fn age_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    /// Whether key material is present.
    pub fn is_complete(&self) -> bool {
        self.keys.is_some()
    }

    /// Check a digest produced by the peer. A partial context verifies nothing.
    pub fn verify(&self, digest: &[u8], message: &[u8], nonce: u64) -> bool {
        let Some(keys) = &self.keys else {
            return false;
        };
        let Ok(digest) = <&Digest>::try_from(digest) else {
            return false;
        };
        keys.verify(digest, message, nonce)
    }

    /// Stamp an outbound datagram. `nonce` must be a [`next_udp_sequence`](Self::next_udp_sequence) value.
    pub fn hash_udp(&self, message: &[u8], nonce: u64) -> Result<Digest, MacError> {
        if !Transport::Udp.owns_nonce(nonce) {
            return Err(MacError::NonceOutOfRange(nonce));
        }
        self.keys.as_ref().ok_or(MacError::Unkeyed)?.hash_udp(message, nonce)
    }

    /// Stamp an outbound stream message. `nonce` must come from [`stream_nonce`].
    pub fn hash_tcp(&self, message: &[u8], nonce: u64) -> Result<Digest, MacError> {
        if !Transport::Tcp.owns_nonce(nonce) {
            return Err(MacError::NonceOutOfRange(nonce));
        }
        self.keys.as_ref().ok_or(MacError::Unkeyed)?.hash_tcp(message, nonce)
    }

    /// Next outbound UDP sequence value. Strictly increasing, starting at 1.
    pub fn next_udp_sequence(&self) -> u64 {
        self.udp_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Verify an inbound packet, then record its nonce for replay protection.
    pub fn accept_inbound(
        &self,
        transport: Transport,
        digest: &[u8],
        message: &[u8],
        nonce: u64,
    ) -> InboundVerdict {
        if digest.len() != DIGEST_SIZE || !transport.owns_nonce(nonce) {
            return InboundVerdict::Forged;
        }
        if !self.verify(digest, message, nonce) {
            return InboundVerdict::Forged;
        }

        let fresh = match transport {
            Transport::Udp => self.udp_window.update(nonce),
            Transport::Tcp => self.tcp_high_water.accept(nonce),
        };
        if fresh {
            InboundVerdict::Accepted
        } else {
            InboundVerdict::Replayed
        }
    }
}

impl std::fmt::Debug for PeerKeyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerKeyContext")
            .field("entity_id", &self.entity_id)
            .field("address", &self.address)
            .field("timestamp", &self.timestamp)
            .field("complete", &self.is_complete())
            .field("udp_sequence", &self.udp_sequence.load(Ordering::Relaxed))
            .field("tcp_high_water", &self.tcp_high_water.last())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::{HkdfKeyDeriver, KeyDeriver, Role};
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn pair(secret: &[u8]) -> (PeerKeyContext, PeerKeyContext) {
        let config = AuthConfig::default();
        let r = HkdfKeyDeriver.derive(secret, Role::Responder).unwrap();
        let i = HkdfKeyDeriver.derive(secret, Role::Initiator).unwrap();
        (
            PeerKeyContext::complete(7, SessionKeys::new(&r), addr(), 1_000, &config),
            PeerKeyContext::complete(9, SessionKeys::new(&i), addr(), 1_000, &config),
        )
    }

    #[test]
    fn test_partial_context() {
        let ctx = PeerKeyContext::partial(7, addr(), 1234);
        assert_eq!(ctx.entity_id(), 7);
        assert_eq!(ctx.address(), addr());
        assert_eq!(ctx.timestamp(), 1234);
        assert!(!ctx.is_complete());
        assert!(!ctx.verify(&[0; DIGEST_SIZE], b"x", 1));
        assert_eq!(ctx.hash_udp(b"x", 1), Err(MacError::Unkeyed));
    }

    #[test]
    fn test_peer_verifies_our_udp_digest() {
        let (responder, initiator) = pair(b"secret");
        let nonce = initiator.next_udp_sequence();
        let digest = initiator.hash_udp(b"hello", nonce).unwrap();

        assert!(responder.verify(&digest, b"hello", nonce));
        // Our own verifier uses the other direction's key
        assert!(!initiator.verify(&digest, b"hello", nonce));
    }

    #[test]
    fn test_peer_verifies_our_tcp_digest() {
        let (responder, initiator) = pair(b"secret");
        let nonce = stream_nonce(0);
        let digest = responder.hash_tcp(b"stream", nonce).unwrap();
        assert!(initiator.verify(&digest, b"stream", nonce));
    }

    #[test]
    fn test_nonce_spaces_enforced() {
        let (responder, _) = pair(b"secret");
        assert_eq!(
            responder.hash_udp(b"x", stream_nonce(1)),
            Err(MacError::NonceOutOfRange(stream_nonce(1)))
        );
        assert_eq!(responder.hash_tcp(b"x", 1), Err(MacError::NonceOutOfRange(1)));
    }

    #[test]
    fn test_udp_sequence_starts_at_one() {
        let (ctx, _) = pair(b"secret");
        assert_eq!(ctx.next_udp_sequence(), 1);
        assert_eq!(ctx.next_udp_sequence(), 2);
        assert_eq!(ctx.next_udp_sequence(), 3);
    }

    #[test]
    fn test_udp_sequence_unique_across_threads() {
        let (ctx, _) = pair(b"secret");
        let ctx = Arc::new(ctx);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                std::thread::spawn(move || (0..500).map(|_| ctx.next_udp_sequence()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = BTreeSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "sequence {} issued twice", value);
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(seen.iter().next_back(), Some(&4000));
    }

    #[test]
    fn test_accept_inbound_udp_replay() {
        let (responder, initiator) = pair(b"secret");
        let nonce = initiator.next_udp_sequence();
        let digest = initiator.hash_udp(b"move", nonce).unwrap();

        assert_eq!(
            responder.accept_inbound(Transport::Udp, &digest, b"move", nonce),
            InboundVerdict::Accepted
        );
        assert_eq!(
            responder.accept_inbound(Transport::Udp, &digest, b"move", nonce),
            InboundVerdict::Replayed
        );
    }

    #[test]
    fn test_accept_inbound_tcp_order() {
        let (responder, initiator) = pair(b"secret");
        let d1 = initiator.hash_tcp(b"a", stream_nonce(1)).unwrap();
        let d2 = initiator.hash_tcp(b"b", stream_nonce(2)).unwrap();

        assert_eq!(
            responder.accept_inbound(Transport::Tcp, &d2, b"b", stream_nonce(2)),
            InboundVerdict::Accepted
        );
        assert_eq!(
            responder.accept_inbound(Transport::Tcp, &d1, b"a", stream_nonce(1)),
            InboundVerdict::Replayed
        );
    }

    #[test]
    fn test_accept_inbound_forged() {
        let (responder, initiator) = pair(b"secret");
        let nonce = initiator.next_udp_sequence();
        let digest = initiator.hash_udp(b"move", nonce).unwrap();

        assert_eq!(
            responder.accept_inbound(Transport::Udp, &digest, b"mov3", nonce),
            InboundVerdict::Forged
        );
        assert_eq!(
            responder.accept_inbound(Transport::Udp, &digest[..8], b"move", nonce),
            InboundVerdict::Forged
        );
        // Right digest, claimed over the wrong transport
        assert_eq!(
            responder.accept_inbound(Transport::Tcp, &digest, b"move", nonce),
            InboundVerdict::Forged
        );
    }

    #[test]
    fn test_rekeyed_keeps_identity_and_isolates_old() {
        let (responder, initiator) = pair(b"old-secret");
        let config = AuthConfig::default();
        let new_keys = HkdfKeyDeriver.derive(b"new-secret", Role::Responder).unwrap();

        let old = Arc::new(responder);
        let new = old.rekeyed(SessionKeys::new(&new_keys), &config);
        assert_eq!(new.entity_id(), old.entity_id());
        assert_eq!(new.address(), old.address());

        let nonce = initiator.next_udp_sequence();
        let digest = initiator.hash_udp(b"hi", nonce).unwrap();
        assert!(old.verify(&digest, b"hi", nonce));
        assert!(!new.verify(&digest, b"hi", nonce));
    }

    #[test]
    fn test_age_millis() {
        let ctx = PeerKeyContext::partial(7, addr(), 1_000);
        assert_eq!(ctx.age_millis(1_500), 500);
        assert_eq!(ctx.age_millis(500), 0);
    }

    proptest! {
        #[test]
        fn prop_udp_sequence_strictly_increasing(calls in 1usize..200) {
            let ctx = PeerKeyContext::partial(7, addr(), 0);
            let mut last = 0;
            for _ in 0..calls {
                let next = ctx.next_udp_sequence();
                prop_assert!(next > last);
                last = next;
            }
        }
    }
}
