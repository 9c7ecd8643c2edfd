//! Session Key Derivation
//!
//! Turns the raw shared secret produced by the key exchange into one MAC key per
//! direction. Which key verifies and which one stamps depends on the side of the
//! handshake this endpoint plays.

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use super::mac::{MacKey, MAC_KEY_SIZE};

/// Raw shared secret as handed over by the key exchange, wiped on drop.
pub type SharedSecret = Zeroizing<Vec<u8>>;

/// HKDF info label for traffic sent by the connecting side.
const INITIATOR_TO_RESPONDER: &[u8] = b"RUNE_RELIC_AUTH_I2R_V1";

/// HKDF info label for traffic sent by the accepting side.
const RESPONDER_TO_INITIATOR: &[u8] = b"RUNE_RELIC_AUTH_R2I_V1";

/// Side of the handshake an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts connections and drives the stage register.
    Responder,
    /// Connects and sends the claim, key agreement and confirmation.
    Initiator,
}

/// Key derivation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KdfError {
    /// The key exchange produced no secret bytes.
    #[error("shared secret is empty")]
    EmptySecret,

    /// HKDF refused the requested output length.
    #[error("key expansion failed")]
    Expand,
}

/// The two keys of one endpoint.
pub struct DirectionalKeys {
    /// Key the peer stamps with; used by this side's verifier.
    pub inbound: MacKey,
    /// Key this side stamps with; shared by the UDP and TCP hashers.
    pub outbound: MacKey,
}

impl std::fmt::Debug for DirectionalKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DirectionalKeys { .. }")
    }
}

/// Derives directional MAC keys from a shared secret.
pub trait KeyDeriver: Send + Sync {
    /// Derive the keys `role` needs from `secret`.
    fn derive(&self, secret: &[u8], role: Role) -> Result<DirectionalKeys, KdfError>;
}

/// HKDF-SHA256 with fixed per-direction info labels and no salt.
#[derive(Debug, Clone, Copy, Default)]
pub struct HkdfKeyDeriver;

impl HkdfKeyDeriver {
    fn expand(hk: &Hkdf<Sha256>, label: &[u8]) -> Result<MacKey, KdfError> {
        let mut okm = Zeroizing::new([0u8; MAC_KEY_SIZE]);
        hk.expand(label, &mut okm[..]).map_err(|_| KdfError::Expand)?;
        Ok(okm)
    }
}

impl KeyDeriver for HkdfKeyDeriver {
    fn derive(&self, secret: &[u8], role: Role) -> Result<DirectionalKeys, KdfError> {
        if secret.is_empty() {
            return Err(KdfError::EmptySecret);
        }

        let hk = Hkdf::<Sha256>::new(None, secret);
        let i2r = Self::expand(&hk, INITIATOR_TO_RESPONDER)?;
        let r2i = Self::expand(&hk, RESPONDER_TO_INITIATOR)?;

        Ok(match role {
            Role::Responder => DirectionalKeys { inbound: i2r, outbound: r2i },
            Role::Initiator => DirectionalKeys { inbound: r2i, outbound: i2r },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_mirror_each_other() {
        let secret = b"a shared secret of some length";
        let responder = HkdfKeyDeriver.derive(secret, Role::Responder).unwrap();
        let initiator = HkdfKeyDeriver.derive(secret, Role::Initiator).unwrap();

        assert_eq!(*responder.inbound, *initiator.outbound);
        assert_eq!(*responder.outbound, *initiator.inbound);
    }

    #[test]
    fn test_directions_differ() {
        let keys = HkdfKeyDeriver.derive(b"secret", Role::Responder).unwrap();
        assert_ne!(*keys.inbound, *keys.outbound);
    }

    #[test]
    fn test_different_secrets_give_different_keys() {
        let a = HkdfKeyDeriver.derive(b"secret-a", Role::Responder).unwrap();
        let b = HkdfKeyDeriver.derive(b"secret-b", Role::Responder).unwrap();
        assert_ne!(*a.inbound, *b.inbound);
    }

    #[test]
    fn test_empty_secret_rejected() {
        let result = HkdfKeyDeriver.derive(&[], Role::Initiator);
        assert!(matches!(result, Err(KdfError::EmptySecret)));
    }
}
