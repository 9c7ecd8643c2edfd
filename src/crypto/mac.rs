//! MAC Engine
//!
//! ChaCha20-Poly1305 used as a pure message authentication code: the message is
//! fed as associated data over an empty plaintext and the 16-byte tag is the
//! digest. The Poly1305 one-time key comes out of the ChaCha20 keystream for the
//! current IV, so the IV register must be resynchronized before every message.
//! The nonce is never mixed into the authenticated bytes.
//!
//! An engine owns mutable IV state and both operations take `&mut self`. Code
//! that needs to share one across threads must serialize access itself.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use thiserror::Error;
use zeroize::Zeroizing;

/// Secret key size in bytes.
pub const MAC_KEY_SIZE: usize = 32;

/// Digest size in bytes.
pub const DIGEST_SIZE: usize = 16;

/// IV register size in bytes (one big-endian `u64` nonce).
pub const IV_SIZE: usize = 8;

/// Cipher nonce size; the IV register fills the low bytes.
const CIPHER_NONCE_SIZE: usize = 12;

/// Fixed-size authentication tag.
pub type Digest = [u8; DIGEST_SIZE];

/// Secret key, wiped on drop.
pub type MacKey = Zeroizing<[u8; MAC_KEY_SIZE]>;

/// MAC errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacError {
    /// The primitive refused the input (message above the AEAD length limit).
    #[error("message rejected by MAC primitive")]
    Primitive,

    /// The nonce does not belong to the nonce space of the hasher it was given to.
    #[error("nonce {0:#018x} outside the nonce space of this hasher")]
    NonceOutOfRange(u64),

    /// No key material is bound yet.
    #[error("no key material")]
    Unkeyed,
}

/// Keyed digest engine with an 8-byte IV register.
pub struct MacEngine {
    cipher: ChaCha20Poly1305,
    iv: [u8; IV_SIZE],
}

impl MacEngine {
    /// Create an engine bound to `key`. The IV register starts zeroed.
    pub fn new(key: &[u8; MAC_KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            iv: [0; IV_SIZE],
        }
    }

    #[cfg(test)]
    fn iv(&self) -> [u8; IV_SIZE] {
        self.iv
    }

    /// Load `nonce` into the IV register and return the cipher nonce built from it.
    fn resynchronize(&mut self, nonce: u64) -> Nonce {
        self.iv = nonce.to_be_bytes();
        let mut full = [0u8; CIPHER_NONCE_SIZE];
        full[CIPHER_NONCE_SIZE - IV_SIZE..].copy_from_slice(&self.iv);
        Nonce::clone_from_slice(&full)
    }

    /// Compute the digest of `message` under `nonce`.
    pub fn calculate_digest(&mut self, message: &[u8], nonce: u64) -> Result<Digest, MacError> {
        let iv = self.resynchronize(nonce);
        let tag = self
            .cipher
            .encrypt_in_place_detached(&iv, message, &mut [])
            .map_err(|_| MacError::Primitive)?;

        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&tag);
        Ok(digest)
    }

    /// Check `digest` against `message` under `nonce`.
    ///
    /// The comparison is the AEAD's own tag check, which runs in constant time.
    pub fn verify_digest(&mut self, digest: &Digest, message: &[u8], nonce: u64) -> bool {
        let iv = self.resynchronize(nonce);
        self.cipher
            .decrypt_in_place_detached(&iv, message, &mut [], Tag::from_slice(digest))
            .is_ok()
    }
}

impl std::fmt::Debug for MacEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacEngine")
            .field("iv", &hex::encode(self.iv))
            .finish_non_exhaustive()
    }
}
