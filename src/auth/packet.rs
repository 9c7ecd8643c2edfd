//! Packet Framing
//!
//! One kind byte, then either a bincode handshake body or an authentication
//! header followed by the payload.
//!
//! ```text
//! IdentityClaim | KeyAgreement:  kind(1) || bincode body
//! Confirmation | Accepted | Data: kind(1) || nonce(8, BE) || digest(16) || payload
//! ```
//!
//! The digest of a sealed frame covers `kind || payload`.

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::mac::{Digest, DIGEST_SIZE, IV_SIZE};
use crate::EntityId;

/// Authentication header size (nonce + digest).
pub const AUTH_HEADER_SIZE: usize = IV_SIZE + DIGEST_SIZE;

/// Upper bound on a bincode handshake body.
pub const MAX_HANDSHAKE_BODY: u64 = 2048;

/// Payload the initiator seals to prove it holds the derived key.
pub const CONFIRMATION_PAYLOAD: &[u8] = b"RUNE_RELIC_CONFIRM_V1";

/// Payload the responder seals once it accepted the confirmation.
pub const ACCEPTANCE_PAYLOAD: &[u8] = b"RUNE_RELIC_ACCEPT_V1";

// =============================================================================
// KINDS
// =============================================================================

/// Packet kind, the first byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Initiator names the entity it claims to be.
    IdentityClaim = 0x01,
    /// Initiator's key-agreement payload.
    KeyAgreement = 0x02,
    /// Initiator's proof of key possession.
    Confirmation = 0x03,
    /// Responder's acknowledgement of the confirmation.
    Accepted = 0x04,
    /// Application data on an authenticated connection.
    Data = 0x10,
}

impl PacketKind {
    /// Wire value.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketKind::IdentityClaim),
            0x02 => Some(PacketKind::KeyAgreement),
            0x03 => Some(PacketKind::Confirmation),
            0x04 => Some(PacketKind::Accepted),
            0x10 => Some(PacketKind::Data),
            _ => None,
        }
    }

    /// Whether this kind belongs to the handshake rather than application traffic.
    pub const fn is_handshake(self) -> bool {
        !matches!(self, PacketKind::Data)
    }
}

// =============================================================================
// BODIES
// =============================================================================

/// Identity claim body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaim {
    /// Claimed entity.
    pub entity_id: EntityId,
}

/// Key-agreement body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAgreement {
    /// Entity the payload was produced for; must match the earlier claim's directory entry.
    pub entity_id: EntityId,
    /// Opaque input for the key-exchange collaborator.
    pub payload: Vec<u8>,
}

/// Nonce and digest in front of a sealed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthHeader {
    /// Logical nonce, big-endian on the wire.
    pub nonce: u64,
    /// MAC over `kind || payload`.
    pub digest: Digest,
}

impl AuthHeader {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.digest);
    }

    fn read(bytes: &[u8]) -> Option<Self> {
        let nonce = u64::from_be_bytes(bytes.get(..IV_SIZE)?.try_into().ok()?);
        let digest = bytes.get(IV_SIZE..AUTH_HEADER_SIZE)?.try_into().ok()?;
        Some(Self { nonce, digest })
    }
}

/// A decoded frame with an authentication header. Nothing about it is trusted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedFrame<'a> {
    /// Frame kind.
    pub kind: PacketKind,
    /// Nonce and digest.
    pub header: AuthHeader,
    /// Payload bytes.
    pub payload: &'a [u8],
}

impl SealedFrame<'_> {
    /// Bytes the digest is computed over.
    pub fn authenticated_bytes(&self) -> Vec<u8> {
        authenticated_bytes(self.kind, self.payload)
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Identity claim.
    IdentityClaim(IdentityClaim),
    /// Key-agreement payload.
    KeyAgreement(KeyAgreement),
    /// Confirmation, acceptance or data frame.
    Sealed(SealedFrame<'a>),
}

impl Packet<'_> {
    /// Kind of the packet.
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::IdentityClaim(_) => PacketKind::IdentityClaim,
            Packet::KeyAgreement(_) => PacketKind::KeyAgreement,
            Packet::Sealed(frame) => frame.kind,
        }
    }
}

/// Framing errors. All of them mean "malformed packet".
#[derive(Debug, Error)]
pub enum PacketError {
    /// Zero-length packet.
    #[error("empty packet")]
    Empty,

    /// First byte is not a known kind.
    #[error("unknown packet kind {0:#04x}")]
    UnknownKind(u8),

    /// Sealed frame shorter than its header.
    #[error("{kind:?} frame truncated: need {needed} bytes, got {actual}")]
    Truncated {
        /// Frame kind.
        kind: PacketKind,
        /// Minimum length.
        needed: usize,
        /// Received length.
        actual: usize,
    },

    /// Handshake body failed to encode or decode.
    #[error("handshake body: {0}")]
    Body(#[from] bincode::Error),
}

fn body_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_HANDSHAKE_BODY)
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

/// `kind || payload`, the input to the MAC for a sealed frame.
pub fn authenticated_bytes(kind: PacketKind, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(kind.as_u8());
    bytes.extend_from_slice(payload);
    bytes
}

/// Encode an identity claim.
pub fn encode_identity_claim(claim: &IdentityClaim) -> Result<Vec<u8>, PacketError> {
    encode_body(PacketKind::IdentityClaim, claim)
}

/// Encode a key-agreement packet.
pub fn encode_key_agreement(agreement: &KeyAgreement) -> Result<Vec<u8>, PacketError> {
    encode_body(PacketKind::KeyAgreement, agreement)
}

fn encode_body<T: Serialize>(kind: PacketKind, body: &T) -> Result<Vec<u8>, PacketError> {
    let mut out = vec![kind.as_u8()];
    body_options().serialize_into(&mut out, body)?;
    Ok(out)
}

/// Encode a sealed frame from an already computed header.
pub fn encode_sealed(kind: PacketKind, header: &AuthHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + AUTH_HEADER_SIZE + payload.len());
    out.push(kind.as_u8());
    header.write(&mut out);
    out.extend_from_slice(payload);
    out
}

/// Decode one packet.
pub fn decode(bytes: &[u8]) -> Result<Packet<'_>, PacketError> {
    let (&first, rest) = bytes.split_first().ok_or(PacketError::Empty)?;
    let kind = PacketKind::from_u8(first).ok_or(PacketError::UnknownKind(first))?;

    match kind {
        PacketKind::IdentityClaim => Ok(Packet::IdentityClaim(body_options().deserialize(rest)?)),
        PacketKind::KeyAgreement => Ok(Packet::KeyAgreement(body_options().deserialize(rest)?)),
        PacketKind::Confirmation | PacketKind::Accepted | PacketKind::Data => {
            let header = AuthHeader::read(rest).ok_or(PacketError::Truncated {
                kind,
                needed: 1 + AUTH_HEADER_SIZE,
                actual: bytes.len(),
            })?;
            Ok(Packet::Sealed(SealedFrame {
                kind,
                header,
                payload: &rest[AUTH_HEADER_SIZE..],
            }))
        }
    }
}
