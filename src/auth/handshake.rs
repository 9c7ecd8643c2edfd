//! Handshake Protocol
//!
//! Drives a connection from `None` to `Authenticated` as handshake packets
//! arrive, then guards the authenticated channel.
//!
//! ```text
//! initiator                                   responder
//!   | -- IdentityClaim { entity_id } ------------> |  None -> Init (partial context)
//!   | -- KeyAgreement { entity_id, payload } ----> |  Init -> KeyExchange (complete context)
//!   | -- Confirmation [sealed] ------------------> |  KeyExchange -> Authenticated
//!   | <------------------------ Accepted [sealed]  |
//!   | <======== Data [sealed] both ways =========> |
//! ```
//!
//! Stage transitions are decided by the connection's compare-and-swap; a
//! handler that loses the race drops its packet. Framing errors drop the packet
//! without touching the connection. Anything that decodes but fails
//! validation (unknown identity, failed key exchange, bad digest) resets the
//! connection to `None` and discards its keys.
//!
//! Handshake frames are always sealed in the UDP nonce space, whichever
//! transport carries them.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::AuthConfig;
use super::connection::ConnectionState;
use super::directory::{
    IdentityDirectory, KeyExchange, KeyExchangeError, LocalIdentity, PeerRecord,
};
use super::envelope::UnauthenticatedMessage;
use super::packet::{
    self, AuthHeader, IdentityClaim, KeyAgreement, Packet, PacketError, PacketKind, SealedFrame,
    ACCEPTANCE_PAYLOAD, CONFIRMATION_PAYLOAD,
};
use super::peer::{
    stream_nonce, unix_millis, InboundVerdict, PeerKeyContext, SessionKeys, Transport,
    STREAM_NONCE_FLAG,
};
use super::stage::AuthStage;
use crate::crypto::kdf::{HkdfKeyDeriver, KdfError, KeyDeriver, Role};
use crate::crypto::mac::MacError;
use crate::{EntityId, SocketId};

// =============================================================================
// DISPATCH
// =============================================================================

/// Verified inbound application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMessage {
    /// Authenticated sender.
    pub peer: EntityId,
    /// Application payload.
    pub payload: Vec<u8>,
    /// Socket it arrived on.
    pub socket: SocketId,
}

/// Dispatcher failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The receiving side is gone.
    #[error("dispatcher closed")]
    Closed,
}

/// Receiver of verified application messages.
pub trait Dispatcher: Send + Sync {
    /// Hand off one verified message.
    fn dispatch(&self, message: VerifiedMessage) -> Result<(), DispatchError>;
}

impl Dispatcher for tokio::sync::mpsc::UnboundedSender<VerifiedMessage> {
    fn dispatch(&self, message: VerifiedMessage) -> Result<(), DispatchError> {
        self.send(message).map_err(|_| DispatchError::Closed)
    }
}

impl<T: Dispatcher + ?Sized> Dispatcher for Arc<T> {
    fn dispatch(&self, message: VerifiedMessage) -> Result<(), DispatchError> {
        (**self).dispatch(message)
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Why a packet was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Wrong length or undecodable fields.
    Malformed,
    /// The connection is not at the stage this packet advances from.
    StaleTransition,
    /// A confirmation for a connection that already authenticated.
    DuplicateConfirmation,
    /// Nonce already seen or too old.
    Replayed,
    /// Keys are not installed yet.
    NotReady,
    /// Packet kind has no meaning here.
    UnexpectedKind,
}

/// Why a connection was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    /// The claimed entity is not in the directory.
    UnknownIdentity,
    /// The key exchange rejected the payload.
    KeyExchangeFailed,
    /// A digest did not verify, or a verified frame carried the wrong payload.
    VerificationFailed,
}

/// Result of feeding one packet to the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The connection moved to this stage.
    Advanced(AuthStage),
    /// An application message from this peer went to the dispatcher.
    Delivered(EntityId),
    /// The packet was ignored; the connection is unchanged.
    Dropped(DropReason),
    /// The connection was forced back to `None`.
    Reset(ResetCause),
}

/// Failures propagated to the caller of a protocol step.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Session keys could not be derived.
    #[error("key derivation failed: {0}")]
    KeyDerivation(#[from] KdfError),

    /// The MAC primitive failed.
    #[error("mac failure: {0}")]
    Mac(#[from] MacError),

    /// A handshake body could not be encoded.
    #[error("packet encoding failed: {0}")]
    Packet(#[from] PacketError),

    /// Key exchange failed on the initiating side.
    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),

    /// The dispatcher refused a verified message.
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// Operation needs an authenticated connection.
    #[error("connection is not authenticated")]
    NotAuthenticated,

    /// Initiator step called out of order.
    #[error("handshake step needs stage {expected}, connection is at {actual}")]
    OutOfOrder {
        /// Stage the step starts from.
        expected: AuthStage,
        /// Stage the connection was at.
        actual: AuthStage,
    },
}

// =============================================================================
// SEALING HELPERS
// =============================================================================

fn seal_frame(
    context: &PeerKeyContext,
    kind: PacketKind,
    payload: &[u8],
    transport: Transport,
    nonce: u64,
) -> Result<Vec<u8>, MacError> {
    let message = packet::authenticated_bytes(kind, payload);
    let digest = match transport {
        Transport::Udp => context.hash_udp(&message, nonce)?,
        Transport::Tcp => context.hash_tcp(&message, nonce)?,
    };
    Ok(packet::encode_sealed(kind, &AuthHeader { nonce, digest }, payload))
}

fn seal_udp_frame(context: &PeerKeyContext, kind: PacketKind, payload: &[u8]) -> Result<Vec<u8>, MacError> {
    seal_frame(context, kind, payload, Transport::Udp, context.next_udp_sequence())
}

fn seal_tcp_frame(context: &PeerKeyContext, payload: &[u8], position: u64) -> Result<Vec<u8>, MacError> {
    if position & STREAM_NONCE_FLAG != 0 {
        return Err(MacError::NonceOutOfRange(position));
    }
    seal_frame(context, PacketKind::Data, payload, Transport::Tcp, stream_nonce(position))
}

fn check_frame(context: &PeerKeyContext, frame: &SealedFrame<'_>, transport: Transport) -> InboundVerdict {
    let verdict = context.accept_inbound(
        transport,
        &frame.header.digest,
        &frame.authenticated_bytes(),
        frame.header.nonce,
    );

    #[cfg(feature = "debug-tracing")]
    debug!(
        "{:?} frame nonce {:#018x} digest {} -> {:?}",
        frame.kind,
        frame.header.nonce,
        hex::encode(frame.header.digest),
        verdict
    );

    verdict
}

// =============================================================================
// RESPONDER
// =============================================================================

/// Responder side of the handshake, shared by every connection of a listener.
pub struct HandshakeProtocol<D, K, P> {
    local: LocalIdentity,
    directory: D,
    key_exchange: K,
    dispatcher: P,
    deriver: Box<dyn KeyDeriver>,
    config: AuthConfig,
}

impl<D, K, P> HandshakeProtocol<D, K, P>
where
    D: IdentityDirectory,
    K: KeyExchange,
    P: Dispatcher,
{
    /// Create a protocol instance with HKDF session key derivation.
    pub fn new(directory: D, key_exchange: K, dispatcher: P, config: AuthConfig) -> Self {
        Self {
            local: LocalIdentity {
                entity_id: config.local_entity_id,
            },
            directory,
            key_exchange,
            dispatcher,
            deriver: Box::new(HkdfKeyDeriver),
            config,
        }
    }

    /// Replace the session key derivation.
    pub fn with_deriver(mut self, deriver: impl KeyDeriver + 'static) -> Self {
        self.deriver = Box::new(deriver);
        self
    }

    /// Local identity used in key exchange.
    pub fn local(&self) -> LocalIdentity {
        self.local
    }

    /// Configuration in use.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Route one inbound packet by the connection's stage and the packet kind.
    pub fn handle_packet(
        &self,
        connection: &ConnectionState,
        socket: SocketId,
        remote: SocketAddr,
        bytes: &[u8],
        transport: Transport,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let kind = bytes.first().copied().and_then(PacketKind::from_u8);
        if kind.is_some_and(|k| !k.is_handshake()) {
            return match self.handle_authenticated(connection, socket, bytes, transport) {
                Err(HandshakeError::NotAuthenticated) => {
                    debug!("Data from {} before authentication", remote);
                    Ok(HandshakeOutcome::Dropped(DropReason::UnexpectedKind))
                }
                other => other,
            };
        }

        let envelope = UnauthenticatedMessage::from_packet(bytes, socket, remote, connection);
        self.handle_unauthenticated(&envelope)
    }

    /// Advance the handshake with a pre-authentication packet.
    pub fn handle_unauthenticated(
        &self,
        envelope: &UnauthenticatedMessage<'_>,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let Some(bytes) = envelope.bytes() else {
            debug!("Envelope from {} declares more bytes than it holds", envelope.remote());
            return Ok(HandshakeOutcome::Dropped(DropReason::Malformed));
        };

        let packet = match packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Malformed packet from {}: {}", envelope.remote(), e);
                return Ok(HandshakeOutcome::Dropped(DropReason::Malformed));
            }
        };

        match packet {
            Packet::IdentityClaim(claim) => Ok(self.on_identity_claim(envelope, &claim)),
            Packet::KeyAgreement(agreement) => self.on_key_agreement(envelope, &agreement),
            Packet::Sealed(frame) if frame.kind == PacketKind::Confirmation => {
                Ok(self.on_confirmation(envelope.connection(), envelope.remote(), &frame))
            }
            Packet::Sealed(frame) => {
                debug!("Unexpected {:?} frame from {}", frame.kind, envelope.remote());
                Ok(HandshakeOutcome::Dropped(DropReason::UnexpectedKind))
            }
        }
    }

    /// Verify an application frame on an authenticated connection and dispatch it.
    pub fn handle_authenticated(
        &self,
        connection: &ConnectionState,
        socket: SocketId,
        bytes: &[u8],
        transport: Transport,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        if !connection.compare_stage(AuthStage::Authenticated) {
            return Err(HandshakeError::NotAuthenticated);
        }
        let context = connection.context().ok_or(HandshakeError::NotAuthenticated)?;

        let frame = match packet::decode(bytes) {
            Ok(Packet::Sealed(frame)) if frame.kind == PacketKind::Data => frame,
            Ok(other) => {
                debug!("Unexpected {:?} on authenticated socket {}", other.kind(), socket);
                return Ok(HandshakeOutcome::Dropped(DropReason::UnexpectedKind));
            }
            Err(e) => {
                debug!("Malformed frame on socket {}: {}", socket, e);
                return Ok(HandshakeOutcome::Dropped(DropReason::Malformed));
            }
        };

        match check_frame(&context, &frame, transport) {
            InboundVerdict::Accepted => {
                let peer = context.entity_id();
                self.dispatcher.dispatch(VerifiedMessage {
                    peer,
                    payload: frame.payload.to_vec(),
                    socket,
                })?;
                Ok(HandshakeOutcome::Delivered(peer))
            }
            InboundVerdict::Replayed => {
                debug!("Replayed nonce {:#x} on socket {}", frame.header.nonce, socket);
                Ok(HandshakeOutcome::Dropped(DropReason::Replayed))
            }
            InboundVerdict::Forged => {
                warn!(
                    "Digest mismatch from peer {} on socket {}, resetting",
                    context.entity_id(),
                    socket
                );
                connection.reset();
                Ok(HandshakeOutcome::Reset(ResetCause::VerificationFailed))
            }
        }
    }

    /// Seal an outbound datagram for an authenticated connection.
    pub fn seal_udp(&self, connection: &ConnectionState, payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let context = authenticated_context(connection)?;
        Ok(seal_udp_frame(&context, PacketKind::Data, payload)?)
    }

    /// Seal an outbound stream message at `position` for an authenticated connection.
    ///
    /// Positions must stay below 2^63 and increase along the stream.
    pub fn seal_tcp(
        &self,
        connection: &ConnectionState,
        payload: &[u8],
        position: u64,
    ) -> Result<Vec<u8>, HandshakeError> {
        let context = authenticated_context(connection)?;
        Ok(seal_tcp_frame(&context, payload, position)?)
    }

    /// Seal the acceptance frame sent after the confirmation was accepted.
    pub fn seal_acceptance(&self, connection: &ConnectionState) -> Result<Vec<u8>, HandshakeError> {
        let context = authenticated_context(connection)?;
        Ok(seal_udp_frame(&context, PacketKind::Accepted, ACCEPTANCE_PAYLOAD)?)
    }

    /// Whether `bytes` may open a connection: an identity claim for an entity
    /// in the directory.
    pub fn admits_first_contact(&self, bytes: &[u8]) -> bool {
        match packet::decode(bytes) {
            Ok(Packet::IdentityClaim(claim)) => self.known_peer(claim.entity_id).is_some(),
            _ => false,
        }
    }

    fn known_peer(&self, entity_id: EntityId) -> Option<PeerRecord> {
        if entity_id == 0 {
            return None;
        }
        self.directory.lookup(entity_id)
    }

    fn on_identity_claim(
        &self,
        envelope: &UnauthenticatedMessage<'_>,
        claim: &IdentityClaim,
    ) -> HandshakeOutcome {
        let connection = envelope.connection();
        if !connection.compare_stage(AuthStage::None) {
            debug!("Stale identity claim from {}", envelope.remote());
            return HandshakeOutcome::Dropped(DropReason::StaleTransition);
        }

        if self.known_peer(claim.entity_id).is_none() {
            warn!("Unknown entity {} claimed by {}", claim.entity_id, envelope.remote());
            connection.reset();
            return HandshakeOutcome::Reset(ResetCause::UnknownIdentity);
        }

        let partial = Arc::new(PeerKeyContext::partial(
            claim.entity_id,
            envelope.remote(),
            unix_millis(),
        ));
        if !connection.try_advance(AuthStage::Init) {
            debug!("Lost identity claim race for {}", envelope.remote());
            return HandshakeOutcome::Dropped(DropReason::StaleTransition);
        }
        connection.install_context(AuthStage::Init, partial);

        debug!("Entity {} at {} entered init", claim.entity_id, envelope.remote());
        HandshakeOutcome::Advanced(AuthStage::Init)
    }

    fn on_key_agreement(
        &self,
        envelope: &UnauthenticatedMessage<'_>,
        agreement: &KeyAgreement,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let connection = envelope.connection();
        if !connection.compare_stage(AuthStage::Init) {
            debug!("Stale key agreement from {}", envelope.remote());
            return Ok(HandshakeOutcome::Dropped(DropReason::StaleTransition));
        }

        let Some(partial) = connection.context() else {
            return Ok(HandshakeOutcome::Dropped(DropReason::NotReady));
        };
        if partial.entity_id() != agreement.entity_id {
            warn!(
                "Key agreement for entity {} from {}, which claimed {}",
                agreement.entity_id,
                envelope.remote(),
                partial.entity_id()
            );
            connection.reset();
            return Ok(HandshakeOutcome::Reset(ResetCause::UnknownIdentity));
        }

        let Some(peer) = self.known_peer(agreement.entity_id) else {
            warn!("Key agreement for unknown entity {} from {}", agreement.entity_id, envelope.remote());
            connection.reset();
            return Ok(HandshakeOutcome::Reset(ResetCause::UnknownIdentity));
        };

        let secret = match self.key_exchange.exchange(&agreement.payload, &self.local, &peer) {
            Ok(secret) => secret,
            Err(e) => {
                warn!("Key exchange with entity {} failed: {}", peer.entity_id, e);
                connection.reset();
                return Ok(HandshakeOutcome::Reset(ResetCause::KeyExchangeFailed));
            }
        };

        let keys = match self.deriver.derive(&secret, Role::Responder) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Key derivation for entity {} failed: {}", peer.entity_id, e);
                connection.reset();
                return Err(e.into());
            }
        };

        let context = Arc::new(PeerKeyContext::complete(
            peer.entity_id,
            SessionKeys::new(&keys),
            envelope.remote(),
            partial.timestamp(),
            &self.config,
        ));

        if !connection.try_advance(AuthStage::KeyExchange)
            || !connection.install_context(AuthStage::KeyExchange, context)
        {
            debug!("Lost key agreement race for {}", envelope.remote());
            return Ok(HandshakeOutcome::Dropped(DropReason::StaleTransition));
        }

        debug!("Entity {} at {} entered key exchange", peer.entity_id, envelope.remote());
        Ok(HandshakeOutcome::Advanced(AuthStage::KeyExchange))
    }

    fn on_confirmation(
        &self,
        connection: &ConnectionState,
        remote: SocketAddr,
        frame: &SealedFrame<'_>,
    ) -> HandshakeOutcome {
        match connection.current_stage() {
            AuthStage::KeyExchange => {}
            AuthStage::Authenticated => {
                debug!("Duplicate confirmation from {}", remote);
                return HandshakeOutcome::Dropped(DropReason::DuplicateConfirmation);
            }
            stage => {
                debug!("Confirmation from {} at stage {}", remote, stage);
                return HandshakeOutcome::Dropped(DropReason::StaleTransition);
            }
        }

        let Some(context) = connection.context().filter(|c| c.is_complete()) else {
            return HandshakeOutcome::Dropped(DropReason::NotReady);
        };

        match check_frame(&context, frame, Transport::Udp) {
            InboundVerdict::Accepted if frame.payload == CONFIRMATION_PAYLOAD => {}
            InboundVerdict::Replayed => {
                return HandshakeOutcome::Dropped(DropReason::DuplicateConfirmation);
            }
            InboundVerdict::Accepted | InboundVerdict::Forged => {
                // A concurrent copy may have authenticated the connection meanwhile.
                if !connection.compare_stage(AuthStage::KeyExchange) {
                    return HandshakeOutcome::Dropped(DropReason::DuplicateConfirmation);
                }
                warn!("Confirmation from {} failed verification, resetting", remote);
                connection.reset();
                return HandshakeOutcome::Reset(ResetCause::VerificationFailed);
            }
        }

        if connection.accept_final() {
            info!("Entity {} at {} authenticated", context.entity_id(), remote);
            HandshakeOutcome::Advanced(AuthStage::Authenticated)
        } else {
            debug!("Duplicate confirmation from {}", remote);
            HandshakeOutcome::Dropped(DropReason::DuplicateConfirmation)
        }
    }
}

fn authenticated_context(connection: &ConnectionState) -> Result<Arc<PeerKeyContext>, HandshakeError> {
    if !connection.compare_stage(AuthStage::Authenticated) {
        return Err(HandshakeError::NotAuthenticated);
    }
    connection.context().ok_or(HandshakeError::NotAuthenticated)
}

// =============================================================================
// INITIATOR
// =============================================================================

/// Connecting side of the handshake for one responder.
pub struct Initiator<K> {
    local: LocalIdentity,
    responder: PeerRecord,
    remote: SocketAddr,
    key_exchange: K,
    deriver: Box<dyn KeyDeriver>,
    config: AuthConfig,
    connection: ConnectionState,
}

impl<K: KeyExchange> Initiator<K> {
    /// Prepare a handshake with `responder`, reachable at `remote`.
    pub fn new(
        local: LocalIdentity,
        responder: PeerRecord,
        remote: SocketAddr,
        key_exchange: K,
        config: AuthConfig,
    ) -> Self {
        Self {
            local,
            responder,
            remote,
            key_exchange,
            deriver: Box::new(HkdfKeyDeriver),
            config,
            connection: ConnectionState::new(),
        }
    }

    /// Replace the session key derivation.
    pub fn with_deriver(mut self, deriver: impl KeyDeriver + 'static) -> Self {
        self.deriver = Box::new(deriver);
        self
    }

    /// State of this side of the connection.
    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    /// Random key-agreement payload for [`PreSharedKeyExchange`](super::directory::PreSharedKeyExchange).
    pub fn fresh_salt() -> [u8; super::directory::MIN_SALT_LEN] {
        rand::random()
    }

    fn expect_stage(&self, expected: AuthStage) -> Result<(), HandshakeError> {
        let actual = self.connection.current_stage();
        if actual != expected {
            return Err(HandshakeError::OutOfOrder { expected, actual });
        }
        Ok(())
    }

    fn advance(&self, target: AuthStage) -> Result<(), HandshakeError> {
        if self.connection.try_advance(target) {
            return Ok(());
        }
        Err(HandshakeError::OutOfOrder {
            expected: target.predecessor().unwrap_or(AuthStage::None),
            actual: self.connection.current_stage(),
        })
    }

    /// First packet: claim the local identity.
    pub fn identity_claim(&self) -> Result<Vec<u8>, HandshakeError> {
        self.expect_stage(AuthStage::None)?;
        let bytes = packet::encode_identity_claim(&IdentityClaim {
            entity_id: self.local.entity_id,
        })?;

        self.advance(AuthStage::Init)?;
        self.connection.install_context(
            AuthStage::Init,
            Arc::new(PeerKeyContext::partial(
                self.responder.entity_id,
                self.remote,
                unix_millis(),
            )),
        );
        Ok(bytes)
    }

    /// Second packet: derive session keys from `payload` and send it along.
    pub fn key_agreement(&self, payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        self.expect_stage(AuthStage::Init)?;

        let secret = self.key_exchange.exchange(payload, &self.local, &self.responder)?;
        let keys = self.deriver.derive(&secret, Role::Initiator)?;
        let established = self
            .connection
            .context()
            .map(|c| c.timestamp())
            .unwrap_or_else(unix_millis);
        let context = Arc::new(PeerKeyContext::complete(
            self.responder.entity_id,
            SessionKeys::new(&keys),
            self.remote,
            established,
            &self.config,
        ));

        let bytes = packet::encode_key_agreement(&KeyAgreement {
            entity_id: self.local.entity_id,
            payload: payload.to_vec(),
        })?;

        self.advance(AuthStage::KeyExchange)?;
        self.connection.install_context(AuthStage::KeyExchange, context);
        Ok(bytes)
    }

    /// Third packet: prove possession of the derived key. May be resent.
    pub fn confirmation(&self) -> Result<Vec<u8>, HandshakeError> {
        self.expect_stage(AuthStage::KeyExchange)?;
        let context = self
            .connection
            .context()
            .filter(|c| c.is_complete())
            .ok_or(HandshakeError::OutOfOrder {
                expected: AuthStage::KeyExchange,
                actual: self.connection.current_stage(),
            })?;
        Ok(seal_udp_frame(&context, PacketKind::Confirmation, CONFIRMATION_PAYLOAD)?)
    }

    /// Process the responder's acceptance frame.
    pub fn handle_acceptance(&self, bytes: &[u8]) -> Result<HandshakeOutcome, HandshakeError> {
        let frame = match packet::decode(bytes) {
            Ok(Packet::Sealed(frame)) if frame.kind == PacketKind::Accepted => frame,
            Ok(_) => return Ok(HandshakeOutcome::Dropped(DropReason::UnexpectedKind)),
            Err(e) => {
                debug!("Malformed acceptance from {}: {}", self.remote, e);
                return Ok(HandshakeOutcome::Dropped(DropReason::Malformed));
            }
        };

        if self.connection.current_stage() < AuthStage::KeyExchange {
            return Ok(HandshakeOutcome::Dropped(DropReason::StaleTransition));
        }
        let Some(context) = self.connection.context().filter(|c| c.is_complete()) else {
            return Ok(HandshakeOutcome::Dropped(DropReason::NotReady));
        };

        match check_frame(&context, &frame, Transport::Udp) {
            InboundVerdict::Accepted if frame.payload == ACCEPTANCE_PAYLOAD => {}
            InboundVerdict::Replayed => return Ok(HandshakeOutcome::Dropped(DropReason::Replayed)),
            InboundVerdict::Accepted | InboundVerdict::Forged => {
                warn!("Acceptance from {} failed verification, resetting", self.remote);
                self.connection.reset();
                return Ok(HandshakeOutcome::Reset(ResetCause::VerificationFailed));
            }
        }

        if self.connection.accept_final() {
            info!("Authenticated with entity {} at {}", self.responder.entity_id, self.remote);
            Ok(HandshakeOutcome::Advanced(AuthStage::Authenticated))
        } else {
            Ok(HandshakeOutcome::Dropped(DropReason::DuplicateConfirmation))
        }
    }

    /// Seal an outbound datagram.
    pub fn seal_udp(&self, payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let context = authenticated_context(&self.connection)?;
        Ok(seal_udp_frame(&context, PacketKind::Data, payload)?)
    }

    /// Seal an outbound stream message at `position`.
    pub fn seal_tcp(&self, payload: &[u8], position: u64) -> Result<Vec<u8>, HandshakeError> {
        let context = authenticated_context(&self.connection)?;
        Ok(seal_tcp_frame(&context, payload, position)?)
    }

    /// Verify a data frame from the responder and return its payload.
    ///
    /// `None` means the frame was malformed, forged or replayed and was dropped.
    pub fn open(&self, bytes: &[u8], transport: Transport) -> Result<Option<Vec<u8>>, HandshakeError> {
        let context = authenticated_context(&self.connection)?;
        let Ok(Packet::Sealed(frame)) = packet::decode(bytes) else {
            return Ok(None);
        };
        if frame.kind != PacketKind::Data {
            return Ok(None);
        }

        match check_frame(&context, &frame, transport) {
            InboundVerdict::Accepted => Ok(Some(frame.payload.to_vec())),
            InboundVerdict::Replayed | InboundVerdict::Forged => Ok(None),
        }
    }
}

impl<K> std::fmt::Debug for Initiator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Initiator")
            .field("local", &self.local)
            .field("responder", &self.responder.entity_id)
            .field("remote", &self.remote)
            .field("connection", &self.connection)
            .finish()
    }
}
