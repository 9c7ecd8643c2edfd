//! Session authentication: connection stages, peer key contexts and the handshake.

pub mod config;
pub mod connection;
pub mod directory;
pub mod envelope;
pub mod handshake;
pub mod packet;
pub mod peer;
pub mod stage;

pub use config::AuthConfig;
pub use connection::{ConnectionSnapshot, ConnectionState};
pub use directory::{
    DirectoryError, IdentityDirectory, KeyExchange, KeyExchangeError, LocalIdentity, PeerRecord,
    PreSharedKeyExchange, StaticDirectory,
};
pub use envelope::UnauthenticatedMessage;
pub use handshake::{
    DispatchError, Dispatcher, DropReason, HandshakeError, HandshakeOutcome, HandshakeProtocol,
    Initiator, ResetCause, VerifiedMessage,
};
pub use packet::{PacketError, PacketKind};
pub use peer::{
    stream_nonce, InboundVerdict, KeyMaterial, PeerKeyContext, SessionKeys, Transport,
    STREAM_NONCE_FLAG,
};
pub use stage::AuthStage;
