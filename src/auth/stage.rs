//! Authentication Stages
//!
//! Stages are totally ordered and only ever move forward by one step, or fall
//! back to `None`. The legal forward moves are listed in [`PREDECESSORS`] so the
//! transition graph can be audited without looking at the atomic code.

/// Handshake progress of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AuthStage {
    /// Nothing received yet, or the connection was invalidated.
    None = 0,
    /// The peer claimed an identity the directory knows.
    Init = 1,
    /// Keys were derived from the peer's key-agreement payload.
    KeyExchange = 2,
    /// The peer proved possession of the derived key.
    Authenticated = 3,
}

/// Required predecessor of each stage, indexed by the stage's raw value.
///
/// `None` has no predecessor: it is reached by reset, never by advancing.
pub const PREDECESSORS: [Option<AuthStage>; 4] = [
    None,
    Some(AuthStage::None),
    Some(AuthStage::Init),
    Some(AuthStage::KeyExchange),
];

impl AuthStage {
    /// All stages in order.
    pub const ALL: [AuthStage; 4] = [
        AuthStage::None,
        AuthStage::Init,
        AuthStage::KeyExchange,
        AuthStage::Authenticated,
    ];

    /// Raw register value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a raw register value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AuthStage::None),
            1 => Some(AuthStage::Init),
            2 => Some(AuthStage::KeyExchange),
            3 => Some(AuthStage::Authenticated),
            _ => None,
        }
    }

    /// The only stage this one may be entered from.
    #[inline]
    pub fn predecessor(self) -> Option<AuthStage> {
        PREDECESSORS[self as usize]
    }

    /// The stage one step forward, if any.
    pub fn next(self) -> Option<AuthStage> {
        Self::ALL.iter().copied().find(|s| s.predecessor() == Some(self))
    }

    /// Whether traffic on a connection in this stage may reach the dispatcher.
    #[inline]
    pub fn is_authenticated(self) -> bool {
        self == AuthStage::Authenticated
    }
}

impl std::fmt::Display for AuthStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthStage::None => "none",
            AuthStage::Init => "init",
            AuthStage::KeyExchange => "key_exchange",
            AuthStage::Authenticated => "authenticated",
        };
        f.write_str(name)
    }
}
