//! Connection State
//!
//! One per socket. Holds the authentication stage in a single atomic byte and a
//! shared reference to the peer's key context.
//!
//! The stage register is the only synchronization point of the handshake. A
//! forward transition is one compare-and-swap against the predecessor listed in
//! [`PREDECESSORS`](super::stage::PREDECESSORS); when many threads race the same
//! transition exactly one of them sees `true`. Threads that lose are looking at
//! a duplicate or stale packet and drop it.
//!
//! The context slot is swapped wholesale, never mutated through. A reader that
//! already cloned the old `Arc` finishes against the old keys. The slot sits
//! behind a `parking_lot::RwLock` held only for the clone or the swap; stage
//! reads and transitions never take it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::peer::PeerKeyContext;
use super::stage::AuthStage;

/// Read-only view handed to connection reapers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Stage at the time of the snapshot.
    pub stage: AuthStage,
    /// Establishment timestamp of the installed context, if any (Unix ms).
    pub established_at: Option<u64>,
}

impl ConnectionSnapshot {
    /// Milliseconds since establishment, if a context is installed.
    pub fn age_millis(&self, now: u64) -> Option<u64> {
        self.established_at.map(|t| now.saturating_sub(t))
    }
}

/// Per-connection stage register and key context slot.
pub struct ConnectionState {
    stage: AtomicU8,
    context: RwLock<Option<Arc<PeerKeyContext>>>,
}

impl ConnectionState {
    /// State for a freshly accepted socket: stage `None`, no context.
    pub fn new() -> Self {
        Self {
            stage: AtomicU8::new(AuthStage::None.as_u8()),
            context: RwLock::new(None),
        }
    }

    /// State for a socket whose peer authenticated on another channel.
    pub fn authenticated(context: Arc<PeerKeyContext>) -> Self {
        Self {
            stage: AtomicU8::new(AuthStage::Authenticated.as_u8()),
            context: RwLock::new(Some(context)),
        }
    }

    /// Compare the current stage with `expected`.
    #[inline]
    pub fn compare_stage(&self, expected: AuthStage) -> bool {
        self.stage.load(Ordering::Acquire) == expected.as_u8()
    }

    /// Snapshot of the current stage.
    #[inline]
    pub fn current_stage(&self) -> AuthStage {
        AuthStage::from_u8(self.stage.load(Ordering::Relaxed)).unwrap_or(AuthStage::None)
    }

    /// Move to `target` if the connection currently sits at its predecessor.
    ///
    /// Returns `true` to the single caller that performed the transition.
    ///
    /// `AuthStage::None` is special: it is stored unconditionally, the context is
    /// dropped, and the result is always `false`. A `false` therefore means "no new
    /// stage was reached", whether the call lost a race or invalidated the
    /// connection.
    pub fn try_advance(&self, target: AuthStage) -> bool {
        let Some(previous) = target.predecessor() else {
            let mut slot = self.context.write();
            self.stage.store(AuthStage::None.as_u8(), Ordering::Release);
            slot.take();
            return false;
        };

        self.stage
            .compare_exchange(
                previous.as_u8(),
                target.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Invalidate the connection. Always returns `false`.
    #[inline]
    pub fn reset(&self) -> bool {
        self.try_advance(AuthStage::None)
    }

    /// Final handshake step, `KeyExchange -> Authenticated`.
    ///
    /// The confirmation that triggers it may be duplicated in transit; only the
    /// first copy gets `true`.
    pub fn accept_final(&self) -> bool {
        self.stage
            .compare_exchange(
                AuthStage::KeyExchange.as_u8(),
                AuthStage::Authenticated.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// The installed key context, if any.
    pub fn context(&self) -> Option<Arc<PeerKeyContext>> {
        self.context.read().clone()
    }

    /// Install `context` if the stage still equals `expected`.
    ///
    /// The check happens under the slot lock, and a reset stores `None` and
    /// clears the slot under the same lock, so a reset is never undone by a late
    /// install and never wipes a context installed after it.
    pub fn install_context(&self, expected: AuthStage, context: Arc<PeerKeyContext>) -> bool {
        let mut slot = self.context.write();
        if !self.compare_stage(expected) {
            return false;
        }
        *slot = Some(context);
        true
    }

    /// Swap in a re-keyed context on an authenticated connection.
    ///
    /// Returns the previous context, which stays valid for whoever still holds it.
    pub fn rekey(&self, context: Arc<PeerKeyContext>) -> Option<Arc<PeerKeyContext>> {
        let mut slot = self.context.write();
        if !self.compare_stage(AuthStage::Authenticated) {
            return None;
        }
        slot.replace(context)
    }

    /// Read-only view for reapers.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            stage: self.current_stage(),
            established_at: self.context.read().as_ref().map(|c| c.timestamp()),
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("stage", &self.current_stage())
            .field("context", &self.context.read().as_ref().map(|c| c.entity_id()))
            .finish()
    }
}
