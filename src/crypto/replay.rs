//! Inbound Replay Protection
//!
//! Checked only after a digest has verified, so an attacker without the key
//! cannot advance the windows.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sliding window for datagram counters, which may arrive lost or reordered.
///
/// Each counter maps to one slot; a slot remembers the newest counter it has
/// seen (plus one, so zero means empty). A counter is accepted when it is newer
/// than its slot's occupant by at most `max_gap`.
pub struct ReplayWindow {
    slots: Box<[AtomicU64]>,
    max_gap: u64,
}

impl ReplayWindow {
    /// Create a window with `slots` slots (at least one).
    pub fn new(slots: usize, max_gap: u64) -> Self {
        let slots = (0..slots.max(1)).map(|_| AtomicU64::new(0)).collect();
        Self { slots, max_gap }
    }

    fn slot(&self, counter: u64) -> &AtomicU64 {
        &self.slots[(counter % self.slots.len() as u64) as usize]
    }

    #[cfg(test)]
    fn check(&self, counter: u64) -> bool {
        let prev = self.slot(counter).load(Ordering::Relaxed);
        let counter = counter.wrapping_add(1);
        prev < counter && counter.wrapping_sub(prev) <= self.max_gap
    }

    /// Record `counter` and report whether it was fresh. Callers verify the
    /// digest first.
    pub fn update(&self, counter: u64) -> bool {
        let slot = self.slot(counter);
        let counter = counter.wrapping_add(1);
        let prev = slot.fetch_max(counter, Ordering::Relaxed);
        prev < counter && counter.wrapping_sub(prev) <= self.max_gap
    }
}

impl std::fmt::Debug for ReplayWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayWindow")
            .field("slots", &self.slots.len())
            .field("max_gap", &self.max_gap)
            .finish()
    }
}

/// High-water mark for stream nonces, which arrive in order.
#[derive(Debug, Default)]
pub struct StreamHighWater(AtomicU64);

impl StreamHighWater {
    /// Create an empty mark.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Accept `nonce` only if it is strictly greater than every nonce accepted before.
    pub fn accept(&self, nonce: u64) -> bool {
        self.0.fetch_max(nonce, Ordering::AcqRel) < nonce
    }

    /// Highest nonce accepted so far.
    pub fn last(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_rejects_duplicate() {
        let window = ReplayWindow::new(16, 1024);
        assert!(window.update(1));
        assert!(!window.update(1));
        assert!(!window.check(1));
    }

    #[test]
    fn test_window_accepts_reordered() {
        let window = ReplayWindow::new(16, 1024);
        assert!(window.update(5));
        assert!(window.update(3));
        assert!(window.update(4));
        assert!(!window.update(3));
    }

    #[test]
    fn test_window_rejects_stale_slot_occupant() {
        let window = ReplayWindow::new(4, 1024);
        assert!(window.update(9));
        // 5 shares slot 1 with 9 and is older
        assert!(!window.update(5));
    }

    #[test]
    fn test_window_rejects_far_future() {
        let window = ReplayWindow::new(4, 16);
        assert!(!window.check(100));
        assert!(!window.update(100));
        assert!(window.update(10));
    }

    #[test]
    fn test_check_does_not_mutate() {
        let window = ReplayWindow::new(8, 64);
        assert!(window.check(3));
        assert!(window.check(3));
        assert!(window.update(3));
    }

    #[test]
    fn test_stream_high_water() {
        let mark = StreamHighWater::new();
        assert!(mark.accept(10));
        assert!(!mark.accept(10));
        assert!(!mark.accept(9));
        assert!(mark.accept(11));
        assert_eq!(mark.last(), 11);
    }
}
