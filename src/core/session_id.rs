//! Process-local session id counter.
//!
//! Session ids fence stale protocol messages: the storage lock manager lets a
//! larger id preempt a smaller one. The counter starts from the wall clock
//! (milliseconds) plus random jitter so that a restarted process does not
//! reissue ids a peer may still hold, then increases by one per allocation.
//!
//! Ordering is only meaningful between ids minted by the same generator.
//! Two independent processes minting ids for the same resource have no
//! global order; the host is the only minter for transfers it sends.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wire representation of a session id. Negative values are invalid.
pub type SessionId = i64;

/// Monotonically increasing, never-reused session id source.
#[derive(Debug)]
pub struct SessionIdGenerator {
    next: AtomicI64,
}

impl SessionIdGenerator {
    /// Seed from wall-clock milliseconds plus up to 1000 random steps.
    pub fn new() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let jitter = rand::random::<u16>() as i64 % 1000;
        Self::starting_at(millis.saturating_add(jitter).max(1))
    }

    /// Start from an explicit value (tests, deterministic scenarios).
    pub fn starting_at(first: SessionId) -> Self {
        Self {
            next: AtomicI64::new(first.max(1)),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> SessionId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure future ids are strictly greater than `seen`.
    ///
    /// Used when a playback generation is derived from an id minted
    /// elsewhere (a completed preload) so later requests keep sequencing.
    pub fn observe(&self, seen: SessionId) {
        self.next.fetch_max(seen.saturating_add(1), Ordering::Relaxed);
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_positive_and_increasing() {
        let ids = SessionIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(a > 0);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn observe_moves_counter_forward_only() {
        let ids = SessionIdGenerator::starting_at(10);
        ids.observe(100);
        assert_eq!(ids.next_id(), 101);
        ids.observe(5);
        assert_eq!(ids.next_id(), 102);
    }
}
