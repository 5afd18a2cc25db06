//! Storage lock manager: exclusive write ownership of the two slots.
//!
//! Ownership is arbitrated by session id. Acquisition rules, evaluated in
//! order for `acquire(slot, session_id, resource)`:
//!
//! 1. A negative session id fails.
//! 2. An unlocked slot is taken unconditionally.
//! 3. Same resource, same session id: the lock timestamp is refreshed
//!    (idempotent re-entry, e.g. a slow-starting retry).
//! 4. Same resource, smaller session id: fails as stale.
//! 5. Same resource, larger session id: preempts.
//! 6. Different resource: a session id `>=` the owner preempts; a smaller one
//!    fails unless the lock is older than the slot's timeout, in which case it
//!    force-preempts as stale-lock cleanup.
//!
//! The manager never touches I/O. On preemption it hands the previous write
//! handle back inside [`Grant::Preempted`]; the caller closes it before
//! opening the new one, so two writers never hold the resource at once.

use super::SlotKind;
use crate::core::session_id::SessionId;
use std::time::Instant;
use thiserror::Error;

/// Why an acquisition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("invalid session id {0}")]
    InvalidSession(SessionId),
    #[error("stale session {requested}: slot already owned by newer session {held_by}")]
    Stale {
        held_by: SessionId,
        requested: SessionId,
    },
    #[error("slot held by session {held_by} for {resource}; session {requested} must wait")]
    Collision {
        held_by: SessionId,
        resource: String,
        requested: SessionId,
    },
}

/// Successful acquisition.
#[derive(Debug)]
pub enum Grant<H> {
    /// The slot was free.
    Fresh,
    /// Same session and resource already held it; timestamp refreshed.
    Reentered,
    /// Another session was evicted. Its handle must be closed before a new
    /// one is opened.
    Preempted {
        previous_owner: SessionId,
        previous_resource: String,
        /// Forced by lock age rather than by session ordering.
        timed_out: bool,
        handle: Option<H>,
    },
}

/// State of one slot.
#[derive(Debug)]
struct Slot<H> {
    locked: bool,
    owner: Option<SessionId>,
    resource_name: Option<String>,
    acquired_at: Option<Instant>,
    chunk_size: usize,
    written_chunks: u64,
    handle: Option<H>,
}

impl<H> Slot<H> {
    fn empty() -> Self {
        Self {
            locked: false,
            owner: None,
            resource_name: None,
            acquired_at: None,
            chunk_size: 0,
            written_chunks: 0,
            handle: None,
        }
    }

    fn take_fields(&mut self) -> Option<H> {
        let handle = self.handle.take();
        *self = Self::empty();
        handle
    }
}

/// Lock table for the `current` and `preload` slots, generic over the write
/// handle type so the arbitration rules can be exercised without files.
#[derive(Debug)]
pub struct LockManager<H> {
    slots: [Slot<H>; 2],
}

impl<H> LockManager<H> {
    pub fn new() -> Self {
        Self {
            slots: [Slot::empty(), Slot::empty()],
        }
    }

    fn slot(&self, kind: SlotKind) -> &Slot<H> {
        &self.slots[kind.index()]
    }

    fn slot_mut(&mut self, kind: SlotKind) -> &mut Slot<H> {
        &mut self.slots[kind.index()]
    }

    pub fn acquire(
        &mut self,
        kind: SlotKind,
        session_id: SessionId,
        resource: &str,
    ) -> Result<Grant<H>, LockError> {
        self.acquire_at(kind, session_id, resource, Instant::now())
    }

    /// [`acquire`](Self::acquire) with an explicit clock.
    pub fn acquire_at(
        &mut self,
        kind: SlotKind,
        session_id: SessionId,
        resource: &str,
        now: Instant,
    ) -> Result<Grant<H>, LockError> {
        if session_id < 0 {
            return Err(LockError::InvalidSession(session_id));
        }

        let timeout = kind.lock_timeout();
        let slot = self.slot_mut(kind);

        let (owner, held_resource) = match (slot.locked, slot.owner, slot.resource_name.as_deref()) {
            (true, Some(owner), Some(held)) => (owner, held.to_string()),
            _ => {
                // Unlocked (or half-cleared): take it.
                let stray = slot.take_fields();
                slot.lock(session_id, resource, now);
                return Ok(match stray {
                    None => Grant::Fresh,
                    Some(handle) => Grant::Preempted {
                        previous_owner: -1,
                        previous_resource: String::new(),
                        timed_out: false,
                        handle: Some(handle),
                    },
                });
            }
        };

        let timed_out = if held_resource == resource {
            if session_id == owner {
                slot.acquired_at = Some(now);
                return Ok(Grant::Reentered);
            }
            if session_id < owner {
                return Err(LockError::Stale {
                    held_by: owner,
                    requested: session_id,
                });
            }
            false
        } else if session_id >= owner {
            false
        } else {
            let age = slot
                .acquired_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            if age <= timeout {
                return Err(LockError::Collision {
                    held_by: owner,
                    resource: held_resource,
                    requested: session_id,
                });
            }
            true
        };

        let handle = slot.take_fields();
        slot.lock(session_id, resource, now);
        Ok(Grant::Preempted {
            previous_owner: owner,
            previous_resource: held_resource,
            timed_out,
            handle,
        })
    }

    /// Release the slot, returning its write handle for closing. Safe to call
    /// on an unlocked slot.
    pub fn release(&mut self, kind: SlotKind) -> Option<H> {
        self.slot_mut(kind).take_fields()
    }

    pub fn is_held_by(&self, kind: SlotKind, session_id: SessionId) -> bool {
        let slot = self.slot(kind);
        slot.locked && slot.owner == Some(session_id)
    }

    pub fn owner(&self, kind: SlotKind) -> Option<SessionId> {
        let slot = self.slot(kind);
        if slot.locked { slot.owner } else { None }
    }

    pub fn resource(&self, kind: SlotKind) -> Option<&str> {
        self.slot(kind).resource_name.as_deref()
    }

    /// Attach the write handle opened for the current owner.
    pub fn attach(&mut self, kind: SlotKind, handle: H) {
        self.slot_mut(kind).handle = Some(handle);
    }

    pub fn handle_mut(&mut self, kind: SlotKind) -> Option<&mut H> {
        self.slot_mut(kind).handle.as_mut()
    }

    pub fn set_chunk_size(&mut self, kind: SlotKind, chunk_size: usize) {
        self.slot_mut(kind).chunk_size = chunk_size;
    }

    pub fn chunk_size(&self, kind: SlotKind) -> usize {
        self.slot(kind).chunk_size
    }

    /// Count one persisted chunk and return the running total.
    pub fn record_write(&mut self, kind: SlotKind) -> u64 {
        let slot = self.slot_mut(kind);
        slot.written_chunks += 1;
        slot.written_chunks
    }

    pub fn written_chunks(&self, kind: SlotKind) -> u64 {
        self.slot(kind).written_chunks
    }
}

impl<H> Default for LockManager<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Slot<H> {
    fn lock(&mut self, session_id: SessionId, resource: &str, now: Instant) {
        self.locked = true;
        self.owner = Some(session_id);
        self.resource_name = Some(resource.to_string());
        self.acquired_at = Some(now);
        self.written_chunks = 0;
    }
}
