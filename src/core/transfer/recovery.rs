//! Recovery coordinator: bounded, backed-off resume requests for a stalled
//! inbound transfer.
//!
//! ```text
//! Idle ──trigger──► Pending ──fire──► Requested ──trigger──► Pending ...
//!   ▲                  │                  │
//!   └──── abort ───────┘                  └── complete / track change ──► Idle
//! ```
//!
//! The coordinator is a pure state machine. The caller owns the timer: on
//! [`TriggerOutcome::Scheduled`] it sleeps for the delay and then calls
//! [`RecoveryCoordinator::fire`] with the returned generation, which
//! re-validates the world before producing the request.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::config::{MAX_RECOVERY_RETRIES, RECOVERY_BACKOFF_MS};
use crate::core::connection::PeerLink;
use crate::core::protocol::ProtocolMessage;
use crate::core::session_id::SessionId;
use crate::core::storage::SlotKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Idle,
    /// A request is scheduled and not yet sent.
    Pending,
    /// A request went out; waiting for the transfer to finish.
    Requested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Call `fire(generation, ..)` after `delay`.
    Scheduled { delay: Duration, generation: u64 },
    /// A request is already scheduled.
    AlreadyPending,
    /// Retry budget spent: the transfer is abandoned and the coordinator is
    /// idle again.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    /// Send `message` on the chosen link.
    Send { message: ProtocolMessage, attempt: u32 },
    /// Track changed or the link died; nothing sent, count reset.
    Aborted,
    /// Timer from an older episode; ignored.
    Stale,
}

/// State snapshot the coordinator validates against at fire time.
pub struct FireContext<'a> {
    /// Filename of the transfer currently tracked for this slot.
    pub current_filename: Option<&'a str>,
    pub session_id: Option<SessionId>,
    /// Resume point when no index was forced.
    pub received_count: u32,
    /// Link the request would travel on: the upstream, which is a relay
    /// when this guest joined through one.
    pub route: Option<&'a PeerLink>,
}

#[derive(Debug)]
pub struct RecoveryCoordinator {
    slot: SlotKind,
    state: RecoveryState,
    retry_count: u32,
    pending_filename: Option<String>,
    forced_index: Option<u32>,
    generation: u64,
}

impl RecoveryCoordinator {
    pub fn new(slot: SlotKind) -> Self {
        Self {
            slot,
            state: RecoveryState::Idle,
            retry_count: 0,
            pending_filename: None,
            forced_index: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Start (or continue) a stall episode for `filename`. `forced` pins the
    /// resume index instead of using the received count at fire time.
    pub fn trigger(&mut self, filename: &str, forced: Option<u32>) -> TriggerOutcome {
        if self.state == RecoveryState::Pending {
            return TriggerOutcome::AlreadyPending;
        }
        if self.retry_count >= MAX_RECOVERY_RETRIES {
            warn!(
                event = "recovery_exhausted",
                slot = %self.slot,
                filename = %filename,
                attempts = self.retry_count,
                "Giving up on transfer"
            );
            self.reset();
            return TriggerOutcome::Exhausted;
        }

        let delay = Duration::from_millis(RECOVERY_BACKOFF_MS[self.retry_count as usize]);
        self.state = RecoveryState::Pending;
        self.pending_filename = Some(filename.to_string());
        self.forced_index = forced;
        self.generation += 1;
        debug!(
            event = "recovery_scheduled",
            slot = %self.slot,
            filename = %filename,
            retry = self.retry_count,
            delay_ms = delay.as_millis() as u64,
            forced = ?forced,
            "Resume request scheduled"
        );
        TriggerOutcome::Scheduled {
            delay,
            generation: self.generation,
        }
    }

    /// The backoff elapsed: re-validate and build the request.
    pub fn fire(&mut self, generation: u64, ctx: FireContext<'_>) -> FireOutcome {
        if self.state != RecoveryState::Pending || generation != self.generation {
            return FireOutcome::Stale;
        }
        let Some(filename) = self.pending_filename.clone() else {
            self.reset();
            return FireOutcome::Aborted;
        };
        let same_track = ctx.current_filename == Some(filename.as_str());
        let link_open = ctx.route.is_some_and(|l| l.is_open());
        if !same_track || !link_open {
            debug!(
                event = "recovery_aborted",
                slot = %self.slot,
                filename = %filename,
                same_track,
                link_open,
                "Resume no longer applies"
            );
            self.reset();
            return FireOutcome::Aborted;
        }

        let next_chunk = self.forced_index.unwrap_or(ctx.received_count);
        self.retry_count += 1;
        self.state = RecoveryState::Requested;
        info!(
            event = "recovery_request",
            slot = %self.slot,
            filename = %filename,
            next_chunk,
            attempt = self.retry_count,
            "Requesting resume"
        );
        FireOutcome::Send {
            message: ProtocolMessage::RecoveryRequest {
                filename: Some(filename),
                next_chunk,
                session_id: ctx.session_id,
                slot: self.slot,
            },
            attempt: self.retry_count,
        }
    }

    /// Transfer finished (or failed terminally) or the track changed.
    pub fn reset(&mut self) {
        self.state = RecoveryState::Idle;
        self.retry_count = 0;
        self.pending_filename = None;
        self.forced_index = None;
        self.generation += 1;
    }
}
