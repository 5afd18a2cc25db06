//! Slot storage: exclusive write locks and the background I/O actor.
//!
//! Two named slots exist per process: `current` (the track being played) and
//! `preload` (the next track, fetched ahead of need). The [`worker`] actor is
//! the only code that touches slot files; everything else talks to it over
//! a channel.

pub mod lock;
pub mod slot_file;
pub mod worker;

use crate::core::config::{CURRENT_LOCK_TIMEOUT, PRELOAD_LOCK_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use worker::{StorageErrorKind, StorageEvent, StorageHandle};

/// One of the two storage destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    #[default]
    Current,
    Preload,
}

impl SlotKind {
    pub const ALL: [SlotKind; 2] = [SlotKind::Current, SlotKind::Preload];

    /// Prefix used in persisted resource names.
    pub fn prefix(self) -> &'static str {
        match self {
            SlotKind::Current => "current",
            SlotKind::Preload => "preload",
        }
    }

    /// Age after which a lock for another resource may be force-preempted.
    pub fn lock_timeout(self) -> Duration {
        match self {
            SlotKind::Current => CURRENT_LOCK_TIMEOUT,
            SlotKind::Preload => PRELOAD_LOCK_TIMEOUT,
        }
    }

    fn index(self) -> usize {
        match self {
            SlotKind::Current => 0,
            SlotKind::Preload => 1,
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Persisted resource name: `{slotPrefix}_{sanitizedFilename}_{instanceId}`.
///
/// The instance id keeps independently running processes that share one
/// storage directory from colliding.
pub fn resource_name(slot: SlotKind, filename: &str, instance_id: &str) -> String {
    format!(
        "{}_{}_{}",
        slot.prefix(),
        sanitize_filename(filename),
        instance_id
    )
}
