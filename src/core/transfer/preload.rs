//! Guest-side preload bookkeeping.
//!
//! The host pushes the next playlist entry into the `preload` slot while the
//! current one plays. When the host later announces a track change, the guest
//! asks [`PreloadScheduler::take_ready`] whether the buffered file matches the
//! announced index and playlist generation; a match skips the download.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::core::session_id::{SessionId, SessionIdGenerator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadState {
    Pending,
    Ready { path: PathBuf, size: u64 },
}

#[derive(Debug, Clone)]
pub struct PreloadEntry {
    pub track_index: u32,
    pub filename: String,
    pub session_id: SessionId,
    pub generation: u64,
    pub state: PreloadState,
}

/// A completed preload handed over for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyPreload {
    pub filename: String,
    pub path: PathBuf,
    /// Session id the playback of this file runs under.
    pub playback_session_id: SessionId,
}

#[derive(Debug, Default)]
pub struct PreloadScheduler {
    entry: Option<PreloadEntry>,
}

impl PreloadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self) -> Option<&PreloadEntry> {
        self.entry.as_ref()
    }

    /// A preload transfer started. Replaces whatever was buffered.
    pub fn on_start(&mut self, track_index: u32, filename: &str, session_id: SessionId, generation: u64) {
        if let Some(old) = &self.entry
            && old.session_id != session_id
        {
            debug!(
                event = "preload_replaced",
                old_track = old.track_index,
                new_track = track_index,
                "Dropping older preload"
            );
        }
        self.entry = Some(PreloadEntry {
            track_index,
            filename: filename.to_string(),
            session_id,
            generation,
            state: PreloadState::Pending,
        });
    }

    /// The storage worker verified the preload file. Returns `false` when the
    /// completion does not belong to the tracked entry.
    pub fn on_ready(&mut self, session_id: SessionId, path: PathBuf, size: u64) -> bool {
        match &mut self.entry {
            Some(e) if e.session_id == session_id => {
                info!(
                    event = "preload_ready",
                    track_index = e.track_index,
                    filename = %e.filename,
                    size,
                    "Next track buffered"
                );
                e.state = PreloadState::Ready { path, size };
                true
            }
            _ => false,
        }
    }

    /// The preload failed terminally; forget it.
    pub fn on_failed(&mut self, session_id: SessionId) {
        if self.entry.as_ref().is_some_and(|e| e.session_id == session_id) {
            self.entry = None;
        }
    }

    /// Hand over the buffered file when it is complete and matches both the
    /// announced track index and playlist generation. The generator observes
    /// the preload's session id so locally minted ids stay above it.
    pub fn take_ready(
        &mut self,
        track_index: u32,
        generation: u64,
        ids: &SessionIdGenerator,
    ) -> Option<ReadyPreload> {
        let entry = self.entry.as_ref()?;
        let PreloadState::Ready { path, .. } = &entry.state else {
            return None;
        };
        if entry.track_index != track_index || entry.generation != generation {
            debug!(
                event = "preload_mismatch",
                buffered_index = entry.track_index,
                buffered_generation = entry.generation,
                track_index,
                generation,
                "Buffered preload does not match track change"
            );
            return None;
        }
        ids.observe(entry.session_id);
        let ready = ReadyPreload {
            filename: entry.filename.clone(),
            path: path.clone(),
            playback_session_id: entry.session_id,
        };
        self.entry = None;
        Some(ready)
    }
}
