//! The playback collaborator the sync layer drives.
//!
//! Audio output is outside this crate; [`Player`] is the seam. The built-in
//! [`ClockPlayer`] advances a position with the monotonic clock, which is all
//! the synchronization logic needs to observe and correct.

use std::path::{Path, PathBuf};

use tokio::time::Instant;
use tracing::debug;

pub trait Player: Send {
    /// Playback position in seconds.
    fn position(&self) -> f64;
    fn is_playing(&self) -> bool;
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position: f64);
    /// Active sub-track (chapter, segment) when the media has several.
    fn sub_index(&self) -> Option<u32>;
    fn set_sub_index(&mut self, index: Option<u32>);
    /// Switch to a new media file, paused at 0.
    fn load(&mut self, path: PathBuf);
    fn loaded(&self) -> Option<&Path>;
}

/// Wall-clock player: position advances in real time while playing.
#[derive(Debug)]
pub struct ClockPlayer {
    base: f64,
    started: Option<Instant>,
    sub_index: Option<u32>,
    media: Option<PathBuf>,
}

impl ClockPlayer {
    pub fn new() -> Self {
        Self {
            base: 0.0,
            started: None,
            sub_index: None,
            media: None,
        }
    }
}

impl Default for ClockPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Player for ClockPlayer {
    fn position(&self) -> f64 {
        match self.started {
            Some(at) => self.base + at.elapsed().as_secs_f64(),
            None => self.base,
        }
    }

    fn is_playing(&self) -> bool {
        self.started.is_some()
    }

    fn play(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn pause(&mut self) {
        self.base = self.position();
        self.started = None;
    }

    fn seek(&mut self, position: f64) {
        self.base = position.max(0.0);
        if self.started.is_some() {
            self.started = Some(Instant::now());
        }
    }

    fn sub_index(&self) -> Option<u32> {
        self.sub_index
    }

    fn set_sub_index(&mut self, index: Option<u32>) {
        self.sub_index = index;
    }

    fn load(&mut self, path: PathBuf) {
        debug!(event = "media_loaded", path = %path.display(), "Player switched media");
        self.media = Some(path);
        self.base = 0.0;
        self.started = None;
        self.sub_index = None;
    }

    fn loaded(&self) -> Option<&Path> {
        self.media.as_deref()
    }
}
