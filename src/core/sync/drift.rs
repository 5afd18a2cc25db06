//! Guest-side drift correction.
//!
//! Each host `sync-broadcast` is turned into a short list of
//! [`PlayerAction`]s. The corrector never touches the player itself, so the
//! rules can be exercised against plain snapshots.

use tracing::{debug, info};

use super::player::Player;
use crate::core::config::{DRIFT_THRESHOLD_SECS, STALE_ADVANCE_SECS, STALE_COUNT_THRESHOLD};
use crate::core::protocol::TransportState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerAction {
    Play,
    Pause,
    Seek(f64),
    SetSubIndex(u32),
}

/// What the guest's player looks like right now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalView {
    pub position: f64,
    pub playing: bool,
    pub sub_index: Option<u32>,
}

impl LocalView {
    pub fn of(player: &dyn Player) -> Self {
        Self {
            position: player.position(),
            playing: player.is_playing(),
            sub_index: player.sub_index(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DriftCorrector {
    /// Manual user adjustment, seconds.
    local_offset: f64,
    /// Network compensation, seconds.
    auto_sync_offset: f64,
    stale_count: u32,
    ad_active: bool,
    last_time: Option<f64>,
}

impl DriftCorrector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host clock stopped advancing while claiming to play.
    pub fn ad_active(&self) -> bool {
        self.ad_active
    }

    pub fn local_offset(&self) -> f64 {
        self.local_offset
    }

    pub fn auto_sync_offset(&self) -> f64 {
        self.auto_sync_offset
    }

    pub fn set_auto_sync_offset(&mut self, secs: f64) {
        self.auto_sync_offset = secs;
    }

    /// Shift the local target by `delta` seconds.
    pub fn nudge(&mut self, delta: f64) {
        self.local_offset += delta;
        debug!(event = "sync_nudge", local_offset = self.local_offset, "Local offset adjusted");
    }

    /// Where the guest should be for a host position of `time`.
    pub fn compensated(&self, time: f64) -> f64 {
        time + self.auto_sync_offset + self.local_offset
    }

    pub fn on_broadcast(
        &mut self,
        time: f64,
        state: TransportState,
        sub_index: Option<u32>,
        local: LocalView,
    ) -> Vec<PlayerAction> {
        let mut actions = Vec::new();
        let mut view = local;

        if state == TransportState::Playing {
            let stalled = self
                .last_time
                .is_some_and(|last| (time - last).abs() < STALE_ADVANCE_SECS);
            if stalled {
                self.stale_count += 1;
                if self.stale_count >= STALE_COUNT_THRESHOLD && !self.ad_active {
                    info!(event = "host_clock_stalled", time, "Host clock stopped advancing; holding");
                    self.ad_active = true;
                    if view.playing {
                        actions.push(PlayerAction::Pause);
                        view.playing = false;
                    }
                }
            } else {
                if self.ad_active {
                    info!(event = "host_clock_resumed", time, "Host clock advancing again");
                    self.ad_active = false;
                    if !view.playing {
                        actions.push(PlayerAction::Play);
                        view.playing = true;
                    }
                }
                self.stale_count = 0;
            }
            self.last_time = Some(time);
        } else {
            self.stale_count = 0;
            self.last_time = None;
            self.ad_active = false;
        }

        if let Some(index) = sub_index
            && view.sub_index != Some(index)
        {
            actions.push(PlayerAction::SetSubIndex(index));
            view.sub_index = Some(index);
        }

        if self.ad_active {
            return actions;
        }

        let target = self.compensated(time);
        let drift = view.position - target;
        if drift.abs() > DRIFT_THRESHOLD_SECS {
            debug!(event = "drift_seek", drift, target, "Seeking to host position");
            actions.push(PlayerAction::Seek(target));
            view.position = target;
        }

        let want_playing = state == TransportState::Playing;
        if view.playing != want_playing {
            actions.push(if want_playing { PlayerAction::Play } else { PlayerAction::Pause });
        }
        actions
    }
}

/// Execute `actions` in order.
pub fn apply_actions(player: &mut dyn Player, actions: &[PlayerAction]) {
    for action in actions {
        match *action {
            PlayerAction::Play => player.play(),
            PlayerAction::Pause => player.pause(),
            PlayerAction::Seek(t) => player.seek(t),
            PlayerAction::SetSubIndex(i) => player.set_sub_index(Some(i)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransportState::{Paused, Playing};

    fn view(position: f64, playing: bool) -> LocalView {
        LocalView {
            position,
            playing,
            sub_index: None,
        }
    }

    #[test]
    fn seeks_only_beyond_threshold() {
        let mut dc = DriftCorrector::new();
        assert!(dc.on_broadcast(50.0, Playing, None, view(48.5, true)).is_empty());
        assert!(dc.on_broadcast(51.0, Playing, None, view(53.0, true)).is_empty());
        assert_eq!(
            dc.on_broadcast(52.0, Playing, None, view(49.9, true)),
            vec![PlayerAction::Seek(52.0)]
        );
    }

    #[test]
    fn offsets_shift_the_target() {
        let mut dc = DriftCorrector::new();
        dc.set_auto_sync_offset(0.25);
        dc.nudge(3.0);
        dc.nudge(-0.5);
        assert_eq!(dc.local_offset(), 2.5);
        assert_eq!(
            dc.on_broadcast(10.0, Playing, None, view(10.0, true)),
            vec![PlayerAction::Seek(12.75)]
        );
    }

    #[test]
    fn transport_follows_host() {
        let mut dc = DriftCorrector::new();
        assert_eq!(dc.on_broadcast(5.0, Paused, None, view(5.0, true)), vec![PlayerAction::Pause]);
        assert_eq!(dc.on_broadcast(5.0, Playing, None, view(5.0, false)), vec![PlayerAction::Play]);
    }

    #[test]
    fn sub_index_switches_when_different() {
        let mut dc = DriftCorrector::new();
        let local = LocalView {
            position: 1.0,
            playing: true,
            sub_index: Some(1),
        };
        assert_eq!(
            dc.on_broadcast(1.0, Playing, Some(2), local),
            vec![PlayerAction::SetSubIndex(2)]
        );
        assert!(dc.on_broadcast(2.0, Playing, Some(1), LocalView { position: 2.0, ..local }).is_empty());
    }

    #[test]
    fn frozen_host_clock_pauses_then_resumes() {
        let mut dc = DriftCorrector::new();
        assert!(dc.on_broadcast(10.0, Playing, None, view(10.0, true)).is_empty());
        assert!(dc.on_broadcast(10.0, Playing, None, view(11.0, true)).is_empty());
        assert!(!dc.ad_active());

        assert_eq!(dc.on_broadcast(10.0, Playing, None, view(12.0, true)), vec![PlayerAction::Pause]);
        assert!(dc.ad_active());
        assert!(dc.on_broadcast(10.0, Playing, None, view(12.0, false)).is_empty());
        assert!(dc.ad_active());

        assert_eq!(
            dc.on_broadcast(15.0, Playing, None, view(12.0, false)),
            vec![PlayerAction::Play, PlayerAction::Seek(15.0)]
        );
        assert!(!dc.ad_active());
    }

    #[test]
    fn paused_host_resets_stall_tracking() {
        let mut dc = DriftCorrector::new();
        dc.on_broadcast(10.0, Playing, None, view(10.0, true));
        dc.on_broadcast(10.0, Playing, None, view(10.0, true));
        dc.on_broadcast(10.0, Paused, None, view(10.0, true));
        assert!(dc.on_broadcast(10.0, Playing, None, view(10.0, true)).is_empty());
        assert!(!dc.ad_active());
    }
}
