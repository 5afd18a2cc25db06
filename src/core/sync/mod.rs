//! Playback clock synchronization.
//!
//! The host samples its player every sync interval and broadcasts
//! `sync-broadcast{time, state, subIndex}`; guests run the samples through a
//! [`DriftCorrector`] and apply the resulting actions to their own player.

pub mod drift;
pub mod latency;
pub mod player;

pub use drift::{apply_actions, DriftCorrector, LocalView};
pub use latency::LatencyEstimator;
pub use player::{ClockPlayer, Player};

use crate::core::protocol::{ProtocolMessage, TransportState};

/// Host clock sample for broadcasting.
pub fn sync_broadcast(player: &dyn Player) -> ProtocolMessage {
    ProtocolMessage::SyncBroadcast {
        time: player.position(),
        state: if player.is_playing() {
            TransportState::Playing
        } else {
            TransportState::Paused
        },
        sub_index: player.sub_index(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reflects_player() {
        let mut p = ClockPlayer::new();
        p.seek(7.0);
        p.set_sub_index(Some(3));
        assert_eq!(
            sync_broadcast(&p),
            ProtocolMessage::SyncBroadcast {
                time: 7.0,
                state: TransportState::Paused,
                sub_index: Some(3),
            }
        );
    }
}
