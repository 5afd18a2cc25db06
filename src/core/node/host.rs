//! Host role: admits guests, owns the playlist and the authoritative clock.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{NodeCommand, NodeConfig, NodeCore, NodeEvent, NodeExit, NodeHandles, NodeMsg};
use crate::core::config::{LINK_CLASSIFY_DELAY, MAX_GUESTS, SYNC_INTERVAL};
use crate::core::connection::{classify_addr, LinkEvent, LinkId};
use crate::core::membership::{generate_session_code, AcceptOutcome, Membership};
use crate::core::peer_registry::PeerRegistry;
use crate::core::protocol::ProtocolMessage;
use crate::core::session_id::SessionId;
use crate::core::storage::SlotKind;
use crate::core::sync::{sync_broadcast, Player};
use crate::core::transfer::{spawn_push, Push, Source};
use crate::utils::sos::SignalOfStop;

/// Message kinds the host acts on.
const HOST_KINDS: &[&str] = &[
    "hello",
    "ping",
    "recovery-request",
    "request-play",
    "request-pause",
    "request-seek",
    "request-track",
    "request-join",
    "request-leave",
];

/// The track being played.
#[derive(Debug, Clone)]
struct NowPlaying {
    index: u32,
    filename: String,
    session_id: SessionId,
}

/// Next track pushed into guests' preload slots.
#[derive(Debug, Clone)]
struct PreloadPlan {
    index: u32,
    filename: String,
    session_id: SessionId,
    generation: u64,
}

pub struct Host {
    core: NodeCore,
    membership: Membership,
    tracks: Vec<PathBuf>,
    generation: u64,
    now_playing: Option<NowPlaying>,
    preload: Option<PreloadPlan>,
}

impl Host {
    pub fn new(mut config: NodeConfig, player: Box<dyn Player>, stop: SignalOfStop) -> Result<Self> {
        if config.tracks.is_empty() {
            bail!("the host needs at least one track");
        }
        if config.session_code.is_empty() {
            config.session_code = generate_session_code();
        }
        let registry = match &config.registry_path {
            Some(path) => PeerRegistry::load(path.clone()),
            None => PeerRegistry::in_memory(),
        };
        let membership = Membership::new(config.peer_id.clone(), registry);
        let tracks = config.tracks.clone();

        let mut core = NodeCore::new(config, player, stop);
        core.register_inbox(HOST_KINDS);
        Ok(Self {
            core,
            membership,
            tracks,
            generation: 0,
            now_playing: None,
            preload: None,
        })
    }

    pub fn handles(&self) -> NodeHandles {
        self.core.handles()
    }

    pub fn subscribe(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<NodeEvent> {
        self.core.subscribe()
    }

    pub fn session_code(&self) -> &str {
        &self.core.config.session_code
    }

    pub async fn run(&mut self) -> Result<NodeExit> {
        info!(
            event = "session_open",
            session_code = %self.core.config.session_code,
            tracks = self.tracks.len(),
            "Hosting session"
        );
        self.core.emit(NodeEvent::SessionReady {
            session_code: self.core.config.session_code.clone(),
        });
        if self.now_playing.is_none() {
            self.change_track(0);
        }

        let mut sync_tick = tokio::time::interval(SYNC_INTERVAL);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.core.stop.wait() => break,
                Some(event) = self.core.link_rx.recv() => self.on_link_event(event),
                Some(msg) = self.core.inbox_rx.recv() => self.on_node_msg(msg),
                Some(cmd) = self.core.command_rx.recv() => self.on_command(cmd),
                _ = sync_tick.tick() => self.broadcast_sync(),
            }
        }

        for link in self.core.router.downstream() {
            link.close();
        }
        info!(event = "session_closed", "Host stopped");
        Ok(NodeExit::Stopped)
    }

    // ── Links ────────────────────────────────────────────────────────────────

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened(link) => {
                debug!(event = "link_opened", link = %link.id(), remote = ?link.remote_addr(), "Guest link open");
                self.core.router.add_link(link);
            }
            LinkEvent::Message { link, text } => {
                if let Some(msg) = self.core.route_text(link, &text) {
                    debug!(event = "unexpected_transfer", link = %link, kind = msg.kind(), "Host ignores inbound transfers");
                }
            }
            LinkEvent::Closed { link } => {
                self.core.router.remove_link(link);
                let gone = self.membership.remove_link(link);
                if !gone.is_empty() {
                    self.broadcast_roster();
                }
            }
        }
    }

    fn on_node_msg(&mut self, msg: NodeMsg) {
        match msg {
            NodeMsg::Inbound { link, msg } => self.on_message(link, msg),
            NodeMsg::Classify { link } => self.classify(link),
            NodeMsg::RecoveryFire { .. } => {}
        }
    }

    fn on_message(&mut self, link: LinkId, msg: ProtocolMessage) {
        let admitted = self.membership.peer_by_link(link).is_some();
        match msg {
            ProtocolMessage::Hello {
                peer_id,
                session_code,
                display_name,
            } => self.on_hello(link, &peer_id, &session_code, display_name.as_deref()),
            ProtocolMessage::Ping { sent_at } => {
                self.membership.heartbeat(link, Instant::now());
                self.core.router.send_to(link, &ProtocolMessage::Pong { sent_at });
            }
            // Everything else needs a guest admitted with the session code on this link.
            other if !admitted => {
                warn!(event = "unadmitted_message", link = %link, kind = other.kind(), "Dropping message before hello");
            }
            ProtocolMessage::RequestJoin { peer_id, display_name } => {
                self.admit(link, &peer_id, display_name.as_deref(), true)
            }
            ProtocolMessage::RequestLeave { peer_id } => {
                if self.membership.get(&peer_id).is_some_and(|p| p.link == link && p.via_relay) {
                    self.membership.remove_peer(&peer_id);
                    self.broadcast_roster();
                }
            }
            ProtocolMessage::RecoveryRequest {
                filename,
                next_chunk,
                session_id,
                slot,
            } => self.serve_recovery(link, filename, next_chunk, session_id, slot),
            ProtocolMessage::RequestPlay { from } => self.operator_request(link, &from, NodeCommand::Play),
            ProtocolMessage::RequestPause { from } => self.operator_request(link, &from, NodeCommand::Pause),
            ProtocolMessage::RequestSeek { from, time } => {
                self.operator_request(link, &from, NodeCommand::Seek(time))
            }
            ProtocolMessage::RequestTrack { from, index } => {
                self.operator_request(link, &from, NodeCommand::Track(index))
            }
            other => debug!(event = "message_ignored", link = %link, kind = other.kind(), "Not for the host"),
        }
    }

    // ── Membership ───────────────────────────────────────────────────────────

    fn on_hello(&mut self, link: LinkId, peer_id: &str, code: &str, display_name: Option<&str>) {
        if code != self.core.config.session_code || peer_id.is_empty() {
            warn!(event = "hello_rejected", link = %link, peer_id = %peer_id, "Wrong session code");
            self.core.router.send_to(
                link,
                &ProtocolMessage::SessionRejected {
                    reason: "invalid session code".to_string(),
                },
            );
            if let Some(l) = self.core.link(link) {
                l.close();
            }
            return;
        }
        self.admit(link, peer_id, display_name, false);
    }

    fn admit(&mut self, link: LinkId, peer_id: &str, display_name: Option<&str>, via_relay: bool) {
        let outcome = self
            .membership
            .accept(peer_id, display_name, link, via_relay, Instant::now());
        let (slot, label, replaced) = match outcome {
            AcceptOutcome::Accepted { slot, label, replaced } => (slot, label, replaced),
            AcceptOutcome::Full if via_relay => {
                // The relay link also carries peers already admitted.
                warn!(event = "relayed_join_refused", peer_id = %peer_id, "Session full");
                return;
            }
            AcceptOutcome::Full => {
                self.core.router.send_to(
                    link,
                    &ProtocolMessage::SessionFull {
                        message: format!("Session is full ({MAX_GUESTS} guests)"),
                        max_peers: MAX_GUESTS,
                    },
                );
                if let Some(l) = self.core.link(link) {
                    l.close();
                }
                return;
            }
        };

        if !via_relay {
            self.core.router.mark_joined(link);
        }
        if let Some(old) = replaced
            && let Some(old_link) = self.core.link(old)
        {
            let _ = old_link.send(&ProtocolMessage::ForcedClose {
                reason: "replaced by a newer connection".to_string(),
            });
            old_link.close();
        }

        self.core.router.send_to(
            link,
            &ProtocolMessage::Welcome {
                peer_id: peer_id.to_string(),
                slot,
                label,
            },
        );
        if self.core.config.operators.iter().any(|op| op == peer_id) {
            self.set_operator(peer_id, true);
        }
        self.broadcast_roster();
        self.core.schedule(LINK_CLASSIFY_DELAY, NodeMsg::Classify { link });

        if let Some(now) = &self.now_playing {
            self.core.router.send_to(
                link,
                &ProtocolMessage::TrackChange {
                    track_index: now.index,
                    filename: now.filename.clone(),
                    session_id: now.session_id,
                    generation: self.generation,
                },
            );
        }
        if !via_relay && let Some(plan) = self.preload.clone() {
            self.push_preload(link, &plan);
        }
    }

    fn classify(&mut self, link: LinkId) {
        let Some(l) = self.core.link(link) else {
            return;
        };
        let kind = classify_addr(l.remote_addr());
        if self.membership.set_connection_type(link, kind) {
            debug!(event = "link_classified", link = %link, kind = ?kind, "Link classified");
            self.broadcast_roster();
        }
    }

    fn set_operator(&mut self, peer_id: &str, is_op: bool) {
        let Some(link) = self.membership.set_operator(peer_id, is_op) else {
            return;
        };
        let target = Some(peer_id.to_string());
        let msg = if is_op {
            ProtocolMessage::OperatorGrant { peer_id: target }
        } else {
            ProtocolMessage::OperatorRevoke { peer_id: target }
        };
        self.core.router.send_to(link, &msg);
        self.broadcast_roster();
    }

    fn broadcast_roster(&mut self) {
        let peers = self.membership.roster();
        self.core.router.broadcast(&ProtocolMessage::RosterUpdate { peers: peers.clone() });
        self.core.emit(NodeEvent::RosterChanged(peers));
    }

    // ── Playback ─────────────────────────────────────────────────────────────

    /// Execute a guest's request when the requester holds operator rights and
    /// is reached over the link the request came from.
    fn operator_request(&mut self, link: LinkId, from: &str, cmd: NodeCommand) {
        let allowed = self
            .membership
            .get(from)
            .is_some_and(|p| p.is_op && p.link == link);
        if !allowed {
            debug!(event = "request_ignored", from = %from, link = %link, "Requester is not an operator");
            return;
        }
        info!(event = "operator_request", from = %from, command = ?cmd, "Executing request");
        self.on_command(cmd);
    }

    fn on_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Play => self.core.player.play(),
            NodeCommand::Pause => self.core.player.pause(),
            NodeCommand::Seek(t) => self.core.player.seek(t),
            NodeCommand::Track(index) => self.change_track(index),
            NodeCommand::Grant(peer) => self.set_operator(&peer, true),
            NodeCommand::Revoke(peer) => self.set_operator(&peer, false),
            NodeCommand::Roster => {
                for p in self.membership.roster() {
                    info!(event = "roster_entry", id = %p.id, label = %p.label, is_op = p.is_op, status = ?p.status, "Roster");
                }
                return;
            }
            NodeCommand::Nudge(_) => {
                debug!(event = "command_ignored", "Nudge applies to guests");
                return;
            }
        }
        self.broadcast_sync();
    }

    fn broadcast_sync(&self) {
        self.core.router.broadcast(&sync_broadcast(self.core.player.as_ref()));
    }

    /// Switch to playlist entry `index`, announce it, and start preloading
    /// the one after.
    fn change_track(&mut self, index: u32) {
        let Some(path) = self.tracks.get(index as usize).cloned() else {
            warn!(event = "track_out_of_range", index, tracks = self.tracks.len(), "No such track");
            return;
        };
        let Some(filename) = file_name(&path) else {
            warn!(event = "track_unnamed", path = %path.display(), "Track has no file name");
            return;
        };

        self.generation += 1;
        let session_id = match self.preload.take() {
            Some(plan) if plan.index == index && plan.generation == self.generation => plan.session_id,
            _ => self.core.ids.next_id(),
        };
        info!(
            event = "track_change",
            index,
            filename = %filename,
            session_id,
            generation = self.generation,
            "Now playing"
        );
        self.core.player.load(path);
        self.core.player.play();
        self.now_playing = Some(NowPlaying {
            index,
            filename: filename.clone(),
            session_id,
        });
        self.core.router.broadcast(&ProtocolMessage::TrackChange {
            track_index: index,
            filename: filename.clone(),
            session_id,
            generation: self.generation,
        });
        self.core.emit(NodeEvent::TrackLoaded {
            track_index: index,
            filename,
            session_id,
            from_preload: false,
        });

        self.plan_preload(index + 1);
    }

    fn plan_preload(&mut self, index: u32) {
        let Some(filename) = self.tracks.get(index as usize).and_then(|p| file_name(p)) else {
            return;
        };
        let plan = PreloadPlan {
            index,
            filename,
            session_id: self.core.ids.next_id(),
            generation: self.generation + 1,
        };
        let links: Vec<LinkId> = self
            .membership
            .peers()
            .filter(|p| !p.via_relay)
            .map(|p| p.link)
            .collect();
        for link in links {
            self.push_preload(link, &plan);
        }
        self.preload = Some(plan);
    }

    fn push_preload(&self, link: LinkId, plan: &PreloadPlan) {
        let (Some(l), Some(path)) = (self.core.link(link), self.tracks.get(plan.index as usize)) else {
            return;
        };
        debug!(event = "preload_push", link = %link, index = plan.index, session_id = plan.session_id, "Preloading next track");
        spawn_push(
            l,
            Push {
                source: Source::File(path.clone()),
                filename: Some(plan.filename.clone()),
                slot: SlotKind::Preload,
                session_id: plan.session_id,
                track: Some((plan.index, plan.generation)),
                start_chunk: 0,
            },
        );
    }

    /// Resend a playlist file from `next_chunk`.
    fn serve_recovery(
        &self,
        link: LinkId,
        filename: Option<String>,
        next_chunk: u32,
        session_id: Option<SessionId>,
        slot: SlotKind,
    ) {
        let Some(l) = self.core.link(link) else {
            return;
        };
        let (filename, default_sid, track) = match (slot, filename) {
            (SlotKind::Preload, name) => match &self.preload {
                Some(plan) if name.as_deref().is_none_or(|n| n == plan.filename) => (
                    plan.filename.clone(),
                    plan.session_id,
                    Some((plan.index, plan.generation)),
                ),
                _ => {
                    debug!(event = "recovery_unknown_preload", link = %link, "No matching preload");
                    return;
                }
            },
            (SlotKind::Current, name) => match (&self.now_playing, name) {
                (Some(now), None) => (now.filename.clone(), now.session_id, None),
                (Some(now), Some(n)) if n == now.filename => (n, now.session_id, None),
                (_, Some(n)) => (n, self.core.ids.next_id(), None),
                (None, None) => return,
            },
        };
        let Some(path) = self.tracks.iter().find(|p| file_name(p).as_deref() == Some(filename.as_str())) else {
            warn!(event = "recovery_unknown_file", link = %link, filename = %filename, "Requested file is not in the playlist");
            return;
        };
        info!(
            event = "recovery_serve",
            link = %link,
            filename = %filename,
            slot = %slot,
            next_chunk,
            "Resending file"
        );
        spawn_push(
            l,
            Push {
                source: Source::File(path.clone()),
                filename: Some(filename),
                slot,
                session_id: session_id.unwrap_or(default_sid),
                track,
                start_chunk: next_chunk,
            },
        );
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}
