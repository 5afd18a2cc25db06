//! Guest role: receives tracks, follows the host clock, and optionally
//! relays for peers attached below it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{NodeCommand, NodeConfig, NodeCore, NodeEvent, NodeExit, NodeHandles, NodeMsg};
use crate::core::config::{MAX_CHUNK_SIZE, PING_INTERVAL, TRANSFER_WATCHDOG_TIMEOUT, WATCHDOG_TICK};
use crate::core::connection::{LinkEvent, LinkId, PeerLink};
use crate::core::protocol::{ProtocolMessage, RosterEntry, TransportState};
use crate::core::session_id::SessionId;
use crate::core::storage::worker::StorageWorker;
use crate::core::storage::{SlotKind, StorageErrorKind, StorageEvent, StorageHandle};
use crate::core::sync::{apply_actions, DriftCorrector, LatencyEstimator, LocalView, Player};
use crate::core::transfer::{
    spawn_push, FireContext, FireOutcome, PreloadScheduler, Push, ReceiveAction, RecoveryCoordinator, Source,
    StartInfo, TransferReceiver, TriggerOutcome,
};
use crate::utils::sos::SignalOfStop;

/// Message kinds the guest acts on. `hello`, `ping` and `recovery-request`
/// only arrive from peers attached below this one.
const GUEST_KINDS: &[&str] = &[
    "welcome",
    "session-full",
    "session-rejected",
    "forced-close",
    "roster-update",
    "operator-grant",
    "operator-revoke",
    "sync-broadcast",
    "track-change",
    "pong",
    "hello",
    "ping",
    "recovery-request",
];

#[derive(Debug, Clone)]
struct TrackState {
    index: u32,
    filename: String,
    session_id: SessionId,
    generation: u64,
    ready: bool,
    /// When the whole file was last asked for, while not ready.
    requested_at: Option<Instant>,
}

/// A verified file playable for a slot. `stored_in` is the storage slot
/// holding the bytes, which differs after a preload takeover.
#[derive(Debug, Clone)]
struct CompletedFile {
    filename: String,
    session_id: SessionId,
    stored_in: SlotKind,
}

/// A downstream request waiting for this relay to finish a file.
#[derive(Debug, Clone)]
struct Waiting {
    link: LinkId,
    slot: SlotKind,
    filename: String,
    session_id: Option<SessionId>,
    next_chunk: u32,
}

pub struct Guest {
    core: NodeCore,
    storage: StorageHandle,
    storage_events: mpsc::UnboundedReceiver<StorageEvent>,
    storage_task: JoinHandle<()>,
    receiver: TransferReceiver,
    recovery: HashMap<SlotKind, RecoveryCoordinator>,
    preload: PreloadScheduler,
    drift: DriftCorrector,
    latency: LatencyEstimator,
    clock: Instant,
    track: Option<TrackState>,
    completed: HashMap<SlotKind, CompletedFile>,
    downstream_peers: HashMap<LinkId, String>,
    waiting: Vec<Waiting>,
    welcome: Option<(u8, String)>,
    is_op: bool,
    roster: Vec<RosterEntry>,
    exit: Option<NodeExit>,
}

impl Guest {
    pub fn new(config: NodeConfig, player: Box<dyn Player>, stop: SignalOfStop) -> Result<Self> {
        std::fs::create_dir_all(&config.storage_dir)?;
        let (storage, storage_events, storage_task) =
            StorageWorker::spawn(config.storage_dir.clone(), config.instance_id.clone());
        for slot in SlotKind::ALL {
            storage.cleanup(slot);
        }

        let mut core = NodeCore::new(config, player, stop);
        core.register_inbox(GUEST_KINDS);
        Ok(Self {
            core,
            receiver: TransferReceiver::new(storage.clone()),
            storage,
            storage_events,
            storage_task,
            recovery: SlotKind::ALL
                .into_iter()
                .map(|slot| (slot, RecoveryCoordinator::new(slot)))
                .collect(),
            preload: PreloadScheduler::new(),
            drift: DriftCorrector::new(),
            latency: LatencyEstimator::new(),
            clock: Instant::now(),
            track: None,
            completed: HashMap::new(),
            downstream_peers: HashMap::new(),
            waiting: Vec::new(),
            welcome: None,
            is_op: false,
            roster: Vec::new(),
            exit: None,
        })
    }

    pub fn handles(&self) -> NodeHandles {
        self.core.handles()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<NodeEvent> {
        self.core.subscribe()
    }

    /// Use `link` as the way towards the host and introduce ourselves on it.
    pub fn attach_upstream(&mut self, link: PeerLink) -> Result<()> {
        self.welcome = None;
        self.core.router.set_upstream(link.clone());
        link.send(&ProtocolMessage::Hello {
            peer_id: self.core.config.peer_id.clone(),
            session_code: self.core.config.session_code.clone(),
            display_name: self.core.config.display_name.clone(),
        })?;
        info!(event = "hello_sent", link = %link.id(), "Joining session");
        Ok(())
    }

    pub async fn run(&mut self) -> Result<NodeExit> {
        let mut ping_tick = tokio::time::interval(PING_INTERVAL);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watchdog = tokio::time::interval(WATCHDOG_TICK);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let exit = loop {
            if let Some(exit) = self.exit.take() {
                break exit;
            }
            tokio::select! {
                _ = self.core.stop.wait() => break NodeExit::Stopped,
                Some(event) = self.core.link_rx.recv() => self.on_link_event(event),
                Some(event) = self.storage_events.recv() => self.on_storage_event(event),
                Some(msg) = self.core.inbox_rx.recv() => self.on_node_msg(msg),
                Some(cmd) = self.core.command_rx.recv() => self.on_command(cmd),
                _ = ping_tick.tick() => self.ping(),
                _ = watchdog.tick() => self.watchdog(),
            }
        };

        self.teardown(&exit);
        Ok(exit)
    }

    fn teardown(&mut self, exit: &NodeExit) {
        for slot in SlotKind::ALL {
            if self.receiver.get(slot).is_some() {
                self.receiver.abandon(slot);
            }
            self.recovery_mut(slot).reset();
        }
        let links: Vec<PeerLink> = self.core.router.downstream().cloned().collect();
        for link in links {
            link.close();
            self.core.router.remove_link(link.id());
        }
        self.downstream_peers.clear();
        self.waiting.clear();
        if let Some(up) = self.core.router.upstream().cloned() {
            up.close();
            self.core.router.remove_link(up.id());
        }

        if *exit == NodeExit::Stopped {
            for slot in SlotKind::ALL {
                self.storage.cleanup(slot);
            }
        }
        info!(event = "guest_stopped", exit = ?exit, "Left session");
    }

    fn recovery_mut(&mut self, slot: SlotKind) -> &mut RecoveryCoordinator {
        self.recovery
            .entry(slot)
            .or_insert_with(|| RecoveryCoordinator::new(slot))
    }

    fn upstream_id(&self) -> Option<LinkId> {
        self.core.router.upstream().map(|l| l.id())
    }

    fn clock_secs(&self) -> f64 {
        self.clock.elapsed().as_secs_f64()
    }

    // ── Links ────────────────────────────────────────────────────────────────

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened(link) => {
                if Some(link.id()) != self.upstream_id() {
                    debug!(event = "downstream_opened", link = %link.id(), "Peer attached below");
                    self.core.router.add_link(link);
                }
            }
            LinkEvent::Message { link, text } => {
                let Some(msg) = self.core.route_text(link, &text) else {
                    return;
                };
                if Some(link) == self.upstream_id() {
                    self.on_transfer(msg);
                } else {
                    debug!(event = "unexpected_transfer", link = %link, kind = msg.kind(), "Transfer from downstream ignored");
                }
            }
            LinkEvent::Closed { link } => {
                if Some(link) == self.upstream_id() {
                    // A refusal is usually the last thing the host says.
                    while let Ok(msg) = self.core.inbox_rx.try_recv() {
                        self.on_node_msg(msg);
                    }
                    warn!(event = "upstream_lost", link = %link, "Lost connection towards the host");
                    self.core.router.remove_link(link);
                    if self.exit.is_none() {
                        self.exit = Some(NodeExit::UpstreamLost);
                    }
                    return;
                }
                self.core.router.remove_link(link);
                self.waiting.retain(|w| w.link != link);
                if let Some(peer_id) = self.downstream_peers.remove(&link) {
                    info!(event = "downstream_left", peer_id = %peer_id, "Relayed peer left");
                    self.core.router.send_upstream(&ProtocolMessage::RequestLeave { peer_id });
                }
            }
        }
    }

    fn on_node_msg(&mut self, msg: NodeMsg) {
        match msg {
            NodeMsg::Inbound { link, msg } => self.on_message(link, msg),
            NodeMsg::RecoveryFire { slot, generation } => self.fire_recovery(slot, generation),
            NodeMsg::Classify { .. } => {}
        }
    }

    fn on_message(&mut self, link: LinkId, msg: ProtocolMessage) {
        let from_upstream = Some(link) == self.upstream_id();
        if !from_upstream {
            self.on_downstream_message(link, msg);
            return;
        }
        match msg {
            ProtocolMessage::Welcome { peer_id, slot, label } => {
                if peer_id == self.core.config.peer_id {
                    info!(event = "welcomed", slot, label = %label, "Joined session");
                    self.welcome = Some((slot, label.clone()));
                    self.core.emit(NodeEvent::Welcomed { slot, label });
                }
            }
            ProtocolMessage::SessionFull { message, .. } => self.rejected(message),
            ProtocolMessage::SessionRejected { reason } => self.rejected(reason),
            ProtocolMessage::ForcedClose { reason } => self.rejected(reason),
            ProtocolMessage::RosterUpdate { peers } => {
                let me = peers.iter().find(|p| p.id == self.core.config.peer_id).map(|p| p.is_op);
                self.roster = peers.clone();
                self.core.emit(NodeEvent::RosterChanged(peers));
                if let Some(is_op) = me {
                    self.set_operator(is_op);
                }
            }
            ProtocolMessage::OperatorGrant { peer_id } => self.on_operator_message(peer_id, true),
            ProtocolMessage::OperatorRevoke { peer_id } => self.on_operator_message(peer_id, false),
            ProtocolMessage::SyncBroadcast { time, state, sub_index } => self.on_sync(time, state, sub_index),
            ProtocolMessage::TrackChange {
                track_index,
                filename,
                session_id,
                generation,
            } => self.on_track_change(track_index, filename, session_id, generation),
            ProtocolMessage::Pong { sent_at } => {
                if let Some(rtt) = self.latency.on_pong(sent_at, self.clock_secs()) {
                    self.drift.set_auto_sync_offset(self.latency.one_way());
                    debug!(event = "rtt_sample", rtt_ms = rtt * 1000.0, "Latency updated");
                }
            }
            other => debug!(event = "message_ignored", kind = other.kind(), "Not for guests"),
        }
    }

    fn rejected(&mut self, reason: String) {
        warn!(event = "session_refused", reason = %reason, "Host refused this guest");
        self.exit = Some(NodeExit::Rejected(reason));
    }

    /// Grants are relayed to every peer below a relay, so only one naming
    /// this peer applies.
    fn on_operator_message(&mut self, peer_id: Option<String>, is_op: bool) {
        if peer_id.as_deref() == Some(self.core.config.peer_id.as_str()) {
            self.set_operator(is_op);
        } else {
            debug!(event = "operator_message_skipped", target = ?peer_id, is_op, "Addressed to another peer");
        }
    }

    fn set_operator(&mut self, is_op: bool) {
        if self.is_op != is_op {
            info!(event = "operator_changed", is_op, "Operator rights updated");
            self.is_op = is_op;
            self.core.emit(NodeEvent::OperatorChanged(is_op));
        }
    }

    // ── Playback ─────────────────────────────────────────────────────────────

    fn on_sync(&mut self, time: f64, state: TransportState, sub_index: Option<u32>) {
        if !self.track.as_ref().is_some_and(|t| t.ready) {
            return;
        }
        let local = LocalView::of(self.core.player.as_ref());
        let actions = self.drift.on_broadcast(time, state, sub_index, local);
        if !actions.is_empty() {
            debug!(event = "sync_actions", actions = ?actions, "Correcting playback");
            apply_actions(self.core.player.as_mut(), &actions);
        }
    }

    fn on_track_change(&mut self, index: u32, filename: String, session_id: SessionId, generation: u64) {
        if self
            .track
            .as_ref()
            .is_some_and(|t| t.index == index && t.generation == generation)
        {
            return;
        }
        info!(event = "track_change", index, filename = %filename, session_id, generation, "Host changed track");

        self.recovery_mut(SlotKind::Current).reset();
        if self.receiver.get(SlotKind::Current).is_some() {
            self.receiver.abandon(SlotKind::Current);
        }
        self.waiting.retain(|w| w.slot != SlotKind::Current);
        self.core.player.pause();

        if let Some(ready) = self.preload.take_ready(index, generation, &self.core.ids) {
            self.core.player.load(ready.path.clone());
            self.completed.insert(
                SlotKind::Current,
                CompletedFile {
                    filename: ready.filename.clone(),
                    session_id: ready.playback_session_id,
                    stored_in: SlotKind::Preload,
                },
            );
            self.track = Some(TrackState {
                index,
                filename: ready.filename.clone(),
                session_id: ready.playback_session_id,
                generation,
                ready: true,
                requested_at: None,
            });
            self.core.emit(NodeEvent::TrackLoaded {
                track_index: index,
                filename: ready.filename,
                session_id: ready.playback_session_id,
                from_preload: true,
            });
            return;
        }

        self.completed.remove(&SlotKind::Current);
        self.track = Some(TrackState {
            index,
            filename: filename.clone(),
            session_id,
            generation,
            ready: false,
            requested_at: Some(Instant::now()),
        });
        self.request_whole(SlotKind::Current, filename, Some(session_id));
    }

    fn request_whole(&self, slot: SlotKind, filename: String, session_id: Option<SessionId>) {
        let sent = self.core.router.send_upstream(&ProtocolMessage::RecoveryRequest {
            filename: Some(filename),
            next_chunk: 0,
            session_id,
            slot,
        });
        if !sent {
            debug!(event = "request_not_sent", slot = %slot, "No upstream");
        }
    }

    fn ping(&self) {
        self.core.router.send_upstream(&ProtocolMessage::Ping {
            sent_at: self.clock_secs(),
        });
    }

    fn on_command(&mut self, cmd: NodeCommand) {
        let from = self.core.config.peer_id.clone();
        let request = match cmd {
            NodeCommand::Play => ProtocolMessage::RequestPlay { from },
            NodeCommand::Pause => ProtocolMessage::RequestPause { from },
            NodeCommand::Seek(time) => ProtocolMessage::RequestSeek { from, time },
            NodeCommand::Track(index) => ProtocolMessage::RequestTrack { from, index },
            NodeCommand::Nudge(delta) => {
                self.drift.nudge(delta);
                return;
            }
            NodeCommand::Grant(_) | NodeCommand::Revoke(_) => {
                warn!(event = "command_refused", "Only the host manages operators");
                return;
            }
            NodeCommand::Roster => {
                for p in &self.roster {
                    info!(event = "roster_entry", id = %p.id, label = %p.label, is_op = p.is_op, status = ?p.status, "Roster");
                }
                return;
            }
        };
        if !self.is_op {
            warn!(event = "command_refused", kind = request.kind(), "Not an operator");
            return;
        }
        self.core.router.send_upstream(&request);
    }

    // ── Transfers ────────────────────────────────────────────────────────────

    fn on_transfer(&mut self, msg: ProtocolMessage) {
        let now = Instant::now();
        match msg {
            ProtocolMessage::TransferStart {
                filename,
                session_id,
                chunk_size,
                total_size,
                slot,
                track_index,
                generation,
            } => {
                if chunk_size == 0 || chunk_size as usize > MAX_CHUNK_SIZE {
                    debug!(event = "transfer_start_dropped", chunk_size, "Unusable chunk size");
                    return;
                }
                let reentry = self
                    .receiver
                    .get(slot)
                    .is_some_and(|t| t.session_id == session_id && t.filename == filename);
                if !reentry {
                    self.recovery_mut(slot).reset();
                    if slot == SlotKind::Preload
                        && let (Some(index), Some(generation)) = (track_index, generation)
                    {
                        self.preload.on_start(index, &filename, session_id, generation);
                    }
                }
                self.receiver.on_start(
                    StartInfo {
                        slot,
                        filename,
                        session_id,
                        chunk_size: chunk_size as usize,
                        total_size,
                        track_index,
                        generation,
                    },
                    now,
                );
            }
            ProtocolMessage::TransferWrite {
                filename,
                session_id,
                index,
                bytes,
                slot,
            } => self.receiver.on_write(slot, &filename, session_id, index, bytes, now),
            ProtocolMessage::TransferEnd {
                filename,
                session_id,
                total_size,
                sha3,
                slot,
            } => {
                if let ReceiveAction::Recover {
                    slot,
                    filename,
                    next_chunk,
                } = self.receiver.on_end(slot, &filename, session_id, total_size, sha3)
                {
                    self.schedule_recovery(slot, &filename, Some(next_chunk));
                }
            }
            other => debug!(event = "message_ignored", kind = other.kind(), "Not a transfer message"),
        }
    }

    fn on_storage_event(&mut self, event: StorageEvent) {
        self.receiver.on_storage_event(&event);
        match event {
            StorageEvent::Started {
                slot,
                filename,
                session_id,
                reentered,
            } => debug!(event = "slot_started", slot = %slot, filename = %filename, session_id, reentered, "Slot open"),
            StorageEvent::FileReady {
                slot,
                filename,
                session_id,
                size,
                path,
                ..
            } => self.on_file_ready(slot, filename, session_id, size, path),
            StorageEvent::Error {
                slot,
                filename,
                session_id,
                kind,
                message,
            } => self.on_storage_error(slot, filename, session_id, kind, message),
            StorageEvent::WriteError {
                slot,
                filename,
                index,
                message,
                ..
            } => warn!(event = "chunk_write_failed", slot = %slot, filename = %filename, index, error = %message, "Chunk not persisted"),
            StorageEvent::SessionMismatch {
                slot,
                command,
                expected,
                received,
                ..
            } => debug!(event = "session_mismatch", slot = %slot, command, expected = ?expected, received, "Stale transfer message"),
            StorageEvent::ReadComplete {
                slot, filename, bytes, ..
            } => self.on_read_complete(slot, filename, bytes),
        }
    }

    fn on_file_ready(&mut self, slot: SlotKind, filename: String, session_id: SessionId, size: u64, path: PathBuf) {
        self.recovery_mut(slot).reset();
        self.completed.insert(
            slot,
            CompletedFile {
                filename: filename.clone(),
                session_id,
                stored_in: slot,
            },
        );

        match slot {
            SlotKind::Current => {
                let loaded = match &mut self.track {
                    Some(t) if t.filename == filename && !t.ready => {
                        t.ready = true;
                        t.requested_at = None;
                        Some(t.index)
                    }
                    _ => None,
                };
                if let Some(track_index) = loaded {
                    info!(event = "track_ready", filename = %filename, size, "Track downloaded");
                    self.core.player.load(path.clone());
                    self.core.emit(NodeEvent::TrackLoaded {
                        track_index,
                        filename: filename.clone(),
                        session_id,
                        from_preload: false,
                    });
                }
            }
            SlotKind::Preload => {
                if self.preload.on_ready(session_id, path.clone(), size)
                    && let Some(entry) = self.preload.entry()
                {
                    let event = NodeEvent::PreloadReady {
                        track_index: entry.track_index,
                        filename: entry.filename.clone(),
                    };
                    self.core.emit(event);
                }
            }
        }

        if self.waiting.iter().any(|w| w.slot == slot && w.filename == filename) {
            self.storage.read(slot, &filename, Some(session_id));
        }
    }

    /// Serve every downstream request waiting on a file the storage worker
    /// just read back.
    fn on_read_complete(&mut self, stored_in: SlotKind, filename: String, bytes: Vec<u8>) {
        debug!(event = "slot_read", slot = %stored_in, filename = %filename, bytes = bytes.len(), "Slot read");
        let bytes: Arc<[u8]> = Arc::from(bytes);
        let sources: Vec<(SlotKind, SessionId)> = self
            .completed
            .iter()
            .filter(|(_, c)| c.stored_in == stored_in && c.filename == filename)
            .map(|(slot, c)| (*slot, c.session_id))
            .collect();
        for (slot, session_id) in sources {
            let (serve, keep): (Vec<Waiting>, Vec<Waiting>) = std::mem::take(&mut self.waiting)
                .into_iter()
                .partition(|w| w.slot == slot && w.filename == filename);
            self.waiting = keep;
            for w in serve {
                self.push_downstream(&w, bytes.clone(), session_id);
            }
        }
    }

    /// The bytes behind a completed entry are gone. Waiting peers retry
    /// through their own recovery and then trigger a fresh fetch.
    fn forget_unreadable(&mut self, stored_in: SlotKind, filename: &str) {
        let slots: Vec<SlotKind> = self
            .completed
            .iter()
            .filter(|(_, c)| c.stored_in == stored_in && c.filename == filename)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in slots {
            self.completed.remove(&slot);
            self.waiting.retain(|w| !(w.slot == slot && w.filename == filename));
        }
    }

    fn on_storage_error(
        &mut self,
        slot: SlotKind,
        filename: Option<String>,
        session_id: Option<SessionId>,
        kind: StorageErrorKind,
        message: String,
    ) {
        warn!(
            event = "storage_error",
            slot = %slot,
            filename = ?filename,
            session_id = ?session_id,
            kind = ?kind,
            error = %message,
            "Storage failure"
        );
        let Some(filename) = filename else {
            return;
        };
        if kind == StorageErrorKind::Io {
            self.forget_unreadable(slot, &filename);
        }
        if kind != StorageErrorKind::Integrity {
            return;
        }
        self.core.emit(NodeEvent::TransferFailed {
            slot,
            filename: filename.clone(),
            reason: message,
        });
        match slot {
            SlotKind::Current => {
                if self.track.as_ref().is_some_and(|t| t.filename == filename && !t.ready) {
                    self.schedule_recovery(slot, &filename, Some(0));
                }
            }
            SlotKind::Preload => {
                if let Some(sid) = session_id {
                    self.preload.on_failed(sid);
                }
            }
        }
    }

    fn watchdog(&mut self) {
        let now = Instant::now();
        for (slot, filename) in self.receiver.stalled(now, TRANSFER_WATCHDOG_TIMEOUT) {
            self.schedule_recovery(slot, &filename, None);
        }

        // A whole-file request that never produced a transfer.
        let unanswered = match &self.track {
            Some(t) if !t.ready && self.receiver.get(SlotKind::Current).is_none() => t
                .requested_at
                .filter(|at| now.saturating_duration_since(*at) >= TRANSFER_WATCHDOG_TIMEOUT)
                .map(|_| t.filename.clone()),
            _ => None,
        };
        if let Some(filename) = unanswered {
            if let Some(t) = &mut self.track {
                t.requested_at = Some(now);
            }
            self.schedule_recovery(SlotKind::Current, &filename, Some(0));
        }
    }

    fn schedule_recovery(&mut self, slot: SlotKind, filename: &str, forced: Option<u32>) {
        match self.recovery_mut(slot).trigger(filename, forced) {
            TriggerOutcome::Scheduled { delay, generation } => {
                self.core.schedule(delay, NodeMsg::RecoveryFire { slot, generation });
            }
            TriggerOutcome::AlreadyPending => {}
            TriggerOutcome::Exhausted => {
                self.receiver.abandon(slot);
                // The current track is asked for again from chunk 0 once the
                // watchdog timeout passes.
                if slot == SlotKind::Current
                    && let Some(t) = &mut self.track
                    && t.filename == filename
                    && !t.ready
                {
                    t.requested_at = Some(Instant::now());
                }
                if slot == SlotKind::Preload
                    && let Some(sid) = self.preload.entry().filter(|e| e.filename == filename).map(|e| e.session_id)
                {
                    self.preload.on_failed(sid);
                }
                self.core.emit(NodeEvent::TransferFailed {
                    slot,
                    filename: filename.to_string(),
                    reason: "recovery attempts exhausted".to_string(),
                });
            }
        }
    }

    /// What a resume request for `slot` would ask for right now.
    fn recovery_target(&self, slot: SlotKind) -> (Option<String>, Option<SessionId>, u32) {
        if let Some(t) = self.receiver.get(slot) {
            return (Some(t.filename.clone()), Some(t.session_id), t.resume_point());
        }
        match slot {
            SlotKind::Current => match &self.track {
                Some(t) if !t.ready => (Some(t.filename.clone()), Some(t.session_id), 0),
                _ => (None, None, 0),
            },
            SlotKind::Preload => match self.preload.entry() {
                Some(e) => (Some(e.filename.clone()), Some(e.session_id), 0),
                None => (None, None, 0),
            },
        }
    }

    fn fire_recovery(&mut self, slot: SlotKind, generation: u64) {
        let (filename, session_id, received_count) = self.recovery_target(slot);
        let route = self.core.router.upstream().cloned();
        let outcome = self.recovery_mut(slot).fire(
            generation,
            FireContext {
                current_filename: filename.as_deref(),
                session_id,
                received_count,
                route: route.as_ref(),
            },
        );
        if let FireOutcome::Send { message, .. } = outcome
            && let Some(link) = route
        {
            if let Err(e) = link.send(&message) {
                warn!(event = "recovery_send_failed", slot = %slot, error = %e, "Resume request not sent");
            }
            self.receiver.touch(slot, Instant::now());
        }
    }

    // ── Relay duties ─────────────────────────────────────────────────────────

    fn on_downstream_message(&mut self, link: LinkId, msg: ProtocolMessage) {
        match msg {
            ProtocolMessage::Hello {
                peer_id,
                session_code,
                display_name,
            } => {
                if session_code != self.core.config.session_code || self.upstream_id().is_none() {
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
                info!(event = "downstream_join", peer_id = %peer_id, link = %link, "Relaying join");
                self.core.router.mark_joined(link);
                self.downstream_peers.insert(link, peer_id.clone());
                self.core
                    .router
                    .send_upstream(&ProtocolMessage::RequestJoin { peer_id, display_name });
            }
            ProtocolMessage::Ping { sent_at } => {
                self.core.router.send_to(link, &ProtocolMessage::Pong { sent_at });
            }
            other if !self.core.router.is_joined(link) => {
                warn!(event = "unjoined_message", link = %link, kind = other.kind(), "Dropping message before hello");
            }
            ProtocolMessage::RecoveryRequest {
                filename,
                next_chunk,
                session_id,
                slot,
            } => self.serve_downstream(link, filename, next_chunk, session_id, slot),
            other => debug!(event = "message_ignored", link = %link, kind = other.kind(), "Not handled from downstream"),
        }
    }

    /// Serve a downstream resume from a completed local copy, or fetch the
    /// file first.
    fn serve_downstream(
        &mut self,
        link: LinkId,
        filename: Option<String>,
        next_chunk: u32,
        session_id: Option<SessionId>,
        slot: SlotKind,
    ) {
        let target = filename.or_else(|| match slot {
            SlotKind::Current => self.track.as_ref().map(|t| t.filename.clone()),
            SlotKind::Preload => self.preload.entry().map(|e| e.filename.clone()),
        });
        let Some(target) = target else {
            return;
        };
        let waiting = Waiting {
            link,
            slot,
            filename: target.clone(),
            session_id,
            next_chunk,
        };

        if let Some(stored_in) = self.completed.get(&slot).filter(|c| c.filename == target).map(|c| c.stored_in) {
            self.waiting.push(waiting);
            // A taken-over preload is stored under its transfer session id.
            self.storage.read(stored_in, &target, None);
            return;
        }

        let in_flight = self.receiver.get(slot).is_some_and(|t| t.filename == target)
            || (slot == SlotKind::Current
                && self.track.as_ref().is_some_and(|t| t.filename == target && !t.ready));
        self.waiting.push(waiting);
        if !in_flight {
            self.request_whole(slot, target, session_id);
        }
    }

    fn push_downstream(&self, w: &Waiting, bytes: Arc<[u8]>, session_id: SessionId) {
        let Some(link) = self.core.link(w.link) else {
            return;
        };
        debug!(event = "relay_serve", link = %w.link, filename = %w.filename, slot = %w.slot, "Serving relayed peer");
        spawn_push(
            link,
            Push {
                source: Source::Memory(bytes),
                filename: Some(w.filename.clone()),
                slot: w.slot,
                session_id: w.session_id.unwrap_or(session_id),
                track: None,
                start_chunk: w.next_chunk,
            },
        );
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        self.storage_task.abort();
    }
}
