//! The network session context: one per process.
//!
//! A node owns every piece of session state (router, membership or
//! receiver, player, id generator) and runs a single `tokio::select!` loop
//! over link events, storage events, timers and self-addressed messages.
//! Nothing here is global; the binary creates a [`Host`] or a [`Guest`],
//! hands it links, and drops it on leave.
//!
//! ```text
//!  transports ──LinkEvent──►┌──────────────┐◄──StorageEvent── storage worker
//!                           │  node loop   │
//!  router handlers ─NodeMsg►│ (host/guest) │──NodeEvent──► observers
//!  timers ──────────NodeMsg►└──────────────┘
//! ```

pub mod guest;
pub mod host;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub use guest::Guest;
pub use host::Host;

use crate::core::connection::{LinkEvent, LinkId, LinkIds, PeerLink};
use crate::core::protocol::{Envelope, ProtocolMessage, RosterEntry};
use crate::core::relay::RelayRouter;
use crate::core::session_id::SessionId;
use crate::core::session_id::SessionIdGenerator;
use crate::core::storage::SlotKind;
use crate::core::sync::Player;
use crate::utils::sos::SignalOfStop;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Role,
    pub peer_id: String,
    pub display_name: Option<String>,
    /// Join code. Generated by the host when empty.
    pub session_code: String,
    /// Host playlist.
    pub tracks: Vec<PathBuf>,
    /// Peers granted operator rights as soon as they join (host).
    pub operators: Vec<String>,
    /// Suffix of persisted slot resources, unique per running process.
    pub instance_id: String,
    pub storage_dir: PathBuf,
    /// Peer registry file (host). `None` keeps it in memory.
    pub registry_path: Option<PathBuf>,
}

/// Why a node's run loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeExit {
    Stopped,
    /// The guest lost its link towards the host; reconnecting may help.
    UpstreamLost,
    /// The host refused or evicted this guest.
    Rejected(String),
}

/// Local control input (keyboard, scripts).
#[derive(Debug, Clone, PartialEq)]
pub enum NodeCommand {
    Play,
    Pause,
    Seek(f64),
    Track(u32),
    /// Shift the guest's local sync offset.
    Nudge(f64),
    Grant(String),
    Revoke(String),
    /// Log the current roster.
    Roster,
}

/// Observable milestones, for the binary's status output and for tests.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    SessionReady { session_code: String },
    Welcomed { slot: u8, label: String },
    RosterChanged(Vec<RosterEntry>),
    OperatorChanged(bool),
    TrackLoaded {
        track_index: u32,
        filename: String,
        session_id: SessionId,
        from_preload: bool,
    },
    PreloadReady { track_index: u32, filename: String },
    TransferFailed { slot: SlotKind, filename: String, reason: String },
}

/// Self-addressed work for the node loop.
#[derive(Debug)]
pub(crate) enum NodeMsg {
    /// Decoded control message that passed the router.
    Inbound { link: LinkId, msg: ProtocolMessage },
    /// A recovery backoff elapsed.
    RecoveryFire { slot: SlotKind, generation: u64 },
    /// Time to classify a freshly joined link.
    Classify { link: LinkId },
}

/// State and plumbing shared by both roles.
pub(crate) struct NodeCore {
    pub(crate) config: NodeConfig,
    pub(crate) router: RelayRouter,
    link_ids: LinkIds,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    pub(crate) link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    inbox_tx: mpsc::UnboundedSender<NodeMsg>,
    pub(crate) inbox_rx: mpsc::UnboundedReceiver<NodeMsg>,
    command_tx: mpsc::UnboundedSender<NodeCommand>,
    pub(crate) command_rx: mpsc::UnboundedReceiver<NodeCommand>,
    observers: Vec<mpsc::UnboundedSender<NodeEvent>>,
    pub(crate) player: Box<dyn Player>,
    pub(crate) ids: SessionIdGenerator,
    pub(crate) stop: SignalOfStop,
}

impl NodeCore {
    pub(crate) fn new(config: NodeConfig, player: Box<dyn Player>, stop: SignalOfStop) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let is_host = config.role == Role::Host;
        Self {
            config,
            router: RelayRouter::new(is_host),
            link_ids: LinkIds::default(),
            link_tx,
            link_rx,
            inbox_tx,
            inbox_rx,
            command_tx,
            command_rx,
            observers: Vec::new(),
            player,
            ids: SessionIdGenerator::new(),
            stop,
        }
    }

    /// Route every `kinds` message through the router into the inbox.
    pub(crate) fn register_inbox(&mut self, kinds: &[&str]) {
        for kind in kinds {
            let inbox = self.inbox_tx.clone();
            self.router.register_handler(
                kind,
                std::sync::Arc::new(move |env: &Envelope, link: LinkId| -> anyhow::Result<()> {
                    let msg = env.decode()?;
                    inbox
                        .send(NodeMsg::Inbound { link, msg })
                        .map_err(|_| anyhow!("node inbox closed"))
                }),
            );
        }
    }

    /// Validate raw link text. Transfer traffic is decoded and returned for
    /// the transfer engine; control traffic goes through the router.
    pub(crate) fn route_text(&self, link: LinkId, text: &str) -> Option<ProtocolMessage> {
        let env = match Envelope::parse(text) {
            Ok(env) => env,
            Err(e) => {
                debug!(event = "message_dropped", link = %link, error = %e, "Invalid message");
                return None;
            }
        };
        if env.is_transfer() {
            return match env.decode() {
                Ok(msg) => Some(msg),
                Err(e) => {
                    debug!(event = "message_dropped", link = %link, kind = %env.kind(), error = %e, "Undecodable transfer message");
                    None
                }
            };
        }
        trace!(event = "control_message", link = %link, kind = %env.kind(), "Dispatching");
        self.router.dispatch(&env, link);
        None
    }

    /// Deliver `msg` to this node's inbox after `delay`.
    pub(crate) fn schedule(&self, delay: Duration, msg: NodeMsg) {
        let inbox = self.inbox_tx.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            if stop.run_until(tokio::time::sleep(delay)).await.is_some() {
                let _ = inbox.send(msg);
            }
        });
    }

    pub(crate) fn emit(&mut self, event: NodeEvent) {
        self.observers.retain(|o| o.send(event.clone()).is_ok());
    }

    pub(crate) fn link(&self, id: LinkId) -> Option<PeerLink> {
        self.router.link(id).cloned()
    }
}

/// Handles for feeding a node from outside its loop.
#[derive(Clone)]
pub struct NodeHandles {
    pub link_ids: LinkIds,
    pub link_events: mpsc::UnboundedSender<LinkEvent>,
    pub commands: mpsc::UnboundedSender<NodeCommand>,
}

impl NodeCore {
    pub(crate) fn handles(&self) -> NodeHandles {
        NodeHandles {
            link_ids: self.link_ids.clone(),
            link_events: self.link_tx.clone(),
            commands: self.command_tx.clone(),
        }
    }

    pub(crate) fn subscribe(&mut self) -> mpsc::UnboundedReceiver<NodeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests;
