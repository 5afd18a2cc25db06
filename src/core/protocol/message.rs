//! Protocol types: every message that crosses a peer link.
//!
//! This module is a pure data layer without I/O. On the wire each
//! message is a flat JSON object whose `"type"` field carries the kebab-case
//! discriminant; fields are camelCase. Unknown extra fields are ignored and a
//! missing mandatory field makes the whole message fail to decode, which the
//! callers treat as a silent drop.

use crate::core::session_id::SessionId;
use crate::core::storage::SlotKind;
use serde::{Deserialize, Serialize};

// ── Shared value types ───────────────────────────────────────────────────────

/// Host transport state carried by sync broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Playing,
    Paused,
}

/// Lifecycle of a peer as shown in the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Whether a link runs over the local network or through something farther.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Local,
    Remote,
    Unknown,
}

/// One row of a `roster-update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: String,
    pub label: String,
    pub status: PeerStatus,
    pub is_host: bool,
    pub is_op: bool,
    pub connection_type: ConnectionType,
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// All messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ProtocolMessage {
    // ── Session membership ───────────────────────────────────────────────────
    /// First message a guest sends on a fresh link.
    Hello {
        peer_id: String,
        session_code: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// Host accepted the guest and assigned it a slot.
    Welcome {
        peer_id: String,
        slot: u8,
        label: String,
    },
    /// Host is at capacity; the link is closed right after.
    SessionFull { message: String, max_peers: usize },
    /// Wrong session code or malformed hello.
    SessionRejected { reason: String },
    /// A newer link for the same peer identity replaced this one.
    ForcedClose { reason: String },
    /// Full roster, host first.
    RosterUpdate { peers: Vec<RosterEntry> },
    /// Host granted operator rights to `peer_id`. Relays pass it to every
    /// peer below them, so a receiver acts only on its own id.
    OperatorGrant {
        #[serde(default)]
        peer_id: Option<String>,
    },
    /// Host revoked operator rights.
    OperatorRevoke {
        #[serde(default)]
        peer_id: Option<String>,
    },

    // ── File transfer ────────────────────────────────────────────────────────
    /// Opens a transfer into a storage slot.
    TransferStart {
        filename: String,
        session_id: SessionId,
        chunk_size: u32,
        #[serde(default)]
        total_size: Option<u64>,
        #[serde(default)]
        slot: SlotKind,
        #[serde(default)]
        track_index: Option<u32>,
        #[serde(default)]
        generation: Option<u64>,
    },
    /// One chunk, persisted at `index * chunk_size`.
    TransferWrite {
        filename: String,
        session_id: SessionId,
        index: u32,
        #[serde(with = "super::envelope::base64_bytes")]
        bytes: Vec<u8>,
        #[serde(default)]
        slot: SlotKind,
    },
    /// Closes a transfer; declared size and digest are checked when present.
    TransferEnd {
        filename: String,
        session_id: SessionId,
        #[serde(default)]
        total_size: Option<u64>,
        #[serde(default)]
        sha3: Option<String>,
        #[serde(default)]
        slot: SlotKind,
    },
    /// Receiver asks the sender to resume from `next_chunk`.
    RecoveryRequest {
        #[serde(default)]
        filename: Option<String>,
        next_chunk: u32,
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default)]
        slot: SlotKind,
    },

    // ── Playback ─────────────────────────────────────────────────────────────
    /// Periodic host clock.
    SyncBroadcast {
        time: f64,
        state: TransportState,
        #[serde(default)]
        sub_index: Option<u32>,
    },
    /// Host moved to another playlist entry.
    TrackChange {
        track_index: u32,
        filename: String,
        session_id: SessionId,
        generation: u64,
    },
    /// Round-trip timer (guest → host).
    Ping { sent_at: f64 },
    /// Ping echo (host → guest).
    Pong { sent_at: f64 },

    // ── Operator requests (guest → host) ─────────────────────────────────────
    RequestPlay { from: String },
    RequestPause { from: String },
    RequestSeek { from: String, time: f64 },
    RequestTrack { from: String, index: u32 },
    /// A relay guest announcing a peer attached below it.
    RequestJoin {
        peer_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// A relay guest announcing that a peer below it left.
    RequestLeave { peer_id: String },
}

impl ProtocolMessage {
    /// Wire discriminant of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Welcome { .. } => "welcome",
            Self::SessionFull { .. } => "session-full",
            Self::SessionRejected { .. } => "session-rejected",
            Self::ForcedClose { .. } => "forced-close",
            Self::RosterUpdate { .. } => "roster-update",
            Self::OperatorGrant { .. } => "operator-grant",
            Self::OperatorRevoke { .. } => "operator-revoke",
            Self::TransferStart { .. } => "transfer-start",
            Self::TransferWrite { .. } => "transfer-write",
            Self::TransferEnd { .. } => "transfer-end",
            Self::RecoveryRequest { .. } => "recovery-request",
            Self::SyncBroadcast { .. } => "sync-broadcast",
            Self::TrackChange { .. } => "track-change",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::RequestPlay { .. } => "request-play",
            Self::RequestPause { .. } => "request-pause",
            Self::RequestSeek { .. } => "request-seek",
            Self::RequestTrack { .. } => "request-track",
            Self::RequestJoin { .. } => "request-join",
            Self::RequestLeave { .. } => "request-leave",
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Message types a relay node forwards from its upstream to its downstream
/// links.
pub const RELAYABLE_KINDS: &[&str] = &[
    "sync-broadcast",
    "roster-update",
    "track-change",
    "welcome",
    "operator-grant",
    "operator-revoke",
];
