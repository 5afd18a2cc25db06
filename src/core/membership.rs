//! Host-side session membership: slots, labels, operators, roster.
//!
//! Up to [`MAX_GUESTS`] guests hold a numbered slot (1-based) with a fixed
//! label. A guest that reconnects gets its previous slot back when it is
//! free, first from this process's memory and then from the persisted peer
//! registry. The same peer identity connecting again replaces the older link.

use std::collections::HashMap;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::{MAX_GUESTS, SESSION_CODE_DIGITS, SLOT_LABELS};
use crate::core::connection::LinkId;
use crate::core::peer_registry::PeerRegistry;
use crate::core::protocol::{ConnectionType, PeerStatus, RosterEntry};

/// Random numeric join code with [`SESSION_CODE_DIGITS`] digits.
pub fn generate_session_code() -> String {
    let max = 10u32.pow(SESSION_CODE_DIGITS);
    let code = rand::thread_rng().gen_range(0..max);
    format!("{code:0width$}", width = SESSION_CODE_DIGITS as usize)
}

/// Label of a 1-based slot number.
pub fn slot_label(slot: u8) -> &'static str {
    SLOT_LABELS
        .get((slot as usize).wrapping_sub(1))
        .copied()
        .unwrap_or("Guest")
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: String,
    pub slot: u8,
    pub label: String,
    /// Direct link, or the relay link for peers attached below a relay.
    pub link: LinkId,
    pub via_relay: bool,
    pub display_name: Option<String>,
    pub is_op: bool,
    pub connection_type: ConnectionType,
    pub status: PeerStatus,
    pub last_heartbeat: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted {
        slot: u8,
        label: String,
        /// Older direct link of the same peer, to be sent `forced-close` and
        /// closed. A relay link is never reported since it carries others.
        replaced: Option<LinkId>,
    },
    Full,
}

pub struct Membership {
    host_id: String,
    peers: HashMap<String, PeerEntry>,
    previous_slots: HashMap<String, u8>,
    registry: PeerRegistry,
}

impl Membership {
    pub fn new(host_id: impl Into<String>, registry: PeerRegistry) -> Self {
        Self {
            host_id: host_id.into(),
            peers: HashMap::new(),
            previous_slots: HashMap::new(),
            registry,
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerEntry> {
        self.peers.values()
    }

    /// Admit `peer_id` on `link`.
    pub fn accept(
        &mut self,
        peer_id: &str,
        display_name: Option<&str>,
        link: LinkId,
        via_relay: bool,
        now: Instant,
    ) -> AcceptOutcome {
        if let Some(existing) = self.peers.get_mut(peer_id) {
            let replaced = (existing.link != link && !existing.via_relay).then_some(existing.link);
            info!(
                event = "peer_replaced",
                peer_id = %peer_id,
                slot = existing.slot,
                old_link = %existing.link,
                new_link = %link,
                "Last connection wins"
            );
            existing.link = link;
            existing.via_relay = via_relay;
            existing.status = PeerStatus::Connecting;
            existing.connection_type = ConnectionType::Unknown;
            existing.last_heartbeat = now;
            if let Some(name) = display_name {
                existing.display_name = Some(name.to_string());
            }
            return AcceptOutcome::Accepted {
                slot: existing.slot,
                label: existing.label.clone(),
                replaced,
            };
        }

        let Some(slot) = self.pick_slot(peer_id) else {
            warn!(event = "session_full", peer_id = %peer_id, max = MAX_GUESTS, "Rejecting guest");
            return AcceptOutcome::Full;
        };
        let label = slot_label(slot).to_string();
        self.peers.insert(
            peer_id.to_string(),
            PeerEntry {
                peer_id: peer_id.to_string(),
                slot,
                label: label.clone(),
                link,
                via_relay,
                display_name: display_name.map(str::to_string),
                is_op: false,
                connection_type: ConnectionType::Unknown,
                status: PeerStatus::Connecting,
                last_heartbeat: now,
            },
        );
        self.previous_slots.insert(peer_id.to_string(), slot);
        self.registry.peer_connected(peer_id, slot, &label, display_name);
        info!(
            event = "peer_joined",
            peer_id = %peer_id,
            slot,
            label = %label,
            via_relay,
            "Guest admitted"
        );
        AcceptOutcome::Accepted {
            slot,
            label,
            replaced: None,
        }
    }

    fn pick_slot(&self, peer_id: &str) -> Option<u8> {
        let taken: Vec<u8> = self.peers.values().map(|p| p.slot).collect();
        let free = |s: &u8| (1..=MAX_GUESTS as u8).contains(s) && !taken.contains(s);

        let remembered = self
            .previous_slots
            .get(peer_id)
            .copied()
            .or_else(|| self.registry.remembered_slot(peer_id));
        if let Some(slot) = remembered.filter(free) {
            debug!(event = "slot_restored", peer_id = %peer_id, slot, "Reusing previous slot");
            return Some(slot);
        }
        (1..=MAX_GUESTS as u8).find(free)
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> Option<PeerEntry> {
        let entry = self.peers.remove(peer_id)?;
        self.registry.peer_disconnected(peer_id);
        info!(event = "peer_left", peer_id = %peer_id, slot = entry.slot, "Guest removed");
        Some(entry)
    }

    /// Remove every peer reached over `link`: the direct peer plus anyone
    /// relayed through it.
    pub fn remove_link(&mut self, link: LinkId) -> Vec<PeerEntry> {
        let ids: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.link == link)
            .map(|p| p.peer_id.clone())
            .collect();
        ids.iter().filter_map(|id| self.remove_peer(id)).collect()
    }

    /// The directly connected peer on `link`.
    pub fn peer_by_link(&self, link: LinkId) -> Option<&PeerEntry> {
        self.peers.values().find(|p| p.link == link && !p.via_relay)
    }

    /// Record the link classification; relayed peers behind `link` inherit
    /// it. Returns `true` if anything changed.
    pub fn set_connection_type(&mut self, link: LinkId, kind: ConnectionType) -> bool {
        let mut changed = false;
        for p in self.peers.values_mut().filter(|p| p.link == link) {
            if p.connection_type != kind || p.status != PeerStatus::Connected {
                p.connection_type = kind;
                p.status = PeerStatus::Connected;
                changed = true;
            }
        }
        changed
    }

    pub fn heartbeat(&mut self, link: LinkId, now: Instant) {
        for p in self.peers.values_mut().filter(|p| p.link == link && !p.via_relay) {
            p.last_heartbeat = now;
        }
    }

    /// Grant or revoke operator rights. Returns the peer's link when the
    /// flag actually changed.
    pub fn set_operator(&mut self, peer_id: &str, is_op: bool) -> Option<LinkId> {
        let p = self.peers.get_mut(peer_id)?;
        if p.is_op == is_op {
            return None;
        }
        p.is_op = is_op;
        info!(event = "operator_changed", peer_id = %peer_id, is_op, "Operator rights updated");
        Some(p.link)
    }

    /// Roster ordered host first, then by slot.
    pub fn roster(&self) -> Vec<RosterEntry> {
        let mut guests: Vec<&PeerEntry> = self.peers.values().collect();
        guests.sort_by_key(|p| p.slot);

        let mut out = Vec::with_capacity(guests.len() + 1);
        out.push(RosterEntry {
            id: self.host_id.clone(),
            label: "Host".to_string(),
            status: PeerStatus::Connected,
            is_host: true,
            is_op: true,
            connection_type: ConnectionType::Local,
        });
        out.extend(guests.into_iter().map(|p| RosterEntry {
            id: p.peer_id.clone(),
            label: p.label.clone(),
            status: p.status,
            is_host: false,
            is_op: p.is_op,
            connection_type: p.connection_type,
        }));
        out
    }
}
