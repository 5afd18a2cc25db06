//! Persistent peer registry: remembers which slot each guest last held.
//!
//! Stored as `<data_dir>/peers.json` and rewritten on every connect and
//! disconnect, so a guest rejoining after a host restart gets its previous
//! slot (and label) back when that slot is free.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use crate::utils::atomic_write::atomic_write;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Slot number (1-based) held during the last session.
    pub last_slot: u8,
    #[serde(default)]
    pub last_label: String,
    /// Unix seconds.
    #[serde(default)]
    pub last_connected: u64,
    #[serde(default)]
    pub last_disconnected: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PeerRegistry {
    pub peers: HashMap<String, PeerRecord>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl PeerRegistry {
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join("peers.json")
    }

    /// Load from `path`; a missing or unreadable file yields an empty
    /// registry that still saves to `path`.
    pub fn load(path: PathBuf) -> Self {
        let mut registry = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<PeerRegistry>(&content) {
                Ok(reg) => {
                    debug!(event = "peer_registry_loaded", peers = reg.peers.len(), "Peer registry loaded");
                    reg
                }
                Err(e) => {
                    error!(
                        event = "peer_registry_parse_failure",
                        error = %e,
                        "Failed to parse peer registry, starting fresh"
                    );
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(event = "peer_registry_read_failure", error = %e, "Failed to read peer registry");
                Self::default()
            }
        };
        registry.path = Some(path);
        registry
    }

    /// Registry that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(self)?;
        atomic_write(path, content.as_bytes())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(event = "peer_registry_save_failure", error = %e, "Failed to save peer registry");
        }
    }

    /// Slot the peer held last time, if any.
    pub fn remembered_slot(&self, peer_id: &str) -> Option<u8> {
        self.peers.get(peer_id).map(|r| r.last_slot)
    }

    pub fn peer_connected(&mut self, peer_id: &str, slot: u8, label: &str, display_name: Option<&str>) {
        let now = now_unix();
        let entry = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerRecord {
                peer_id: peer_id.to_string(),
                display_name: None,
                last_slot: slot,
                last_label: String::new(),
                last_connected: now,
                last_disconnected: None,
            });
        entry.last_slot = slot;
        entry.last_label = label.to_string();
        entry.last_connected = now;
        if let Some(name) = display_name {
            entry.display_name = Some(name.to_string());
        }
        self.persist();
    }

    pub fn peer_disconnected(&mut self, peer_id: &str) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.last_disconnected = Some(now_unix());
            self.persist();
        }
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
