//! Receiver side: bridges inbound `transfer-*` messages to the storage actor
//! and tracks per-slot progress.
//!
//! The storage actor decides ownership and persists bytes; this tracker only
//! remembers which chunks went by so the node can tell where a stalled
//! transfer should resume. A `transfer-end` that arrives while chunks are
//! still missing is held back and replayed once the gap is filled.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use super::chunk::{chunk_count, ChunkBitmap};
use crate::core::session_id::SessionId;
use crate::core::storage::{SlotKind, StorageErrorKind, StorageEvent, StorageHandle};

/// Progress of one inbound transfer.
#[derive(Debug, Clone)]
pub struct InboundTransfer {
    pub filename: String,
    pub session_id: SessionId,
    pub chunk_size: usize,
    pub total_size: Option<u64>,
    pub track_index: Option<u32>,
    pub generation: Option<u64>,
    bitmap: ChunkBitmap,
    last_progress: Instant,
    deferred_end: Option<DeferredEnd>,
}

#[derive(Debug, Clone)]
struct DeferredEnd {
    total_size: Option<u64>,
    sha3: Option<String>,
}

impl InboundTransfer {
    pub fn received_count(&self) -> u32 {
        self.bitmap.received_count()
    }

    /// Where an in-order sender should resume.
    pub fn resume_point(&self) -> u32 {
        self.bitmap.contiguous_prefix()
    }

    pub fn first_missing(&self) -> Option<u32> {
        self.bitmap.first_missing()
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.is_complete()
    }
}

/// What the node should do after feeding a message in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveAction {
    None,
    /// Chunks are missing at `transfer-end`; resume from `next_chunk`.
    Recover {
        slot: SlotKind,
        filename: String,
        next_chunk: u32,
    },
}

/// Parameters of an inbound `transfer-start`.
#[derive(Debug, Clone)]
pub struct StartInfo {
    pub slot: SlotKind,
    pub filename: String,
    pub session_id: SessionId,
    pub chunk_size: usize,
    pub total_size: Option<u64>,
    pub track_index: Option<u32>,
    pub generation: Option<u64>,
}

pub struct TransferReceiver {
    storage: StorageHandle,
    inbound: HashMap<SlotKind, InboundTransfer>,
}

impl TransferReceiver {
    pub fn new(storage: StorageHandle) -> Self {
        Self {
            storage,
            inbound: HashMap::new(),
        }
    }

    pub fn get(&self, slot: SlotKind) -> Option<&InboundTransfer> {
        self.inbound.get(&slot)
    }

    pub fn on_start(&mut self, info: StartInfo, now: Instant) {
        let reentry = self
            .inbound
            .get(&info.slot)
            .is_some_and(|t| t.session_id == info.session_id && t.filename == info.filename);

        if reentry {
            if let Some(t) = self.inbound.get_mut(&info.slot) {
                t.last_progress = now;
            }
        } else {
            let total = info.total_size.map(|s| chunk_count(s, info.chunk_size));
            self.inbound.insert(
                info.slot,
                InboundTransfer {
                    filename: info.filename.clone(),
                    session_id: info.session_id,
                    chunk_size: info.chunk_size,
                    total_size: info.total_size,
                    track_index: info.track_index,
                    generation: info.generation,
                    bitmap: ChunkBitmap::new(total),
                    last_progress: now,
                    deferred_end: None,
                },
            );
        }
        debug!(
            event = "inbound_start",
            slot = %info.slot,
            filename = %info.filename,
            session_id = info.session_id,
            reentry,
            "Inbound transfer started"
        );
        self.storage
            .start(info.slot, &info.filename, info.session_id, info.chunk_size);
    }

    pub fn on_write(
        &mut self,
        slot: SlotKind,
        filename: &str,
        session_id: SessionId,
        index: u32,
        bytes: Vec<u8>,
        now: Instant,
    ) {
        // Storage is the authority on ownership; a non-matching write still
        // goes through so it is reported as a mismatch there.
        self.storage.write(slot, filename, session_id, index, bytes);

        let Some(t) = self.tracked_mut(slot, filename, session_id) else {
            return;
        };
        if t.bitmap.set(index) {
            t.last_progress = now;
        }
        if t.is_complete()
            && let Some(end) = t.deferred_end.take()
        {
            info!(
                event = "deferred_end_replayed",
                slot = %slot,
                filename = %filename,
                session_id,
                "Gap filled; finishing transfer"
            );
            self.storage.end(slot, filename, session_id, end.total_size, end.sha3);
        }
    }

    pub fn on_end(
        &mut self,
        slot: SlotKind,
        filename: &str,
        session_id: SessionId,
        total_size: Option<u64>,
        sha3: Option<String>,
    ) -> ReceiveAction {
        if let Some(t) = self.tracked_mut(slot, filename, session_id) {
            if t.total_size.is_none()
                && let Some(size) = total_size
            {
                t.total_size = Some(size);
                t.bitmap.set_total(chunk_count(size, t.chunk_size));
            }
            if t.bitmap.total_chunks().is_some()
                && let Some(missing) = t.first_missing()
            {
                info!(
                    event = "end_deferred",
                    slot = %slot,
                    filename = %filename,
                    session_id,
                    next_chunk = missing,
                    received = t.received_count(),
                    "Transfer end with missing chunks; requesting resume"
                );
                t.deferred_end = Some(DeferredEnd { total_size, sha3 });
                return ReceiveAction::Recover {
                    slot,
                    filename: filename.to_string(),
                    next_chunk: missing,
                };
            }
        }
        self.storage.end(slot, filename, session_id, total_size, sha3);
        ReceiveAction::None
    }

    /// Forget a transfer once storage reports its terminal outcome.
    pub fn on_storage_event(&mut self, event: &StorageEvent) {
        match event {
            StorageEvent::FileReady {
                slot,
                filename,
                session_id,
                ..
            } => {
                if self.tracked_mut(*slot, filename, *session_id).is_some() {
                    self.inbound.remove(slot);
                }
            }
            StorageEvent::Error {
                slot,
                session_id: Some(sid),
                kind: StorageErrorKind::Integrity | StorageErrorKind::LockCollision | StorageErrorKind::InvalidSession,
                ..
            } => {
                if self.inbound.get(slot).is_some_and(|t| t.session_id == *sid) {
                    self.inbound.remove(slot);
                }
            }
            _ => {}
        }
    }

    /// Slots whose transfer has not progressed for `timeout`.
    pub fn stalled(&self, now: Instant, timeout: Duration) -> Vec<(SlotKind, String)> {
        self.inbound
            .iter()
            .filter(|(_, t)| !t.is_complete() && now.saturating_duration_since(t.last_progress) >= timeout)
            .map(|(slot, t)| (*slot, t.filename.clone()))
            .collect()
    }

    /// Restart the stall timer (after a resume request went out).
    pub fn touch(&mut self, slot: SlotKind, now: Instant) {
        if let Some(t) = self.inbound.get_mut(&slot) {
            t.last_progress = now;
        }
    }

    /// Abandon the slot's transfer and drop its storage lock.
    pub fn abandon(&mut self, slot: SlotKind) -> Option<InboundTransfer> {
        self.storage.reset(slot);
        self.inbound.remove(&slot)
    }

    fn tracked_mut(&mut self, slot: SlotKind, filename: &str, session_id: SessionId) -> Option<&mut InboundTransfer> {
        self.inbound
            .get_mut(&slot)
            .filter(|t| t.session_id == session_id && t.filename == filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::worker::StorageWorker;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("lockstep-receiver-{}", uuid::Uuid::new_v4().simple()))
    }

    fn start(slot: SlotKind, sid: SessionId, total: Option<u64>) -> StartInfo {
        StartInfo {
            slot,
            filename: "track.mp3".into(),
            session_id: sid,
            chunk_size: 4,
            total_size: total,
            track_index: None,
            generation: None,
        }
    }

    async fn next_ready(events: &mut mpsc::UnboundedReceiver<StorageEvent>) -> StorageEvent {
        loop {
            let ev = events.recv().await.unwrap();
            if !matches!(ev, StorageEvent::Started { .. }) {
                return ev;
            }
        }
    }

    #[tokio::test]
    async fn gap_defers_end_until_resume_fills_it() {
        let root = temp_root();
        let (storage, mut events, _join) = StorageWorker::spawn(root.clone(), "i".into());
        let mut rx = TransferReceiver::new(storage);
        let now = Instant::now();

        rx.on_start(start(SlotKind::Current, 1001, Some(400)), now);
        for i in (0..100u32).filter(|i| *i != 42) {
            rx.on_write(SlotKind::Current, "track.mp3", 1001, i, vec![i as u8; 4], now);
        }
        let action = rx.on_end(SlotKind::Current, "track.mp3", 1001, Some(400), None);
        assert_eq!(
            action,
            ReceiveAction::Recover {
                slot: SlotKind::Current,
                filename: "track.mp3".into(),
                next_chunk: 42
            }
        );
        assert!(rx.get(SlotKind::Current).unwrap().deferred_end.is_some());
        assert_eq!(rx.get(SlotKind::Current).unwrap().resume_point(), 42);

        // Sender resumes from 42: re-entry keeps what was written.
        rx.on_start(start(SlotKind::Current, 1001, Some(400)), now);
        for i in 42..100u32 {
            rx.on_write(SlotKind::Current, "track.mp3", 1001, i, vec![i as u8; 4], now);
        }

        match next_ready(&mut events).await {
            StorageEvent::FileReady { size, path, .. } => {
                assert_eq!(size, 400);
                let bytes = std::fs::read(path).unwrap();
                for i in 0..100usize {
                    assert_eq!(bytes[i * 4], i as u8);
                }
            }
            other => panic!("unexpected {other:?}"),
        }
        // Second end (from the resumed sender) is a harmless mismatch.
        let _ = rx.on_end(SlotKind::Current, "track.mp3", 1001, Some(400), None);
        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn complete_transfer_ends_immediately() {
        let root = temp_root();
        let (storage, mut events, _join) = StorageWorker::spawn(root.clone(), "i".into());
        let mut rx = TransferReceiver::new(storage);
        let now = Instant::now();
        rx.on_start(start(SlotKind::Preload, 5, None), now);
        rx.on_write(SlotKind::Preload, "track.mp3", 5, 0, b"abcd".to_vec(), now);
        rx.on_write(SlotKind::Preload, "track.mp3", 5, 1, b"ef".to_vec(), now);
        assert_eq!(
            rx.on_end(SlotKind::Preload, "track.mp3", 5, Some(6), None),
            ReceiveAction::None
        );
        let ev = next_ready(&mut events).await;
        assert!(matches!(ev, StorageEvent::FileReady { size: 6, .. }));
        rx.on_storage_event(&ev);
        assert!(rx.get(SlotKind::Preload).is_none());
        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn stall_detection_and_touch() {
        let root = temp_root();
        let (storage, _events, _join) = StorageWorker::spawn(root.clone(), "i".into());
        let mut rx = TransferReceiver::new(storage);
        let t0 = Instant::now();
        rx.on_start(start(SlotKind::Current, 9, Some(40)), t0);
        rx.on_write(SlotKind::Current, "track.mp3", 9, 0, b"abcd".to_vec(), t0);

        let timeout = Duration::from_secs(4);
        assert!(rx.stalled(t0 + Duration::from_secs(3), timeout).is_empty());
        assert_eq!(
            rx.stalled(t0 + Duration::from_secs(4), timeout),
            vec![(SlotKind::Current, "track.mp3".to_string())]
        );
        rx.touch(SlotKind::Current, t0 + Duration::from_secs(4));
        assert!(rx.stalled(t0 + Duration::from_secs(5), timeout).is_empty());

        assert!(rx.abandon(SlotKind::Current).is_some());
        assert!(rx.stalled(t0 + Duration::from_secs(60), timeout).is_empty());
        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
