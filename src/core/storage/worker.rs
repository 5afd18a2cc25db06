//! Background storage actor.
//!
//! One task exclusively owns both slots and every open file handle. The rest
//! of the process reaches it only through a [`StorageHandle`] (fire-and-forget
//! commands) and learns outcomes from the [`StorageEvent`] stream. Commands are
//! processed strictly in arrival order, one at a time, so writes to a slot are
//! never interleaved however they arrive.
//!
//! Failures never cross the actor boundary as `Err`: each one becomes an
//! event the caller can branch on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::lock::{Grant, LockError, LockManager};
use super::slot_file::{self, SlotFile};
use super::{resource_name, SlotKind};
use crate::core::config::FLUSH_EVERY_CHUNKS;
use crate::core::session_id::SessionId;

/// Classified storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StorageErrorKind {
    /// Slot held by a session that may not be preempted. Retryable.
    #[error("lock collision")]
    LockCollision,
    /// Declared size or digest differs from what was persisted. Fatal for
    /// the transfer; the lock is released and the partial file removed.
    #[error("integrity failure")]
    Integrity,
    #[error("i/o failure")]
    Io,
    #[error("invalid session id")]
    InvalidSession,
}

/// Slot-scoped operation.
#[derive(Debug, Clone)]
pub enum StorageOp {
    Start {
        filename: String,
        session_id: SessionId,
        chunk_size: usize,
    },
    Write {
        filename: String,
        session_id: SessionId,
        index: u32,
        bytes: Vec<u8>,
    },
    End {
        filename: String,
        session_id: SessionId,
        total_size: Option<u64>,
        sha3: Option<String>,
    },
    /// Drop the slot's lock and handle. Idempotent.
    Reset,
    /// Reset, then delete every resource of the slot owned by this instance.
    Cleanup,
    /// Read back a completed resource.
    Read {
        filename: String,
        session_id: Option<SessionId>,
    },
}

impl StorageOp {
    fn name(&self) -> &'static str {
        match self {
            StorageOp::Start { .. } => "start",
            StorageOp::Write { .. } => "write",
            StorageOp::End { .. } => "end",
            StorageOp::Reset => "reset",
            StorageOp::Cleanup => "cleanup",
            StorageOp::Read { .. } => "read",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageCommand {
    pub slot: SlotKind,
    pub op: StorageOp,
}

/// Outcome notifications, correlated by slot, filename and session id.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    Started {
        slot: SlotKind,
        filename: String,
        session_id: SessionId,
        /// The same session already held the slot; nothing was truncated.
        reentered: bool,
    },
    WriteError {
        slot: SlotKind,
        filename: String,
        session_id: SessionId,
        index: u32,
        message: String,
    },
    FileReady {
        slot: SlotKind,
        filename: String,
        session_id: SessionId,
        size: u64,
        sha3: String,
        path: PathBuf,
    },
    ReadComplete {
        slot: SlotKind,
        filename: String,
        session_id: Option<SessionId>,
        bytes: Vec<u8>,
    },
    Error {
        slot: SlotKind,
        filename: Option<String>,
        session_id: Option<SessionId>,
        kind: StorageErrorKind,
        message: String,
    },
    SessionMismatch {
        slot: SlotKind,
        command: &'static str,
        filename: String,
        expected: Option<SessionId>,
        received: SessionId,
    },
}

/// Cloneable sender side of the storage actor.
#[derive(Debug, Clone)]
pub struct StorageHandle {
    tx: mpsc::UnboundedSender<StorageCommand>,
}

impl StorageHandle {
    pub fn send(&self, slot: SlotKind, op: StorageOp) {
        let name = op.name();
        if self.tx.send(StorageCommand { slot, op }).is_err() {
            warn!(
                event = "storage_closed",
                slot = %slot,
                op = name,
                "Storage worker is gone; command dropped"
            );
        }
    }

    pub fn start(&self, slot: SlotKind, filename: &str, session_id: SessionId, chunk_size: usize) {
        self.send(
            slot,
            StorageOp::Start {
                filename: filename.to_string(),
                session_id,
                chunk_size,
            },
        );
    }

    pub fn write(&self, slot: SlotKind, filename: &str, session_id: SessionId, index: u32, bytes: Vec<u8>) {
        self.send(
            slot,
            StorageOp::Write {
                filename: filename.to_string(),
                session_id,
                index,
                bytes,
            },
        );
    }

    pub fn end(
        &self,
        slot: SlotKind,
        filename: &str,
        session_id: SessionId,
        total_size: Option<u64>,
        sha3: Option<String>,
    ) {
        self.send(
            slot,
            StorageOp::End {
                filename: filename.to_string(),
                session_id,
                total_size,
                sha3,
            },
        );
    }

    pub fn reset(&self, slot: SlotKind) {
        self.send(slot, StorageOp::Reset);
    }

    pub fn cleanup(&self, slot: SlotKind) {
        self.send(slot, StorageOp::Cleanup);
    }

    pub fn read(&self, slot: SlotKind, filename: &str, session_id: Option<SessionId>) {
        self.send(
            slot,
            StorageOp::Read {
                filename: filename.to_string(),
                session_id,
            },
        );
    }
}

/// Signature used to suppress repeated mismatch notices.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MismatchKey {
    command: &'static str,
    expected: Option<SessionId>,
    received: SessionId,
    filename: String,
}

#[derive(Debug, Clone)]
struct Completed {
    filename: String,
    session_id: SessionId,
    path: PathBuf,
}

/// The actor itself. Construct with [`StorageWorker::spawn`].
pub struct StorageWorker {
    root: PathBuf,
    instance_id: String,
    locks: LockManager<SlotFile>,
    completed: HashMap<SlotKind, Completed>,
    last_mismatch: HashMap<SlotKind, MismatchKey>,
    events: mpsc::UnboundedSender<StorageEvent>,
}

impl StorageWorker {
    /// Start the actor over `root`. Resources are named with `instance_id`.
    pub fn spawn(
        root: PathBuf,
        instance_id: String,
    ) -> (StorageHandle, mpsc::UnboundedReceiver<StorageEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = StorageWorker {
            root,
            instance_id,
            locks: LockManager::new(),
            completed: HashMap::new(),
            last_mismatch: HashMap::new(),
            events: events_tx,
        };
        let join = tokio::spawn(worker.run(rx));
        (StorageHandle { tx }, events_rx, join)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<StorageCommand>) {
        info!(event = "storage_started", root = %self.root.display(), "Storage worker running");
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd).await;
        }
        for slot in SlotKind::ALL {
            self.close_slot(slot).await;
        }
        debug!(event = "storage_stopped", "Storage worker stopped");
    }

    fn emit(&self, event: StorageEvent) {
        let _ = self.events.send(event);
    }

    fn path_for(&self, slot: SlotKind, filename: &str) -> (String, PathBuf) {
        let name = resource_name(slot, filename, &self.instance_id);
        let path = self.root.join(&name);
        (name, path)
    }

    async fn handle(&mut self, cmd: StorageCommand) {
        let StorageCommand { slot, op } = cmd;
        match op {
            StorageOp::Start {
                filename,
                session_id,
                chunk_size,
            } => self.start(slot, filename, session_id, chunk_size).await,
            StorageOp::Write {
                filename,
                session_id,
                index,
                bytes,
            } => self.write(slot, filename, session_id, index, bytes).await,
            StorageOp::End {
                filename,
                session_id,
                total_size,
                sha3,
            } => self.end(slot, filename, session_id, total_size, sha3).await,
            StorageOp::Reset => {
                self.close_slot(slot).await;
                self.last_mismatch.remove(&slot);
            }
            StorageOp::Cleanup => self.cleanup(slot).await,
            StorageOp::Read {
                filename,
                session_id,
            } => self.read(slot, filename, session_id).await,
        }
    }

    async fn start(&mut self, slot: SlotKind, filename: String, session_id: SessionId, chunk_size: usize) {
        let (resource, path) = self.path_for(slot, &filename);
        let grant = match self.locks.acquire(slot, session_id, &resource) {
            Ok(grant) => grant,
            Err(e) => {
                let kind = match e {
                    LockError::InvalidSession(_) => StorageErrorKind::InvalidSession,
                    LockError::Stale { .. } | LockError::Collision { .. } => StorageErrorKind::LockCollision,
                };
                warn!(
                    event = "slot_acquire_failed",
                    slot = %slot,
                    filename = %filename,
                    session_id,
                    error = %e,
                    "Start refused"
                );
                self.emit(StorageEvent::Error {
                    slot,
                    filename: Some(filename),
                    session_id: Some(session_id),
                    kind,
                    message: e.to_string(),
                });
                return;
            }
        };

        let reentered = match grant {
            Grant::Reentered => true,
            Grant::Fresh => false,
            Grant::Preempted {
                previous_owner,
                previous_resource,
                timed_out,
                handle,
            } => {
                info!(
                    event = "slot_preempted",
                    slot = %slot,
                    previous_owner,
                    previous_resource = %previous_resource,
                    session_id,
                    timed_out,
                    "Slot preempted"
                );
                if let Some(old) = handle
                    && let Err(e) = old.close().await
                {
                    warn!(event = "slot_close_failed", slot = %slot, error = %e, "Closing preempted handle failed");
                }
                if previous_resource == resource {
                    self.completed.remove(&slot);
                }
                false
            }
        };

        self.locks.set_chunk_size(slot, chunk_size);
        if !reentered || self.locks.handle_mut(slot).is_none() {
            match SlotFile::create(path).await {
                Ok(file) => self.locks.attach(slot, file),
                Err(e) => {
                    self.locks.release(slot);
                    warn!(event = "slot_open_failed", slot = %slot, filename = %filename, error = %e, "Cannot open slot file");
                    self.emit(StorageEvent::Error {
                        slot,
                        filename: Some(filename),
                        session_id: Some(session_id),
                        kind: StorageErrorKind::Io,
                        message: e.to_string(),
                    });
                    return;
                }
            }
            if self.completed.get(&slot).is_some_and(|c| c.filename == filename) {
                self.completed.remove(&slot);
            }
        }

        debug!(
            event = "slot_started",
            slot = %slot,
            filename = %filename,
            session_id,
            reentered,
            "Transfer started"
        );
        self.emit(StorageEvent::Started {
            slot,
            filename,
            session_id,
            reentered,
        });
    }

    /// True when `session_id` owns the slot for `filename`. Otherwise emits
    /// a mismatch notice unless the same signature was just reported.
    fn check_owner(&mut self, slot: SlotKind, command: &'static str, filename: &str, session_id: SessionId) -> bool {
        let (resource, _) = self.path_for(slot, filename);
        if self.locks.is_held_by(slot, session_id) && self.locks.resource(slot) == Some(resource.as_str()) {
            return true;
        }

        let key = MismatchKey {
            command,
            expected: self.locks.owner(slot),
            received: session_id,
            filename: filename.to_string(),
        };
        if self.last_mismatch.get(&slot) != Some(&key) {
            debug!(
                event = "session_mismatch",
                slot = %slot,
                command,
                filename = %filename,
                expected = ?key.expected,
                received = session_id,
                "Dropping command from non-owning session"
            );
            self.emit(StorageEvent::SessionMismatch {
                slot,
                command,
                filename: filename.to_string(),
                expected: key.expected,
                received: session_id,
            });
            self.last_mismatch.insert(slot, key);
        }
        false
    }

    async fn write(&mut self, slot: SlotKind, filename: String, session_id: SessionId, index: u32, bytes: Vec<u8>) {
        if !self.check_owner(slot, "write", &filename, session_id) {
            return;
        }
        let chunk_size = self.locks.chunk_size(slot);
        if bytes.len() > chunk_size {
            warn!(event = "chunk_oversize", slot = %slot, index, len = bytes.len(), chunk_size, "Chunk larger than the announced size");
            self.emit(StorageEvent::WriteError {
                slot,
                filename,
                session_id,
                index,
                message: format!("chunk of {} bytes exceeds chunk size {chunk_size}", bytes.len()),
            });
            return;
        }
        let Some(file) = self.locks.handle_mut(slot) else {
            self.emit(StorageEvent::WriteError {
                slot,
                filename,
                session_id,
                index,
                message: "slot has no open handle".into(),
            });
            return;
        };

        if let Err(e) = file.write_chunk(index, chunk_size, &bytes).await {
            warn!(event = "chunk_write_failed", slot = %slot, index, error = %e, "Chunk write failed");
            self.emit(StorageEvent::WriteError {
                slot,
                filename,
                session_id,
                index,
                message: e.to_string(),
            });
            return;
        }

        let written = self.locks.record_write(slot);
        if written % FLUSH_EVERY_CHUNKS == 0
            && let Some(file) = self.locks.handle_mut(slot)
            && let Err(e) = file.flush().await
        {
            warn!(event = "slot_flush_failed", slot = %slot, error = %e, "Periodic flush failed");
        }
    }

    async fn end(
        &mut self,
        slot: SlotKind,
        filename: String,
        session_id: SessionId,
        total_size: Option<u64>,
        sha3: Option<String>,
    ) {
        if !self.check_owner(slot, "end", &filename, session_id) {
            return;
        }
        let summary = match self.locks.handle_mut(slot) {
            Some(file) => file.summarize().await,
            None => Err(anyhow::anyhow!("slot has no open handle")),
        };
        let path = self.locks.handle_mut(slot).map(|f| f.path().to_path_buf());
        if let Some(file) = self.locks.release(slot) {
            let _ = file.close().await;
        }
        self.last_mismatch.remove(&slot);

        let summary = match summary {
            Ok(s) => s,
            Err(e) => {
                warn!(event = "slot_finalize_failed", slot = %slot, filename = %filename, error = %e, "Finalize failed");
                self.emit(StorageEvent::Error {
                    slot,
                    filename: Some(filename),
                    session_id: Some(session_id),
                    kind: StorageErrorKind::Io,
                    message: e.to_string(),
                });
                return;
            }
        };
        let Some(path) = path else { return };

        let size_ok = total_size.is_none_or(|declared| declared == summary.size);
        let digest_ok = sha3
            .as_deref()
            .is_none_or(|declared| declared.eq_ignore_ascii_case(&summary.sha3));
        if !size_ok || !digest_ok {
            warn!(
                event = "integrity_failure",
                slot = %slot,
                filename = %filename,
                session_id,
                declared_size = ?total_size,
                actual_size = summary.size,
                digest_ok,
                "Persisted file does not match the declared size or digest"
            );
            if let Err(e) = slot_file::remove(&path).await {
                warn!(event = "slot_remove_failed", path = %path.display(), error = %e, "Cannot remove corrupt file");
            }
            let message = match (size_ok, sha3.as_deref()) {
                (false, _) => format!(
                    "declared {} bytes, persisted {} bytes",
                    total_size.unwrap_or_default(),
                    summary.size
                ),
                (true, Some(declared)) => format!("sha3 mismatch: declared {declared}, persisted {}", summary.sha3),
                (true, None) => "integrity check failed".to_string(),
            };
            self.emit(StorageEvent::Error {
                slot,
                filename: Some(filename),
                session_id: Some(session_id),
                kind: StorageErrorKind::Integrity,
                message,
            });
            return;
        }

        info!(
            event = "file_ready",
            slot = %slot,
            filename = %filename,
            session_id,
            size = summary.size,
            "Transfer complete"
        );
        self.completed.insert(
            slot,
            Completed {
                filename: filename.clone(),
                session_id,
                path: path.clone(),
            },
        );
        self.emit(StorageEvent::FileReady {
            slot,
            filename,
            session_id,
            size: summary.size,
            sha3: summary.sha3,
            path,
        });
    }

    async fn read(&mut self, slot: SlotKind, filename: String, session_id: Option<SessionId>) {
        let found = self
            .completed
            .get(&slot)
            .filter(|c| c.filename == filename && session_id.is_none_or(|sid| sid == c.session_id))
            .map(|c| c.path.clone());
        let result = match found {
            Some(path) => slot_file::read_all(&path).await,
            None => Err(anyhow::anyhow!("no completed resource for {filename} in {slot}")),
        };
        match result {
            Ok(bytes) => self.emit(StorageEvent::ReadComplete {
                slot,
                filename,
                session_id,
                bytes,
            }),
            Err(e) => self.emit(StorageEvent::Error {
                slot,
                filename: Some(filename),
                session_id,
                kind: StorageErrorKind::Io,
                message: e.to_string(),
            }),
        }
    }

    async fn close_slot(&mut self, slot: SlotKind) {
        if let Some(file) = self.locks.release(slot)
            && let Err(e) = file.close().await
        {
            warn!(event = "slot_close_failed", slot = %slot, error = %e, "Closing slot handle failed");
        }
    }

    async fn cleanup(&mut self, slot: SlotKind) {
        self.close_slot(slot).await;
        self.last_mismatch.remove(&slot);
        self.completed.remove(&slot);

        let removed = match remove_instance_resources(&self.root, slot, &self.instance_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(event = "slot_cleanup_failed", slot = %slot, error = %e, "Cleanup failed");
                self.emit(StorageEvent::Error {
                    slot,
                    filename: None,
                    session_id: None,
                    kind: StorageErrorKind::Io,
                    message: e.to_string(),
                });
                return;
            }
        };
        debug!(event = "slot_cleaned", slot = %slot, removed, "Slot resources removed");
    }
}

/// Delete every `{prefix}_*_{instance}` file under `root`.
async fn remove_instance_resources(root: &Path, slot: SlotKind, instance_id: &str) -> anyhow::Result<usize> {
    let mut dir = match tokio::fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let prefix = format!("{}_", slot.prefix());
    let suffix = format!("_{instance_id}");
    let mut removed = 0;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix) && name.ends_with(&suffix) {
            slot_file::remove(&entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}
