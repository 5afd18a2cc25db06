//! Sender side: stream a file as `transfer-*` messages.
//!
//! The bytes come from a playlist file on disk (host) or from a completed
//! slot read back through the storage worker (relay). A reader task
//! prefetches chunks into a bounded channel while the send loop encodes and
//! queues them on the link:
//!
//! ```text
//! ┌──────────┐  bounded chan  ┌──────────────────────┐
//! │ DiskRead │ ──────────────►│ send loop            │──► PeerLink
//! │ (sha3)   │                │ (transfer-write ...) │
//! └──────────┘                └──────────────────────┘
//! ```
//!
//! Resumption sends `transfer-start` again with the same session id (the
//! receiver treats it as re-entry) and then only chunks from `start_chunk` on.
//! The reader still hashes the skipped prefix so `transfer-end` always carries
//! the whole-file digest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sha3::{Digest, Sha3_256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::chunk::chunk_count;
use crate::core::config::{CHUNK_SIZE, SENDER_READ_AHEAD_CHUNKS, SENDER_YIELD_EVERY};
use crate::core::connection::PeerLink;
use crate::core::protocol::ProtocolMessage;
use crate::core::session_id::SessionId;
use crate::core::storage::SlotKind;

// ── Reader ───────────────────────────────────────────────────────────────────

/// A chunk read from disk.
pub struct ReadChunk {
    pub index: u32,
    pub data: Vec<u8>,
}

/// Whole-file digest produced once the reader reaches the end.
pub struct ReaderResult {
    pub sha3: String,
}

/// Where outgoing bytes come from.
#[derive(Debug, Clone)]
pub enum Source {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl Source {
    fn describe(&self) -> String {
        match self {
            Source::File(path) => path.display().to_string(),
            Source::Memory(bytes) => format!("{} bytes in memory", bytes.len()),
        }
    }
}

/// Spawn a reader prefetching chunks `start_chunk..` into a bounded channel.
/// Earlier chunks are read and hashed but not queued.
pub fn spawn_reader(
    source: Source,
    size: u64,
    chunk_size: usize,
    start_chunk: u32,
) -> (mpsc::Receiver<ReadChunk>, tokio::task::JoinHandle<Result<ReaderResult>>) {
    let (tx, rx) = mpsc::channel(SENDER_READ_AHEAD_CHUNKS);

    let handle = tokio::spawn(async move {
        let mut file = match &source {
            Source::File(path) => Some(
                tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("open {}", path.display()))?,
            ),
            Source::Memory(_) => None,
        };
        let mut hasher = Sha3_256::new();
        let total = chunk_count(size, chunk_size);

        for index in 0..total {
            let offset = index as u64 * chunk_size as u64;
            let len = (chunk_size as u64).min(size.saturating_sub(offset)) as usize;
            let data = match (&source, file.as_mut()) {
                (Source::Memory(bytes), _) => {
                    let start = offset as usize;
                    bytes
                        .get(start..start + len)
                        .ok_or_else(|| anyhow!("chunk {index} past the end of the buffer"))?
                        .to_vec()
                }
                (Source::File(_), Some(file)) => {
                    file.seek(SeekFrom::Start(offset)).await?;
                    let mut data = vec![0u8; len];
                    file.read_exact(&mut data).await?;
                    data
                }
                (Source::File(_), None) => return Err(anyhow!("file source was not opened")),
            };
            hasher.update(&data);

            if index >= start_chunk && tx.send(ReadChunk { index, data }).await.is_err() {
                return Err(anyhow!("send loop stopped at chunk {index}"));
            }
        }

        Ok(ReaderResult {
            sha3: hex::encode(hasher.finalize()),
        })
    });

    (rx, handle)
}

// ── Outgoing transfer ────────────────────────────────────────────────────────

/// Everything needed to push one file into one remote slot.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub source: Source,
    pub filename: String,
    pub size: u64,
    pub chunk_size: usize,
    pub slot: SlotKind,
    pub session_id: SessionId,
    pub track_index: Option<u32>,
    pub generation: Option<u64>,
}

impl OutgoingFile {
    /// Describe `path` for sending under `session_id`.
    pub async fn from_path(path: &Path, slot: SlotKind, session_id: SessionId) -> Result<Self> {
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?
            .to_string();
        Ok(Self {
            source: Source::File(path.to_path_buf()),
            filename,
            size: meta.len(),
            chunk_size: CHUNK_SIZE,
            slot,
            session_id,
            track_index: None,
            generation: None,
        })
    }

    /// Describe bytes already in memory for sending as `filename`.
    pub fn from_bytes(filename: impl Into<String>, bytes: Arc<[u8]>, slot: SlotKind, session_id: SessionId) -> Self {
        Self {
            size: bytes.len() as u64,
            source: Source::Memory(bytes),
            filename: filename.into(),
            chunk_size: CHUNK_SIZE,
            slot,
            session_id,
            track_index: None,
            generation: None,
        }
    }

    pub fn with_track(mut self, track_index: u32, generation: u64) -> Self {
        self.track_index = Some(track_index);
        self.generation = Some(generation);
        self
    }

    /// Override the name announced to the receiver.
    pub fn named(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn total_chunks(&self) -> u32 {
        chunk_count(self.size, self.chunk_size)
    }
}

/// Stream `file` over `link`, starting at `start_chunk`. Returns the number
/// of chunks sent.
pub async fn send_file(link: &PeerLink, file: &OutgoingFile, start_chunk: u32) -> Result<u32> {
    link.send(&ProtocolMessage::TransferStart {
        filename: file.filename.clone(),
        session_id: file.session_id,
        chunk_size: file.chunk_size as u32,
        total_size: Some(file.size),
        slot: file.slot,
        track_index: file.track_index,
        generation: file.generation,
    })?;

    let (mut chunks, reader) = spawn_reader(file.source.clone(), file.size, file.chunk_size, start_chunk);
    let mut sent = 0u32;
    while let Some(chunk) = chunks.recv().await {
        let msg = ProtocolMessage::TransferWrite {
            filename: file.filename.clone(),
            session_id: file.session_id,
            index: chunk.index,
            bytes: chunk.data,
            slot: file.slot,
        };
        if let Err(e) = link.send(&msg) {
            drop(chunks);
            let _ = reader.await;
            return Err(e.into());
        }
        sent += 1;
        if sent % SENDER_YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }

    let digest = reader.await.context("reader task panicked")??;
    link.send(&ProtocolMessage::TransferEnd {
        filename: file.filename.clone(),
        session_id: file.session_id,
        total_size: Some(file.size),
        sha3: Some(digest.sha3),
        slot: file.slot,
    })?;

    debug!(
        event = "transfer_sent",
        link = %link.id(),
        filename = %file.filename,
        slot = %file.slot,
        session_id = file.session_id,
        start_chunk,
        sent,
        "Transfer queued"
    );
    Ok(sent)
}

/// Where a background push should go and what it carries.
#[derive(Debug, Clone)]
pub struct Push {
    pub source: Source,
    /// Name announced to the receiver. Defaults to the file name of a file
    /// source; required for memory sources.
    pub filename: Option<String>,
    pub slot: SlotKind,
    pub session_id: SessionId,
    pub track: Option<(u32, u64)>,
    pub start_chunk: u32,
}

/// Describe and stream `push` on `link` in the background, logging the
/// outcome.
pub fn spawn_push(link: PeerLink, push: Push) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let result = async {
            let mut file = match (&push.source, &push.filename) {
                (Source::File(path), _) => OutgoingFile::from_path(path, push.slot, push.session_id).await?,
                (Source::Memory(bytes), Some(name)) => {
                    OutgoingFile::from_bytes(name.clone(), bytes.clone(), push.slot, push.session_id)
                }
                (Source::Memory(_), None) => return Err(anyhow!("an in-memory push needs a file name")),
            };
            if let Some(name) = &push.filename {
                file = file.named(name.clone());
            }
            if let Some((index, generation)) = push.track {
                file = file.with_track(index, generation);
            }
            let sent = send_file(&link, &file, push.start_chunk).await?;
            anyhow::Ok((file.filename, sent))
        }
        .await;

        match result {
            Ok((filename, sent)) => info!(
                event = "transfer_pushed",
                link = %link.id(),
                filename = %filename,
                slot = %push.slot,
                session_id = push.session_id,
                chunks = sent,
                "File pushed"
            ),
            Err(e) => warn!(
                event = "transfer_push_failed",
                link = %link.id(),
                source = %push.source.describe(),
                slot = %push.slot,
                error = %e,
                "File push failed"
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::LinkId;
    use crate::core::protocol::Envelope;

    fn test_file(name: &str, data: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lockstep-sender-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ProtocolMessage> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(Envelope::parse(&text).unwrap().decode().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn reader_produces_all_chunks_and_digest() {
        let data = vec![0xABu8; CHUNK_SIZE * 3 + 100];
        let path = test_file("all.bin", &data);

        let (mut rx, handle) = spawn_reader(Source::File(path.clone()), data.len() as u64, CHUNK_SIZE, 0);
        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            received.push(chunk);
        }
        let digest = handle.await.unwrap().unwrap();

        assert_eq!(received.len(), 4);
        assert_eq!(received[3].index, 3);
        assert_eq!(received[3].data.len(), 100);
        assert_eq!(digest.sha3, hex::encode(Sha3_256::digest(&data)));
        cleanup(&path);
    }

    #[tokio::test]
    async fn resume_sends_start_then_tail_then_end() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 4).map(|i| (i % 256) as u8).collect();
        let path = test_file("resume.mp3", &data);
        let file = OutgoingFile::from_path(&path, SlotKind::Current, 1001).await.unwrap();
        assert_eq!(file.filename, "resume.mp3");
        assert_eq!(file.total_chunks(), 4);

        let (link, mut rx) = PeerLink::new(LinkId(1), None);
        let sent = send_file(&link, &file, 2).await.unwrap();
        assert_eq!(sent, 2);

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 4);
        assert!(matches!(msgs[0], ProtocolMessage::TransferStart { session_id: 1001, total_size: Some(65536), .. }));
        assert!(matches!(msgs[1], ProtocolMessage::TransferWrite { index: 2, .. }));
        assert!(matches!(msgs[2], ProtocolMessage::TransferWrite { index: 3, .. }));
        match &msgs[3] {
            ProtocolMessage::TransferEnd { sha3, total_size, .. } => {
                assert_eq!(*total_size, Some(65536));
                assert_eq!(sha3.as_deref(), Some(hex::encode(Sha3_256::digest(&data)).as_str()));
            }
            other => panic!("unexpected {other:?}"),
        }
        cleanup(&path);
    }

    #[tokio::test]
    async fn closed_link_fails_the_send() {
        let path = test_file("x.bin", &[1u8; 10]);
        let file = OutgoingFile::from_path(&path, SlotKind::Preload, 3).await.unwrap();
        let (link, _rx) = PeerLink::new(LinkId(1), None);
        link.close();
        assert!(send_file(&link, &file, 0).await.is_err());
        cleanup(&path);
    }

    #[tokio::test]
    async fn push_announces_override_name_and_track() {
        let path = test_file("preload_b.mp3_inst", &[7u8; 20]);
        let (link, mut rx) = PeerLink::new(LinkId(1), None);
        spawn_push(
            link,
            Push {
                source: Source::File(path.clone()),
                filename: Some("b.mp3".into()),
                slot: SlotKind::Preload,
                session_id: 9,
                track: Some((1, 2)),
                start_chunk: 0,
            },
        )
        .await
        .unwrap();

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 3);
        match &msgs[0] {
            ProtocolMessage::TransferStart {
                filename,
                track_index,
                generation,
                slot,
                ..
            } => {
                assert_eq!(filename, "b.mp3");
                assert_eq!((*track_index, *generation), (Some(1), Some(2)));
                assert_eq!(*slot, SlotKind::Preload);
            }
            other => panic!("unexpected {other:?}"),
        }
        cleanup(&path);
    }

    #[tokio::test]
    async fn memory_source_streams_tail_with_whole_digest() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 9).map(|i| (i % 251) as u8).collect();
        let (link, mut rx) = PeerLink::new(LinkId(1), None);
        spawn_push(
            link,
            Push {
                source: Source::Memory(Arc::from(data.clone())),
                filename: Some("c.mp3".into()),
                slot: SlotKind::Current,
                session_id: 12,
                track: None,
                start_chunk: 1,
            },
        )
        .await
        .unwrap();

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 4);
        assert!(matches!(&msgs[0], ProtocolMessage::TransferStart { filename, total_size: Some(t), .. } if filename == "c.mp3" && *t == data.len() as u64));
        match &msgs[2] {
            ProtocolMessage::TransferWrite { index, bytes, .. } => {
                assert_eq!(*index, 2);
                assert_eq!(bytes.as_slice(), &data[CHUNK_SIZE * 2..]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &msgs[3] {
            ProtocolMessage::TransferEnd { sha3, .. } => {
                assert_eq!(sha3.as_deref(), Some(hex::encode(Sha3_256::digest(&data)).as_str()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unnamed_memory_push_sends_nothing() {
        let (link, mut rx) = PeerLink::new(LinkId(1), None);
        spawn_push(
            link,
            Push {
                source: Source::Memory(Arc::from(vec![1u8; 4])),
                filename: None,
                slot: SlotKind::Current,
                session_id: 1,
                track: None,
                start_chunk: 0,
            },
        )
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
