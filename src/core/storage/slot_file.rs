//! Positional writer for one slot file.
//!
//! Chunks land at `index * chunk_size`, so out-of-order and re-sent chunks
//! overwrite in place. The file is sparse until every region is written.

use anyhow::{Context, Result};
use sha3::{Digest, Sha3_256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::core::config::HASH_READ_BUFFER;

/// Open write handle for a slot resource.
#[derive(Debug)]
pub struct SlotFile {
    file: fs::File,
    path: PathBuf,
}

/// Size and digest of a completed slot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSummary {
    pub size: u64,
    /// Lowercase hex SHA3-256 of the whole file.
    pub sha3: String,
}

impl SlotFile {
    /// Create (or truncate) the file at `path`.
    pub async fn create(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .with_context(|| format!("open slot file {}", path.display()))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `data` at `index * chunk_size`.
    pub async fn write_chunk(&mut self, index: u32, chunk_size: usize, data: &[u8]) -> Result<()> {
        let offset = index as u64 * chunk_size as u64;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }

    /// Flush, sync and measure the file, then hash it from disk.
    pub async fn summarize(&mut self) -> Result<SlotSummary> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        let size = self.file.metadata().await?.len();

        self.file.seek(SeekFrom::Start(0)).await?;
        let mut hasher = Sha3_256::new();
        let mut buf = vec![0u8; HASH_READ_BUFFER];
        loop {
            let n = self.file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(SlotSummary {
            size,
            sha3: hex::encode(hasher.finalize()),
        })
    }

    /// Flush and drop the handle.
    pub async fn close(mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}

/// Read a whole slot file.
pub async fn read_all(path: &Path) -> Result<Vec<u8>> {
    fs::read(path)
        .await
        .with_context(|| format!("read slot file {}", path.display()))
}

/// Remove a slot file; a missing file is not an error.
pub async fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove slot file {}", path.display())),
    }
}
