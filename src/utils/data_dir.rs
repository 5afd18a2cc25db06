//! Process data directory (logs, slot storage, peer registry).
//!
//! Defaults to `~/.lockstep/`, overridable with `--conf`. Set once at startup
//! via [`init`].

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Resolve and create the data directory. Fails if called twice or if no
/// home directory can be found when `custom` is absent.
pub fn init(custom: Option<&Path>) -> Result<&'static Path> {
    let dir = match custom {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow!("no home directory; pass --conf"))?
            .join(".lockstep"),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir {}", dir.display()))?;
    DATA_DIR
        .set(dir)
        .map_err(|_| anyhow!("data directory already initialized"))?;
    get()
}

pub fn get() -> Result<&'static Path> {
    DATA_DIR
        .get()
        .map(PathBuf::as_path)
        .ok_or_else(|| anyhow!("data directory not initialized"))
}

/// Directory holding slot resources.
pub fn storage_dir(root: &Path) -> PathBuf {
    root.join("storage")
}

/// Directory holding the log file.
pub fn logs_dir(root: &Path) -> PathBuf {
    root.join("logs")
}
