//! Write-to-temp-then-rename for small persisted state files.
//!
//! The temp file sits next to the target (`<name>.tmp`) so the rename never
//! crosses a mount. A failed rename removes the temp file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::error;

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Atomically replace `path` with `content`, creating parent directories.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }

    let tmp = temp_path(path);
    if let Err(e) = std::fs::write(&tmp, content) {
        error!(
            event = "atomic_write_failure",
            path = %tmp.display(),
            error = %e,
            "Failed to write temp file"
        );
        return Err(e.into());
    }

    if let Err(e) = std::fs::rename(&tmp, path) {
        error!(
            event = "atomic_rename_failure",
            from = %tmp.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("lockstep-atomic-{}", uuid::Uuid::new_v4().simple()))
    }

    #[test]
    fn overwrites_and_leaves_no_temp() {
        let dir = scratch();
        let path = dir.join("nested").join("peers.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!temp_path(&path).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
