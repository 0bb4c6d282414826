//! Atomic file writes for the shared file bus.
//!
//! Readers in other processes must never observe a half-written file, so
//! every write goes to a uniquely named sibling temp file first and is then
//! moved into place in a single filesystem operation.

use std::io;
use std::path::{Path, PathBuf};

fn temp_sibling(path: &Path) -> io::Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(parent.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4())))
}

/// Write `contents` to `path`, replacing any existing file atomically.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_sibling(path)?;
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Write `contents` to `path` atomically, failing with `AlreadyExists`
/// if the destination is already present. The final link is created with
/// `hard_link`, which refuses to replace an existing entry.
pub async fn write_atomic_new(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_sibling(path)?;
    tokio::fs::write(&tmp, contents).await?;
    let linked = tokio::fs::hard_link(&tmp, path).await;
    let _ = tokio::fs::remove_file(&tmp).await;
    linked
}

/// Blocking variant of [`write_atomic`] for synchronous call sites.
pub fn write_atomic_blocking(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path)?;
    std::fs::write(&tmp, contents)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
