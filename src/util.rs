//! Shared helpers: bounded blocking calls and atomic file writes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Run blocking work on the blocking pool, giving up after `duration`.
///
/// The closure keeps running on its thread after a timeout; only the
/// caller stops waiting.
pub async fn blocking_with_timeout<F, T>(duration: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(duration, spawn_blocking(f)).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Write `contents` to `path` via a hidden sibling temp file and a rename,
/// so readers never observe a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("no parent dir for {}", path.display())))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::Validation(format!("no file name in {}", path.display())))?;
    let temp_path = dir.join(format!(".{}.tmp", name.to_string_lossy()));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Like [`write_atomic`], keeping the previous contents at `<path>.bak`.
/// The backup is written atomically too, so it is never half a file.
pub fn write_atomic_with_backup(path: &Path, contents: &[u8]) -> Result<()> {
    if path.exists() {
        let mut backup = path.as_os_str().to_owned();
        backup.push(".bak");
        write_atomic(Path::new(&backup), &fs::read(path)?)?;
    }
    write_atomic(path, contents)
}

/// Truncate `s` to at most `max` characters, on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
