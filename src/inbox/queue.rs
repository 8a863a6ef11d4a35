//! Consumer side of a destination's queue directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{wlog_warn, Result};

use super::envelope::Envelope;

pub const ARCHIVE_DIR: &str = "archive";
pub const REJECTED_DIR: &str = "rejected";

/// One destination's directory of envelope files.
///
/// Consumed files move to `archive/`; unreadable ones to `rejected/`.
/// Nothing is ever deleted.
#[derive(Debug, Clone)]
pub struct QueueDir {
    dir: PathBuf,
}

impl QueueDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Envelope files waiting, oldest first (names sort by timestamp).
    pub fn pending(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| !n.to_string_lossy().starts_with('.'))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    pub fn read(path: &Path) -> Result<Envelope> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn archive(&self, path: &Path) -> Result<PathBuf> {
        self.move_into(path, ARCHIVE_DIR)
    }

    pub fn reject(&self, path: &Path) -> Result<PathBuf> {
        wlog_warn!("QueueDir: rejecting unreadable envelope {}", path.display());
        self.move_into(path, REJECTED_DIR)
    }

    fn move_into(&self, path: &Path, sub: &str) -> Result<PathBuf> {
        let target_dir = self.dir.join(sub);
        fs::create_dir_all(&target_dir)?;
        let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        let target = target_dir.join(name);
        fs::rename(path, &target)?;
        Ok(target)
    }
}
