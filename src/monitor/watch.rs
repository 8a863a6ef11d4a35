//! Filesystem watcher over the side-channel root.
//!
//! Mtime scans run once per monitor pass; the watcher reports changes as
//! they happen so activity is not lost between passes.

use chrono::{DateTime, Utc};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::worker::WorkerId;
use crate::{wlog_debug, Result};

const DEBOUNCE: Duration = Duration::from_secs(1);

/// A change observed under one worker's side-channel directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivitySignal {
    pub worker: WorkerId,
    pub at: DateTime<Utc>,
}

/// Keeps the underlying watcher alive; dropping it stops watching.
pub struct SideChannelWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl SideChannelWatcher {
    pub fn start(root: &Path, tx: mpsc::UnboundedSender<ActivitySignal>) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let roots = vec![
            root.to_path_buf(),
            std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf()),
        ];
        let last_sent: Mutex<HashMap<WorkerId, Instant>> = Mutex::new(HashMap::new());

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Ok(event) = res else {
                    return;
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                for path in &event.paths {
                    let Some(worker) = worker_for(&roots, path) else {
                        continue;
                    };
                    let now = Instant::now();
                    let mut sent = last_sent.lock().unwrap_or_else(|e| e.into_inner());
                    if sent
                        .get(&worker)
                        .is_some_and(|last| now.duration_since(*last) < DEBOUNCE)
                    {
                        continue;
                    }
                    sent.insert(worker.clone(), now);
                    let _ = tx.send(ActivitySignal {
                        worker,
                        at: Utc::now(),
                    });
                }
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        wlog_debug!("SideChannelWatcher: watching {}", root.display());

        Ok(Self {
            _watcher: watcher,
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// The worker whose directory contains `path`: the first component below a root.
fn worker_for(roots: &[PathBuf], path: &Path) -> Option<WorkerId> {
    roots.iter().find_map(|root| {
        let rel = path.strip_prefix(root).ok()?;
        let first = rel.components().next()?;
        // A change to the root entry itself names a worker dir, not a file in it.
        if rel.components().count() < 2 {
            return None;
        }
        Some(WorkerId::new(&first.as_os_str().to_string_lossy()))
    })
}
