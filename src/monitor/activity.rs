//! Per-worker activity classification.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use walkdir::WalkDir;

use crate::clock::elapsed;
use crate::config::ActivityConfig;
use crate::worker::{ActivityLevel, Worker, WorkerId};
use crate::wlog_trace;

/// How deep below a worker's side-channel directory mtimes are scanned.
const SCAN_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub normal: Duration,
    pub warn: Duration,
    pub stall: Duration,
}

impl From<&ActivityConfig> for Thresholds {
    fn from(cfg: &ActivityConfig) -> Self {
        Self {
            normal: Duration::from_secs(cfg.normal_secs),
            warn: Duration::from_secs(cfg.warn_secs),
            stall: Duration::from_secs(cfg.stall_secs),
        }
    }
}

impl Thresholds {
    pub fn classify(&self, idle: Duration) -> ActivityLevel {
        if idle < self.normal {
            ActivityLevel::Active
        } else if idle < self.warn {
            ActivityLevel::Idle
        } else if idle < self.stall {
            ActivityLevel::Warn
        } else {
            ActivityLevel::Stall
        }
    }
}

/// Level before and after one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelChange {
    pub previous: ActivityLevel,
    pub current: ActivityLevel,
}

impl LevelChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }

    /// True when this observation crossed into `level`.
    pub fn entered(&self, level: ActivityLevel) -> bool {
        self.current == level && self.previous != level
    }

    /// True when the worker came back from warn or stall.
    pub fn recovered(&self) -> bool {
        self.previous >= ActivityLevel::Warn && self.current < ActivityLevel::Warn
    }
}

/// Classifies workers by time since their last observed activity.
///
/// Activity comes from two places: routed envelopes (recorded by the
/// scheduler) and file modification times under
/// `<side_channel_root>/<worker>/`, scanned here.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    thresholds: Thresholds,
    grace: Duration,
    side_channel_root: PathBuf,
}

impl ActivityMonitor {
    pub fn new(config: &ActivityConfig, side_channel_root: PathBuf) -> Self {
        Self {
            thresholds: Thresholds::from(config),
            grace: Duration::from_secs(config.onboarding_grace_secs),
            side_channel_root,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn worker_dir(&self, id: &WorkerId) -> PathBuf {
        self.side_channel_root.join(id.as_str())
    }

    /// Onboarding started recently and has not completed.
    pub fn in_grace(&self, worker: &Worker, now: DateTime<Utc>) -> bool {
        !worker.onboarded && elapsed(worker.onboarding_started_at, now) < self.grace
    }

    /// Warn and stall are withheld while a worker is in onboarding grace.
    pub fn classify(&self, worker: &Worker, now: DateTime<Utc>) -> ActivityLevel {
        let level = self.thresholds.classify(worker.idle(now));
        if self.in_grace(worker, now) {
            level.min(ActivityLevel::Idle)
        } else {
            level
        }
    }

    /// Newest file mtime under the worker's side-channel directory.
    pub fn latest_change(&self, id: &WorkerId) -> Option<DateTime<Utc>> {
        let dir = self.worker_dir(id);
        if !dir.exists() {
            return None;
        }
        WalkDir::new(&dir)
            .max_depth(SCAN_DEPTH)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok()?.modified().ok())
            .map(DateTime::<Utc>::from)
            .max()
    }

    /// Pull side-channel mtimes into `last_activity`. True if it moved.
    ///
    /// Mtimes are wall-clock values and may run ahead of `now`. Such a change
    /// is recorded at `now`, once; only a newer mtime counts again.
    pub fn refresh(&self, worker: &mut Worker, now: DateTime<Utc>) -> bool {
        let Some(mtime) = self.latest_change(&worker.id) else {
            return false;
        };
        if worker.side_channel_mtime == Some(mtime) {
            return false;
        }
        worker.side_channel_mtime = Some(mtime);
        let at = mtime.min(now);
        let moved = worker.record_activity(at);
        if moved {
            wlog_trace!("ActivityMonitor: {} side channel changed at {}", worker.id, at);
        }
        moved
    }

    /// Classify `worker` at `now` and store the level on it.
    pub fn observe(&self, worker: &mut Worker, now: DateTime<Utc>) -> LevelChange {
        let previous = worker.level;
        let current = self.classify(worker, now);
        worker.level = current;
        LevelChange { previous, current }
    }
}
