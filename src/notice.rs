//! Operator-facing status lines.
//!
//! Each notice renders as one plain line. Sinks decide where it goes: the
//! log, and an append-only `notices.log` that an external notifier can tail.

use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::monitor::Tier;
use crate::worker::WorkerId;
use crate::{wlog, wlog_warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    EscalationFired {
        worker: WorkerId,
        tier: Tier,
        idle_secs: u64,
    },
    TaskCompleted {
        task_id: String,
        owner: WorkerId,
        commit_ref: Option<String>,
    },
    WorkerStalled {
        worker: WorkerId,
        idle_secs: u64,
    },
    WorkerRecovered {
        worker: WorkerId,
    },
    SourceDegraded {
        worker: WorkerId,
        source: String,
        empty_polls: u32,
    },
    SourceRecovered {
        worker: WorkerId,
        source: String,
    },
    DeliveryFailed {
        from: WorkerId,
        destination: String,
        reason: String,
    },
    DeliveryDropped {
        from: WorkerId,
        destination: String,
        envelope_id: Uuid,
        reason: String,
    },
    InstructionFailed {
        worker: WorkerId,
        tag: String,
        reason: String,
    },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::EscalationFired {
                worker,
                tier,
                idle_secs,
            } => write!(f, "escalation: {} {} after {}s idle", worker, tier, idle_secs),
            Notice::TaskCompleted {
                task_id,
                owner,
                commit_ref,
            } => match commit_ref {
                Some(commit) => write!(f, "task completed: {} by {} ({})", task_id, owner, commit),
                None => write!(f, "task completed: {} by {}", task_id, owner),
            },
            Notice::WorkerStalled { worker, idle_secs } => {
                write!(f, "worker stalled: {} silent for {}s", worker, idle_secs)
            }
            Notice::WorkerRecovered { worker } => write!(f, "worker recovered: {}", worker),
            Notice::SourceDegraded {
                worker,
                source,
                empty_polls,
            } => write!(
                f,
                "source degraded: {} {} unreachable for {} polls",
                worker, source, empty_polls
            ),
            Notice::SourceRecovered { worker, source } => {
                write!(f, "source recovered: {} {}", worker, source)
            }
            Notice::DeliveryFailed {
                from,
                destination,
                reason,
            } => write!(
                f,
                "delivery failed: {} -> {}: {}",
                from, destination, reason
            ),
            Notice::DeliveryDropped {
                from,
                destination,
                envelope_id,
                reason,
            } => write!(
                f,
                "delivery dropped: {} -> {} envelope {}: {}",
                from, destination, envelope_id, reason
            ),
            Notice::InstructionFailed {
                worker,
                tag,
                reason,
            } => write!(f, "instruction failed: {} [{}]: {}", worker, tag, reason),
        }
    }
}

pub trait NoticeSink: Send + Sync {
    fn emit(&self, notice: &Notice);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NoticeSink for LogSink {
    fn emit(&self, notice: &Notice) {
        wlog!("notice: {}", notice);
    }
}

/// Appends `<rfc3339> <line>` per notice.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), line)
    }
}

impl NoticeSink for FileSink {
    fn emit(&self, notice: &Notice) {
        if let Err(e) = self.append(&notice.to_string()) {
            wlog_warn!("notice sink {}: {}", self.path.display(), e);
        }
    }
}

/// Fan-out to every registered sink.
#[derive(Clone, Default)]
pub struct Notices {
    sinks: Vec<Arc<dyn NoticeSink>>,
}

impl Notices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log plus `notices.log` at `path`.
    pub fn standard(path: PathBuf) -> Self {
        Self::new()
            .with_sink(Arc::new(LogSink))
            .with_sink(Arc::new(FileSink::new(path)))
    }

    pub fn with_sink(mut self, sink: Arc<dyn NoticeSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn emit(&self, notice: Notice) {
        for sink in &self.sinks {
            sink.emit(&notice);
        }
    }
}
