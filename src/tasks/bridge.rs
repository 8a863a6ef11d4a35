//! Task-state bridge: applies envelopes to the task book.
//!
//! Transitions:
//!
//! ```text
//! new ──any──> in_progress ──status=blocked──> blocked
//!                  │   ^                          │
//!                  │   └──────status≠blocked──────┘
//!                  └──status=done ∧ criteria──> completed (terminal)
//! ```
//!
//! A task enters `in_progress` and then has the same envelope's status
//! applied, so a first envelope can move a task straight to `blocked` or
//! `completed`. Reaching `completed` queues exactly one
//! [`VerificationEvent`]; the state check before the transition is what
//! makes it at-most-once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::CompletionConfig;
use crate::inbox::{Envelope, EnvelopeType, QueueDir, TaskSignal};
use crate::util::write_atomic_with_backup;
use crate::worker::WorkerId;
use crate::{wlog, wlog_debug, wlog_warn, Result};

use super::criteria::{criteria_for, CompletionCriteria, EvidenceMarkers};
use super::{Task, TaskState};

pub const TASK_BOOK_VERSION: u32 = 1;

pub type SharedBridge = Arc<RwLock<TaskBridge>>;

/// Emitted once when a task's evidence proves it done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationEvent {
    pub task_id: String,
    pub owner: WorkerId,
    pub verified_at: DateTime<Utc>,
    pub commit_ref: Option<String>,
    pub envelope_id: Uuid,
}

/// What applying one envelope did to its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub task_id: String,
    pub transitions: Vec<(TaskState, TaskState)>,
    pub verification: Option<VerificationEvent>,
    /// Status said done but the evidence was not sufficient.
    pub unverified_claim: bool,
    /// Sender is not the task's owner; evidence kept, no transition.
    pub foreign: bool,
}

impl Applied {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            transitions: Vec::new(),
            verification: None,
            unverified_claim: false,
            foreign: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Accepted without touching any task.
    NoOp { reason: String },
    Applied(Applied),
}

impl BridgeOutcome {
    fn noop(reason: &str) -> Self {
        BridgeOutcome::NoOp {
            reason: reason.to_string(),
        }
    }

    pub fn verification(&self) -> Option<&VerificationEvent> {
        match self {
            BridgeOutcome::Applied(a) => a.verification.as_ref(),
            BridgeOutcome::NoOp { .. } => None,
        }
    }

    pub fn transitions(&self) -> &[(TaskState, TaskState)] {
        match self {
            BridgeOutcome::Applied(a) => &a.transitions,
            BridgeOutcome::NoOp { .. } => &[],
        }
    }
}

/// Persisted task history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBook {
    pub version: u32,
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
}

impl Default for TaskBook {
    fn default() -> Self {
        Self {
            version: TASK_BOOK_VERSION,
            tasks: BTreeMap::new(),
        }
    }
}

impl TaskBook {
    /// Load from `path`, falling back to `<path>.bak` if the file is corrupt.
    pub fn load(path: &Path) -> Result<Self> {
        wlog_debug!("TaskBook::load path={}", path.display());
        if !path.exists() {
            return Ok(Self::default());
        }
        match Self::read(path) {
            Ok(book) => Ok(book),
            Err(e) => {
                let mut backup = path.as_os_str().to_owned();
                backup.push(".bak");
                let backup = Path::new(&backup);
                wlog_warn!(
                    "TaskBook: {} unreadable ({}), trying {}",
                    path.display(),
                    e,
                    backup.display()
                );
                if backup.exists() {
                    Self::read(backup)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        write_atomic_with_backup(path, &serde_json::to_vec_pretty(self)?)?;
        wlog_debug!("TaskBook saved: {} tasks", self.tasks.len());
        Ok(())
    }
}

pub struct TaskBridge {
    book: TaskBook,
    markers: EvidenceMarkers,
    criteria: Box<dyn CompletionCriteria>,
    outbox: Vec<VerificationEvent>,
    verified_total: u64,
}

impl TaskBridge {
    pub fn new(config: &CompletionConfig) -> Self {
        Self::with_criteria(
            EvidenceMarkers::from_config(config),
            criteria_for(config),
        )
    }

    pub fn with_criteria(markers: EvidenceMarkers, criteria: Box<dyn CompletionCriteria>) -> Self {
        Self {
            book: TaskBook::default(),
            markers,
            criteria,
            outbox: Vec::new(),
            verified_total: 0,
        }
    }

    pub fn with_book(mut self, book: TaskBook) -> Self {
        self.book = book;
        self
    }

    pub fn shared(self) -> SharedBridge {
        Arc::new(RwLock::new(self))
    }

    pub fn book(&self) -> &TaskBook {
        &self.book
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.book.tasks.get(id)
    }

    pub fn verified_total(&self) -> u64 {
        self.verified_total
    }

    /// Task count per state name.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = TaskState::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for task in self.book.tasks.values() {
            *counts.entry(task.state.as_str().to_string()).or_default() += 1;
        }
        counts
    }

    /// Verification events not yet handed downstream.
    pub fn take_verifications(&mut self) -> Vec<VerificationEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub fn apply(&mut self, envelope: &Envelope) -> BridgeOutcome {
        let Some(task_id) = envelope.task_id.clone() else {
            wlog_debug!(
                "TaskBridge: {} envelope {} names no task; no-op",
                envelope.kind.as_str(),
                envelope.id
            );
            return BridgeOutcome::noop("no task id");
        };
        let mut evidence = self.markers.evidence_for(envelope);

        if envelope.kind != EnvelopeType::TaskUpdate {
            let Some(task) = self.book.tasks.get_mut(&task_id) else {
                wlog_debug!(
                    "TaskBridge: {} envelope for unknown task '{}'; no-op",
                    envelope.kind.as_str(),
                    task_id
                );
                return BridgeOutcome::noop("non-lifecycle envelope for unknown task");
            };
            if task.evidence.iter().any(|e| e.envelope_id == envelope.id) {
                return BridgeOutcome::noop("envelope already applied");
            }
            task.append_evidence(evidence);
            return BridgeOutcome::Applied(Applied::new(&task_id));
        }

        let task = self
            .book
            .tasks
            .entry(task_id.clone())
            .or_insert_with(|| Task::new(&task_id, &envelope.from, envelope.timestamp));
        if task.evidence.iter().any(|e| e.envelope_id == envelope.id) {
            return BridgeOutcome::noop("envelope already applied");
        }
        if self.markers.done_is_passing()
            && evidence.commit_ref.is_none()
            && task.owner == envelope.from
            && envelope.signal() == TaskSignal::Done
        {
            // A done report confirms the owner's last reported commit.
            evidence.commit_ref = task
                .evidence
                .iter()
                .rev()
                .filter(|e| e.from == task.owner)
                .find_map(|e| e.commit_ref.clone());
        }
        task.append_evidence(evidence);

        let mut applied = Applied::new(&task_id);
        if task.owner != envelope.from {
            wlog_warn!(
                "TaskBridge: {} reported on '{}' owned by {}; evidence kept, state unchanged",
                envelope.from,
                task_id,
                task.owner
            );
            applied.foreign = true;
            return BridgeOutcome::Applied(applied);
        }
        if task.state.is_terminal() {
            wlog_debug!("TaskBridge: '{}' already completed", task_id);
            return BridgeOutcome::Applied(applied);
        }

        let at = envelope.timestamp;
        let signal = envelope.signal();
        let mut step = |task: &mut Task, next: TaskState| {
            let from = task.state;
            if task.transition(next, at) {
                wlog_debug!("TaskBridge: '{}' {} -> {}", task.id, from, next);
                applied.transitions.push((from, next));
            }
        };

        if task.state == TaskState::New {
            step(task, TaskState::InProgress);
        }
        if task.state == TaskState::Blocked && signal != TaskSignal::Blocked {
            step(task, TaskState::InProgress);
        }
        if task.state == TaskState::InProgress {
            match signal {
                TaskSignal::Blocked => step(task, TaskState::Blocked),
                TaskSignal::Done if self.criteria.satisfied(&task.evidence) => {
                    step(task, TaskState::Completed);
                }
                TaskSignal::Done => {
                    wlog_warn!(
                        "TaskBridge: '{}' reported done without sufficient evidence ({})",
                        task_id,
                        self.criteria.name()
                    );
                    applied.unverified_claim = true;
                }
                TaskSignal::Working | TaskSignal::Unknown => {}
            }
        }

        if task.state == TaskState::Completed {
            let event = VerificationEvent {
                task_id: task_id.clone(),
                owner: task.owner.clone(),
                verified_at: at,
                commit_ref: task.evidence.iter().rev().find_map(|e| e.commit_ref.clone()),
                envelope_id: envelope.id,
            };
            wlog!("Task '{}' verified complete (owner {})", task_id, task.owner);
            self.verified_total += 1;
            self.outbox.push(event.clone());
            applied.verification = Some(event);
        }
        BridgeOutcome::Applied(applied)
    }

    /// Apply an envelope that was just written to `path`, then archive it.
    pub fn consume(&mut self, queue: &QueueDir, envelope: &Envelope, path: &Path) -> BridgeOutcome {
        let outcome = self.apply(envelope);
        if let Err(e) = queue.archive(path) {
            wlog_warn!("TaskBridge: could not archive {}: {}", path.display(), e);
        }
        outcome
    }

    /// Apply every envelope waiting in `queue`, oldest first.
    pub fn drain(&mut self, queue: &QueueDir) -> Result<Vec<BridgeOutcome>> {
        let mut outcomes = Vec::new();
        for path in queue.pending()? {
            match QueueDir::read(&path) {
                Ok(envelope) => outcomes.push(self.consume(queue, &envelope, &path)),
                Err(e) => {
                    wlog_warn!("TaskBridge: unreadable envelope {}: {}", path.display(), e);
                    queue.reject(&path)?;
                }
            }
        }
        if !outcomes.is_empty() {
            wlog_debug!(
                "TaskBridge: drained {} envelopes from {}",
                outcomes.len(),
                queue.path().display()
            );
        }
        Ok(outcomes)
    }
}
