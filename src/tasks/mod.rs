//! Task lifecycle tracking fed by routed envelopes.
//!
//! Tasks are created implicitly by the first task-update envelope that
//! names them, accumulate evidence from every envelope that references them,
//! and are only marked completed once that evidence satisfies the configured
//! [`CompletionCriteria`].

pub mod bridge;
pub mod criteria;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::WorkerId;

pub use bridge::{Applied, BridgeOutcome, SharedBridge, TaskBook, TaskBridge, VerificationEvent};
pub use criteria::{criteria_for, AcrossItems, CompletionCriteria, EvidenceMarkers, SameItem};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Seen for the first time.
    #[default]
    New,
    /// Being worked on by its owner.
    InProgress,
    /// Owner reported being blocked; recovers to in-progress.
    Blocked,
    /// Verified done. Terminal.
    Completed,
}

impl TaskState {
    pub const ALL: [TaskState; 4] = [
        TaskState::New,
        TaskState::InProgress,
        TaskState::Blocked,
        TaskState::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::InProgress => "in_progress",
            TaskState::Blocked => "blocked",
            TaskState::Completed => "completed",
        }
    }

    /// Edges the lifecycle allows.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::New, TaskState::InProgress)
                | (TaskState::InProgress, TaskState::Blocked)
                | (TaskState::InProgress, TaskState::Completed)
                | (TaskState::Blocked, TaskState::InProgress)
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == TaskState::Completed
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One piece of evidence extracted from an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub at: DateTime<Utc>,
    pub from: WorkerId,
    pub envelope_id: Uuid,
    pub summary: String,
    /// Commit hash found in the envelope text, if any.
    #[serde(default)]
    pub commit_ref: Option<String>,
    /// Whether the text carried a passing-status marker.
    #[serde(default)]
    pub passing: bool,
}

/// A tracked task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Worker whose envelope created the task.
    pub owner: WorkerId,
    pub state: TaskState,
    /// Append-only, in arrival order.
    pub evidence: Vec<Evidence>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: &str, owner: &WorkerId, at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            owner: owner.clone(),
            state: TaskState::New,
            evidence: Vec::new(),
            created_at: at,
            updated_at: at,
            verified_at: None,
        }
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// Returns false, leaving the task untouched, for any other edge.
    pub fn transition(&mut self, next: TaskState, at: DateTime<Utc>) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = at;
        if next == TaskState::Completed {
            self.verified_at = Some(at);
        }
        true
    }

    pub fn append_evidence(&mut self, evidence: Evidence) {
        if evidence.at > self.updated_at {
            self.updated_at = evidence.at;
        }
        self.evidence.push(evidence);
    }
}
