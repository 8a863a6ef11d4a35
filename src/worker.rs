//! Worker records: one per externally driven session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::clock::elapsed;
use crate::config::WorkerConfig;

/// Stable worker identifier from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Activity classification, ordered from healthy to silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    /// Activity within the normal threshold.
    #[default]
    Active,
    /// Quiet, but not yet worth a nudge.
    Idle,
    Warn,
    Stall,
}

impl std::fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityLevel::Active => write!(f, "active"),
            ActivityLevel::Idle => write!(f, "idle"),
            ActivityLevel::Warn => write!(f, "warn"),
            ActivityLevel::Stall => write!(f, "stall"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,
    pub role: String,
    /// Opaque to the core; read only by instruction drivers.
    pub layout: BTreeMap<String, String>,
    pub scheduled: bool,
    pub onboarded: bool,
    pub onboarding_started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Newest side-channel mtime already counted, as read from disk.
    pub side_channel_mtime: Option<DateTime<Utc>>,
    pub responses: u64,
    pub escalation_attempts: u32,
    pub level: ActivityLevel,
}

impl Worker {
    /// Build a worker at process start. The start time is the activity floor.
    pub fn from_config(config: &WorkerConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkerId::new(&config.id),
            role: config.role.clone(),
            layout: config.layout.clone(),
            scheduled: config.scheduled,
            onboarded: config.onboarded,
            onboarding_started_at: now,
            last_activity: now,
            side_channel_mtime: None,
            responses: 0,
            escalation_attempts: 0,
            level: ActivityLevel::Active,
        }
    }

    /// Move `last_activity` forward to `at`. Older observations are ignored.
    pub fn record_activity(&mut self, at: DateTime<Utc>) -> bool {
        if at > self.last_activity {
            self.last_activity = at;
            true
        } else {
            false
        }
    }

    /// A routed envelope: counts as activity and completes onboarding.
    pub fn record_response(&mut self, at: DateTime<Utc>) {
        self.responses += 1;
        self.record_activity(at);
        self.onboarded = true;
    }

    /// A new session starts over, including the onboarding grace.
    pub fn restart_onboarding(&mut self, at: DateTime<Utc>) {
        self.onboarded = false;
        self.onboarding_started_at = at;
    }

    pub fn idle(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.last_activity, now)
    }
}
