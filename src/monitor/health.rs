//! Health summary readable while the loop runs.
//!
//! The scheduler folds every worker's activity, escalation state and
//! failure counts into a [`HealthSummary`] and writes it to `status.json`
//! after each pass. `warden status` reads it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use crate::util::write_atomic;
use crate::worker::{ActivityLevel, Worker, WorkerId};
use crate::Result;

use super::escalation::{EscalationRecord, Tier};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub level: ActivityLevel,
    pub tier: Tier,
    pub last_activity: Option<DateTime<Utc>>,
    pub idle_secs: u64,
    pub responses: u64,
    pub onboarded: bool,
    pub escalation_attempts: u32,
    /// New sessions this run.
    pub restarts: u32,
    /// Capture sources currently unreachable.
    #[serde(default)]
    pub degraded_sources: BTreeSet<String>,
    /// Envelopes from this worker that could not be written.
    pub delivery_failures: u32,
    /// Instructions to this worker that could not be delivered.
    pub instruction_failures: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl WorkerHealth {
    /// Copy the live fields from the worker and its escalation record.
    pub fn observe(
        &mut self,
        worker: &Worker,
        escalation: Option<&EscalationRecord>,
        now: DateTime<Utc>,
    ) {
        self.level = worker.level;
        self.last_activity = Some(worker.last_activity);
        self.idle_secs = worker.idle(now).as_secs();
        self.responses = worker.responses;
        self.onboarded = worker.onboarded;
        self.escalation_attempts = worker.escalation_attempts;
        if let Some(rec) = escalation {
            self.tier = rec.tier;
            self.restarts = rec.restarts;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub updated_at: Option<DateTime<Utc>>,
    pub workers: BTreeMap<WorkerId, WorkerHealth>,
    /// Envelopes held in memory awaiting redelivery.
    pub pending_deliveries: usize,
    pub dropped_deliveries: u64,
    /// Task count per state name.
    pub tasks: BTreeMap<String, usize>,
    pub verified: u64,
}

impl HealthSummary {
    pub fn worker_mut(&mut self, id: &WorkerId) -> &mut WorkerHealth {
        self.workers.entry(id.clone()).or_default()
    }

    pub fn source_degraded(&mut self, id: &WorkerId, source: &str) {
        self.worker_mut(id).degraded_sources.insert(source.to_string());
    }

    pub fn source_recovered(&mut self, id: &WorkerId, source: &str) {
        self.worker_mut(id).degraded_sources.remove(source);
    }

    pub fn delivery_failed(&mut self, id: &WorkerId, error: &str) {
        let h = self.worker_mut(id);
        h.delivery_failures += 1;
        h.last_error = Some(error.to_string());
    }

    pub fn instruction_failed(&mut self, id: &WorkerId, error: &str) {
        let h = self.worker_mut(id);
        h.instruction_failures += 1;
        h.last_error = Some(error.to_string());
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)
    }

    /// `None` when no summary has been written yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Plain-text table for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        match self.updated_at {
            Some(at) => {
                let _ = writeln!(out, "updated {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            None => out.push_str("never updated\n"),
        }
        let _ = writeln!(
            out,
            "{:<16} {:<7} {:<10} {:>7} {:>9} {:>8}  notes",
            "WORKER", "LEVEL", "TIER", "IDLE", "RESPONSES", "RESTARTS"
        );
        for (id, h) in &self.workers {
            let mut notes = Vec::new();
            if !h.onboarded {
                notes.push("onboarding".to_string());
            }
            if !h.degraded_sources.is_empty() {
                let sources: Vec<&str> = h.degraded_sources.iter().map(String::as_str).collect();
                notes.push(format!("degraded: {}", sources.join(",")));
            }
            if h.delivery_failures > 0 {
                notes.push(format!("{} delivery failures", h.delivery_failures));
            }
            if h.instruction_failures > 0 {
                notes.push(format!("{} instruction failures", h.instruction_failures));
            }
            if let Some(err) = &h.last_error {
                notes.push(format!("last error: {}", err));
            }
            let _ = writeln!(
                out,
                "{:<16} {:<7} {:<10} {:>6}s {:>9} {:>8}  {}",
                id.as_str(),
                h.level.to_string(),
                h.tier.as_str(),
                h.idle_secs,
                h.responses,
                h.restarts,
                notes.join("; ")
            );
        }
        let _ = writeln!(
            out,
            "deliveries: {} pending, {} dropped",
            self.pending_deliveries, self.dropped_deliveries
        );
        let tasks: Vec<String> = self
            .tasks
            .iter()
            .map(|(state, n)| format!("{} {}", n, state))
            .collect();
        let _ = writeln!(
            out,
            "tasks: {} ({} verified)",
            if tasks.is_empty() {
                "none".to_string()
            } else {
                tasks.join(", ")
            },
            self.verified
        );
        out
    }
}
