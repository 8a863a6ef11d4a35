//! Envelopes: the normalized, versioned record written to queue directories.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::capture::RawCandidate;
use crate::worker::WorkerId;

use super::parser::{Payload, PayloadKind, TaskSignal};

pub const ENVELOPE_VERSION: u32 = 1;

static ACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:ack|acked|acknowledged|ok|okay|roger|received|got it|understood)\s*[.!]*\s*$")
        .unwrap()
});

static SYNC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:\[sync\]|sync\s*:|status\s+sync\b|checkpoint\s*:)").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Sync,
    TaskUpdate,
    Note,
    Ack,
}

impl EnvelopeType {
    /// Pick the type from the raw text and what the parser found in it.
    pub fn classify(text: &str, payload: &Payload) -> Self {
        if payload.task_key().is_some() || payload.status.is_some() {
            EnvelopeType::TaskUpdate
        } else if ACK_RE.is_match(text) {
            EnvelopeType::Ack
        } else if SYNC_RE.is_match(text) {
            EnvelopeType::Sync
        } else {
            EnvelopeType::Note
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Sync => "sync",
            EnvelopeType::TaskUpdate => "task_update",
            EnvelopeType::Note => "note",
            EnvelopeType::Ack => "ack",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub version: u32,
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub from: WorkerId,
    pub to: String,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub summary: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

impl Envelope {
    pub fn new(kind: EnvelopeType, from: &WorkerId, to: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            id: Uuid::new_v4(),
            kind,
            from: from.clone(),
            to: to.to_string(),
            timestamp,
            topic: kind.as_str().to_string(),
            summary: String::new(),
            details: Map::new(),
            task_id: None,
            state: None,
            evidence: None,
            payload: None,
        }
    }

    /// Wrap one parsed capture. Every candidate becomes exactly one envelope.
    pub fn from_capture(
        candidate: &RawCandidate,
        payload: Payload,
        to: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let kind = EnvelopeType::classify(&candidate.text, &payload);
        let mut env = Envelope::new(kind, &candidate.worker, to, timestamp);

        env.summary = payload.summary.clone();
        env.details
            .insert("source".into(), Value::from(candidate.source.as_str()));
        env.details
            .insert("captured_at".into(), Value::from(candidate.captured_at.to_rfc3339()));
        env.details.insert(
            "parse".into(),
            serde_json::to_value(payload.kind).unwrap_or(Value::Null),
        );

        if kind == EnvelopeType::TaskUpdate {
            env.task_id = payload.task_key();
            env.state = payload.status.clone();
            env.evidence = Some(evidence_lines(&payload));
        }
        if let Some(task_id) = &env.task_id {
            env.topic = task_id.clone();
        }
        if payload.kind != PayloadKind::Empty {
            env.payload = Some(payload);
        }
        env
    }

    pub fn signal(&self) -> TaskSignal {
        self.state
            .as_deref()
            .map(TaskSignal::from_status)
            .unwrap_or(TaskSignal::Unknown)
    }

    /// `<timestamp>_<from>_to_<to>_<id8>.json`; sorts by creation time.
    pub fn file_name(&self) -> String {
        let id = self.id.simple().to_string();
        format!(
            "{}_{}_to_{}_{}.json",
            self.timestamp.format("%Y%m%dT%H%M%S%.6fZ"),
            file_safe(self.from.as_str()),
            file_safe(&self.to),
            &id[..8]
        )
    }

    /// All text an evidence scan should look at.
    pub fn evidence_text(&self) -> String {
        let mut parts = vec![self.summary.clone()];
        if let Some(lines) = &self.evidence {
            parts.extend(lines.iter().cloned());
        }
        if let Some(state) = &self.state {
            parts.push(state.clone());
        }
        parts.join("\n")
    }
}

fn evidence_lines(payload: &Payload) -> Vec<String> {
    let mut lines: Vec<String> = payload.actions.clone();
    if let Some(commit) = &payload.commit_message {
        lines.push(format!("commit: {}", commit));
    }
    lines
}

fn file_safe(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
