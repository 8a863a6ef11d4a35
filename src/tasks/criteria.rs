//! Completion criteria: when does accumulated evidence prove a task done?
//!
//! Evidence is heuristic. A worker's text is scanned for a commit reference
//! and a passing-status marker, and a pluggable rule decides whether the
//! evidence list as a whole is sufficient.

use regex::Regex;
use std::sync::LazyLock;

use crate::config::{CompletionConfig, CompletionRule};
use crate::inbox::{Envelope, TaskSignal};
use crate::util::truncate_chars;

use super::Evidence;

/// `commit abc1234`, `sha: abc1234`, `hash=abc1234`, `commit #abc1234`.
static LABELED_COMMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:commit|sha|hash)\b[\s:#=]*\b([0-9a-f]{7,40})\b").unwrap()
});

static HEX_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b[0-9a-f]{7,40}\b").unwrap());

/// Scans envelope text for commit references and passing markers.
#[derive(Debug, Clone)]
pub struct EvidenceMarkers {
    passing: Vec<String>,
    done_is_passing: bool,
}

impl EvidenceMarkers {
    pub fn new(passing: &[String]) -> Self {
        Self {
            passing: passing
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            done_is_passing: false,
        }
    }

    pub fn from_config(config: &CompletionConfig) -> Self {
        Self::new(&config.passing_markers).with_done_passing(config.done_counts_as_passing)
    }

    /// Treat a `done` status as a passing marker.
    pub fn with_done_passing(mut self, enabled: bool) -> Self {
        self.done_is_passing = enabled;
        self
    }

    pub fn done_is_passing(&self) -> bool {
        self.done_is_passing
    }

    /// First commit-like hash in `text`.
    ///
    /// A labeled hash is preferred. A bare hex token only counts when it
    /// mixes letters and digits, so plain words and numbers are skipped.
    pub fn commit_ref(&self, text: &str) -> Option<String> {
        if let Some(caps) = LABELED_COMMIT_RE.captures(text) {
            return Some(caps[1].to_lowercase());
        }
        HEX_TOKEN_RE
            .find_iter(text)
            .map(|m| m.as_str())
            .find(|tok| {
                tok.chars().any(|c| c.is_ascii_digit())
                    && tok.chars().any(|c| c.is_ascii_alphabetic())
            })
            .map(str::to_lowercase)
    }

    pub fn is_passing(&self, text: &str) -> bool {
        text.lines().any(|line| {
            let line = line.to_lowercase();
            self.passing.iter().any(|m| line.contains(m.as_str())) && !mentions_failure(&line)
        })
    }

    pub fn evidence_for(&self, envelope: &Envelope) -> Evidence {
        let text = envelope.evidence_text();
        Evidence {
            at: envelope.timestamp,
            from: envelope.from.clone(),
            envelope_id: envelope.id,
            summary: truncate_chars(&envelope.summary, 200).to_string(),
            commit_ref: self.commit_ref(&text),
            passing: self.is_passing(&text)
                || (self.done_is_passing && envelope.signal() == TaskSignal::Done),
        }
    }
}

/// "3 passing, 1 failed" is not a pass.
fn mentions_failure(line: &str) -> bool {
    if line.contains("not pass") || line.contains('❌') {
        return true;
    }
    line.split(|c: char| !c.is_alphanumeric())
        .any(|w| w.starts_with("fail") || w == "red" || w == "broken")
}

pub trait CompletionCriteria: Send + Sync {
    fn name(&self) -> &'static str;

    fn satisfied(&self, evidence: &[Evidence]) -> bool;
}

/// One evidence item carries both a commit reference and a passing marker.
#[derive(Debug, Default, Clone, Copy)]
pub struct SameItem;

impl CompletionCriteria for SameItem {
    fn name(&self) -> &'static str {
        "same_item"
    }

    fn satisfied(&self, evidence: &[Evidence]) -> bool {
        evidence.iter().any(|e| e.commit_ref.is_some() && e.passing)
    }
}

/// Some item has a commit reference and some item a passing marker.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcrossItems;

impl CompletionCriteria for AcrossItems {
    fn name(&self) -> &'static str {
        "across_items"
    }

    fn satisfied(&self, evidence: &[Evidence]) -> bool {
        evidence.iter().any(|e| e.commit_ref.is_some()) && evidence.iter().any(|e| e.passing)
    }
}

pub fn criteria_for(config: &CompletionConfig) -> Box<dyn CompletionCriteria> {
    match config.rule {
        CompletionRule::SameItem => Box::new(SameItem),
        CompletionRule::AcrossItems => Box::new(AcrossItems),
    }
}
