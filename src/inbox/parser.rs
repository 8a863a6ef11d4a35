//! Response parsing: raw worker text into a structured payload.
//!
//! Workers are asked to answer in a four-field format:
//!
//! ```text
//! Task: <what is being worked on>
//! Actions:
//! - <step>
//! Commit Message: <message or ref>
//! Status: <in progress | blocked | done>
//! ```
//!
//! Matching is line based and tolerant of markdown decoration (`**Task:**`,
//! `## Status:`, `- Commit:`), label case and a few label synonyms. Any
//! subset of fields is accepted. Text with no recognizable field falls back
//! to a summary of its first non-empty lines. [`parse`] is total: it returns
//! a payload for every input.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::util::truncate_chars;

/// Summary text for empty input.
pub const EMPTY_MARKER: &str = "(empty)";

/// Non-empty lines kept in a fallback summary.
const FALLBACK_LINES: usize = 3;
const MAX_FIELD_CHARS: usize = 500;
const MAX_SUMMARY_LINE_CHARS: usize = 200;

/// A field label at the start of a line, with optional markdown around it.
static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:[-*>#]+\s*)*(?:\*\*|__)?\s*(task\s*id|task|action\s+items|actions?|steps|commit\s*message|commit\s*msg|commit|status|state)\s*(?:\*\*|__)?\s*[:：]\s*(?:\*\*|__)?\s*(.*?)\s*$",
    )
    .unwrap()
});

/// A list item: `- x`, `* x`, `• x`, `1. x`, `2) x`.
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•+]|\d+[.)])\s+(.+?)\s*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// All four fields present.
    Structured,
    /// Some fields present.
    Partial,
    /// No fields; summary holds the first lines.
    Fallback,
    Empty,
}

/// What a status line says about the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSignal {
    Working,
    Blocked,
    Done,
    Unknown,
}

impl TaskSignal {
    pub fn from_status(status: &str) -> Self {
        let s = status.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| s.contains(w));
        if has(&["blocked", "stuck", "waiting on", "waiting for"]) {
            TaskSignal::Blocked
        } else if has(&["not done", "incomplete", "not complete"]) {
            TaskSignal::Working
        } else if has(&["done", "complete", "finished", "shipped", "merged"]) {
            TaskSignal::Done
        } else if has(&["progress", "working", "started", "ongoing", "wip", "continuing"]) {
            TaskSignal::Working
        } else {
            TaskSignal::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub kind: PayloadKind,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Explicit `Task ID:` value, if the worker gave one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Payload {
    /// Task identifier: the explicit id, else a slug of the task text.
    pub fn task_key(&self) -> Option<String> {
        self.task_id
            .as_deref()
            .and_then(slugify)
            .or_else(|| self.task.as_deref().and_then(slugify))
    }

    pub fn signal(&self) -> TaskSignal {
        self.status
            .as_deref()
            .map(TaskSignal::from_status)
            .unwrap_or(TaskSignal::Unknown)
    }

    pub fn is_empty(&self) -> bool {
        self.kind == PayloadKind::Empty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    TaskId,
    Task,
    Actions,
    Commit,
    Status,
}

fn field_for(label: &str) -> Field {
    let label: String = label
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    match label.as_str() {
        "taskid" => Field::TaskId,
        "task" => Field::Task,
        "actions" | "action" | "actionitems" | "steps" => Field::Actions,
        "status" | "state" => Field::Status,
        _ => Field::Commit,
    }
}

#[derive(Default)]
struct Fields {
    task: Option<String>,
    task_id: Option<String>,
    actions: Vec<String>,
    commit: Option<String>,
    status: Option<String>,
}

impl Fields {
    fn slot(&mut self, field: Field) -> Option<&mut Option<String>> {
        match field {
            Field::Task => Some(&mut self.task),
            Field::TaskId => Some(&mut self.task_id),
            Field::Commit => Some(&mut self.commit),
            Field::Status => Some(&mut self.status),
            Field::Actions => None,
        }
    }

    fn any(&self) -> bool {
        self.task.is_some()
            || self.task_id.is_some()
            || !self.actions.is_empty()
            || self.commit.is_some()
            || self.status.is_some()
    }

    fn all(&self) -> bool {
        self.task.is_some()
            && !self.actions.is_empty()
            && self.commit.is_some()
            && self.status.is_some()
    }
}

/// Parse raw worker text. Never fails.
pub fn parse(text: &str) -> Payload {
    let clean = sanitize(text);
    if clean.trim().is_empty() {
        return Payload {
            kind: PayloadKind::Empty,
            summary: EMPTY_MARKER.to_string(),
            task: None,
            task_id: None,
            actions: Vec::new(),
            commit_message: None,
            status: None,
        };
    }

    let mut fields = Fields::default();
    let mut current: Option<Field> = None;

    for line in clean.lines() {
        if let Some(caps) = LABEL_RE.captures(line) {
            let field = field_for(&caps[1]);
            let value = strip_emphasis(&caps[2]);
            current = Some(field);
            match field {
                Field::Actions => {
                    if !value.is_empty() {
                        fields.actions.push(value);
                    }
                }
                _ => {
                    if let Some(slot) = fields.slot(field) {
                        // First occurrence wins; later repeats are ignored.
                        if slot.is_none() {
                            *slot = Some(value);
                        }
                    }
                }
            }
            continue;
        }

        let trimmed = line.trim();
        match current {
            Some(Field::Actions) => {
                if let Some(caps) = BULLET_RE.captures(line) {
                    fields.actions.push(strip_emphasis(&caps[1]));
                } else if !trimmed.is_empty() {
                    current = None;
                }
            }
            Some(field @ (Field::Task | Field::Commit)) => {
                if trimmed.is_empty() {
                    current = None;
                } else if let Some(slot) = fields.slot(field) {
                    // Continuation lines of a multi-line value.
                    let joined = match slot.take() {
                        Some(prev) if !prev.is_empty() => format!("{} {}", prev, trimmed),
                        _ => trimmed.to_string(),
                    };
                    *slot = Some(joined);
                }
            }
            Some(field @ (Field::Status | Field::TaskId)) => {
                // A bare label takes its value from the next line.
                if let Some(slot) = fields.slot(field) {
                    if slot.as_deref() == Some("") && !trimmed.is_empty() {
                        *slot = Some(strip_emphasis(trimmed));
                    }
                }
                current = None;
            }
            None => {}
        }
    }

    let finish = |v: Option<String>| {
        v.map(|s| truncate_chars(&s, MAX_FIELD_CHARS).to_string())
            .filter(|s| !s.is_empty())
    };
    let task = finish(fields.task.take());
    let task_id = finish(fields.task_id.take());
    let commit_message = finish(fields.commit.take());
    let status = finish(fields.status.take());
    let actions: Vec<String> = fields
        .actions
        .iter()
        .filter(|a| !a.is_empty())
        .map(|a| truncate_chars(a, MAX_FIELD_CHARS).to_string())
        .collect();

    let found = Fields {
        task: task.clone(),
        task_id: task_id.clone(),
        actions: actions.clone(),
        commit: commit_message.clone(),
        status: status.clone(),
    };

    let kind = if found.all() {
        PayloadKind::Structured
    } else if found.any() {
        PayloadKind::Partial
    } else {
        PayloadKind::Fallback
    };

    let summary = match kind {
        PayloadKind::Fallback => first_lines(&clean),
        _ => structured_summary(&found),
    };

    Payload {
        kind,
        summary,
        task,
        task_id,
        actions,
        commit_message,
        status,
    }
}

/// Drop control characters other than newline and tab.
fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

fn strip_emphasis(s: &str) -> String {
    s.trim()
        .trim_matches(|c| c == '*' || c == '_' || c == '`')
        .trim()
        .to_string()
}

fn first_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(FALLBACK_LINES)
        .map(|l| truncate_chars(l, MAX_SUMMARY_LINE_CHARS))
        .collect::<Vec<_>>()
        .join("\n")
}

fn structured_summary(fields: &Fields) -> String {
    let head = fields
        .task
        .as_deref()
        .or(fields.task_id.as_deref())
        .or(fields.commit.as_deref())
        .or(fields.actions.first().map(String::as_str))
        .unwrap_or("");
    let head = truncate_chars(head, MAX_SUMMARY_LINE_CHARS);
    match fields.status.as_deref() {
        Some(status) if head.is_empty() => format!("status: {}", status),
        Some(status) => format!("{} [{}]", head, status),
        None => head.to_string(),
    }
}

/// Lowercase ASCII slug used as a task id. `None` if nothing usable remains.
pub fn slugify(text: &str) -> Option<String> {
    let mut slug = String::new();
    let mut dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
        if slug.len() >= 48 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        None
    } else {
        Some(slug)
    }
}
