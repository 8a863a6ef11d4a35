//! Built-in instruction texts.
//!
//! Every template may use `{worker}`, `{role}`, `{coordinator}` and
//! `{evidence_file}`; the rescue template also gets `{idle_secs}`.
//! Unknown placeholders are left as written.

use crate::config::Config;
use crate::worker::Worker;

/// The reply layout the response parser understands best.
pub const REPLY_FORMAT: &str = "\
Reply in this layout, writing it to {evidence_file} as well:
Task: <one line naming the task you are on>
Actions:
- <what you did>
Commit Message: <commit hash and message, plus the test result>
Status: working | blocked | done";

pub const ONBOARDING: &str = "\
You are {worker}, working as {role} under coordinator {coordinator}.
Read the project notes in your workspace, pick up the task assigned to you and start on it.
When you have your bearings, report back.

{reply_format}";

pub const RESUME: &str = "\
{worker}: resume where you left off. If you were interrupted, re-read your last notes first.";

pub const DO_TASK: &str = "\
{worker}: continue your current task. Make one concrete step of progress, then report.

{reply_format}";

pub const COORDINATE: &str = "\
{worker}: check for messages from other workers and from {coordinator}. Answer anything addressed to you and mention blockers you share with others.";

pub const STATUS_SYNC: &str = "\
{worker}: post a status update for your current task.

{reply_format}";

pub const VERIFY: &str = "\
{worker}: if you believe your task is done, prove it. Run the tests, commit, and report the commit hash together with the test result on one line.

{reply_format}";

pub const RESCUE: &str = "\
{worker}: no activity from you for {idle_secs}s. Stop what you are doing and report your state now, even if nothing changed.

{reply_format}";

/// Values shared by every instruction sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub coordinator: String,
    pub evidence_file: String,
}

impl Default for PromptContext {
    fn default() -> Self {
        Self {
            coordinator: "coordinator".to_string(),
            evidence_file: "response.md".to_string(),
        }
    }
}

impl PromptContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            coordinator: config.scheduler.coordinator.clone(),
            evidence_file: config.capture.evidence_file.clone(),
        }
    }

    /// Render `template` for `worker`, with `extra` placeholders on top.
    pub fn render(&self, template: &str, worker: &Worker, extra: &[(&str, &str)]) -> String {
        let mut vars: Vec<(&str, &str)> = vec![
            ("worker", worker.id.as_str()),
            ("role", worker.role.as_str()),
            ("coordinator", self.coordinator.as_str()),
            ("evidence_file", self.evidence_file.as_str()),
        ];
        vars.extend_from_slice(extra);
        render(template, &vars)
    }
}

/// Substitute `{name}` placeholders.
///
/// `{reply_format}` is expanded first so its own placeholders are filled in
/// by the same pass.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.replace("{reply_format}", REPLY_FORMAT);
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}
