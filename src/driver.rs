//! Instruction delivery to workers.
//!
//! The coordinator never talks to a worker directly. It hands an
//! [`Instruction`] to an [`InstructionChannel`] and later infers the effect
//! from side-channel activity.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::DriverConfig;
use crate::tmux::Tmux;
use crate::util::{blocking_with_timeout, truncate_chars};
use crate::worker::{Worker, WorkerId};
use crate::{wlog, wlog_debug, wlog_warn, Error, Result};

/// Layout key naming the tmux pane a worker lives in.
pub const TMUX_TARGET_KEY: &str = "tmux_target";

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Time a respawned pane gets before text is pasted into it.
const RESPAWN_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub worker: WorkerId,
    pub text: String,
    /// Short label for logs and drivers: a phase name, `rescue`, `restart`...
    pub tag: String,
    /// Start a fresh session before delivering the text.
    pub new_session: bool,
}

impl Instruction {
    pub fn new(worker: &WorkerId, text: impl Into<String>, tag: &str) -> Self {
        Self {
            worker: worker.clone(),
            text: text.into(),
            tag: tag.to_string(),
            new_session: false,
        }
    }

    pub fn in_new_session(mut self) -> Self {
        self.new_session = true;
        self
    }
}

#[async_trait]
pub trait InstructionChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, worker: &Worker, instruction: &Instruction) -> Result<()>;

    /// Discard whatever the worker has half-typed.
    async fn clear_input(&self, worker: &Worker) -> Result<()> {
        self.deliver(worker, &Instruction::new(&worker.id, "", "clear-input"))
            .await
    }
}

pub type SharedChannel = Arc<dyn InstructionChannel>;

pub fn channel_from_config(config: &DriverConfig) -> SharedChannel {
    match config {
        DriverConfig::Tmux { restart_command } => {
            if !Tmux::is_available() {
                wlog_warn!("tmux not found; every instruction will fail until it is installed");
            }
            Arc::new(TmuxChannel::new(restart_command.clone()))
        }
        DriverConfig::Command { program, args } => {
            Arc::new(CommandChannel::new(program.clone(), args.clone()))
        }
        DriverConfig::DryRun => Arc::new(DryRunChannel),
    }
}

/// Delivers into tmux panes.
#[derive(Debug, Clone, Default)]
pub struct TmuxChannel {
    restart_command: Option<String>,
    timeout: Duration,
}

impl TmuxChannel {
    pub fn new(restart_command: Option<String>) -> Self {
        Self {
            restart_command,
            timeout: DELIVERY_TIMEOUT,
        }
    }

    pub fn target(worker: &Worker) -> String {
        worker
            .layout
            .get(TMUX_TARGET_KEY)
            .cloned()
            .unwrap_or_else(|| Tmux::session_name(worker.id.as_str()))
    }

    /// Session part of a `session:window.pane` target.
    fn session_of(target: &str) -> &str {
        target.split([':', '.']).next().unwrap_or(target)
    }
}

#[async_trait]
impl InstructionChannel for TmuxChannel {
    fn name(&self) -> &'static str {
        "tmux"
    }

    async fn deliver(&self, worker: &Worker, instruction: &Instruction) -> Result<()> {
        let target = Self::target(worker);
        let session = Self::session_of(&target).to_string();
        let exists = {
            let session = session.clone();
            blocking_with_timeout(self.timeout, move || Ok(Tmux::session_exists(&session))).await?
        };
        if !exists {
            return Err(Error::Driver(format!(
                "tmux session '{}' for {} not found",
                session, worker.id
            )));
        }
        if instruction.new_session {
            let restart = self.restart_command.clone();
            let t = target.clone();
            blocking_with_timeout(self.timeout, move || {
                Tmux::respawn_pane(&t, restart.as_deref())
            })
            .await?;
            tokio::time::sleep(RESPAWN_SETTLE).await;
        }
        if instruction.text.is_empty() {
            return Ok(());
        }
        let text = instruction.text.clone();
        wlog_debug!(
            "TmuxChannel: {} [{}] -> {}",
            worker.id,
            instruction.tag,
            target
        );
        blocking_with_timeout(self.timeout, move || Tmux::paste_text(&target, &text)).await
    }

    async fn clear_input(&self, worker: &Worker) -> Result<()> {
        let target = Self::target(worker);
        blocking_with_timeout(self.timeout, move || Tmux::send_keys(&target, "C-u")).await
    }
}

/// Hands each instruction to an external program.
///
/// The program is called as
/// `<program> <args..> --worker <id> --tag <tag> [--new-session]`
/// with the instruction text on stdin.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandChannel {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            timeout: DELIVERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command_args(&self, instruction: &Instruction) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "--worker".to_string(),
            instruction.worker.to_string(),
            "--tag".to_string(),
            instruction.tag.clone(),
        ]);
        if instruction.new_session {
            args.push("--new-session".to_string());
        }
        args
    }

    async fn run(&self, instruction: &Instruction) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(self.command_args(instruction))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores stdin may exit before reading it.
            if let Err(e) = stdin.write_all(instruction.text.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Driver(format!(
                "{} exited with {} for {}: {}",
                self.program,
                output.status,
                instruction.worker,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl InstructionChannel for CommandChannel {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn deliver(&self, _worker: &Worker, instruction: &Instruction) -> Result<()> {
        wlog_debug!(
            "CommandChannel: {} {} [{}]",
            self.program,
            instruction.worker,
            instruction.tag
        );
        tokio::time::timeout(self.timeout, self.run(instruction))
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }
}

/// Logs instructions and delivers nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunChannel;

#[async_trait]
impl InstructionChannel for DryRunChannel {
    fn name(&self) -> &'static str {
        "dry_run"
    }

    async fn deliver(&self, worker: &Worker, instruction: &Instruction) -> Result<()> {
        wlog!(
            "[dry-run] {} [{}{}]: {}",
            worker.id,
            instruction.tag,
            if instruction.new_session { ", new session" } else { "" },
            truncate_chars(&instruction.text, 80)
        );
        Ok(())
    }
}
