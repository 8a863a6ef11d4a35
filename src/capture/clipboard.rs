//! Read the system clipboard through whichever paste tool is installed.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::inbox::dedup::signature;
use crate::worker::WorkerId;
use crate::{wlog_debug, Error, Result};

use super::{CaptureKind, CaptureStrategy, RawCandidate};

/// Paste commands in order of preference.
const PASTE_TOOLS: &[&[&str]] = &[
    &["pbpaste"],
    &["wl-paste", "--no-newline"],
    &["xclip", "-selection", "clipboard", "-o"],
    &["xsel", "--clipboard", "--output"],
];

pub struct ClipboardPoll {
    command: Option<Vec<String>>,
    timeout: Duration,
    last_signature: Option<String>,
    available: bool,
}

impl ClipboardPoll {
    /// Pick the first paste tool found on `PATH`.
    pub fn detect(timeout: Duration) -> Self {
        let command = PASTE_TOOLS
            .iter()
            .find(|tool| which::which(tool[0]).is_ok())
            .map(|tool| tool.iter().map(|s| s.to_string()).collect());
        if command.is_none() {
            wlog_debug!("ClipboardPoll: no paste tool found");
        }
        Self::with_command(command, timeout)
    }

    pub fn with_command(command: Option<Vec<String>>, timeout: Duration) -> Self {
        Self {
            available: command.is_some(),
            command,
            timeout,
            last_signature: None,
        }
    }
}

#[async_trait]
impl CaptureStrategy for ClipboardPoll {
    fn kind(&self) -> CaptureKind {
        CaptureKind::Clipboard
    }

    async fn poll(&mut self, worker: &WorkerId) -> Vec<RawCandidate> {
        let Some(command) = self.command.clone() else {
            return Vec::new();
        };

        let text = match paste(&command, self.timeout).await {
            Ok(text) => {
                self.available = true;
                text
            }
            Err(e) => {
                wlog_debug!("ClipboardPoll: paste failed: {}", e);
                self.available = false;
                return Vec::new();
            }
        };

        if text.trim().is_empty() {
            return Vec::new();
        }
        // The clipboard holds its value between polls; only report changes.
        let sig = signature(&text);
        if self.last_signature.as_deref() == Some(sig.as_str()) {
            return Vec::new();
        }
        self.last_signature = Some(sig);
        vec![RawCandidate::new(worker, CaptureKind::Clipboard, text)]
    }

    fn available(&self) -> bool {
        self.available
    }
}

/// Run the paste tool, killing it if it outlives `timeout`.
async fn paste(command: &[String], timeout: Duration) -> Result<String> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| Error::Validation("empty paste command".into()))?;
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| Error::Timeout(timeout))??;
    if !output.status.success() {
        return Err(Error::Driver(format!(
            "{} exited with {}",
            program, output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_tool_is_unavailable() {
        let mut strategy = ClipboardPoll::with_command(None, Duration::from_secs(1));
        assert!(!strategy.available());
        assert!(strategy.poll(&WorkerId::new("w1")).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unchanged_clipboard_reported_once() {
        let command = vec!["echo".to_string(), "Status: done".to_string()];
        let mut strategy = ClipboardPoll::with_command(Some(command), Duration::from_secs(5));
        let worker = WorkerId::new("w1");

        let first = strategy.poll(&worker).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].text.trim(), "Status: done");
        assert!(strategy.poll(&worker).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_tool_marks_unavailable() {
        let command = vec!["false".to_string()];
        let mut strategy = ClipboardPoll::with_command(Some(command), Duration::from_secs(5));
        assert!(strategy.poll(&WorkerId::new("w1")).await.is_empty());
        assert!(!strategy.available());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_tool_times_out() {
        let command = vec!["sleep".to_string(), "30".to_string()];
        let err = paste(&command, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        let mut strategy =
            ClipboardPoll::with_command(Some(command), Duration::from_millis(100));
        let started = std::time::Instant::now();
        assert!(strategy.poll(&WorkerId::new("w1")).await.is_empty());
        assert!(!strategy.available());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
