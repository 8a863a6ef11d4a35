use std::process::{Command, Output};

use crate::{wlog_debug, wlog_trace, wlog_warn, Error, Result};

pub struct Tmux;

impl Tmux {
    pub fn send_keys(target: &str, keys: &str) -> Result<()> {
        wlog_debug!("Tmux::send_keys target={} keys={}", target, keys);
        let output = Command::new("tmux")
            .args(["send-keys", "-t", target, keys])
            .output()?;
        check(&output, "send keys to", target)
    }

    /// Paste `text` into the pane as one bracketed paste, then press Enter.
    ///
    /// Going through a named buffer keeps multi-line text intact where
    /// `send-keys` would submit each line separately.
    pub fn paste_text(target: &str, text: &str) -> Result<()> {
        let buffer = format!("warden-{}", sanitize_session_name(target));
        wlog_trace!(
            "Tmux::paste_text target={} buffer={} bytes={}",
            target,
            buffer,
            text.len()
        );
        let output = Command::new("tmux")
            .args(["set-buffer", "-b", &buffer, "--", text])
            .output()?;
        check(&output, "load buffer for", target)?;

        let output = Command::new("tmux")
            .args(["paste-buffer", "-p", "-d", "-b", &buffer, "-t", target])
            .output()?;
        check(&output, "paste into", target)?;

        Self::send_keys(target, "Enter")
    }

    /// Kill whatever runs in the pane and start `command` (or the pane's
    /// original command) in its place.
    pub fn respawn_pane(target: &str, command: Option<&str>) -> Result<()> {
        wlog_debug!("Tmux::respawn_pane target={} command={:?}", target, command);
        let mut args = vec!["respawn-pane", "-k", "-t", target];
        if let Some(cmd) = command {
            args.push(cmd);
        }
        let output = Command::new("tmux").args(&args).output()?;
        check(&output, "respawn pane", target)
    }

    pub fn session_exists(name: &str) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn is_available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn session_name(worker: &str) -> String {
        format!("warden_{}", sanitize_session_name(worker))
    }
}

fn check(output: &Output, action: &str, target: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let err = format!(
        "Failed to {} '{}': {}",
        action,
        target,
        String::from_utf8_lossy(&output.stderr).trim()
    );
    wlog_warn!("tmux: {}", err);
    Err(Error::Driver(err))
}

fn sanitize_session_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_session_name() {
        assert_eq!(sanitize_session_name("main:0.1"), "main_0_1");
    }

    #[test]
    fn test_session_name() {
        assert_eq!(Tmux::session_name("w1"), "warden_w1");
        assert_eq!(Tmux::session_name("a b"), "warden_a_b");
    }

    #[test]
    fn test_missing_session_does_not_exist() {
        assert!(!Tmux::session_exists("warden_nonexistent_session_12345"));
    }
}
