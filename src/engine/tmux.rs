//! Tmux pane driver.
//!
//! The engine owns exactly two panes inside one tmux session: pane 0 runs
//! coding sessions, pane 1 reviews. The driver abstracts spawn, liveness
//! probing, and kill so the engine (and its tests) never shell out directly.
//!
//! Session names are validated to prevent shell injection; liveness is
//! derived from the pane's current command, and exit codes from a marker the
//! spawn command appends when the agent process ends.

use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::GRACEFUL_KILL_WAIT_MS;
use crate::error::{Error, Result};
use crate::models::Pane;

/// Marker echoed after the agent command so the driver can recover the exit
/// code from captured pane output.
pub const EXIT_MARKER: &str = "tc-exit:";

const SHELLS: [&str; 5] = ["sh", "bash", "zsh", "fish", "dash"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneState {
    /// Nothing but the shell is running and no exit marker is visible.
    Idle,
    /// The agent process is still alive.
    Busy,
    /// The agent process ended; exit code recovered from the marker if
    /// the pane still shows it.
    Exited { exit_code: Option<i64> },
}

/// What the engine needs from a terminal multiplexer. One implementation
/// wraps tmux; tests script their own.
pub trait PaneDriver: Send {
    /// Start a command on a pane and return the pane's process id if known.
    fn spawn(&mut self, pane: Pane, command: &str) -> Result<Option<u32>>;
    /// Probe whether the pane's process still exists.
    fn poll(&mut self, pane: Pane) -> Result<PaneState>;
    /// Interrupt the pane's process; `force` escalates after a grace period.
    fn kill(&mut self, pane: Pane, force: bool) -> Result<()>;
}

/// Only alphanumerics, underscore, and hyphen — anything else could escape
/// into the shell.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn tmux(args: &[&str]) -> Result<String> {
    let output = Command::new("tmux")
        .args(args)
        .output()
        .map_err(|e| Error::Infrastructure(format!("tmux unavailable: {e}")))?;
    if !output.status.success() {
        return Err(Error::Infrastructure(format!(
            "tmux {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn tmux_ok(args: &[&str]) -> bool {
    Command::new("tmux")
        .args(args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub struct TmuxDriver {
    session: String,
    /// Tmux pane ids, indexed by [`Pane::index`].
    pane_ids: [String; 2],
}

impl TmuxDriver {
    /// Create (or reattach to) the project's tmux session with a coding pane
    /// and a review pane side by side.
    pub fn setup(project_name: &str) -> Result<Self> {
        let sanitized: String = project_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let session = format!("tc-{sanitized}");
        if !is_valid_name(&session) {
            return Err(Error::Validation(format!(
                "invalid tmux session name: {session}"
            )));
        }

        if !tmux_ok(&["has-session", "-t", &session]) {
            tmux(&["new-session", "-d", "-s", &session])?;
        }

        let panes = Self::list_panes(&session)?;
        if panes.is_empty() {
            return Err(Error::Infrastructure(format!(
                "tmux session {session} has no panes"
            )));
        }
        let pane_ids = if panes.len() >= 2 {
            [panes[0].clone(), panes[1].clone()]
        } else {
            let second = tmux(&[
                "split-window",
                "-h",
                "-d",
                "-t",
                &session,
                "-P",
                "-F",
                "#{pane_id}",
            ])?;
            [panes[0].clone(), second]
        };

        Ok(Self { session, pane_ids })
    }

    pub fn session_name(&self) -> &str {
        &self.session
    }

    fn list_panes(session: &str) -> Result<Vec<String>> {
        let output = tmux(&["list-panes", "-t", session, "-F", "#{pane_id}"])?;
        Ok(output.lines().map(str::to_string).collect())
    }

    fn pane_id(&self, pane: Pane) -> &str {
        &self.pane_ids[pane.index() as usize]
    }

    fn pane_command(&self, pane: Pane) -> Result<String> {
        tmux(&[
            "display-message",
            "-t",
            self.pane_id(pane),
            "-p",
            "#{pane_current_command}",
        ])
    }

    fn pane_pid(&self, pane: Pane) -> Result<Option<u32>> {
        let out = tmux(&[
            "display-message",
            "-t",
            self.pane_id(pane),
            "-p",
            "#{pane_pid}",
        ])?;
        Ok(out.parse().ok())
    }

    fn capture(&self, pane: Pane, lines: u32) -> Result<String> {
        let from = format!("-{lines}");
        tmux(&[
            "capture-pane",
            "-t",
            self.pane_id(pane),
            "-p",
            "-S",
            &from,
        ])
    }

    fn send_keys(&self, pane: Pane, keys: &str, literal: bool) -> Result<()> {
        if literal {
            tmux(&["send-keys", "-t", self.pane_id(pane), "-l", keys])?;
        } else {
            tmux(&["send-keys", "-t", self.pane_id(pane), keys])?;
        }
        Ok(())
    }

    /// Whether a process beyond the shell is running in the pane.
    fn has_foreground_process(&self, pane: Pane) -> Result<bool> {
        let command = self.pane_command(pane)?;
        Ok(!SHELLS.contains(&command.as_str()))
    }

    fn last_exit_code(&self, pane: Pane) -> Result<Option<i64>> {
        let captured = self.capture(pane, 50)?;
        for line in captured.lines().rev() {
            if let Some(rest) = line.trim().strip_prefix(EXIT_MARKER) {
                return Ok(rest.trim().parse().ok());
            }
        }
        Ok(None)
    }
}

impl PaneDriver for TmuxDriver {
    fn spawn(&mut self, pane: Pane, command: &str) -> Result<Option<u32>> {
        if self.has_foreground_process(pane)? {
            return Err(Error::Infrastructure(format!(
                "pane {} already has a running process",
                pane.index()
            )));
        }
        // Clear any half-typed input before sending the command line.
        self.send_keys(pane, "C-u", false)?;
        self.send_keys(pane, command, true)?;
        self.send_keys(pane, "Enter", false)?;
        self.pane_pid(pane)
    }

    fn poll(&mut self, pane: Pane) -> Result<PaneState> {
        if self.has_foreground_process(pane)? {
            return Ok(PaneState::Busy);
        }
        match self.last_exit_code(pane)? {
            Some(code) => Ok(PaneState::Exited {
                exit_code: Some(code),
            }),
            None => Ok(PaneState::Idle),
        }
    }

    fn kill(&mut self, pane: Pane, force: bool) -> Result<()> {
        self.send_keys(pane, "C-c", false)?;
        if !force {
            return Ok(());
        }

        // Grace period, polling for a clean exit before escalating.
        let deadline = Instant::now() + Duration::from_millis(GRACEFUL_KILL_WAIT_MS);
        while Instant::now() < deadline {
            if !self.has_foreground_process(pane)? {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(250));
        }

        if let Some(pid) = self.pane_pid(pane)? {
            let _ = Command::new("pkill")
                .args(["-9", "-P", &pid.to_string()])
                .status();
        }
        Ok(())
    }
}
