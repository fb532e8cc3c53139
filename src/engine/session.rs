//! Agent session lifecycle over a [`PaneDriver`]: spawn into the right pane,
//! reap exits, and kill on demand. The store is the source of truth for
//! which sessions are active; the driver only answers liveness questions.

use std::path::Path;

use uuid::Uuid;

use crate::config::ProjectPaths;
use crate::db::Database;
use crate::engine::tmux::{PaneDriver, PaneState, EXIT_MARKER};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::models::{Event, Pane, Session, SessionStatus, Task, TaskKind};

/// A session whose pane process has ended, with the exit code if the pane
/// still showed it.
#[derive(Debug, Clone)]
pub struct ReapedSession {
    pub session: Session,
    pub exit_code: Option<i64>,
}

pub struct SessionManager<D: PaneDriver> {
    driver: D,
    paths: ProjectPaths,
}

impl<D: PaneDriver> SessionManager<D> {
    pub fn new(driver: D, paths: ProjectPaths) -> Self {
        Self { driver, paths }
    }

    pub fn pane_for(task: &Task) -> Pane {
        match task.kind {
            TaskKind::Coding => Pane::Coding,
            TaskKind::Review => Pane::Review,
        }
    }

    /// Spawn an agent session for a task on its pane and record the row.
    pub fn spawn(
        &mut self,
        db: &Database,
        bus: &EventBus,
        task: &Task,
        brief_path: &Path,
    ) -> Result<Session> {
        let pane = Self::pane_for(task);
        let session_id = Uuid::new_v4();
        let log_path = self.paths.session_log_path(session_id);
        let command = agent_command(brief_path, &log_path);

        let pid = self.driver.spawn(pane, &command)?;
        let (session, events) = db.create_session(
            session_id,
            task.id,
            task.project_id,
            pane,
            pid,
            log_path.to_str(),
        )?;
        bus.publish_all(&events);
        Ok(session)
    }

    /// Probe every active session; finish nothing here — classification of
    /// the task outcome belongs to the engine's reap step.
    pub fn check_active(&mut self, db: &Database, project_id: Uuid) -> Result<Vec<ReapedSession>> {
        let mut reaped = Vec::new();
        for session in db.active_sessions(project_id)? {
            match self.driver.poll(session.pane)? {
                PaneState::Busy => {}
                PaneState::Exited { exit_code } => reaped.push(ReapedSession {
                    session,
                    exit_code,
                }),
                // The pane shows a bare shell with no exit marker: the
                // process is gone but its code is unrecoverable.
                PaneState::Idle => reaped.push(ReapedSession {
                    session,
                    exit_code: None,
                }),
            }
        }
        Ok(reaped)
    }

    /// Force-terminate a session's pane process and record the row as
    /// killed. The task-side consequences are applied by the caller.
    pub fn kill(
        &mut self,
        db: &Database,
        bus: &EventBus,
        session: &Session,
        force: bool,
    ) -> Result<Vec<Event>> {
        if session.status != SessionStatus::Running {
            return Err(Error::Precondition(format!(
                "session {} is {}, only running sessions can be killed",
                session.id,
                session.status.as_str()
            )));
        }
        self.driver.kill(session.pane, force)?;
        let (_, events) = db.finish_session(session.id, SessionStatus::Killed, None)?;
        bus.publish_all(&events);
        Ok(events)
    }
}

/// The command line handed to a pane: feed the brief to the agent headless,
/// mirror output into the session log, then surface the exit code where the
/// driver can find it.
fn agent_command(brief_path: &Path, log_path: &Path) -> String {
    format!(
        "claude -p --output-format text < {brief} 2>&1 | tee {log}; echo \"{marker} $?\"",
        brief = shell_quote(brief_path),
        log = shell_quote(log_path),
        marker = EXIT_MARKER,
    )
}

fn shell_quote(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'))
    {
        s.into_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_command_pipes_brief_and_logs() {
        let command = agent_command(
            Path::new("/p/.tc/briefs/t.md"),
            Path::new("/p/.tc/logs/session-1.log"),
        );
        assert!(command.starts_with("claude -p"));
        assert!(command.contains("< /p/.tc/briefs/t.md"));
        assert!(command.contains("tee /p/.tc/logs/session-1.log"));
        assert!(command.contains(EXIT_MARKER));
    }

    #[test]
    fn paths_with_spaces_are_quoted() {
        let command = agent_command(
            Path::new("/p dir/brief.md"),
            Path::new("/p dir/session.log"),
        );
        assert!(command.contains("'/p dir/brief.md'"));
    }
}
