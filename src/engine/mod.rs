//! The reconciliation loop: reap exited sessions, apply retry policy, ask
//! the scheduler for a decision, actuate it on the panes, heartbeat.
//!
//! A single engine task owns this loop and is the only writer of task status
//! outside the control-plane handlers. The agent's progress arrives
//! asynchronously through the store; the engine never blocks on it.

pub mod session;
pub mod tmux;

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::briefs::{BriefContext, BriefRenderer, CompletedWork};
use crate::config::{EngineConfig, ProjectPaths};
use crate::control;
use crate::db::{Database, TaskDelta};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::models::{
    Event, EventDraft, EventKind, Pane, ProjectStatus, SessionStatus, SubjectKind, Task,
    TaskKind, TaskStatus,
};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scheduler::{schedule, Decision, EngineView};

use self::session::SessionManager;
use self::tmux::PaneDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Completed,
    Deadlocked,
}

pub struct Engine<D: PaneDriver> {
    db: Database,
    bus: EventBus,
    sessions: SessionManager<D>,
    renderer: BriefRenderer,
    retry: RetryPolicy,
    config: EngineConfig,
    paths: ProjectPaths,
    project_id: Uuid,
    paused: bool,
    stopped: bool,
    infra_failures: u32,
}

impl<D: PaneDriver> Engine<D> {
    pub fn new(
        db: Database,
        bus: EventBus,
        driver: D,
        paths: ProjectPaths,
        config: EngineConfig,
        project_id: Uuid,
    ) -> Self {
        let retry = RetryPolicy::new(config.max_retries);
        Self {
            db,
            bus,
            sessions: SessionManager::new(driver, paths.clone()),
            renderer: BriefRenderer::new(),
            retry,
            config,
            paths,
            project_id,
            paused: false,
            stopped: false,
            infra_failures: 0,
        }
    }

    /// Tick at the configured cadence until the project completes, the
    /// scheduler declares deadlock, or `stop` is called.
    pub async fn run(&mut self) -> Result<()> {
        let (_, events) = self
            .db
            .update_project_status(self.project_id, ProjectStatus::Running)?;
        self.bus.publish_all(&events);
        info!(project = %self.project_id, "engine started");

        loop {
            if self.stopped {
                info!("engine stopped");
                return Ok(());
            }
            match self.tick()? {
                TickOutcome::Continue => {
                    tokio::time::sleep(self.config.tick_interval).await;
                }
                TickOutcome::Completed => {
                    info!("all tasks completed");
                    return Ok(());
                }
                TickOutcome::Deadlocked => {
                    return Err(Error::Deadlock(
                        "no runnable task and no active session".into(),
                    ));
                }
            }
        }
    }

    /// One reconciliation pass. Infrastructure faults are absorbed up to the
    /// configured limit; the tick cadence is the backoff.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        match self.tick_inner() {
            Ok(outcome) => {
                self.infra_failures = 0;
                Ok(outcome)
            }
            Err(Error::Infrastructure(message)) => {
                self.infra_failures += 1;
                warn!(
                    failures = self.infra_failures,
                    limit = self.config.infra_failure_limit,
                    %message,
                    "infrastructure fault during tick"
                );
                if self.infra_failures >= self.config.infra_failure_limit {
                    let event = self.db.append_event(&EventDraft::new(
                        self.project_id,
                        EventKind::Error,
                        SubjectKind::Project,
                        self.project_id,
                        serde_json::json!({
                            "infrastructure": message,
                            "consecutive_failures": self.infra_failures,
                        }),
                    ))?;
                    self.bus.publish(&event);
                    let (_, events) = self
                        .db
                        .update_project_status(self.project_id, ProjectStatus::Failed)?;
                    self.bus.publish_all(&events);
                    return Err(Error::Infrastructure(message));
                }
                Ok(TickOutcome::Continue)
            }
            Err(e) => Err(e),
        }
    }

    fn tick_inner(&mut self) -> Result<TickOutcome> {
        self.reap()?;
        self.enforce_timeouts()?;
        self.apply_retry_policy()?;

        let project = self.db.get_project(self.project_id)?;
        let snapshot = self.db.snapshot(self.project_id)?;
        let active = self.db.active_sessions(self.project_id)?;
        let view = EngineView {
            pane0_busy: active.iter().any(|s| s.pane == Pane::Coding),
            pane1_busy: active.iter().any(|s| s.pane == Pane::Review),
            paused: self.paused || project.status == ProjectStatus::Paused,
        };
        let decision = schedule(&snapshot, &view);
        let outcome = self.actuate(decision)?;
        self.heartbeat();
        Ok(outcome)
    }

    /// Step 1: for every session whose pane process ended, close the session
    /// row and classify the task by what the control plane reported.
    fn reap(&mut self) -> Result<()> {
        for reaped in self.sessions.check_active(&self.db, self.project_id)? {
            let session = &reaped.session;
            let task = self.db.get_task(session.task_id)?;
            debug!(session = %session.id, task = %task.id, code = ?reaped.exit_code, "session exited");

            match task.status {
                TaskStatus::Completed => {
                    let (_, events) = self.db.finish_session(
                        session.id,
                        SessionStatus::Completed,
                        reaped.exit_code,
                    )?;
                    self.bus.publish_all(&events);
                }
                TaskStatus::Failed => {
                    let (_, events) = self.db.finish_session(
                        session.id,
                        SessionStatus::Failed,
                        reaped.exit_code,
                    )?;
                    self.bus.publish_all(&events);
                }
                TaskStatus::Running => {
                    // Exited without reporting either way.
                    let (_, events) = self.db.finish_session(
                        session.id,
                        SessionStatus::Failed,
                        reaped.exit_code,
                    )?;
                    self.bus.publish_all(&events);
                    let context = match reaped.exit_code {
                        Some(code) => format!("session exited without reporting (exit={code})"),
                        None => "session exited without reporting (exit=unknown)".to_string(),
                    };
                    let (_, events) = self.db.update_task_status(
                        task.id,
                        TaskStatus::Failed,
                        TaskDelta {
                            error_context: Some(context),
                            ..TaskDelta::default()
                        },
                    )?;
                    self.bus.publish_all(&events);
                }
                _ => {
                    // The task was reset or paused out from under the
                    // session; record the exit without touching the task.
                    let (_, events) = self.db.finish_session(
                        session.id,
                        SessionStatus::Killed,
                        reaped.exit_code,
                    )?;
                    self.bus.publish_all(&events);
                }
            }
        }
        Ok(())
    }

    /// Kill sessions that blew their wall-clock budget. The kill is recorded
    /// like an operator kill: session killed, task failed with "killed".
    fn enforce_timeouts(&mut self) -> Result<()> {
        let Some(limit) = self.config.task_timeout else {
            return Ok(());
        };
        for session in self.db.active_sessions(self.project_id)? {
            let elapsed = (Utc::now() - session.started_at)
                .to_std()
                .unwrap_or_default();
            if elapsed > limit {
                warn!(session = %session.id, ?elapsed, "session exceeded wall-clock limit");
                self.kill_session(session.id, true)?;
            }
        }
        Ok(())
    }

    /// Step 2: decide retry or pause for failed tasks whose session has
    /// fully wound down.
    fn apply_retry_policy(&mut self) -> Result<()> {
        let still_active: HashSet<Uuid> = self
            .db
            .active_sessions(self.project_id)?
            .iter()
            .map(|s| s.task_id)
            .collect();
        let failed: Vec<Task> = self
            .db
            .list_tasks(self.project_id)?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Failed && !still_active.contains(&t.id))
            .collect();

        for task in failed {
            match self.retry.decide(&task) {
                RetryDecision::Retry => {
                    info!(task = %task.id, attempt = task.retry_count + 1, "retrying failed task");
                    let (_, events) = self.db.update_task_status(
                        task.id,
                        TaskStatus::Pending,
                        TaskDelta {
                            retry_count: Some(task.retry_count + 1),
                            ..TaskDelta::default()
                        },
                    )?;
                    self.bus.publish_all(&events);
                }
                RetryDecision::Pause => {
                    warn!(task = %task.id, "task failed after retry, pausing");
                    let (_, events) = self.db.update_task_status(
                        task.id,
                        TaskStatus::Paused,
                        TaskDelta::default(),
                    )?;
                    self.bus.publish_all(&events);
                    self.paused = true;
                    let (_, events) = self
                        .db
                        .update_project_status(self.project_id, ProjectStatus::Paused)?;
                    self.bus.publish_all(&events);
                }
            }
        }
        Ok(())
    }

    /// Step 4: act on the scheduler's decision.
    fn actuate(&mut self, decision: Decision) -> Result<TickOutcome> {
        match decision {
            Decision::DispatchCoding(task) | Decision::DispatchReview(task) => {
                self.dispatch(task)?;
                Ok(TickOutcome::Continue)
            }
            Decision::Idle => Ok(TickOutcome::Continue),
            Decision::Complete => {
                let (_, events) = self
                    .db
                    .update_project_status(self.project_id, ProjectStatus::Completed)?;
                self.bus.publish_all(&events);
                Ok(TickOutcome::Completed)
            }
            Decision::Deadlock { blocked } => {
                warn!(blocked = blocked.len(), "scheduler reported deadlock");
                let event = self.db.append_event(&EventDraft::new(
                    self.project_id,
                    EventKind::Error,
                    SubjectKind::Project,
                    self.project_id,
                    serde_json::json!({
                        "deadlock": true,
                        "blocked": blocked,
                    }),
                ))?;
                self.bus.publish(&event);
                let (_, events) = self
                    .db
                    .update_project_status(self.project_id, ProjectStatus::Failed)?;
                self.bus.publish_all(&events);
                Ok(TickOutcome::Deadlocked)
            }
        }
    }

    /// Render the brief, spawn the pane session, record it, and mark the
    /// task running. The state machine's pending->running edge makes
    /// dispatch at-most-once per attempt.
    fn dispatch(&mut self, task: Task) -> Result<()> {
        info!(task = %task.id, name = %task.name, kind = task.kind.as_str(), "dispatching");
        let phase = self.db.get_phase(task.phase_id)?;
        let context = self.build_brief_context(&task)?;
        let brief = self.renderer.render_task_brief(&task, &phase, &context)?;

        std::fs::create_dir_all(&self.paths.briefs_dir)?;
        std::fs::create_dir_all(&self.paths.logs_dir)?;
        let brief_path = self.paths.brief_path(task.id);
        std::fs::write(&brief_path, brief)?;
        self.db
            .set_task_brief_path(task.id, &brief_path.to_string_lossy())?;

        self.sessions.spawn(&self.db, &self.bus, &task, &brief_path)?;
        let (_, events) =
            self.db
                .update_task_status(task.id, TaskStatus::Running, TaskDelta::default())?;
        self.bus.publish_all(&events);
        Ok(())
    }

    fn build_brief_context(&self, task: &Task) -> Result<BriefContext> {
        let project = self.db.get_project(self.project_id)?;
        let phases = self.db.list_phases(self.project_id)?;
        let deps = self.db.list_dependencies(self.project_id)?;
        let upstream: Vec<Uuid> = deps
            .iter()
            .filter(|d| d.task_id == task.id)
            .map(|d| d.depends_on_id)
            .collect();

        let mut completed = Vec::new();
        let mut files_under_review = Vec::new();
        for id in &upstream {
            let dep = self.db.get_task(*id)?;
            if dep.status != TaskStatus::Completed {
                continue;
            }
            let (summary, files_changed) = control::completion_report(&self.db, &dep)?;
            if task.kind == TaskKind::Review {
                files_under_review.extend(files_changed.iter().cloned());
            }
            completed.push(CompletedWork {
                name: dep.name,
                summary,
                files_changed,
            });
        }

        let error_context = task
            .error_context
            .as_deref()
            .map(|raw| self.retry.retry_context(task, raw));

        let project_overview = std::fs::read_to_string(&project.prd_path)
            .map(|prd| head(&prd, 2000))
            .unwrap_or_default();

        Ok(BriefContext {
            project_name: project.name,
            project_overview,
            total_phases: phases.len() as i64,
            completed,
            review_findings: control::findings_for(&self.db, task)?,
            error_context,
            files_under_review,
        })
    }

    /// Step 5: bus-only heartbeat. Ticks are not state changes, so they are
    /// not persisted to the log.
    fn heartbeat(&self) {
        self.bus.publish(&Event {
            id: 0,
            project_id: self.project_id,
            kind: EventKind::EngineTick,
            subject_kind: SubjectKind::Project,
            subject_id: self.project_id,
            payload: serde_json::json!({ "paused": self.paused }),
            created_at: Utc::now(),
        });
    }

    /// Force-terminate a session: pane interrupt (escalating when `force`),
    /// session row killed, task failed with `error_context="killed"`. The
    /// retry policy picks the task up on the next tick.
    pub fn kill_session(&mut self, session_id: Uuid, force: bool) -> Result<()> {
        let session = self.db.get_session(session_id)?;
        self.sessions.kill(&self.db, &self.bus, &session, force)?;
        let task = self.db.get_task(session.task_id)?;
        if task.status == TaskStatus::Running {
            let (_, events) = self.db.update_task_status(
                task.id,
                TaskStatus::Failed,
                TaskDelta {
                    error_context: Some("killed".into()),
                    ..TaskDelta::default()
                },
            )?;
            self.bus.publish_all(&events);
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.paused = true;
        let (_, events) = self
            .db
            .update_project_status(self.project_id, ProjectStatus::Paused)?;
        self.bus.publish_all(&events);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.paused = false;
        let (_, events) = self
            .db
            .update_project_status(self.project_id, ProjectStatus::Running)?;
        self.bus.publish_all(&events);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

fn head(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}
