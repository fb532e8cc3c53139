//! Embedded relational store. The `Database` exclusively owns the connection;
//! every mutation runs inside a single write transaction and validates status
//! transitions before touching a row. Mutating methods return the event rows
//! they appended so the caller can mirror them onto the bus after commit.

mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    CreateProjectInput, Event, EventDraft, EventKind, Pane, Phase, PhaseStatus, Project,
    ProjectStatus, Session, SessionStatus, SubjectKind, Task, TaskDependency, TaskKind,
    TaskStatus,
};
use crate::plan::Plan;
use crate::scheduler::{toposort, Snapshot};
use crate::state;

pub use schema::SCHEMA;

/// Field deltas applied alongside a task status change.
#[derive(Debug, Default, Clone)]
pub struct TaskDelta {
    pub error_context: Option<String>,
    pub clear_error: bool,
    pub retry_count: Option<i64>,
}

/// Outcome of one bootstrap predicate run.
#[derive(Debug, Clone)]
pub struct CheckRecord {
    pub name: String,
    pub check_type: String,
    pub command: String,
    pub expected: Option<String>,
    pub actual_output: Option<String>,
    pub passed: bool,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the store at `path` with WAL journaling and full
    /// synchronous flush at transaction boundaries.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests and ephemeral use.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.lock().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- Projects --

    pub fn create_project(&self, input: CreateProjectInput) -> Result<Project> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        tx.execute(
            "INSERT INTO projects (id, name, root_dir, prd_path, bootstrap_path, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id.to_string(),
                input.name,
                input.root_dir,
                input.prd_path,
                input.bootstrap_path,
                ProjectStatus::Initialized.as_str(),
                now.to_rfc3339(),
            ],
        )?;
        let project = get_project_tx(&tx, id)?;
        tx.commit()?;
        Ok(project)
    }

    pub fn get_project(&self, id: Uuid) -> Result<Project> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM projects WHERE id = ?1",
            params![id.to_string()],
            project_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("project {id}")))
    }

    /// The single project a store holds. `init` creates exactly one.
    pub fn single_project(&self) -> Result<Project> {
        let conn = self.lock();
        conn.query_row("SELECT * FROM projects LIMIT 1", [], project_from_row)
            .optional()?
            .ok_or(Error::NoProject)
    }

    pub fn update_project_status(
        &self,
        id: Uuid,
        status: ProjectStatus,
    ) -> Result<(Project, Vec<Event>)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let before = get_project_tx(&tx, id)?;
        tx.execute(
            "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
        )?;
        let event = append_event_tx(
            &tx,
            &EventDraft::new(
                id,
                EventKind::StatusChange,
                SubjectKind::Project,
                id,
                serde_json::json!({
                    "from": before.status.as_str(),
                    "to": status.as_str(),
                }),
            ),
        )?;
        let project = get_project_tx(&tx, id)?;
        tx.commit()?;
        Ok((project, vec![event]))
    }

    // -- Plan --

    /// Atomically replace the project's phases, tasks, and dependency edges
    /// with a freshly parsed plan. Rejects unknown dependency names and
    /// cyclic plans before any row is touched.
    pub fn replace_plan(&self, project_id: Uuid, plan: &Plan) -> Result<Vec<Event>> {
        // Validate the dependency graph up front so a bad plan persists nothing.
        let mut names: Vec<&str> = Vec::new();
        for phase in &plan.phases {
            for task in &phase.tasks {
                names.push(task.name.as_str());
            }
        }
        let mut edges: Vec<(&str, &str)> = Vec::new();
        for phase in &plan.phases {
            for task in &phase.tasks {
                for dep in &task.depends_on {
                    if !names.contains(&dep.as_str()) {
                        return Err(Error::Validation(format!(
                            "task '{}' depends on unknown task '{}'",
                            task.name, dep
                        )));
                    }
                    edges.push((task.name.as_str(), dep.as_str()));
                }
            }
        }
        if let Err(cycle) = toposort(&names, &edges) {
            return Err(Error::Validation(format!(
                "plan contains a dependency cycle through: {}",
                cycle.join(", ")
            )));
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM phases WHERE project_id = ?1",
            params![project_id.to_string()],
        )?;

        let now = Utc::now().to_rfc3339();
        let mut task_ids: Vec<(String, Uuid)> = Vec::new();
        let mut phase_ids: Vec<Uuid> = Vec::new();
        for (phase_idx, phase) in plan.phases.iter().enumerate() {
            let phase_id = Uuid::new_v4();
            phase_ids.push(phase_id);
            tx.execute(
                "INSERT INTO phases (id, project_id, sequence, name, description, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                params![
                    phase_id.to_string(),
                    project_id.to_string(),
                    (phase_idx + 1) as i64,
                    phase.name,
                    phase.description,
                    now,
                ],
            )?;
            for (task_idx, task) in phase.tasks.iter().enumerate() {
                let task_id = Uuid::new_v4();
                task_ids.push((task.name.clone(), task_id));
                tx.execute(
                    "INSERT INTO tasks (id, phase_id, project_id, sequence, name, description, kind, status, retry_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8)",
                    params![
                        task_id.to_string(),
                        phase_id.to_string(),
                        project_id.to_string(),
                        (task_idx + 1) as i64,
                        task.name,
                        task.description,
                        task.kind.as_str(),
                        now,
                    ],
                )?;
            }
        }
        for phase in &plan.phases {
            for task in &phase.tasks {
                let task_id = lookup(&task_ids, &task.name)?;
                for dep in &task.depends_on {
                    let dep_id = lookup(&task_ids, dep)?;
                    tx.execute(
                        "INSERT INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
                        params![task_id.to_string(), dep_id.to_string()],
                    )?;
                }
            }
        }
        let event = append_event_tx(
            &tx,
            &EventDraft::new(
                project_id,
                EventKind::StatusChange,
                SubjectKind::Project,
                project_id,
                serde_json::json!({
                    "plan_replaced": true,
                    "phases": phase_ids.len(),
                    "tasks": task_ids.len(),
                }),
            ),
        )?;
        tx.commit()?;
        Ok(vec![event])
    }

    // -- Phases --

    pub fn list_phases(&self, project_id: Uuid) -> Result<Vec<Phase>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM phases WHERE project_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt.query_map(params![project_id.to_string()], phase_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_phase(&self, id: Uuid) -> Result<Phase> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM phases WHERE id = ?1",
            params![id.to_string()],
            phase_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("phase {id}")))
    }

    pub fn phase_by_sequence(&self, project_id: Uuid, sequence: i64) -> Result<Phase> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM phases WHERE project_id = ?1 AND sequence = ?2",
            params![project_id.to_string(), sequence],
            phase_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("phase {sequence}")))
    }

    // -- Tasks --

    pub fn get_task(&self, id: Uuid) -> Result<Task> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![id.to_string()],
            task_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    pub fn list_tasks(&self, project_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT t.* FROM tasks t
             JOIN phases p ON p.id = t.phase_id
             WHERE t.project_id = ?1
             ORDER BY p.sequence, t.sequence",
        )?;
        let rows = stmt.query_map(params![project_id.to_string()], task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_tasks_by_phase(&self, phase_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM tasks WHERE phase_id = ?1 ORDER BY sequence")?;
        let rows = stmt.query_map(params![phase_id.to_string()], task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_dependencies(&self, project_id: Uuid) -> Result<Vec<TaskDependency>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT d.task_id, d.depends_on_id FROM task_dependencies d
             JOIN tasks t ON t.id = d.task_id
             WHERE t.project_id = ?1",
        )?;
        let rows = stmt.query_map(params![project_id.to_string()], |row| {
            Ok(TaskDependency {
                task_id: parse_uuid(row.get::<_, String>(0)?)?,
                depends_on_id: parse_uuid(row.get::<_, String>(1)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Raw dependency edge insert. Plan-level cycle validation lives in
    /// [`Database::replace_plan`]; the scheduler's deadlock detection is the
    /// backstop for edges added behind its back.
    pub fn add_dependency(&self, task_id: Uuid, depends_on_id: Uuid) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
            params![task_id.to_string(), depends_on_id.to_string()],
        )?;
        Ok(())
    }

    /// Apply a status transition (validated against the state machine) plus
    /// optional error-context / retry-count deltas, then reconcile the owning
    /// phase. All inside one transaction.
    pub fn update_task_status(
        &self,
        task_id: Uuid,
        new_status: TaskStatus,
        delta: TaskDelta,
    ) -> Result<(Task, Vec<Event>)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let before = get_task_tx(&tx, task_id)?;
        state::check_task_transition(before.status, new_status)?;
        if let Some(retry_count) = delta.retry_count {
            if !(0..=1).contains(&retry_count) {
                return Err(Error::Validation(format!(
                    "retry_count out of range: {retry_count}"
                )));
            }
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE tasks SET status = ?1,
                 started_at = CASE WHEN ?1 = 'running' THEN ?2 ELSE started_at END,
                 completed_at = CASE WHEN ?1 = 'completed' THEN ?2 ELSE completed_at END
             WHERE id = ?3",
            params![new_status.as_str(), now, task_id.to_string()],
        )?;
        if new_status == TaskStatus::Pending {
            tx.execute(
                "UPDATE tasks SET started_at = NULL, completed_at = NULL WHERE id = ?1",
                params![task_id.to_string()],
            )?;
        }
        if delta.clear_error {
            tx.execute(
                "UPDATE tasks SET error_context = NULL WHERE id = ?1",
                params![task_id.to_string()],
            )?;
        } else if let Some(context) = &delta.error_context {
            tx.execute(
                "UPDATE tasks SET error_context = ?1 WHERE id = ?2",
                params![context, task_id.to_string()],
            )?;
        }
        if let Some(retry_count) = delta.retry_count {
            tx.execute(
                "UPDATE tasks SET retry_count = ?1 WHERE id = ?2",
                params![retry_count, task_id.to_string()],
            )?;
        }

        let mut events = Vec::new();
        events.push(append_event_tx(
            &tx,
            &EventDraft::new(
                before.project_id,
                EventKind::StatusChange,
                SubjectKind::Task,
                task_id,
                serde_json::json!({
                    "from": before.status.as_str(),
                    "to": new_status.as_str(),
                }),
            ),
        )?);
        if let Some(event) = reconcile_phase_tx(&tx, before.phase_id)? {
            events.push(event);
        }

        let task = get_task_tx(&tx, task_id)?;
        tx.commit()?;
        Ok((task, events))
    }

    /// Append a follow-up task at the tail of a phase (review of a completed
    /// coding task, or rework after a review requested changes).
    pub fn enqueue_task(
        &self,
        phase_id: Uuid,
        name: &str,
        description: Option<&str>,
        kind: TaskKind,
        depends_on: &[Uuid],
    ) -> Result<(Task, Vec<Event>)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let (project_id, next_seq): (Uuid, i64) = {
            let project_id: String = tx.query_row(
                "SELECT project_id FROM phases WHERE id = ?1",
                params![phase_id.to_string()],
                |row| row.get(0),
            )?;
            let max_seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM tasks WHERE phase_id = ?1",
                params![phase_id.to_string()],
                |row| row.get(0),
            )?;
            (parse_uuid(project_id)?, max_seq + 1)
        };
        let task_id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO tasks (id, phase_id, project_id, sequence, name, description, kind, status, retry_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8)",
            params![
                task_id.to_string(),
                phase_id.to_string(),
                project_id.to_string(),
                next_seq,
                name,
                description,
                kind.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        for dep in depends_on {
            tx.execute(
                "INSERT INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
                params![task_id.to_string(), dep.to_string()],
            )?;
        }
        let mut events = vec![append_event_tx(
            &tx,
            &EventDraft::new(
                project_id,
                EventKind::StatusChange,
                SubjectKind::Task,
                task_id,
                serde_json::json!({
                    "from": null,
                    "to": "pending",
                    "enqueued": name,
                    "kind": kind.as_str(),
                }),
            ),
        )?];
        // A phase that had already derived completed reopens here so the
        // new tail task can still be scheduled.
        if let Some(event) = reconcile_phase_tx(&tx, phase_id)? {
            events.push(event);
        }
        let task = get_task_tx(&tx, task_id)?;
        tx.commit()?;
        Ok((task, events))
    }

    pub fn set_task_brief_path(&self, task_id: Uuid, brief_path: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tasks SET brief_path = ?1 WHERE id = ?2",
            params![brief_path, task_id.to_string()],
        )?;
        Ok(())
    }

    /// Manual retry: clear retry budget and error context, mark pending.
    pub fn retry_task(&self, task_id: Uuid) -> Result<(Task, Vec<Event>)> {
        let task = self.get_task(task_id)?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Paused) {
            return Err(Error::Precondition(format!(
                "task {} is {}, only failed or paused tasks can be retried",
                task_id,
                task.status.as_str()
            )));
        }
        self.update_task_status(
            task_id,
            TaskStatus::Pending,
            TaskDelta {
                clear_error: true,
                retry_count: Some(0),
                ..TaskDelta::default()
            },
        )
    }

    /// Reset a task to pending: any running session is recorded as killed,
    /// retry budget and error context are cleared, and the owning phase is
    /// re-derived. Cascading semantics; bypasses the per-status tables by
    /// writing the reset rows directly.
    pub fn reset_task(&self, task_id: Uuid) -> Result<Vec<Event>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let task = get_task_tx(&tx, task_id)?;
        let mut events = reset_task_tx(&tx, &task)?;
        if let Some(event) = reconcile_phase_tx(&tx, task.phase_id)? {
            events.push(event);
        }
        tx.commit()?;
        Ok(events)
    }

    /// Reset every task in a phase and the phase row itself.
    pub fn reset_phase(&self, phase_id: Uuid) -> Result<Vec<Event>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let phase = get_phase_tx(&tx, phase_id)?;
        let tasks = list_tasks_by_phase_tx(&tx, phase_id)?;
        let mut events = Vec::new();
        for task in &tasks {
            events.extend(reset_task_tx(&tx, task)?);
        }
        tx.execute(
            "UPDATE phases SET status = 'pending', started_at = NULL, completed_at = NULL WHERE id = ?1",
            params![phase_id.to_string()],
        )?;
        if phase.status != PhaseStatus::Pending {
            events.push(append_event_tx(
                &tx,
                &EventDraft::new(
                    phase.project_id,
                    EventKind::StatusChange,
                    SubjectKind::Phase,
                    phase_id,
                    serde_json::json!({
                        "from": phase.status.as_str(),
                        "to": "pending",
                        "reset": true,
                    }),
                ),
            )?);
        }
        tx.commit()?;
        Ok(events)
    }

    // -- Sessions --

    /// The caller supplies the id so the session log path can be derived
    /// before the row exists.
    pub fn create_session(
        &self,
        id: Uuid,
        task_id: Uuid,
        project_id: Uuid,
        pane: Pane,
        pid: Option<u32>,
        log_path: Option<&str>,
    ) -> Result<(Session, Vec<Event>)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sessions (id, task_id, project_id, pane, pid, status, log_path, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?7)",
            params![
                id.to_string(),
                task_id.to_string(),
                project_id.to_string(),
                pane.index(),
                pid,
                log_path,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let event = append_event_tx(
            &tx,
            &EventDraft::new(
                project_id,
                EventKind::StatusChange,
                SubjectKind::Session,
                id,
                serde_json::json!({
                    "from": null,
                    "to": "running",
                    "task_id": task_id.to_string(),
                    "pane": pane.index(),
                }),
            ),
        )?;
        let session = get_session_tx(&tx, id)?;
        tx.commit()?;
        Ok((session, vec![event]))
    }

    pub fn get_session(&self, id: Uuid) -> Result<Session> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            params![id.to_string()],
            session_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("session {id}")))
    }

    pub fn active_sessions(&self, project_id: Uuid) -> Result<Vec<Session>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM sessions WHERE project_id = ?1 AND status = 'running' ORDER BY started_at",
        )?;
        let rows = stmt.query_map(params![project_id.to_string()], session_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn finish_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        exit_code: Option<i64>,
    ) -> Result<(Session, Vec<Event>)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let before = get_session_tx(&tx, session_id)?;
        state::check_session_transition(before.status, status)?;
        tx.execute(
            "UPDATE sessions SET status = ?1, exit_code = ?2, ended_at = ?3 WHERE id = ?4",
            params![
                status.as_str(),
                exit_code,
                Utc::now().to_rfc3339(),
                session_id.to_string(),
            ],
        )?;
        let event = append_event_tx(
            &tx,
            &EventDraft::new(
                before.project_id,
                EventKind::StatusChange,
                SubjectKind::Session,
                session_id,
                serde_json::json!({
                    "from": "running",
                    "to": status.as_str(),
                    "exit_code": exit_code,
                }),
            ),
        )?;
        let session = get_session_tx(&tx, session_id)?;
        tx.commit()?;
        Ok((session, vec![event]))
    }

    // -- Events --

    pub fn append_event(&self, draft: &EventDraft) -> Result<Event> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let event = append_event_tx(&tx, draft)?;
        tx.commit()?;
        Ok(event)
    }

    pub fn read_events(
        &self,
        project_id: Uuid,
        subject_id: Option<Uuid>,
        since_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM events
             WHERE project_id = ?1
               AND (?2 IS NULL OR subject_id = ?2)
               AND (?3 IS NULL OR id > ?3)
             ORDER BY id DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                project_id.to_string(),
                subject_id.map(|id| id.to_string()),
                since_id,
                limit as i64,
            ],
            event_from_row,
        )?;
        let mut events = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        events.reverse();
        Ok(events)
    }

    // -- Snapshot --

    /// Consistent read of phases, tasks, and dependencies in one transaction,
    /// used by the scheduler each tick.
    pub fn snapshot(&self, project_id: Uuid) -> Result<Snapshot> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let phases = {
            let mut stmt =
                tx.prepare("SELECT * FROM phases WHERE project_id = ?1 ORDER BY sequence")?;
            let rows = stmt.query_map(params![project_id.to_string()], phase_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let tasks = {
            let mut stmt = tx.prepare(
                "SELECT t.* FROM tasks t JOIN phases p ON p.id = t.phase_id
                 WHERE t.project_id = ?1 ORDER BY p.sequence, t.sequence",
            )?;
            let rows = stmt.query_map(params![project_id.to_string()], task_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let deps = {
            let mut stmt = tx.prepare(
                "SELECT d.task_id, d.depends_on_id FROM task_dependencies d
                 JOIN tasks t ON t.id = d.task_id WHERE t.project_id = ?1",
            )?;
            let rows = stmt.query_map(params![project_id.to_string()], |row| {
                Ok(TaskDependency {
                    task_id: parse_uuid(row.get::<_, String>(0)?)?,
                    depends_on_id: parse_uuid(row.get::<_, String>(1)?)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;
        Ok(Snapshot {
            phases,
            tasks,
            deps,
        })
    }

    // -- Bootstrap checks --

    pub fn record_check(&self, project_id: Uuid, record: &CheckRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO bootstrap_checks (id, project_id, check_name, check_type, command, expected, actual_output, passed, run_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Uuid::new_v4().to_string(),
                project_id.to_string(),
                record.name,
                record.check_type,
                record.command,
                record.expected,
                record.actual_output,
                record.passed as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

// -- Transaction-scoped helpers --

fn get_project_tx(tx: &Transaction<'_>, id: Uuid) -> Result<Project> {
    tx.query_row(
        "SELECT * FROM projects WHERE id = ?1",
        params![id.to_string()],
        project_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("project {id}")))
}

fn get_phase_tx(tx: &Transaction<'_>, id: Uuid) -> Result<Phase> {
    tx.query_row(
        "SELECT * FROM phases WHERE id = ?1",
        params![id.to_string()],
        phase_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("phase {id}")))
}

fn get_task_tx(tx: &Transaction<'_>, id: Uuid) -> Result<Task> {
    tx.query_row(
        "SELECT * FROM tasks WHERE id = ?1",
        params![id.to_string()],
        task_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("task {id}")))
}

fn get_session_tx(tx: &Transaction<'_>, id: Uuid) -> Result<Session> {
    tx.query_row(
        "SELECT * FROM sessions WHERE id = ?1",
        params![id.to_string()],
        session_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("session {id}")))
}

fn list_tasks_by_phase_tx(tx: &Transaction<'_>, phase_id: Uuid) -> Result<Vec<Task>> {
    let mut stmt = tx.prepare("SELECT * FROM tasks WHERE phase_id = ?1 ORDER BY sequence")?;
    let rows = stmt.query_map(params![phase_id.to_string()], task_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn append_event_tx(tx: &Transaction<'_>, draft: &EventDraft) -> Result<Event> {
    tx.execute(
        "INSERT INTO events (project_id, kind, subject_kind, subject_id, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            draft.project_id.to_string(),
            draft.kind.as_str(),
            draft.subject_kind.as_str(),
            draft.subject_id.to_string(),
            draft.payload.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    let id = tx.last_insert_rowid();
    Ok(tx.query_row(
        "SELECT * FROM events WHERE id = ?1",
        params![id],
        event_from_row,
    )?)
}

/// Mark any running session for the task as killed and write the task row
/// back to a clean pending state.
fn reset_task_tx(tx: &Transaction<'_>, task: &Task) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    let running: Vec<String> = {
        let mut stmt =
            tx.prepare("SELECT id FROM sessions WHERE task_id = ?1 AND status = 'running'")?;
        let rows = stmt.query_map(params![task.id.to_string()], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for session_str in running {
        let session_id = parse_uuid(session_str.clone())?;
        tx.execute(
            "UPDATE sessions SET status = 'killed', ended_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), session_str],
        )?;
        events.push(append_event_tx(
            tx,
            &EventDraft::new(
                task.project_id,
                EventKind::StatusChange,
                SubjectKind::Session,
                session_id,
                serde_json::json!({"from": "running", "to": "killed", "reset": true}),
            ),
        )?);
    }
    tx.execute(
        "UPDATE tasks SET status = 'pending', retry_count = 0, error_context = NULL,
             started_at = NULL, completed_at = NULL
         WHERE id = ?1",
        params![task.id.to_string()],
    )?;
    if task.status != TaskStatus::Pending {
        events.push(append_event_tx(
            tx,
            &EventDraft::new(
                task.project_id,
                EventKind::StatusChange,
                SubjectKind::Task,
                task.id,
                serde_json::json!({
                    "from": task.status.as_str(),
                    "to": "pending",
                    "reset": true,
                }),
            ),
        )?);
    }
    Ok(events)
}

/// Re-derive the phase status from its tasks and apply it when the state
/// machine permits. No-op transitions and derivations the table forbids
/// (e.g. a running phase momentarily deriving pending between dispatches)
/// are skipped.
fn reconcile_phase_tx(tx: &Transaction<'_>, phase_id: Uuid) -> Result<Option<Event>> {
    let phase = get_phase_tx(tx, phase_id)?;
    let statuses: Vec<TaskStatus> = list_tasks_by_phase_tx(tx, phase_id)?
        .iter()
        .map(|t| t.status)
        .collect();
    let derived = state::derive_phase_status(&statuses);
    if derived == phase.status || !state::phase_transition_allowed(phase.status, derived) {
        return Ok(None);
    }
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE phases SET status = ?1,
             started_at = CASE WHEN ?1 = 'running' THEN ?2 ELSE started_at END,
             completed_at = CASE WHEN ?1 IN ('completed', 'failed') THEN ?2 ELSE completed_at END
         WHERE id = ?3",
        params![derived.as_str(), now, phase_id.to_string()],
    )?;
    let event = append_event_tx(
        tx,
        &EventDraft::new(
            phase.project_id,
            EventKind::StatusChange,
            SubjectKind::Phase,
            phase_id,
            serde_json::json!({
                "from": phase.status.as_str(),
                "to": derived.as_str(),
            }),
        ),
    )?;
    Ok(Some(event))
}

fn lookup(pairs: &[(String, Uuid)], name: &str) -> Result<Uuid> {
    pairs
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, id)| *id)
        .ok_or_else(|| Error::Validation(format!("unknown task name: {name}")))
}

// -- Row mappers --

fn parse_uuid(s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_dt(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_dt_opt(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(parse_dt).transpose()
}

fn bad_enum(what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unknown {what}: {value}").into(),
    )
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    let status: String = row.get("status")?;
    Ok(Project {
        id: parse_uuid(row.get("id")?)?,
        name: row.get("name")?,
        root_dir: row.get("root_dir")?,
        prd_path: row.get("prd_path")?,
        bootstrap_path: row.get("bootstrap_path")?,
        status: ProjectStatus::from_str(&status).ok_or_else(|| bad_enum("project status", &status))?,
        created_at: parse_dt(row.get("created_at")?)?,
        updated_at: parse_dt(row.get("updated_at")?)?,
    })
}

fn phase_from_row(row: &Row<'_>) -> rusqlite::Result<Phase> {
    let status: String = row.get("status")?;
    Ok(Phase {
        id: parse_uuid(row.get("id")?)?,
        project_id: parse_uuid(row.get("project_id")?)?,
        sequence: row.get("sequence")?,
        name: row.get("name")?,
        description: row.get("description")?,
        status: PhaseStatus::from_str(&status).ok_or_else(|| bad_enum("phase status", &status))?,
        started_at: parse_dt_opt(row.get("started_at")?)?,
        completed_at: parse_dt_opt(row.get("completed_at")?)?,
        created_at: parse_dt(row.get("created_at")?)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let kind: String = row.get("kind")?;
    Ok(Task {
        id: parse_uuid(row.get("id")?)?,
        phase_id: parse_uuid(row.get("phase_id")?)?,
        project_id: parse_uuid(row.get("project_id")?)?,
        sequence: row.get("sequence")?,
        name: row.get("name")?,
        description: row.get("description")?,
        kind: TaskKind::from_str(&kind).ok_or_else(|| bad_enum("task kind", &kind))?,
        brief_path: row.get("brief_path")?,
        status: TaskStatus::from_str(&status).ok_or_else(|| bad_enum("task status", &status))?,
        retry_count: row.get("retry_count")?,
        error_context: row.get("error_context")?,
        started_at: parse_dt_opt(row.get("started_at")?)?,
        completed_at: parse_dt_opt(row.get("completed_at")?)?,
        created_at: parse_dt(row.get("created_at")?)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get("status")?;
    let pane: i64 = row.get("pane")?;
    Ok(Session {
        id: parse_uuid(row.get("id")?)?,
        task_id: parse_uuid(row.get("task_id")?)?,
        project_id: parse_uuid(row.get("project_id")?)?,
        pane: Pane::from_index(pane).ok_or_else(|| bad_enum("pane", &pane.to_string()))?,
        pid: row.get("pid")?,
        status: SessionStatus::from_str(&status).ok_or_else(|| bad_enum("session status", &status))?,
        exit_code: row.get("exit_code")?,
        log_path: row.get("log_path")?,
        started_at: parse_dt(row.get("started_at")?)?,
        ended_at: parse_dt_opt(row.get("ended_at")?)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let kind: String = row.get("kind")?;
    let subject_kind: String = row.get("subject_kind")?;
    let payload: String = row.get("payload")?;
    Ok(Event {
        id: row.get("id")?,
        project_id: parse_uuid(row.get("project_id")?)?,
        kind: EventKind::from_str(&kind).ok_or_else(|| bad_enum("event kind", &kind))?,
        subject_kind: SubjectKind::from_str(&subject_kind)
            .ok_or_else(|| bad_enum("subject kind", &subject_kind))?,
        subject_id: parse_uuid(row.get("subject_id")?)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        created_at: parse_dt(row.get("created_at")?)?,
    })
}
