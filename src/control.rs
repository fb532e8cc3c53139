//! Control-plane operations the agent invokes from inside a session.
//!
//! Each operation validates its precondition against the task's current
//! status and fails with a precondition error — never mutating state — when
//! the engine has already moved on. The MCP layer in `mcp` is a thin
//! transport over these functions; the store is the synchronization point
//! with the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::models::{
    Event, EventDraft, EventKind, Phase, SubjectKind, Task, TaskKind, TaskStatus,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
}

impl ReviewVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(Self::Approved),
            "changes_requested" => Some(Self::ChangesRequested),
            _ => None,
        }
    }
}

/// Read-only context for `get_context`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskContext {
    pub task: Task,
    pub phase: Phase,
    pub completed_tasks: Vec<CompletedTask>,
    pub review_findings: Vec<String>,
    pub recent_events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedTask {
    pub id: Uuid,
    pub name: String,
    pub summary: Option<String>,
    pub files_changed: Vec<String>,
}

fn require_running(task: &Task) -> Result<()> {
    if task.status != TaskStatus::Running {
        return Err(Error::Precondition(format!(
            "task {} is {}, expected running",
            task.id,
            task.status.as_str()
        )));
    }
    Ok(())
}

/// Append a progress event for a running task.
pub fn report_progress(
    db: &Database,
    bus: &EventBus,
    task_id: Uuid,
    percent: Option<u8>,
    note: &str,
) -> Result<()> {
    let task = db.get_task(task_id)?;
    require_running(&task)?;
    let event = db.append_event(&EventDraft::new(
        task.project_id,
        EventKind::Progress,
        SubjectKind::Task,
        task_id,
        serde_json::json!({
            "note": note,
            "percent": percent,
        }),
    ))?;
    bus.publish(&event);
    Ok(())
}

/// Complete a running coding task and enqueue its review.
pub fn report_completion(
    db: &Database,
    bus: &EventBus,
    task_id: Uuid,
    summary: &str,
    files_changed: &[String],
) -> Result<Task> {
    let task = db.get_task(task_id)?;
    require_running(&task)?;
    if task.kind != TaskKind::Coding {
        return Err(Error::Precondition(format!(
            "task {} is a {} task, completion reports are for coding tasks",
            task_id,
            task.kind.as_str()
        )));
    }

    let (_, events) =
        db.update_task_status(task_id, TaskStatus::Completed, Default::default())?;
    bus.publish_all(&events);

    let completion_event = db.append_event(&EventDraft::new(
        task.project_id,
        EventKind::Progress,
        SubjectKind::Task,
        task_id,
        serde_json::json!({
            "completed": true,
            "summary": summary,
            "files_changed": files_changed,
        }),
    ))?;
    bus.publish(&completion_event);

    let (review, events) = db.enqueue_task(
        task.phase_id,
        &format!("Review: {}", task.name),
        Some(&format!("Code review for: {}", task.name)),
        TaskKind::Review,
        &[task_id],
    )?;
    bus.publish_all(&events);
    Ok(review)
}

/// Fail a running task. The session row stays open until the pane actually
/// exits and the reaper observes it.
pub fn report_failure(
    db: &Database,
    bus: &EventBus,
    task_id: Uuid,
    message: &str,
    context: Option<&str>,
) -> Result<()> {
    let task = db.get_task(task_id)?;
    require_running(&task)?;

    let error_context = match context {
        Some(context) => format!("{message}\n{context}"),
        None => message.to_string(),
    };
    let (_, events) = db.update_task_status(
        task_id,
        TaskStatus::Failed,
        crate::db::TaskDelta {
            error_context: Some(error_context),
            ..Default::default()
        },
    )?;
    bus.publish_all(&events);

    let event = db.append_event(&EventDraft::new(
        task.project_id,
        EventKind::Error,
        SubjectKind::Task,
        task_id,
        serde_json::json!({
            "message": message,
            "context": context,
        }),
    ))?;
    bus.publish(&event);
    Ok(())
}

/// Record a review verdict. `changes_requested` creates a follow-up coding
/// task depending on the reviewed task; findings flow into its brief.
pub fn report_review(
    db: &Database,
    bus: &EventBus,
    task_id: Uuid,
    verdict: ReviewVerdict,
    findings: &[String],
) -> Result<Option<Task>> {
    let task = db.get_task(task_id)?;
    require_running(&task)?;
    if task.kind != TaskKind::Review {
        return Err(Error::Precondition(format!(
            "task {} is a {} task, review reports are for review tasks",
            task_id,
            task.kind.as_str()
        )));
    }

    let (_, events) =
        db.update_task_status(task_id, TaskStatus::Completed, Default::default())?;
    bus.publish_all(&events);

    let event = db.append_event(&EventDraft::new(
        task.project_id,
        EventKind::ReviewVerdict,
        SubjectKind::Task,
        task_id,
        serde_json::json!({
            "verdict": verdict.as_str(),
            "findings": findings,
        }),
    ))?;
    bus.publish(&event);

    if verdict == ReviewVerdict::Approved {
        return Ok(None);
    }

    // The review task's dependency edge points at the coding task it
    // examined; the rework task depends on that same task.
    let deps = db.list_dependencies(task.project_id)?;
    let reviewed: Vec<Uuid> = deps
        .iter()
        .filter(|d| d.task_id == task_id)
        .map(|d| d.depends_on_id)
        .collect();
    let reworked_name = match reviewed.first() {
        Some(id) => db.get_task(*id)?.name,
        None => task.name.clone(),
    };
    let (followup, events) = db.enqueue_task(
        task.phase_id,
        &format!("Rework: {reworked_name}"),
        Some(&format!(
            "Address review findings for: {reworked_name}"
        )),
        TaskKind::Coding,
        &reviewed,
    )?;
    bus.publish_all(&events);
    Ok(Some(followup))
}

/// Read-only context assembly: the task, its phase, finished upstream work
/// with reported summaries, review findings addressed to it, and the last
/// events on its subject.
pub fn get_context(db: &Database, task_id: Uuid) -> Result<TaskContext> {
    let task = db.get_task(task_id)?;
    let phase = db.get_phase(task.phase_id)?;

    let completed_tasks = db
        .list_tasks(task.project_id)?
        .into_iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| {
            let (summary, files_changed) = completion_report(db, &t)?;
            Ok(CompletedTask {
                id: t.id,
                name: t.name,
                summary,
                files_changed,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let review_findings = findings_for(db, &task)?;
    let recent_events = db.read_events(task.project_id, Some(task_id), None, 20)?;

    Ok(TaskContext {
        task,
        phase,
        completed_tasks,
        review_findings,
        recent_events,
    })
}

/// Publish a human-input request, then poll the log for a response recorded
/// against it until `timeout` elapses. Responses are appended by an observer
/// (dashboard or CLI) as a second `human_input_request` event carrying a
/// `request_id` back-reference.
pub async fn request_human_input(
    db: &Database,
    bus: &EventBus,
    task_id: Uuid,
    question: &str,
    choices: &[String],
    timeout: Duration,
) -> Result<Option<String>> {
    let task = db.get_task(task_id)?;
    let request = db.append_event(&EventDraft::new(
        task.project_id,
        EventKind::HumanInputRequest,
        SubjectKind::Task,
        task_id,
        serde_json::json!({
            "question": question,
            "choices": choices,
        }),
    ))?;
    bus.publish(&request);

    let poll_interval = Duration::from_millis(500);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(response) = find_response(db, &task, request.id)? {
            return Ok(Some(response));
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(poll_interval.min(timeout)).await;
    }
}

/// Record an operator's answer to a pending human-input request.
pub fn record_human_response(
    db: &Database,
    bus: &EventBus,
    project_id: Uuid,
    task_id: Uuid,
    request_id: i64,
    response: &str,
) -> Result<()> {
    let event = db.append_event(&EventDraft::new(
        project_id,
        EventKind::HumanInputRequest,
        SubjectKind::Task,
        task_id,
        serde_json::json!({
            "request_id": request_id,
            "response": response,
        }),
    ))?;
    bus.publish(&event);
    Ok(())
}

fn find_response(db: &Database, task: &Task, request_id: i64) -> Result<Option<String>> {
    let events = db.read_events(task.project_id, Some(task.id), Some(request_id), 50)?;
    for event in events {
        if event.kind != EventKind::HumanInputRequest {
            continue;
        }
        let matches_request = event
            .payload
            .get("request_id")
            .and_then(|v| v.as_i64())
            .is_some_and(|id| id == request_id);
        if matches_request {
            if let Some(response) = event.payload.get("response").and_then(|v| v.as_str()) {
                return Ok(Some(response.to_string()));
            }
        }
    }
    Ok(None)
}

/// Latest completion report (summary + files) an agent filed for a task.
pub fn completion_report(
    db: &Database,
    task: &Task,
) -> Result<(Option<String>, Vec<String>)> {
    let events = db.read_events(task.project_id, Some(task.id), None, 50)?;
    for event in events.iter().rev() {
        if event.kind != EventKind::Progress {
            continue;
        }
        if event
            .payload
            .get("completed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            let summary = event
                .payload
                .get("summary")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let files = event
                .payload
                .get("files_changed")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            return Ok((summary, files));
        }
    }
    Ok((None, Vec::new()))
}

/// Review findings recorded against a task's dependencies — the findings a
/// rework task must address.
pub fn findings_for(db: &Database, task: &Task) -> Result<Vec<String>> {
    let deps = db.list_dependencies(task.project_id)?;
    let upstream: Vec<Uuid> = deps
        .iter()
        .filter(|d| d.task_id == task.id)
        .map(|d| d.depends_on_id)
        .collect();

    // Reviews of the upstream tasks carry the findings.
    let mut findings = Vec::new();
    for review in deps
        .iter()
        .filter(|d| upstream.contains(&d.depends_on_id))
        .map(|d| d.task_id)
    {
        for event in db.read_events(task.project_id, Some(review), None, 50)? {
            if event.kind != EventKind::ReviewVerdict {
                continue;
            }
            if let Some(list) = event.payload.get("findings").and_then(|v| v.as_array()) {
                findings.extend(
                    list.iter()
                        .filter_map(|v| v.as_str().map(str::to_string)),
                );
            }
        }
    }
    Ok(findings)
}
