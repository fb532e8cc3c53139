//! Control-plane semantics: precondition validation, review enqueueing,
//! context assembly, and the human-input round trip.

mod common;

use std::time::Duration;

use common::{coding_task, install_plan, setup_project};

use terminal_coder::control::{self, ReviewVerdict};
use terminal_coder::db::{Database, TaskDelta};
use terminal_coder::models::{EventKind, Task, TaskKind, TaskStatus};
use uuid::Uuid;

fn start_task(db: &Database, project_id: Uuid, name: &str) -> Task {
    let task = db
        .list_tasks(project_id)
        .expect("tasks")
        .into_iter()
        .find(|t| t.name == name)
        .expect("task");
    db.update_task_status(task.id, TaskStatus::Running, TaskDelta::default())
        .expect("start");
    db.get_task(task.id).expect("task")
}

#[test]
fn progress_requires_running_task() {
    let (_dir, db, bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = &db.list_tasks(project_id).expect("tasks")[0];

    let err = control::report_progress(&db, &bus, task.id, Some(10), "starting").unwrap_err();
    assert_eq!(err.kind(), "precondition");

    start_task(&db, project_id, "A");
    control::report_progress(&db, &bus, task.id, Some(50), "halfway").expect("progress");
    let events = db
        .read_events(project_id, Some(task.id), None, 100)
        .expect("events");
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Progress && e.payload["note"] == "halfway"));
}

#[test]
fn completion_enqueues_review_with_dependency() {
    let (_dir, db, bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = start_task(&db, project_id, "A");

    let review = control::report_completion(&db, &bus, task.id, "done", &["src/api.rs".into()])
        .expect("complete");
    assert_eq!(review.kind, TaskKind::Review);
    assert_eq!(review.status, TaskStatus::Pending);
    assert_eq!(review.phase_id, task.phase_id);
    assert!(review.sequence > task.sequence);

    let deps = db.list_dependencies(project_id).expect("deps");
    assert!(deps
        .iter()
        .any(|d| d.task_id == review.id && d.depends_on_id == task.id));
}

#[test]
fn completion_rejected_for_review_tasks_and_double_reports() {
    let (_dir, db, bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = start_task(&db, project_id, "A");

    let review = control::report_completion(&db, &bus, task.id, "done", &[]).expect("complete");
    // Second completion: the task is no longer running.
    let err = control::report_completion(&db, &bus, task.id, "again", &[]).unwrap_err();
    assert_eq!(err.kind(), "precondition");

    // Completion on a review task is the wrong verb even while running.
    db.update_task_status(review.id, TaskStatus::Running, TaskDelta::default())
        .expect("start review");
    let err = control::report_completion(&db, &bus, review.id, "looks good", &[]).unwrap_err();
    assert_eq!(err.kind(), "precondition");
    // And the review was not corrupted by the rejected call.
    assert_eq!(
        db.get_task(review.id).expect("review").status,
        TaskStatus::Running
    );
}

#[test]
fn approved_review_creates_no_followup() {
    let (_dir, db, bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = start_task(&db, project_id, "A");
    let review = control::report_completion(&db, &bus, task.id, "done", &[]).expect("complete");
    db.update_task_status(review.id, TaskStatus::Running, TaskDelta::default())
        .expect("start review");

    let followup = control::report_review(&db, &bus, review.id, ReviewVerdict::Approved, &[])
        .expect("review");
    assert!(followup.is_none());
    assert_eq!(db.list_tasks(project_id).expect("tasks").len(), 2);
}

#[test]
fn failure_stores_context_for_the_retry() {
    let (_dir, db, bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = start_task(&db, project_id, "A");

    control::report_failure(&db, &bus, task.id, "tests fail", Some("assertion at line 10"))
        .expect("failure");
    let task = db.get_task(task.id).expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    let context = task.error_context.expect("context");
    assert!(context.contains("tests fail"));
    assert!(context.contains("assertion at line 10"));
}

#[test]
fn context_includes_completed_work_and_findings() {
    let (_dir, db, bus, _paths, project_id) = setup_project();
    install_plan(
        &db,
        project_id,
        &[("P", vec![coding_task("A", &[]), coding_task("B", &["A"])])],
    );
    let a = start_task(&db, project_id, "A");
    let review = control::report_completion(&db, &bus, a.id, "built the parser", &["src/parse.rs".into()])
        .expect("complete");
    db.update_task_status(review.id, TaskStatus::Running, TaskDelta::default())
        .expect("start review");
    let followup = control::report_review(
        &db,
        &bus,
        review.id,
        ReviewVerdict::ChangesRequested,
        &["handle empty input".into()],
    )
    .expect("review")
    .expect("followup");

    let context = control::get_context(&db, followup.id).expect("context");
    assert!(context
        .completed_tasks
        .iter()
        .any(|t| t.name == "A" && t.summary.as_deref() == Some("built the parser")));
    assert_eq!(context.review_findings, vec!["handle empty input"]);
    assert_eq!(context.phase.id, followup.phase_id);
}

#[tokio::test]
async fn human_input_round_trip_and_timeout() {
    let (_dir, db, bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = start_task(&db, project_id, "A");

    // No responder: the request times out and returns None.
    let answer = control::request_human_input(
        &db,
        &bus,
        task.id,
        "Which database?",
        &["sqlite".into(), "postgres".into()],
        Duration::from_millis(50),
    )
    .await
    .expect("request");
    assert!(answer.is_none());

    // With a responder racing the poll loop, the answer comes back. The
    // responder answers the newest unanswered request it can see.
    let responder = {
        let db = db.clone();
        let bus = bus.clone();
        let task_id = task.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let request = db
                .read_events(project_id, Some(task_id), None, 100)
                .expect("events")
                .into_iter()
                .filter(|e| {
                    e.kind == EventKind::HumanInputRequest
                        && e.payload.get("response").is_none()
                })
                .next_back()
                .expect("request event");
            control::record_human_response(&db, &bus, project_id, task_id, request.id, "sqlite")
                .expect("respond");
        })
    };
    let answer = control::request_human_input(
        &db,
        &bus,
        task.id,
        "Which database?",
        &[],
        Duration::from_secs(5),
    )
    .await
    .expect("request");
    responder.await.expect("responder");
    assert_eq!(answer.as_deref(), Some("sqlite"));
}
