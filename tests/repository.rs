//! Repository-level guarantees: plan atomicity, transition validation,
//! event durability, snapshot consistency, cascading resets.

mod common;

use common::{coding_task, install_plan, setup_project};

use terminal_coder::db::TaskDelta;
use terminal_coder::models::{
    EventKind, Pane, PhaseStatus, SessionStatus, TaskStatus,
};
use terminal_coder::plan::{Plan, PlannedPhase};
use uuid::Uuid;

#[test]
fn cyclic_plan_is_rejected_and_persists_nothing() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    let plan = Plan {
        project_name: "todo-api".into(),
        claude_md: String::new(),
        phases: vec![PlannedPhase {
            name: "Foundation".into(),
            description: None,
            tasks: vec![coding_task("A", &["B"]), coding_task("B", &["A"])],
        }],
    };
    let err = db.replace_plan(project_id, &plan).unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert!(db.list_phases(project_id).expect("phases").is_empty());
    assert!(db.list_tasks(project_id).expect("tasks").is_empty());
}

#[test]
fn unknown_dependency_name_is_rejected() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    let plan = Plan {
        project_name: "todo-api".into(),
        claude_md: String::new(),
        phases: vec![PlannedPhase {
            name: "Foundation".into(),
            description: None,
            tasks: vec![coding_task("A", &["Missing"])],
        }],
    };
    assert!(db.replace_plan(project_id, &plan).is_err());
    assert!(db.list_phases(project_id).expect("phases").is_empty());
}

#[test]
fn replan_replaces_wholesale() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("Old", vec![coding_task("Old task", &[])])]);
    let old_task = &db.list_tasks(project_id).expect("tasks")[0];
    db.update_task_status(old_task.id, TaskStatus::Running, TaskDelta::default())
        .expect("start");
    db.update_task_status(old_task.id, TaskStatus::Completed, TaskDelta::default())
        .expect("complete");

    install_plan(&db, project_id, &[("New", vec![coding_task("New task", &[])])]);
    let tasks = db.list_tasks(project_id).expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].name, "New task");
    assert_eq!(tasks[0].status, TaskStatus::Pending);
}

#[test]
fn illegal_transition_is_rejected_without_mutation() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = &db.list_tasks(project_id).expect("tasks")[0];

    let before_events = db
        .read_events(project_id, Some(task.id), None, 100)
        .expect("events")
        .len();
    let err = db
        .update_task_status(task.id, TaskStatus::Completed, TaskDelta::default())
        .unwrap_err();
    assert_eq!(err.kind(), "precondition");

    let after = db.get_task(task.id).expect("task");
    assert_eq!(after.status, TaskStatus::Pending);
    let after_events = db
        .read_events(project_id, Some(task.id), None, 100)
        .expect("events")
        .len();
    assert_eq!(before_events, after_events, "rejected transitions never reach the log");
}

#[test]
fn every_status_change_lands_in_the_event_log() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = &db.list_tasks(project_id).expect("tasks")[0];

    db.update_task_status(task.id, TaskStatus::Running, TaskDelta::default())
        .expect("start");
    db.update_task_status(task.id, TaskStatus::Completed, TaskDelta::default())
        .expect("complete");

    let events = db
        .read_events(project_id, Some(task.id), None, 100)
        .expect("events");
    let transitions: Vec<(String, String)> = events
        .iter()
        .filter(|e| e.kind == EventKind::StatusChange)
        .filter_map(|e| {
            Some((
                e.payload.get("from")?.as_str()?.to_string(),
                e.payload.get("to")?.as_str()?.to_string(),
            ))
        })
        .collect();
    assert!(transitions.contains(&("pending".into(), "running".into())));
    assert!(transitions.contains(&("running".into(), "completed".into())));
}

#[test]
fn phase_status_is_derived_from_tasks() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    install_plan(
        &db,
        project_id,
        &[("P", vec![coding_task("A", &[]), coding_task("B", &[])])],
    );
    let tasks = db.list_tasks(project_id).expect("tasks");
    let phase_id = tasks[0].phase_id;

    db.update_task_status(tasks[0].id, TaskStatus::Running, TaskDelta::default())
        .expect("start");
    assert_eq!(db.get_phase(phase_id).expect("phase").status, PhaseStatus::Running);

    db.update_task_status(tasks[0].id, TaskStatus::Completed, TaskDelta::default())
        .expect("complete");
    // One task completed, one still pending: the phase stays open.
    assert_eq!(db.get_phase(phase_id).expect("phase").status, PhaseStatus::Running);

    db.update_task_status(tasks[1].id, TaskStatus::Running, TaskDelta::default())
        .expect("start b");
    db.update_task_status(tasks[1].id, TaskStatus::Completed, TaskDelta::default())
        .expect("complete b");
    assert_eq!(
        db.get_phase(phase_id).expect("phase").status,
        PhaseStatus::Completed
    );
}

#[test]
fn snapshot_reads_plan_and_edges_together() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    install_plan(
        &db,
        project_id,
        &[
            ("P1", vec![coding_task("A", &[]), coding_task("B", &["A"])]),
            ("P2", vec![coding_task("C", &["B"])]),
        ],
    );
    let snapshot = db.snapshot(project_id).expect("snapshot");
    assert_eq!(snapshot.phases.len(), 2);
    assert_eq!(snapshot.tasks.len(), 3);
    assert_eq!(snapshot.deps.len(), 2);
    assert_eq!(snapshot.phases[0].sequence, 1);
    assert_eq!(snapshot.tasks[0].name, "A");
}

#[test]
fn at_most_one_running_session_per_pane_and_task() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    install_plan(
        &db,
        project_id,
        &[("P", vec![coding_task("A", &[]), coding_task("B", &[])])],
    );
    let tasks = db.list_tasks(project_id).expect("tasks");

    db.create_session(Uuid::new_v4(), tasks[0].id, project_id, Pane::Coding, None, None)
        .expect("first session");
    // Same pane, different task: rejected while the first is running.
    assert!(db
        .create_session(Uuid::new_v4(), tasks[1].id, project_id, Pane::Coding, None, None)
        .is_err());
    // Same task, different pane: rejected too.
    assert!(db
        .create_session(Uuid::new_v4(), tasks[0].id, project_id, Pane::Review, None, None)
        .is_err());
}

#[test]
fn finish_session_is_single_shot() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = &db.list_tasks(project_id).expect("tasks")[0];
    let (session, _) = db
        .create_session(Uuid::new_v4(), task.id, project_id, Pane::Coding, None, None)
        .expect("session");

    db.finish_session(session.id, SessionStatus::Completed, Some(0))
        .expect("finish");
    let err = db
        .finish_session(session.id, SessionStatus::Failed, Some(1))
        .unwrap_err();
    assert_eq!(err.kind(), "precondition");
}

#[test]
fn reset_task_clears_state_and_kills_sessions() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = &db.list_tasks(project_id).expect("tasks")[0];

    db.update_task_status(task.id, TaskStatus::Running, TaskDelta::default())
        .expect("start");
    let (session, _) = db
        .create_session(Uuid::new_v4(), task.id, project_id, Pane::Coding, None, None)
        .expect("session");
    db.update_task_status(
        task.id,
        TaskStatus::Failed,
        TaskDelta {
            error_context: Some("broken".into()),
            retry_count: Some(1),
            ..TaskDelta::default()
        },
    )
    .expect("fail");

    db.reset_task(task.id).expect("reset");

    let task = db.get_task(task.id).expect("task");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
    assert!(task.error_context.is_none());
    assert!(task.started_at.is_none());
    let session = db.get_session(session.id).expect("session");
    assert_eq!(session.status, SessionStatus::Killed);
}

#[test]
fn reset_phase_cascades_to_all_tasks() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    install_plan(
        &db,
        project_id,
        &[("P", vec![coding_task("A", &[]), coding_task("B", &[])])],
    );
    let tasks = db.list_tasks(project_id).expect("tasks");
    let phase_id = tasks[0].phase_id;
    for task in &tasks {
        db.update_task_status(task.id, TaskStatus::Running, TaskDelta::default())
            .expect("start");
        db.update_task_status(task.id, TaskStatus::Completed, TaskDelta::default())
            .expect("complete");
    }
    assert_eq!(
        db.get_phase(phase_id).expect("phase").status,
        PhaseStatus::Completed
    );

    db.reset_phase(phase_id).expect("reset");
    assert_eq!(db.get_phase(phase_id).expect("phase").status, PhaseStatus::Pending);
    for task in db.list_tasks_by_phase(phase_id).expect("tasks") {
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
    }
}

#[test]
fn manual_retry_requires_failed_or_paused() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = &db.list_tasks(project_id).expect("tasks")[0];
    let err = db.retry_task(task.id).unwrap_err();
    assert_eq!(err.kind(), "precondition");
}

#[test]
fn events_filter_by_subject_and_cursor() {
    let (_dir, db, _bus, _paths, project_id) = setup_project();
    install_plan(&db, project_id, &[("P", vec![coding_task("A", &[])])]);
    let task = &db.list_tasks(project_id).expect("tasks")[0];
    db.update_task_status(task.id, TaskStatus::Running, TaskDelta::default())
        .expect("start");

    let all = db.read_events(project_id, None, None, 100).expect("events");
    assert!(!all.is_empty());
    let for_task = db
        .read_events(project_id, Some(task.id), None, 100)
        .expect("events");
    assert!(for_task.iter().all(|e| e.subject_id == task.id));

    let cursor = all.last().expect("last").id;
    let newer = db
        .read_events(project_id, None, Some(cursor), 100)
        .expect("events");
    assert!(newer.is_empty());
}
