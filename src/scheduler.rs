//! Pure scheduling: given a consistent snapshot and the engine's view of the
//! panes, decide the single next action. No I/O happens here; every test
//! fixture builds a snapshot in memory.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde::Serialize;
use uuid::Uuid;

use crate::models::{Phase, Task, TaskDependency, TaskKind, TaskStatus};

/// Consistent read of a project's plan state, produced by
/// `Database::snapshot` within one transaction.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub phases: Vec<Phase>,
    pub tasks: Vec<Task>,
    pub deps: Vec<TaskDependency>,
}

/// What the engine knows about its own resources when asking for a decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineView {
    pub pane0_busy: bool,
    pub pane1_busy: bool,
    pub paused: bool,
}

/// A task that cannot run and why, reported in the deadlock diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedTask {
    pub task_id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub unmet_deps: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub enum Decision {
    /// Run this coding task on pane 0.
    DispatchCoding(Task),
    /// Run this review task on pane 1. Reviews take priority so coding can
    /// proceed behind them.
    DispatchReview(Task),
    /// Nothing to start, but sessions are active or dispatch is suppressed.
    Idle,
    /// Every task is completed or skipped.
    Complete,
    /// Unfinished tasks remain but none can run and nothing is active.
    Deadlock { blocked: Vec<BlockedTask> },
}

pub fn schedule(snapshot: &Snapshot, view: &EngineView) -> Decision {
    if snapshot
        .tasks
        .iter()
        .all(|task| task.status.is_finished())
    {
        return Decision::Complete;
    }

    let finished: HashSet<Uuid> = snapshot
        .tasks
        .iter()
        .filter(|t| t.status.is_finished())
        .map(|t| t.id)
        .collect();
    let deps_by_task = dependency_index(&snapshot.deps);
    let deps_met =
        |task_id: Uuid| -> bool { unmet_deps(task_id, &deps_by_task, &finished).is_empty() };

    // Reviews first: any pending review whose dependency finished is "queued"
    // and runs on pane 1 regardless of phase gating.
    let queued_review = snapshot
        .tasks
        .iter()
        .find(|t| t.kind == TaskKind::Review && t.status == TaskStatus::Pending && deps_met(t.id));
    if let Some(review) = queued_review {
        if !view.pane1_busy {
            return Decision::DispatchReview(review.clone());
        }
    }

    let runnable_coding = next_runnable_coding(snapshot, &deps_met);

    if view.paused {
        // Pause suppresses coding dispatch but never terminates the run;
        // resume or a manual reset picks the work back up.
        return Decision::Idle;
    }

    if let Some(task) = runnable_coding {
        if !view.pane0_busy {
            return Decision::DispatchCoding(task.clone());
        }
    }

    let anything_runnable = runnable_coding.is_some() || queued_review.is_some();
    let anything_active = view.pane0_busy
        || view.pane1_busy
        || snapshot
            .tasks
            .iter()
            .any(|t| t.status == TaskStatus::Running);
    if !anything_runnable && !anything_active {
        let blocked = snapshot
            .tasks
            .iter()
            .filter(|t| !t.status.is_finished())
            .map(|t| BlockedTask {
                task_id: t.id,
                name: t.name.clone(),
                status: t.status,
                unmet_deps: unmet_deps(t.id, &deps_by_task, &finished),
            })
            .collect();
        return Decision::Deadlock { blocked };
    }

    Decision::Idle
}

/// First pending coding task, in phase order then task order, inside the
/// earliest unfinished phase, whose dependencies are all finished.
fn next_runnable_coding<'a>(
    snapshot: &'a Snapshot,
    deps_met: &dyn Fn(Uuid) -> bool,
) -> Option<&'a Task> {
    let mut phases: Vec<&Phase> = snapshot.phases.iter().collect();
    phases.sort_by_key(|p| p.sequence);
    let current = phases.iter().find(|p| !p.status.is_finished())?;
    snapshot
        .tasks
        .iter()
        .filter(|t| t.phase_id == current.id)
        .filter(|t| t.kind == TaskKind::Coding && t.status == TaskStatus::Pending)
        .filter(|t| deps_met(t.id))
        .min_by_key(|t| t.sequence)
}

fn dependency_index(deps: &[TaskDependency]) -> HashMap<Uuid, Vec<Uuid>> {
    let mut index: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for dep in deps {
        index.entry(dep.task_id).or_default().push(dep.depends_on_id);
    }
    index
}

fn unmet_deps(
    task_id: Uuid,
    deps_by_task: &HashMap<Uuid, Vec<Uuid>>,
    finished: &HashSet<Uuid>,
) -> Vec<Uuid> {
    deps_by_task
        .get(&task_id)
        .map(|deps| {
            deps.iter()
                .filter(|dep| !finished.contains(dep))
                .copied()
                .collect()
        })
        .unwrap_or_default()
}

/// Kahn's algorithm. `edges` are (node, depends_on) pairs. Returns the nodes
/// in dependency order, or the members of at least one cycle on failure.
pub fn toposort<T: Eq + Hash + Copy>(
    nodes: &[T],
    edges: &[(T, T)],
) -> std::result::Result<Vec<T>, Vec<T>> {
    let mut in_degree: HashMap<T, usize> = nodes.iter().map(|&n| (n, 0)).collect();
    let mut dependents: HashMap<T, Vec<T>> = HashMap::new();
    for &(node, depends_on) in edges {
        *in_degree.entry(node).or_insert(0) += 1;
        dependents.entry(depends_on).or_default().push(node);
    }

    let mut queue: Vec<T> = nodes
        .iter()
        .filter(|n| in_degree.get(*n) == Some(&0))
        .copied()
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(node) = queue.pop() {
        order.push(node);
        if let Some(children) = dependents.get(&node) {
            for &child in children {
                if let Some(degree) = in_degree.get_mut(&child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(child);
                    }
                }
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        Err(nodes
            .iter()
            .filter(|n| in_degree.get(*n).is_some_and(|d| *d > 0))
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::PhaseStatus;

    fn phase(project_id: Uuid, sequence: i64, status: PhaseStatus) -> Phase {
        Phase {
            id: Uuid::new_v4(),
            project_id,
            sequence,
            name: format!("phase-{sequence}"),
            description: None,
            status,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    fn task(phase: &Phase, sequence: i64, kind: TaskKind, status: TaskStatus) -> Task {
        Task {
            id: Uuid::new_v4(),
            phase_id: phase.id,
            project_id: phase.project_id,
            sequence,
            name: format!("task-{}-{}", phase.sequence, sequence),
            description: None,
            kind,
            brief_path: None,
            status,
            retry_count: 0,
            error_context: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    fn dep(task: &Task, on: &Task) -> TaskDependency {
        TaskDependency {
            task_id: task.id,
            depends_on_id: on.id,
        }
    }

    #[test]
    fn picks_first_pending_in_earliest_phase() {
        let project = Uuid::new_v4();
        let p1 = phase(project, 1, PhaseStatus::Pending);
        let p2 = phase(project, 2, PhaseStatus::Pending);
        let a = task(&p1, 1, TaskKind::Coding, TaskStatus::Pending);
        let b = task(&p1, 2, TaskKind::Coding, TaskStatus::Pending);
        let c = task(&p2, 1, TaskKind::Coding, TaskStatus::Pending);
        let snapshot = Snapshot {
            phases: vec![p1, p2],
            tasks: vec![a.clone(), b, c],
            deps: vec![],
        };
        match schedule(&snapshot, &EngineView::default()) {
            Decision::DispatchCoding(t) => assert_eq!(t.id, a.id),
            other => panic!("expected coding dispatch, got {other:?}"),
        }
    }

    #[test]
    fn phase_gating_blocks_later_phases() {
        let project = Uuid::new_v4();
        let p1 = phase(project, 1, PhaseStatus::Running);
        let p2 = phase(project, 2, PhaseStatus::Pending);
        let a = task(&p1, 1, TaskKind::Coding, TaskStatus::Running);
        let c = task(&p2, 1, TaskKind::Coding, TaskStatus::Pending);
        let snapshot = Snapshot {
            phases: vec![p1, p2],
            tasks: vec![a, c],
            deps: vec![],
        };
        let view = EngineView {
            pane0_busy: true,
            ..EngineView::default()
        };
        assert!(matches!(schedule(&snapshot, &view), Decision::Idle));
    }

    #[test]
    fn skipped_phase_does_not_gate() {
        let project = Uuid::new_v4();
        let p1 = phase(project, 1, PhaseStatus::Skipped);
        let p2 = phase(project, 2, PhaseStatus::Pending);
        let c = task(&p2, 1, TaskKind::Coding, TaskStatus::Pending);
        let snapshot = Snapshot {
            phases: vec![p1, p2],
            tasks: vec![c.clone()],
            deps: vec![],
        };
        match schedule(&snapshot, &EngineView::default()) {
            Decision::DispatchCoding(t) => assert_eq!(t.id, c.id),
            other => panic!("expected coding dispatch, got {other:?}"),
        }
    }

    #[test]
    fn unmet_dependency_defers_task() {
        let project = Uuid::new_v4();
        let p1 = phase(project, 1, PhaseStatus::Running);
        let a = task(&p1, 1, TaskKind::Coding, TaskStatus::Running);
        let b = task(&p1, 2, TaskKind::Coding, TaskStatus::Pending);
        let edge = dep(&b, &a);
        let snapshot = Snapshot {
            phases: vec![p1],
            tasks: vec![a, b],
            deps: vec![edge],
        };
        let view = EngineView {
            pane0_busy: true,
            ..EngineView::default()
        };
        assert!(matches!(schedule(&snapshot, &view), Decision::Idle));
    }

    #[test]
    fn skipped_dependency_satisfies() {
        let project = Uuid::new_v4();
        let p1 = phase(project, 1, PhaseStatus::Running);
        let a = task(&p1, 1, TaskKind::Coding, TaskStatus::Skipped);
        let b = task(&p1, 2, TaskKind::Coding, TaskStatus::Pending);
        let edge = dep(&b, &a);
        let snapshot = Snapshot {
            phases: vec![p1],
            tasks: vec![a, b.clone()],
            deps: vec![edge],
        };
        match schedule(&snapshot, &EngineView::default()) {
            Decision::DispatchCoding(t) => assert_eq!(t.id, b.id),
            other => panic!("expected coding dispatch, got {other:?}"),
        }
    }

    #[test]
    fn review_takes_priority_on_free_pane() {
        let project = Uuid::new_v4();
        let p1 = phase(project, 1, PhaseStatus::Running);
        let a = task(&p1, 1, TaskKind::Coding, TaskStatus::Completed);
        let review = task(&p1, 3, TaskKind::Review, TaskStatus::Pending);
        let b = task(&p1, 2, TaskKind::Coding, TaskStatus::Pending);
        let edge = dep(&review, &a);
        let snapshot = Snapshot {
            phases: vec![p1],
            tasks: vec![a, b, review.clone()],
            deps: vec![edge],
        };
        match schedule(&snapshot, &EngineView::default()) {
            Decision::DispatchReview(t) => assert_eq!(t.id, review.id),
            other => panic!("expected review dispatch, got {other:?}"),
        }
    }

    #[test]
    fn busy_review_pane_falls_through_to_coding() {
        let project = Uuid::new_v4();
        let p1 = phase(project, 1, PhaseStatus::Running);
        let a = task(&p1, 1, TaskKind::Coding, TaskStatus::Completed);
        let review = task(&p1, 3, TaskKind::Review, TaskStatus::Pending);
        let b = task(&p1, 2, TaskKind::Coding, TaskStatus::Pending);
        let edge = dep(&review, &a);
        let snapshot = Snapshot {
            phases: vec![p1],
            tasks: vec![a, b.clone(), review],
            deps: vec![edge],
        };
        let view = EngineView {
            pane1_busy: true,
            ..EngineView::default()
        };
        match schedule(&snapshot, &view) {
            Decision::DispatchCoding(t) => assert_eq!(t.id, b.id),
            other => panic!("expected coding dispatch, got {other:?}"),
        }
    }

    #[test]
    fn paused_never_dispatches_coding_but_still_reviews() {
        let project = Uuid::new_v4();
        let p1 = phase(project, 1, PhaseStatus::Running);
        let a = task(&p1, 1, TaskKind::Coding, TaskStatus::Completed);
        let review = task(&p1, 2, TaskKind::Review, TaskStatus::Pending);
        let b = task(&p1, 3, TaskKind::Coding, TaskStatus::Pending);
        let edge = dep(&review, &a);
        let snapshot = Snapshot {
            phases: vec![p1],
            tasks: vec![a, b, review.clone()],
            deps: vec![edge],
        };
        let view = EngineView {
            paused: true,
            ..EngineView::default()
        };
        match schedule(&snapshot, &view) {
            Decision::DispatchReview(t) => assert_eq!(t.id, review.id),
            other => panic!("expected review dispatch, got {other:?}"),
        }

        let no_review = Snapshot {
            phases: snapshot.phases.clone(),
            tasks: snapshot
                .tasks
                .iter()
                .filter(|t| t.kind == TaskKind::Coding)
                .cloned()
                .collect(),
            deps: vec![],
        };
        assert!(matches!(schedule(&no_review, &view), Decision::Idle));
    }

    #[test]
    fn all_finished_is_complete() {
        let project = Uuid::new_v4();
        let p1 = phase(project, 1, PhaseStatus::Completed);
        let a = task(&p1, 1, TaskKind::Coding, TaskStatus::Completed);
        let b = task(&p1, 2, TaskKind::Coding, TaskStatus::Skipped);
        let snapshot = Snapshot {
            phases: vec![p1],
            tasks: vec![a, b],
            deps: vec![],
        };
        assert!(matches!(
            schedule(&snapshot, &EngineView::default()),
            Decision::Complete
        ));
    }

    #[test]
    fn self_dependency_deadlocks_with_diagnostics() {
        let project = Uuid::new_v4();
        let p1 = phase(project, 1, PhaseStatus::Pending);
        let a = task(&p1, 1, TaskKind::Coding, TaskStatus::Pending);
        let edge = dep(&a, &a);
        let snapshot = Snapshot {
            phases: vec![p1],
            tasks: vec![a.clone()],
            deps: vec![edge],
        };
        match schedule(&snapshot, &EngineView::default()) {
            Decision::Deadlock { blocked } => {
                assert_eq!(blocked.len(), 1);
                assert_eq!(blocked[0].task_id, a.id);
                assert_eq!(blocked[0].unmet_deps, vec![a.id]);
            }
            other => panic!("expected deadlock, got {other:?}"),
        }
    }

    #[test]
    fn running_session_defers_deadlock() {
        let project = Uuid::new_v4();
        let p1 = phase(project, 1, PhaseStatus::Running);
        let a = task(&p1, 1, TaskKind::Coding, TaskStatus::Running);
        let b = task(&p1, 2, TaskKind::Coding, TaskStatus::Pending);
        let edges = vec![dep(&b, &b)];
        let snapshot = Snapshot {
            phases: vec![p1],
            tasks: vec![a, b],
            deps: edges,
        };
        let view = EngineView {
            pane0_busy: true,
            ..EngineView::default()
        };
        assert!(matches!(schedule(&snapshot, &view), Decision::Idle));
    }

    #[test]
    fn toposort_orders_and_detects_cycles() {
        let order = toposort(&["a", "b", "c"], &[("b", "a"), ("c", "b")]).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);

        let cycle = toposort(&["a", "b"], &[("a", "b"), ("b", "a")]).unwrap_err();
        assert_eq!(cycle.len(), 2);
    }
}
