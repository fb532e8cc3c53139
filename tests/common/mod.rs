//! Shared fixtures: an on-disk project in a temp dir and a scripted pane
//! driver standing in for tmux.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use uuid::Uuid;

use terminal_coder::config::ProjectPaths;
use terminal_coder::db::Database;
use terminal_coder::engine::tmux::{PaneDriver, PaneState};
use terminal_coder::error::Result;
use terminal_coder::events::EventBus;
use terminal_coder::init;
use terminal_coder::models::{Pane, TaskKind};
use terminal_coder::plan::{Plan, PlannedPhase, PlannedTask};

/// Shared view of the scripted panes: the test flips states, the driver
/// reads them and records what the engine asked for.
#[derive(Clone, Default)]
pub struct PaneBoard {
    inner: Arc<Mutex<BoardInner>>,
}

#[derive(Default)]
struct BoardInner {
    states: HashMap<i64, PaneState>,
    spawns: Vec<(Pane, String)>,
    kills: Vec<(Pane, bool)>,
}

impl PaneBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit(&self, pane: Pane, code: i64) {
        self.inner.lock().unwrap().states.insert(
            pane.index(),
            PaneState::Exited {
                exit_code: Some(code),
            },
        );
    }

    pub fn vanish(&self, pane: Pane) {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(pane.index(), PaneState::Idle);
    }

    pub fn spawns(&self) -> Vec<(Pane, String)> {
        self.inner.lock().unwrap().spawns.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.inner.lock().unwrap().spawns.len()
    }

    pub fn kills(&self) -> Vec<(Pane, bool)> {
        self.inner.lock().unwrap().kills.clone()
    }

    pub fn driver(&self) -> ScriptedDriver {
        ScriptedDriver {
            board: self.clone(),
        }
    }
}

pub struct ScriptedDriver {
    board: PaneBoard,
}

impl PaneDriver for ScriptedDriver {
    fn spawn(&mut self, pane: Pane, command: &str) -> Result<Option<u32>> {
        let mut inner = self.board.inner.lock().unwrap();
        inner.spawns.push((pane, command.to_string()));
        inner.states.insert(pane.index(), PaneState::Busy);
        Ok(Some(4242))
    }

    fn poll(&mut self, pane: Pane) -> Result<PaneState> {
        Ok(*self
            .board
            .inner
            .lock()
            .unwrap()
            .states
            .get(&pane.index())
            .unwrap_or(&PaneState::Idle))
    }

    fn kill(&mut self, pane: Pane, force: bool) -> Result<()> {
        let mut inner = self.board.inner.lock().unwrap();
        inner.kills.push((pane, force));
        inner.states.insert(pane.index(), PaneState::Idle);
        Ok(())
    }
}

/// Initialize a project in a temp dir, returning everything a scenario
/// needs. The temp dir must outlive the test.
pub fn setup_project() -> (TempDir, Database, EventBus, ProjectPaths, Uuid) {
    let dir = TempDir::new().expect("temp dir");
    let prd = dir.path().join("requirements.md");
    std::fs::write(&prd, "# PRD\nBuild a todo API with persistence.\n").expect("write prd");

    let result = init::initialize_project(dir.path(), "todo-api", &prd, None).expect("init");
    let paths = ProjectPaths::for_root(dir.path());
    let db = Database::open(&paths.db_path).expect("open store");
    let bus = EventBus::default();
    let project_id = result.project.id;
    (dir, db, bus, paths, project_id)
}

pub fn coding_task(name: &str, depends_on: &[&str]) -> PlannedTask {
    PlannedTask {
        name: name.to_string(),
        description: Some(format!("Implement {name}")),
        kind: TaskKind::Coding,
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        acceptance_criteria: vec![],
        relevant_files: vec![],
    }
}

pub fn install_plan(db: &Database, project_id: Uuid, phases: &[(&str, Vec<PlannedTask>)]) {
    let plan = Plan {
        project_name: "todo-api".into(),
        claude_md: String::new(),
        phases: phases
            .iter()
            .map(|(name, tasks)| PlannedPhase {
                name: name.to_string(),
                description: None,
                tasks: tasks.clone(),
            })
            .collect(),
    };
    db.replace_plan(project_id, &plan).expect("install plan");
}
