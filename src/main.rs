use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use terminal_coder::config::EngineConfig;
use terminal_coder::db::CheckRecord;
use terminal_coder::engine::session::SessionManager;
use terminal_coder::engine::tmux::TmuxDriver;
use terminal_coder::engine::Engine;
use terminal_coder::error::Error;
use terminal_coder::events::{BusItem, EventBus, EventFilter};
use terminal_coder::models::{ProjectStatus, TaskStatus};
use terminal_coder::{bootstrap, init, mcp, plan};
use terminal_coder::briefs::BriefRenderer;

#[derive(Parser)]
#[command(name = "tc")]
#[command(about = "Terminal Coder - autonomous software-building orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a project directory
    Init {
        /// Project directory
        dir: PathBuf,
        /// Product requirements document
        #[arg(long)]
        prd: PathBuf,
        /// Bootstrap specification
        #[arg(long)]
        bootstrap: Option<PathBuf>,
        /// Human-readable project name
        #[arg(long)]
        name: Option<String>,
    },
    /// Run bootstrap verification checks
    Verify,
    /// Invoke the agent planner and install the resulting plan
    Plan {
        /// Regenerate the plan, discarding the existing one
        #[arg(long)]
        replan: bool,
    },
    /// Start the orchestration engine
    Run {
        /// Run without the live event follower
        #[arg(long)]
        headless: bool,
    },
    /// Print the phase/task summary
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Stop scheduling new coding tasks
    Pause,
    /// Resume scheduling
    Resume,
    /// Clear a task's retry budget and error context, mark it pending
    Retry {
        #[arg(long)]
        task: Uuid,
    },
    /// Reset a task or a whole phase back to pending
    Reset {
        #[arg(long)]
        task: Option<Uuid>,
        /// Phase number (1-based)
        #[arg(long)]
        phase: Option<i64>,
    },
    /// Terminate a running session
    Kill {
        #[arg(long)]
        session: Option<Uuid>,
        /// Escalate to SIGKILL after the grace period
        #[arg(long)]
        force: bool,
    },
    /// Show the event log
    History {
        #[arg(long)]
        task: Option<Uuid>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Follow the event log read-only
    Dashboard,
    /// Start the MCP control-plane server via stdio (invoked by the agent)
    Mcp {
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "terminal_coder=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error[{}]: {err}", err.kind());
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let cwd = std::env::current_dir()?;
    match cli.command {
        Commands::Init {
            dir,
            prd,
            bootstrap,
            name,
        } => {
            std::fs::create_dir_all(&dir)?;
            let dir = dir.canonicalize()?;
            let name = name.unwrap_or_else(|| {
                dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "project".into())
            });
            let result = init::initialize_project(&dir, &name, &prd, bootstrap.as_deref())?;
            println!("Initialized project '{}' ({})", name, result.project.id);
            println!("  store:  {}", result.db_path.display());
            println!("  prd:    {}", result.prd_dest.display());
            if let Some(bootstrap) = result.bootstrap_dest {
                println!("  bootstrap: {}", bootstrap.display());
            }
            println!("Next: tc verify && tc plan && tc run");
            Ok(())
        }

        Commands::Verify => {
            let (db, paths) = init::open_project(&cwd)?;
            let project = db.single_project()?;
            let Some(bootstrap_path) = project.bootstrap_path.as_deref() else {
                println!("No bootstrap file recorded; nothing to verify.");
                return Ok(());
            };
            let results = bootstrap::verify(std::path::Path::new(bootstrap_path), &paths.root)?;
            let mut failed = 0usize;
            for result in &results {
                db.record_check(
                    project.id,
                    &CheckRecord {
                        name: result.check.name.clone(),
                        check_type: result.check.check_type.as_str().to_string(),
                        command: result.check.command.clone(),
                        expected: result.check.expected.clone(),
                        actual_output: Some(result.output.clone()),
                        passed: result.passed,
                    },
                )?;
                let mark = if result.passed { "ok " } else { "FAIL" };
                println!("[{mark}] {} ({})", result.check.name, result.check.command);
                if !result.passed {
                    failed += 1;
                }
            }
            println!("{} checks, {} failed", results.len(), failed);
            if failed > 0 {
                return Err(Error::Validation(format!(
                    "{failed} bootstrap check(s) failed"
                )));
            }
            Ok(())
        }

        Commands::Plan { replan } => {
            let (db, paths) = init::open_project(&cwd)?;
            let bus = EventBus::default();
            let project = db.single_project()?;
            if !replan && project.status != ProjectStatus::Initialized {
                return Err(Error::Precondition(format!(
                    "project is {}; use --replan to regenerate the plan",
                    project.status.as_str()
                )));
            }

            let (_, events) = db.update_project_status(project.id, ProjectStatus::Planning)?;
            bus.publish_all(&events);

            let prd = std::fs::read_to_string(&project.prd_path)?;
            let bootstrap_content = project
                .bootstrap_path
                .as_deref()
                .and_then(|p| std::fs::read_to_string(p).ok());
            let renderer = BriefRenderer::new();
            let brief = renderer.render_planning_brief(&prd, bootstrap_content.as_deref())?;

            println!("Running planning session (this can take a few minutes)...");
            let raw = plan::invoke_planner(&paths.root, &brief)?;

            std::fs::create_dir_all(&paths.plans_dir)?;
            let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
            let raw_path = paths.plan_path(&stamp);
            std::fs::write(&raw_path, &raw)?;

            let parsed = plan::parse_planning_output(&raw)?;
            let events = db.replace_plan(project.id, &parsed)?;
            bus.publish_all(&events);

            if !parsed.claude_md.is_empty() {
                std::fs::write(paths.root.join("CLAUDE.md"), &parsed.claude_md)?;
            }
            let (_, events) = db.update_project_status(project.id, ProjectStatus::Planned)?;
            bus.publish_all(&events);

            let tasks: usize = parsed.phases.iter().map(|p| p.tasks.len()).sum();
            println!(
                "Installed plan: {} phases, {} tasks (raw output: {})",
                parsed.phases.len(),
                tasks,
                raw_path.display()
            );
            Ok(())
        }

        Commands::Run { headless } => {
            let (db, paths) = init::open_project(&cwd)?;
            let project = db.single_project()?;
            if !matches!(
                project.status,
                ProjectStatus::Planned | ProjectStatus::Running | ProjectStatus::Paused
            ) {
                return Err(Error::Precondition(format!(
                    "project is {}; run 'tc plan' first",
                    project.status.as_str()
                )));
            }

            let config = EngineConfig::from_env();
            let bus = EventBus::new(config.event_buffer);
            let driver = TmuxDriver::setup(&project.name)?;
            println!("tmux session: {}", driver.session_name());
            println!("  attach with: tmux attach -t {}", driver.session_name());

            if !headless {
                let mut sub = bus.subscribe(EventFilter::default());
                tokio::spawn(async move {
                    while let Some(item) = sub.recv().await {
                        print_bus_item(&item);
                    }
                });
            }

            let mut engine = Engine::new(db, bus, driver, paths, config, project.id);
            tokio::select! {
                result = engine.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    println!("\nstopping engine");
                    Ok(())
                }
            }
        }

        Commands::Status { json } => {
            let (db, _) = init::open_project(&cwd)?;
            let project = db.single_project()?;
            let phases = db.list_phases(project.id)?;
            if json {
                let mut body = Vec::new();
                for phase in &phases {
                    let tasks = db.list_tasks_by_phase(phase.id)?;
                    body.push(serde_json::json!({ "phase": phase, "tasks": tasks }));
                }
                let document = serde_json::json!({ "project": project, "phases": body });
                println!("{}", serde_json::to_string_pretty(&document)?);
                return Ok(());
            }

            println!("{} [{}]", project.name, project.status.as_str());
            for phase in &phases {
                println!(
                    "  phase {} {} [{}]",
                    phase.sequence,
                    phase.name,
                    phase.status.as_str()
                );
                for task in db.list_tasks_by_phase(phase.id)? {
                    let retries = if task.retry_count > 0 {
                        format!(" (retries: {})", task.retry_count)
                    } else {
                        String::new()
                    };
                    println!(
                        "    [{:9}] {} {} {}{}",
                        task.status.as_str(),
                        task.kind.as_str(),
                        task.id,
                        task.name,
                        retries
                    );
                }
            }
            Ok(())
        }

        Commands::Pause => {
            let (db, _) = init::open_project(&cwd)?;
            let project = db.single_project()?;
            let (_, _) = db.update_project_status(project.id, ProjectStatus::Paused)?;
            println!("Paused. Running sessions will finish; no new coding dispatches.");
            Ok(())
        }

        Commands::Resume => {
            let (db, _) = init::open_project(&cwd)?;
            let project = db.single_project()?;
            let (_, _) = db.update_project_status(project.id, ProjectStatus::Running)?;
            println!("Resumed.");
            Ok(())
        }

        Commands::Retry { task } => {
            let (db, _) = init::open_project(&cwd)?;
            let (task, _) = db.retry_task(task)?;
            println!("Task '{}' queued for retry.", task.name);
            Ok(())
        }

        Commands::Reset { task, phase } => {
            let (db, _) = init::open_project(&cwd)?;
            let project = db.single_project()?;
            match (task, phase) {
                (Some(task_id), None) => {
                    let task = db.get_task(task_id)?;
                    kill_live_panes_for(&db, &project, |s| s.task_id == task_id);
                    db.reset_task(task_id)?;
                    println!("Task '{}' reset to pending.", task.name);
                    Ok(())
                }
                (None, Some(sequence)) => {
                    let phase = db.phase_by_sequence(project.id, sequence)?;
                    let tasks = db.list_tasks_by_phase(phase.id)?;
                    kill_live_panes_for(&db, &project, |s| {
                        tasks.iter().any(|t| t.id == s.task_id)
                    });
                    db.reset_phase(phase.id)?;
                    println!(
                        "Phase '{}' ({} tasks) reset to pending.",
                        phase.name,
                        tasks.len()
                    );
                    Ok(())
                }
                _ => Err(Error::Validation(
                    "specify exactly one of --task or --phase".into(),
                )),
            }
        }

        Commands::Kill { session, force } => {
            let (db, paths) = init::open_project(&cwd)?;
            let project = db.single_project()?;
            let bus = EventBus::default();
            let target = match session {
                Some(id) => db.get_session(id)?,
                None => db
                    .active_sessions(project.id)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::NotFound("no running session".into()))?,
            };
            let driver = TmuxDriver::setup(&project.name)?;
            let mut sessions = SessionManager::new(driver, paths);
            sessions.kill(&db, &bus, &target, force)?;
            let task = db.get_task(target.task_id)?;
            if task.status == TaskStatus::Running {
                let (_, _) = db.update_task_status(
                    task.id,
                    TaskStatus::Failed,
                    terminal_coder::db::TaskDelta {
                        error_context: Some("killed".into()),
                        ..Default::default()
                    },
                )?;
            }
            println!("Killed session {} (task '{}').", target.id, task.name);
            Ok(())
        }

        Commands::History { task, limit } => {
            let (db, _) = init::open_project(&cwd)?;
            let project = db.single_project()?;
            for event in db.read_events(project.id, task, None, limit)? {
                println!(
                    "{} {:18} {:7} {} {}",
                    event.created_at.format("%H:%M:%S"),
                    event.kind.as_str(),
                    event.subject_kind.as_str(),
                    event.subject_id,
                    event.payload
                );
            }
            Ok(())
        }

        Commands::Dashboard => {
            let (db, _) = init::open_project(&cwd)?;
            let project = db.single_project()?;
            println!("Following events for '{}' (ctrl-c to exit)", project.name);
            let mut cursor: Option<i64> = db
                .read_events(project.id, None, None, 1)?
                .last()
                .map(|e| e.id);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
                let fresh = db.read_events(project.id, None, cursor, 100)?;
                for event in fresh {
                    println!(
                        "{} {:18} {:7} {} {}",
                        event.created_at.format("%H:%M:%S"),
                        event.kind.as_str(),
                        event.subject_kind.as_str(),
                        event.subject_id,
                        event.payload
                    );
                    cursor = Some(event.id.max(cursor.unwrap_or(0)));
                }
            }
        }

        Commands::Mcp { project_dir } => {
            let dir = project_dir.unwrap_or(cwd);
            let (db, _) = init::open_project(&dir)?;
            let bus = EventBus::default();
            mcp::run_stdio_server(db, bus)
                .await
                .map_err(|e| Error::Infrastructure(e.to_string()))
        }
    }
}

/// Best-effort pane interrupt for sessions matching the predicate, ahead of
/// a reset that will record them as killed. Tmux being gone is not an error
/// here; the rows are corrected either way.
fn kill_live_panes_for(
    db: &terminal_coder::db::Database,
    project: &terminal_coder::models::Project,
    matches: impl Fn(&terminal_coder::models::Session) -> bool,
) {
    use terminal_coder::engine::tmux::PaneDriver;

    let Ok(sessions) = db.active_sessions(project.id) else {
        return;
    };
    let live: Vec<_> = sessions.into_iter().filter(|s| matches(s)).collect();
    if live.is_empty() {
        return;
    }
    if let Ok(mut driver) = TmuxDriver::setup(&project.name) {
        for session in live {
            let _ = driver.kill(session.pane, true);
        }
    }
}

fn print_bus_item(item: &BusItem) {
    match item {
        BusItem::Event(event) => {
            if event.kind == terminal_coder::models::EventKind::EngineTick {
                return;
            }
            println!(
                "  [{}] {} {} {}",
                event.kind.as_str(),
                event.subject_kind.as_str(),
                event.subject_id,
                event.payload
            );
        }
        BusItem::Overflow { skipped } => {
            println!("  [overflow] {skipped} events dropped");
        }
    }
}
