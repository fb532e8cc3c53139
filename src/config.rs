//! Project layout and engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

pub const TC_DIR: &str = ".tc";
pub const DB_FILENAME: &str = "tc.db";
pub const BRIEFS_DIR: &str = "briefs";
pub const LOGS_DIR: &str = "logs";
pub const PLANS_DIR: &str = "plans";

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_MAX_RETRIES: u32 = 1;
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Grace period between the polite interrupt and the escalated kill.
pub const GRACEFUL_KILL_WAIT_MS: u64 = 10_000;

/// Consecutive infrastructure faults tolerated before the engine gives up.
pub const INFRA_FAILURE_LIMIT: u32 = 5;

pub const PLANNING_TIMEOUT_SECS: u64 = 300;
pub const CHECK_TIMEOUT_SECS: u64 = 30;

/// Resolved filesystem layout under a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub tc_dir: PathBuf,
    pub db_path: PathBuf,
    pub briefs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub plans_dir: PathBuf,
}

impl ProjectPaths {
    pub fn for_root(root: &Path) -> Self {
        let tc_dir = root.join(TC_DIR);
        Self {
            root: root.to_path_buf(),
            db_path: tc_dir.join(DB_FILENAME),
            briefs_dir: tc_dir.join(BRIEFS_DIR),
            logs_dir: tc_dir.join(LOGS_DIR),
            plans_dir: tc_dir.join(PLANS_DIR),
            tc_dir,
        }
    }

    pub fn brief_path(&self, task_id: Uuid) -> PathBuf {
        self.briefs_dir.join(format!("{task_id}.md"))
    }

    pub fn session_log_path(&self, session_id: Uuid) -> PathBuf {
        self.logs_dir.join(format!("session-{session_id}.log"))
    }

    pub fn plan_path(&self, timestamp: &str) -> PathBuf {
        self.plans_dir.join(format!("plan-{timestamp}.json"))
    }
}

/// Tunables for the reconciliation loop. Built from defaults, then overridden
/// by `TC_TICK_INTERVAL_MS`, `TC_MAX_RETRIES`, and `TC_EVENT_BUFFER`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub max_retries: u32,
    pub event_buffer: usize,
    /// Per-task wall-clock limit. `None` means unbounded.
    pub task_timeout: Option<Duration>,
    pub infra_failure_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            event_buffer: DEFAULT_EVENT_BUFFER,
            task_timeout: None,
            infra_failure_limit: INFRA_FAILURE_LIMIT,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = parse_env::<u64>("TC_TICK_INTERVAL_MS") {
            config.tick_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(retries) = parse_env::<u32>("TC_MAX_RETRIES") {
            config.max_retries = retries.min(1);
        }
        if let Some(buffer) = parse_env::<usize>("TC_EVENT_BUFFER") {
            config.event_buffer = buffer.max(1);
        }
        config
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_nest_under_tc_dir() {
        let paths = ProjectPaths::for_root(Path::new("/work/app"));
        assert_eq!(paths.db_path, Path::new("/work/app/.tc/tc.db"));
        assert_eq!(paths.briefs_dir, Path::new("/work/app/.tc/briefs"));
        assert_eq!(paths.logs_dir, Path::new("/work/app/.tc/logs"));
    }

    #[test]
    fn default_config_matches_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.tick_interval, Duration::from_millis(2000));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.event_buffer, 256);
        assert!(config.task_timeout.is_none());
    }
}
