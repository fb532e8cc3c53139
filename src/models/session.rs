use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One agent process instance bound to one task and one pane. A task may
/// accumulate many sessions across retries, but at most one is running at
/// any instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub pane: Pane,
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub exit_code: Option<i64>,
    pub log_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Session {}

/// The two terminal slots: pane 0 runs coding sessions, pane 1 reviews.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Pane {
    Coding,
    Review,
}

impl Pane {
    pub fn index(&self) -> i64 {
        match self {
            Self::Coding => 0,
            Self::Review => 1,
        }
    }

    pub fn from_index(i: i64) -> Option<Self> {
        match i {
            0 => Some(Self::Coding),
            1 => Some(Self::Review),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }
}
