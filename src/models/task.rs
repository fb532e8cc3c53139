use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The atomic unit of agent work. Tasks form a DAG within a project through
/// [`TaskDependency`] edges; the scheduler never dispatches a task whose
/// dependencies are unfinished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub phase_id: Uuid,
    pub project_id: Uuid,
    /// 1-based, unique within the phase.
    pub sequence: i64,
    pub name: String,
    pub description: Option<String>,
    pub kind: TaskKind,
    pub brief_path: Option<String>,
    pub status: TaskStatus,
    /// Automatic retries consumed so far. Capped at 1.
    pub retry_count: i64,
    pub error_context: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Task {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// A finished task satisfies downstream dependencies.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Coding,
    Review,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Review => "review",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "coding" => Some(Self::Coding),
            "review" => Some(Self::Review),
            _ => None,
        }
    }
}

/// Edge in the task DAG: `task_id` is blocked until `depends_on_id` finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on_id: Uuid,
}
