use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only log entry. Rows are never mutated after insertion; the events
/// table is the authoritative record, the in-process bus a lossy mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub project_id: Uuid,
    pub kind: EventKind,
    pub subject_kind: SubjectKind,
    pub subject_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StatusChange,
    Progress,
    Error,
    ReviewVerdict,
    HumanInputRequest,
    EngineTick,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChange => "status_change",
            Self::Progress => "progress",
            Self::Error => "error",
            Self::ReviewVerdict => "review_verdict",
            Self::HumanInputRequest => "human_input_request",
            Self::EngineTick => "engine_tick",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "status_change" => Some(Self::StatusChange),
            "progress" => Some(Self::Progress),
            "error" => Some(Self::Error),
            "review_verdict" => Some(Self::ReviewVerdict),
            "human_input_request" => Some(Self::HumanInputRequest),
            "engine_tick" => Some(Self::EngineTick),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Project,
    Phase,
    Task,
    Session,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Phase => "phase",
            Self::Task => "task",
            Self::Session => "session",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "project" => Some(Self::Project),
            "phase" => Some(Self::Phase),
            "task" => Some(Self::Task),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

/// Event content before it is assigned an id and timestamp by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub project_id: Uuid,
    pub kind: EventKind,
    pub subject_kind: SubjectKind,
    pub subject_id: Uuid,
    pub payload: serde_json::Value,
}

impl EventDraft {
    pub fn new(
        project_id: Uuid,
        kind: EventKind,
        subject_kind: SubjectKind,
        subject_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            project_id,
            kind,
            subject_kind,
            subject_id,
            payload,
        }
    }
}
