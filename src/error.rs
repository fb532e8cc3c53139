use thiserror::Error;

/// Errors are tagged by kind; user-facing output renders the kind plus a
/// short line and, where available, the offending subject id.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad CLI arguments or malformed PRD/plan/bootstrap input.
    #[error("validation: {0}")]
    Validation(String),

    /// A state-machine violation. Never mutates state.
    #[error("precondition: {0}")]
    Precondition(String),

    /// The agent reported failure or a session exited nonzero.
    #[error("task failure: {0}")]
    TaskFailure(String),

    /// No runnable task and no active session while work remains.
    #[error("deadlock: {0}")]
    Deadlock(String),

    /// Pane wrapper or store unavailable.
    #[error("infrastructure: {0}")]
    Infrastructure(String),

    #[error("no project initialized in this directory")]
    NoProject,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable kind tag rendered alongside user-visible failures.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Precondition(_) => "precondition",
            Error::TaskFailure(_) => "task_failure",
            Error::Deadlock(_) => "deadlock",
            Error::Infrastructure(_) => "infrastructure",
            Error::NoProject => "no_project",
            Error::NotFound(_) => "not_found",
            Error::Db(_) | Error::Io(_) | Error::Json(_) | Error::Template(_) => "internal",
        }
    }

    /// Process exit code for the CLI. Clap handles argument errors (2) itself.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Validation(_) => 2,
            Error::NoProject => 3,
            Error::Precondition(_) | Error::NotFound(_) => 4,
            Error::Deadlock(_) => 5,
            _ => 1,
        }
    }
}
