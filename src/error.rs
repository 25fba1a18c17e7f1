//! Crate-wide error taxonomy. Each component family gets its own enum; `CoreError`
//! aggregates them for call sites (the router, the CLI entrypoint) that need one type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("failed to start assistant process: {0}")]
    StartupError(String),

    #[error("handler is not running")]
    NotRunning,

    #[error("input of {len} bytes exceeds the configured maximum of {max}")]
    InputTooLarge { len: usize, max: usize },

    #[error("timed out waiting for assistant output after {0:?}")]
    Timeout(std::time::Duration),

    #[error("assistant process exited unexpectedly with code {code:?}: {stderr_tail}")]
    UnexpectedExit {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("failed to parse assistant output: {0}")]
    ParseError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no such session: {0}")]
    NoSuchSession(String),

    #[error("session limit of {0} reached")]
    LimitExceeded(usize),

    #[error("invalid project: {0}")]
    InvalidProject(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("queue {0} already has a run in progress")]
    QueueBusy(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to persist queue state: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("unknown catalog task name: {0}")]
    UnknownTaskName(String),

    #[error("no such schedule: {0}")]
    UnknownSchedule(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("configured project directory does not exist: {0}")]
    MissingProjectDir(String),
}

/// Aggregate error type for call sites that need to propagate any of the above
/// through a single type (the router's dispatch path, the CLI entrypoint).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// A short, single-line, user-facing rendering with no paths or stack traces
    /// beyond what the variant's message already carries. Used by the router
    /// when turning a failure into a channel reply (spec ambient error policy).
    pub fn user_message(&self) -> String {
        format!("error: {self}")
    }
}
