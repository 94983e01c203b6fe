use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of error kinds an activity failure or `fail_workflow` reason is normalized
/// into (§6.4, §7). Unrecognized kinds from user code default to `NonRetryable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Retryable,
    NonRetryable,
    Timeout,
    Conflict,
}

impl Default for ErrorKind {
    fn default() -> Self {
        ErrorKind::NonRetryable
    }
}

/// The structured error envelope recorded in task `error` fields and `ActivityFailed`/`WfFailed`
/// events (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable, message)
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonRetryable, message)
    }
}

/// Hard errors surfaced from public store operations (§4.1). `Conflict` is always handled
/// locally by the engine's CAS retry loop and must never escape a public `Engine` method.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cas conflict writing {key}")]
    Conflict { key: String },

    #[error("no record at {key}")]
    NotFound { key: String },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Hard errors surfaced from public queue operations (§4.2).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("malformed message body: {0}")]
    Malformed(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Hard errors surfaced from public `Engine` operations (§7). Unlike `StoreError::Conflict`,
/// none of these are retried automatically — they indicate the caller did something the engine
/// cannot reconcile (unknown workflow, stale lease, malformed decider output).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow {0} not found")]
    NotFound(String),

    #[error("workflow {0} already exists")]
    AlreadyExists(String),

    #[error("decider {0} is not registered")]
    UnknownDecider(String),

    #[error("task {task_id} is not leased")]
    NotLeased { task_id: String },

    #[error("lease owner/token mismatch for task {task_id}")]
    LeaseMismatch { task_id: String },

    #[error("lease for task {task_id} already expired")]
    LeaseExpired { task_id: String },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("gave up retrying cas write for {key} after {attempts} attempts")]
    CasRetriesExhausted { key: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;
