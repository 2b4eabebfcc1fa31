use thiserror::Error;

/// Convenience type alias for Results with MendError
pub type Result<T> = std::result::Result<T, MendError>;

/// Main error type for mend-core
///
/// Each variant maps onto one row of the error policy table: transient
/// kinds are retried locally, user-visible kinds are surfaced as task
/// status plus a collaborator comment, catastrophic kinds pause workers.
#[derive(Error, Debug)]
pub enum MendError {
    #[error("Collaborator HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Webhook signature rejected")]
    SignatureRejected,

    #[error("Duplicate task for fingerprint (existing: {task_id})")]
    Duplicate { task_id: String },

    #[error("Token unavailable for {provider}/{organization}: {message}")]
    TokenUnavailable {
        provider: String,
        organization: String,
        message: String,
    },

    #[error("Subprocess timed out after {seconds}s")]
    SubprocessTimeout { seconds: u64 },

    #[error("Subprocess failed (retryable: {retryable}): {message}")]
    SubprocessFailed { retryable: bool, message: String },

    #[error("Version conflict updating task {task_id}")]
    VersionConflict { task_id: String },

    #[error("Illegal transition for task {task_id}: {from} on {event}")]
    IllegalTransition {
        task_id: String,
        from: String,
        event: String,
    },

    #[error("Repository cache busy: {key}")]
    CacheBusy { key: String },

    #[error("Queue {queue} is full")]
    QueueFull { queue: String },

    #[error("Git error: {message}")]
    Git { message: String },

    #[error("Access denied: {path}")]
    AccessDenied { path: String },

    #[error("File too large: {path} ({bytes} bytes)")]
    TooLarge { path: String, bytes: u64 },

    #[error("No task in context for command")]
    NoTaskInContext,

    #[error("Command not supported from this surface")]
    UnsupportedSurface,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MendError {
    /// Transient kinds are requeued with backoff instead of failing the task.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MendError::Http(_)
                | MendError::TokenUnavailable { .. }
                | MendError::SubprocessTimeout { .. }
                | MendError::SubprocessFailed {
                    retryable: true,
                    ..
                }
                | MendError::CacheBusy { .. }
                | MendError::VersionConflict { .. }
        )
    }
}
