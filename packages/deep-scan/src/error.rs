//! Typed errors for the deep-scan library.
//!
//! Uses `thiserror` so callers can branch on the kind of failure: terminal
//! configuration problems fail a scan job, everything else is recorded and
//! the job keeps going.

use thiserror::Error;
use uuid::Uuid;

/// Maximum length of error text persisted on jobs and queue items.
pub const MAX_ERROR_LEN: usize = 500;

/// Errors that can occur while scanning or syncing a mailbox.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Invalid or missing configuration
    #[error("config error: {0}")]
    Config(String),

    /// Mailbox connection row does not exist
    #[error("mailbox not found: {0}")]
    MailboxNotFound(Uuid),

    /// Mailbox exists but has no usable credentials
    #[error("mailbox {0} has no credentials")]
    MissingCredentials(Uuid),

    /// Remote account rejected our credentials
    #[error("mailbox access unauthorized: {0}")]
    Unauthorized(String),

    /// A non-terminal scan already exists for the mailbox
    #[error("scan {job_id} is already active for this mailbox")]
    ActiveScanExists { job_id: Uuid },

    /// Scan job not found
    #[error("scan job not found: {0}")]
    JobNotFound(Uuid),

    /// Requested state change is not allowed from the current state
    #[error("invalid transition for job {job_id}: {reason}")]
    InvalidTransition { job_id: Uuid, reason: String },

    /// Transient mailbox API failure
    #[error("mailbox error: {0}")]
    Mailbox(String),

    /// AI service failed for this input
    #[error("AI service error: {0}")]
    Ai(String),

    /// AI enrichment is switched off
    #[error("AI enrichment is disabled")]
    AiDisabled,

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Migration failed
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScanError {
    /// Terminal errors need user action; the job moves to FAILED and is not
    /// retried automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanError::Config(_)
                | ScanError::MailboxNotFound(_)
                | ScanError::MissingCredentials(_)
                | ScanError::Unauthorized(_)
        )
    }

    /// Error text suitable for persisting on a job or queue item.
    pub fn truncated(&self) -> String {
        truncate_error(&self.to_string())
    }
}

/// Truncate error text to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Result type alias for scan operations.
pub type Result<T> = std::result::Result<T, ScanError>;
