//! ScanQueueItem model - one remote message inside one scan job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "scan_item_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueItemStatus {
    #[default]
    Pending,
    /// Claimed by a regex-phase invocation
    Processing,
    /// A document already existed for the message
    Duplicate,
    /// No financial signal found
    Skipped,
    /// Document created by the regex pass
    RegexDone,
    /// Claimed by an AI-phase invocation
    AiProcessing,
    AiDone,
    Failed,
}

impl QueueItemStatus {
    /// Statuses held by an in-flight claim.
    pub fn is_claimed(&self) -> bool {
        matches!(
            self,
            QueueItemStatus::Processing | QueueItemStatus::AiProcessing
        )
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ScanQueueItem {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Remote message id
    pub message_id: String,
    pub status: QueueItemStatus,
    pub needs_ai: bool,
    pub document_id: Option<Uuid>,
    pub error: Option<String>,
    /// Bumped on every state change; completion and release require the
    /// version the claim returned
    pub version: i32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanQueueItem {
    pub fn pending(job_id: Uuid, message_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            job_id,
            message_id: message_id.into(),
            status: QueueItemStatus::Pending,
            needs_ai: false,
            document_id: None,
            error: None,
            version: 0,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Final state written for a claimed item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Duplicate { document_id: Option<Uuid> },
    Skipped,
    RegexDone { document_id: Uuid, needs_ai: bool },
    AiDone { error: Option<String> },
    Failed { error: String },
}

impl ItemOutcome {
    pub fn status(&self) -> QueueItemStatus {
        match self {
            ItemOutcome::Duplicate { .. } => QueueItemStatus::Duplicate,
            ItemOutcome::Skipped => QueueItemStatus::Skipped,
            ItemOutcome::RegexDone { .. } => QueueItemStatus::RegexDone,
            ItemOutcome::AiDone { .. } => QueueItemStatus::AiDone,
            ItemOutcome::Failed { .. } => QueueItemStatus::Failed,
        }
    }
}

/// Queue aggregates used for phase transitions and resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub regex_done_needing_ai: i64,
    pub ai_processing: i64,
}

impl QueueCounts {
    /// Nothing left for the regex phase, including in-flight claims.
    pub fn regex_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }

    /// Nothing left for the AI phase, including in-flight claims.
    pub fn ai_drained(&self) -> bool {
        self.regex_done_needing_ai == 0 && self.ai_processing == 0
    }
}
