//! ScanJob model - one deep scan of one mailbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle of a scan job.
///
/// ```text
/// DISCOVERING ──► PROCESSING ──► AI_PASS ──► COMPLETED
///      │              │             ▲
///      │              └─────────────┼──────► COMPLETED
///      └────────────────────────────┴──────► COMPLETED (nothing found)
///
/// any non-terminal ──► PAUSED ──► (re-derived phase)
/// any non-terminal ──► FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "scan_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    #[default]
    Discovering,
    Processing,
    AiPass,
    Completed,
    Paused,
    Failed,
}

impl ScanStatus {
    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }

    /// Statuses that have phase work to dispatch.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            ScanStatus::Discovering | ScanStatus::Processing | ScanStatus::AiPass
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Discovering => "discovering",
            ScanStatus::Processing => "processing",
            ScanStatus::AiPass => "ai_pass",
            ScanStatus::Completed => "completed",
            ScanStatus::Paused => "paused",
            ScanStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ScanJob
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScanJob {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    // Ownership
    pub account_id: Uuid,
    pub mailbox_id: Uuid,

    // State
    #[builder(default)]
    pub status: ScanStatus,
    pub query: String,
    /// Discovery cursor: the page token the next Discovery call starts from.
    #[builder(default, setter(strip_option))]
    pub page_token: Option<String>,

    // Totals follow the queue size; the rest are incremented per item
    #[builder(default = 0)]
    pub total_discovered: i32,
    #[builder(default = 0)]
    pub total_to_process: i32,
    #[builder(default = 0)]
    pub processed_count: i32,
    #[builder(default = 0)]
    pub documents_created: i32,
    #[builder(default = 0)]
    pub skipped_count: i32,
    #[builder(default = 0)]
    pub error_count: i32,

    // AI counters
    #[builder(default = 0)]
    pub ai_total: i32,
    #[builder(default = 0)]
    pub ai_processed: i32,
    #[builder(default = 0)]
    pub ai_skipped: i32,
    #[builder(default = 0)]
    pub ai_shortcut: i32,

    // Error tracking
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,

    // Timestamps
    #[builder(default, setter(strip_option))]
    pub discovery_completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl ScanJob {
    /// Create a fresh job in DISCOVERING for a mailbox.
    pub fn for_mailbox(account_id: Uuid, mailbox_id: Uuid, query: impl Into<String>) -> Self {
        Self::builder()
            .account_id(account_id)
            .mailbox_id(mailbox_id)
            .query(query.into())
            .build()
    }

    /// Whether Discovery has exhausted pagination at least once.
    pub fn discovery_finished(&self) -> bool {
        self.discovery_completed_at.is_some()
    }

    /// User-facing progress snapshot.
    pub fn progress(&self) -> ScanProgress {
        ScanProgress {
            job_id: self.id,
            phase: self.status,
            processed: self.processed_count,
            total: self.total_to_process.max(self.total_discovered),
            documents_created: self.documents_created,
            errors: self.error_count,
            ai_processed: self.ai_processed,
            ai_total: self.ai_total,
            last_error: self.last_error.clone(),
        }
    }

    /// Add a completed item's contribution to the counters.
    pub fn apply(&mut self, delta: &CounterDelta) {
        self.processed_count += delta.processed;
        self.documents_created += delta.created;
        self.skipped_count += delta.skipped;
        self.error_count += delta.errored;
        self.ai_total += delta.ai_total;
        self.ai_processed += delta.ai_processed;
        self.ai_skipped += delta.ai_skipped;
        self.ai_shortcut += delta.ai_shortcut;
    }
}

/// Counter contribution of one queue item, applied additively to the job
/// row together with the item's completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub processed: i32,
    pub created: i32,
    pub skipped: i32,
    pub errored: i32,
    pub ai_total: i32,
    pub ai_processed: i32,
    pub ai_skipped: i32,
    pub ai_shortcut: i32,
}

impl CounterDelta {
    pub fn is_empty(&self) -> bool {
        *self == CounterDelta::default()
    }

    pub fn merge(&mut self, other: &CounterDelta) {
        self.processed += other.processed;
        self.created += other.created;
        self.skipped += other.skipped;
        self.errored += other.errored;
        self.ai_total += other.ai_total;
        self.ai_processed += other.ai_processed;
        self.ai_skipped += other.ai_skipped;
        self.ai_shortcut += other.ai_shortcut;
    }
}

/// What `status(account)` reports. Always read from durable counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub job_id: Uuid,
    pub phase: ScanStatus,
    pub processed: i32,
    pub total: i32,
    pub documents_created: i32,
    pub errors: i32,
    pub ai_processed: i32,
    pub ai_total: i32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
        assert!(!ScanStatus::Paused.is_terminal());
        assert!(!ScanStatus::Paused.is_runnable());
        assert!(ScanStatus::AiPass.is_runnable());
    }

    #[test]
    fn test_new_job_defaults() {
        let job = ScanJob::for_mailbox(Uuid::new_v4(), Uuid::new_v4(), "invoice");
        assert_eq!(job.status, ScanStatus::Discovering);
        assert!(job.page_token.is_none());
        assert!(!job.discovery_finished());
        assert_eq!(job.total_discovered, 0);
    }

    #[test]
    fn test_counter_merge() {
        let mut total = CounterDelta::default();
        assert!(total.is_empty());

        total.merge(&CounterDelta {
            processed: 3,
            created: 2,
            skipped: 1,
            ..Default::default()
        });
        total.merge(&CounterDelta {
            processed: 1,
            errored: 1,
            ..Default::default()
        });

        assert_eq!(total.processed, 4);
        assert_eq!(total.created, 2);
        assert_eq!(total.errored, 1);

        let mut job = ScanJob::for_mailbox(Uuid::new_v4(), Uuid::new_v4(), "invoice");
        job.apply(&total);
        job.apply(&total);
        assert_eq!(job.processed_count, 8);
        assert_eq!(job.documents_created, 4);
        assert_eq!(job.skipped_count, 2);
    }
}
