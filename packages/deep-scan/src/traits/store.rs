//! Storage traits for scan jobs, the work queue, documents and mailboxes.
//!
//! The storage layer is split into focused traits:
//! - `ScanJobStore`: durable job record (status, cursor, counters)
//! - `ScanQueueStore`: per-message work queue with atomic claims
//! - `DocumentStore`: financial documents, idempotent per remote message
//! - `MailboxStore`: mailbox connections and their sync cursor
//! - `ScanStore`: composite trait combining all four

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    document::{Enrichment, FinancialDocument, NewDocument, VendorConsensus},
    job::{CounterDelta, ScanJob, ScanStatus},
    mailbox::MailboxConnection,
    queue::{ItemOutcome, QueueCounts, QueueItemStatus, ScanQueueItem},
};

#[async_trait]
pub trait ScanJobStore: Send + Sync {
    /// Insert a new job.
    ///
    /// Fails with `ActiveScanExists` when the mailbox already has a
    /// non-terminal job.
    async fn create_job(&self, job: &ScanJob) -> Result<ScanJob>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ScanJob>>;

    /// The non-terminal job for a mailbox, if any.
    async fn find_active_job(&self, mailbox_id: Uuid) -> Result<Option<ScanJob>>;

    /// Most recently created job for an account.
    async fn latest_job_for_account(&self, account_id: Uuid) -> Result<Option<ScanJob>>;

    /// All jobs not in COMPLETED or FAILED, oldest first.
    async fn list_non_terminal_jobs(&self) -> Result<Vec<ScanJob>>;

    /// Move `from` → `to`. Returns false (and changes nothing) when the job
    /// is no longer in `from`, e.g. it was paused mid-batch.
    async fn transition(&self, job_id: Uuid, from: ScanStatus, to: ScanStatus) -> Result<bool>;

    /// Move any non-terminal job to FAILED with an error.
    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<bool>;

    /// Record an operator-visible error without changing status.
    async fn record_job_error(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Checkpoint after one Discovery page: saves the next page cursor and
    /// sets the discovered total to the job's queue size.
    async fn save_discovery_page(
        &self,
        job_id: Uuid,
        next_page_token: Option<&str>,
    ) -> Result<()>;

    /// Mark pagination exhausted: clears the page cursor and fixes both
    /// totals from the job's queue size.
    async fn finish_discovery(&self, job_id: Uuid) -> Result<ScanJob>;
}

#[async_trait]
pub trait ScanQueueStore: Send + Sync {
    /// Insert one PENDING item per message id. Existing (job, message) pairs
    /// are ignored. Returns the number of new rows.
    async fn enqueue_messages(&self, job_id: Uuid, message_ids: &[String]) -> Result<u64>;

    /// Atomically claim up to `limit` PENDING items (PENDING → PROCESSING).
    ///
    /// Concurrent callers receive disjoint sets. PROCESSING items whose claim
    /// is older than `lease` are reclaimed.
    async fn claim_pending(
        &self,
        job_id: Uuid,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScanQueueItem>>;

    /// Atomically claim REGEX_DONE items flagged needs-AI
    /// (REGEX_DONE → AI_PROCESSING), with the same lease rule.
    async fn claim_for_ai(
        &self,
        job_id: Uuid,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScanQueueItem>>;

    /// Write the final state of a claimed item and add `delta` to its job's
    /// counters in the same step.
    ///
    /// Applies only while the item still holds the claim it was read under
    /// (same `version`). Returns false, changing nothing, otherwise.
    async fn complete_item(
        &self,
        item: &ScanQueueItem,
        outcome: &ItemOutcome,
        delta: &CounterDelta,
    ) -> Result<bool>;

    /// Return claimed items to a re-claimable status. Items claimed again
    /// since they were read are left alone.
    async fn release_items(
        &self,
        items: &[ScanQueueItem],
        status: QueueItemStatus,
    ) -> Result<u64>;

    async fn queue_counts(&self, job_id: Uuid) -> Result<QueueCounts>;

    async fn list_items(&self, job_id: Uuid) -> Result<Vec<ScanQueueItem>>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_document_by_message(
        &self,
        account_id: Uuid,
        message_id: &str,
    ) -> Result<Option<FinancialDocument>>;

    async fn get_document(&self, document_id: Uuid) -> Result<Option<FinancialDocument>>;

    /// Insert unless a document already exists for (account, message).
    /// Returns `None` when it already existed.
    async fn insert_document(&self, document: NewDocument) -> Result<Option<FinancialDocument>>;

    /// Overwrite fields in place.
    async fn apply_enrichment(
        &self,
        document_id: Uuid,
        enrichment: &Enrichment,
    ) -> Result<FinancialDocument>;

    /// Category shared by at least `min_documents` of the vendor's prior
    /// documents with confidence ≥ `min_confidence`, excluding `exclude`.
    async fn vendor_consensus(
        &self,
        account_id: Uuid,
        vendor: &str,
        min_confidence: f32,
        min_documents: i64,
        exclude: Uuid,
    ) -> Result<Option<VendorConsensus>>;
}

#[async_trait]
pub trait MailboxStore: Send + Sync {
    async fn get_mailbox(&self, mailbox_id: Uuid) -> Result<Option<MailboxConnection>>;

    async fn list_mailboxes(&self) -> Result<Vec<MailboxConnection>>;

    /// Save a new sync cursor and stamp `last_synced_at`.
    async fn advance_sync_cursor(&self, mailbox_id: Uuid, cursor: &str) -> Result<()>;
}

/// Composite storage trait combining all stores.
///
/// This is the store handed to the pipeline.
pub trait ScanStore: ScanJobStore + ScanQueueStore + DocumentStore + MailboxStore {}

// Blanket implementation: anything implementing all four traits is a ScanStore
impl<T> ScanStore for T where T: ScanJobStore + ScanQueueStore + DocumentStore + MailboxStore {}
