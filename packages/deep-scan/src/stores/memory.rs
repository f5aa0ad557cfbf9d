//! In-memory storage implementation for testing and development.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::traits::store::{DocumentStore, MailboxStore, ScanJobStore, ScanQueueStore};
use crate::types::{
    document::{Enrichment, FinancialDocument, NewDocument, VendorConsensus},
    job::{CounterDelta, ScanJob, ScanStatus},
    mailbox::MailboxConnection,
    queue::{ItemOutcome, QueueCounts, QueueItemStatus, ScanQueueItem},
};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, ScanJob>,
    /// Insertion order doubles as claim order
    items: Vec<ScanQueueItem>,
    item_keys: HashSet<(Uuid, String)>,
    documents: HashMap<Uuid, FinancialDocument>,
    document_keys: HashMap<(Uuid, String), Uuid>,
    mailboxes: HashMap<Uuid, MailboxConnection>,
}

impl MemoryState {
    fn queue_size(&self, job_id: Uuid) -> i32 {
        let size = self.items.iter().filter(|i| i.job_id == job_id).count();
        i32::try_from(size).unwrap_or(i32::MAX)
    }
}

/// In-memory storage for jobs, queue items, documents and mailboxes.
///
/// Every operation runs under one lock, so claims are atomic and concurrent
/// claimers always receive disjoint items. Not suitable for production as
/// data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a mailbox connection.
    pub fn add_mailbox(&self, mailbox: MailboxConnection) {
        self.state().mailboxes.insert(mailbox.id, mailbox);
    }

    /// Number of stored documents.
    pub fn document_count(&self) -> usize {
        self.state().documents.len()
    }

    /// All documents for an account.
    pub fn documents_for_account(&self, account_id: Uuid) -> Vec<FinancialDocument> {
        self.state()
            .documents
            .values()
            .filter(|d| d.account_id == account_id)
            .cloned()
            .collect()
    }

    fn claim(
        &self,
        job_id: Uuid,
        limit: i64,
        lease: Duration,
        eligible: impl Fn(&ScanQueueItem) -> bool,
        claimed_status: QueueItemStatus,
    ) -> Vec<ScanQueueItem> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let limit = usize::try_from(limit).unwrap_or(0);

        let mut state = self.state();
        let mut claimed = Vec::new();
        for item in state.items.iter_mut().filter(|i| i.job_id == job_id) {
            if claimed.len() >= limit {
                break;
            }
            let stale_claim = item.status == claimed_status
                && item.claimed_at.is_some_and(|at| at + lease < now);
            if eligible(item) || stale_claim {
                item.status = claimed_status;
                item.claimed_at = Some(now);
                item.version += 1;
                item.updated_at = now;
                claimed.push(item.clone());
            }
        }
        claimed
    }
}

#[async_trait]
impl ScanJobStore for MemoryStore {
    async fn create_job(&self, job: &ScanJob) -> Result<ScanJob> {
        let mut state = self.state();
        if let Some(active) = state
            .jobs
            .values()
            .find(|j| j.mailbox_id == job.mailbox_id && !j.status.is_terminal())
        {
            return Err(ScanError::ActiveScanExists { job_id: active.id });
        }
        state.jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ScanJob>> {
        Ok(self.state().jobs.get(&job_id).cloned())
    }

    async fn find_active_job(&self, mailbox_id: Uuid) -> Result<Option<ScanJob>> {
        Ok(self
            .state()
            .jobs
            .values()
            .find(|j| j.mailbox_id == mailbox_id && !j.status.is_terminal())
            .cloned())
    }

    async fn latest_job_for_account(&self, account_id: Uuid) -> Result<Option<ScanJob>> {
        Ok(self
            .state()
            .jobs
            .values()
            .filter(|j| j.account_id == account_id)
            .max_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn list_non_terminal_jobs(&self) -> Result<Vec<ScanJob>> {
        let mut jobs: Vec<_> = self
            .state()
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn transition(&self, job_id: Uuid, from: ScanStatus, to: ScanStatus) -> Result<bool> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(ScanError::JobNotFound(job_id))?;
        if job.status != from {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = to;
        job.updated_at = now;
        if to == ScanStatus::Completed {
            job.completed_at = Some(now);
        }
        Ok(true)
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<bool> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(ScanError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = ScanStatus::Failed;
        job.last_error = Some(error.to_string());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_job_error(&self, job_id: Uuid, error: &str) -> Result<()> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(ScanError::JobNotFound(job_id))?;
        job.last_error = Some(error.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn save_discovery_page(
        &self,
        job_id: Uuid,
        next_page_token: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state();
        let queued = state.queue_size(job_id);
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(ScanError::JobNotFound(job_id))?;
        job.page_token = next_page_token.map(str::to_string);
        job.total_discovered = queued;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn finish_discovery(&self, job_id: Uuid) -> Result<ScanJob> {
        let mut state = self.state();
        let queued = state.queue_size(job_id);
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(ScanError::JobNotFound(job_id))?;
        let now = Utc::now();
        job.page_token = None;
        job.total_discovered = queued;
        job.total_to_process = queued;
        job.discovery_completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }
}

#[async_trait]
impl ScanQueueStore for MemoryStore {
    async fn enqueue_messages(&self, job_id: Uuid, message_ids: &[String]) -> Result<u64> {
        let mut state = self.state();
        let mut inserted = 0;
        for message_id in message_ids {
            if state.item_keys.insert((job_id, message_id.clone())) {
                state.items.push(ScanQueueItem::pending(job_id, message_id.clone()));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn claim_pending(
        &self,
        job_id: Uuid,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScanQueueItem>> {
        Ok(self.claim(
            job_id,
            limit,
            lease,
            |item| item.status == QueueItemStatus::Pending,
            QueueItemStatus::Processing,
        ))
    }

    async fn claim_for_ai(
        &self,
        job_id: Uuid,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScanQueueItem>> {
        Ok(self.claim(
            job_id,
            limit,
            lease,
            |item| item.status == QueueItemStatus::RegexDone && item.needs_ai,
            QueueItemStatus::AiProcessing,
        ))
    }

    async fn complete_item(
        &self,
        item: &ScanQueueItem,
        outcome: &ItemOutcome,
        delta: &CounterDelta,
    ) -> Result<bool> {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(stored) = state
            .items
            .iter_mut()
            .find(|i| i.id == item.id && i.version == item.version && i.status.is_claimed())
        else {
            return Ok(false);
        };

        let now = Utc::now();
        stored.status = outcome.status();
        match outcome {
            ItemOutcome::Duplicate { document_id } => stored.document_id = *document_id,
            ItemOutcome::Skipped => {}
            ItemOutcome::RegexDone {
                document_id,
                needs_ai,
            } => {
                stored.document_id = Some(*document_id);
                stored.needs_ai = *needs_ai;
            }
            ItemOutcome::AiDone { error } => stored.error = error.clone(),
            ItemOutcome::Failed { error } => stored.error = Some(error.clone()),
        }
        stored.claimed_at = None;
        stored.version += 1;
        stored.updated_at = now;

        if !delta.is_empty() {
            if let Some(job) = state.jobs.get_mut(&stored.job_id) {
                job.apply(delta);
                job.updated_at = now;
            }
        }
        Ok(true)
    }

    async fn release_items(
        &self,
        items: &[ScanQueueItem],
        status: QueueItemStatus,
    ) -> Result<u64> {
        let claims: HashSet<(Uuid, i32)> = items.iter().map(|i| (i.id, i.version)).collect();
        let mut state = self.state();
        let now = Utc::now();
        let mut released = 0;
        for item in state
            .items
            .iter_mut()
            .filter(|i| claims.contains(&(i.id, i.version)) && i.status.is_claimed())
        {
            item.status = status;
            item.claimed_at = None;
            item.version += 1;
            item.updated_at = now;
            released += 1;
        }
        Ok(released)
    }

    async fn queue_counts(&self, job_id: Uuid) -> Result<QueueCounts> {
        let state = self.state();
        let mut counts = QueueCounts::default();
        for item in state.items.iter().filter(|i| i.job_id == job_id) {
            counts.total += 1;
            match item.status {
                QueueItemStatus::Pending => counts.pending += 1,
                QueueItemStatus::Processing => counts.processing += 1,
                QueueItemStatus::RegexDone if item.needs_ai => counts.regex_done_needing_ai += 1,
                QueueItemStatus::AiProcessing => counts.ai_processing += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn list_items(&self, job_id: Uuid) -> Result<Vec<ScanQueueItem>> {
        Ok(self
            .state()
            .items
            .iter()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_document_by_message(
        &self,
        account_id: Uuid,
        message_id: &str,
    ) -> Result<Option<FinancialDocument>> {
        let state = self.state();
        Ok(state
            .document_keys
            .get(&(account_id, message_id.to_string()))
            .and_then(|id| state.documents.get(id))
            .cloned())
    }

    async fn get_document(&self, document_id: Uuid) -> Result<Option<FinancialDocument>> {
        Ok(self.state().documents.get(&document_id).cloned())
    }

    async fn insert_document(&self, document: NewDocument) -> Result<Option<FinancialDocument>> {
        let mut state = self.state();
        let key = (document.account_id, document.source_message_id.clone());
        if state.document_keys.contains_key(&key) {
            return Ok(None);
        }
        let document = document.into_document();
        state.document_keys.insert(key, document.id);
        state.documents.insert(document.id, document.clone());
        Ok(Some(document))
    }

    async fn apply_enrichment(
        &self,
        document_id: Uuid,
        enrichment: &Enrichment,
    ) -> Result<FinancialDocument> {
        let mut state = self.state();
        let document = state
            .documents
            .get_mut(&document_id)
            .ok_or_else(|| ScanError::Storage(sqlx::Error::RowNotFound))?;

        if let Some(vendor) = &enrichment.vendor {
            document.vendor = Some(vendor.clone());
        }
        if let Some(amount) = enrichment.amount_minor {
            document.amount_minor = Some(amount);
        }
        if let Some(currency) = &enrichment.currency {
            document.currency = Some(currency.clone());
        }
        if let Some(category) = &enrichment.category {
            document.category = Some(category.clone());
        }
        if let Some(doc_type) = enrichment.doc_type {
            document.doc_type = doc_type;
        }
        document.status = enrichment.status;
        document.source = enrichment.source;
        document.confidence = enrichment.confidence;
        document.updated_at = Utc::now();
        Ok(document.clone())
    }

    async fn vendor_consensus(
        &self,
        account_id: Uuid,
        vendor: &str,
        min_confidence: f32,
        min_documents: i64,
        exclude: Uuid,
    ) -> Result<Option<VendorConsensus>> {
        let state = self.state();
        let wanted = vendor.trim().to_lowercase();

        // category -> (count, vendor spellings)
        let mut by_category: HashMap<String, (i64, HashMap<String, i64>)> = HashMap::new();
        for doc in state.documents.values().filter(|d| {
            d.account_id == account_id
                && d.id != exclude
                && d.confidence >= min_confidence
        }) {
            let (Some(doc_vendor), Some(category)) = (&doc.vendor, &doc.category) else {
                continue;
            };
            if doc_vendor.trim().to_lowercase() != wanted {
                continue;
            }
            let entry = by_category.entry(category.clone()).or_default();
            entry.0 += 1;
            *entry.1.entry(doc_vendor.clone()).or_default() += 1;
        }

        Ok(by_category
            .into_iter()
            .filter(|(_, (count, _))| *count >= min_documents)
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| b.0.cmp(&a.0)))
            .map(|(category, (count, spellings))| VendorConsensus {
                vendor: spellings
                    .into_iter()
                    .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
                    .map(|(spelling, _)| spelling)
                    .unwrap_or_else(|| vendor.to_string()),
                category,
                supporting_documents: count,
            }))
    }
}

#[async_trait]
impl MailboxStore for MemoryStore {
    async fn get_mailbox(&self, mailbox_id: Uuid) -> Result<Option<MailboxConnection>> {
        Ok(self.state().mailboxes.get(&mailbox_id).cloned())
    }

    async fn list_mailboxes(&self) -> Result<Vec<MailboxConnection>> {
        Ok(self.state().mailboxes.values().cloned().collect())
    }

    async fn advance_sync_cursor(&self, mailbox_id: Uuid, cursor: &str) -> Result<()> {
        let mut state = self.state();
        let mailbox = state
            .mailboxes
            .get_mut(&mailbox_id)
            .ok_or(ScanError::MailboxNotFound(mailbox_id))?;
        let now = Utc::now();
        mailbox.sync_cursor = Some(cursor.to_string());
        mailbox.last_synced_at = Some(now);
        mailbox.updated_at = now;
        Ok(())
    }
}
