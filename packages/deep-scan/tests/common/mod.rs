//! Shared harness and fixtures for pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use deep_scan::testing::{MockAi, MockConnector, MockMailbox};
use deep_scan::types::document::{
    DocumentSource, DocumentStatus, Enrichment, NewDocument, VendorConsensus,
};
use deep_scan::types::job::CounterDelta;
use deep_scan::types::queue::{ItemOutcome, QueueCounts};
use deep_scan::{
    AttachmentRef, FinancialDocument, IncrementalSync, MailMessage, MailboxConnection,
    MemoryStore, QueueItemStatus, ScanConfig, ScanControl, ScanDeps, ScanError, ScanJob,
    ScanJobStore, ScanOrchestrator, ScanQueueItem, ScanQueueStore, ScanStatus, ScanStore,
};
use deep_scan::{DocumentStore, MailboxStore};

/// In-memory store, mock mailbox and mock AI wired together.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub mailbox: Arc<MockMailbox>,
    pub ai: Arc<MockAi>,
    pub deps: ScanDeps,
    pub account_id: Uuid,
    pub mailbox_id: Uuid,
}

impl Harness {
    pub fn new(mailbox: MockMailbox) -> Self {
        Self::build(mailbox, MockAi::new(), ScanConfig::default())
    }

    pub fn build(mailbox: MockMailbox, ai: MockAi, config: ScanConfig) -> Self {
        Self::build_for(connection(), mailbox, ai, config)
    }

    /// Same as [`Harness::build`] with a caller-supplied mailbox row.
    pub fn build_for(
        connection: MailboxConnection,
        mailbox: MockMailbox,
        ai: MockAi,
        config: ScanConfig,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mailbox = Arc::new(mailbox);
        let ai = Arc::new(ai);

        let account_id = connection.account_id;
        let mailbox_id = connection.id;
        store.add_mailbox(connection);

        let deps = ScanDeps::new(
            store.clone(),
            Arc::new(MockConnector::new(mailbox.clone())),
            ai.clone(),
            config,
        );

        Self {
            store,
            mailbox,
            ai,
            deps,
            account_id,
            mailbox_id,
        }
    }

    pub fn orchestrator(&self) -> ScanOrchestrator {
        ScanOrchestrator::new(self.deps.clone())
    }

    pub fn control(&self) -> ScanControl {
        ScanControl::new(self.deps.clone())
    }

    pub fn sync(&self) -> IncrementalSync {
        IncrementalSync::new(self.deps.clone())
    }

    pub async fn start(&self) -> Uuid {
        self.control().start(self.mailbox_id).await.unwrap()
    }

    pub async fn job(&self, job_id: Uuid) -> ScanJob {
        self.store.get_job(job_id).await.unwrap().unwrap()
    }

    pub async fn mailbox_row(&self) -> MailboxConnection {
        self.store.get_mailbox(self.mailbox_id).await.unwrap().unwrap()
    }

    /// Tick until the job is terminal, returning the statuses seen after
    /// each tick.
    pub async fn run_to_end(&self, job_id: Uuid, max_ticks: usize) -> Vec<ScanStatus> {
        let orchestrator = self.orchestrator();
        let mut seen = Vec::new();
        for _ in 0..max_ticks {
            orchestrator.tick().await.unwrap();
            let status = self.job(job_id).await.status;
            seen.push(status);
            if status.is_terminal() {
                return seen;
            }
        }
        panic!("job did not finish within {} ticks: {:?}", max_ticks, seen);
    }

    /// Store a prior high-confidence document for the vendor shortcut.
    pub async fn seed_confident_document(
        &self,
        message_id: &str,
        vendor: &str,
        category: &str,
    ) -> FinancialDocument {
        let doc = self
            .store
            .insert_document(
                NewDocument::builder()
                    .account_id(self.account_id)
                    .mailbox_id(self.mailbox_id)
                    .source_message_id(message_id)
                    .vendor(Some(vendor.to_string()))
                    .build(),
            )
            .await
            .unwrap()
            .unwrap();

        self.store
            .apply_enrichment(
                doc.id,
                &Enrichment {
                    vendor: None,
                    amount_minor: Some(4_900),
                    currency: Some("USD".into()),
                    category: Some(category.to_string()),
                    doc_type: None,
                    status: DocumentStatus::Pending,
                    source: DocumentSource::Ai,
                    confidence: 0.92,
                },
            )
            .await
            .unwrap()
    }

    pub async fn document_for(&self, message_id: &str) -> Option<FinancialDocument> {
        self.store
            .find_document_by_message(self.account_id, message_id)
            .await
            .unwrap()
    }

    /// The harness dependencies with a different store in front.
    pub fn deps_with_store(&self, store: Arc<dyn ScanStore>) -> ScanDeps {
        ScanDeps::new(
            store,
            self.deps.connector.clone(),
            self.deps.ai.clone(),
            self.deps.config.clone(),
        )
    }
}

// =============================================================================
// Fault injection
// =============================================================================

fn storage_down() -> ScanError {
    ScanError::Storage(sqlx::Error::PoolTimedOut)
}

/// Delegates to a [`MemoryStore`] but fails selected writes.
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    failing_job_writes: HashSet<Uuid>,
    failing_completions: HashSet<String>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_job_writes: HashSet::new(),
            failing_completions: HashSet::new(),
        }
    }

    /// `fail_job` and `record_job_error` error out for this job.
    pub fn failing_job_writes(mut self, job_id: Uuid) -> Self {
        self.failing_job_writes.insert(job_id);
        self
    }

    /// `complete_item` errors out for this message.
    pub fn failing_completion_of(mut self, message_id: &str) -> Self {
        self.failing_completions.insert(message_id.to_string());
        self
    }
}

#[async_trait]
impl ScanJobStore for FaultyStore {
    async fn create_job(&self, job: &ScanJob) -> deep_scan::Result<ScanJob> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, job_id: Uuid) -> deep_scan::Result<Option<ScanJob>> {
        self.inner.get_job(job_id).await
    }

    async fn find_active_job(&self, mailbox_id: Uuid) -> deep_scan::Result<Option<ScanJob>> {
        self.inner.find_active_job(mailbox_id).await
    }

    async fn latest_job_for_account(&self, account_id: Uuid) -> deep_scan::Result<Option<ScanJob>> {
        self.inner.latest_job_for_account(account_id).await
    }

    async fn list_non_terminal_jobs(&self) -> deep_scan::Result<Vec<ScanJob>> {
        self.inner.list_non_terminal_jobs().await
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: ScanStatus,
        to: ScanStatus,
    ) -> deep_scan::Result<bool> {
        self.inner.transition(job_id, from, to).await
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> deep_scan::Result<bool> {
        if self.failing_job_writes.contains(&job_id) {
            return Err(storage_down());
        }
        self.inner.fail_job(job_id, error).await
    }

    async fn record_job_error(&self, job_id: Uuid, error: &str) -> deep_scan::Result<()> {
        if self.failing_job_writes.contains(&job_id) {
            return Err(storage_down());
        }
        self.inner.record_job_error(job_id, error).await
    }

    async fn save_discovery_page(
        &self,
        job_id: Uuid,
        next_page_token: Option<&str>,
    ) -> deep_scan::Result<()> {
        self.inner.save_discovery_page(job_id, next_page_token).await
    }

    async fn finish_discovery(&self, job_id: Uuid) -> deep_scan::Result<ScanJob> {
        self.inner.finish_discovery(job_id).await
    }
}

#[async_trait]
impl ScanQueueStore for FaultyStore {
    async fn enqueue_messages(&self, job_id: Uuid, message_ids: &[String]) -> deep_scan::Result<u64> {
        self.inner.enqueue_messages(job_id, message_ids).await
    }

    async fn claim_pending(
        &self,
        job_id: Uuid,
        limit: i64,
        lease: Duration,
    ) -> deep_scan::Result<Vec<ScanQueueItem>> {
        self.inner.claim_pending(job_id, limit, lease).await
    }

    async fn claim_for_ai(
        &self,
        job_id: Uuid,
        limit: i64,
        lease: Duration,
    ) -> deep_scan::Result<Vec<ScanQueueItem>> {
        self.inner.claim_for_ai(job_id, limit, lease).await
    }

    async fn complete_item(
        &self,
        item: &ScanQueueItem,
        outcome: &ItemOutcome,
        delta: &CounterDelta,
    ) -> deep_scan::Result<bool> {
        if self.failing_completions.contains(&item.message_id) {
            return Err(storage_down());
        }
        self.inner.complete_item(item, outcome, delta).await
    }

    async fn release_items(
        &self,
        items: &[ScanQueueItem],
        status: QueueItemStatus,
    ) -> deep_scan::Result<u64> {
        self.inner.release_items(items, status).await
    }

    async fn queue_counts(&self, job_id: Uuid) -> deep_scan::Result<QueueCounts> {
        self.inner.queue_counts(job_id).await
    }

    async fn list_items(&self, job_id: Uuid) -> deep_scan::Result<Vec<ScanQueueItem>> {
        self.inner.list_items(job_id).await
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn find_document_by_message(
        &self,
        account_id: Uuid,
        message_id: &str,
    ) -> deep_scan::Result<Option<FinancialDocument>> {
        self.inner.find_document_by_message(account_id, message_id).await
    }

    async fn get_document(&self, document_id: Uuid) -> deep_scan::Result<Option<FinancialDocument>> {
        self.inner.get_document(document_id).await
    }

    async fn insert_document(
        &self,
        document: NewDocument,
    ) -> deep_scan::Result<Option<FinancialDocument>> {
        self.inner.insert_document(document).await
    }

    async fn apply_enrichment(
        &self,
        document_id: Uuid,
        enrichment: &Enrichment,
    ) -> deep_scan::Result<FinancialDocument> {
        self.inner.apply_enrichment(document_id, enrichment).await
    }

    async fn vendor_consensus(
        &self,
        account_id: Uuid,
        vendor: &str,
        min_confidence: f32,
        min_documents: i64,
        exclude: Uuid,
    ) -> deep_scan::Result<Option<VendorConsensus>> {
        self.inner
            .vendor_consensus(account_id, vendor, min_confidence, min_documents, exclude)
            .await
    }
}

#[async_trait]
impl MailboxStore for FaultyStore {
    async fn get_mailbox(&self, mailbox_id: Uuid) -> deep_scan::Result<Option<MailboxConnection>> {
        self.inner.get_mailbox(mailbox_id).await
    }

    async fn list_mailboxes(&self) -> deep_scan::Result<Vec<MailboxConnection>> {
        self.inner.list_mailboxes().await
    }

    async fn advance_sync_cursor(&self, mailbox_id: Uuid, cursor: &str) -> deep_scan::Result<()> {
        self.inner.advance_sync_cursor(mailbox_id, cursor).await
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// A connected mailbox with a valid token and no sync cursor.
pub fn connection() -> MailboxConnection {
    MailboxConnection::new(Uuid::new_v4(), "owner@example.com").with_access_token("ya29.test-token")
}

pub fn ids(prefix: &str, range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("{}-{}", prefix, i)).collect()
}

/// A plain receipt with an amount in the body and no attachment.
pub fn receipt(id: &str, vendor: &str, amount: &str) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        from: format!(
            "\"{}\" <receipts@{}.com>",
            vendor,
            vendor.to_lowercase().replace(' ', "")
        ),
        subject: format!("Your {} receipt", vendor),
        snippet: "Thanks for your purchase".into(),
        body_text: format!("Order summary\nTotal: ${}", amount),
        ..Default::default()
    }
}

/// An invoice whose details live in a PDF attachment.
pub fn invoice_with_pdf(id: &str, vendor: &str, size: u64) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        from: format!(
            "\"{}\" <billing@{}.com>",
            vendor,
            vendor.to_lowercase().replace(' ', "")
        ),
        subject: "Your invoice is ready".into(),
        body_text: "Please find your invoice attached.".into(),
        attachments: vec![attachment("att-pdf", "invoice.pdf", "application/pdf", size)],
        ..Default::default()
    }
}

/// A message with no financial signal.
pub fn newsletter(id: &str) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        from: "\"Weekly Digest\" <news@digest.io>".into(),
        subject: "This week in tech".into(),
        body_text: "Ten links you missed.".into(),
        ..Default::default()
    }
}

pub fn attachment(id: &str, filename: &str, mime_type: &str, size: u64) -> AttachmentRef {
    AttachmentRef {
        attachment_id: id.to_string(),
        filename: filename.to_string(),
        mime_type: mime_type.to_string(),
        size,
    }
}
