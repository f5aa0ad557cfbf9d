//! PostgreSQL storage implementation.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent invocations partition
//! the queue without blocking each other.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::traits::store::{DocumentStore, MailboxStore, ScanJobStore, ScanQueueStore};
use crate::types::{
    document::{Enrichment, FinancialDocument, NewDocument, VendorConsensus},
    job::{CounterDelta, ScanJob, ScanStatus},
    mailbox::MailboxConnection,
    queue::{ItemOutcome, QueueCounts, QueueItemStatus, ScanQueueItem},
};

/// PostgreSQL-backed scan storage.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the database.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Create from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Insert or refresh a mailbox connection.
    pub async fn upsert_mailbox(&self, mailbox: &MailboxConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mailbox_connections
                (id, account_id, email_address, access_token, sync_cursor, last_synced_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                email_address = EXCLUDED.email_address,
                access_token = EXCLUDED.access_token,
                updated_at = NOW()
            "#,
        )
        .bind(mailbox.id)
        .bind(mailbox.account_id)
        .bind(&mailbox.email_address)
        .bind(&mailbox.access_token)
        .bind(&mailbox.sync_cursor)
        .bind(mailbox.last_synced_at)
        .bind(mailbox.created_at)
        .bind(mailbox.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn require_job(&self, job_id: Uuid) -> Result<()> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM scan_jobs WHERE id = $1)")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(())
        } else {
            Err(ScanError::JobNotFound(job_id))
        }
    }

    async fn claim(
        &self,
        job_id: Uuid,
        limit: i64,
        lease: Duration,
        from: QueueItemStatus,
        to: QueueItemStatus,
        require_ai: bool,
    ) -> Result<Vec<ScanQueueItem>> {
        let items = sqlx::query_as::<_, ScanQueueItem>(
            r#"
            WITH next_items AS (
                SELECT id
                FROM scan_queue_items
                WHERE job_id = $1
                  AND (
                      (status = $3 AND ($5 = false OR needs_ai = true))
                      OR (status = $4 AND claimed_at < NOW() - ($6 || ' milliseconds')::INTERVAL)
                  )
                ORDER BY created_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scan_queue_items
            SET
                status = $4,
                claimed_at = NOW(),
                version = version + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_items)
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .bind(from)
        .bind(to)
        .bind(require_ai)
        .bind(lease.as_millis().to_string())
        .fetch_all(&self.pool)
        .await?;

        debug!(job_id = %job_id, claimed = items.len(), status = ?to, "claimed queue items");
        Ok(items)
    }
}

#[async_trait]
impl ScanJobStore for PostgresStore {
    async fn create_job(&self, job: &ScanJob) -> Result<ScanJob> {
        let inserted = sqlx::query_as::<_, ScanJob>(
            r#"
            INSERT INTO scan_jobs (id, account_id, mailbox_id, status, query, page_token, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(job.account_id)
        .bind(job.mailbox_id)
        .bind(job.status)
        .bind(&job.query)
        .bind(&job.page_token)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(job) => Ok(job),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let active = self.find_active_job(job.mailbox_id).await?;
                Err(ScanError::ActiveScanExists {
                    job_id: active.map(|j| j.id).unwrap_or(job.id),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ScanJob>> {
        let job = sqlx::query_as::<_, ScanJob>("SELECT * FROM scan_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn find_active_job(&self, mailbox_id: Uuid) -> Result<Option<ScanJob>> {
        let job = sqlx::query_as::<_, ScanJob>(
            r#"
            SELECT * FROM scan_jobs
            WHERE mailbox_id = $1 AND status NOT IN ('completed', 'failed')
            LIMIT 1
            "#,
        )
        .bind(mailbox_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn latest_job_for_account(&self, account_id: Uuid) -> Result<Option<ScanJob>> {
        let job = sqlx::query_as::<_, ScanJob>(
            r#"
            SELECT * FROM scan_jobs
            WHERE account_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn list_non_terminal_jobs(&self) -> Result<Vec<ScanJob>> {
        let jobs = sqlx::query_as::<_, ScanJob>(
            r#"
            SELECT * FROM scan_jobs
            WHERE status NOT IN ('completed', 'failed')
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn transition(&self, job_id: Uuid, from: ScanStatus, to: ScanStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = $3,
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(job_id)
        .bind(from)
        .bind(to)
        .bind(to == ScanStatus::Completed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.require_job(job_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.require_job(job_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn record_job_error(&self, job_id: Uuid, error: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE scan_jobs SET last_error = $2, updated_at = NOW() WHERE id = $1")
                .bind(job_id)
                .bind(error)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(ScanError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn save_discovery_page(
        &self,
        job_id: Uuid,
        next_page_token: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET page_token = $2,
                total_discovered = (SELECT COUNT(*)::INT FROM scan_queue_items WHERE job_id = $1),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(next_page_token)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ScanError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn finish_discovery(&self, job_id: Uuid) -> Result<ScanJob> {
        sqlx::query_as::<_, ScanJob>(
            r#"
            WITH queued AS (
                SELECT COUNT(*)::INT AS total
                FROM scan_queue_items
                WHERE job_id = $1
            )
            UPDATE scan_jobs
            SET page_token = NULL,
                total_discovered = queued.total,
                total_to_process = queued.total,
                discovery_completed_at = NOW(),
                updated_at = NOW()
            FROM queued
            WHERE id = $1
            RETURNING scan_jobs.*
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ScanError::JobNotFound(job_id))
    }
}

#[async_trait]
impl ScanQueueStore for PostgresStore {
    async fn enqueue_messages(&self, job_id: Uuid, message_ids: &[String]) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = message_ids.iter().map(|_| Uuid::now_v7()).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO scan_queue_items (id, job_id, message_id)
            SELECT id, $1, message_id
            FROM UNNEST($2::uuid[], $3::text[]) AS t(id, message_id)
            ON CONFLICT (job_id, message_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(&ids)
        .bind(message_ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn claim_pending(
        &self,
        job_id: Uuid,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScanQueueItem>> {
        self.claim(
            job_id,
            limit,
            lease,
            QueueItemStatus::Pending,
            QueueItemStatus::Processing,
            false,
        )
        .await
    }

    async fn claim_for_ai(
        &self,
        job_id: Uuid,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScanQueueItem>> {
        self.claim(
            job_id,
            limit,
            lease,
            QueueItemStatus::RegexDone,
            QueueItemStatus::AiProcessing,
            true,
        )
        .await
    }

    async fn complete_item(
        &self,
        item: &ScanQueueItem,
        outcome: &ItemOutcome,
        delta: &CounterDelta,
    ) -> Result<bool> {
        let (document_id, needs_ai, error) = match outcome {
            ItemOutcome::Duplicate { document_id } => (*document_id, None, None),
            ItemOutcome::Skipped => (None, None, None),
            ItemOutcome::RegexDone {
                document_id,
                needs_ai,
            } => (Some(*document_id), Some(*needs_ai), None),
            ItemOutcome::AiDone { error } => (None, None, error.clone()),
            ItemOutcome::Failed { error } => (None, None, Some(error.clone())),
        };

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE scan_queue_items
            SET status = $3,
                document_id = COALESCE($4, document_id),
                needs_ai = COALESCE($5, needs_ai),
                error = $6,
                claimed_at = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2 AND status IN ('processing', 'ai_processing')
            "#,
        )
        .bind(item.id)
        .bind(item.version)
        .bind(outcome.status())
        .bind(document_id)
        .bind(needs_ai)
        .bind(error)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        if !delta.is_empty() {
            sqlx::query(
                r#"
                UPDATE scan_jobs
                SET processed_count = processed_count + $2,
                    documents_created = documents_created + $3,
                    skipped_count = skipped_count + $4,
                    error_count = error_count + $5,
                    ai_total = ai_total + $6,
                    ai_processed = ai_processed + $7,
                    ai_skipped = ai_skipped + $8,
                    ai_shortcut = ai_shortcut + $9,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(item.job_id)
            .bind(delta.processed)
            .bind(delta.created)
            .bind(delta.skipped)
            .bind(delta.errored)
            .bind(delta.ai_total)
            .bind(delta.ai_processed)
            .bind(delta.ai_skipped)
            .bind(delta.ai_shortcut)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn release_items(
        &self,
        items: &[ScanQueueItem],
        status: QueueItemStatus,
    ) -> Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
        let versions: Vec<i32> = items.iter().map(|i| i.version).collect();

        let result = sqlx::query(
            r#"
            UPDATE scan_queue_items q
            SET status = $3,
                claimed_at = NULL,
                version = q.version + 1,
                updated_at = NOW()
            FROM UNNEST($1::uuid[], $2::int[]) AS claim(id, version)
            WHERE q.id = claim.id
              AND q.version = claim.version
              AND q.status IN ('processing', 'ai_processing')
            "#,
        )
        .bind(&ids)
        .bind(&versions)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn queue_counts(&self, job_id: Uuid) -> Result<QueueCounts> {
        let (total, pending, processing, regex_done_needing_ai, ai_processing): (
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'processing'),
                COUNT(*) FILTER (WHERE status = 'regex_done' AND needs_ai),
                COUNT(*) FILTER (WHERE status = 'ai_processing')
            FROM scan_queue_items
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueCounts {
            total,
            pending,
            processing,
            regex_done_needing_ai,
            ai_processing,
        })
    }

    async fn list_items(&self, job_id: Uuid) -> Result<Vec<ScanQueueItem>> {
        let items = sqlx::query_as::<_, ScanQueueItem>(
            "SELECT * FROM scan_queue_items WHERE job_id = $1 ORDER BY created_at, id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn find_document_by_message(
        &self,
        account_id: Uuid,
        message_id: &str,
    ) -> Result<Option<FinancialDocument>> {
        let document = sqlx::query_as::<_, FinancialDocument>(
            "SELECT * FROM financial_documents WHERE account_id = $1 AND source_message_id = $2",
        )
        .bind(account_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(document)
    }

    async fn get_document(&self, document_id: Uuid) -> Result<Option<FinancialDocument>> {
        let document =
            sqlx::query_as::<_, FinancialDocument>("SELECT * FROM financial_documents WHERE id = $1")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(document)
    }

    async fn insert_document(&self, document: NewDocument) -> Result<Option<FinancialDocument>> {
        let doc = document.into_document();
        let inserted = sqlx::query_as::<_, FinancialDocument>(
            r#"
            INSERT INTO financial_documents (
                id, account_id, mailbox_id, source_message_id, vendor, amount_minor,
                currency, category, doc_type, status, source, confidence, subject,
                issued_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (account_id, source_message_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(doc.id)
        .bind(doc.account_id)
        .bind(doc.mailbox_id)
        .bind(&doc.source_message_id)
        .bind(&doc.vendor)
        .bind(doc.amount_minor)
        .bind(&doc.currency)
        .bind(&doc.category)
        .bind(doc.doc_type)
        .bind(doc.status)
        .bind(doc.source)
        .bind(doc.confidence)
        .bind(&doc.subject)
        .bind(doc.issued_at)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted)
    }

    async fn apply_enrichment(
        &self,
        document_id: Uuid,
        enrichment: &Enrichment,
    ) -> Result<FinancialDocument> {
        let document = sqlx::query_as::<_, FinancialDocument>(
            r#"
            UPDATE financial_documents
            SET vendor = COALESCE($2, vendor),
                amount_minor = COALESCE($3, amount_minor),
                currency = COALESCE($4, currency),
                category = COALESCE($5, category),
                doc_type = COALESCE($6, doc_type),
                status = $7,
                source = $8,
                confidence = $9,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(document_id)
        .bind(&enrichment.vendor)
        .bind(enrichment.amount_minor)
        .bind(&enrichment.currency)
        .bind(&enrichment.category)
        .bind(enrichment.doc_type)
        .bind(enrichment.status)
        .bind(enrichment.source)
        .bind(enrichment.confidence)
        .fetch_one(&self.pool)
        .await?;
        Ok(document)
    }

    async fn vendor_consensus(
        &self,
        account_id: Uuid,
        vendor: &str,
        min_confidence: f32,
        min_documents: i64,
        exclude: Uuid,
    ) -> Result<Option<VendorConsensus>> {
        let row: Option<(Option<String>, String, i64)> = sqlx::query_as(
            r#"
            SELECT MODE() WITHIN GROUP (ORDER BY vendor), category, COUNT(*)
            FROM financial_documents
            WHERE account_id = $1
              AND LOWER(TRIM(vendor)) = LOWER(TRIM($2))
              AND confidence >= $3
              AND id <> $5
              AND category IS NOT NULL
            GROUP BY category
            HAVING COUNT(*) >= $4
            ORDER BY COUNT(*) DESC, category
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .bind(vendor)
        .bind(min_confidence)
        .bind(min_documents)
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(spelling, category, count)| VendorConsensus {
            vendor: spelling.unwrap_or_else(|| vendor.to_string()),
            category,
            supporting_documents: count,
        }))
    }
}

#[async_trait]
impl MailboxStore for PostgresStore {
    async fn get_mailbox(&self, mailbox_id: Uuid) -> Result<Option<MailboxConnection>> {
        let mailbox = sqlx::query_as::<_, MailboxConnection>(
            "SELECT * FROM mailbox_connections WHERE id = $1",
        )
        .bind(mailbox_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(mailbox)
    }

    async fn list_mailboxes(&self) -> Result<Vec<MailboxConnection>> {
        let mailboxes = sqlx::query_as::<_, MailboxConnection>(
            "SELECT * FROM mailbox_connections ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(mailboxes)
    }

    async fn advance_sync_cursor(&self, mailbox_id: Uuid, cursor: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE mailbox_connections
            SET sync_cursor = $2, last_synced_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(mailbox_id)
        .bind(cursor)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ScanError::MailboxNotFound(mailbox_id));
        }
        Ok(())
    }
}
