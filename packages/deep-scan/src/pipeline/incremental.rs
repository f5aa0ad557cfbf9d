//! Incremental sync: ingest messages added since the mailbox's saved cursor
//! without the durable queue.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    advance_cursor,
    ai_pass::{enrich_from_attachment, try_vendor_shortcut, EnrichStep},
    ScanDeps,
};
use crate::error::{Result, ScanError};
use crate::extractor::{extract_candidate, needs_ai};
use crate::traits::mailbox::MailboxClient;
use crate::types::mailbox::MailboxConnection;
use crate::types::message::HistoryDelta;

/// Outcome of one sync run for one mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub mailbox_id: Uuid,
    /// A deep scan is active; nothing was done
    pub deferred: bool,
    /// The cursor was missing or expired and recent messages were listed
    pub used_fallback: bool,
    pub fetched: u32,
    pub created: u32,
    pub skipped: u32,
    pub errored: u32,
    pub ai_calls: u32,
    pub cursor_advanced: bool,
}

impl SyncReport {
    fn new(mailbox_id: Uuid) -> Self {
        Self {
            mailbox_id,
            ..Default::default()
        }
    }
}

pub struct IncrementalSync {
    deps: ScanDeps,
}

impl IncrementalSync {
    pub fn new(deps: ScanDeps) -> Self {
        Self { deps }
    }

    /// Sync every stored mailbox. Per-mailbox failures are logged and skipped.
    pub async fn sync_all(&self) -> Result<Vec<SyncReport>> {
        let mailboxes = self.deps.store.list_mailboxes().await?;
        let mut reports = Vec::with_capacity(mailboxes.len());

        for mailbox in mailboxes {
            match self.sync_mailbox(mailbox.id).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(mailbox_id = %mailbox.id, error = %e, "incremental sync failed");
                }
            }
        }
        Ok(reports)
    }

    /// Sync one mailbox. No-op while a deep scan is active on it.
    #[instrument(skip(self))]
    pub async fn sync_mailbox(&self, mailbox_id: Uuid) -> Result<SyncReport> {
        let store = &self.deps.store;
        let mut report = SyncReport::new(mailbox_id);

        let mailbox = store
            .get_mailbox(mailbox_id)
            .await?
            .ok_or(ScanError::MailboxNotFound(mailbox_id))?;

        if let Some(active) = store.find_active_job(mailbox_id).await? {
            debug!(job_id = %active.id, "deep scan active, skipping incremental sync");
            report.deferred = true;
            return Ok(report);
        }

        let client = self.deps.connector.connect(&mailbox)?;
        let ids = self
            .new_message_ids(client.as_ref(), &mailbox, &mut report)
            .await?;

        for message_id in &ids {
            match self
                .ingest(client.as_ref(), &mailbox, message_id, &mut report)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "incremental sync failed for message");
                    report.errored += 1;
                }
            }
        }

        report.cursor_advanced = advance_cursor(&self.deps, client.as_ref(), mailbox_id).await;

        info!(
            fetched = report.fetched,
            created = report.created,
            skipped = report.skipped,
            errored = report.errored,
            ai_calls = report.ai_calls,
            used_fallback = report.used_fallback,
            cursor_advanced = report.cursor_advanced,
            "incremental sync finished"
        );
        Ok(report)
    }

    async fn new_message_ids(
        &self,
        client: &dyn MailboxClient,
        mailbox: &MailboxConnection,
        report: &mut SyncReport,
    ) -> Result<Vec<String>> {
        let delta = match mailbox.sync_cursor.as_deref() {
            Some(cursor) => client.history_delta(cursor).await?,
            None => HistoryDelta::CursorExpired,
        };

        let ids = match delta {
            HistoryDelta::Changes(ids) => ids,
            HistoryDelta::CursorExpired => {
                report.used_fallback = true;
                let limit = self.deps.config.recent_fallback_limit;
                let page = client
                    .list_messages(
                        &self.deps.config.recent_fallback_query,
                        None,
                        u32::try_from(limit).unwrap_or(u32::MAX),
                    )
                    .await?;
                page.ids.into_iter().take(limit).collect()
            }
        };

        let mut seen = HashSet::new();
        Ok(ids.into_iter().filter(|id| seen.insert(id.clone())).collect())
    }

    async fn ingest(
        &self,
        client: &dyn MailboxClient,
        mailbox: &MailboxConnection,
        message_id: &str,
        report: &mut SyncReport,
    ) -> Result<()> {
        let store = &self.deps.store;
        let config = &self.deps.config;

        if store
            .find_document_by_message(mailbox.account_id, message_id)
            .await?
            .is_some()
        {
            report.skipped += 1;
            return Ok(());
        }

        let message = client.get_message(message_id).await?;
        report.fetched += 1;

        let Some(candidate) = extract_candidate(&message, config) else {
            report.skipped += 1;
            return Ok(());
        };
        let wants_ai = needs_ai(&message, config);

        let document = candidate.into_new_document(mailbox.account_id, mailbox.id, message_id);
        let Some(document) = store.insert_document(document).await? else {
            report.skipped += 1;
            return Ok(());
        };
        report.created += 1;

        if !wants_ai || !self.deps.ai.is_enabled() {
            return Ok(());
        }
        if try_vendor_shortcut(&self.deps, mailbox.account_id, &document).await? {
            return Ok(());
        }
        if report.ai_calls >= config.incremental_ai_cap {
            debug!(message_id = %message_id, "AI call cap reached for this sync");
            return Ok(());
        }

        let step = enrich_from_attachment(&self.deps, client, &document, &message).await?;
        if step.called_ai() {
            report.ai_calls += 1;
        }
        if let EnrichStep::AiFailed(error) = step {
            warn!(message_id = %message_id, error = %error, "inline AI enrichment failed");
        }
        Ok(())
    }
}
