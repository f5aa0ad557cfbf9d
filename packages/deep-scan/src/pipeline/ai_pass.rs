//! AI-processing phase: enrich regex-created documents from their
//! attachments, or from the vendor's history when that is already settled.

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{finish_job, PhaseReport, ScanDeps, TimeBudget};
use crate::error::{truncate_error, Result};
use crate::extractor::{first_plausible_attachment, first_readable_attachment, normalize_vendor};
use crate::traits::ai::{AiExtraction, AiInput, ExtractionHints};
use crate::traits::mailbox::MailboxClient;
use crate::types::document::{
    DocumentSource, DocumentStatus, DocumentType, Enrichment, FinancialDocument,
};
use crate::types::job::{CounterDelta, ScanJob, ScanStatus};
use crate::types::message::{AttachmentKind, AttachmentRef, MailMessage};
use crate::types::queue::{ItemOutcome, QueueItemStatus, ScanQueueItem};

/// What happened when enriching one document.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichStep {
    /// Category copied from the vendor's prior documents, no AI call
    Shortcut,
    /// AI was called; `accepted` when confidence cleared the threshold
    Enriched { accepted: bool },
    /// AI call failed; recorded, not fatal
    AiFailed(String),
    /// No PDF or image attachment
    NoAttachment,
    /// No readable attachment inside the size band; `size` is the first
    /// readable one's
    OutOfBand { size: u64 },
    /// AI client is switched off
    Disabled,
}

impl EnrichStep {
    /// Whether this step spent an AI call.
    pub fn called_ai(&self) -> bool {
        matches!(self, EnrichStep::Enriched { .. } | EnrichStep::AiFailed(_))
    }
}

/// Process one claimed batch of REGEX_DONE items flagged needs-AI.
///
/// Every processed item ends AI_DONE whatever the outcome. Items left over
/// when the budget runs out go back to REGEX_DONE. A disabled AI client
/// completes the job immediately.
#[instrument(skip_all, fields(job_id = %job.id))]
pub async fn run_ai_pass(
    deps: &ScanDeps,
    client: &dyn MailboxClient,
    job: &ScanJob,
    budget: &TimeBudget,
) -> Result<PhaseReport> {
    let store = &deps.store;
    let mut report = PhaseReport::new(job);

    if !deps.ai.is_enabled() {
        info!("AI enrichment disabled, completing without AI pass");
        report.finished = true;
        report.status = finish_job(deps, client, job, ScanStatus::AiPass).await?;
        return Ok(report);
    }

    let items = store
        .claim_for_ai(job.id, deps.config.ai_batch_size, deps.config.claim_lease)
        .await?;
    debug!(claimed = items.len(), "AI batch claimed");

    let mut stopped_at = None;

    for (idx, item) in items.iter().enumerate() {
        if idx > 0 && budget.exhausted() {
            stopped_at = Some(idx);
            break;
        }

        let step = match enrich_item(deps, client, job, item).await {
            Ok(step) => step,
            Err(e) if e.is_terminal() => {
                release_from(deps, &items[idx..]).await?;
                return Err(e);
            }
            Err(e) => EnrichStep::AiFailed(e.truncated()),
        };

        let error = match &step {
            EnrichStep::AiFailed(error) => {
                warn!(message_id = %item.message_id, error = %error, "AI enrichment failed");
                Some(error.clone())
            }
            _ => None,
        };
        let delta = tally(&step);
        if store
            .complete_item(item, &ItemOutcome::AiDone { error }, &delta)
            .await?
        {
            report.counters.merge(&delta);
        } else {
            warn!(message_id = %item.message_id, "claim superseded before completion");
        }
    }

    if let Some(idx) = stopped_at {
        let released = release_from(deps, &items[idx..]).await?;
        info!(
            ai_processed = report.counters.ai_processed,
            released,
            "AI pass yielding on time budget"
        );
        return Ok(report);
    }

    let counts = store.queue_counts(job.id).await?;
    if counts.ai_drained() {
        report.finished = true;
        report.status = finish_job(deps, client, job, ScanStatus::AiPass).await?;
    }
    Ok(report)
}

async fn enrich_item(
    deps: &ScanDeps,
    client: &dyn MailboxClient,
    job: &ScanJob,
    item: &ScanQueueItem,
) -> Result<EnrichStep> {
    let document = match item.document_id {
        Some(id) => deps.store.get_document(id).await?,
        None => None,
    };
    let Some(document) = document else {
        warn!(message_id = %item.message_id, "needs-AI item has no document");
        return Ok(EnrichStep::NoAttachment);
    };

    if try_vendor_shortcut(deps, job.account_id, &document).await? {
        return Ok(EnrichStep::Shortcut);
    }

    let message = client.get_message(&item.message_id).await?;
    enrich_from_attachment(deps, client, &document, &message).await
}

/// Copy category and vendor spelling from the vendor's prior
/// high-confidence documents when enough of them agree.
pub(crate) async fn try_vendor_shortcut(
    deps: &ScanDeps,
    account_id: Uuid,
    document: &FinancialDocument,
) -> Result<bool> {
    let Some(vendor) = document.vendor.as_deref() else {
        return Ok(false);
    };

    let Some(consensus) = deps
        .store
        .vendor_consensus(
            account_id,
            vendor,
            deps.config.high_confidence,
            deps.config.vendor_shortcut_min,
            document.id,
        )
        .await?
    else {
        return Ok(false);
    };

    debug!(
        document_id = %document.id,
        vendor = %consensus.vendor,
        category = %consensus.category,
        supporting = consensus.supporting_documents,
        "vendor shortcut applied"
    );

    deps.store
        .apply_enrichment(
            document.id,
            &Enrichment {
                vendor: Some(consensus.vendor),
                amount_minor: None,
                currency: None,
                category: Some(consensus.category),
                doc_type: None,
                status: document.status,
                source: DocumentSource::Pattern,
                confidence: document.confidence,
            },
        )
        .await?;
    Ok(true)
}

/// Download the message's first in-band PDF or image attachment and run the
/// AI extractor on it. Mailbox errors propagate; extractor errors come back as
/// [`EnrichStep::AiFailed`].
pub(crate) async fn enrich_from_attachment(
    deps: &ScanDeps,
    client: &dyn MailboxClient,
    document: &FinancialDocument,
    message: &MailMessage,
) -> Result<EnrichStep> {
    if !deps.ai.is_enabled() {
        return Ok(EnrichStep::Disabled);
    }

    let Some(attachment) = first_plausible_attachment(message, &deps.config) else {
        let Some(readable) = first_readable_attachment(message) else {
            return Ok(EnrichStep::NoAttachment);
        };
        debug!(
            message_id = %message.id,
            size = readable.size,
            "no attachment inside size band, skipping AI"
        );
        return Ok(EnrichStep::OutOfBand {
            size: readable.size,
        });
    };

    let bytes = client
        .get_attachment(&message.id, &attachment.attachment_id)
        .await?;
    let mime_type = image_mime_type(attachment);
    let input = match attachment.kind() {
        Some(AttachmentKind::Pdf) => AiInput::Pdf {
            bytes: &bytes,
            filename: &attachment.filename,
        },
        Some(AttachmentKind::Image) => AiInput::Image {
            bytes: &bytes,
            mime_type: &mime_type,
        },
        None => return Ok(EnrichStep::NoAttachment),
    };

    let hints = ExtractionHints {
        subject: Some(message.subject.clone()).filter(|s| !s.is_empty()),
        sender: Some(message.from.clone()).filter(|s| !s.is_empty()),
        vendor: document.vendor.clone(),
    };

    let extraction = match deps.ai.extract(input, Some(&hints)).await {
        Ok(extraction) => extraction,
        Err(e) => return Ok(EnrichStep::AiFailed(truncate_error(&e.to_string()))),
    };

    if extraction.confidence < deps.config.ai_accept_threshold {
        debug!(
            document_id = %document.id,
            confidence = extraction.confidence,
            "AI extraction below acceptance threshold"
        );
        return Ok(EnrichStep::Enriched { accepted: false });
    }

    let enrichment = enrichment_from(&extraction, deps.config.high_confidence);
    deps.store
        .apply_enrichment(document.id, &enrichment)
        .await?;
    Ok(EnrichStep::Enriched { accepted: true })
}

fn enrichment_from(extraction: &AiExtraction, high_confidence: f32) -> Enrichment {
    Enrichment {
        vendor: extraction
            .vendor
            .as_deref()
            .map(normalize_vendor)
            .filter(|v| !v.is_empty()),
        amount_minor: extraction.amount_minor,
        currency: extraction
            .currency
            .as_deref()
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty()),
        category: extraction
            .category
            .as_deref()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty()),
        doc_type: (extraction.doc_type != DocumentType::Unknown).then_some(extraction.doc_type),
        status: if extraction.confidence >= high_confidence {
            DocumentStatus::Pending
        } else {
            DocumentStatus::Review
        },
        source: DocumentSource::Ai,
        confidence: extraction.confidence,
    }
}

fn image_mime_type(attachment: &AttachmentRef) -> String {
    let mime = attachment.mime_type.to_ascii_lowercase();
    if mime.starts_with("image/") {
        return mime;
    }
    let filename = attachment.filename.to_ascii_lowercase();
    match filename.rsplit('.').next() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        _ => "image/jpeg",
    }
    .to_string()
}

fn tally(step: &EnrichStep) -> CounterDelta {
    let mut delta = CounterDelta {
        ai_processed: 1,
        ..Default::default()
    };
    match step {
        EnrichStep::Shortcut => delta.ai_shortcut = 1,
        EnrichStep::AiFailed(_) => delta.errored = 1,
        EnrichStep::NoAttachment | EnrichStep::OutOfBand { .. } | EnrichStep::Disabled => {
            delta.ai_skipped = 1
        }
        EnrichStep::Enriched { .. } => {}
    }
    delta
}

async fn release_from(deps: &ScanDeps, items: &[ScanQueueItem]) -> Result<u64> {
    deps.store
        .release_items(items, QueueItemStatus::RegexDone)
        .await
}
