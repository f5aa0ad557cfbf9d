//! Regex-processing phase: claim PENDING items and run the deterministic
//! extractor over each message.

use tracing::{debug, info, instrument, warn};

use super::{finish_job, move_job, PhaseReport, ScanDeps, TimeBudget};
use crate::error::Result;
use crate::extractor::{extract_candidate, needs_ai};
use crate::traits::mailbox::MailboxClient;
use crate::types::job::{CounterDelta, ScanJob, ScanStatus};
use crate::types::queue::{ItemOutcome, QueueItemStatus, ScanQueueItem};

/// Process one claimed batch of PENDING items.
///
/// Per-item failures are recorded on the item and the batch continues.
/// Claimed items left over when the budget runs out go back to PENDING.
/// Each item's counters are written together with its completion.
#[instrument(skip_all, fields(job_id = %job.id))]
pub async fn run_regex_pass(
    deps: &ScanDeps,
    client: &dyn MailboxClient,
    job: &ScanJob,
    budget: &TimeBudget,
) -> Result<PhaseReport> {
    let store = &deps.store;
    let mut report = PhaseReport::new(job);

    let items = store
        .claim_pending(job.id, deps.config.regex_batch_size, deps.config.claim_lease)
        .await?;
    debug!(claimed = items.len(), "regex batch claimed");

    let mut stopped_at = None;

    for (idx, item) in items.iter().enumerate() {
        if idx > 0 && budget.exhausted() {
            stopped_at = Some(idx);
            break;
        }

        let outcome = match process_item(deps, client, job, item).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_terminal() => {
                release_from(deps, &items[idx..]).await?;
                return Err(e);
            }
            Err(e) => {
                warn!(message_id = %item.message_id, error = %e, "regex pass failed for message");
                ItemOutcome::Failed {
                    error: e.truncated(),
                }
            }
        };

        let delta = tally(&outcome);
        if store.complete_item(item, &outcome, &delta).await? {
            report.counters.merge(&delta);
        } else {
            warn!(message_id = %item.message_id, "claim superseded before completion");
        }
    }

    if let Some(idx) = stopped_at {
        let released = release_from(deps, &items[idx..]).await?;
        info!(
            processed = report.counters.processed,
            released,
            "regex pass yielding on time budget"
        );
        return Ok(report);
    }

    let counts = store.queue_counts(job.id).await?;
    if !counts.regex_drained() {
        return Ok(report);
    }

    report.finished = true;
    report.status = if !job.discovery_finished() {
        move_job(deps, job, ScanStatus::Processing, ScanStatus::Discovering).await?
    } else if counts.regex_done_needing_ai > 0 {
        move_job(deps, job, ScanStatus::Processing, ScanStatus::AiPass).await?
    } else {
        finish_job(deps, client, job, ScanStatus::Processing).await?
    };
    Ok(report)
}

async fn process_item(
    deps: &ScanDeps,
    client: &dyn MailboxClient,
    job: &ScanJob,
    item: &ScanQueueItem,
) -> Result<ItemOutcome> {
    let store = &deps.store;

    if let Some(existing) = store
        .find_document_by_message(job.account_id, &item.message_id)
        .await?
    {
        return Ok(ItemOutcome::Duplicate {
            document_id: Some(existing.id),
        });
    }

    let message = client.get_message(&item.message_id).await?;
    let Some(candidate) = extract_candidate(&message, &deps.config) else {
        return Ok(ItemOutcome::Skipped);
    };

    let needs_ai = needs_ai(&message, &deps.config);
    let document = candidate.into_new_document(job.account_id, job.mailbox_id, &item.message_id);

    match store.insert_document(document).await? {
        Some(created) => Ok(ItemOutcome::RegexDone {
            document_id: created.id,
            needs_ai,
        }),
        // Lost a race with another invocation for the same message
        None => {
            let existing = store
                .find_document_by_message(job.account_id, &item.message_id)
                .await?;
            Ok(ItemOutcome::Duplicate {
                document_id: existing.map(|d| d.id),
            })
        }
    }
}

fn tally(outcome: &ItemOutcome) -> CounterDelta {
    let mut delta = CounterDelta {
        processed: 1,
        ..Default::default()
    };
    match outcome {
        ItemOutcome::RegexDone { needs_ai, .. } => {
            delta.created = 1;
            if *needs_ai {
                delta.ai_total = 1;
            }
        }
        ItemOutcome::Duplicate { .. } | ItemOutcome::Skipped => delta.skipped = 1,
        ItemOutcome::Failed { .. } => delta.errored = 1,
        ItemOutcome::AiDone { .. } => {}
    }
    delta
}

async fn release_from(deps: &ScanDeps, items: &[ScanQueueItem]) -> Result<u64> {
    deps.store
        .release_items(items, QueueItemStatus::Pending)
        .await
}
