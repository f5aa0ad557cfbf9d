//! Discovery: page through the remote query and fill the work queue.

use tracing::{debug, info, instrument};

use super::{finish_job, move_job, PhaseReport, ScanDeps, TimeBudget};
use crate::error::Result;
use crate::traits::mailbox::MailboxClient;
use crate::types::job::{ScanJob, ScanStatus};

/// Run Discovery from the job's saved page token.
///
/// The page cursor is persisted after every page and the discovered total is
/// recounted from the queue, so a page enqueued by an interrupted call is
/// still counted when it is listed again. On budget exhaustion the call
/// returns unfinished and the next call resumes at the saved page.
#[instrument(skip_all, fields(job_id = %job.id))]
pub async fn run_discovery(
    deps: &ScanDeps,
    client: &dyn MailboxClient,
    job: &ScanJob,
    budget: &TimeBudget,
) -> Result<PhaseReport> {
    let store = &deps.store;
    let mut report = PhaseReport::new(job);
    let mut page_token = job.page_token.clone();

    loop {
        let page = client
            .list_messages(&job.query, page_token.as_deref(), deps.config.page_size)
            .await?;

        let inserted = store.enqueue_messages(job.id, &page.ids).await?;
        let inserted = i32::try_from(inserted).unwrap_or(i32::MAX);
        store
            .save_discovery_page(job.id, page.next_page_token.as_deref())
            .await?;
        report.discovered += inserted;

        debug!(
            listed = page.ids.len(),
            inserted,
            has_more = page.next_page_token.is_some(),
            "discovery page saved"
        );

        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
        if budget.exhausted() {
            info!(
                discovered = report.discovered,
                elapsed_ms = budget.elapsed().as_millis() as u64,
                "discovery yielding on time budget"
            );
            return Ok(report);
        }
    }

    let job = store.finish_discovery(job.id).await?;
    let counts = store.queue_counts(job.id).await?;
    report.finished = true;

    info!(
        total_discovered = job.total_discovered,
        queued = counts.total,
        "discovery finished"
    );

    report.status = if counts.total == 0 {
        finish_job(deps, client, &job, ScanStatus::Discovering).await?
    } else {
        move_job(deps, &job, ScanStatus::Discovering, ScanStatus::Processing).await?
    };
    Ok(report)
}
