//! Deep-scan pipeline: phase handlers, orchestrator, control surface and
//! incremental sync.
//!
//! Every entry point is a bounded, stateless call. All state lives in the
//! store, so a host can kill an invocation at any point and the next one
//! continues from the last checkpoint.

pub mod ai_pass;
pub mod budget;
pub mod control;
pub mod discovery;
pub mod incremental;
pub mod orchestrator;
pub mod regex_pass;

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::error::Result;
use crate::traits::{
    ai::AiExtractor,
    mailbox::{MailboxClient, MailboxConnector},
    store::ScanStore,
};
use crate::types::job::{CounterDelta, ScanJob, ScanStatus};

pub use budget::TimeBudget;
pub use control::ScanControl;
pub use incremental::{IncrementalSync, SyncReport};
pub use orchestrator::{ScanOrchestrator, TickReport};

/// Everything the pipeline talks to, injected by the caller.
#[derive(Clone)]
pub struct ScanDeps {
    pub store: Arc<dyn ScanStore>,
    pub connector: Arc<dyn MailboxConnector>,
    pub ai: Arc<dyn AiExtractor>,
    pub config: ScanConfig,
}

impl ScanDeps {
    pub fn new(
        store: Arc<dyn ScanStore>,
        connector: Arc<dyn MailboxConnector>,
        ai: Arc<dyn AiExtractor>,
        config: ScanConfig,
    ) -> Self {
        Self {
            store,
            connector,
            ai,
            config,
        }
    }
}

/// Result of one phase call for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub job_id: Uuid,
    /// Phase that ran
    pub phase: ScanStatus,
    /// Job status after the call
    pub status: ScanStatus,
    /// False when the call yielded on its time budget with work left
    pub finished: bool,
    /// New queue items inserted (Discovery only)
    pub discovered: i32,
    #[serde(skip)]
    pub counters: CounterDelta,
}

impl PhaseReport {
    pub(crate) fn new(job: &ScanJob) -> Self {
        Self {
            job_id: job.id,
            phase: job.status,
            status: job.status,
            finished: false,
            discovered: 0,
            counters: CounterDelta::default(),
        }
    }
}

/// Move a job from `from` to COMPLETED and advance the mailbox cursor.
///
/// Returns the resulting status; a job paused mid-batch keeps PAUSED.
pub(crate) async fn finish_job(
    deps: &ScanDeps,
    client: &dyn MailboxClient,
    job: &ScanJob,
    from: ScanStatus,
) -> Result<ScanStatus> {
    if !deps
        .store
        .transition(job.id, from, ScanStatus::Completed)
        .await?
    {
        return current_status(deps, job).await;
    }

    info!(job_id = %job.id, mailbox_id = %job.mailbox_id, from = %from, "scan completed");
    advance_cursor(deps, client, job.mailbox_id).await;
    Ok(ScanStatus::Completed)
}

/// Move a job between two non-terminal phases.
pub(crate) async fn move_job(
    deps: &ScanDeps,
    job: &ScanJob,
    from: ScanStatus,
    to: ScanStatus,
) -> Result<ScanStatus> {
    if deps.store.transition(job.id, from, to).await? {
        info!(job_id = %job.id, from = %from, to = %to, "scan phase changed");
        Ok(to)
    } else {
        current_status(deps, job).await
    }
}

async fn current_status(deps: &ScanDeps, job: &ScanJob) -> Result<ScanStatus> {
    Ok(deps
        .store
        .get_job(job.id)
        .await?
        .map(|j| j.status)
        .unwrap_or(job.status))
}

/// Save the mailbox's latest cursor. Failure is logged and reported as false.
pub(crate) async fn advance_cursor(
    deps: &ScanDeps,
    client: &dyn MailboxClient,
    mailbox_id: Uuid,
) -> bool {
    let cursor = match client.latest_cursor().await {
        Ok(cursor) => cursor,
        Err(e) => {
            warn!(mailbox_id = %mailbox_id, error = %e, "failed to fetch latest sync cursor");
            return false;
        }
    };

    match deps.store.advance_sync_cursor(mailbox_id, &cursor).await {
        Ok(()) => true,
        Err(e) => {
            warn!(mailbox_id = %mailbox_id, error = %e, "failed to save sync cursor");
            false
        }
    }
}
