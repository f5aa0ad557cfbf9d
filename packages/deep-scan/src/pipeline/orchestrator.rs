//! The tick: one bounded pass over every non-terminal scan job.

use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{
    ai_pass::run_ai_pass, discovery::run_discovery, regex_pass::run_regex_pass, PhaseReport,
    ScanDeps, TimeBudget,
};
use crate::error::{Result, ScanError};
use crate::types::job::{ScanJob, ScanStatus};

/// Summary of one orchestrator invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub phases: Vec<PhaseReport>,
    /// Jobs skipped because they are paused
    pub paused: Vec<Uuid>,
    /// Jobs moved to FAILED this tick
    pub failed: Vec<Uuid>,
    /// Jobs whose phase call hit a transient error, or whose failure could
    /// not be saved
    pub errored: Vec<Uuid>,
}

/// Dispatches at most one phase call per job per tick.
pub struct ScanOrchestrator {
    deps: ScanDeps,
}

impl ScanOrchestrator {
    pub fn new(deps: ScanDeps) -> Self {
        Self { deps }
    }

    /// Run one invocation.
    ///
    /// The job list is read once up front, so a job advanced by this tick is
    /// not dispatched again until the next one. The time budget is shared
    /// fairly between the jobs still waiting. A store error while recording
    /// one job's failure is logged and the remaining jobs still run.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport> {
        let jobs = self.deps.store.list_non_terminal_jobs().await?;
        let budget = TimeBudget::start(self.deps.config.time_budget);
        let mut report = TickReport::default();

        let runnable: Vec<&ScanJob> = jobs
            .iter()
            .filter(|job| {
                if job.status == ScanStatus::Paused {
                    report.paused.push(job.id);
                    false
                } else {
                    true
                }
            })
            .collect();

        for (idx, job) in runnable.iter().enumerate() {
            let job_budget = budget.share(runnable.len() - idx);

            match self.run_job(job, &job_budget).await {
                Ok(phase) => report.phases.push(phase),
                Err(e) if e.is_terminal() => {
                    error!(job_id = %job.id, error = %e, "scan job failed");
                    match self.deps.store.fail_job(job.id, &e.truncated()).await {
                        Ok(_) => report.failed.push(job.id),
                        Err(store_err) => {
                            error!(job_id = %job.id, error = %store_err, "failed to mark scan job failed");
                            report.errored.push(job.id);
                        }
                    }
                }
                Err(e) => {
                    warn!(job_id = %job.id, phase = %job.status, error = %e, "scan phase error");
                    if let Err(store_err) = self
                        .deps
                        .store
                        .record_job_error(job.id, &e.truncated())
                        .await
                    {
                        error!(job_id = %job.id, error = %store_err, "failed to record scan job error");
                    }
                    report.errored.push(job.id);
                }
            }
        }

        info!(
            dispatched = report.phases.len(),
            paused = report.paused.len(),
            failed = report.failed.len(),
            errored = report.errored.len(),
            elapsed_ms = budget.elapsed().as_millis() as u64,
            "tick finished"
        );
        Ok(report)
    }

    /// Run exactly one phase call for a job.
    pub async fn run_job(&self, job: &ScanJob, budget: &TimeBudget) -> Result<PhaseReport> {
        if !job.status.is_runnable() {
            return Ok(PhaseReport::new(job));
        }

        let mailbox = self
            .deps
            .store
            .get_mailbox(job.mailbox_id)
            .await?
            .ok_or(ScanError::MailboxNotFound(job.mailbox_id))?;
        let client = self.deps.connector.connect(&mailbox)?;

        match job.status {
            ScanStatus::Discovering => run_discovery(&self.deps, client.as_ref(), job, budget).await,
            ScanStatus::Processing => run_regex_pass(&self.deps, client.as_ref(), job, budget).await,
            ScanStatus::AiPass => run_ai_pass(&self.deps, client.as_ref(), job, budget).await,
            _ => Ok(PhaseReport::new(job)),
        }
    }
}
