//! Caller-facing operations: start, status, pause, resume.

use tracing::info;
use uuid::Uuid;

use super::ScanDeps;
use crate::error::{Result, ScanError};
use crate::types::job::{ScanJob, ScanProgress, ScanStatus};
use crate::types::queue::QueueCounts;

/// How many times pause retries when the job changes phase underneath it.
const PAUSE_ATTEMPTS: usize = 3;

pub struct ScanControl {
    deps: ScanDeps,
}

impl ScanControl {
    pub fn new(deps: ScanDeps) -> Self {
        Self { deps }
    }

    /// Create a DISCOVERING job for a mailbox.
    ///
    /// Rejected with `ActiveScanExists` while another job for the mailbox is
    /// non-terminal. A FAILED or COMPLETED job does not block a fresh start.
    pub async fn start(&self, mailbox_id: Uuid) -> Result<Uuid> {
        let store = &self.deps.store;
        let mailbox = store
            .get_mailbox(mailbox_id)
            .await?
            .ok_or(ScanError::MailboxNotFound(mailbox_id))?;

        if let Some(active) = store.find_active_job(mailbox_id).await? {
            return Err(ScanError::ActiveScanExists { job_id: active.id });
        }

        let job = ScanJob::for_mailbox(
            mailbox.account_id,
            mailbox_id,
            self.deps.config.discovery_query.clone(),
        );
        let job = store.create_job(&job).await?;

        info!(job_id = %job.id, mailbox_id = %mailbox_id, "scan started");
        Ok(job.id)
    }

    /// Progress of the account's most recent scan, read from durable counters.
    pub async fn status(&self, account_id: Uuid) -> Result<Option<ScanProgress>> {
        Ok(self
            .deps
            .store
            .latest_job_for_account(account_id)
            .await?
            .map(|job| job.progress()))
    }

    /// Stop future dispatch. An in-flight batch finishes and checkpoints.
    pub async fn pause(&self, job_id: Uuid) -> Result<ScanJob> {
        let store = &self.deps.store;

        for _ in 0..PAUSE_ATTEMPTS {
            let job = self.load(job_id).await?;
            if job.status == ScanStatus::Paused {
                return Ok(job);
            }
            if job.status.is_terminal() {
                return Err(ScanError::InvalidTransition {
                    job_id,
                    reason: format!("cannot pause a {} scan", job.status),
                });
            }
            if store
                .transition(job_id, job.status, ScanStatus::Paused)
                .await?
            {
                info!(job_id = %job_id, from = %job.status, "scan paused");
                return self.load(job_id).await;
            }
        }

        Err(ScanError::InvalidTransition {
            job_id,
            reason: "job kept changing phase while pausing".to_string(),
        })
    }

    /// Leave PAUSED for the phase derived from the queue.
    pub async fn resume(&self, job_id: Uuid) -> Result<ScanStatus> {
        let store = &self.deps.store;
        let job = self.load(job_id).await?;
        if job.status != ScanStatus::Paused {
            return Err(ScanError::InvalidTransition {
                job_id,
                reason: format!("cannot resume a {} scan", job.status),
            });
        }

        let counts = store.queue_counts(job_id).await?;
        let target = resume_status(&job, &counts);
        if !store
            .transition(job_id, ScanStatus::Paused, target)
            .await?
        {
            return Err(ScanError::InvalidTransition {
                job_id,
                reason: "job left PAUSED while resuming".to_string(),
            });
        }

        info!(job_id = %job_id, to = %target, pending = counts.pending, "scan resumed");
        Ok(target)
    }

    async fn load(&self, job_id: Uuid) -> Result<ScanJob> {
        self.deps
            .store
            .get_job(job_id)
            .await?
            .ok_or(ScanError::JobNotFound(job_id))
    }
}

/// Phase a paused job resumes into.
///
/// Pending or in-flight regex work wins, then AI work. With an empty queue
/// the job goes back to DISCOVERING unless discovery already ran to the end,
/// which covers a pause before the first page was saved.
pub fn resume_status(job: &ScanJob, counts: &QueueCounts) -> ScanStatus {
    if counts.pending > 0 || counts.processing > 0 {
        ScanStatus::Processing
    } else if counts.regex_done_needing_ai > 0 || counts.ai_processing > 0 {
        ScanStatus::AiPass
    } else if job.page_token.is_some() || !job.discovery_finished() {
        ScanStatus::Discovering
    } else {
        ScanStatus::Processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job() -> ScanJob {
        ScanJob::for_mailbox(Uuid::new_v4(), Uuid::new_v4(), "q")
    }

    #[test]
    fn test_resume_prefers_pending_work() {
        let counts = QueueCounts {
            total: 10,
            pending: 4,
            regex_done_needing_ai: 2,
            ..Default::default()
        };
        assert_eq!(resume_status(&job(), &counts), ScanStatus::Processing);
    }

    #[test]
    fn test_resume_into_ai_pass() {
        let counts = QueueCounts {
            total: 10,
            regex_done_needing_ai: 2,
            ..Default::default()
        };
        assert_eq!(resume_status(&job(), &counts), ScanStatus::AiPass);
    }

    #[test]
    fn test_resume_before_first_page_goes_back_to_discovery() {
        let fresh = job();
        assert!(fresh.page_token.is_none());
        assert_eq!(
            resume_status(&fresh, &QueueCounts::default()),
            ScanStatus::Discovering
        );
    }

    #[test]
    fn test_resume_mid_pagination() {
        let mut paged = job();
        paged.page_token = Some("page-2".into());
        let counts = QueueCounts {
            total: 500,
            ..Default::default()
        };
        assert_eq!(resume_status(&paged, &counts), ScanStatus::Discovering);
    }

    #[test]
    fn test_resume_after_everything_drained() {
        let mut done = job();
        done.discovery_completed_at = Some(Utc::now());
        let counts = QueueCounts {
            total: 12,
            ..Default::default()
        };
        assert_eq!(resume_status(&done, &counts), ScanStatus::Processing);
    }
}
