use std::time::Duration;

use log::{info, warn};

use crate::backoff::{calculate_backoff, BackoffOptions};
use crate::errors::{QueueError, Result};
use crate::job::{Job, JobState};
use crate::process::{run_command, ProcessResult, DEFAULT_TIMEOUT_MS};
use crate::store::{Store, StoreDocument, DEFAULT_TIMEOUT_KEY};
use crate::utils::{now_secs, truncate};

/// Most command output kept in a log entry
const MAX_LOG_OUTPUT: usize = 4096;

/// Runs claimed jobs and writes their outcome back to the store
#[derive(Debug, Clone)]
pub struct Executor {
    store: Store,
}

impl Executor {
    pub fn new(store: Store) -> Self {
        Executor { store }
    }

    /// Execute a claimed job to completion and record the result.
    ///
    /// Two transactions: one marking the start, one recording the outcome. The
    /// command runs between them without the lock held, so a crash in between
    /// leaves the job in `processing`.
    ///
    /// Command failures never surface as errors; only store failures do.
    pub async fn execute(&self, job: &Job) -> Result<JobState> {
        let timeout_ms = self.mark_started(job).await?;

        info!("Running job {}: {}", job.id, job.command);
        let result = run_command(&job.command, Duration::from_millis(timeout_ms)).await;

        self.record_outcome(job, &result).await
    }

    /// Stamp `started_at` and resolve the timeout to use
    async fn mark_started(&self, job: &Job) -> Result<u64> {
        self.store
            .transaction(|doc| {
                let default_timeout = doc.config_number(DEFAULT_TIMEOUT_KEY, DEFAULT_TIMEOUT_MS);
                let stored = claimed_job(doc, job)?;

                stored.mark_as_started(now_secs()?);
                Ok(stored.timeout_ms.unwrap_or(default_timeout))
            })
            .await
    }

    async fn record_outcome(&self, job: &Job, result: &ProcessResult) -> Result<JobState> {
        let state = self
            .store
            .transaction(|doc| {
                let now = now_secs()?;
                let backoff = BackoffOptions::from_document(doc);
                let stored = claimed_job(doc, job)?;

                if result.success() {
                    stored.mark_as_completed(now)?;
                    let message = format!("completed: {}", truncate(result.stdout.trim_end(), MAX_LOG_OUTPUT));
                    doc.log(&job.id, "info", message, now);
                    return Ok(JobState::Completed);
                }

                let error = result.failure_message();
                let delay = calculate_backoff(&backoff, stored.attempts + 1);
                let state = stored.mark_as_failed(error.clone(), delay, now)?;
                let attempts = stored.attempts;

                doc.log(&job.id, "error", truncate(&error, MAX_LOG_OUTPUT), now);
                match state {
                    JobState::Dead => warn!(
                        "Job {} moved to DLQ after {} attempt(s): {}",
                        job.id, attempts, error
                    ),
                    _ => warn!(
                        "Job {} failed (attempt {}), retrying in {}s: {}",
                        job.id, attempts, delay, error
                    ),
                }
                Ok(state)
            })
            .await?;

        if state == JobState::Completed {
            info!("Job {} completed in {:?}", job.id, result.elapsed);
        }
        Ok(state)
    }
}

/// The stored copy of `claim`, as long as that claim still holds it.
///
/// A claim released by stale recovery and taken by another worker must not be
/// written through.
fn claimed_job<'a>(doc: &'a mut StoreDocument, claim: &Job) -> Result<&'a mut Job> {
    let stored = doc
        .find_job_mut(&claim.id)
        .ok_or_else(|| QueueError::NotFound(claim.id.clone()))?;

    if !stored.holds_claim(claim) {
        warn!(
            "Job {} is no longer held by {} (now {} by {}), dropping result",
            claim.id,
            claim.claimed_by.as_deref().unwrap_or("unknown"),
            stored.state,
            stored.claimed_by.as_deref().unwrap_or("nobody")
        );
        return Err(QueueError::LostClaim(claim.id.clone()));
    }
    Ok(stored)
}
