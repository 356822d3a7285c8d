use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::errors::{QueueError, Result};
use crate::job::{Job, JobInput, JobState, DEFAULT_MAX_RETRIES};
use crate::process::DEFAULT_TIMEOUT_MS;
use crate::store::{Store, StoreOptions, DEFAULT_TIMEOUT_KEY, MAX_RETRIES_KEY};
use crate::utils::now_secs;

/// Slack on top of a job's execution timeout before its claim counts as stale
pub const RECOVERY_GRACE_SECS: i64 = 10;

/// Number of jobs in each state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    fn bump(&mut self, state: JobState) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Dead => &mut self.dead,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        JobState::ALL.iter().map(|state| self.get(*state)).sum()
    }
}

/// Job repository over a shared store.
///
/// Every method is a single store transaction.
#[derive(Debug, Clone)]
pub struct Queue {
    store: Store,
}

impl Queue {
    pub fn new(store: Store) -> Self {
        Queue { store }
    }

    /// Queue over the document described by `options`
    pub fn open(options: StoreOptions) -> Self {
        Queue::new(Store::new(options))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Add a job to the queue, returning its id
    pub async fn enqueue(&self, input: JobInput) -> Result<String> {
        // Validate before touching the store
        if input.command.as_deref().map_or(true, |command| command.trim().is_empty()) {
            return Err(QueueError::InvalidJob("Missing job.command".to_string()));
        }

        let job = self
            .store
            .transaction(|doc| {
                let default_max_retries = doc.config_number(MAX_RETRIES_KEY, DEFAULT_MAX_RETRIES);
                let job = Job::new(input, default_max_retries, now_secs()?)?;

                if doc.find_job(&job.id).is_some() {
                    return Err(QueueError::InvalidJob(format!("Duplicate job id: {}", job.id)));
                }

                doc.jobs.push(job.clone());
                Ok(job)
            })
            .await?;

        info!(
            "Enqueued job {} (priority {}, run_at {}, max_retries {})",
            job.id, job.priority, job.run_at, job.max_retries
        );
        Ok(job.id)
    }

    /// Jobs, optionally restricted to one state, newest first
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.store
            .transaction(|doc| {
                let mut jobs: Vec<Job> = doc
                    .jobs
                    .iter()
                    .filter(|job| state.map_or(true, |state| job.state == state))
                    .cloned()
                    .collect();
                jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(jobs)
            })
            .await
    }

    /// Get a job by ID
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.store.transaction(|doc| Ok(doc.find_job(id).cloned())).await
    }

    /// Dead jobs, most recently updated first
    pub async fn list_dlq(&self) -> Result<Vec<Job>> {
        self.store
            .transaction(|doc| {
                let mut jobs: Vec<Job> = doc
                    .jobs
                    .iter()
                    .filter(|job| job.state == JobState::Dead)
                    .cloned()
                    .collect();
                jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                Ok(jobs)
            })
            .await
    }

    /// Move a dead job back to pending with its attempts reset
    pub async fn retry_dlq(&self, id: &str) -> Result<()> {
        self.store
            .transaction(|doc| {
                let now = now_secs()?;
                let job = doc
                    .find_job_mut(id)
                    .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
                job.reset_from_dlq(now)?;
                doc.log(id, "info", "re-enqueued from DLQ", now);
                Ok(())
            })
            .await?;

        info!("Re-enqueued job {} from DLQ", id);
        Ok(())
    }

    /// Per-state job counts
    pub async fn job_counts(&self) -> Result<JobCounts> {
        self.store
            .transaction(|doc| {
                let mut counts = JobCounts::default();
                for job in &doc.jobs {
                    counts.bump(job.state);
                }
                Ok(counts)
            })
            .await
    }

    /// Return `processing` jobs claimed more than `older_than` ago to `pending`.
    ///
    /// A claim also has to outlive the job's execution timeout plus
    /// [`RECOVERY_GRACE_SECS`], so a job that may still be running is left alone.
    /// Workers never call this: a job stranded by a crashed worker stays in
    /// `processing` until an operator runs it. Returns the released ids.
    pub async fn recover_stale(&self, older_than: Duration) -> Result<Vec<String>> {
        let threshold = i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX);

        let released = self
            .store
            .transaction(|doc| {
                let now = now_secs()?;
                let default_timeout = doc.config_number(DEFAULT_TIMEOUT_KEY, DEFAULT_TIMEOUT_MS);
                let mut released = Vec::new();

                for job in doc.jobs.iter_mut() {
                    if job.state != JobState::Processing {
                        continue;
                    }

                    let timeout_ms = job.timeout_ms.unwrap_or(default_timeout);
                    let min_age = i64::try_from(timeout_ms.div_ceil(1000))
                        .unwrap_or(i64::MAX)
                        .saturating_add(RECOVERY_GRACE_SECS)
                        .max(threshold);
                    let stale = job
                        .claimed_at
                        .map_or(true, |claimed| now.saturating_sub(claimed) >= min_age);

                    if stale {
                        job.release_stale(now)?;
                        released.push(job.id.clone());
                    }
                }

                for id in &released {
                    doc.log(id, "warn", "recovered stale processing claim", now);
                }
                Ok(released)
            })
            .await?;

        if !released.is_empty() {
            warn!("Recovered {} stale job(s): {}", released.len(), released.join(", "));
        }
        Ok(released)
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        self.store
            .transaction(|doc| Ok(doc.config_value(key).map(str::to_string)))
            .await
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(QueueError::InvalidArgument("Config key must not be empty".to_string()));
        }

        self.store
            .transaction(|doc| {
                doc.config.insert(key.to_string(), value.to_string());
                Ok(())
            })
            .await
    }

    /// All config entries ordered by key
    pub async fn list_config(&self) -> Result<Vec<(String, String)>> {
        self.store
            .transaction(|doc| Ok(doc.config.clone().into_iter().collect()))
            .await
    }
}
