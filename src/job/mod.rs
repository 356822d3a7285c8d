use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{QueueError, Result};
use crate::utils::parse_timestamp;

/// Default retry ceiling when neither the input nor the store config provides one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Job state enumeration
///
/// `Failed` exists only as a label: no transition ever lands in it, a failed
/// attempt goes straight back to `Pending` or on to `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// The job lifecycle table. Anything not listed here is rejected.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Dead)
                | (Dead, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| QueueError::InvalidArgument(format!("Unknown job state: {}", s)))
    }
}

/// When a job becomes eligible: epoch seconds or a date/time string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunAt {
    Seconds(i64),
    /// Non-integer epoch seconds, floored
    Fractional(f64),
    Text(String),
}

impl RunAt {
    /// Converts to epoch seconds
    pub fn to_epoch_secs(&self) -> Result<i64> {
        match self {
            RunAt::Seconds(secs) => Ok(*secs),
            RunAt::Fractional(secs) if secs.is_finite() => Ok(secs.floor() as i64),
            RunAt::Fractional(secs) => Err(QueueError::InvalidJob(format!("Unusable run_at: {}", secs))),
            RunAt::Text(text) => parse_timestamp(text)
                .ok_or_else(|| QueueError::InvalidJob(format!("Unparseable run_at: {}", text))),
        }
    }
}

/// Submitted job description, as accepted by `enqueue`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobInput {
    /// Optional job ID to use
    #[serde(default)]
    pub id: Option<String>,
    /// Shell command to run
    #[serde(default)]
    pub command: Option<String>,
    /// Optional retry ceiling
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Optional priority, higher claims first
    #[serde(default)]
    pub priority: Option<i64>,
    /// Optional earliest run time
    #[serde(default)]
    pub run_at: Option<RunAt>,
    /// Optional execution timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl JobInput {
    pub fn new(command: impl Into<String>) -> Self {
        JobInput {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_run_at(mut self, run_at: RunAt) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Job structure representing one unit of queued work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: String,
    /// Shell command to run
    pub command: String,
    /// Current state of the job
    pub state: JobState,
    /// Number of failed attempts so far
    pub attempts: u32,
    /// Attempts allowed before the job is dead-lettered
    pub max_retries: u32,
    /// Higher priority claims first
    pub priority: i64,
    /// Not claimable before this time, epoch seconds
    pub run_at: i64,
    /// Execution timeout override in milliseconds
    pub timeout_ms: Option<u64>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Message from the most recent failed attempt
    pub last_error: Option<String>,
    /// Worker currently holding the job
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl Job {
    /// Build a pending job from submitted input
    pub fn new(input: JobInput, default_max_retries: u32, now: i64) -> Result<Self> {
        let command = match input.command {
            Some(command) if !command.trim().is_empty() => command,
            _ => return Err(QueueError::InvalidJob("Missing job.command".to_string())),
        };

        let id = match input.id {
            Some(id) if id.trim().is_empty() => {
                return Err(QueueError::InvalidJob("Job id must not be empty".to_string()))
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let run_at = match &input.run_at {
            Some(run_at) => run_at.to_epoch_secs()?,
            None => now,
        };

        Ok(Job {
            id,
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: input.max_retries.unwrap_or(default_max_retries),
            priority: input.priority.unwrap_or(0),
            run_at,
            timeout_ms: input.timeout_ms,
            created_at: now,
            updated_at: now,
            last_error: None,
            claimed_by: None,
            claimed_at: None,
            started_at: None,
            finished_at: None,
        })
    }

    /// Move to `next`, rejecting anything outside the lifecycle table
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                id: self.id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Pending and due
    pub fn is_eligible(&self, now: i64) -> bool {
        self.state == JobState::Pending && self.run_at <= now
    }

    /// Mark the job as claimed by a worker
    pub fn mark_as_claimed(&mut self, worker_id: &str, now: i64) -> Result<()> {
        self.transition(JobState::Processing)?;
        self.claimed_by = Some(worker_id.to_string());
        self.claimed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Still `processing` under the same claim as `claim`
    pub fn holds_claim(&self, claim: &Job) -> bool {
        self.state == JobState::Processing
            && self.claimed_by == claim.claimed_by
            && self.claimed_at == claim.claimed_at
    }

    pub fn mark_as_started(&mut self, now: i64) {
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Mark the job as completed
    pub fn mark_as_completed(&mut self, now: i64) -> Result<()> {
        self.transition(JobState::Completed)?;
        self.last_error = None;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Returns the state the job landed in: `Pending` with `run_at` pushed out by
    /// `delay_secs`, or `Dead` once `attempts` reaches `max_retries`.
    pub fn mark_as_failed(&mut self, error: String, delay_secs: u64, now: i64) -> Result<JobState> {
        let attempts = self.attempts + 1;
        let next = if attempts >= self.max_retries {
            JobState::Dead
        } else {
            JobState::Pending
        };

        self.transition(next)?;
        self.attempts = attempts;
        self.run_at = now + delay_secs as i64;
        self.last_error = Some(error);
        if next == JobState::Dead {
            self.finished_at = Some(now);
        }
        self.updated_at = now;
        Ok(next)
    }

    /// Put a dead job back in the queue with a clean slate
    pub fn reset_from_dlq(&mut self, now: i64) -> Result<()> {
        if self.state != JobState::Dead {
            return Err(QueueError::NotInDlq(self.id.clone()));
        }
        self.transition(JobState::Pending)?;
        self.attempts = 0;
        self.last_error = None;
        self.clear_claim();
        self.started_at = None;
        self.finished_at = None;
        self.run_at = now;
        self.updated_at = now;
        Ok(())
    }

    /// Release a stranded `processing` job without counting an attempt
    pub fn release_stale(&mut self, now: i64) -> Result<()> {
        let note = format!(
            "recovered stale claim held by {} since {}",
            self.claimed_by.as_deref().unwrap_or("unknown"),
            self.claimed_at.unwrap_or_default()
        );
        self.transition(JobState::Pending)?;
        self.clear_claim();
        self.started_at = None;
        self.last_error = Some(note);
        self.run_at = now;
        self.updated_at = now;
        Ok(())
    }

    fn clear_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_at = None;
    }
}
