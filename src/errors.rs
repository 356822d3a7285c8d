use thiserror::Error;

/// Custom error types for queuectl
#[derive(Error, Debug)]
pub enum QueueError {
    /// Job rejected before it reached the store
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// No job with the given id
    #[error("Job not found: {0}")]
    NotFound(String),

    /// DLQ retry on a job that is not dead
    #[error("Job is not in DLQ: {0}")]
    NotInDlq(String),

    /// The store lock could not be acquired within the retry budget
    #[error("Timed out acquiring store lock: {0}")]
    LockTimeout(String),

    /// A state change outside the job lifecycle table
    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    /// The job is no longer held by the claim a worker is acting on
    #[error("Lost claim on job: {0}")]
    LostClaim(String),

    /// Error related to IO operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error related to serialization or deserialization
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Error when an invalid argument is provided
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Error related to system time operations
    #[error("System time error: {0}")]
    SystemTimeError(String),
}

/// Result type for queuectl operations
pub type Result<T> = std::result::Result<T, QueueError>;
