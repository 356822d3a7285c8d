pub mod errors;
pub mod utils;
pub mod store;

// Core modules
pub mod job;
pub mod queue;
pub mod scheduler;
pub mod backoff;
pub mod process;
pub mod executor;
pub mod worker;

// Re-export main components for easier access
pub use errors::{QueueError, Result};
pub use job::{Job, JobInput, JobState, RunAt};
pub use queue::{JobCounts, Queue};
pub use store::{Store, StoreDocument, StoreOptions};
pub use executor::Executor;
pub use worker::{StopHandle, WorkerOptions, WorkerPool};
pub use backoff::BackoffOptions;
