use std::fs::{File, OpenOptions};
use std::path::Path;

use log::debug;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::errors::{QueueError, Result};
use crate::store::StoreOptions;

/// Exclusive advisory lock on the store's sidecar lock file.
///
/// Released when dropped. Every open of the lock file is its own open file
/// description, so two tasks in one process contend exactly like two processes.
pub struct StoreLock {
    _flock: Flock<File>,
}

impl StoreLock {
    /// Acquire the lock, retrying with capped exponential waits
    pub async fn acquire(lock_path: &Path, options: &StoreOptions) -> Result<Self> {
        let mut wait = options.lock_min_wait;

        for attempt in 0..=options.lock_retries {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(lock_path)?;

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => return Ok(StoreLock { _flock: flock }),
                Err((_, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EINTR => {}
                Err((_, errno)) => return Err(QueueError::IoError(errno.into())),
            }

            if attempt == options.lock_retries {
                break;
            }

            debug!(
                "Store lock {} busy, retry {}/{} in {:?}",
                lock_path.display(),
                attempt + 1,
                options.lock_retries,
                wait
            );
            tokio::time::sleep(wait).await;
            wait = wait.mul_f64(options.lock_factor).min(options.lock_max_wait);
        }

        Err(QueueError::LockTimeout(lock_path.display().to_string()))
    }
}
