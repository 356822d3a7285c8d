use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info};
use tokio::sync::watch;
use tokio::time;

use crate::errors::{QueueError, Result};
use crate::executor::Executor;
use crate::queue::Queue;
use crate::scheduler::claim_next;
use crate::store::Store;
use crate::utils::worker_identity;

/// Worker pool configuration options
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Number of concurrent poll/claim/execute loops (default: 1)
    pub count: usize,
    /// Sleep between polls when nothing is claimable (default: 500ms)
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            count: 1,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Flips a pool's running flag off.
///
/// Loops notice between jobs; a job already executing always finishes first.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.send_replace(false);
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }
}

/// N independent workers sharing one store
pub struct WorkerPool {
    store: Store,
    executor: Executor,
    options: WorkerOptions,
    worker_id: String,
    running: Arc<watch::Sender<bool>>,
}

impl WorkerPool {
    pub fn new(queue: &Queue, options: WorkerOptions) -> Self {
        let (running, _) = watch::channel(true);

        WorkerPool {
            store: queue.store().clone(),
            executor: Executor::new(queue.store().clone()),
            options,
            worker_id: worker_identity(),
            running: Arc::new(running),
        }
    }

    /// Override the identity written to `claimed_by`
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Run every loop until stopped, returning how many jobs were executed.
    ///
    /// A pool that has been stopped stays stopped.
    pub async fn run(&self) -> Result<usize> {
        if self.options.count == 0 {
            return Err(QueueError::InvalidArgument("Worker count must be at least 1".to_string()));
        }

        info!(
            "Starting {} worker loop(s) as {} against {}",
            self.options.count,
            self.worker_id,
            self.store.path().display()
        );

        let handles: Vec<_> = (0..self.options.count)
            .map(|index| {
                let worker = WorkerLoop {
                    index,
                    worker_id: self.worker_id.clone(),
                    store: self.store.clone(),
                    executor: self.executor.clone(),
                    poll_interval: self.options.poll_interval,
                    running: self.running.subscribe(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let mut processed = 0;
        for joined in join_all(handles).await {
            match joined {
                Ok(count) => processed += count,
                Err(e) => error!("Worker loop panicked: {}", e),
            }
        }

        info!("Workers stopped after {} job(s)", processed);
        Ok(processed)
    }
}

struct WorkerLoop {
    index: usize,
    worker_id: String,
    store: Store,
    executor: Executor,
    poll_interval: Duration,
    running: watch::Receiver<bool>,
}

impl WorkerLoop {
    async fn run(mut self) -> usize {
        let mut processed = 0;

        while self.is_running() {
            match claim_next(&self.store, &self.worker_id).await {
                Ok(Some(job)) => {
                    match self.executor.execute(&job).await {
                        Ok(state) => debug!("Loop {} finished job {} as {}", self.index, job.id, state),
                        Err(QueueError::LostClaim(_)) => debug!("Loop {} lost its claim on job {}", self.index, job.id),
                        Err(e) => error!("Loop {} could not record job {}: {}", self.index, job.id, e),
                    }
                    processed += 1;
                }
                Ok(None) => self.idle().await,
                Err(e) => {
                    error!("Loop {} failed to claim a job: {}", self.index, e);
                    self.idle().await;
                }
            }
        }

        debug!("Loop {} exiting", self.index);
        processed
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Sleep one poll interval, waking early if the running flag changes
    async fn idle(&mut self) {
        tokio::select! {
            _ = time::sleep(self.poll_interval) => {}
            changed = self.running.changed() => {
                if changed.is_err() {
                    time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}
