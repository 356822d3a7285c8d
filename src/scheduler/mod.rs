use std::cmp::Ordering;

use log::debug;

use crate::errors::Result;
use crate::job::Job;
use crate::store::Store;
use crate::utils::now_secs;

/// Claim order: higher priority first, then earlier `run_at`, then earlier `created_at`
pub fn claim_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.run_at.cmp(&b.run_at))
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Index of the best eligible job at `now`, if any.
///
/// Ties on every key go to the job stored first.
pub fn select_candidate(jobs: &[Job], now: i64) -> Option<usize> {
    jobs.iter()
        .enumerate()
        .filter(|(_, job)| job.is_eligible(now))
        .min_by(|(ia, a), (ib, b)| claim_order(a, b).then_with(|| ia.cmp(ib)))
        .map(|(index, _)| index)
}

/// Atomically pick the next eligible job and mark it `processing` for `worker_id`.
///
/// Selection and the state change happen inside one store transaction, so two
/// workers can never walk away with the same job.
pub async fn claim_next(store: &Store, worker_id: &str) -> Result<Option<Job>> {
    let claimed = store
        .transaction(|doc| {
            let now = now_secs()?;
            let Some(index) = select_candidate(&doc.jobs, now) else {
                return Ok(None);
            };

            let job = &mut doc.jobs[index];
            job.mark_as_claimed(worker_id, now)?;
            Ok(Some(job.clone()))
        })
        .await?;

    if let Some(job) = &claimed {
        debug!("Worker {} claimed job {} (priority {})", worker_id, job.id, job.priority);
    }
    Ok(claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobInput, JobState, RunAt};
    use crate::queue::Queue;
    use crate::store::StoreOptions;
    use std::collections::HashSet;
    use std::path::Path;
    use tempfile::tempdir;

    fn job(id: &str, priority: i64, run_at: i64, created_at: i64) -> Job {
        let input = JobInput::new("true")
            .with_id(id)
            .with_priority(priority)
            .with_run_at(RunAt::Seconds(run_at));
        Job::new(input, 3, created_at).unwrap()
    }

    fn test_queue(dir: &Path) -> Queue {
        Queue::open(StoreOptions::new(dir.join("store.json")))
    }

    #[test]
    fn test_priority_wins() {
        let jobs = vec![job("b", 1, 10, 1), job("a", 5, 10, 2)];
        assert_eq!(select_candidate(&jobs, 10), Some(1));
    }

    #[test]
    fn test_earlier_run_at_breaks_priority_tie() {
        let jobs = vec![job("late", 3, 9, 1), job("early", 3, 5, 2)];
        assert_eq!(select_candidate(&jobs, 10), Some(1));
    }

    #[test]
    fn test_earlier_created_at_breaks_run_at_tie() {
        let jobs = vec![job("newer", 3, 5, 8), job("older", 3, 5, 4)];
        assert_eq!(select_candidate(&jobs, 10), Some(1));
    }

    #[test]
    fn test_full_tie_goes_to_first_stored() {
        let jobs = vec![job("first", 0, 5, 5), job("second", 0, 5, 5)];
        assert_eq!(select_candidate(&jobs, 10), Some(0));
    }

    #[test]
    fn test_ineligible_jobs_are_skipped() {
        let mut busy = job("busy", 9, 0, 0);
        busy.state = JobState::Processing;
        let future = job("future", 9, 100, 0);
        let mut dead = job("dead", 9, 0, 0);
        dead.state = JobState::Dead;

        assert_eq!(select_candidate(&[busy.clone(), future.clone(), dead.clone()], 10), None);

        let jobs = vec![busy, future, dead, job("ready", -5, 10, 0)];
        assert_eq!(select_candidate(&jobs, 10), Some(3));
    }

    #[tokio::test]
    async fn test_claim_marks_processing() {
        let temp_dir = tempdir().unwrap();
        let queue = test_queue(temp_dir.path());
        let id = queue.enqueue(JobInput::new("true")).await.unwrap();

        let claimed = claim_next(queue.store(), "worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, JobState::Processing);
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-1"));
        assert!(claimed.claimed_at.is_some());

        let stored = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored, claimed);

        // Nothing left to claim
        assert!(claim_next(queue.store(), "worker-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_priority_in_store() {
        let temp_dir = tempdir().unwrap();
        let queue = test_queue(temp_dir.path());
        let low = JobInput::new("true").with_priority(1).with_run_at(RunAt::Seconds(0));
        let high = JobInput::new("true").with_priority(5).with_run_at(RunAt::Seconds(0));
        let low = queue.enqueue(low).await.unwrap();
        let high = queue.enqueue(high).await.unwrap();

        assert_eq!(claim_next(queue.store(), "w").await.unwrap().unwrap().id, high);
        assert_eq!(claim_next(queue.store(), "w").await.unwrap().unwrap().id, low);
    }

    #[tokio::test]
    async fn test_future_job_not_claimed() {
        let temp_dir = tempdir().unwrap();
        let queue = test_queue(temp_dir.path());
        queue
            .enqueue(JobInput::new("true").with_run_at(RunAt::Seconds(now_secs().unwrap() + 3600)))
            .await
            .unwrap();

        assert!(claim_next(queue.store(), "w").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let temp_dir = tempdir().unwrap();
        let queue = test_queue(temp_dir.path());

        let mut expected = HashSet::new();
        for _ in 0..20 {
            expected.insert(queue.enqueue(JobInput::new("true")).await.unwrap());
        }

        let mut handles = Vec::new();
        for worker in 0..6 {
            let store = queue.store().clone();
            handles.push(tokio::spawn(async move {
                let worker_id = format!("worker-{}", worker);
                let mut claimed = Vec::new();
                while let Some(job) = claim_next(&store, &worker_id).await.unwrap() {
                    assert_eq!(job.claimed_by.as_deref(), Some(worker_id.as_str()));
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job claimed twice");
            }
        }
        assert_eq!(seen, expected);

        let counts = queue.job_counts().await.unwrap();
        assert_eq!(counts.processing, 20);
        assert_eq!(counts.pending, 0);
    }
}
