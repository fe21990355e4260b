//! Worker loop: claims pending jobs and drives them through compile, run
//! and grade, one bounded batch at a time.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::core::job::JobEntry;
use crate::engine::executer::failed_completion;
use crate::engine::Executor;
use crate::error::ExecError;
use crate::jobs::grader::GradingEngine;
use crate::storage::JobStore;

#[derive(Clone)]
pub struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    executor: Executor,
    grader: GradingEngine,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        executor: Executor,
        grader: GradingEngine,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            jobs,
            executor,
            grader,
            config,
        }
    }

    /// Poll forever. Store errors are logged and retried after the poll interval.
    pub async fn run(&self) {
        info!(
            batch_width = self.config.batch_width,
            poll_interval_ms = self.config.poll_interval_ms,
            "Dispatcher started, waiting for jobs..."
        );

        loop {
            match self.poll_once().await {
                Ok(0) => {
                    if let Err(e) = self.jobs.sweep_pending().await {
                        warn!("Failed to sweep pending index: {:#}", e);
                    }
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
                Ok(n) => debug!("Batch of {} jobs finished", n),
                Err(e) => {
                    error!("Failed to poll for jobs: {:#}", e);
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }
    }

    /// Fetch one batch, process it concurrently and wait for all of it.
    ///
    /// Returns the number of jobs fetched.
    pub async fn poll_once(&self) -> Result<usize> {
        let batch = self.jobs.fetch_pending(self.config.batch_width).await?;
        let count = batch.len();

        let handles: Vec<_> = batch
            .into_iter()
            .map(|job| {
                let id = job.id.clone();
                let this = self.clone();
                (id, tokio::spawn(async move { this.process(job).await }))
            })
            .collect();

        for (id, handle) in handles {
            if let Err(e) = handle.await {
                error!(job_id = %id, "Job task failed: {}", e);
                let err = ExecError::Internal(anyhow::anyhow!("Job task failed: {}", e));
                self.fail_unfinished(&id, err).await;
            }
        }

        Ok(count)
    }

    async fn process(&self, job: JobEntry) {
        match self.jobs.mark_running(&job.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, "Job already claimed, skipping");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, "Failed to claim job: {:#}", e);
                let err = ExecError::Internal(e.context("Failed to claim job"));
                self.fail_unfinished(&job.id, err).await;
                return;
            }
        }
        info!(job_id = %job.id, language = %job.language, "Processing job");

        let completion = match self.executor.execute(&job).await {
            Ok(completion) => completion,
            Err(e) => {
                error!(job_id = %job.id, "Job failed: {}", e.user_message());
                failed_completion(&e)
            }
        };
        let status = completion.status;

        let finished = match self.jobs.finish(&job.id, completion).await {
            Ok(Some(finished)) => finished,
            Ok(None) => return,
            Err(e) => {
                error!(job_id = %job.id, "Failed to store job result: {:#}", e);
                return;
            }
        };
        info!(job_id = %job.id, %status, "Job finished");

        self.grade(&finished).await;
    }

    async fn grade(&self, finished: &JobEntry) {
        if let Err(e) = self.grader.grade_job(finished).await {
            error!(job_id = %finished.id, "Grading failed: {:#}", e);
        }
    }

    /// Mark a job error and grade it, unless it already reached a terminal status
    async fn fail_unfinished(&self, id: &str, err: ExecError) {
        match self.jobs.get(id).await {
            Ok(Some(job)) if !job.status.is_terminal() => {
                match self.jobs.finish(id, failed_completion(&err)).await {
                    Ok(Some(finished)) => self.grade(&finished).await,
                    Ok(None) => {}
                    Err(e) => error!(job_id = %id, "Failed to store job error: {:#}", e),
                }
            }
            Ok(_) => {}
            Err(e) => error!(job_id = %id, "Failed to load job: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompileLimits, RunLimits};
    use crate::core::job::{JobCompletion, JobStatus, NewJob, Stdin};
    use crate::jobs::ledger::JobLedger;
    use crate::runner::sandboxed::tests::{Behavior, FakeSandbox};
    use crate::runner::SandboxedRunner;
    use crate::sandbox::SlotPool;
    use crate::storage::memory::MemoryStore;
    use crate::storage::TestCase;
    use std::time::Duration;

    fn echo(input: &str) -> String {
        input.to_string()
    }

    fn add(input: &str) -> String {
        input
            .split_whitespace()
            .map(|n| n.parse::<i64>().unwrap())
            .sum::<i64>()
            .to_string()
    }

    fn boom(_: &str) -> String {
        panic!("sandbox exploded")
    }

    struct Harness {
        store: Arc<MemoryStore>,
        pool: SlotPool,
        ledger: JobLedger,
        dispatcher: Dispatcher,
    }

    fn harness(behavior: Behavior, batch_width: usize) -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_on(store.clone(), store, behavior, batch_width)
    }

    /// Dispatcher reading jobs through `jobs`, with `store` behind everything else
    fn harness_on(
        jobs: Arc<dyn JobStore>,
        store: Arc<MemoryStore>,
        behavior: Behavior,
        batch_width: usize,
    ) -> Harness {
        let pool = SlotPool::new(1, Duration::from_secs(60));
        let runner = SandboxedRunner::new(Arc::new(FakeSandbox::new(behavior)), RunLimits::default());
        let executor = Executor::new(pool.clone(), runner, CompileLimits::default());
        let grader = GradingEngine::new(store.clone(), store.clone());
        let config = DispatcherConfig {
            batch_width,
            poll_interval_ms: 10,
        };

        Harness {
            ledger: JobLedger::new(store.clone()),
            dispatcher: Dispatcher::new(jobs, executor, grader, config),
            store,
            pool,
        }
    }

    /// Store whose claim write always fails
    struct BrokenClaims(Arc<MemoryStore>);

    #[async_trait::async_trait]
    impl JobStore for BrokenClaims {
        async fn create(&self, job: &JobEntry) -> Result<()> {
            self.0.create(job).await
        }

        async fn get(&self, id: &str) -> Result<Option<JobEntry>> {
            self.0.get(id).await
        }

        async fn fetch_pending(&self, limit: usize) -> Result<Vec<JobEntry>> {
            self.0.fetch_pending(limit).await
        }

        async fn mark_running(&self, _id: &str) -> Result<bool> {
            anyhow::bail!("connection reset while writing job")
        }

        async fn finish(&self, id: &str, completion: JobCompletion) -> Result<Option<JobEntry>> {
            self.0.finish(id, completion).await
        }

        async fn link_submission(&self, id: &str, submission_id: &str) -> Result<()> {
            self.0.link_submission(id, submission_id).await
        }

        async fn sweep_pending(&self) -> Result<usize> {
            self.0.sweep_pending().await
        }
    }

    fn sum_challenge(store: &MemoryStore) {
        store.set_test_cases(
            "sum",
            vec![
                TestCase {
                    input: "1 2".into(),
                    expected_output: "3".into(),
                },
                TestCase {
                    input: "4 4".into(),
                    expected_output: "8".into(),
                },
            ],
        );
    }

    fn challenge(stdin: Stdin) -> NewJob {
        NewJob {
            user_id: Some("alice".into()),
            challenge_id: Some("sum".into()),
            ..python(stdin)
        }
    }

    fn python(stdin: Stdin) -> NewJob {
        NewJob {
            language: "python".into(),
            source: "print(input())".into(),
            stdin,
            device_id: Some("dev-1".into()),
            ..NewJob::default()
        }
    }

    #[tokio::test]
    async fn test_batch_is_bounded_and_oldest_first() {
        let h = harness(Behavior::Map(echo), 2);
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(h.ledger.create(python(Stdin::Single(format!("job {}", i)))).await.unwrap());
        }

        assert_eq!(h.dispatcher.poll_once().await.unwrap(), 2);
        assert_eq!(h.store.job(&ids[0]).unwrap().status, JobStatus::Done);
        assert_eq!(h.store.job(&ids[1]).unwrap().status, JobStatus::Done);
        assert_eq!(h.store.job(&ids[2]).unwrap().status, JobStatus::Pending);

        assert_eq!(h.dispatcher.poll_once().await.unwrap(), 1);
        let last = h.ledger.get(&ids[2]).await.unwrap().unwrap();
        assert_eq!(last.status, JobStatus::Done);
        assert_eq!(last.stdout, "job 2");

        assert_eq!(h.dispatcher.poll_once().await.unwrap(), 0);
        assert!(h.pool.held().is_empty());
    }

    #[tokio::test]
    async fn test_completion_event_published() {
        let h = harness(Behavior::Map(echo), 4);
        let id = h.ledger.create(python(Stdin::Single("x".into()))).await.unwrap();

        h.dispatcher.poll_once().await.unwrap();

        let events = h.store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job_id, id);
        assert_eq!(events[0].device_id.as_deref(), Some("dev-1"));
        assert_eq!(events[0].status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_panicking_job_marked_error_graded_and_loop_survives() {
        let h = harness(Behavior::Map(boom), 4);
        sum_challenge(&h.store);
        let id = h
            .ledger
            .create(challenge(Stdin::PerCase(vec!["1 2".into(), "4 4".into()])))
            .await
            .unwrap();

        assert_eq!(h.dispatcher.poll_once().await.unwrap(), 1);

        let job = h.store.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.stderr.contains("Job task failed"));
        assert!(h.pool.held().is_empty());

        let submissions = h.store.submissions();
        assert_eq!(submissions.len(), 1);
        assert!(!submissions[0].overall_passed);
        assert_eq!(job.submission_id.as_deref(), Some(submissions[0].id.as_str()));

        assert_eq!(h.dispatcher.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_claim_marks_job_error() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(BrokenClaims(store.clone()));
        let h = harness_on(jobs, store, Behavior::Map(echo), 4);
        let id = h.ledger.create(python(Stdin::default())).await.unwrap();

        assert_eq!(h.dispatcher.poll_once().await.unwrap(), 1);

        let job = h.store.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.stderr.contains("Failed to claim job"));
        assert_eq!(h.store.events().len(), 1);
        assert_eq!(h.dispatcher.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sandbox_failure_marks_job_error() {
        let h = harness(Behavior::FailInit, 4);
        let id = h.ledger.create(python(Stdin::default())).await.unwrap();

        h.dispatcher.poll_once().await.unwrap();

        let job = h.store.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.stderr.starts_with("Sandbox failure"));
    }

    #[tokio::test]
    async fn test_challenge_job_graded_and_linked() {
        let h = harness(Behavior::Map(add), 4);
        sum_challenge(&h.store);

        let id = h
            .ledger
            .create(challenge(Stdin::PerCase(vec!["1 2".into(), "4 4".into()])))
            .await
            .unwrap();

        h.dispatcher.poll_once().await.unwrap();

        let job = h.store.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        let submissions = h.store.submissions();
        assert_eq!(submissions.len(), 1);
        assert!(submissions[0].overall_passed);
        assert_eq!(job.submission_id.as_deref(), Some(submissions[0].id.as_str()));
    }

    #[tokio::test]
    async fn test_already_claimed_job_skipped() {
        let h = harness(Behavior::Map(echo), 4);
        let id = h.ledger.create(python(Stdin::default())).await.unwrap();
        let job = h.store.job(&id).unwrap();

        assert!(h.store.mark_running(&id).await.unwrap());
        h.dispatcher.process(job).await;

        assert_eq!(h.store.job(&id).unwrap().status, JobStatus::Running);
        assert!(h.store.events().is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_picks_up_new_jobs() {
        let h = harness(Behavior::Map(echo), 4);
        let dispatcher = h.dispatcher.clone();
        let loop_handle = tokio::spawn(async move { dispatcher.run().await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let id = h.ledger.create(python(Stdin::Single("late".into()))).await.unwrap();

        let done = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if h.store.job(&id).map(|j| j.status) == Some(JobStatus::Done) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        loop_handle.abort();
        assert!(done.is_ok());
    }
}
