use std::path::Path;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::compiler::{compile, Artifact};
use crate::config::CompileLimits;
use crate::core::job::{JobCompletion, JobEntry, JobResult, JobStatus};
use crate::core::outcome::RunOutcome;
use crate::error::ExecError;
use crate::runner::SandboxedRunner;
use crate::sandbox::{SlotLease, SlotPool};

/// Runs a job's compile and run stages on one leased slot
#[derive(Clone)]
pub struct Executor {
    pool: SlotPool,
    runner: SandboxedRunner,
    compile_limits: CompileLimits,
}

/// Returns the slot to the pool when dropped, including on unwind
struct LeaseGuard<'a> {
    pool: &'a SlotPool,
    lease: SlotLease,
}

impl LeaseGuard<'_> {
    /// Push back the idle deadline before the next stage uses the box
    fn renew(&self) -> Result<(), ExecError> {
        if self.pool.renew(self.lease) {
            Ok(())
        } else {
            Err(ExecError::Sandbox(format!(
                "Slot {} lease expired before the job finished",
                self.lease.id
            )))
        }
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        self.pool.release(self.lease);
    }
}

impl Executor {
    pub fn new(pool: SlotPool, runner: SandboxedRunner, compile_limits: CompileLimits) -> Self {
        Self {
            pool,
            runner,
            compile_limits,
        }
    }

    /// Compile `job.source` once and run it against every stdin item.
    ///
    /// A compile failure is a finished job in `error` state, not an `Err`.
    /// `Err` means the pipeline itself broke (sandbox or internal failure).
    pub async fn execute(&self, job: &JobEntry) -> Result<JobCompletion, ExecError> {
        let lease = LeaseGuard {
            pool: &self.pool,
            lease: self.pool.acquire().await,
        };
        debug!(job_id = %job.id, slot = lease.lease.id, "Acquired sandbox slot");

        let scratch = tempfile::Builder::new()
            .prefix(&format!("exec-{}-", job.id))
            .tempdir()
            .context("Failed to create scratch directory")?;

        let result = self.compile_and_run(job, &lease, scratch.path()).await;

        if let Err(e) = scratch.close() {
            warn!(job_id = %job.id, "Failed to remove scratch directory: {}", e);
        }

        result
    }

    async fn compile_and_run(
        &self,
        job: &JobEntry,
        lease: &LeaseGuard<'_>,
        scratch: &Path,
    ) -> Result<JobCompletion, ExecError> {
        let artifact = match compile(job.language, &job.source, scratch, &self.compile_limits).await
        {
            Ok(artifact) => artifact,
            Err(ExecError::Compile { stderr }) => {
                info!(job_id = %job.id, "Compilation failed");
                return Ok(compile_failure(stderr));
            }
            Err(e) => return Err(e),
        };

        let runs = self.run_all(job, lease, &artifact, scratch).await?;
        Ok(completion_from_runs(runs))
    }

    async fn run_all(
        &self,
        job: &JobEntry,
        lease: &LeaseGuard<'_>,
        artifact: &Artifact,
        scratch: &Path,
    ) -> Result<Vec<RunOutcome>, ExecError> {
        let items = job.stdin.items();
        let mut runs = Vec::with_capacity(items.len());

        for (i, stdin) in items.into_iter().enumerate() {
            lease.renew()?;
            let outcome = self
                .runner
                .run(lease.lease.id, job.language, artifact, stdin, scratch)
                .await?;
            debug!(
                job_id = %job.id,
                case = i,
                status = ?outcome.status,
                time_ms = outcome.time_ms,
                "Case finished"
            );
            runs.push(outcome);
        }

        Ok(runs)
    }
}

fn compile_failure(stderr: String) -> JobCompletion {
    JobCompletion {
        status: JobStatus::Error,
        stdout: String::new(),
        stderr: stderr.clone(),
        result: Some(JobResult {
            runs: Vec::new(),
            compile_error: Some(stderr),
        }),
    }
}

/// Done iff every run is ok; the job's own stdout/stderr mirror the first run
fn completion_from_runs(runs: Vec<RunOutcome>) -> JobCompletion {
    let status = if runs.iter().all(|r| r.status.is_ok()) {
        JobStatus::Done
    } else {
        JobStatus::Error
    };
    let (stdout, stderr) = runs
        .first()
        .map(|r| (r.stdout.clone(), r.stderr.clone()))
        .unwrap_or_default();

    JobCompletion {
        status,
        stdout,
        stderr,
        result: Some(JobResult {
            runs,
            compile_error: None,
        }),
    }
}

/// Error completion for a job whose pipeline failed
pub fn failed_completion(err: &ExecError) -> JobCompletion {
    let message = err.user_message();
    JobCompletion {
        status: JobStatus::Error,
        stdout: String::new(),
        stderr: message,
        result: None,
    }
}
