//! Persistence seams for jobs, challenges and submissions
//!
//! The dispatcher, ledger and grader only see these traits. The Redis
//! implementation lives in `redis_manager`; tests use `memory::MemoryStore`.

#[cfg(test)]
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::job::{JobCompletion, JobEntry, JobId, JobStatus};
use crate::languages::Language;

/// One input/expected-output pair of a challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub passed: bool,
    pub output: String,
    pub stderr: String,
    pub elapsed_ms: u32,
}

/// Best-known grading result for one (challenge, user, language)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: String,
    pub challenge_id: String,
    pub user_id: String,
    pub language: Language,
    pub test_results: Vec<TestCaseResult>,
    pub overall_passed: bool,
    /// Source of the last passing attempt
    pub accepted_source: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Published when a job reaches a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub device_id: Option<String>,
    pub status: JobStatus,
}

impl From<&JobEntry> for JobEvent {
    fn from(job: &JobEntry) -> Self {
        Self {
            job_id: job.id.clone(),
            device_id: job.device_id.clone(),
            status: job.status,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &JobEntry) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<JobEntry>>;

    /// Up to `limit` pending jobs, oldest first
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<JobEntry>>;

    /// Move a job from pending to running.
    ///
    /// Returns false if the job was not pending; exactly one caller wins.
    async fn mark_running(&self, id: &str) -> Result<bool>;

    /// Persist the final state and publish the completion event
    async fn finish(&self, id: &str, completion: JobCompletion) -> Result<Option<JobEntry>>;

    async fn link_submission(&self, id: &str, submission_id: &str) -> Result<()>;

    /// Drop pending-index entries whose job has expired; returns how many
    async fn sweep_pending(&self) -> Result<usize>;
}

#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Test cases in order; empty if the challenge is unknown
    async fn test_cases(&self, challenge_id: &str) -> Result<Vec<TestCase>>;

    async fn latest_submission(
        &self,
        challenge_id: &str,
        user_id: &str,
        language: Language,
    ) -> Result<Option<SubmissionRecord>>;

    /// Insert or overwrite by id, and make it the latest for its key
    async fn save_submission(&self, record: &SubmissionRecord) -> Result<()>;
}
