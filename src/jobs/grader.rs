//! Grading of challenge-linked jobs
//!
//! Pairs test case i with run i, compares stdout exactly and upserts the
//! submission record for (challenge, user, language).

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::core::job::JobEntry;
use crate::core::outcome::RunOutcome;
use crate::storage::{ChallengeStore, JobStore, SubmissionRecord, TestCase, TestCaseResult};

/// Compare each run's stdout with its test case's expected output.
///
/// The first test case is always graded; a missing run reads as empty
/// stdout with `fallback_stderr`. Later cases without a run are skipped.
pub fn grade(
    test_cases: &[TestCase],
    runs: &[RunOutcome],
    fallback_stderr: &str,
) -> Vec<TestCaseResult> {
    test_cases
        .iter()
        .enumerate()
        .filter_map(|(i, case)| match runs.get(i) {
            Some(run) => Some(TestCaseResult {
                passed: run.stdout == case.expected_output,
                output: run.stdout.clone(),
                stderr: run.stderr.clone(),
                elapsed_ms: run.time_ms,
            }),
            None if i == 0 => Some(TestCaseResult {
                passed: case.expected_output.is_empty(),
                output: String::new(),
                stderr: fallback_stderr.to_string(),
                elapsed_ms: 0,
            }),
            None => None,
        })
        .collect()
}

#[derive(Clone)]
pub struct GradingEngine {
    challenges: Arc<dyn ChallengeStore>,
    jobs: Arc<dyn JobStore>,
}

impl GradingEngine {
    pub fn new(challenges: Arc<dyn ChallengeStore>, jobs: Arc<dyn JobStore>) -> Self {
        Self { challenges, jobs }
    }

    /// Grade a finished job and link it to its submission record.
    ///
    /// Returns None for jobs without a challenge and user, or when the
    /// challenge has no test cases.
    pub async fn grade_job(&self, job: &JobEntry) -> Result<Option<SubmissionRecord>> {
        let Some((challenge_id, user_id)) = job.grading_key() else {
            return Ok(None);
        };

        let test_cases = self.challenges.test_cases(challenge_id).await?;
        if test_cases.is_empty() {
            warn!(job_id = %job.id, challenge_id, "Challenge has no test cases, skipping grading");
            return Ok(None);
        }

        let runs = job.result.as_ref().map(|r| r.runs.as_slice()).unwrap_or_default();
        let test_results = grade(&test_cases, runs, &job.stderr);
        let overall_passed = test_results.iter().all(|r| r.passed);

        let previous = self
            .challenges
            .latest_submission(challenge_id, user_id, job.language)
            .await?;

        let record = match previous {
            Some(previous) => SubmissionRecord {
                test_results,
                overall_passed,
                accepted_source: if overall_passed {
                    Some(job.source.clone())
                } else {
                    previous.accepted_source
                },
                updated_at: Utc::now(),
                ..previous
            },
            None => SubmissionRecord {
                id: uuid::Uuid::new_v4().to_string(),
                challenge_id: challenge_id.to_string(),
                user_id: user_id.to_string(),
                language: job.language,
                test_results,
                overall_passed,
                accepted_source: overall_passed.then(|| job.source.clone()),
                updated_at: Utc::now(),
            },
        };

        self.challenges.save_submission(&record).await?;
        self.jobs.link_submission(&job.id, &record.id).await?;

        info!(
            job_id = %job.id,
            submission_id = %record.id,
            passed = record.overall_passed,
            "Graded submission"
        );
        Ok(Some(record))
    }
}
