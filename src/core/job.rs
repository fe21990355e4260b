//! Job ledger entry and related records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::outcome::RunOutcome;
use crate::languages::Language;

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Program input: one blob, or one blob per test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stdin {
    Single(String),
    PerCase(Vec<String>),
}

impl Stdin {
    /// Inputs in run order; the program is executed once per item
    pub fn items(&self) -> Vec<&str> {
        match self {
            Stdin::Single(s) => vec![s.as_str()],
            Stdin::PerCase(items) => items.iter().map(String::as_str).collect(),
        }
    }
}

impl Default for Stdin {
    fn default() -> Self {
        Stdin::Single(String::new())
    }
}

/// Structured outcome of a finished job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// One entry per stdin item, in order
    pub runs: Vec<RunOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_error: Option<String>,
}

/// Persisted record of one execution request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: JobId,
    pub language: Language,
    pub source: String,
    pub stdin: Stdin,
    pub status: JobStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    pub device_id: Option<String>,
    pub user_id: Option<String>,
    pub challenge_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Request to create a job, as received from the web layer
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub language: String,
    pub source: String,
    pub stdin: Stdin,
    pub user_id: Option<String>,
    pub challenge_id: Option<String>,
    pub device_id: Option<String>,
}

/// What the web layer may show for a job; the source is never included
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub status: JobStatus,
    pub language: Language,
    pub stdout: String,
    pub stderr: String,
}

impl From<&JobEntry> for JobView {
    fn from(job: &JobEntry) -> Self {
        Self {
            status: job.status,
            language: job.language,
            stdout: job.stdout.clone(),
            stderr: job.stderr.clone(),
        }
    }
}

/// Final state written by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub stdout: String,
    pub stderr: String,
    pub result: Option<JobResult>,
}

impl JobEntry {
    pub fn new(language: Language, source: String, stdin: Stdin) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            language,
            source,
            stdin,
            status: JobStatus::Pending,
            stdout: String::new(),
            stderr: String::new(),
            result: None,
            device_id: None,
            user_id: None,
            challenge_id: None,
            submission_id: None,
            created_at: Utc::now(),
        }
    }

    /// Challenge-linked jobs with a known user are graded on completion
    pub fn grading_key(&self) -> Option<(&str, &str)> {
        match (&self.challenge_id, &self.user_id) {
            (Some(challenge), Some(user)) => Some((challenge.as_str(), user.as_str())),
            _ => None,
        }
    }

    pub fn apply(&mut self, completion: JobCompletion) {
        self.status = completion.status;
        self.stdout = completion.stdout;
        self.stderr = completion.stderr;
        self.result = completion.result;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdin_untagged_forms() {
        let single: Stdin = serde_json::from_str("\"1 2\"").unwrap();
        assert_eq!(single.items(), vec!["1 2"]);

        let many: Stdin = serde_json::from_str("[\"1 2\", \"4 4\"]").unwrap();
        assert_eq!(many.items(), vec!["1 2", "4 4"]);
    }

    #[test]
    fn test_view_omits_source() {
        let job = JobEntry::new(Language::Python, "print(1)".into(), Stdin::default());
        let json = serde_json::to_value(JobView::from(&job)).unwrap();
        assert!(json.get("source").is_none());
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn test_grading_key_needs_user_and_challenge() {
        let mut job = JobEntry::new(Language::C, String::new(), Stdin::default());
        job.challenge_id = Some("ch1".into());
        assert!(job.grading_key().is_none());
        job.user_id = Some("u1".into());
        assert_eq!(job.grading_key(), Some(("ch1", "u1")));
    }
}
