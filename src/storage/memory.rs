//! In-memory store used by pipeline and dispatcher tests

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::{ChallengeStore, JobEvent, JobStore, SubmissionRecord, TestCase};
use crate::core::job::{JobCompletion, JobEntry, JobStatus};
use crate::languages::Language;

#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<Vec<JobEntry>>,
    test_cases: Mutex<HashMap<String, Vec<TestCase>>>,
    submissions: Mutex<HashMap<String, SubmissionRecord>>,
    latest: Mutex<HashMap<String, String>>,
    events: Mutex<Vec<JobEvent>>,
}

fn latest_key(challenge_id: &str, user_id: &str, language: Language) -> String {
    format!("{}:{}:{}", challenge_id, user_id, language)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_test_cases(&self, challenge_id: &str, cases: Vec<TestCase>) {
        self.test_cases
            .lock()
            .unwrap()
            .insert(challenge_id.to_string(), cases);
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.submissions.lock().unwrap().values().cloned().collect()
    }

    pub fn job(&self, id: &str) -> Option<JobEntry> {
        self.jobs.lock().unwrap().iter().find(|j| j.id == id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, job: &JobEntry) -> Result<()> {
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<JobEntry>> {
        Ok(self.job(id))
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<JobEntry>> {
        let mut pending: Vec<JobEntry> = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_running(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, id: &str, completion: JobCompletion) -> Result<Option<JobEntry>> {
        let finished = {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
                return Ok(None);
            };
            job.apply(completion);
            job.clone()
        };
        self.events.lock().unwrap().push(JobEvent::from(&finished));
        Ok(Some(finished))
    }

    async fn link_submission(&self, id: &str, submission_id: &str) -> Result<()> {
        if let Some(job) = self.jobs.lock().unwrap().iter_mut().find(|j| j.id == id) {
            job.submission_id = Some(submission_id.to_string());
        }
        Ok(())
    }

    async fn sweep_pending(&self) -> Result<usize> {
        Ok(0)
    }
}

#[async_trait]
impl ChallengeStore for MemoryStore {
    async fn test_cases(&self, challenge_id: &str) -> Result<Vec<TestCase>> {
        Ok(self
            .test_cases
            .lock()
            .unwrap()
            .get(challenge_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_submission(
        &self,
        challenge_id: &str,
        user_id: &str,
        language: Language,
    ) -> Result<Option<SubmissionRecord>> {
        let id = self
            .latest
            .lock()
            .unwrap()
            .get(&latest_key(challenge_id, user_id, language))
            .cloned();
        Ok(id.and_then(|id| self.submissions.lock().unwrap().get(&id).cloned()))
    }

    async fn save_submission(&self, record: &SubmissionRecord) -> Result<()> {
        self.submissions
            .lock()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        self.latest.lock().unwrap().insert(
            latest_key(&record.challenge_id, &record.user_id, record.language),
            record.id.clone(),
        );
        Ok(())
    }
}
