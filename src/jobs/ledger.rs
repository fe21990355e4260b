//! Job submission and query surface for the web layer

use std::sync::Arc;

use tracing::info;

use crate::core::job::{JobEntry, JobId, JobView, NewJob};
use crate::error::ExecError;
use crate::languages::Language;
use crate::storage::JobStore;

#[derive(Clone)]
pub struct JobLedger {
    store: Arc<dyn JobStore>,
}

impl JobLedger {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Validate and persist a new pending job.
    ///
    /// The language is checked before anything is written.
    pub async fn create(&self, request: NewJob) -> Result<JobId, ExecError> {
        let language: Language = request.language.parse()?;

        let mut job = JobEntry::new(language, request.source, request.stdin);
        job.user_id = request.user_id;
        job.challenge_id = request.challenge_id;
        job.device_id = request.device_id;

        self.store.create(&job).await?;
        info!(job_id = %job.id, %language, "Created job");
        Ok(job.id)
    }

    /// Public view of a job; never includes the source
    pub async fn get(&self, id: &str) -> Result<Option<JobView>, ExecError> {
        Ok(self.store.get(id).await?.as_ref().map(JobView::from))
    }
}
