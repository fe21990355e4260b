//! Redis Manager - Centralized Redis connection and operations
//!
//! This module handles all Redis-related operations including:
//! - Job ledger entries and the pending index
//! - Challenge test cases and submission records
//! - Completion events for the notification layer

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::job::{JobCompletion, JobEntry, JobStatus};
use crate::languages::Language;
use crate::storage::{ChallengeStore, JobEvent, JobStore, SubmissionRecord, TestCase};

/// Redis key constants
pub mod keys {
    use crate::languages::Language;

    /// Job ledger entry key prefix
    pub const JOB_PREFIX: &str = "exec:job:";

    /// Sorted set of pending job ids scored by creation time
    pub const PENDING_JOBS: &str = "exec:jobs:pending";

    /// Completion channel (for pub/sub)
    pub const JOB_EVENTS_CHANNEL: &str = "exec:jobs:events";

    pub const CHALLENGE_PREFIX: &str = "exec:challenge:";

    pub const SUBMISSION_PREFIX: &str = "exec:submission:";

    pub const LATEST_SUBMISSION_PREFIX: &str = "exec:submission:latest:";

    pub fn job(id: &str) -> String {
        format!("{}{}", JOB_PREFIX, id)
    }

    pub fn test_cases(challenge_id: &str) -> String {
        format!("{}{}:testcases", CHALLENGE_PREFIX, challenge_id)
    }

    pub fn submission(id: &str) -> String {
        format!("{}{}", SUBMISSION_PREFIX, id)
    }

    pub fn latest_submission(challenge_id: &str, user_id: &str, language: Language) -> String {
        format!(
            "{}{}:{}:{}",
            LATEST_SUBMISSION_PREFIX, challenge_id, user_id, language
        )
    }
}

/// Redis-backed `JobStore` and `ChallengeStore`
#[derive(Clone)]
pub struct RedisManager {
    conn: ConnectionManager,
    job_ttl_secs: u64,
}

impl RedisManager {
    /// Connect to Redis, retrying until the server is reachable
    pub async fn connect(redis_url: &str, job_ttl_secs: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn, job_ttl_secs })
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(key).await?;
        payload
            .map(|data| {
                serde_json::from_str(&data).with_context(|| format!("Corrupt value at {}", key))
            })
            .transpose()
    }

    /// Overwrite a job entry without touching its remaining TTL
    async fn put_job(&self, job: &JobEntry) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        let _: Option<String> = redis::cmd("SET")
            .arg(keys::job(&job.id))
            .arg(json)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn write_running(&self, id: &str) -> Result<bool> {
        let Some(mut job) = self.get(id).await? else {
            return Ok(false);
        };
        job.status = JobStatus::Running;
        self.put_job(&job).await?;
        Ok(true)
    }

    async fn publish<T: Serialize>(&self, channel: &str, message: &T) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(message)?;
        conn.publish::<_, _, ()>(channel, json).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisManager {
    async fn create(&self, job: &JobEntry) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        redis::pipe()
            .atomic()
            .set_ex(keys::job(&job.id), json, self.job_ttl_secs)
            .ignore()
            .zadd(keys::PENDING_JOBS, &job.id, job.created_at.timestamp_millis())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .with_context(|| format!("Failed to store job {}", job.id))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<JobEntry>> {
        self.get_json(&keys::job(id)).await
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<JobEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrange(keys::PENDING_JOBS, 0, limit as isize - 1)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            // Expired entries are left for sweep_pending
            if let Some(job) = self.get(&id).await? {
                if job.status == JobStatus::Pending {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    async fn mark_running(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let Some(score): Option<f64> = conn.zscore(keys::PENDING_JOBS, id).await? else {
            return Ok(false);
        };
        let removed: i64 = conn.zrem(keys::PENDING_JOBS, id).await?;
        if removed != 1 {
            return Ok(false);
        }

        match self.write_running(id).await {
            Ok(claimed) => Ok(claimed),
            Err(e) => {
                // Back into the index, or the entry stays pending with nobody to run it
                if let Err(restore) = conn
                    .zadd::<_, _, _, ()>(keys::PENDING_JOBS, id, score)
                    .await
                {
                    warn!(job_id = %id, "Failed to restore job to pending index: {}", restore);
                }
                Err(e)
            }
        }
    }

    async fn finish(&self, id: &str, completion: JobCompletion) -> Result<Option<JobEntry>> {
        let Some(mut job) = self.get(id).await? else {
            warn!(job_id = %id, "Job expired before it finished");
            return Ok(None);
        };
        job.apply(completion);
        self.put_job(&job).await?;

        // Usually gone already; a job failed before its claim may still be listed
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(keys::PENDING_JOBS, id).await?;

        // No subscribers is fine; the entry itself is the source of truth
        if let Err(e) = self
            .publish(keys::JOB_EVENTS_CHANNEL, &JobEvent::from(&job))
            .await
        {
            warn!(job_id = %id, "Failed to publish completion event: {}", e);
        }
        Ok(Some(job))
    }

    async fn link_submission(&self, id: &str, submission_id: &str) -> Result<()> {
        if let Some(mut job) = self.get(id).await? {
            job.submission_id = Some(submission_id.to_string());
            self.put_job(&job).await?;
        }
        Ok(())
    }

    async fn sweep_pending(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(keys::PENDING_JOBS, 0, -1).await?;

        let mut removed = 0;
        for id in ids {
            let exists: bool = conn.exists(keys::job(&id)).await?;
            if !exists {
                let n: i64 = conn.zrem(keys::PENDING_JOBS, &id).await?;
                removed += n as usize;
            }
        }
        if removed > 0 {
            debug!("Swept {} expired ids from the pending index", removed);
        }
        Ok(removed)
    }
}

#[async_trait]
impl ChallengeStore for RedisManager {
    async fn test_cases(&self, challenge_id: &str) -> Result<Vec<TestCase>> {
        Ok(self
            .get_json(&keys::test_cases(challenge_id))
            .await?
            .unwrap_or_default())
    }

    async fn latest_submission(
        &self,
        challenge_id: &str,
        user_id: &str,
        language: Language,
    ) -> Result<Option<SubmissionRecord>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn
            .get(keys::latest_submission(challenge_id, user_id, language))
            .await?;
        match id {
            Some(id) => self.get_json(&keys::submission(&id)).await,
            None => Ok(None),
        }
    }

    async fn save_submission(&self, record: &SubmissionRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        redis::pipe()
            .atomic()
            .set(keys::submission(&record.id), json)
            .ignore()
            .set(
                keys::latest_submission(&record.challenge_id, &record.user_id, record.language),
                &record.id,
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .with_context(|| format!("Failed to store submission {}", record.id))?;
        Ok(())
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> ConnectionManager {
    loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}
