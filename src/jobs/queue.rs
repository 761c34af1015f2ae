//! Job queue stored in the `jobs` table

use super::{Enqueued, JobPayload, JobRequest, RetryPolicies, Scheduler};
use crate::error::{Error, Result};
use crate::meta::{now_ts, ts_after, MetaDb};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Job row status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(Error::Validation(format!("Unknown job state: {}", s))),
        }
    }
}

/// A persisted job
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub kind: String,
    pub payload_json: String,
    pub unique_key: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: String,
    pub locked_until: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRecord {
    pub fn payload(&self) -> Result<JobPayload> {
        Ok(serde_json::from_str(&self.payload_json)?)
    }

    pub fn get_state(&self) -> Result<JobState> {
        self.status.parse()
    }

    /// Attempt number of the current (or last) run, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempts.clamp(0, i64::from(u32::MAX)) as u32
    }

    pub fn attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    /// No queued or running work remains
    pub fn is_drained(&self) -> bool {
        self.queued == 0 && self.running == 0
    }
}

/// Scheduler backed by SQLite
#[derive(Clone)]
pub struct SqliteJobQueue {
    db: MetaDb,
    policies: RetryPolicies,
}

impl SqliteJobQueue {
    pub fn new(db: MetaDb, policies: RetryPolicies) -> Self {
        Self { db, policies }
    }

    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    /// Insert a job unless one with the same key is queued or running
    pub async fn enqueue(&self, request: &JobRequest) -> Result<Enqueued> {
        let payload = &request.payload;
        let id = Uuid::new_v4().to_string();
        let now = now_ts();
        let max_attempts = self.policies.for_kind(payload.kind()).max_attempts;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs (
                id, kind, payload_json, unique_key, status, attempts, max_attempts,
                run_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, 'queued', 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(payload.kind().to_string())
        .bind(serde_json::to_string(payload)?)
        .bind(payload.unique_key())
        .bind(i64::from(max_attempts))
        .bind(ts_after(request.delay))
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 1 {
            debug!(job = %id, key = %payload.unique_key(), delay_ms = request.delay.as_millis() as u64, "Job enqueued");
            Ok(Enqueued::Accepted(id))
        } else {
            info!(key = %payload.unique_key(), "Job already pending, skipped");
            Ok(Enqueued::Deduplicated)
        }
    }

    /// Atomically take the oldest due job, or one whose lease expired.
    ///
    /// The claimed row is `running`, its attempt counter incremented and its
    /// lease set to `lease` from now.
    pub async fn claim_next(&self, lease: Duration) -> Result<Option<JobRecord>> {
        let now = now_ts();
        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs SET
                status = 'running',
                attempts = attempts + 1,
                locked_until = ?,
                updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE (status = 'queued' AND run_at <= ?)
                   OR (status = 'running' AND locked_until < ?)
                ORDER BY run_at, created_at
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(ts_after(lease))
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(job) = &job {
            debug!(job = %job.id, kind = %job.kind, attempt = job.attempts, "Claimed job");
        }
        Ok(job)
    }

    /// Mark a job done
    pub async fn complete(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', locked_until = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now_ts())
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Put a job back in the queue, due after `delay`
    pub async fn release(&self, id: &str, delay: Duration, note: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'queued',
                run_at = ?,
                locked_until = NULL,
                last_error = COALESCE(?, last_error),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(ts_after(delay))
        .bind(note)
        .bind(now_ts())
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Mark a job permanently failed
    pub async fn fail(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'failed', locked_until = NULL, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(now_ts())
        .bind(id)
        .execute(self.db.pool())
        .await?;
        warn!(job = %id, "Job failed permanently: {}", error);
        Ok(())
    }

    /// Get job by ID
    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(job)
    }

    /// Most recently touched jobs first
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let jobs = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;
        Ok(jobs)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(self.db.pool())
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as usize;
            match status.parse::<JobState>() {
                Ok(JobState::Queued) => stats.queued = count,
                Ok(JobState::Running) => stats.running = count,
                Ok(JobState::Completed) => stats.completed = count,
                Ok(JobState::Failed) => stats.failed = count,
                Err(_) => {}
            }
        }
        Ok(stats)
    }

    /// When the earliest queued job becomes due
    pub async fn next_due_at(&self) -> Result<Option<String>> {
        let due: Option<String> =
            sqlx::query_scalar("SELECT MIN(run_at) FROM jobs WHERE status = 'queued'")
                .fetch_one(self.db.pool())
                .await?;
        Ok(due)
    }
}

#[async_trait]
impl Scheduler for SqliteJobQueue {
    async fn schedule(&self, request: JobRequest) -> Result<Enqueued> {
        self.enqueue(&request).await
    }
}
