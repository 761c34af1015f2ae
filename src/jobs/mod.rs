//! Persisted job scheduling
//!
//! Work is expressed as serializable [`JobPayload`]s. A [`Scheduler`] accepts
//! them (optionally delayed) and deduplicates by unique key; the
//! [`WorkerPool`] claims due jobs from the [`SqliteJobQueue`] and applies each
//! kind's [`RetryPolicy`].

mod queue;
mod worker;

pub use queue::*;
pub use worker::*;

use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Kind of scheduled work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ProcessDocument,
    BuildKnowledgeBase,
    PollConflicts,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::ProcessDocument => write!(f, "process_document"),
            JobKind::BuildKnowledgeBase => write!(f, "build_knowledge_base"),
            JobKind::PollConflicts => write!(f, "poll_conflicts"),
        }
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process_document" => Ok(JobKind::ProcessDocument),
            "build_knowledge_base" => Ok(JobKind::BuildKnowledgeBase),
            "poll_conflicts" => Ok(JobKind::PollConflicts),
            _ => Err(Error::Validation(format!("Unknown job kind: {}", s))),
        }
    }
}

/// A unit of work, small enough to persist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    ProcessDocument { document_id: i64 },
    BuildKnowledgeBase { project_id: i64 },
    PollConflicts { job_id: String, project_id: i64 },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::ProcessDocument { .. } => JobKind::ProcessDocument,
            JobPayload::BuildKnowledgeBase { .. } => JobKind::BuildKnowledgeBase,
            JobPayload::PollConflicts { .. } => JobKind::PollConflicts,
        }
    }

    /// At most one queued or running job exists per key
    pub fn unique_key(&self) -> String {
        match self {
            JobPayload::ProcessDocument { document_id } => {
                format!("process_document_{}", document_id)
            }
            JobPayload::BuildKnowledgeBase { project_id } => format!("kb_build_{}", project_id),
            JobPayload::PollConflicts { job_id, .. } => format!("conflict_poll_{}", job_id),
        }
    }
}

/// Payload plus how long to wait before it becomes due
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub payload: JobPayload,
    pub delay: Duration,
}

impl JobRequest {
    pub fn now(payload: JobPayload) -> Self {
        Self {
            payload,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(payload: JobPayload, delay: Duration) -> Self {
        Self { payload, delay }
    }
}

/// Result of scheduling a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "job_id")]
pub enum Enqueued {
    Accepted(String),
    /// A job with the same unique key is already queued or running
    Deduplicated,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule(&self, request: JobRequest) -> Result<Enqueued>;
}

/// Attempts, backoff and per-attempt timeout for one job kind
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` after attempt `n` failed; the last entry repeats
    pub backoff: Vec<Duration>,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(idx).copied().unwrap_or(Duration::ZERO)
    }
}

/// Retry policies for every job kind
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    pub ingest: RetryPolicy,
    pub build: RetryPolicy,
    pub poll: RetryPolicy,
}

impl RetryPolicies {
    pub fn from_config(config: &Config) -> Self {
        let ingest = &config.ingest;
        Self {
            ingest: RetryPolicy {
                max_attempts: ingest.max_attempts,
                backoff: (1..=ingest.backoff_secs.len() as u32)
                    .map(|n| ingest.backoff_for(n))
                    .collect(),
                timeout: Duration::from_secs(ingest.timeout_secs),
            },
            build: RetryPolicy {
                max_attempts: config.build.max_attempts,
                backoff: vec![Duration::ZERO],
                timeout: Duration::from_secs(config.build.timeout_secs),
            },
            poll: RetryPolicy {
                max_attempts: config.poller.max_attempts,
                backoff: vec![config.poller.delay()],
                timeout: Duration::from_secs(config.poller.timeout_secs),
            },
        }
    }

    pub fn for_kind(&self, kind: JobKind) -> &RetryPolicy {
        match kind {
            JobKind::ProcessDocument => &self.ingest,
            JobKind::BuildKnowledgeBase => &self.build,
            JobKind::PollConflicts => &self.poll,
        }
    }

    /// Longest per-attempt timeout of any kind
    pub fn longest_timeout(&self) -> Duration {
        self.ingest
            .timeout
            .max(self.build.timeout)
            .max(self.poll.timeout)
    }
}
