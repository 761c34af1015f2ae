//! Worker pool draining the job queue

use super::{JobPayload, JobRecord, SqliteJobQueue};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What a handler wants done with the job after a successful attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Run the same job again after the delay
    Reschedule(Duration),
}

/// Executes payloads for the worker pool
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt. `attempt` starts at 1.
    async fn handle(&self, payload: &JobPayload, attempt: u32) -> Result<JobOutcome>;

    /// Called once when a job fails for good
    async fn on_exhausted(&self, payload: &JobPayload, error: &Error);
}

/// How a claimed job was left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Rescheduled,
    Retried,
    Failed,
}

/// Counts of dispositions over a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub rescheduled: usize,
    pub retried: usize,
    pub failed: usize,
}

impl RunSummary {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Completed => self.completed += 1,
            Disposition::Rescheduled => self.rescheduled += 1,
            Disposition::Retried => self.retried += 1,
            Disposition::Failed => self.failed += 1,
        }
    }

    fn merge(mut self, other: RunSummary) -> Self {
        self.completed += other.completed;
        self.rescheduled += other.rescheduled;
        self.retried += other.retried;
        self.failed += other.failed;
        self
    }
}

/// N cooperative workers over one queue
#[derive(Clone)]
pub struct WorkerPool {
    queue: SqliteJobQueue,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(queue: SqliteJobQueue, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    fn lease(&self) -> Duration {
        self.queue.policies().longest_timeout() + Duration::from_secs(self.config.lease_grace_secs)
    }

    /// Claim and execute a single due job
    pub async fn run_once(&self) -> Result<Option<Disposition>> {
        match self.queue.claim_next(self.lease()).await? {
            Some(job) => Ok(Some(self.execute(job).await?)),
            None => Ok(None),
        }
    }

    /// Work until nothing is queued or running, waiting out delayed jobs
    pub async fn run_until_idle(&self) -> Result<RunSummary> {
        let (_tx, rx) = watch::channel(false);
        self.run_workers(true, rx).await
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown.await;
            let _ = tx.send(true);
        });
        self.run_workers(false, rx).await
    }

    async fn run_workers(&self, until_idle: bool, stop: watch::Receiver<bool>) -> Result<RunSummary> {
        let concurrency = self.config.concurrency.max(1);
        info!(workers = concurrency, until_idle, "Starting workers");

        let loops = (0..concurrency).map(|worker| self.worker_loop(worker, until_idle, stop.clone()));
        let mut total = RunSummary::default();
        for result in join_all(loops).await {
            total = total.merge(result?);
        }

        info!(
            completed = total.completed,
            rescheduled = total.rescheduled,
            retried = total.retried,
            failed = total.failed,
            "Workers stopped"
        );
        Ok(total)
    }

    async fn worker_loop(
        &self,
        worker: usize,
        until_idle: bool,
        mut stop: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        loop {
            if *stop.borrow() {
                break;
            }

            let claimed = match self.queue.claim_next(self.lease()).await {
                Ok(claimed) => claimed,
                Err(e) if !until_idle => {
                    warn!(worker, "Failed to claim job: {}", e);
                    None
                }
                Err(e) => return Err(e),
            };

            match claimed {
                Some(job) => match self.execute(job).await {
                    Ok(disposition) => summary.record(disposition),
                    Err(e) if !until_idle => error!(worker, "Failed to settle job: {}", e),
                    Err(e) => return Err(e),
                },
                None => {
                    if until_idle && self.queue.stats().await?.is_drained() {
                        break;
                    }
                    let wait = self.idle_wait().await;
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = stop.changed() => {}
                    }
                }
            }
        }

        debug!(worker, "Worker finished");
        Ok(summary)
    }

    // Sleep no longer than the idle poll interval, and wake for the next delayed job
    async fn idle_wait(&self) -> Duration {
        let idle = Duration::from_millis(self.config.idle_poll_ms);
        let until_due = match self.queue.next_due_at().await {
            Ok(Some(due)) => DateTime::parse_from_rfc3339(&due)
                .ok()
                .and_then(|due| (due.with_timezone(&Utc) - Utc::now()).to_std().ok()),
            _ => None,
        };
        until_due
            .map(|d| d.max(Duration::from_millis(5)))
            .unwrap_or(idle)
            .min(idle)
    }

    async fn execute(&self, job: JobRecord) -> Result<Disposition> {
        let payload = match job.payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.queue
                    .fail(&job.id, &format!("Unreadable payload: {}", e))
                    .await?;
                return Ok(Disposition::Failed);
            }
        };

        let kind = payload.kind();
        let attempt = job.attempt();

        // A reclaimed lease can push a job past its budget
        if job.attempts > job.max_attempts {
            let err = Error::Other(format!(
                "{} exhausted its {} attempts",
                kind, job.max_attempts
            ));
            self.queue.fail(&job.id, &err.to_string()).await?;
            self.handler.on_exhausted(&payload, &err).await;
            return Ok(Disposition::Failed);
        }

        let policy = self.queue.policies().for_kind(kind).clone();
        debug!(job = %job.id, kind = %kind, attempt, "Executing job");

        let result = match tokio::time::timeout(policy.timeout, self.handler.handle(&payload, attempt)).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransientService(format!(
                "{} attempt timed out after {}s",
                kind,
                policy.timeout.as_secs()
            ))),
        };

        match result {
            Ok(JobOutcome::Completed) => {
                self.queue.complete(&job.id).await?;
                Ok(Disposition::Completed)
            }
            Ok(JobOutcome::Reschedule(delay)) => {
                self.queue.release(&job.id, delay, None).await?;
                Ok(Disposition::Rescheduled)
            }
            Err(e) if e.is_retryable() && job.attempts_left() => {
                let delay = policy.backoff_after(attempt);
                warn!(
                    job = %job.id,
                    kind = %kind,
                    attempt,
                    retry_in_secs = delay.as_secs(),
                    "Job attempt failed, will retry: {}",
                    e
                );
                self.queue.release(&job.id, delay, Some(&e.to_string())).await?;
                Ok(Disposition::Retried)
            }
            Err(e) => {
                self.queue.fail(&job.id, &e.to_string()).await?;
                self.handler.on_exhausted(&payload, &e).await;
                Ok(Disposition::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jobs::{JobRequest, RetryPolicies, RetryPolicy, Scheduler};
    use crate::meta::tests::setup_test_db;
    use std::sync::Mutex;

    /// Fails with a transient error a fixed number of times, then succeeds
    struct Flaky {
        failures_left: Mutex<u32>,
        exhausted: Mutex<Vec<JobPayload>>,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _payload: &JobPayload, _attempt: u32) -> Result<JobOutcome> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(Error::TransientService("connection refused".to_string()));
            }
            Ok(JobOutcome::Completed)
        }

        async fn on_exhausted(&self, payload: &JobPayload, _error: &Error) {
            self.exhausted.lock().unwrap().push(payload.clone());
        }
    }

    async fn pool_with(failures: u32) -> (WorkerPool, Arc<Flaky>, SqliteJobQueue, tempfile::TempDir) {
        let (db, tmp) = setup_test_db().await;
        let mut policies = RetryPolicies::from_config(&Config::default());
        policies.ingest = RetryPolicy {
            max_attempts: 3,
            backoff: vec![Duration::ZERO],
            timeout: Duration::from_secs(5),
        };
        let queue = SqliteJobQueue::new(db, policies);
        let handler = Arc::new(Flaky {
            failures_left: Mutex::new(failures),
            exhausted: Mutex::new(Vec::new()),
        });
        let config = WorkerConfig {
            concurrency: 2,
            idle_poll_ms: 10,
            lease_grace_secs: 1,
        };
        let pool = WorkerPool::new(queue.clone(), handler.clone(), config);
        (pool, handler, queue, tmp)
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (pool, handler, queue, _tmp) = pool_with(2).await;
        queue
            .schedule(JobRequest::now(JobPayload::ProcessDocument { document_id: 1 }))
            .await
            .unwrap();

        let summary = pool.run_until_idle().await.unwrap();
        assert_eq!(summary.retried, 2);
        assert_eq!(summary.completed, 1);
        assert!(handler.exhausted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_hook_runs_once() {
        let (pool, handler, queue, _tmp) = pool_with(10).await;
        queue
            .schedule(JobRequest::now(JobPayload::ProcessDocument { document_id: 1 }))
            .await
            .unwrap();

        let summary = pool.run_until_idle().await.unwrap();
        assert_eq!(summary.retried, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(
            *handler.exhausted.lock().unwrap(),
            vec![JobPayload::ProcessDocument { document_id: 1 }]
        );
        assert_eq!(queue.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_run_once_on_empty_queue() {
        let (pool, _handler, _queue, _tmp) = pool_with(0).await;
        assert!(pool.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (pool, _handler, _queue, _tmp) = pool_with(0).await;
        let summary = pool
            .run(tokio::time::sleep(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(summary, RunSummary::default());
    }
}
