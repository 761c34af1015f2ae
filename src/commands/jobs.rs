//! Job queue inspection

use crate::error::Result;
use crate::jobs::{JobRecord, QueueStats, SqliteJobQueue};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct JobsReport {
    pub stats: QueueStats,
    pub jobs: Vec<JobRecord>,
}

/// Queue counts and the most recently touched jobs
pub async fn cmd_jobs(queue: &SqliteJobQueue, limit: usize) -> Result<JobsReport> {
    Ok(JobsReport {
        stats: queue.stats().await?,
        jobs: queue.list_recent(limit).await?,
    })
}

pub fn print_jobs(report: &JobsReport) {
    let stats = &report.stats;
    println!(
        "Queue: {} queued, {} running, {} completed, {} failed\n",
        stats.queued, stats.running, stats.completed, stats.failed
    );
    if report.jobs.is_empty() {
        println!("No jobs yet.");
        return;
    }
    for job in &report.jobs {
        println!(
            "• {} [{}] {} (attempt {}/{})",
            job.unique_key, job.status, job.id, job.attempts, job.max_attempts
        );
        println!("  Run at: {}", job.run_at);
        if let Some(err) = &job.last_error {
            println!("  Last error: {}", err);
        }
    }
}
