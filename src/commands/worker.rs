//! Worker command

use super::Runtime;
use crate::error::Result;
use crate::jobs::RunSummary;
use tracing::{info, warn};

/// Run the worker pool, either until the queue drains or until Ctrl-C
pub async fn cmd_worker(rt: &Runtime, until_idle: bool) -> Result<RunSummary> {
    let pool = rt.worker_pool();
    if until_idle {
        return pool.run_until_idle().await;
    }

    info!("Serving jobs, press Ctrl-C to stop");
    pool.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}

pub fn print_run_summary(summary: &RunSummary) {
    println!("Worker finished");
    println!("  Completed: {}", summary.completed);
    println!("  Rescheduled: {}", summary.rescheduled);
    println!("  Retried: {}", summary.retried);
    println!("  Failed: {}", summary.failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::test_runtime;

    #[tokio::test]
    async fn test_until_idle_on_empty_queue() {
        let (rt, _tmp) = test_runtime().await;
        let summary = cmd_worker(&rt, true).await.unwrap();
        assert_eq!(summary, RunSummary::default());
    }
}
