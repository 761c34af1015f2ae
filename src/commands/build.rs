//! Knowledge base build command

use super::Runtime;
use crate::error::{Error, Result};
use crate::jobs::{Enqueued, JobPayload, JobRequest, RunSummary, Scheduler};
use crate::meta::KnowledgeBase;
use crate::progress::{apply_to_bar, kb_progress_bar};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub project_id: i64,
    pub job: Enqueued,
    /// Set when the command waited for the queue to drain
    pub summary: Option<RunSummary>,
    pub knowledge_base: Option<KnowledgeBase>,
}

/// Enqueue a build; with `wait`, work the queue until it drains and report the result
pub async fn cmd_build(rt: &Runtime, project_id: i64, wait: bool, show_progress: bool) -> Result<BuildReport> {
    if rt.db.get_project(project_id).await?.is_none() {
        return Err(Error::NotFound(format!("Project {}", project_id)));
    }

    let mut updates = rt.progress.subscribe();
    let job = rt
        .queue
        .schedule(JobRequest::now(JobPayload::BuildKnowledgeBase { project_id }))
        .await?;
    info!(project_id, ?job, "Build requested");

    if !wait {
        return Ok(BuildReport {
            project_id,
            job,
            summary: None,
            knowledge_base: rt.db.get_knowledge_base(project_id).await?,
        });
    }

    let follower = show_progress.then(|| {
        let bar = kb_progress_bar(project_id);
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) if update.project_id == project_id => {
                        apply_to_bar(&bar, &update);
                        if update.is_terminal() {
                            bar.finish_with_message(update.status.to_string());
                            break;
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let summary = rt.worker_pool().run_until_idle().await;
    if let Some(follower) = follower {
        follower.abort();
    }

    Ok(BuildReport {
        project_id,
        job,
        summary: Some(summary?),
        knowledge_base: rt.db.get_knowledge_base(project_id).await?,
    })
}

pub fn print_build(report: &BuildReport) {
    match &report.job {
        Enqueued::Accepted(id) => println!("Build for project {} queued as job {}", report.project_id, id),
        Enqueued::Deduplicated => println!("A build for project {} is already queued", report.project_id),
    }
    if let Some(summary) = &report.summary {
        println!(
            "  Jobs: {} completed, {} rescheduled, {} retried, {} failed",
            summary.completed, summary.rescheduled, summary.retried, summary.failed
        );
    }
    if let Some(kb) = &report.knowledge_base {
        println!("  Knowledge base: {} ({}, {}%)", kb.status, kb.stage, kb.progress);
        println!("  Version: {}, chunks: {}", kb.version, kb.total_chunks);
        if let Some(state) = &kb.conflict_state {
            println!("  Conflict detection: {}", state);
        }
        if let Some(err) = &kb.last_error {
            println!("  Note: {}", err);
        }
    }
}
