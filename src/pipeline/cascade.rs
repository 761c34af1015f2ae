use super::{KbTracker, SideEffect};
use crate::error::{Error, Result};
use crate::extraction::{ConflictCandidate, ExtractionClient};
use crate::jobs::{JobPayload, JobRequest, Scheduler};
use crate::meta::{MetaDb, Stage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Result of starting conflict analysis
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeOutcome {
    /// External job started and a poll scheduled for it
    Scheduled { job_id: String },
    Skipped(String),
}

impl CascadeOutcome {
    pub fn into_side_effect(result: Result<CascadeOutcome>) -> SideEffect {
        const NAME: &str = "conflict_detection";
        match result {
            Ok(CascadeOutcome::Scheduled { job_id }) => {
                SideEffect::applied(NAME, format!("job {}", job_id))
            }
            Ok(CascadeOutcome::Skipped(reason)) => SideEffect::skipped(NAME, reason),
            Err(e) => SideEffect::failed(NAME, &e),
        }
    }
}

/// Starts conflict detection for a project and schedules its poller
#[derive(Clone)]
pub struct ConflictCascade {
    db: MetaDb,
    client: Arc<dyn ExtractionClient>,
    scheduler: Arc<dyn Scheduler>,
    tracker: KbTracker,
    delay: Duration,
}

impl ConflictCascade {
    pub fn new(
        db: MetaDb,
        client: Arc<dyn ExtractionClient>,
        scheduler: Arc<dyn Scheduler>,
        tracker: KbTracker,
        delay: Duration,
    ) -> Self {
        Self {
            db,
            client,
            scheduler,
            tracker,
            delay,
        }
    }

    pub async fn trigger(&self, project_id: i64) -> Result<CascadeOutcome> {
        let candidates: Vec<ConflictCandidate> = self
            .db
            .list_project_requirements(project_id)
            .await?
            .into_iter()
            .filter(|r| !r.requirement_text.trim().is_empty())
            .map(|r| ConflictCandidate {
                id: r.id,
                text: r.requirement_text,
            })
            .collect();

        if candidates.len() < 2 {
            debug!(project_id, count = candidates.len(), "Too few requirements for conflict detection");
            return Ok(CascadeOutcome::Skipped(
                "fewer than two requirements".to_string(),
            ));
        }

        let job = self.client.detect_conflicts(project_id, &candidates).await?;
        let job_id = job.job_id.trim().to_string();
        if job_id.is_empty() {
            return Err(Error::MalformedResponse(
                "conflict detection returned an empty job id".to_string(),
            ));
        }

        self.tracker
            .advance(project_id, Stage::DetectingConflicts, Stage::DetectingConflicts.base_progress())
            .await?;

        let payload = JobPayload::PollConflicts {
            job_id: job_id.clone(),
            project_id,
        };
        self.scheduler
            .schedule(JobRequest::delayed(payload, self.delay))
            .await?;

        info!(
            project_id,
            job_id = %job_id,
            requirements = candidates.len(),
            "Conflict detection started"
        );
        Ok(CascadeOutcome::Scheduled { job_id })
    }
}
