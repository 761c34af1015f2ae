use super::{meta_map, KbTracker};
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::extraction::{ExtractionClient, JobStatus, JobStatusResponse, KbDocument, ReportedConflict};
use crate::meta::{Conflict, ConflictState, MetaDb, NewConflict, Stage};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// An external conflict job and the project it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollJob {
    pub job_id: String,
    pub project_id: i64,
}

/// Result of one poll attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Terminal: conflicts persisted, knowledge base `complete`
    Resolved { conflicts_saved: usize },
    /// Terminal: the service reported failure, knowledge base `degraded`
    JobFailed { error: String },
    /// Not finished yet; poll again after `delay`
    Reschedule { delay: Duration },
    /// Terminal: attempt budget spent while the job was still running
    Exhausted,
}

/// Drives one external conflict job to a terminal state, one attempt per call
#[derive(Clone)]
pub struct ConflictPoller {
    db: MetaDb,
    client: Arc<dyn ExtractionClient>,
    tracker: KbTracker,
    config: PollerConfig,
}

impl ConflictPoller {
    pub fn new(
        db: MetaDb,
        client: Arc<dyn ExtractionClient>,
        tracker: KbTracker,
        config: PollerConfig,
    ) -> Self {
        Self {
            db,
            client,
            tracker,
            config,
        }
    }

    /// Run attempt number `attempt` (starting at 1)
    ///
    /// Any error inside the attempt reschedules while the budget lasts; at
    /// the last attempt the knowledge base is finalized `degraded` and
    /// `PollExhausted` is returned.
    pub async fn poll(&self, job: &PollJob, attempt: u32) -> Result<PollOutcome> {
        let last_attempt = attempt >= self.config.max_attempts;

        match self.attempt(job, attempt, last_attempt).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if !last_attempt => {
                warn!(
                    job_id = %job.job_id,
                    attempt,
                    "Conflict poll attempt failed, will poll again: {}",
                    e
                );
                Ok(PollOutcome::Reschedule {
                    delay: self.config.delay(),
                })
            }
            Err(e) => {
                self.give_up(job, &format!("Conflict polling failed: {}", e))
                    .await?;
                Err(Error::PollExhausted {
                    job_id: job.job_id.clone(),
                    attempts: attempt,
                    last_error: e.to_string(),
                })
            }
        }
    }

    async fn attempt(&self, job: &PollJob, attempt: u32, last_attempt: bool) -> Result<PollOutcome> {
        let response = self.client.get_job_status(&job.job_id).await?;

        match response.status {
            JobStatus::Completed => {
                let conflicts_saved = self.resolve(job, response).await?;
                Ok(PollOutcome::Resolved { conflicts_saved })
            }
            JobStatus::Failed => {
                let error = response
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "Conflict detection failed".to_string());
                warn!(job_id = %job.job_id, project_id = job.project_id, "Conflict job failed: {}", error);
                self.tracker
                    .finalize_ready(
                        job.project_id,
                        ConflictState::Degraded,
                        Some(format!("Conflict detection failed: {}", error)),
                    )
                    .await?;
                Ok(PollOutcome::JobFailed { error })
            }
            JobStatus::Pending | JobStatus::Running | JobStatus::Unknown => {
                let progress = processing_progress(response.progress);
                self.tracker
                    .advance(job.project_id, Stage::ProcessingConflicts, progress)
                    .await?;

                if last_attempt {
                    self.give_up(
                        job,
                        &format!("Conflict detection still running after {} checks", attempt),
                    )
                    .await?;
                    return Ok(PollOutcome::Exhausted);
                }

                debug!(
                    job_id = %job.job_id,
                    attempt,
                    status = ?response.status,
                    progress,
                    "Conflict job not finished"
                );
                Ok(PollOutcome::Reschedule {
                    delay: self.config.delay(),
                })
            }
        }
    }

    /// Settle a poll job that failed for good
    pub async fn mark_exhausted(&self, job: &PollJob, error: &Error) -> Result<()> {
        self.give_up(job, &format!("Conflict polling failed: {}", error))
            .await
    }

    async fn give_up(&self, job: &PollJob, note: &str) -> Result<()> {
        warn!(job_id = %job.job_id, project_id = job.project_id, "{}", note);
        self.tracker
            .finalize_ready(job.project_id, ConflictState::Degraded, Some(note.to_string()))
            .await?;
        Ok(())
    }

    async fn resolve(&self, job: &PollJob, response: JobStatusResponse) -> Result<usize> {
        let reported = response.conflicts.unwrap_or_default();
        let known = self.db.requirement_ids(job.project_id).await?;

        let batch: Vec<NewConflict> = reported
            .iter()
            .filter_map(|c| {
                let pair = c.req_id_1.as_i64().zip(c.req_id_2.as_i64());
                match pair {
                    Some((r1, r2)) if known.contains(&r1) && known.contains(&r2) => {
                        Some(to_new_conflict(c, r1, r2))
                    }
                    _ => {
                        warn!(
                            job_id = %job.job_id,
                            req_id_1 = %c.req_id_1,
                            req_id_2 = %c.req_id_2,
                            "Skipping conflict with unknown requirement"
                        );
                        None
                    }
                }
            })
            .collect();

        self.tracker
            .advance(job.project_id, Stage::SavingConflicts, Stage::SavingConflicts.base_progress())
            .await?;

        let saved = self.db.insert_conflicts(job.project_id, &batch).await?;
        info!(
            job_id = %job.job_id,
            project_id = job.project_id,
            reported = reported.len(),
            saved = saved.len(),
            "Conflicts saved"
        );

        if !saved.is_empty() {
            let entries: Vec<_> = saved.iter().map(conflict_entry).collect();
            if let Err(e) = self.client.incremental_kb_update(job.project_id, &entries).await {
                warn!(project_id = job.project_id, "Failed to index conflicts: {}", e);
            }
        }

        self.tracker
            .finalize_ready(job.project_id, ConflictState::Complete, None)
            .await?;
        Ok(saved.len())
    }
}

// 60..=85 inside processing_conflicts
fn processing_progress(reported: Option<f64>) -> u8 {
    let p = reported.filter(|p| p.is_finite()).unwrap_or(0.0).clamp(0.0, 100.0);
    Stage::ProcessingConflicts.base_progress() + (p * 0.25) as u8
}

fn to_new_conflict(c: &ReportedConflict, r1: i64, r2: i64) -> NewConflict {
    NewConflict {
        requirement_id_1: r1,
        requirement_id_2: r2,
        severity: c.severity(),
        confidence: c.confidence.as_ref().map(ToString::to_string),
        description: c.reason_or_default().to_string(),
        cluster_id: c.cluster_id.as_ref().map(ToString::to_string),
    }
}

fn conflict_entry(c: &Conflict) -> KbDocument {
    KbDocument {
        content: format!(
            "Conflict between {} and {}: {}",
            c.requirement_id_1, c.requirement_id_2, c.description
        ),
        doc_type: "conflict".to_string(),
        meta: meta_map([
            ("conflict_id", Value::from(c.id)),
            ("project_id", Value::from(c.project_id)),
            ("requirement_id_1", Value::from(c.requirement_id_1)),
            ("requirement_id_2", Value::from(c.requirement_id_2)),
            ("severity", Value::from(c.severity.clone())),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::Scalar;
    use crate::meta::{KbStatus, NewRequirement, Priority, RequirementType};
    use crate::testing::{fast_config, job_status, Fail, Harness};

    async fn building_project(h: &Harness) -> PollJob {
        let project = h.db.create_project("Poll").await.unwrap();
        h.db.begin_kb_build(project.id).await.unwrap();
        PollJob {
            job_id: "conflict-job-1".to_string(),
            project_id: project.id,
        }
    }

    async fn add_requirement(h: &Harness, project_id: i64, text: &str) -> i64 {
        h.db.insert_manual_requirement(
            project_id,
            &NewRequirement {
                title: text.to_string(),
                text: text.to_string(),
                requirement_type: RequirementType::Functional,
                priority: Priority::High,
                confidence: 1.0,
            },
        )
        .await
        .unwrap()
        .id
    }

    fn reported(r1: Scalar, r2: Scalar, confidence: Option<Scalar>) -> ReportedConflict {
        ReportedConflict {
            req_id_1: r1,
            req_id_2: r2,
            reason: Some("Contradictory retention periods".to_string()),
            confidence,
            cluster_id: Some(Scalar::Int(3)),
        }
    }

    #[tokio::test]
    async fn test_polling_is_bounded() {
        let h = Harness::with_config(fast_config()).await;
        let job = building_project(&h).await;
        let max = h.config.poller.max_attempts;

        for attempt in 1..max {
            let outcome = h.pipeline.poller.poll(&job, attempt).await.unwrap();
            assert!(matches!(outcome, PollOutcome::Reschedule { .. }));
        }
        let last = h.pipeline.poller.poll(&job, max).await.unwrap();

        assert_eq!(last, PollOutcome::Exhausted);
        assert_eq!(h.client.calls.lock().unwrap().job_status.len(), 20);
        let kb = h.db.get_knowledge_base(job.project_id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Ready);
        assert_eq!(kb.conflict_state.as_deref(), Some("degraded"));
    }

    #[tokio::test]
    async fn test_failed_job_after_three_polls() {
        let h = Harness::with_config(fast_config()).await;
        let job = building_project(&h).await;
        h.client.push_job_status(Ok(job_status(JobStatus::Pending)));
        h.client.push_job_status(Ok(job_status(JobStatus::Running)));
        h.client.push_job_status(Ok(JobStatusResponse {
            status: JobStatus::Failed,
            error: Some("clustering crashed".to_string()),
            ..JobStatusResponse::default()
        }));

        let mut outcomes = Vec::new();
        for attempt in 1..=3 {
            outcomes.push(h.pipeline.poller.poll(&job, attempt).await.unwrap());
        }

        assert!(matches!(outcomes[0], PollOutcome::Reschedule { .. }));
        assert!(matches!(outcomes[1], PollOutcome::Reschedule { .. }));
        assert_eq!(
            outcomes[2],
            PollOutcome::JobFailed {
                error: "clustering crashed".to_string()
            }
        );
        let kb = h.db.get_knowledge_base(job.project_id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Ready);
        assert_eq!(kb.conflict_state.as_deref(), Some("degraded"));
        assert!(kb.last_error.unwrap().contains("clustering crashed"));
    }

    #[tokio::test]
    async fn test_completed_job_saves_known_conflicts() {
        let h = Harness::new().await;
        let job = building_project(&h).await;
        let r1 = add_requirement(&h, job.project_id, "Keep logs for 7 years").await;
        let r2 = add_requirement(&h, job.project_id, "Delete logs after 30 days").await;
        h.client.push_job_status(Ok(JobStatusResponse {
            status: JobStatus::Completed,
            conflicts: Some(vec![
                reported(Scalar::Int(r1), Scalar::Text(r2.to_string()), Some(Scalar::Float(0.9))),
                reported(Scalar::Int(999), Scalar::Int(r1), None),
            ]),
            ..JobStatusResponse::default()
        }));

        let outcome = h.pipeline.poller.poll(&job, 1).await.unwrap();

        assert_eq!(outcome, PollOutcome::Resolved { conflicts_saved: 1 });
        let conflicts = h.db.list_project_conflicts(job.project_id).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!((conflicts[0].requirement_id_1, conflicts[0].requirement_id_2), (r1, r2));
        assert_eq!(conflicts[0].severity, "high");
        assert_eq!(conflicts[0].description, "Contradictory retention periods");
        assert_eq!(conflicts[0].cluster_id.as_deref(), Some("3"));

        let calls = h.client.calls.lock().unwrap();
        assert_eq!(calls.incremental.len(), 1);
        let entry = &calls.incremental[0].1[0];
        assert_eq!(entry.doc_type, "conflict");
        assert_eq!(
            entry.content,
            format!("Conflict between {} and {}: Contradictory retention periods", r1, r2)
        );
        drop(calls);

        let kb = h.db.get_knowledge_base(job.project_id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Ready);
        assert_eq!(kb.conflict_state.as_deref(), Some("complete"));
        assert!(h.reporter.progress_for(job.project_id).contains(&90));
    }

    #[tokio::test]
    async fn test_running_progress_maps_into_processing_band() {
        let h = Harness::new().await;
        let job = building_project(&h).await;
        h.client.push_job_status(Ok(JobStatusResponse {
            status: JobStatus::Running,
            progress: Some(40.0),
            ..JobStatusResponse::default()
        }));

        h.pipeline.poller.poll(&job, 1).await.unwrap();

        let kb = h.db.get_knowledge_base(job.project_id).await.unwrap().unwrap();
        assert_eq!(kb.stage, "processing_conflicts");
        assert_eq!(kb.progress, 70);
        assert_eq!(processing_progress(Some(250.0)), 85);
        assert_eq!(processing_progress(None), 60);
    }

    #[tokio::test]
    async fn test_finalize_survives_index_status_failure() {
        let h = Harness::new().await;
        let job = building_project(&h).await;
        *h.client.kb_status_response.lock().unwrap() = Err(Fail::Transient);
        h.client.push_job_status(Ok(job_status(JobStatus::Completed)));

        let outcome = h.pipeline.poller.poll(&job, 1).await.unwrap();

        assert_eq!(outcome, PollOutcome::Resolved { conflicts_saved: 0 });
        let kb = h.db.get_knowledge_base(job.project_id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Ready);
        assert!(kb.index_path.is_none());
        assert!(h.client.calls.lock().unwrap().incremental.is_empty());
    }

    #[tokio::test]
    async fn test_status_errors_reschedule_until_budget() {
        let mut config = fast_config();
        config.poller.max_attempts = 2;
        let h = Harness::with_config(config).await;
        let job = building_project(&h).await;
        h.client.push_job_status(Err(Fail::Transient));
        h.client.push_job_status(Err(Fail::Transient));

        let first = h.pipeline.poller.poll(&job, 1).await.unwrap();
        assert!(matches!(first, PollOutcome::Reschedule { .. }));

        let err = h.pipeline.poller.poll(&job, 2).await.unwrap_err();
        assert!(matches!(err, Error::PollExhausted { attempts: 2, .. }));
        let kb = h.db.get_knowledge_base(job.project_id).await.unwrap().unwrap();
        assert_eq!(kb.conflict_state.as_deref(), Some("degraded"));
    }

    #[tokio::test]
    async fn test_store_failure_while_resolving_reschedules() {
        let h = Harness::new().await;
        let job = building_project(&h).await;
        let r1 = add_requirement(&h, job.project_id, "Export as CSV").await;
        let r2 = add_requirement(&h, job.project_id, "Never export raw data").await;
        let completed = JobStatusResponse {
            status: JobStatus::Completed,
            conflicts: Some(vec![reported(Scalar::Int(r1), Scalar::Int(r2), None)]),
            ..JobStatusResponse::default()
        };
        h.client.push_job_status(Ok(completed.clone()));
        h.client.push_job_status(Ok(completed));

        sqlx::query("ALTER TABLE conflicts RENAME TO conflicts_offline")
            .execute(h.db.pool())
            .await
            .unwrap();
        let first = h.pipeline.poller.poll(&job, 1).await.unwrap();
        assert!(matches!(first, PollOutcome::Reschedule { .. }));
        let kb = h.db.get_knowledge_base(job.project_id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Building);

        sqlx::query("ALTER TABLE conflicts_offline RENAME TO conflicts")
            .execute(h.db.pool())
            .await
            .unwrap();
        let second = h.pipeline.poller.poll(&job, 2).await.unwrap();

        assert_eq!(second, PollOutcome::Resolved { conflicts_saved: 1 });
        let kb = h.db.get_knowledge_base(job.project_id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Ready);
        assert_eq!(kb.conflict_state.as_deref(), Some("complete"));
    }

    #[tokio::test]
    async fn test_store_failure_on_last_attempt_gives_up() {
        let mut config = fast_config();
        config.poller.max_attempts = 1;
        let h = Harness::with_config(config).await;
        let job = building_project(&h).await;
        h.client.push_job_status(Ok(job_status(JobStatus::Completed)));
        sqlx::query("ALTER TABLE conflicts RENAME TO conflicts_offline")
            .execute(h.db.pool())
            .await
            .unwrap();

        let err = h.pipeline.poller.poll(&job, 1).await.unwrap_err();

        assert!(matches!(err, Error::PollExhausted { attempts: 1, .. }));
        let kb = h.db.get_knowledge_base(job.project_id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Ready);
        assert_eq!(kb.conflict_state.as_deref(), Some("degraded"));
    }

    #[tokio::test]
    async fn test_poll_without_building_kb_still_saves() {
        let h = Harness::new().await;
        let project = h.db.create_project("Idle").await.unwrap();
        let r1 = add_requirement(&h, project.id, "A").await;
        let r2 = add_requirement(&h, project.id, "B").await;
        h.client.push_job_status(Ok(JobStatusResponse {
            status: JobStatus::Completed,
            conflicts: Some(vec![reported(Scalar::Int(r1), Scalar::Int(r2), None)]),
            ..JobStatusResponse::default()
        }));
        let job = PollJob {
            job_id: "conflict-job-1".to_string(),
            project_id: project.id,
        };

        let outcome = h.pipeline.poller.poll(&job, 1).await.unwrap();

        assert_eq!(outcome, PollOutcome::Resolved { conflicts_saved: 1 });
        assert!(h.db.get_knowledge_base(project.id).await.unwrap().is_none());
        assert_eq!(
            h.db.list_project_conflicts(project.id).await.unwrap()[0].severity,
            "medium"
        );
    }
}
