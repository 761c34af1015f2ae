use super::{document_entry, requirement_entry, CascadeOutcome, ConflictCascade, KbTracker, SideEffect};
use crate::config::BuildConfig;
use crate::error::{Error, Result};
use crate::extraction::{ExtractionClient, KbDocument};
use crate::lock::DistributedLock;
use crate::meta::{ConflictState, MetaDb, Stage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const EMPTY_BUILD_ERROR: &str = "No documents with content available to build knowledge base";

/// Lock serializing builds of one project
pub fn build_lock_name(project_id: i64) -> String {
    format!("kb_build_lock_{}", project_id)
}

/// Result of one build request
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    /// Another build of the project holds the lock; nothing was touched
    AlreadyBuilding,
    /// The knowledge base was marked `failed` with this message
    Failed(String),
    Started {
        job_id: Option<String>,
        side_effects: Vec<SideEffect>,
    },
}

/// Runs full knowledge base builds, one per project at a time
#[derive(Clone)]
pub struct BuildCoordinator {
    db: MetaDb,
    client: Arc<dyn ExtractionClient>,
    lock: DistributedLock,
    cascade: ConflictCascade,
    tracker: KbTracker,
    config: BuildConfig,
}

impl BuildCoordinator {
    pub fn new(
        db: MetaDb,
        client: Arc<dyn ExtractionClient>,
        lock: DistributedLock,
        cascade: ConflictCascade,
        tracker: KbTracker,
        config: BuildConfig,
    ) -> Self {
        Self {
            db,
            client,
            lock,
            cascade,
            tracker,
            config,
        }
    }

    pub async fn build(&self, project_id: i64) -> Result<BuildOutcome> {
        if self.db.get_project(project_id).await?.is_none() {
            return Err(Error::NotFound(format!("Project {}", project_id)));
        }

        let lock_name = build_lock_name(project_id);
        let ttl = Duration::from_secs(self.config.lock_ttl_secs);
        let Some(guard) = self.lock.try_acquire(&lock_name, ttl).await? else {
            info!(project_id, "Knowledge base build already in progress");
            return Ok(BuildOutcome::AlreadyBuilding);
        };

        let result = self.build_locked(project_id).await;

        if let Err(e) = guard.release().await {
            warn!(project_id, lock = %lock_name, "Failed to release build lock: {}", e);
        }
        result
    }

    /// Settle a build whose job failed for good
    pub async fn mark_exhausted(&self, project_id: i64, error: &Error) -> Result<()> {
        if self.tracker.fail(project_id, &error.to_string()).await?.is_some() {
            warn!(project_id, "Knowledge base build failed permanently: {}", error);
        }
        Ok(())
    }

    async fn build_locked(&self, project_id: i64) -> Result<BuildOutcome> {
        self.tracker.begin(project_id).await?;

        let entries = self.collect_entries(project_id).await?;
        if entries.is_empty() {
            self.tracker.fail(project_id, EMPTY_BUILD_ERROR).await?;
            warn!(project_id, "Nothing to index");
            return Ok(BuildOutcome::Failed(EMPTY_BUILD_ERROR.to_string()));
        }

        info!(project_id, entries = entries.len(), "Building knowledge base");
        let response = match self.client.build_knowledge_base(project_id, &entries).await {
            Ok(response) => response,
            Err(e) => {
                self.tracker.fail(project_id, &e.to_string()).await?;
                return Err(e);
            }
        };

        if !response.is_completed() {
            let detail = response.message.filter(|m| !m.trim().is_empty());
            let message = match detail {
                Some(m) if response.status.eq_ignore_ascii_case("failed") => m,
                Some(m) => format!("Knowledge base build ended as '{}': {}", response.status, m),
                None => format!("Knowledge base build ended as '{}'", response.status),
            };
            self.tracker.fail(project_id, &message).await?;
            warn!(project_id, "Knowledge base build rejected: {}", message);
            return Ok(BuildOutcome::Failed(message));
        }

        if let Err(e) = self
            .db
            .record_kb_job(project_id, response.job_id.as_deref(), entries.len())
            .await
        {
            warn!(project_id, "Failed to record build job: {}", e);
        }

        self.tracker
            .advance(project_id, Stage::BuildingIndex, Stage::BuildingIndex.base_progress())
            .await?;

        let cascade = self.cascade.trigger(project_id).await;
        match &cascade {
            Ok(CascadeOutcome::Scheduled { .. }) => {}
            Ok(CascadeOutcome::Skipped(_)) => {
                self.tracker
                    .finalize_ready(project_id, ConflictState::Complete, None)
                    .await?;
            }
            Err(e) => {
                warn!(project_id, "Conflict detection could not start: {}", e);
                self.tracker
                    .finalize_ready(
                        project_id,
                        ConflictState::Degraded,
                        Some(format!("Conflict detection failed: {}", e)),
                    )
                    .await?;
            }
        }

        Ok(BuildOutcome::Started {
            job_id: response.job_id,
            side_effects: vec![CascadeOutcome::into_side_effect(cascade)],
        })
    }

    async fn collect_entries(&self, project_id: i64) -> Result<Vec<KbDocument>> {
        let documents = self.db.list_project_documents(project_id).await?;
        let requirements = self.db.list_project_requirements(project_id).await?;

        let entries = documents
            .iter()
            .filter(|d| !d.content.trim().is_empty())
            .map(document_entry)
            .chain(requirements.iter().map(requirement_entry))
            .collect();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{KbBuildResponse, KbIndexStatus};
    use crate::jobs::JobPayload;
    use crate::meta::{KbStatus, NewRequirement, Priority, RequirementType};
    use crate::testing::{Fail, Harness};

    async fn add_requirement(h: &Harness, project_id: i64, text: &str) {
        h.db.insert_manual_requirement(
            project_id,
            &NewRequirement {
                title: text.to_string(),
                text: text.to_string(),
                requirement_type: RequirementType::Functional,
                priority: Priority::Medium,
                confidence: 1.0,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_build_without_requirements_finalizes_complete() {
        let h = Harness::new().await;
        let (project, _doc) = h.project_with_document("Design notes").await;

        let outcome = h.pipeline.build.build(project.id).await.unwrap();
        assert!(matches!(outcome, BuildOutcome::Started { job_id: Some(_), .. }));

        let kb = h.db.get_knowledge_base(project.id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Ready);
        assert_eq!(kb.progress, 100);
        assert_eq!(kb.stage, "completed");
        assert_eq!(kb.version, 1);
        assert_eq!(kb.total_chunks, 7);
        assert_eq!(kb.index_path.as_deref(), Some("/indexes/project"));
        assert_eq!(kb.conflict_state.as_deref(), Some("complete"));
        assert_eq!(kb.documents_count, 1);

        let calls = h.client.calls.lock().unwrap();
        assert_eq!(calls.build.len(), 1);
        assert_eq!(calls.build[0].1[0].doc_type, "document");
    }

    #[tokio::test]
    async fn test_busy_lock_leaves_everything_untouched() {
        let h = Harness::new().await;
        let (project, _doc) = h.project_with_document("Design notes").await;
        let held = DistributedLock::new(h.db.clone())
            .try_acquire(&build_lock_name(project.id), Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();

        let outcome = h.pipeline.build.build(project.id).await.unwrap();

        assert!(matches!(outcome, BuildOutcome::AlreadyBuilding));
        assert!(h.db.get_knowledge_base(project.id).await.unwrap().is_none());
        assert!(h.client.calls.lock().unwrap().build.is_empty());
        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_builds_are_exclusive() {
        let h = Harness::new().await;
        let (project, _doc) = h.project_with_document("Design notes").await;
        *h.client.hold_build.lock().unwrap() = true;

        let first = h.pipeline.build.clone();
        let project_id = project.id;
        let running = tokio::spawn(async move { first.build(project_id).await });
        h.client.build_entered.notified().await;

        let second = h.pipeline.build.build(project.id).await.unwrap();
        assert!(matches!(second, BuildOutcome::AlreadyBuilding));

        h.client.build_release.notify_one();
        let first = running.await.unwrap().unwrap();
        assert!(matches!(first, BuildOutcome::Started { .. }));
        assert_eq!(h.client.calls.lock().unwrap().build.len(), 1);

        // The lock is free again once the first build returns
        *h.client.hold_build.lock().unwrap() = false;
        let third = h.pipeline.build.build(project.id).await.unwrap();
        assert!(matches!(third, BuildOutcome::Started { .. }));
        let kb = h.db.get_knowledge_base(project.id).await.unwrap().unwrap();
        assert_eq!(kb.version, 2);
    }

    #[tokio::test]
    async fn test_empty_project_fails_without_calling_service() {
        let h = Harness::new().await;
        let (project, _doc) = h.project_with_document("   ").await;

        let outcome = h.pipeline.build.build(project.id).await.unwrap();

        assert!(matches!(outcome, BuildOutcome::Failed(ref m) if m == EMPTY_BUILD_ERROR));
        let kb = h.db.get_knowledge_base(project.id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Failed);
        assert_eq!(kb.last_error.as_deref(), Some(EMPTY_BUILD_ERROR));
        assert!(h.client.calls.lock().unwrap().build.is_empty());
        assert!(!DistributedLock::new(h.db.clone())
            .is_held(&build_lock_name(project.id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_external_failure_marks_failed() {
        let h = Harness::new().await;
        let (project, _doc) = h.project_with_document("Design notes").await;
        *h.client.build_response.lock().unwrap() = Ok(KbBuildResponse {
            job_id: None,
            status: "failed".to_string(),
            message: Some("index store unavailable".to_string()),
            index_path: None,
            total_chunks: None,
        });

        let outcome = h.pipeline.build.build(project.id).await.unwrap();

        assert!(matches!(outcome, BuildOutcome::Failed(ref m) if m == "index store unavailable"));
        let kb = h.db.get_knowledge_base(project.id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Failed);
        assert_eq!(kb.stage, "failed");
        assert_eq!(h.reporter.last_for(project.id).unwrap().status, KbStatus::Failed);
    }

    #[tokio::test]
    async fn test_unfinished_build_is_not_ready() {
        let h = Harness::new().await;
        let (project, _doc) = h.project_with_document("Design notes").await;
        *h.client.build_response.lock().unwrap() = Ok(KbBuildResponse {
            job_id: Some("kb-job-9".to_string()),
            status: "queued".to_string(),
            message: Some("accepted".to_string()),
            index_path: None,
            total_chunks: None,
        });
        *h.client.kb_status_response.lock().unwrap() = Ok(KbIndexStatus::default());

        let outcome = h.pipeline.build.build(project.id).await.unwrap();

        assert!(matches!(outcome, BuildOutcome::Failed(ref m) if m.contains("queued")));
        let kb = h.db.get_knowledge_base(project.id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Failed);
        assert!(kb.conflict_state.is_none());
        assert_eq!(kb.version, 0);
        assert!(h.scheduler.requests.lock().unwrap().is_empty());
        assert!(!DistributedLock::new(h.db.clone())
            .is_held(&build_lock_name(project.id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_transport_error_fails_and_releases_lock() {
        let h = Harness::new().await;
        let (project, _doc) = h.project_with_document("Design notes").await;
        *h.client.build_response.lock().unwrap() = Err(Fail::Transient);

        let err = h.pipeline.build.build(project.id).await.unwrap_err();
        assert!(err.is_retryable());

        let kb = h.db.get_knowledge_base(project.id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Failed);
        assert!(!DistributedLock::new(h.db.clone())
            .is_held(&build_lock_name(project.id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cascade_scheduled_leaves_build_to_poller() {
        let h = Harness::new().await;
        let (project, _doc) = h.project_with_document("Design notes").await;
        add_requirement(&h, project.id, "Users can reset passwords").await;
        add_requirement(&h, project.id, "Passwords can never be reset").await;

        h.pipeline.build.build(project.id).await.unwrap();

        let kb = h.db.get_knowledge_base(project.id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Building);
        assert_eq!(kb.stage, "detecting_conflicts");

        let progress = h.reporter.progress_for(project.id);
        assert_eq!(progress, vec![0, 10, 50]);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        let requests = h.scheduler.requests.lock().unwrap();
        assert!(matches!(
            requests[0].payload,
            JobPayload::PollConflicts { project_id, .. } if project_id == project.id
        ));

        let calls = h.client.calls.lock().unwrap();
        let types: Vec<_> = calls.build[0].1.iter().map(|e| e.doc_type.as_str()).collect();
        assert_eq!(types, vec!["document", "requirement", "requirement"]);
    }

    #[tokio::test]
    async fn test_cascade_failure_finalizes_degraded() {
        let h = Harness::new().await;
        let (project, _doc) = h.project_with_document("Design notes").await;
        add_requirement(&h, project.id, "A").await;
        add_requirement(&h, project.id, "B").await;
        *h.client.detect_response.lock().unwrap() = Err(Fail::Transient);

        let outcome = h.pipeline.build.build(project.id).await.unwrap();

        let BuildOutcome::Started { side_effects, .. } = outcome else {
            panic!("expected started outcome");
        };
        assert!(side_effects[0].is_failed());
        let kb = h.db.get_knowledge_base(project.id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Ready);
        assert_eq!(kb.conflict_state.as_deref(), Some("degraded"));
        assert!(kb.last_error.is_some());
    }

    #[tokio::test]
    async fn test_missing_project() {
        let h = Harness::new().await;
        let err = h.pipeline.build.build(42).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_exhaustion_fails_building_kb() {
        let h = Harness::new().await;
        let (project, _doc) = h.project_with_document("Design notes").await;
        h.db.begin_kb_build(project.id).await.unwrap();

        h.pipeline
            .build
            .mark_exhausted(project.id, &Error::TransientService("timed out".to_string()))
            .await
            .unwrap();

        let kb = h.db.get_knowledge_base(project.id).await.unwrap().unwrap();
        assert_eq!(kb.get_status().unwrap(), KbStatus::Failed);
        assert!(kb.last_error.unwrap().contains("timed out"));
    }
}
