//! Document-to-knowledge pipeline
//!
//! - [`IngestionCoordinator`]: one document through extraction into requirements
//! - [`BuildCoordinator`]: one project's full knowledge base build, under a lock
//! - [`ConflictPoller`]: drives an external conflict job to a terminal state
//! - [`ConflictCascade`]: starts conflict analysis and schedules the poller
//!
//! [`Pipeline`] wires them together and executes scheduled jobs.

mod build;
mod cascade;
mod ingest;
mod poller;

pub use build::*;
pub use cascade::*;
pub use ingest::*;
pub use poller::*;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extraction::{ExtractionClient, KbDocument};
use crate::jobs::{JobHandler, JobOutcome, JobPayload, Scheduler};
use crate::lock::DistributedLock;
use crate::meta::{
    ConflictState, Document, KbFinalize, KnowledgeBase, MetaDb, Requirement, Stage,
};
use crate::progress::{ProgressReporter, ProgressUpdate};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Result of a best-effort step that must never undo the primary outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffectStatus {
    Applied(String),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffect {
    pub name: &'static str,
    pub status: SideEffectStatus,
}

impl SideEffect {
    pub fn applied(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: SideEffectStatus::Applied(detail.into()),
        }
    }

    pub fn skipped(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            status: SideEffectStatus::Skipped(reason.into()),
        }
    }

    pub fn failed(name: &'static str, error: &Error) -> Self {
        Self {
            name,
            status: SideEffectStatus::Failed(error.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, SideEffectStatus::Failed(_))
    }
}

/// Knowledge base transitions, each published to the progress reporter.
///
/// Clones share one ordering lock: a row write and the publish of its
/// snapshot happen under it, so updates leave in commit order.
#[derive(Clone)]
pub struct KbTracker {
    db: MetaDb,
    client: Arc<dyn ExtractionClient>,
    reporter: Arc<dyn ProgressReporter>,
    ordering: Arc<Mutex<()>>,
}

impl KbTracker {
    pub fn new(
        db: MetaDb,
        client: Arc<dyn ExtractionClient>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            db,
            client,
            reporter,
            ordering: Arc::new(Mutex::new(())),
        }
    }

    fn publish(&self, kb: Option<&KnowledgeBase>) {
        if let Some(update) = kb.and_then(ProgressUpdate::from_kb) {
            self.reporter.publish(&update);
        }
    }

    /// Create or restart the row at `initializing / 0`
    pub async fn begin(&self, project_id: i64) -> Result<KnowledgeBase> {
        let _order = self.ordering.lock().await;
        let kb = self.db.begin_kb_build(project_id).await?;
        self.publish(Some(&kb));
        Ok(kb)
    }

    /// Move a building row forward; publishes the stored (never lower) value
    pub async fn advance(
        &self,
        project_id: i64,
        stage: Stage,
        progress: u8,
    ) -> Result<Option<KnowledgeBase>> {
        let _order = self.ordering.lock().await;
        let kb = self.db.advance_kb_progress(project_id, stage, progress).await?;
        self.publish(kb.as_ref());
        Ok(kb)
    }

    /// Finalize a building row to `ready`.
    ///
    /// Index metadata is fetched best-effort; a failed fetch still finalizes
    /// with whatever the row already holds. Does nothing when no build is in
    /// flight.
    pub async fn finalize_ready(
        &self,
        project_id: i64,
        conflict_state: ConflictState,
        note: Option<String>,
    ) -> Result<Option<KnowledgeBase>> {
        match self.db.get_knowledge_base(project_id).await? {
            Some(kb) if kb.is_building() => {}
            _ => return Ok(None),
        }

        let fin = match self.client.get_kb_status(project_id).await {
            Ok(status) => KbFinalize {
                index_path: status.index_path,
                meta_path: status.meta_path,
                total_chunks: status.total_chunks,
                conflict_state,
                note,
            },
            Err(e) => {
                warn!(project_id, "Could not fetch index metadata, finalizing without it: {}", e);
                KbFinalize::bare(conflict_state, note)
            }
        };

        let _order = self.ordering.lock().await;
        let kb = self.db.finalize_kb_ready(project_id, &fin).await?;
        if let Some(kb) = &kb {
            info!(
                project_id,
                version = kb.version,
                conflict_state = %conflict_state,
                "Knowledge base ready"
            );
        }
        self.publish(kb.as_ref());
        Ok(kb)
    }

    /// Transition a building row to `failed`
    pub async fn fail(&self, project_id: i64, error: &str) -> Result<Option<KnowledgeBase>> {
        let _order = self.ordering.lock().await;
        let kb = self.db.mark_kb_failed(project_id, error).await?;
        self.publish(kb.as_ref());
        Ok(kb)
    }
}

fn meta_map(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Index entry for a whole document
pub fn document_entry(doc: &Document) -> KbDocument {
    KbDocument {
        content: doc.content.clone(),
        doc_type: "document".to_string(),
        meta: meta_map([
            ("document_id", Value::from(doc.id)),
            ("filename", Value::from(doc.filename.clone())),
            ("file_type", Value::from(doc.file_type.clone())),
            ("uploaded_at", Value::from(doc.created_at.clone())),
        ]),
    }
}

/// Index entry for one requirement
pub fn requirement_entry(req: &Requirement) -> KbDocument {
    KbDocument {
        content: format!(
            "Requirement: {}\nType: {}\nPriority: {}",
            req.requirement_text, req.requirement_type, req.priority
        ),
        doc_type: "requirement".to_string(),
        meta: meta_map([
            ("requirement_id", Value::from(req.id)),
            ("document_id", Value::from(req.document_id)),
            ("project_id", Value::from(req.project_id)),
            ("confidence_score", Value::from(req.confidence_score)),
            ("requirement_type", Value::from(req.requirement_type.clone())),
            ("priority", Value::from(req.priority.clone())),
            ("requirement_number", Value::from(req.requirement_number)),
        ]),
    }
}

/// Everything the coordinators share
#[derive(Clone)]
pub struct PipelineDeps {
    pub db: MetaDb,
    pub client: Arc<dyn ExtractionClient>,
    pub scheduler: Arc<dyn Scheduler>,
    pub reporter: Arc<dyn ProgressReporter>,
}

/// All coordinators, dispatching scheduled jobs
pub struct Pipeline {
    pub ingest: IngestionCoordinator,
    pub build: BuildCoordinator,
    pub poller: ConflictPoller,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps, config: &Config) -> Self {
        let tracker = KbTracker::new(deps.db.clone(), deps.client.clone(), deps.reporter.clone());
        let cascade = ConflictCascade::new(
            deps.db.clone(),
            deps.client.clone(),
            deps.scheduler.clone(),
            tracker.clone(),
            config.poller.cascade_delay(),
        );
        Self {
            ingest: IngestionCoordinator::new(
                deps.db.clone(),
                deps.client.clone(),
                cascade.clone(),
                config.ingest.clone(),
            ),
            build: BuildCoordinator::new(
                deps.db.clone(),
                deps.client.clone(),
                DistributedLock::new(deps.db.clone()),
                cascade,
                tracker.clone(),
                config.build.clone(),
            ),
            poller: ConflictPoller::new(deps.db, deps.client, tracker, config.poller.clone()),
        }
    }
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn handle(&self, payload: &JobPayload, attempt: u32) -> Result<JobOutcome> {
        match payload {
            JobPayload::ProcessDocument { document_id } => {
                match self.ingest.process(*document_id).await? {
                    IngestOutcome::Rejected(reason) => Err(Error::Validation(reason)),
                    _ => Ok(JobOutcome::Completed),
                }
            }
            JobPayload::BuildKnowledgeBase { project_id } => {
                self.build.build(*project_id).await?;
                Ok(JobOutcome::Completed)
            }
            JobPayload::PollConflicts { job_id, project_id } => {
                let job = PollJob {
                    job_id: job_id.clone(),
                    project_id: *project_id,
                };
                match self.poller.poll(&job, attempt).await? {
                    PollOutcome::Reschedule { delay } => Ok(JobOutcome::Reschedule(delay)),
                    _ => Ok(JobOutcome::Completed),
                }
            }
        }
    }

    async fn on_exhausted(&self, payload: &JobPayload, error: &Error) {
        let result = match payload {
            JobPayload::ProcessDocument { document_id } => {
                self.ingest.mark_exhausted(*document_id, error).await
            }
            JobPayload::BuildKnowledgeBase { project_id } => {
                self.build.mark_exhausted(*project_id, error).await
            }
            JobPayload::PollConflicts { job_id, project_id } => {
                let job = PollJob {
                    job_id: job_id.clone(),
                    project_id: *project_id,
                };
                self.poller.mark_exhausted(&job, error).await
            }
        };
        if let Err(e) = result {
            warn!(kind = %payload.kind(), "Failed to settle exhausted job: {}", e);
        }
    }
}
