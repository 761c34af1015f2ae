//! Fakes shared by coordinator tests

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extraction::{
    ConflictCandidate, ConflictJob, ExtractionClient, ExtractionResult, IncrementalUpdate,
    JobStatus, JobStatusResponse, KbBuildResponse, KbDocument, KbIndexStatus,
    RequirementCandidate,
};
use crate::jobs::{Enqueued, JobRequest, Scheduler};
use crate::meta::{Document, MetaDb, Project};
use crate::pipeline::{Pipeline, PipelineDeps};
use crate::progress::{ProgressReporter, ProgressUpdate};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Failure a scripted call should produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fail {
    Malformed,
    Transient,
    Rejected,
}

impl Fail {
    fn into_error(self) -> Error {
        match self {
            Fail::Malformed => Error::MalformedResponse("expected value at line 1".to_string()),
            Fail::Transient => Error::TransientService("connection refused".to_string()),
            Fail::Rejected => Error::ServiceRejected {
                status: 422,
                body: "unprocessable".to_string(),
            },
        }
    }
}

type Scripted<T> = std::result::Result<T, Fail>;

fn answer<T>(scripted: Scripted<T>) -> Result<T> {
    scripted.map_err(Fail::into_error)
}

pub fn candidate(text: &str) -> RequirementCandidate {
    RequirementCandidate {
        text: Some(text.to_string()),
        ..RequirementCandidate::default()
    }
}

pub fn extraction(candidates: Vec<RequirementCandidate>) -> ExtractionResult {
    ExtractionResult {
        total_extracted: candidates.len(),
        requirements: candidates,
    }
}

pub fn job_status(status: JobStatus) -> JobStatusResponse {
    JobStatusResponse {
        status,
        ..JobStatusResponse::default()
    }
}

/// Every call the fake client received
#[derive(Debug, Default)]
pub struct Calls {
    pub extract: Vec<(String, String)>,
    pub build: Vec<(i64, Vec<KbDocument>)>,
    pub kb_status: Vec<i64>,
    pub detect: Vec<(i64, Vec<ConflictCandidate>)>,
    pub job_status: Vec<String>,
    pub incremental: Vec<(i64, Vec<KbDocument>)>,
}

/// Extraction client answering from scripts
pub struct ScriptedClient {
    pub calls: Mutex<Calls>,
    extract: Mutex<VecDeque<Scripted<ExtractionResult>>>,
    job_statuses: Mutex<VecDeque<Scripted<JobStatusResponse>>>,
    pub idle_job_status: Mutex<JobStatusResponse>,
    pub build_response: Mutex<Scripted<KbBuildResponse>>,
    pub kb_status_response: Mutex<Scripted<KbIndexStatus>>,
    pub detect_response: Mutex<Scripted<ConflictJob>>,
    pub incremental_response: Mutex<Scripted<IncrementalUpdate>>,
    /// When set, `build_knowledge_base` signals `build_entered` then waits for `build_release`
    pub hold_build: Mutex<bool>,
    pub build_entered: Notify,
    pub build_release: Notify,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Calls::default()),
            extract: Mutex::new(VecDeque::new()),
            job_statuses: Mutex::new(VecDeque::new()),
            idle_job_status: Mutex::new(job_status(JobStatus::Pending)),
            build_response: Mutex::new(Ok(KbBuildResponse {
                job_id: Some("kb-job-1".to_string()),
                status: "completed".to_string(),
                message: None,
                index_path: None,
                total_chunks: None,
            })),
            kb_status_response: Mutex::new(Ok(KbIndexStatus {
                exists: true,
                index_path: Some("/indexes/project".to_string()),
                meta_path: Some("/indexes/project.meta".to_string()),
                total_chunks: Some(7),
                version: Some(1),
                error: None,
            })),
            detect_response: Mutex::new(Ok(ConflictJob {
                job_id: "conflict-job-1".to_string(),
                status: "pending".to_string(),
            })),
            incremental_response: Mutex::new(Ok(IncrementalUpdate {
                added_chunks: 1,
                skipped_chunks: 0,
                total_chunks: Some(1),
            })),
            hold_build: Mutex::new(false),
            build_entered: Notify::new(),
            build_release: Notify::new(),
        }
    }
}

impl ScriptedClient {
    pub fn push_extract(&self, response: Scripted<ExtractionResult>) {
        self.extract.lock().unwrap().push_back(response);
    }

    pub fn push_job_status(&self, response: Scripted<JobStatusResponse>) {
        self.job_statuses.lock().unwrap().push_back(response);
    }
}

#[async_trait]
impl ExtractionClient for ScriptedClient {
    async fn extract_requirements(&self, text: &str, file_type: &str) -> Result<ExtractionResult> {
        self.calls
            .lock()
            .unwrap()
            .extract
            .push((text.to_string(), file_type.to_string()));
        let next = self.extract.lock().unwrap().pop_front();
        answer(next.unwrap_or_else(|| Ok(extraction(Vec::new()))))
    }

    async fn build_knowledge_base(
        &self,
        project_id: i64,
        documents: &[KbDocument],
    ) -> Result<KbBuildResponse> {
        self.calls
            .lock()
            .unwrap()
            .build
            .push((project_id, documents.to_vec()));
        let hold = *self.hold_build.lock().unwrap();
        if hold {
            self.build_entered.notify_one();
            self.build_release.notified().await;
        }
        answer(self.build_response.lock().unwrap().clone())
    }

    async fn get_kb_status(&self, project_id: i64) -> Result<KbIndexStatus> {
        self.calls.lock().unwrap().kb_status.push(project_id);
        answer(self.kb_status_response.lock().unwrap().clone())
    }

    async fn detect_conflicts(
        &self,
        project_id: i64,
        requirements: &[ConflictCandidate],
    ) -> Result<ConflictJob> {
        self.calls
            .lock()
            .unwrap()
            .detect
            .push((project_id, requirements.to_vec()));
        answer(self.detect_response.lock().unwrap().clone())
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusResponse> {
        self.calls.lock().unwrap().job_status.push(job_id.to_string());
        let next = self.job_statuses.lock().unwrap().pop_front();
        answer(next.unwrap_or_else(|| Ok(self.idle_job_status.lock().unwrap().clone())))
    }

    async fn incremental_kb_update(
        &self,
        project_id: i64,
        documents: &[KbDocument],
    ) -> Result<IncrementalUpdate> {
        self.calls
            .lock()
            .unwrap()
            .incremental
            .push((project_id, documents.to_vec()));
        answer(self.incremental_response.lock().unwrap().clone())
    }
}

/// Reporter keeping every update
#[derive(Default)]
pub struct RecordingReporter {
    pub updates: Mutex<Vec<ProgressUpdate>>,
}

impl RecordingReporter {
    pub fn progress_for(&self, project_id: i64) -> Vec<u8> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.project_id == project_id)
            .map(|u| u.progress)
            .collect()
    }

    pub fn last_for(&self, project_id: i64) -> Option<ProgressUpdate> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|u| u.project_id == project_id)
            .cloned()
    }
}

impl ProgressReporter for RecordingReporter {
    fn publish(&self, update: &ProgressUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }
}

/// Scheduler that accepts everything and remembers it
#[derive(Default)]
pub struct RecordingScheduler {
    pub requests: Mutex<Vec<JobRequest>>,
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn schedule(&self, request: JobRequest) -> Result<Enqueued> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        Ok(Enqueued::Accepted(format!("job-{}", requests.len())))
    }
}

/// Config with no real waiting
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.poller.delay_secs = 0;
    config.poller.cascade_delay_secs = 0;
    config.ingest.backoff_secs = vec![0];
    config.worker.idle_poll_ms = 10;
    config.worker.concurrency = 2;
    config
}

/// A pipeline over a throwaway database and scripted collaborators
pub struct Harness {
    pub db: MetaDb,
    pub client: Arc<ScriptedClient>,
    pub scheduler: Arc<RecordingScheduler>,
    pub reporter: Arc<RecordingReporter>,
    pub config: Config,
    pub pipeline: Pipeline,
    _tmp: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let tmp = TempDir::new().unwrap();
        let db = MetaDb::new(&tmp.path().join("test.db")).await.unwrap();
        let client = Arc::new(ScriptedClient::default());
        let scheduler = Arc::new(RecordingScheduler::default());
        let reporter = Arc::new(RecordingReporter::default());
        let deps = PipelineDeps {
            db: db.clone(),
            client: client.clone(),
            scheduler: scheduler.clone(),
            reporter: reporter.clone(),
        };
        let pipeline = Pipeline::new(deps, &config);
        Self {
            db,
            client,
            scheduler,
            reporter,
            config,
            pipeline,
            _tmp: tmp,
        }
    }

    pub async fn project_with_document(&self, content: &str) -> (Project, Document) {
        let project = self.db.create_project("Test project").await.unwrap();
        let doc = self
            .db
            .insert_document(project.id, "notes.txt", content, "txt")
            .await
            .unwrap();
        (project, doc)
    }
}
