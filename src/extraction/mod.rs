//! Client port for the external extraction and conflict-analysis service

mod http_backend;

pub use http_backend::*;

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::meta::Severity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A JSON value the service may send as a number or a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            Scalar::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Scalar::Float(_) => None,
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// Requirement candidate as the service sends it; the text may sit under
/// any of three field names.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawCandidate {
    requirement_text: Option<String>,
    text: Option<String>,
    content: Option<String>,
    title: Option<String>,
    #[serde(alias = "type")]
    requirement_type: Option<String>,
    priority: Option<String>,
    #[serde(alias = "confidence")]
    confidence_score: Option<f64>,
}

/// Requirement candidate with its text resolved
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "RawCandidate")]
pub struct RequirementCandidate {
    /// First non-blank of `requirement_text`, `text`, `content`
    pub text: Option<String>,
    pub title: Option<String>,
    pub requirement_type: Option<String>,
    pub priority: Option<String>,
    pub confidence: Option<f64>,
}

impl From<RawCandidate> for RequirementCandidate {
    fn from(raw: RawCandidate) -> Self {
        let text = [raw.requirement_text, raw.text, raw.content]
            .into_iter()
            .flatten()
            .map(|t| t.trim().to_string())
            .find(|t| !t.is_empty());
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Self {
            text,
            title: non_blank(raw.title),
            requirement_type: non_blank(raw.requirement_type),
            priority: non_blank(raw.priority),
            confidence: raw.confidence_score,
        }
    }
}

/// Response of `extract_requirements`
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionResult {
    pub requirements: Vec<RequirementCandidate>,
    #[serde(default)]
    pub total_extracted: usize,
}

/// One entry sent to the knowledge index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbDocument {
    pub content: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

/// Response of `build_knowledge_base`
#[derive(Debug, Clone, Deserialize)]
pub struct KbBuildResponse {
    pub job_id: Option<String>,
    pub status: String,
    pub message: Option<String>,
    pub index_path: Option<String>,
    pub total_chunks: Option<i64>,
}

impl KbBuildResponse {
    /// The index exists only once the service answers `completed`
    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case("completed")
    }
}

/// Response of `get_kb_status`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KbIndexStatus {
    #[serde(default)]
    pub exists: bool,
    pub index_path: Option<String>,
    pub meta_path: Option<String>,
    pub total_chunks: Option<i64>,
    pub version: Option<i64>,
    pub error: Option<String>,
}

/// Requirement sent for conflict analysis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictCandidate {
    pub id: i64,
    pub text: String,
}

/// Response of `detect_conflicts`
#[derive(Debug, Clone, Deserialize)]
pub struct ConflictJob {
    pub job_id: String,
    #[serde(default)]
    pub status: String,
}

/// State of an external conflict job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A conflict as reported by the service
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReportedConflict {
    #[serde(alias = "requirement_id_1")]
    pub req_id_1: Scalar,
    #[serde(alias = "requirement_id_2")]
    pub req_id_2: Scalar,
    #[serde(default, alias = "conflict_description")]
    pub reason: Option<String>,
    #[serde(default)]
    pub confidence: Option<Scalar>,
    #[serde(default)]
    pub cluster_id: Option<Scalar>,
}

impl ReportedConflict {
    pub fn reason_or_default(&self) -> &str {
        self.reason
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or("No reason provided")
    }

    /// Severity from a `high`/`medium`/`low` label or a numeric confidence
    pub fn severity(&self) -> Severity {
        match &self.confidence {
            None => Severity::Medium,
            Some(Scalar::Text(label)) => label
                .parse::<Severity>()
                .ok()
                .or_else(|| label.trim().parse::<f64>().ok().map(Severity::from_score))
                .unwrap_or(Severity::Medium),
            Some(value) => value
                .as_f64()
                .map(Severity::from_score)
                .unwrap_or(Severity::Medium),
        }
    }
}

/// Response of `get_job_status`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobStatusResponse {
    #[serde(default)]
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub conflicts: Option<Vec<ReportedConflict>>,
    pub error: Option<String>,
}

/// Response of `incremental_kb_update`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncrementalUpdate {
    #[serde(default)]
    pub added_chunks: usize,
    #[serde(default)]
    pub skipped_chunks: usize,
    pub total_chunks: Option<i64>,
}

#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Turn document text into requirement candidates
    async fn extract_requirements(&self, text: &str, file_type: &str) -> Result<ExtractionResult>;

    /// Start a full index build for a project
    async fn build_knowledge_base(
        &self,
        project_id: i64,
        documents: &[KbDocument],
    ) -> Result<KbBuildResponse>;

    /// Final index metadata for a project
    async fn get_kb_status(&self, project_id: i64) -> Result<KbIndexStatus>;

    /// Start a conflict analysis job over a project's requirements
    async fn detect_conflicts(
        &self,
        project_id: i64,
        requirements: &[ConflictCandidate],
    ) -> Result<ConflictJob>;

    /// Current state of a conflict analysis job
    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusResponse>;

    /// Append entries to an existing index
    async fn incremental_kb_update(
        &self,
        project_id: i64,
        documents: &[KbDocument],
    ) -> Result<IncrementalUpdate>;
}

pub fn create_client(config: &ServiceConfig) -> Result<Arc<dyn ExtractionClient>> {
    Ok(Arc::new(HttpExtractionClient::new(config)?))
}
