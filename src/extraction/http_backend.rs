use super::{
    ConflictCandidate, ConflictJob, ExtractionClient, ExtractionResult, IncrementalUpdate,
    JobStatusResponse, KbBuildResponse, KbDocument, KbIndexStatus,
};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

const API_KEY_HEADER: &str = "X-API-Key";
const MIN_CLUSTER_SIZE: usize = 2;
const MAX_BATCH_SIZE: usize = 30;

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    text: &'a str,
    document_type: &'a str,
}

#[derive(Debug, Serialize)]
struct BuildRequest<'a> {
    project_id: String,
    documents: &'a [KbDocument],
    mode: &'static str,
}

#[derive(Debug, Serialize)]
struct IncrementalRequest<'a> {
    project_id: String,
    documents: &'a [KbDocument],
}

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    project_id: i64,
    requirements: &'a [ConflictCandidate],
    min_cluster_size: usize,
    max_batch_size: usize,
}

/// JSON-over-HTTP adapter for [`ExtractionClient`]
pub struct HttpExtractionClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    extract_timeout: Duration,
    build_timeout: Duration,
    conflict_timeout: Duration,
}

impl HttpExtractionClient {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("Invalid service URL: {}", e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key(),
            extract_timeout: Duration::from_secs(config.extract_timeout_secs),
            build_timeout: Duration::from_secs(config.build_timeout_secs),
            conflict_timeout: Duration::from_secs(config.conflict_timeout_secs),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid service URL: {}", e)))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    /// Send and decode, mapping failures onto the retry taxonomy:
    /// network errors, 429 and 5xx are transient, other non-2xx answers are
    /// rejections, and an undecodable body is malformed.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| Error::TransientService(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TransientService(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ServiceRejected {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::TransientService(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl ExtractionClient for HttpExtractionClient {
    async fn extract_requirements(&self, text: &str, file_type: &str) -> Result<ExtractionResult> {
        let url = self.endpoint("/api/extract")?;
        debug!(chars = text.len(), file_type, "Requesting extraction");
        let request = self
            .client
            .post(url)
            .timeout(self.extract_timeout)
            .json(&ExtractRequest {
                text,
                document_type: file_type,
            });
        self.send(request).await
    }

    async fn build_knowledge_base(
        &self,
        project_id: i64,
        documents: &[KbDocument],
    ) -> Result<KbBuildResponse> {
        let url = self.endpoint("/kb/build")?;
        let request = self
            .client
            .post(url)
            .timeout(self.build_timeout)
            .json(&BuildRequest {
                project_id: project_id.to_string(),
                documents,
                mode: "sync",
            });
        self.send(request).await
    }

    async fn get_kb_status(&self, project_id: i64) -> Result<KbIndexStatus> {
        let url = self.endpoint(&format!("/kb/status/{}", project_id))?;
        self.send(self.client.get(url)).await
    }

    async fn detect_conflicts(
        &self,
        project_id: i64,
        requirements: &[ConflictCandidate],
    ) -> Result<ConflictJob> {
        let url = self.endpoint("/api/conflicts/detect")?;
        let request = self
            .client
            .post(url)
            .timeout(self.conflict_timeout)
            .json(&DetectRequest {
                project_id,
                requirements,
                min_cluster_size: MIN_CLUSTER_SIZE,
                max_batch_size: MAX_BATCH_SIZE,
            });
        self.send(request).await
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusResponse> {
        let url = self.endpoint(&format!("/api/conflicts/status/{}", job_id))?;
        self.send(self.client.get(url)).await
    }

    async fn incremental_kb_update(
        &self,
        project_id: i64,
        documents: &[KbDocument],
    ) -> Result<IncrementalUpdate> {
        let url = self.endpoint("/kb/incremental")?;
        let request = self
            .client
            .post(url)
            .timeout(self.build_timeout)
            .json(&IncrementalRequest {
                project_id: project_id.to_string(),
                documents,
            });
        self.send(request).await
    }
}
