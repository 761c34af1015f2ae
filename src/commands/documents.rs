//! Document upload and inline processing

use super::Runtime;
use crate::error::{Error, Result};
use crate::jobs::{Enqueued, JobPayload, JobRequest, Scheduler};
use crate::pipeline::{IngestOutcome, IngestSkip, SideEffectStatus};
use serde::Serialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub document_id: i64,
    pub project_id: i64,
    pub filename: String,
    pub file_type: String,
    pub chars: usize,
    pub job: Enqueued,
}

/// Register a plain-text file as a document and enqueue its processing
pub async fn cmd_upload(
    rt: &Runtime,
    project_id: i64,
    path: &Path,
    file_type: Option<String>,
) -> Result<UploadReport> {
    if rt.db.get_project(project_id).await?.is_none() {
        return Err(Error::NotFound(format!("Project {}", project_id)));
    }

    let content = std::fs::read_to_string(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let file_type = file_type
        .or_else(|| {
            path.extension()
                .map(|e| e.to_string_lossy().to_lowercase())
        })
        .unwrap_or_else(|| "txt".to_string());

    let doc = rt
        .db
        .insert_document(project_id, &filename, &content, &file_type)
        .await?;
    let job = rt
        .queue
        .schedule(JobRequest::now(JobPayload::ProcessDocument {
            document_id: doc.id,
        }))
        .await?;
    info!(document_id = doc.id, project_id, "Uploaded {}", filename);

    Ok(UploadReport {
        document_id: doc.id,
        project_id,
        filename,
        file_type,
        chars: content.chars().count(),
        job,
    })
}

pub fn print_upload(report: &UploadReport) {
    println!(
        "✓ Uploaded {} as document {} ({} chars, {})",
        report.filename, report.document_id, report.chars, report.file_type
    );
    match &report.job {
        Enqueued::Accepted(id) => println!("  Processing queued as job {}", id),
        Enqueued::Deduplicated => println!("  Processing already queued"),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub document_id: i64,
    pub result: String,
    pub requirements: usize,
    pub side_effects: Vec<(String, String)>,
}

/// Process one document in the foreground, bypassing the queue
pub async fn cmd_process(rt: &Runtime, document_id: i64) -> Result<ProcessReport> {
    let outcome = rt.pipeline.ingest.process(document_id).await?;

    let report = match outcome {
        IngestOutcome::Skipped(IngestSkip::DocumentMissing) => {
            return Err(Error::NotFound(format!("Document {}", document_id)));
        }
        IngestOutcome::Skipped(IngestSkip::AlreadyProcessed) => ProcessReport {
            document_id,
            result: "already processed".to_string(),
            requirements: 0,
            side_effects: Vec::new(),
        },
        IngestOutcome::Rejected(reason) => ProcessReport {
            document_id,
            result: format!("rejected: {}", reason),
            requirements: 0,
            side_effects: Vec::new(),
        },
        IngestOutcome::Processed {
            requirements,
            status,
            side_effects,
        } => ProcessReport {
            document_id,
            result: status.to_string(),
            requirements: requirements.len(),
            side_effects: side_effects
                .into_iter()
                .map(|e| {
                    let status = match e.status {
                        SideEffectStatus::Applied(d) => format!("applied ({})", d),
                        SideEffectStatus::Skipped(r) => format!("skipped ({})", r),
                        SideEffectStatus::Failed(err) => format!("failed ({})", err),
                    };
                    (e.name.to_string(), status)
                })
                .collect(),
        },
    };
    Ok(report)
}

pub fn print_process(report: &ProcessReport) {
    println!("Document {}: {}", report.document_id, report.result);
    if report.requirements > 0 {
        println!("  Requirements saved: {}", report.requirements);
    }
    for (name, status) in &report.side_effects {
        println!("  {}: {}", name, status);
    }
}
