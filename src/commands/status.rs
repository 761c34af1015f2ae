//! Status command implementation

use crate::error::{Error, Result};
use crate::meta::{KnowledgeBase, MetaDb, Project, ProjectStats};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Document as listed by `status` (content omitted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: i64,
    pub filename: String,
    pub file_type: String,
    pub status: String,
    pub processed_at: Option<String>,
}

/// Status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub project: Project,
    pub stats: ProjectStats,
    pub knowledge_base: Option<KnowledgeBase>,
    pub documents: Vec<DocumentSummary>,
}

/// Get a project's status
pub async fn cmd_status(db: &MetaDb, project_id: i64) -> Result<StatusInfo> {
    info!(project_id, "Getting status");

    let project = db
        .get_project(project_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Project {}", project_id)))?;

    let documents = db
        .list_project_documents(project_id)
        .await?
        .into_iter()
        .map(|d| DocumentSummary {
            id: d.id,
            filename: d.filename,
            file_type: d.file_type,
            status: d.status,
            processed_at: d.processed_at,
        })
        .collect();

    Ok(StatusInfo {
        stats: db.get_project_stats(project_id).await?,
        knowledge_base: db.get_knowledge_base(project_id).await?,
        project,
        documents,
    })
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 Project {}: {}\n", status.project.id, status.project.name);

    let stats = &status.stats;
    println!("Documents:");
    println!("  Uploaded: {}", stats.documents_uploaded);
    println!("  Processing: {}", stats.documents_processing);
    println!("  Processed: {}", stats.documents_processed);
    println!("  Failed: {}", stats.documents_failed);
    println!("\nRequirements: {}", stats.requirement_count);
    println!("Conflicts: {}", stats.conflict_count);

    println!("\nKnowledge Base:");
    match &status.knowledge_base {
        Some(kb) => {
            println!("  Status: {} ({}, {}%)", kb.status, kb.stage, kb.progress);
            println!("  Version: {}", kb.version);
            println!("  Chunks: {}", kb.total_chunks);
            if let Some(state) = &kb.conflict_state {
                println!("  Conflict detection: {}", state);
            }
            if let Some(at) = &kb.last_built_at {
                println!("  Last built: {}", at);
            }
            if let Some(err) = &kb.last_error {
                println!("  Last error: {}", err);
            }
        }
        None => println!("  Not built yet. Run 'reqflow build {}'.", status.project.id),
    }

    if !status.documents.is_empty() {
        println!("\nDocuments:");
        for doc in &status.documents {
            println!("  • [{}] {} ({}) {}", doc.id, doc.filename, doc.file_type, doc.status);
        }
    }
}
