//! Metadata storage using SQLite
//!
//! This module handles all persisted pipeline state:
//! - Projects and their uploaded documents
//! - Requirements (extracted per document, or manual)
//! - Knowledge base rows (one per project, status + progress)
//! - Conflicts reported by the analysis service
//!
//! The `locks` and `jobs` tables share the same pool and are driven by
//! [`crate::lock`] and [`crate::jobs`].

mod knowledge;
mod requirements;
mod schema;

pub use knowledge::*;
pub use requirements::*;
pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Current time as an RFC 3339 UTC string with millisecond precision.
///
/// All timestamps share this format so they compare correctly as text.
pub fn now_ts() -> String {
    format_ts(Utc::now())
}

/// Format a timestamp the way it is stored
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Timestamp `delay` from now, in storage format
pub fn ts_after(delay: Duration) -> String {
    let delta = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    format_ts(Utc::now() + delta)
}

/// Document processing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Processed,
    Failed,
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentStatus::Uploaded => write!(f, "uploaded"),
            DocumentStatus::Processing => write!(f, "processing"),
            DocumentStatus::Processed => write!(f, "processed"),
            DocumentStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "uploaded" => Ok(DocumentStatus::Uploaded),
            "processing" => Ok(DocumentStatus::Processing),
            "processed" => Ok(DocumentStatus::Processed),
            "failed" => Ok(DocumentStatus::Failed),
            _ => Err(Error::Validation(format!("Unknown document status: {}", s))),
        }
    }
}

/// Knowledge base lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KbStatus {
    Building,
    Ready,
    Failed,
}

impl std::fmt::Display for KbStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KbStatus::Building => write!(f, "building"),
            KbStatus::Ready => write!(f, "ready"),
            KbStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for KbStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "building" => Ok(KbStatus::Building),
            "ready" => Ok(KbStatus::Ready),
            "failed" => Ok(KbStatus::Failed),
            _ => Err(Error::Validation(format!("Unknown knowledge base status: {}", s))),
        }
    }
}

/// Whether conflict detection fully succeeded for a ready knowledge base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictState {
    Complete,
    Degraded,
}

impl std::fmt::Display for ConflictState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictState::Complete => write!(f, "complete"),
            ConflictState::Degraded => write!(f, "degraded"),
        }
    }
}

impl FromStr for ConflictState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "complete" => Ok(ConflictState::Complete),
            "degraded" => Ok(ConflictState::Degraded),
            _ => Err(Error::Validation(format!("Unknown conflict state: {}", s))),
        }
    }
}

/// A project
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

/// An uploaded document
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub project_id: i64,
    pub filename: String,
    pub content: String,
    pub file_type: String,
    pub status: String,
    pub content_hash: Option<String>,
    pub processed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Document {
    pub fn get_status(&self) -> Result<DocumentStatus> {
        self.status.parse()
    }
}

/// Document counts by status for one project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectStats {
    pub documents_uploaded: usize,
    pub documents_processing: usize,
    pub documents_processed: usize,
    pub documents_failed: usize,
    pub requirement_count: usize,
    pub conflict_count: usize,
}

/// Metadata database handle
#[derive(Clone)]
pub struct MetaDb {
    pool: SqlitePool,
}

impl MetaDb {
    /// Connect to the metadata database
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::new(&config.paths.db_file).await
    }

    /// Connect to a database file directly, creating the schema if needed
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };

        if !db.is_initialized().await? {
            db.init_schema().await?;
        }

        Ok(db)
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='jobs'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ===== Project Operations =====

    /// Create a project
    pub async fn create_project(&self, name: &str) -> Result<Project> {
        let project = sqlx::query_as::<_, Project>(
            "INSERT INTO projects (name, created_at) VALUES (?, ?) RETURNING *",
        )
        .bind(name)
        .bind(now_ts())
        .fetch_one(&self.pool)
        .await?;
        Ok(project)
    }

    /// Get project by ID
    pub async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(project)
    }

    /// List all projects
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(projects)
    }

    // ===== Document Operations =====

    /// Register an uploaded document in `uploaded` state
    pub async fn insert_document(
        &self,
        project_id: i64,
        filename: &str,
        content: &str,
        file_type: &str,
    ) -> Result<Document> {
        let now = now_ts();
        let doc = sqlx::query_as::<_, Document>(
            r#"
            INSERT INTO documents (project_id, filename, content, file_type, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(project_id)
        .bind(filename)
        .bind(content)
        .bind(file_type)
        .bind(DocumentStatus::Uploaded.to_string())
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        Ok(doc)
    }

    /// Get document by ID
    pub async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let doc = sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(doc)
    }

    /// List documents for a project
    pub async fn list_project_documents(&self, project_id: i64) -> Result<Vec<Document>> {
        let docs = sqlx::query_as::<_, Document>(
            "SELECT * FROM documents WHERE project_id = ? ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(docs)
    }

    /// Move a document to a new status
    pub async fn set_document_status(&self, id: i64, status: DocumentStatus) -> Result<()> {
        let now = now_ts();
        let processed_at = (status == DocumentStatus::Processed).then(|| now.clone());
        sqlx::query(
            r#"
            UPDATE documents SET
                status = ?,
                processed_at = COALESCE(?, processed_at),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(processed_at)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        debug!(document_id = id, status = %status, "Document status updated");
        Ok(())
    }

    /// Move a document to `processing`, recording the fingerprint of the content being extracted
    pub async fn mark_document_processing(&self, id: i64, content_hash: &str) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = ?, content_hash = ?, updated_at = ? WHERE id = ?",
        )
        .bind(DocumentStatus::Processing.to_string())
        .bind(content_hash)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        debug!(document_id = id, "Document processing");
        Ok(())
    }

    // ===== Statistics =====

    /// Get per-project statistics
    pub async fn get_project_stats(&self, project_id: i64) -> Result<ProjectStats> {
        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM documents WHERE project_id = ? GROUP BY status",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = ProjectStats::default();
        for (status, count) in by_status {
            let count = count as usize;
            match status.parse::<DocumentStatus>() {
                Ok(DocumentStatus::Uploaded) => stats.documents_uploaded = count,
                Ok(DocumentStatus::Processing) => stats.documents_processing = count,
                Ok(DocumentStatus::Processed) => stats.documents_processed = count,
                Ok(DocumentStatus::Failed) => stats.documents_failed = count,
                Err(_) => {}
            }
        }

        let requirement_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM requirements WHERE project_id = ?")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;

        let conflict_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conflicts WHERE project_id = ?")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;

        stats.requirement_count = requirement_count as usize;
        stats.conflict_count = conflict_count as usize;
        Ok(stats)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn setup_test_db() -> (MetaDb, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = MetaDb::new(&tmp.path().join("test.db")).await.unwrap();
        (db, tmp)
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let (db, _tmp) = setup_test_db().await;
        assert!(db.is_initialized().await.unwrap());
        db.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_document_lifecycle() {
        let (db, _tmp) = setup_test_db().await;
        let project = db.create_project("Payments").await.unwrap();

        let doc = db
            .insert_document(project.id, "spec.txt", "The system shall log in.", "txt")
            .await
            .unwrap();
        assert_eq!(doc.get_status().unwrap(), DocumentStatus::Uploaded);
        assert!(doc.processed_at.is_none());

        db.mark_document_processing(doc.id, "abc123").await.unwrap();
        let loaded = db.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.get_status().unwrap(), DocumentStatus::Processing);
        assert_eq!(loaded.content_hash.as_deref(), Some("abc123"));

        db.set_document_status(doc.id, DocumentStatus::Processed)
            .await
            .unwrap();
        let loaded = db.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.get_status().unwrap(), DocumentStatus::Processed);
        assert!(loaded.processed_at.is_some());

        let stats = db.get_project_stats(project.id).await.unwrap();
        assert_eq!(stats.documents_processed, 1);
        assert_eq!(stats.documents_uploaded, 0);
    }

    #[tokio::test]
    async fn test_missing_rows_are_none() {
        let (db, _tmp) = setup_test_db().await;
        assert!(db.get_project(42).await.unwrap().is_none());
        assert!(db.get_document(42).await.unwrap().is_none());
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = format_ts(Utc::now());
        let later = ts_after(Duration::from_secs(2));
        assert!(earlier < later);
        assert!(earlier.ends_with('Z'));
    }
}
