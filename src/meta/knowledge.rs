//! Knowledge base rows and conflict records

use super::{now_ts, ConflictState, KbStatus, MetaDb};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::debug;

/// Named step of a knowledge base build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initializing,
    BuildingIndex,
    DetectingConflicts,
    ProcessingConflicts,
    SavingConflicts,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initializing => "initializing",
            Stage::BuildingIndex => "building_index",
            Stage::DetectingConflicts => "detecting_conflicts",
            Stage::ProcessingConflicts => "processing_conflicts",
            Stage::SavingConflicts => "saving_conflicts",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    /// Progress value at which the stage begins
    pub fn base_progress(&self) -> u8 {
        match self {
            Stage::Initializing => 0,
            Stage::BuildingIndex => 10,
            Stage::DetectingConflicts => 50,
            Stage::ProcessingConflicts => 60,
            Stage::SavingConflicts => 90,
            Stage::Completed => 100,
            Stage::Failed => 0,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Map a numeric confidence in `[0, 1]`
    pub fn from_score(score: f64) -> Self {
        if score >= 0.75 {
            Severity::High
        } else if score >= 0.5 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            _ => Err(Error::Validation(format!("Unknown severity: {}", s))),
        }
    }
}

/// Per-project knowledge base row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub project_id: i64,
    pub status: String,
    pub progress: i64,
    pub stage: String,
    pub index_path: Option<String>,
    pub meta_path: Option<String>,
    pub total_chunks: i64,
    pub version: i64,
    pub documents_count: i64,
    pub job_id: Option<String>,
    pub last_error: Option<String>,
    pub conflict_state: Option<String>,
    pub last_built_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl KnowledgeBase {
    pub fn get_status(&self) -> Result<KbStatus> {
        self.status.parse()
    }

    pub fn is_building(&self) -> bool {
        matches!(self.get_status(), Ok(KbStatus::Building))
    }
}

/// Final index metadata applied when a build becomes `ready`
#[derive(Debug, Clone)]
pub struct KbFinalize {
    pub index_path: Option<String>,
    pub meta_path: Option<String>,
    pub total_chunks: Option<i64>,
    pub conflict_state: ConflictState,
    /// Why conflict detection was degraded, if it was
    pub note: Option<String>,
}

impl KbFinalize {
    /// Finalize without any index metadata
    pub fn bare(conflict_state: ConflictState, note: Option<String>) -> Self {
        Self {
            index_path: None,
            meta_path: None,
            total_chunks: None,
            conflict_state,
            note,
        }
    }
}

/// A persisted conflict between two requirements
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Conflict {
    pub id: i64,
    pub project_id: i64,
    pub requirement_id_1: i64,
    pub requirement_id_2: i64,
    pub severity: String,
    pub confidence: Option<String>,
    pub description: String,
    pub cluster_id: Option<String>,
    pub resolution_status: String,
    pub detected_at: String,
}

/// A conflict ready to be inserted
#[derive(Debug, Clone)]
pub struct NewConflict {
    pub requirement_id_1: i64,
    pub requirement_id_2: i64,
    pub severity: Severity,
    pub confidence: Option<String>,
    pub description: String,
    pub cluster_id: Option<String>,
}

impl MetaDb {
    // ===== Knowledge Base Operations =====

    /// Get the knowledge base row of a project
    pub async fn get_knowledge_base(&self, project_id: i64) -> Result<Option<KnowledgeBase>> {
        let kb = sqlx::query_as::<_, KnowledgeBase>(
            "SELECT * FROM knowledge_bases WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(kb)
    }

    /// Create the row if needed and (re)enter `building` at `initializing / 0`
    pub async fn begin_kb_build(&self, project_id: i64) -> Result<KnowledgeBase> {
        let now = now_ts();
        let kb = sqlx::query_as::<_, KnowledgeBase>(
            r#"
            INSERT INTO knowledge_bases (project_id, status, progress, stage, created_at, updated_at)
            VALUES (?, 'building', 0, ?, ?, ?)
            ON CONFLICT(project_id) DO UPDATE SET
                status = 'building',
                progress = 0,
                stage = excluded.stage,
                job_id = NULL,
                last_error = NULL,
                conflict_state = NULL,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(project_id)
        .bind(Stage::Initializing.as_str())
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool())
        .await?;
        debug!(project_id, "Knowledge base build started");
        Ok(kb)
    }

    /// Record the external build job and input size
    pub async fn record_kb_job(
        &self,
        project_id: i64,
        job_id: Option<&str>,
        documents_count: usize,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE knowledge_bases SET job_id = ?, documents_count = ?, updated_at = ?
            WHERE project_id = ?
            "#,
        )
        .bind(job_id)
        .bind(documents_count as i64)
        .bind(now_ts())
        .bind(project_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Move a building knowledge base forward.
    ///
    /// Progress never decreases: a lower value leaves both progress and stage
    /// untouched. Returns the stored row, or `None` if no build is in flight.
    pub async fn advance_kb_progress(
        &self,
        project_id: i64,
        stage: Stage,
        progress: u8,
    ) -> Result<Option<KnowledgeBase>> {
        let progress = i64::from(progress.min(100));
        let kb = sqlx::query_as::<_, KnowledgeBase>(
            r#"
            UPDATE knowledge_bases SET
                stage = CASE WHEN ? >= progress THEN ? ELSE stage END,
                progress = MAX(progress, ?),
                updated_at = ?
            WHERE project_id = ? AND status = 'building'
            RETURNING *
            "#,
        )
        .bind(progress)
        .bind(stage.as_str())
        .bind(progress)
        .bind(now_ts())
        .bind(project_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(kb)
    }

    /// Transition a building knowledge base to `ready`.
    ///
    /// Returns `None` (and changes nothing) when the row is not `building`.
    pub async fn finalize_kb_ready(
        &self,
        project_id: i64,
        fin: &KbFinalize,
    ) -> Result<Option<KnowledgeBase>> {
        let now = now_ts();
        let kb = sqlx::query_as::<_, KnowledgeBase>(
            r#"
            UPDATE knowledge_bases SET
                status = 'ready',
                progress = 100,
                stage = ?,
                index_path = COALESCE(?, index_path),
                meta_path = COALESCE(?, meta_path),
                total_chunks = COALESCE(?, total_chunks),
                version = version + 1,
                job_id = NULL,
                last_error = ?,
                conflict_state = ?,
                last_built_at = ?,
                updated_at = ?
            WHERE project_id = ? AND status = 'building'
            RETURNING *
            "#,
        )
        .bind(Stage::Completed.as_str())
        .bind(&fin.index_path)
        .bind(&fin.meta_path)
        .bind(fin.total_chunks)
        .bind(&fin.note)
        .bind(fin.conflict_state.to_string())
        .bind(&now)
        .bind(&now)
        .bind(project_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(kb)
    }

    /// Transition a building knowledge base to `failed`
    pub async fn mark_kb_failed(
        &self,
        project_id: i64,
        error: &str,
    ) -> Result<Option<KnowledgeBase>> {
        let kb = sqlx::query_as::<_, KnowledgeBase>(
            r#"
            UPDATE knowledge_bases SET
                status = 'failed',
                stage = ?,
                job_id = NULL,
                last_error = ?,
                updated_at = ?
            WHERE project_id = ? AND status = 'building'
            RETURNING *
            "#,
        )
        .bind(Stage::Failed.as_str())
        .bind(error)
        .bind(now_ts())
        .bind(project_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(kb)
    }

    // ===== Conflict Operations =====

    /// Save a batch of conflicts in one transaction.
    ///
    /// Pairs are unordered: a pair already stored for the project, in either
    /// order, is refreshed in place (resolution status kept) instead of
    /// inserted again. Returns each stored row once.
    pub async fn insert_conflicts(
        &self,
        project_id: i64,
        batch: &[NewConflict],
    ) -> Result<Vec<Conflict>> {
        let mut tx = self.pool().begin().await?;
        let now = now_ts();
        let mut saved: Vec<Conflict> = Vec::with_capacity(batch.len());

        for c in batch {
            let refreshed = sqlx::query_as::<_, Conflict>(
                r#"
                UPDATE conflicts SET
                    severity = ?,
                    confidence = ?,
                    description = ?,
                    cluster_id = ?,
                    detected_at = ?
                WHERE id = (
                    SELECT id FROM conflicts
                    WHERE project_id = ?
                      AND ((requirement_id_1 = ? AND requirement_id_2 = ?)
                        OR (requirement_id_1 = ? AND requirement_id_2 = ?))
                    ORDER BY id
                    LIMIT 1
                )
                RETURNING *
                "#,
            )
            .bind(c.severity.to_string())
            .bind(&c.confidence)
            .bind(&c.description)
            .bind(&c.cluster_id)
            .bind(&now)
            .bind(project_id)
            .bind(c.requirement_id_1)
            .bind(c.requirement_id_2)
            .bind(c.requirement_id_2)
            .bind(c.requirement_id_1)
            .fetch_optional(&mut *tx)
            .await?;

            let row = match refreshed {
                Some(row) => row,
                None => {
                    sqlx::query_as::<_, Conflict>(
                        r#"
                        INSERT INTO conflicts (
                            project_id, requirement_id_1, requirement_id_2, severity, confidence,
                            description, cluster_id, resolution_status, detected_at
                        )
                        VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)
                        RETURNING *
                        "#,
                    )
                    .bind(project_id)
                    .bind(c.requirement_id_1)
                    .bind(c.requirement_id_2)
                    .bind(c.severity.to_string())
                    .bind(&c.confidence)
                    .bind(&c.description)
                    .bind(&c.cluster_id)
                    .bind(&now)
                    .fetch_one(&mut *tx)
                    .await?
                }
            };

            match saved.iter_mut().find(|s| s.id == row.id) {
                Some(existing) => *existing = row,
                None => saved.push(row),
            }
        }

        tx.commit().await?;
        Ok(saved)
    }

    /// List a project's conflicts
    pub async fn list_project_conflicts(&self, project_id: i64) -> Result<Vec<Conflict>> {
        let conflicts = sqlx::query_as::<_, Conflict>(
            "SELECT * FROM conflicts WHERE project_id = ? ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;
        Ok(conflicts)
    }
}
