//! Requirement records and their replace-on-reprocess transaction

use super::{now_ts, MetaDb};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::debug;

/// Requirement category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequirementType {
    Functional,
    NonFunctional,
    Constraint,
}

impl std::fmt::Display for RequirementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequirementType::Functional => write!(f, "functional"),
            RequirementType::NonFunctional => write!(f, "non-functional"),
            RequirementType::Constraint => write!(f, "constraint"),
        }
    }
}

impl FromStr for RequirementType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "functional" => Ok(RequirementType::Functional),
            "non-functional" | "nonfunctional" => Ok(RequirementType::NonFunctional),
            "constraint" => Ok(RequirementType::Constraint),
            _ => Err(Error::Validation(format!("Unknown requirement type: {}", s))),
        }
    }
}

/// Requirement priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            _ => Err(Error::Validation(format!("Unknown priority: {}", s))),
        }
    }
}

/// Where a requirement came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequirementSource {
    Extracted,
    Manual,
}

impl std::fmt::Display for RequirementSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequirementSource::Extracted => write!(f, "extracted"),
            RequirementSource::Manual => write!(f, "manual"),
        }
    }
}

/// A persisted requirement
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Requirement {
    pub id: i64,
    pub project_id: i64,
    pub document_id: Option<i64>,
    pub requirement_number: i64,
    pub title: String,
    pub requirement_text: String,
    pub requirement_type: String,
    pub priority: String,
    pub confidence_score: Option<f64>,
    pub source: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A requirement ready to be inserted
#[derive(Debug, Clone)]
pub struct NewRequirement {
    pub title: String,
    pub text: String,
    pub requirement_type: RequirementType,
    pub priority: Priority,
    pub confidence: f64,
}

const INSERT_REQUIREMENT_SQL: &str = r#"
    INSERT INTO requirements (
        project_id, document_id, requirement_number, title, requirement_text,
        requirement_type, priority, confidence_score, source, status, created_at, updated_at
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'draft', ?, ?)
    RETURNING *
"#;

impl MetaDb {
    // ===== Requirement Operations =====

    /// Atomically replace the extracted requirement set of one document.
    ///
    /// Deletes the previous `(document, extracted)` rows (and conflicts that
    /// referenced them), renumbers the project's remaining requirements 1..N,
    /// then inserts the new batch numbered after the current maximum.
    pub async fn replace_extracted_requirements(
        &self,
        project_id: i64,
        document_id: i64,
        batch: &[NewRequirement],
    ) -> Result<Vec<Requirement>> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            DELETE FROM conflicts WHERE
                requirement_id_1 IN (SELECT id FROM requirements WHERE document_id = ? AND source = 'extracted')
                OR requirement_id_2 IN (SELECT id FROM requirements WHERE document_id = ? AND source = 'extracted')
            "#,
        )
        .bind(document_id)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        let removed = sqlx::query(
            "DELETE FROM requirements WHERE document_id = ? AND source = 'extracted'",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE requirements SET requirement_number = (
                SELECT COUNT(*) FROM requirements r2
                WHERE r2.project_id = requirements.project_id AND r2.id <= requirements.id
            )
            WHERE project_id = ?
            "#,
        )
        .bind(project_id)
        .execute(&mut *tx)
        .await?;

        let max_number: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(requirement_number), 0) FROM requirements WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&mut *tx)
        .await?;

        let now = now_ts();
        let mut saved = Vec::with_capacity(batch.len());
        for (offset, req) in batch.iter().enumerate() {
            let row = sqlx::query_as::<_, Requirement>(INSERT_REQUIREMENT_SQL)
                .bind(project_id)
                .bind(document_id)
                .bind(max_number + offset as i64 + 1)
                .bind(&req.title)
                .bind(&req.text)
                .bind(req.requirement_type.to_string())
                .bind(req.priority.to_string())
                .bind(req.confidence)
                .bind(RequirementSource::Extracted.to_string())
                .bind(&now)
                .bind(&now)
                .fetch_one(&mut *tx)
                .await?;
            saved.push(row);
        }

        tx.commit().await?;

        debug!(
            document_id,
            removed,
            inserted = saved.len(),
            "Replaced extracted requirements"
        );
        Ok(saved)
    }

    /// Add a manual requirement (not tied to any document)
    pub async fn insert_manual_requirement(
        &self,
        project_id: i64,
        req: &NewRequirement,
    ) -> Result<Requirement> {
        let mut tx = self.pool().begin().await?;

        let max_number: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(requirement_number), 0) FROM requirements WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&mut *tx)
        .await?;

        let now = now_ts();
        let row = sqlx::query_as::<_, Requirement>(INSERT_REQUIREMENT_SQL)
            .bind(project_id)
            .bind(None::<i64>)
            .bind(max_number + 1)
            .bind(&req.title)
            .bind(&req.text)
            .bind(req.requirement_type.to_string())
            .bind(req.priority.to_string())
            .bind(req.confidence)
            .bind(RequirementSource::Manual.to_string())
            .bind(&now)
            .bind(&now)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(row)
    }

    /// Count the extracted requirements of one document
    pub async fn count_extracted_requirements(&self, document_id: i64) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM requirements WHERE document_id = ? AND source = 'extracted'",
        )
        .bind(document_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count as usize)
    }

    /// List a project's requirements in number order
    pub async fn list_project_requirements(&self, project_id: i64) -> Result<Vec<Requirement>> {
        let reqs = sqlx::query_as::<_, Requirement>(
            "SELECT * FROM requirements WHERE project_id = ? ORDER BY requirement_number, id",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;
        Ok(reqs)
    }

    /// IDs of all requirements in a project
    pub async fn requirement_ids(&self, project_id: i64) -> Result<HashSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM requirements WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(self.pool())
            .await?;
        Ok(ids.into_iter().collect())
    }
}
