use super::{requirement_entry, CascadeOutcome, ConflictCascade, SideEffect};
use crate::config::IngestConfig;
use crate::error::{Error, ErrorClass, Result};
use crate::extraction::{ExtractionClient, ExtractionResult, RequirementCandidate};
use crate::meta::{
    DocumentStatus, MetaDb, NewRequirement, Priority, Requirement, RequirementType,
};
use crate::text::{bound_content, clean_content, content_hash, derive_title};
use std::sync::Arc;
use tracing::{info, warn};

/// Why a document was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSkip {
    DocumentMissing,
    AlreadyProcessed,
}

/// Result of processing one document
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Skipped(IngestSkip),
    /// Pre-flight check failed; the document is `failed` and will not be retried
    Rejected(String),
    Processed {
        requirements: Vec<Requirement>,
        /// `processed`, or `failed` when nothing usable came back
        status: DocumentStatus,
        side_effects: Vec<SideEffect>,
    },
}

/// Takes one document through extraction into persisted requirements
#[derive(Clone)]
pub struct IngestionCoordinator {
    db: MetaDb,
    client: Arc<dyn ExtractionClient>,
    cascade: ConflictCascade,
    config: IngestConfig,
}

impl IngestionCoordinator {
    pub fn new(
        db: MetaDb,
        client: Arc<dyn ExtractionClient>,
        cascade: ConflictCascade,
        config: IngestConfig,
    ) -> Self {
        Self {
            db,
            client,
            cascade,
            config,
        }
    }

    /// Process a document. Safe to call repeatedly for the same id.
    pub async fn process(&self, document_id: i64) -> Result<IngestOutcome> {
        let Some(doc) = self.db.get_document(document_id).await? else {
            warn!(document_id, "Document not found, nothing to process");
            return Ok(IngestOutcome::Skipped(IngestSkip::DocumentMissing));
        };

        if matches!(doc.get_status(), Ok(DocumentStatus::Processed))
            && self.db.count_extracted_requirements(doc.id).await? > 0
        {
            info!(document_id, "Document already processed, skipping");
            return Ok(IngestOutcome::Skipped(IngestSkip::AlreadyProcessed));
        }

        let cleaned = clean_content(&doc.content);
        if cleaned.is_empty() {
            self.db
                .set_document_status(doc.id, DocumentStatus::Failed)
                .await?;
            warn!(document_id, "Document has no content");
            return Ok(IngestOutcome::Rejected("document has no content".to_string()));
        }

        self.db
            .mark_document_processing(doc.id, &content_hash(&cleaned))
            .await?;

        let result = self.extract(document_id, &cleaned, &doc.file_type).await?;
        let extracted = result.total_extracted.max(result.requirements.len());
        let batch = self.to_requirements(document_id, result.requirements);

        let saved = self
            .db
            .replace_extracted_requirements(doc.project_id, doc.id, &batch)
            .await?;

        let status = if saved.is_empty() {
            DocumentStatus::Failed
        } else {
            DocumentStatus::Processed
        };
        self.db.set_document_status(doc.id, status).await?;
        info!(
            document_id,
            saved = saved.len(),
            extracted,
            status = %status,
            "Document processed"
        );

        let side_effects = if saved.is_empty() {
            Vec::new()
        } else {
            vec![
                self.push_to_index(doc.project_id, &saved).await,
                CascadeOutcome::into_side_effect(self.cascade.trigger(doc.project_id).await),
            ]
        };
        for effect in side_effects.iter().filter(|e| e.is_failed()) {
            warn!(document_id, step = effect.name, "Non-fatal step failed: {:?}", effect.status);
        }

        Ok(IngestOutcome::Processed {
            requirements: saved,
            status,
            side_effects,
        })
    }

    /// Settle a document whose job ran out of attempts
    pub async fn mark_exhausted(&self, document_id: i64, error: &Error) -> Result<()> {
        if self.db.get_document(document_id).await?.is_some() {
            self.db
                .set_document_status(document_id, DocumentStatus::Failed)
                .await?;
            warn!(document_id, "Document processing failed permanently: {}", error);
        }
        Ok(())
    }

    // An unparsable answer gets exactly one retry with a much shorter input
    async fn extract(
        &self,
        document_id: i64,
        cleaned: &str,
        file_type: &str,
    ) -> Result<ExtractionResult> {
        let bounded = bound_content(cleaned, self.config.max_content_chars);
        match self.client.extract_requirements(&bounded, file_type).await {
            Err(e) if e.class() == ErrorClass::MalformedResponse => {
                warn!(
                    document_id,
                    retry_chars = self.config.retry_content_chars,
                    "Unparsable extraction response, retrying with shorter input: {}",
                    e
                );
                let shorter = bound_content(cleaned, self.config.retry_content_chars);
                self.client.extract_requirements(&shorter, file_type).await
            }
            other => other,
        }
    }

    fn to_requirements(
        &self,
        document_id: i64,
        candidates: Vec<RequirementCandidate>,
    ) -> Vec<NewRequirement> {
        candidates
            .into_iter()
            .enumerate()
            .filter_map(|(index, c)| {
                let Some(text) = c.text else {
                    warn!(document_id, index, "Skipping candidate without text");
                    return None;
                };

                let requirement_type = c
                    .requirement_type
                    .as_deref()
                    .and_then(|t| t.parse::<RequirementType>().ok())
                    .unwrap_or(RequirementType::Functional);
                let priority = c
                    .priority
                    .as_deref()
                    .and_then(|p| p.parse::<Priority>().ok())
                    .unwrap_or(Priority::Medium);
                let confidence = c
                    .confidence
                    .filter(|v| v.is_finite())
                    .map(|v| v.clamp(0.0, 1.0))
                    .unwrap_or(self.config.default_confidence);

                Some(NewRequirement {
                    title: c
                        .title
                        .unwrap_or_else(|| derive_title(&text, self.config.title_max_chars)),
                    text,
                    requirement_type,
                    priority,
                    confidence,
                })
            })
            .collect()
    }

    async fn push_to_index(&self, project_id: i64, saved: &[Requirement]) -> SideEffect {
        const NAME: &str = "incremental_index";
        let entries: Vec<_> = saved.iter().map(requirement_entry).collect();
        match self.client.incremental_kb_update(project_id, &entries).await {
            Ok(update) => SideEffect::applied(
                NAME,
                format!(
                    "{} added, {} skipped",
                    update.added_chunks, update.skipped_chunks
                ),
            ),
            Err(e) => SideEffect::failed(NAME, &e),
        }
    }
}
