//! Ingestion pipeline orchestration.
//!
//! Drives each source through normalize → extract (→ financial analysis)
//! → chunk → embed → index, moving the Document through pending →
//! processing → completed | failed. Every document is processed in its own
//! task; nothing serializes unrelated documents. A failure anywhere marks
//! that one document failed with a readable reason and leaves the rest of
//! the batch alone.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{IngestionError, ValidationError};
use crate::extract::{self, ContentKind};
use crate::financial;
use crate::index::VectorIndex;
use crate::models::Document;
use crate::registry::DocumentRegistry;
use crate::sources::{self, NormalizedSource, Preview, Resolution, SourceInput, SourceNormalizer};

pub struct IngestPipeline {
    config: Arc<Config>,
    normalizer: SourceNormalizer,
    registry: DocumentRegistry,
    index: VectorIndex,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl IngestPipeline {
    pub fn new(config: Arc<Config>, pool: SqlitePool) -> Result<Self> {
        let embedder: Arc<dyn EmbeddingProvider> =
            embedding::create_provider(&config.embedding)?.into();
        Ok(Self {
            normalizer: SourceNormalizer::new(config.ingestion.clone()),
            registry: DocumentRegistry::new(pool.clone()),
            index: VectorIndex::new(pool, config.retrieval.max_top_k),
            config,
            embedder,
        })
    }

    /// Ingest a batch of sources. Validation rejects the request before
    /// any Document exists; after that, each normalized record is
    /// processed independently and the final Document states are returned
    /// (completed and failed alike).
    pub async fn ingest(
        self: &Arc<Self>,
        inputs: Vec<SourceInput>,
    ) -> Result<Vec<Document>, ValidationError> {
        if inputs.is_empty() {
            return Err(ValidationError::MissingField("sources"));
        }
        for input in &inputs {
            sources::validate(input)?;
        }

        // Fan out: folder inputs expand to one resolution per child.
        let mut resolutions = Vec::new();
        for input in inputs {
            resolutions.extend(self.normalizer.resolve(input).await);
        }

        let mut handles = Vec::with_capacity(resolutions.len());
        for resolution in resolutions {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                this.process_resolution(resolution).await
            }));
        }

        let mut documents = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Ok(doc)) => documents.push(doc),
                Ok(Err(e)) => warn!(error = %e, "ingestion task failed to record outcome"),
                Err(e) => warn!(error = %e, "ingestion task panicked"),
            }
        }
        Ok(documents)
    }

    /// Preview a remote source without creating a Document.
    pub async fn preview(
        &self,
        url: &str,
        declared_kind: Option<ContentKind>,
    ) -> Result<Preview, IngestionError> {
        self.normalizer.preview(url, declared_kind).await
    }

    async fn process_resolution(&self, resolution: Resolution) -> Result<Document> {
        match resolution {
            Resolution::Failed { meta, error } => {
                let doc = self.registry.create_pending(&meta, None).await?;
                self.registry.mark_failed(&doc.id, &error.to_string()).await?;
                info!(document = %doc.id, reason = %error, "source failed before extraction");
                self.registry
                    .get(&doc.id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("document vanished: {}", doc.id))
            }
            Resolution::Ready(source) => {
                let doc = self
                    .registry
                    .create_pending(&source.meta, source.byte_size)
                    .await?;
                self.registry.mark_processing(&doc.id).await?;

                match self.process_content(&doc.id, source).await {
                    Ok((chunk_count, chart_json)) => {
                        self.registry
                            .mark_completed(&doc.id, chunk_count, chart_json)
                            .await?;
                        info!(document = %doc.id, chunks = chunk_count, "document completed");
                    }
                    Err(error) => {
                        // Leave no partial chunks behind for a failed document.
                        self.index.delete_by_document(&doc.id).await?;
                        self.registry.mark_failed(&doc.id, &error.to_string()).await?;
                        warn!(document = %doc.id, reason = %error, "document failed");
                    }
                }

                self.registry
                    .get(&doc.id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("document vanished: {}", doc.id))
            }
        }
    }

    /// Extract, analyze, chunk, embed, and index one document's content.
    async fn process_content(
        &self,
        document_id: &str,
        source: NormalizedSource,
    ) -> Result<(i64, Option<String>), IngestionError> {
        let extraction = extract::extract(&source.bytes, source.kind).await?;

        let mut text = extraction.text;
        let mut chart_json = None;

        if source.kind.is_spreadsheet() {
            if let Some(analysis) = extraction.table.as_deref().and_then(financial::analyze) {
                // The summary line becomes part of the chunkable text so
                // grounded answers can quote the computed totals.
                text.push_str("\n\n");
                text.push_str(&analysis.summary_text);
                chart_json = serde_json::to_string(&analysis.charts).ok();
            }
        }

        if text.trim().chars().count() < self.config.ingestion.min_text_chars {
            return Err(IngestionError::EmptyText);
        }

        let chunks = chunk_text(
            document_id,
            &text,
            self.config.chunking.chunk_chars,
            self.config.chunking.overlap_chars,
            self.config.chunking.max_chunks_per_document,
        );
        if chunks.is_empty() {
            return Err(IngestionError::EmptyText);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = match self.embedder.embed(&texts).await {
            Ok(v) => v,
            Err(first) => {
                warn!(document = %document_id, error = %first, "embedding failed, retrying once");
                self.embedder
                    .embed(&texts)
                    .await
                    .map_err(|second| IngestionError::Embedding(second.to_string()))?
            }
        };

        self.index
            .upsert_document(document_id, &chunks, &vectors)
            .await
            .map_err(|e| IngestionError::Storage(e.to_string()))?;

        Ok((chunks.len() as i64, chart_json))
    }
}
