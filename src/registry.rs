//! Document registry: lifecycle and metadata for ingested documents.
//!
//! Owns the `documents` table. Status moves pending → processing →
//! completed | failed; a completed document always has at least one chunk.
//! Deletion cascades to chunks and chunk vectors in a single transaction so
//! no orphan chunks can remain. Stats are computed from current rows with
//! SQL aggregates, never from separately maintained counters.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Document, DocumentStatus, OriginType};
use crate::sources::SourceMeta;

/// Aggregate stats over the registry and vector index.
#[derive(Debug, Serialize)]
pub struct RegistryStats {
    pub total_documents: i64,
    pub processed_documents: i64,
    pub failed_documents: i64,
    pub vector_stats: VectorStats,
}

#[derive(Debug, Serialize)]
pub struct VectorStats {
    pub total_chunks: i64,
}

pub struct DocumentRegistry {
    pool: SqlitePool,
}

impl DocumentRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new document in `pending` state and return it.
    pub async fn create_pending(
        &self,
        meta: &SourceMeta,
        byte_size: Option<i64>,
    ) -> Result<Document> {
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            origin: meta.origin,
            display_name: meta.display_name.clone(),
            source_url: meta.source_url.clone(),
            status: DocumentStatus::Pending,
            byte_size,
            chunk_count: 0,
            failure_reason: None,
            chart_json: None,
            created_at: Utc::now().timestamp(),
        };

        sqlx::query(
            r#"
            INSERT INTO documents (id, origin, display_name, source_url, status, byte_size, chunk_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(doc.origin.as_str())
        .bind(&doc.display_name)
        .bind(&doc.source_url)
        .bind(doc.status.as_str())
        .bind(doc.byte_size)
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;

        Ok(doc)
    }

    pub async fn mark_processing(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET status = 'processing' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a document to `completed`. Callers guarantee `chunk_count >= 1`;
    /// the guard here keeps the invariant even against misuse.
    pub async fn mark_completed(
        &self,
        id: &str,
        chunk_count: i64,
        chart_json: Option<String>,
    ) -> Result<()> {
        anyhow::ensure!(
            chunk_count >= 1,
            "completed document must have at least one chunk"
        );
        sqlx::query(
            "UPDATE documents SET status = 'completed', chunk_count = ?, chart_json = ?, failure_reason = NULL WHERE id = ?",
        )
        .bind(chunk_count)
        .bind(chart_json)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = 'failed', chunk_count = 0, failure_reason = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, origin, display_name, source_url, status, byte_size, chunk_count, failure_reason, chart_json, created_at FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_document(&r)))
    }

    /// Newest-first page of documents.
    pub async fn list(&self, skip: i64, limit: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT id, origin, display_name, source_url, status, byte_size, chunk_count, failure_reason, chart_json, created_at
            FROM documents
            ORDER BY created_at DESC, id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_document).collect())
    }

    /// How many documents are `completed`. The orchestrator uses this to
    /// decide whether grounded mode has anything to ground on.
    pub async fn completed_count(&self) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE status = 'completed'")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Delete a document and everything that hangs off it, atomically.
    /// Returns false when the document does not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            return Ok(false);
        }

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Counts derived from current rows; nothing here can drift.
    pub async fn stats(&self) -> Result<RegistryStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS processed,
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed
            FROM documents
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;

        Ok(RegistryStats {
            total_documents: row.get::<i64, _>("total"),
            processed_documents: row.get::<Option<i64>, _>("processed").unwrap_or(0),
            failed_documents: row.get::<Option<i64>, _>("failed").unwrap_or(0),
            vector_stats: VectorStats { total_chunks },
        })
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    let origin: String = row.get("origin");
    let status: String = row.get("status");
    Document {
        id: row.get("id"),
        origin: OriginType::parse(&origin).unwrap_or(OriginType::Upload),
        display_name: row.get("display_name"),
        source_url: row.get("source_url"),
        status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Failed),
        byte_size: row.get("byte_size"),
        chunk_count: row.get("chunk_count"),
        failure_reason: row.get("failure_reason"),
        chart_json: row.get("chart_json"),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("test.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        (tmp, pool)
    }

    fn meta(name: &str) -> SourceMeta {
        SourceMeta {
            origin: OriginType::Upload,
            display_name: name.to_string(),
            source_url: None,
        }
    }

    #[tokio::test]
    async fn lifecycle_pending_to_completed() {
        let (_tmp, pool) = test_pool().await;
        let registry = DocumentRegistry::new(pool);

        let doc = registry.create_pending(&meta("a.txt"), Some(10)).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);

        registry.mark_processing(&doc.id).await.unwrap();
        registry.mark_completed(&doc.id, 3, None).await.unwrap();

        let got = registry.get(&doc.id).await.unwrap().unwrap();
        assert_eq!(got.status, DocumentStatus::Completed);
        assert_eq!(got.chunk_count, 3);
    }

    #[tokio::test]
    async fn completed_requires_chunks() {
        let (_tmp, pool) = test_pool().await;
        let registry = DocumentRegistry::new(pool);
        let doc = registry.create_pending(&meta("a.txt"), None).await.unwrap();
        assert!(registry.mark_completed(&doc.id, 0, None).await.is_err());
    }

    #[tokio::test]
    async fn failed_records_reason() {
        let (_tmp, pool) = test_pool().await;
        let registry = DocumentRegistry::new(pool);
        let doc = registry.create_pending(&meta("bad.pdf"), None).await.unwrap();
        registry.mark_failed(&doc.id, "extraction failed: PDF").await.unwrap();

        let got = registry.get(&doc.id).await.unwrap().unwrap();
        assert_eq!(got.status, DocumentStatus::Failed);
        assert!(got.failure_reason.unwrap().contains("extraction"));
        assert_eq!(got.chunk_count, 0);
    }

    #[tokio::test]
    async fn list_paginates_newest_first() {
        let (_tmp, pool) = test_pool().await;
        let registry = DocumentRegistry::new(pool);
        for i in 0..5 {
            registry
                .create_pending(&meta(&format!("doc{}.txt", i)), None)
                .await
                .unwrap();
        }

        let page = registry.list(0, 3).await.unwrap();
        assert_eq!(page.len(), 3);
        let rest = registry.list(3, 3).await.unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn stats_derive_from_rows() {
        let (_tmp, pool) = test_pool().await;
        let registry = DocumentRegistry::new(pool.clone());

        let a = registry.create_pending(&meta("a.txt"), None).await.unwrap();
        let b = registry.create_pending(&meta("b.txt"), None).await.unwrap();
        registry.mark_completed(&a.id, 2, None).await.unwrap();
        registry.mark_failed(&b.id, "nope").await.unwrap();

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.total_documents, 2);
        assert_eq!(stats.processed_documents, 1);
        assert_eq!(stats.failed_documents, 1);
        assert_eq!(registry.completed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_missing_returns_false() {
        let (_tmp, pool) = test_pool().await;
        let registry = DocumentRegistry::new(pool);
        assert!(!registry.delete("no-such-id").await.unwrap());
    }
}
