//! Vector index and retriever.
//!
//! Chunk text and embedding vectors live in the `chunks` and
//! `chunk_vectors` tables. Writes affecting one document happen inside a
//! single transaction (delete-then-insert), so an upsert and a delete for
//! the same document can never interleave; reads run concurrently on the
//! pool, including during another document's ingestion.
//!
//! Queries are brute-force cosine over the stored vectors, ranked
//! descending by score with ties broken by the owning document's creation
//! time (freshest first). `top_k` is clamped server-side.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{Chunk, RetrievedChunk};

/// Scope of a retrieval query.
#[derive(Debug, Clone)]
pub enum QueryScope {
    All,
    SingleDocument(String),
}

pub struct VectorIndex {
    pool: SqlitePool,
    max_top_k: usize,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool, max_top_k: usize) -> Self {
        Self { pool, max_top_k }
    }

    /// Replace a document's chunks and vectors atomically. `vectors` runs
    /// parallel to `chunks`.
    pub async fn upsert_document(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        anyhow::ensure!(
            chunks.len() == vectors.len(),
            "chunk/vector count mismatch: {} vs {}",
            chunks.len(),
            vectors.len()
        );

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, start_offset, end_offset) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, document_id, dims, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove every chunk and vector belonging to a document.
    pub async fn delete_by_document(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Nearest-neighbor query. Returns an empty result set (not an error)
    /// when nothing is indexed.
    pub async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        scope: QueryScope,
    ) -> Result<Vec<RetrievedChunk>> {
        let effective_k = top_k.min(self.max_top_k);

        let base = r#"
            SELECT cv.chunk_id, cv.document_id, cv.embedding,
                   c.chunk_index, c.text, d.created_at AS doc_created_at
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            JOIN documents d ON d.id = cv.document_id
        "#;

        let rows = match &scope {
            QueryScope::All => sqlx::query(base).fetch_all(&self.pool).await?,
            QueryScope::SingleDocument(doc_id) => {
                let sql = format!("{} WHERE cv.document_id = ?", base);
                sqlx::query(&sql).bind(doc_id).fetch_all(&self.pool).await?
            }
        };

        let mut results: Vec<RetrievedChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = blob_to_vec(&blob);
                RetrievedChunk {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    score: cosine_similarity(vector, &stored) as f64,
                    document_created_at: row.get("doc_created_at"),
                }
            })
            .collect();

        // Score descending; ties go to the most recently created document,
        // then chunk id for a stable order.
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.document_created_at.cmp(&a.document_created_at))
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(effective_k);

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::OriginType;
    use crate::registry::DocumentRegistry;
    use crate::sources::SourceMeta;
    use crate::{db, migrate};

    async fn test_setup() -> (tempfile::TempDir, SqlitePool) {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("test.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        (tmp, pool)
    }

    async fn make_doc(pool: &SqlitePool, name: &str, created_at: i64) -> String {
        let registry = DocumentRegistry::new(pool.clone());
        let doc = registry
            .create_pending(
                &SourceMeta {
                    origin: OriginType::Upload,
                    display_name: name.to_string(),
                    source_url: None,
                },
                None,
            )
            .await
            .unwrap();
        // Pin creation time for deterministic recency ordering.
        sqlx::query("UPDATE documents SET created_at = ? WHERE id = ?")
            .bind(created_at)
            .bind(&doc.id)
            .execute(pool)
            .await
            .unwrap();
        doc.id
    }

    fn chunk(doc_id: &str, index: i64, text: &str) -> Chunk {
        Chunk {
            id: format!("{}-c{}", doc_id, index),
            document_id: doc_id.to_string(),
            chunk_index: index,
            text: text.to_string(),
            start_offset: 0,
            end_offset: text.len() as i64,
        }
    }

    #[tokio::test]
    async fn empty_index_returns_empty() {
        let (_tmp, pool) = test_setup().await;
        let index = VectorIndex::new(pool, 20);
        let got = index.query(&[1.0, 0.0], 5, QueryScope::All).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn results_sorted_by_score_desc() {
        let (_tmp, pool) = test_setup().await;
        let doc = make_doc(&pool, "a.txt", 100).await;
        let index = VectorIndex::new(pool, 20);

        index
            .upsert_document(
                &doc,
                &[chunk(&doc, 0, "exact"), chunk(&doc, 1, "near"), chunk(&doc, 2, "far")],
                &[
                    vec![1.0, 0.0],
                    vec![0.9, 0.1],
                    vec![0.0, 1.0],
                ],
            )
            .await
            .unwrap();

        let got = index.query(&[1.0, 0.0], 5, QueryScope::All).await.unwrap();
        assert_eq!(got.len(), 3);
        assert!(got[0].score >= got[1].score && got[1].score >= got[2].score);
        assert_eq!(got[0].text, "exact");
    }

    #[tokio::test]
    async fn top_k_clamped_by_max() {
        let (_tmp, pool) = test_setup().await;
        let doc = make_doc(&pool, "a.txt", 100).await;
        let index = VectorIndex::new(pool, 2);

        let chunks: Vec<Chunk> = (0..5).map(|i| chunk(&doc, i, "t")).collect();
        let vectors: Vec<Vec<f32>> = (0..5).map(|i| vec![1.0, i as f32 * 0.01]).collect();
        index.upsert_document(&doc, &chunks, &vectors).await.unwrap();

        let got = index.query(&[1.0, 0.0], 100, QueryScope::All).await.unwrap();
        assert_eq!(got.len(), 2, "client top_k must not exceed the cap");
    }

    #[tokio::test]
    async fn ties_break_toward_newer_document() {
        let (_tmp, pool) = test_setup().await;
        let old_doc = make_doc(&pool, "old.txt", 100).await;
        let new_doc = make_doc(&pool, "new.txt", 200).await;
        let index = VectorIndex::new(pool, 20);

        // Identical vectors — identical scores.
        index
            .upsert_document(&old_doc, &[chunk(&old_doc, 0, "same")], &[vec![1.0, 0.0]])
            .await
            .unwrap();
        index
            .upsert_document(&new_doc, &[chunk(&new_doc, 0, "same")], &[vec![1.0, 0.0]])
            .await
            .unwrap();

        let got = index.query(&[1.0, 0.0], 5, QueryScope::All).await.unwrap();
        assert_eq!(got[0].document_id, new_doc, "newer document wins ties");
        assert_eq!(got[1].document_id, old_doc);
    }

    #[tokio::test]
    async fn scope_restricts_to_one_document() {
        let (_tmp, pool) = test_setup().await;
        let a = make_doc(&pool, "a.txt", 100).await;
        let b = make_doc(&pool, "b.txt", 200).await;
        let index = VectorIndex::new(pool, 20);

        index
            .upsert_document(&a, &[chunk(&a, 0, "in a")], &[vec![1.0, 0.0]])
            .await
            .unwrap();
        index
            .upsert_document(&b, &[chunk(&b, 0, "in b")], &[vec![1.0, 0.0]])
            .await
            .unwrap();

        let got = index
            .query(&[1.0, 0.0], 5, QueryScope::SingleDocument(a.clone()))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].document_id, a);
    }

    #[tokio::test]
    async fn delete_by_document_removes_everything() {
        let (_tmp, pool) = test_setup().await;
        let doc = make_doc(&pool, "a.txt", 100).await;
        let index = VectorIndex::new(pool.clone(), 20);

        index
            .upsert_document(&doc, &[chunk(&doc, 0, "x")], &[vec![1.0, 0.0]])
            .await
            .unwrap();
        index.delete_by_document(&doc).await.unwrap();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(&doc)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);

        let got = index.query(&[1.0, 0.0], 5, QueryScope::All).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_previous_chunks() {
        let (_tmp, pool) = test_setup().await;
        let doc = make_doc(&pool, "a.txt", 100).await;
        let index = VectorIndex::new(pool.clone(), 20);

        index
            .upsert_document(
                &doc,
                &[chunk(&doc, 0, "v1-a"), chunk(&doc, 1, "v1-b")],
                &[vec![1.0, 0.0], vec![0.5, 0.5]],
            )
            .await
            .unwrap();
        index
            .upsert_document(&doc, &[chunk(&doc, 0, "v2")], &[vec![0.0, 1.0]])
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(&doc)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
