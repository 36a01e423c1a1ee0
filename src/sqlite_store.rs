//! SQLite-backed [`SearchBackend`] implementation.
//!
//! Chunks live in `chunks`, their text is mirrored into the `chunks_fts`
//! FTS5 table for keyword search, and embeddings are stored as
//! little-endian `f32` BLOBs in `chunk_vectors`. Vector search is a
//! brute-force cosine scan over vectors of the query's dimension.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;

use knowbridge_core::embedding::{blob_to_vec, cosine_similarity, tokenize, vec_to_blob};
use knowbridge_core::error::BatchTooLarge;
use knowbridge_core::models::{Chunk, ChunkMetadata, IndexedChunk};
use knowbridge_core::store::{make_snippet, ChunkCandidate, SearchBackend, SearchFilters};

const CHUNK_COLUMNS: &str = "id, document_id, sequence_index, text, hash, source_title, page, char_offset, mime_type, indexed_at";

pub struct SqliteBackend {
    pool: SqlitePool,
    batch_limit: Option<usize>,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            batch_limit: None,
        }
    }

    /// Reject upserts of more than `limit` chunks per call (0 disables).
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = (limit > 0).then_some(limit);
        self
    }
}

/// Turn free text into an FTS5 query of quoted terms joined by `OR`.
///
/// Raw user text may contain FTS5 syntax (`"`, `*`, `NEAR`, column
/// filters) that would make `MATCH` fail; quoting every token avoids that.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = tokenize(text)
        .into_iter()
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        sequence_index: row.get("sequence_index"),
        text: row.get("text"),
        hash: row.get("hash"),
        metadata: ChunkMetadata {
            source_title: row.get("source_title"),
            page: row.get("page"),
            offset: row.get("char_offset"),
            mime_type: row.get("mime_type"),
        },
        indexed_at: row.get("indexed_at"),
    }
}

#[async_trait]
impl SearchBackend for SqliteBackend {
    async fn upsert_chunks(&self, chunks: &[IndexedChunk]) -> Result<()> {
        if let Some(limit) = self.batch_limit {
            if chunks.len() > limit {
                return Err(BatchTooLarge {
                    size: chunks.len(),
                    limit,
                }
                .into());
            }
        }

        let mut tx = self.pool.begin().await?;
        for ic in chunks {
            let c = &ic.chunk;
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, sequence_index, text, hash, source_title,
                                    page, char_offset, mime_type, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    text = excluded.text,
                    hash = excluded.hash,
                    source_title = excluded.source_title,
                    page = excluded.page,
                    char_offset = excluded.char_offset,
                    mime_type = excluded.mime_type,
                    indexed_at = excluded.indexed_at
                "#,
            )
            .bind(&c.id)
            .bind(&c.document_id)
            .bind(c.sequence_index)
            .bind(&c.text)
            .bind(&c.hash)
            .bind(&c.metadata.source_title)
            .bind(c.metadata.page)
            .bind(c.metadata.offset)
            .bind(&c.metadata.mime_type)
            .bind(c.indexed_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(&c.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&c.id)
                .bind(&c.document_id)
                .bind(&c.text)
                .execute(&mut *tx)
                .await?;

            if ic.vector.is_empty() {
                sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                    .bind(&c.id)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query(
                    r#"
                    INSERT INTO chunk_vectors (chunk_id, document_id, dims, embedding)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(chunk_id) DO UPDATE SET
                        document_id = excluded.document_id,
                        dims = excluded.dims,
                        embedding = excluded.embedding
                    "#,
                )
                .bind(&c.id)
                .bind(&c.document_id)
                .bind(ic.vector.len() as i64)
                .bind(vec_to_blob(&ic.vector))
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM chunks WHERE id IN (", CHUNK_COLUMNS));
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE document_id = ? ORDER BY sequence_index ASC",
            CHUNK_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn indexed_hashes(
        &self,
        document_id: &str,
        dims: usize,
    ) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.hash
            FROM chunks c
            JOIN chunk_vectors cv ON cv.chunk_id = c.id
            WHERE c.document_id = ? AND cv.dims = ?
            "#,
        )
        .bind(document_id)
        .bind(dims as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("id"), r.get::<String, _>("hash")))
            .collect())
    }

    async fn update_metadata(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for c in chunks {
            sqlx::query(
                r#"
                UPDATE chunks
                SET source_title = ?, page = ?, char_offset = ?, mime_type = ?, indexed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&c.metadata.source_title)
            .bind(c.metadata.page)
            .bind(c.metadata.offset)
            .bind(&c.metadata.mime_type)
            .bind(c.indexed_at)
            .bind(&c.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn prune_document(&self, document_id: &str, keep_below: i64) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ? AND sequence_index >= ?)",
        )
        .bind(document_id)
        .bind(keep_below)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ? AND sequence_index >= ?)",
        )
        .bind(document_id)
        .bind(keep_below)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM chunks WHERE document_id = ? AND sequence_index >= ?")
            .bind(document_id)
            .bind(keep_below)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ChunkCandidate>> {
        let match_expr = match fts_query(query) {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };

        let rows = sqlx::query(
            r#"
            SELECT chunks_fts.chunk_id AS chunk_id, chunks_fts.document_id AS document_id,
                   bm25(chunks_fts) AS bm25_score, c.text AS text, c.indexed_at AS indexed_at
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            WHERE chunks_fts MATCH ?
              AND (? IS NULL OR c.document_id = ?)
              AND (? IS NULL OR c.mime_type = ?)
            ORDER BY bm25_score
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(&filters.document_id)
        .bind(&filters.document_id)
        .bind(&filters.mime_type)
        .bind(&filters.mime_type)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let bm25: f64 = row.get("bm25_score");
                let text: String = row.get("text");
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    // bm25() is lower-is-better; flip so higher is better.
                    raw_score: -bm25,
                    snippet: make_snippet(&text),
                    indexed_at: row.get("indexed_at"),
                }
            })
            .collect())
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ChunkCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.document_id, cv.embedding, c.text, c.indexed_at
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            WHERE cv.dims = ?
              AND (? IS NULL OR c.document_id = ?)
              AND (? IS NULL OR c.mime_type = ?)
            "#,
        )
        .bind(query_vec.len() as i64)
        .bind(&filters.document_id)
        .bind(&filters.document_id)
        .bind(&filters.mime_type)
        .bind(&filters.mime_type)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let text: String = row.get("text");
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    raw_score: cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64,
                    snippet: make_snippet(&text),
                    indexed_at: row.get("indexed_at"),
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn count_chunks(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowbridge_core::embedding::HashingProvider;
    use knowbridge_core::models::SourceChunk;
    use tempfile::TempDir;

    async fn backend(tmp: &TempDir) -> SqliteBackend {
        let pool = crate::db::connect_path(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        SqliteBackend::new(pool)
    }

    fn indexed(embedder: &HashingProvider, doc: &str, seq: i64, text: &str) -> IndexedChunk {
        let chunk = Chunk::from_source(
            doc,
            &SourceChunk {
                sequence_index: seq,
                text: text.to_string(),
                metadata: ChunkMetadata {
                    source_title: Some("Handbook".to_string()),
                    mime_type: "text/markdown".to_string(),
                    ..Default::default()
                },
            },
        );
        IndexedChunk {
            vector: embedder.embed_text(text),
            chunk,
        }
    }

    #[test]
    fn test_fts_query_sanitizes_syntax() {
        assert_eq!(
            fts_query("NEAR(\"vpn\" *setup)").as_deref(),
            Some("\"near\" OR \"vpn\" OR \"setup\"")
        );
        assert_eq!(fts_query("  ?!  "), None);
    }

    #[tokio::test]
    async fn test_update_metadata_keeps_text_and_vector() {
        let tmp = TempDir::new().unwrap();
        let store = backend(&tmp).await;
        let embedder = HashingProvider::new(32);
        let ic = indexed(&embedder, "d1", 0, "Expense reports are due monthly.");
        store.upsert_chunks(std::slice::from_ref(&ic)).await.unwrap();

        let mut renamed = ic.chunk.clone();
        renamed.metadata.source_title = Some("Finance Handbook".to_string());
        renamed.metadata.page = Some(4);
        store.update_metadata(&[renamed]).await.unwrap();

        let chunks = store.document_chunks("d1").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].metadata.source_title.as_deref(),
            Some("Finance Handbook")
        );
        assert_eq!(chunks[0].metadata.page, Some(4));
        assert_eq!(chunks[0].text, ic.chunk.text);
        assert_eq!(
            store.indexed_hashes("d1", 32).await.unwrap().get(&ic.chunk.id),
            Some(&ic.chunk.hash)
        );
        let hits = store
            .keyword_search("expense", 5, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = backend(&tmp).await;
        let embedder = HashingProvider::new(32);
        let batch = vec![
            indexed(&embedder, "d1", 0, "Onboarding checklist for new hires."),
            indexed(&embedder, "d1", 1, "Laptop setup and VPN access."),
        ];
        store.upsert_chunks(&batch).await.unwrap();
        store.upsert_chunks(&batch).await.unwrap();
        assert_eq!(store.count_chunks().await.unwrap(), 2);

        let hits = store
            .keyword_search("vpn", 10, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1, "FTS rows must not duplicate");
    }

    #[tokio::test]
    async fn test_roundtrip_metadata_and_hashes() {
        let tmp = TempDir::new().unwrap();
        let store = backend(&tmp).await;
        let embedder = HashingProvider::new(32);
        let ic = indexed(&embedder, "d1", 0, "Expense policy.");
        store.upsert_chunks(std::slice::from_ref(&ic)).await.unwrap();

        let chunks = store.get_chunks(&[ic.chunk.id.clone()]).await.unwrap();
        assert_eq!(chunks[0].metadata.source_title.as_deref(), Some("Handbook"));
        assert_eq!(chunks[0].metadata.mime_type, "text/markdown");

        let hashes = store.indexed_hashes("d1", 32).await.unwrap();
        assert_eq!(hashes.get(&ic.chunk.id), Some(&ic.chunk.hash));
        assert!(store.indexed_hashes("d1", 64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_and_filters() {
        let tmp = TempDir::new().unwrap();
        let store = backend(&tmp).await;
        let embedder = HashingProvider::new(64);
        store
            .upsert_chunks(&[
                indexed(&embedder, "d1", 0, "parental leave policy"),
                indexed(&embedder, "d2", 0, "kubernetes deployment guide"),
            ])
            .await
            .unwrap();

        let qv = embedder.embed_text("kubernetes deployment");
        let hits = store
            .vector_search(&qv, 5, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits[0].document_id, "d2");

        let filters = SearchFilters {
            document_id: Some("d1".to_string()),
            mime_type: None,
        };
        let hits = store.vector_search(&qv, 5, &filters).await.unwrap();
        assert!(hits.iter().all(|h| h.document_id == "d1"));
    }

    #[tokio::test]
    async fn test_prune_delete_and_batch_limit() {
        let tmp = TempDir::new().unwrap();
        let store = backend(&tmp).await.with_batch_limit(2);
        let embedder = HashingProvider::new(16);
        let batch: Vec<IndexedChunk> = (0..3)
            .map(|i| indexed(&embedder, "d1", i, &format!("chunk {}", i)))
            .collect();

        let err = store.upsert_chunks(&batch).await.unwrap_err();
        assert!(err.downcast_ref::<BatchTooLarge>().is_some());

        store.upsert_chunks(&batch[..2]).await.unwrap();
        store.upsert_chunks(&batch[2..]).await.unwrap();
        assert_eq!(store.prune_document("d1", 2).await.unwrap(), 1);
        assert_eq!(store.document_chunks("d1").await.unwrap().len(), 2);
        assert_eq!(store.delete_document("d1").await.unwrap(), 2);
        assert_eq!(store.count_chunks().await.unwrap(), 0);
    }
}
