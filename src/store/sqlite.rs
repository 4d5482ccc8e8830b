//! SQLite-backed [`VectorStore`].
//!
//! One table holds every collection's vectors as little-endian f32 BLOBs.
//! Queries load the collection and rank by brute-force cosine similarity,
//! which is fast enough for a personal vault.
//!
//! ```text
//! vectors(id PK, collection, document, metadata_json, embedding BLOB, dims, created_at)
//! ```

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use super::{top_n, ChunkMetadata, VectorHit, VectorRecord, VectorStore};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};

pub struct SqliteVectorStore {
    pool: SqlitePool,
    collection: String,
}

impl SqliteVectorStore {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn connect(path: &Path, collection: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            collection: collection.to_string(),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                document TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                embedding BLOB NOT NULL,
                dims INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_collection ON vectors(collection)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn add(&self, records: &[VectorRecord]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for record in records {
            let metadata_json = serde_json::to_string(&record.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO vectors (id, collection, document, metadata_json, embedding, dims, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    collection = excluded.collection,
                    document = excluded.document,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding,
                    dims = excluded.dims
                "#,
            )
            .bind(&record.id)
            .bind(&self.collection)
            .bind(&record.document)
            .bind(metadata_json)
            .bind(vec_to_blob(&record.embedding))
            .bind(record.embedding.len() as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, embedding: &[f32], n_results: usize) -> Result<Vec<VectorHit>> {
        let rows = sqlx::query(
            "SELECT id, document, metadata_json, embedding FROM vectors WHERE collection = ? AND dims = ?",
        )
        .bind(&self.collection)
        .bind(embedding.len() as i64)
        .fetch_all(&self.pool)
        .await?;

        let scored = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let sim = cosine_similarity(embedding, &blob_to_vec(&blob));
                let metadata_json: String = row.get("metadata_json");
                let metadata: ChunkMetadata =
                    serde_json::from_str(&metadata_json).unwrap_or_default();
                (
                    sim,
                    VectorHit {
                        id: row.get("id"),
                        document: row.get("document"),
                        metadata,
                        distance: 1.0 - sim,
                    },
                )
            })
            .collect();

        Ok(top_n(scored, n_results))
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, file: &str, v: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            embedding: v,
            document: "Applied to Meta [1].".to_string(),
            metadata: ChunkMetadata {
                source_file: file.to_string(),
                platform: "Gmail".to_string(),
                timestamp: "2024-10-15T00:00:00Z".to_string(),
                citation_id: Some(1),
                chunk_index: 0,
                url: None,
                quote: None,
            },
        }
    }

    #[tokio::test]
    async fn test_sqlite_add_query_count() {
        let dir = TempDir::new().unwrap();
        let store = SqliteVectorStore::connect(&dir.path().join("v.sqlite"), "markdown_notes")
            .await
            .unwrap();

        store
            .add(&[
                record("1", "career/Meta.md", vec![1.0, 0.0, 0.0]),
                record("2", "personal/Notes.md", vec![0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        let hits = store.query(&[0.9, 0.1, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata.source_file, "career/Meta.md");
        assert_eq!(hits[0].metadata.citation_id, Some(1));

        // wrong dimensionality never matches
        assert!(store.query(&[1.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.sqlite");
        let a = SqliteVectorStore::connect(&path, "a").await.unwrap();
        a.add(&[record("1", "x.md", vec![1.0])]).await.unwrap();
        let b = SqliteVectorStore::connect(&path, "b").await.unwrap();
        assert_eq!(b.count().await.unwrap(), 0);
    }
}
