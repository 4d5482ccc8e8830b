//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is a named collection of
//! `{id, embedding, document, metadata}` records queryable by nearest
//! neighbour. Backends:
//!
//! | Provider | Type | Notes |
//! |----------|------|-------|
//! | `memory` | [`memory::InMemoryVectorStore`] | process-local, for tests |
//! | `sqlite` | [`sqlite::SqliteVectorStore`] | BLOB vectors, brute-force cosine |
//! | `chroma` | [`chroma::ChromaVectorStore`] | Chroma HTTP API v2 |
//!
//! Distances are cosine distances (`1 - cosine similarity`) on every backend.

pub mod chroma;
pub mod memory;
pub mod sqlite;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::models::Chunk;

/// Metadata stored alongside each chunk vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChunkMetadata {
    pub source_file: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_id: Option<u32>,
    #[serde(default)]
    pub chunk_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub metadata: ChunkMetadata,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &Chunk, embedding: Vec<f32>, url: Option<String>, quote: Option<String>) -> Self {
        Self {
            id: chunk.chunk_id.clone(),
            embedding,
            document: chunk.text.clone(),
            metadata: ChunkMetadata {
                source_file: chunk.source_file.clone(),
                platform: chunk.platform.clone(),
                timestamp: chunk.timestamp.clone(),
                citation_id: chunk.citation_id,
                chunk_index: chunk.chunk_index,
                url,
                quote,
            },
        }
    }
}

/// A nearest-neighbour hit. `distance` is cosine distance.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub document: String,
    pub metadata: ChunkMetadata,
    pub distance: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Collection name, e.g. `markdown_notes`.
    fn collection(&self) -> &str;

    /// Append records. Existing ids are overwritten.
    async fn add(&self, records: &[VectorRecord]) -> Result<()>;

    /// Up to `n_results` nearest records, closest first.
    async fn query(&self, embedding: &[f32], n_results: usize) -> Result<Vec<VectorHit>>;

    /// Number of records in the collection.
    async fn count(&self) -> Result<usize>;
}

/// Open the backend named by `[vector_store].provider`.
pub async fn open_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    let vs = &config.vector_store;
    match vs.provider.as_str() {
        "memory" => Ok(Arc::new(memory::InMemoryVectorStore::new(&vs.collection))),
        "sqlite" => Ok(Arc::new(
            sqlite::SqliteVectorStore::connect(&config.vector_db_path(), &vs.collection).await?,
        )),
        "chroma" => Ok(Arc::new(chroma::ChromaVectorStore::new(vs)?)),
        other => bail!("Unknown vector store provider: {}", other),
    }
}

/// Sort `(similarity, hit)` pairs closest-first and keep `n`.
pub(crate) fn top_n(mut scored: Vec<(f32, VectorHit)>, n: usize) -> Vec<VectorHit> {
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(n);
    scored.into_iter().map(|(_, hit)| hit).collect()
}
