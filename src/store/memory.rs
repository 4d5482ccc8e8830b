//! In-memory [`VectorStore`] for tests and throwaway vaults.
//!
//! Records live in a `Vec` behind `std::sync::RwLock`; queries are
//! brute-force cosine similarity over everything stored.

use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use super::{top_n, VectorHit, VectorRecord, VectorStore};
use crate::embedding::cosine_similarity;

pub struct InMemoryVectorStore {
    collection: String,
    records: RwLock<Vec<VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            records: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new("markdown_notes")
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn add(&self, records: &[VectorRecord]) -> Result<()> {
        let mut stored = self
            .records
            .write()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {}", e))?;
        for record in records {
            stored.retain(|r| r.id != record.id);
            stored.push(record.clone());
        }
        Ok(())
    }

    async fn query(&self, embedding: &[f32], n_results: usize) -> Result<Vec<VectorHit>> {
        let stored = self
            .records
            .read()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {}", e))?;

        let scored = stored
            .iter()
            .map(|r| {
                let sim = cosine_similarity(embedding, &r.embedding);
                (
                    sim,
                    VectorHit {
                        id: r.id.clone(),
                        document: r.document.clone(),
                        metadata: r.metadata.clone(),
                        distance: 1.0 - sim,
                    },
                )
            })
            .collect();

        Ok(top_n(scored, n_results))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self
            .records
            .read()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {}", e))?
            .len())
    }
}
