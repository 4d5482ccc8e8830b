//! Chroma HTTP API (v2) [`VectorStore`].
//!
//! The collection is created on first use with cosine space
//! (`get_or_create`), and its id is cached for the life of the store.
//! `CHROMA_API_KEY`, when set, is sent as `x-chroma-token`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{ChunkMetadata, VectorHit, VectorRecord, VectorStore};
use crate::config::VectorStoreConfig;

pub struct ChromaVectorStore {
    client: reqwest::Client,
    base: String,
    collection: String,
    api_key: Option<String>,
    collection_id: OnceCell<String>,
}

impl ChromaVectorStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("vector_store.url required for Chroma"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base: format!(
                "{}/api/v2/tenants/{}/databases/{}/collections",
                url.trim_end_matches('/'),
                config.tenant,
                config.database
            ),
            collection: config.collection.clone(),
            api_key: std::env::var("CHROMA_API_KEY").ok(),
            collection_id: OnceCell::new(),
        })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match &self.api_key {
            Some(key) => req.header("x-chroma-token", key),
            None => req,
        }
    }

    async fn collection_id(&self) -> Result<&str> {
        let id = self
            .collection_id
            .get_or_try_init(|| async {
                let body = serde_json::json!({
                    "name": self.collection,
                    "get_or_create": true,
                    "metadata": { "hnsw:space": "cosine" },
                });
                let resp = self
                    .request(reqwest::Method::POST, self.base.clone())
                    .json(&body)
                    .send()
                    .await?;
                let json = check(resp).await?;
                json.get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow::anyhow!("Chroma response missing collection id"))
            })
            .await?;
        Ok(id.as_str())
    }
}

async fn check(resp: reqwest::Response) -> Result<serde_json::Value> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        bail!("Chroma API error {}: {}", status, text);
    }
    resp.json().await.context("Invalid Chroma response body")
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<serde_json::Value>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f32>>>>,
}

/// Flatten the first query's columns into hits.
fn parse_query_response(json: serde_json::Value) -> Result<Vec<VectorHit>> {
    let resp: QueryResponse = serde_json::from_value(json)?;
    let Some(ids) = resp.ids.into_iter().next() else {
        return Ok(Vec::new());
    };
    let documents = resp.documents.and_then(|d| d.into_iter().next()).unwrap_or_default();
    let metadatas = resp.metadatas.and_then(|m| m.into_iter().next()).unwrap_or_default();
    let distances = resp.distances.and_then(|d| d.into_iter().next()).unwrap_or_default();

    Ok(ids
        .into_iter()
        .enumerate()
        .map(|(i, id)| VectorHit {
            id,
            document: documents.get(i).cloned().flatten().unwrap_or_default(),
            metadata: metadatas
                .get(i)
                .cloned()
                .flatten()
                .and_then(|m| serde_json::from_value::<ChunkMetadata>(m).ok())
                .unwrap_or_default(),
            distance: distances.get(i).copied().flatten().unwrap_or(1.0),
        })
        .collect())
}

#[async_trait]
impl VectorStore for ChromaVectorStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn add(&self, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let id = self.collection_id().await?;
        let body = serde_json::json!({
            "ids": records.iter().map(|r| &r.id).collect::<Vec<_>>(),
            "embeddings": records.iter().map(|r| &r.embedding).collect::<Vec<_>>(),
            "documents": records.iter().map(|r| &r.document).collect::<Vec<_>>(),
            "metadatas": records.iter().map(|r| &r.metadata).collect::<Vec<_>>(),
        });
        let resp = self
            .request(reqwest::Method::POST, format!("{}/{}/add", self.base, id))
            .json(&body)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn query(&self, embedding: &[f32], n_results: usize) -> Result<Vec<VectorHit>> {
        let id = self.collection_id().await?;
        let body = serde_json::json!({
            "query_embeddings": [embedding],
            "n_results": n_results,
            "include": ["documents", "metadatas", "distances"],
        });
        let resp = self
            .request(reqwest::Method::POST, format!("{}/{}/query", self.base, id))
            .json(&body)
            .send()
            .await?;
        parse_query_response(check(resp).await?)
    }

    async fn count(&self) -> Result<usize> {
        let id = self.collection_id().await?;
        let resp = self
            .request(reqwest::Method::GET, format!("{}/{}/count", self.base, id))
            .send()
            .await?;
        let json = check(resp).await?;
        json.as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| anyhow::anyhow!("Chroma count response is not a number"))
    }
}
