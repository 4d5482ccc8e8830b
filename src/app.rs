//! Service wiring shared by the CLI and the HTTP server.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::agentic::AgenticSearch;
use crate::citations::{CitationLedger, JsonSidecarLedger};
use crate::config::Config;
use crate::embedding::CachedEmbedder;
use crate::ingest::{ChunkIndexer, IngestionOrchestrator};
use crate::llm::{create_model, LanguageModel};
use crate::retrieval::RetrievalEngine;
use crate::store::{open_store, VectorStore};
use crate::synthesis::{AskPipeline, ChatPersona};

/// Every long-lived component, built once from a [`Config`].
pub struct Services {
    pub config: Config,
    pub ledger: Arc<dyn CitationLedger>,
    pub retrieval: Arc<RetrievalEngine>,
    pub agentic: AgenticSearch,
    pub orchestrator: IngestionOrchestrator,
    pub ask: AskPipeline,
    pub persona: ChatPersona,
}

impl Services {
    /// Build with the configured language model.
    pub async fn from_config(config: Config) -> Result<Self> {
        let model: Arc<dyn LanguageModel> = Arc::from(
            create_model(&config.llm).context("Failed to create language model client")?,
        );
        Self::with_model(config, model).await
    }

    /// Build around an existing model (tests inject a scripted one).
    pub async fn with_model(config: Config, model: Arc<dyn LanguageModel>) -> Result<Self> {
        let store = open_store(&config).await?;
        Self::with_parts(config, model, store)
    }

    pub fn with_parts(
        config: Config,
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        let root = config.vault.root.clone();
        let ledger: Arc<dyn CitationLedger> = Arc::new(JsonSidecarLedger::new());
        let embedder = Arc::new(CachedEmbedder::new(config.embedding.clone())?);

        let retrieval = Arc::new(RetrievalEngine::new(
            store.clone(),
            embedder.clone(),
            config.retrieval.clone(),
        ));
        let orchestrator = IngestionOrchestrator::new(
            root.clone(),
            model.clone(),
            ledger.clone(),
            config.ingest.clone(),
        )
        .with_indexer(ChunkIndexer::new(
            embedder,
            store,
            config.ingest.chunk_max_tokens,
        ));
        let agentic = AgenticSearch::new(root, model.clone(), ledger.clone(), config.agentic.clone());

        tracing::debug!(
            vault = %config.vault.root.display(),
            model = model.model_name(),
            "services ready"
        );

        Ok(Self {
            ask: AskPipeline::new(agentic.clone(), Some(retrieval.clone()), model.clone()),
            agentic,
            persona: ChatPersona::new(model),
            config,
            ledger,
            retrieval,
            orchestrator,
        })
    }
}
