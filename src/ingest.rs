//! Ingestion orchestration.
//!
//! Drives one piece of content through the vault:
//!
//! ```text
//! route ──▶ mutate ──▶ cite ──▶ validate ──▶ index chunks
//!   ▲                              │
//!   └──── RetryContext(errors) ◀───┘  (while attempts remain)
//! ```
//!
//! Citation ids are assigned per target file: the first cited edit to a file
//! in an attempt takes the file's next free id, the `[1]` placeholders in the
//! edit's new text are rewritten to it, and exactly one record for the source
//! is added to that file's ledger. Text already in the file is never
//! renumbered.
//!
//! Chunks are cut from the raw input and indexed once per touched file with
//! that file's citation id. Indexing failures are logged and never fail the
//! ingestion.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chunk::{chunk_text, ChunkSource};
use crate::citations::{renumber_marker, CitationLedger, Citations};
use crate::config::IngestConfig;
use crate::embedding::CachedEmbedder;
use crate::llm::LanguageModel;
use crate::models::{Edit, EditAction, EditPlan, IngestOutcome, SourceMetadata};
use crate::mutator::FileMutator;
use crate::router::{ContentRouter, RetryContext};
use crate::store::{VectorRecord, VectorStore};
use crate::validate::validate_note;

const PLACEHOLDER_ID: u32 = 1;

/// One item of a bulk request, same shape as a single ingest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestItem {
    pub text: String,
    #[serde(default)]
    pub metadata: Option<SourceMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BulkOutcome {
    pub total_items: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<IngestOutcome>,
}

/// Embeds chunks and writes them to the vector store.
pub struct ChunkIndexer {
    embedder: Arc<CachedEmbedder>,
    store: Arc<dyn VectorStore>,
    chunk_max_tokens: usize,
}

impl ChunkIndexer {
    pub fn new(
        embedder: Arc<CachedEmbedder>,
        store: Arc<dyn VectorStore>,
        chunk_max_tokens: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            chunk_max_tokens,
        }
    }

    /// Index `context` against each `(file, citation_id)`; returns chunks stored.
    pub async fn index(
        &self,
        context: &str,
        metadata: &SourceMetadata,
        quote: Option<&str>,
        files: &[(String, Option<u32>)],
    ) -> Result<usize> {
        if !self.embedder.is_enabled() {
            tracing::debug!("embeddings disabled; skipping chunk indexing");
            return Ok(0);
        }

        let mut chunks = Vec::new();
        for (file, citation_id) in files {
            chunks.extend(chunk_text(
                context,
                self.chunk_max_tokens,
                &ChunkSource {
                    source_file: file,
                    platform: &metadata.platform,
                    timestamp: &metadata.timestamp,
                    citation_id: *citation_id,
                },
            ));
        }
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_documents(&texts).await?;
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, v)| {
                VectorRecord::from_chunk(
                    chunk,
                    v,
                    metadata.url.clone(),
                    quote.map(str::to_string),
                )
            })
            .collect();

        self.store.add(&records).await?;
        Ok(records.len())
    }
}

/// Result of applying one plan.
#[derive(Debug, Default)]
struct AttemptReport {
    /// Vault-relative file → (absolute path, created this attempt).
    touched: BTreeMap<String, (PathBuf, bool)>,
    cited: BTreeMap<String, u32>,
    errors: Vec<String>,
}

pub struct IngestionOrchestrator {
    root: PathBuf,
    router: ContentRouter,
    mutator: FileMutator,
    ledger: Arc<dyn CitationLedger>,
    indexer: Option<ChunkIndexer>,
    config: IngestConfig,
}

impl IngestionOrchestrator {
    pub fn new(
        root: impl Into<PathBuf>,
        model: Arc<dyn LanguageModel>,
        ledger: Arc<dyn CitationLedger>,
        config: IngestConfig,
    ) -> Self {
        let root = root.into();
        Self {
            mutator: FileMutator::new(root.clone()),
            router: ContentRouter::new(model),
            root,
            ledger,
            indexer: None,
            config,
        }
    }

    pub fn with_indexer(mut self, indexer: ChunkIndexer) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn vault_root(&self) -> &Path {
        &self.root
    }

    /// Ingest `context`. Never returns `Err`: failures land in `errors`.
    pub async fn ingest(
        &self,
        context: &str,
        metadata: Option<SourceMetadata>,
        max_retries: Option<u32>,
    ) -> IngestOutcome {
        let mut metadata = metadata.unwrap_or_else(SourceMetadata::manual_now);
        if metadata.timestamp.trim().is_empty() {
            metadata.timestamp = SourceMetadata::manual_now().timestamp;
        }
        let max_attempts = max_retries.unwrap_or(self.config.max_retries).max(1);

        let mut outcome = IngestOutcome::default();
        if context.trim().is_empty() {
            outcome.errors.push("Empty content".to_string());
            return outcome;
        }

        tracing::info!(platform = %metadata.platform, chars = context.len(), "ingesting");

        let mut retry = RetryContext::first(context);
        let mut created: Vec<String> = Vec::new();
        let mut modified: Vec<String> = Vec::new();
        let mut cited: BTreeMap<String, u32> = BTreeMap::new();
        let mut last_plan: Option<EditPlan> = None;

        loop {
            outcome.attempts = retry.attempt;
            let plan = self.router.route(&self.root, &retry, &metadata).await;

            if plan.edits.is_empty() {
                tracing::info!(attempt = retry.attempt, "router returned no edits; content already present");
                outcome.errors.clear();
                last_plan = Some(plan);
                break;
            }

            let report = self.apply_plan(&plan);

            for (file, (_, was_created)) in &report.touched {
                if *was_created && !created.contains(file) {
                    modified.retain(|f| f != file);
                    created.push(file.clone());
                } else if !created.contains(file) && !modified.contains(file) {
                    modified.push(file.clone());
                }
            }
            cited.extend(report.cited.iter().map(|(f, id)| (f.clone(), *id)));

            let mut errors = report.errors;
            for (file, (path, _)) in &report.touched {
                errors.extend(validate_note(path, file, self.ledger.as_ref()));
            }
            last_plan = Some(plan);

            if errors.is_empty() {
                tracing::info!(attempt = retry.attempt, "validation passed");
                outcome.errors.clear();
                break;
            }

            tracing::warn!(attempt = retry.attempt, errors = errors.len(), "validation failed");
            for e in &errors {
                tracing::debug!(error = %e, "validation error");
            }

            if retry.attempt >= max_attempts {
                outcome.errors = errors;
                break;
            }
            retry = retry.next(errors);
        }

        outcome.success = !created.is_empty() || !modified.is_empty();
        outcome.files_created = created;
        outcome.files_modified = modified;

        if let (Some(indexer), Some(plan)) = (&self.indexer, &last_plan) {
            let files: Vec<(String, Option<u32>)> = outcome
                .files_created
                .iter()
                .chain(outcome.files_modified.iter())
                .map(|f| (f.clone(), cited.get(f).copied()))
                .collect();
            match indexer
                .index(context, &metadata, plan.source_citation.quote.as_deref(), &files)
                .await
            {
                Ok(n) => outcome.chunks_indexed = n,
                Err(e) => tracing::warn!(error = %e, "chunk indexing failed; notes were still written"),
            }
        }

        tracing::info!(
            success = outcome.success,
            created = outcome.files_created.len(),
            modified = outcome.files_modified.len(),
            attempts = outcome.attempts,
            "ingestion complete"
        );
        outcome
    }

    /// Ingest items one after another.
    pub async fn ingest_bulk(&self, items: Vec<IngestItem>) -> BulkOutcome {
        let mut bulk = BulkOutcome {
            total_items: items.len(),
            ..BulkOutcome::default()
        };
        for (i, item) in items.into_iter().enumerate() {
            tracing::info!(item = i + 1, total = bulk.total_items, "bulk ingest");
            let outcome = self.ingest(&item.text, item.metadata, None).await;
            if outcome.success {
                bulk.successful += 1;
            } else {
                bulk.failed += 1;
            }
            bulk.results.push(outcome);
        }
        bulk
    }

    /// Mutate and cite every edit in `plan`.
    fn apply_plan(&self, plan: &EditPlan) -> AttemptReport {
        let mut report = AttemptReport::default();
        let mut ids: HashMap<String, u32> = HashMap::new();

        for edit in &plan.edits {
            let cites = edit.action == EditAction::UpdateCitation
                || edit.content.contains(&format!("[{}]", PLACEHOLDER_ID));

            let result = self.apply_edit(edit, cites, &mut ids);

            match result {
                Ok((file, path, created, id)) => {
                    if let Some(id) = id {
                        if !report.cited.contains_key(&file) {
                            let mut one = Citations::new();
                            one.insert(id, plan.source_citation.clone());
                            if let Err(e) = self.ledger.add_citations(&path, one) {
                                report
                                    .errors
                                    .push(format!("{}: failed to record citation: {}", file, e));
                            }
                            report.cited.insert(file.clone(), id);
                        }
                    }
                    let entry = report.touched.entry(file).or_insert((path, false));
                    entry.1 |= created;
                }
                Err(e) => {
                    tracing::warn!(file = %edit.file, error = %e, "edit failed");
                    report
                        .errors
                        .push(format!("Error processing {}: {}", edit.file, e));
                }
            }
        }

        report
    }

    /// Apply one edit, renumbering its placeholder to the file's citation id.
    fn apply_edit(
        &self,
        edit: &Edit,
        cites: bool,
        ids: &mut HashMap<String, u32>,
    ) -> Result<(String, PathBuf, bool, Option<u32>)> {
        let (file, path) = self.mutator.target(edit)?;
        let id = if cites {
            let id = match ids.get(&file) {
                Some(id) => *id,
                None => {
                    let id = self.ledger.next_id(&path)?;
                    ids.insert(file.clone(), id);
                    id
                }
            };
            Some(id)
        } else {
            None
        };

        let mut edit = edit.clone();
        if let Some(id) = id {
            edit.content = renumber_marker(&edit.content, PLACEHOLDER_ID, id);
        }
        let applied = self.mutator.apply(&edit, id.unwrap_or(PLACEHOLDER_ID))?;
        Ok((applied.file, applied.path, applied.created, id))
    }
}
