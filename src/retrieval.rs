//! Vector retrieval engine.
//!
//! An eight-stage pipeline, each stage a plain transformation of the
//! previous stage's output:
//!
//! ```text
//! validate → preprocess → embed → vector search (2×top_k)
//!          → filter → rank → diversify → format (truncate to top_k)
//! ```
//!
//! Ranking blends three signals with configurable weights:
//!
//! ```text
//! final = w_sim·similarity + w_rec·recency + w_q·source_quality
//! ```
//!
//! Embedding and vector-store failures are logged and degrade to an empty,
//! well-formed response; [`RetrievalEngine::search`] never returns `Err`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::RetrievalConfig;
use crate::embedding::CachedEmbedder;
use crate::models::{ContextCitation, SearchContext};
use crate::store::{VectorHit, VectorStore};

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("swe", "software engineering"),
    ("ml", "machine learning"),
    ("ai", "artificial intelligence"),
    ("cs", "computer science"),
];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SearchFilters {
    /// Exact platform match.
    #[serde(default)]
    pub platform: Option<String>,
    /// Substring match on the source file path.
    #[serde(default)]
    pub file_path: Option<String>,
    /// Inclusive ISO-8601 lower bound.
    #[serde(default)]
    pub date_from: Option<String>,
    /// Inclusive ISO-8601 upper bound.
    #[serde(default)]
    pub date_to: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub min_similarity: Option<f64>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub platform: Option<String>,
    pub url: Option<String>,
    pub quote: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub chunk_id: String,
    pub file: String,
    pub text: String,
    pub snippet: String,
    pub similarity_score: f64,
    pub final_score: f64,
    pub platform: Option<String>,
    pub timestamp: Option<String>,
    pub chunk_index: i64,
    pub citation_id: Option<u32>,
    pub source: Provenance,
}

impl SearchResult {
    /// Evidence form for the answer synthesizer.
    pub fn to_context(&self) -> SearchContext {
        let citations = self
            .citation_id
            .map(|id| {
                vec![ContextCitation {
                    id,
                    platform: self.platform.clone().unwrap_or_default(),
                    timestamp: self.timestamp.clone().unwrap_or_default(),
                    url: self.source.url.clone(),
                    quote: self.source.quote.clone(),
                    note: None,
                }]
            })
            .unwrap_or_default();
        SearchContext {
            file: self.file.clone(),
            text: self.text.clone(),
            citations,
            score: Some(self.final_score),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    pub query: String,
    pub processed_query: String,
    pub results: Vec<SearchResult>,
    pub total: usize,
    pub took_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SearchResponse {
    fn empty(reason: impl Into<String>) -> Self {
        Self {
            query: String::new(),
            processed_query: String::new(),
            results: Vec::new(),
            total: 0,
            took_ms: 0.0,
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub total_chunks: usize,
    pub collection_name: String,
    pub embedding_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A vector hit with its similarity, carried through filter/rank/diversify.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub hit: VectorHit,
    pub similarity: f64,
    pub final_score: f64,
}

impl Candidate {
    pub fn from_hit(hit: VectorHit) -> Self {
        let similarity = 1.0 - hit.distance as f64;
        Self {
            hit,
            similarity,
            final_score: 0.0,
        }
    }
}

pub struct RetrievalEngine {
    store: Arc<dyn VectorStore>,
    embedder: Arc<CachedEmbedder>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<CachedEmbedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> SearchResponse {
        let started = Instant::now();

        if request.query.trim().is_empty() {
            return SearchResponse::empty("Empty query");
        }

        let top_k = request.top_k.unwrap_or(self.config.top_k).max(1);
        let min_similarity = request.min_similarity.unwrap_or(self.config.min_similarity);
        let processed = preprocess_query(&request.query);
        tracing::info!(query = %request.query, top_k, "search");

        let mut error = None;
        let candidates = match self.embedder.embed_query(&processed).await {
            Ok(vector) => match self.store.query(&vector, top_k * 2).await {
                Ok(hits) => hits.into_iter().map(Candidate::from_hit).collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "vector search failed; returning no results");
                    error = Some(format!("vector search unavailable: {}", e));
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed; returning no results");
                error = Some(format!("embedding unavailable: {}", e));
                Vec::new()
            }
        };

        let filtered = filter_candidates(candidates, &request.filters, min_similarity);
        let ranked = rank(filtered, &self.config, Utc::now());
        let diverse = diversify(ranked, self.config.max_per_file);
        let results: Vec<SearchResult> = diverse
            .into_iter()
            .take(top_k)
            .map(|c| format_result(c, self.config.snippet_chars))
            .collect();

        tracing::debug!(results = results.len(), "search complete");

        SearchResponse {
            query: request.query.clone(),
            processed_query: processed,
            total: results.len(),
            results,
            took_ms: (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
            error,
        }
    }

    pub async fn stats(&self) -> CollectionStats {
        let (total_chunks, error) = match self.store.count().await {
            Ok(n) => (n, None),
            Err(e) => {
                tracing::warn!(error = %e, "collection count failed");
                (0, Some(e.to_string()))
            }
        };
        CollectionStats {
            total_chunks,
            collection_name: self.store.collection().to_string(),
            embedding_model: self.embedder.model_name().to_string(),
            error,
        }
    }
}

/// Lowercase, collapse whitespace, expand whole-word abbreviations.
pub fn preprocess_query(query: &str) -> String {
    let collapsed = query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut out = String::with_capacity(collapsed.len());
    let mut word = String::new();
    let flush = |word: &mut String, out: &mut String| {
        if word.is_empty() {
            return;
        }
        match ABBREVIATIONS.iter().find(|(abbr, _)| *abbr == word.as_str()) {
            Some((_, full)) => out.push_str(full),
            None => out.push_str(word),
        }
        word.clear();
    };

    for c in collapsed.chars() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
        } else {
            flush(&mut word, &mut out);
            out.push(c);
        }
    }
    flush(&mut word, &mut out);
    out
}

fn in_archive(path: &str) -> bool {
    format!("/{}", path.replace('\\', "/")).contains("/archive/")
}

/// Similarity floor, metadata filters, and the unconditional archive exclusion.
pub fn filter_candidates(
    candidates: Vec<Candidate>,
    filters: &SearchFilters,
    min_similarity: f64,
) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| {
            let meta = &c.hit.metadata;
            if c.similarity < min_similarity || in_archive(&meta.source_file) {
                return false;
            }
            if let Some(platform) = &filters.platform {
                if &meta.platform != platform {
                    return false;
                }
            }
            if let Some(fragment) = &filters.file_path {
                if !meta.source_file.contains(fragment.as_str()) {
                    return false;
                }
            }
            if let Some(from) = &filters.date_from {
                if meta.timestamp.as_str() < from.as_str() {
                    return false;
                }
            }
            if let Some(to) = &filters.date_to {
                if meta.timestamp.as_str() > to.as_str() {
                    return false;
                }
            }
            true
        })
        .collect()
}

fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = ts.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Step function of age in days; `0.5` when missing or unparseable.
pub fn recency_score(timestamp: &str, now: DateTime<Utc>) -> f64 {
    let Some(ts) = parse_timestamp(timestamp.trim()) else {
        return 0.5;
    };
    let age_days = (now - ts).num_days();
    match age_days {
        d if d <= 7 => 1.0,
        d if d <= 30 => 0.8,
        d if d <= 90 => 0.6,
        d if d <= 180 => 0.4,
        _ => 0.2,
    }
}

pub fn source_quality(platform: &str) -> f64 {
    match platform.trim().to_lowercase().as_str() {
        "manual" => 1.0,
        "linkedin" | "gmail" => 0.9,
        "discord" | "slack" => 0.8,
        "drive" => 0.7,
        _ => 0.5,
    }
}

/// Score and stable-sort descending; ties keep vector-search order.
pub fn rank(
    mut candidates: Vec<Candidate>,
    config: &RetrievalConfig,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    for c in &mut candidates {
        let meta = &c.hit.metadata;
        c.final_score = config.similarity_weight * c.similarity
            + config.recency_weight * recency_score(&meta.timestamp, now)
            + config.quality_weight * source_quality(&meta.platform);
    }
    candidates.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

/// Keep at most `max_per_file` candidates per source file, in order.
pub fn diversify(candidates: Vec<Candidate>, max_per_file: usize) -> Vec<Candidate> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    candidates
        .into_iter()
        .filter(|c| {
            let n = counts.entry(c.hit.metadata.source_file.clone()).or_insert(0);
            if *n < max_per_file {
                *n += 1;
                true
            } else {
                false
            }
        })
        .collect()
}

/// Cut at the last `.` if it lies past 70% of `limit`, else hard-cut with `...`.
pub fn make_snippet(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .nth(limit)
        .map_or(text.len(), |(i, _)| i);
    let truncated = &text[..cut];

    if let Some(pos) = truncated.rfind('.') {
        let chars_before = truncated[..pos].chars().count();
        if chars_before as f64 > limit as f64 * 0.7 {
            return truncated[..=pos].to_string();
        }
    }
    format!("{}...", truncated)
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn format_result(c: Candidate, snippet_chars: usize) -> SearchResult {
    let meta = c.hit.metadata;
    SearchResult {
        chunk_id: c.hit.id,
        snippet: make_snippet(&c.hit.document, snippet_chars),
        text: c.hit.document,
        similarity_score: round3(c.similarity),
        final_score: round3(c.final_score),
        platform: non_empty(&meta.platform),
        timestamp: non_empty(&meta.timestamp),
        chunk_index: meta.chunk_index,
        citation_id: meta.citation_id,
        source: Provenance {
            platform: non_empty(&meta.platform),
            url: meta.url,
            quote: meta.quote,
        },
        file: meta.source_file,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::store::memory::InMemoryVectorStore;
    use crate::store::{ChunkMetadata, VectorRecord};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).unwrap()
    }

    fn candidate(file: &str, sim: f64, platform: &str, ts: &str) -> Candidate {
        Candidate {
            hit: VectorHit {
                id: format!("{}-{}", file, sim),
                document: "text".to_string(),
                metadata: ChunkMetadata {
                    source_file: file.to_string(),
                    platform: platform.to_string(),
                    timestamp: ts.to_string(),
                    ..Default::default()
                },
                distance: (1.0 - sim) as f32,
            },
            similarity: sim,
            final_score: 0.0,
        }
    }

    #[test]
    fn test_preprocess_expands_abbreviations() {
        assert_eq!(
            preprocess_query("  SWE   roles in ML,  not html "),
            "software engineering roles in machine learning, not html"
        );
        assert_eq!(preprocess_query("AI/CS"), "artificial intelligence/computer science");
        assert_eq!(preprocess_query("email"), "email");
    }

    #[test]
    fn test_recency_steps() {
        let n = now();
        assert_eq!(recency_score("2024-10-30T00:00:00Z", n), 1.0);
        assert_eq!(recency_score("2024-10-15T00:00:00Z", n), 0.8);
        assert_eq!(recency_score("2024-08-15", n), 0.6);
        assert_eq!(recency_score("2024-06-01T00:00:00Z", n), 0.4);
        assert_eq!(recency_score("2020-01-01T00:00:00Z", n), 0.2);
        assert_eq!(recency_score("", n), 0.5);
        assert_eq!(recency_score("yesterday", n), 0.5);
    }

    #[test]
    fn test_source_quality_table() {
        assert_eq!(source_quality("Manual"), 1.0);
        assert_eq!(source_quality("Gmail"), 0.9);
        assert_eq!(source_quality("linkedin"), 0.9);
        assert_eq!(source_quality("Slack"), 0.8);
        assert_eq!(source_quality("Drive"), 0.7);
        assert_eq!(source_quality("Twitter"), 0.5);
    }

    #[test]
    fn test_filters() {
        let cands = vec![
            candidate("career/Job.md", 0.9, "Gmail", "2024-10-15T00:00:00Z"),
            candidate("archive/Old.md", 0.95, "Gmail", "2024-10-15T00:00:00Z"),
            candidate("personal/Notes.md", 0.2, "Manual", "2024-01-01T00:00:00Z"),
            candidate("career/Slack.md", 0.8, "Slack", "2024-09-01T00:00:00Z"),
        ];

        let out = filter_candidates(cands.clone(), &SearchFilters::default(), 0.3);
        let files: Vec<_> = out.iter().map(|c| c.hit.metadata.source_file.as_str()).collect();
        assert_eq!(files, vec!["career/Job.md", "career/Slack.md"]);

        let f = SearchFilters {
            platform: Some("Gmail".to_string()),
            ..Default::default()
        };
        assert_eq!(filter_candidates(cands.clone(), &f, 0.0).len(), 1);

        let f = SearchFilters {
            date_from: Some("2024-09-01".to_string()),
            date_to: Some("2024-12-31".to_string()),
            file_path: Some("career/".to_string()),
            ..Default::default()
        };
        assert_eq!(filter_candidates(cands, &f, 0.0).len(), 2);
    }

    #[test]
    fn test_rank_is_non_increasing_and_stable() {
        let config = RetrievalConfig::default();
        let cands = vec![
            candidate("a.md", 0.5, "Gmail", ""),
            candidate("b.md", 0.9, "Gmail", ""),
            candidate("c.md", 0.5, "Gmail", ""),
        ];
        let ranked = rank(cands, &config, now());
        assert_eq!(ranked[0].hit.metadata.source_file, "b.md");
        assert_eq!(ranked[1].hit.metadata.source_file, "a.md");
        assert_eq!(ranked[2].hit.metadata.source_file, "c.md");
        for pair in ranked.windows(2) {
            assert!(pair[0].final_score >= pair[1].final_score);
        }
        // 0.7*0.9 + 0.2*0.5 + 0.1*0.9
        assert!((ranked[0].final_score - 0.82).abs() < 1e-9);
    }

    #[test]
    fn test_diversity_cap() {
        let cands: Vec<_> = (0..5)
            .map(|i| candidate("same.md", 0.9 - i as f64 * 0.01, "Manual", ""))
            .chain(std::iter::once(candidate("other.md", 0.1, "Manual", "")))
            .collect();
        let out = diversify(cands, 3);
        assert_eq!(out.len(), 4);
        assert_eq!(out[3].hit.metadata.source_file, "other.md");
    }

    #[test]
    fn test_snippet_rules() {
        assert_eq!(make_snippet("short", 200), "short");

        let sentence = format!("{}. tail that keeps going", "a".repeat(80));
        assert_eq!(make_snippet(&sentence, 100), format!("{}.", "a".repeat(80)));

        let early = format!("ab. {}", "c".repeat(120));
        assert_eq!(make_snippet(&early, 100), format!("ab. {}...", "c".repeat(96)));
    }

    #[tokio::test]
    async fn test_empty_query_short_circuits() {
        let store = Arc::new(InMemoryVectorStore::default());
        let embedder = Arc::new(CachedEmbedder::new(EmbeddingConfig::hashed(64)).unwrap());
        let engine = RetrievalEngine::new(store, embedder, RetrievalConfig::default());
        let resp = engine.search(&SearchRequest::new("   ")).await;
        assert_eq!(resp.total, 0);
        assert_eq!(resp.error.as_deref(), Some("Empty query"));
    }

    #[tokio::test]
    async fn test_disabled_embedder_degrades_to_empty() {
        let store = Arc::new(InMemoryVectorStore::default());
        let embedder = Arc::new(CachedEmbedder::new(EmbeddingConfig::default()).unwrap());
        let engine = RetrievalEngine::new(store, embedder, RetrievalConfig::default());
        let resp = engine.search(&SearchRequest::new("meta offer")).await;
        assert!(resp.results.is_empty());
        assert!(resp.error.is_some());
        assert_eq!(resp.processed_query, "meta offer");
    }

    #[tokio::test]
    async fn test_search_end_to_end_with_cap() {
        let store = Arc::new(InMemoryVectorStore::default());
        let embedder = Arc::new(CachedEmbedder::new(EmbeddingConfig::hashed(256)).unwrap());

        let mut records = Vec::new();
        for i in 0..5 {
            let text = format!("meta offer detail number {}", i);
            records.push(VectorRecord {
                id: format!("big-{}", i),
                embedding: crate::embedding::hash_vector(&text, 256),
                document: text,
                metadata: ChunkMetadata {
                    source_file: "career/Big.md".to_string(),
                    platform: "Gmail".to_string(),
                    timestamp: "2024-10-15T00:00:00Z".to_string(),
                    ..Default::default()
                },
            });
        }
        records.push(VectorRecord {
            id: "small".to_string(),
            embedding: crate::embedding::hash_vector("meta offer", 256),
            document: "meta offer".to_string(),
            metadata: ChunkMetadata {
                source_file: "career/Small.md".to_string(),
                platform: "Manual".to_string(),
                ..Default::default()
            },
        });
        store.add(&records).await.unwrap();

        let engine = RetrievalEngine::new(store, embedder, RetrievalConfig::default());
        let resp = engine.search(&SearchRequest::new("Meta offer")).await;
        assert!(resp.error.is_none());
        assert_eq!(resp.total, resp.results.len());
        assert!(resp.results.len() <= 4);
        assert!(
            resp.results
                .iter()
                .filter(|r| r.file == "career/Big.md")
                .count()
                <= 3
        );
        for pair in resp.results.windows(2) {
            assert!(pair[0].final_score >= pair[1].final_score);
        }

        let stats = engine.stats().await;
        assert_eq!(stats.total_chunks, 6);
        assert_eq!(stats.collection_name, "markdown_notes");
        assert_eq!(stats.embedding_model, "token-hash");
    }
}
