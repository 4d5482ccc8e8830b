//! Core data models shared by the ingestion and query paths.
//!
//! These types carry raw input, edit plans, citations, and search contexts
//! between the router, the mutator, the ledger, and the search engines.

use serde::{Deserialize, Serialize};

/// Provenance supplied alongside a piece of text to ingest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceMetadata {
    #[serde(default = "default_platform")]
    pub platform: String,
    /// ISO-8601 timestamp.
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub quote: Option<String>,
}

fn default_platform() -> String {
    "Manual".to_string()
}

impl SourceMetadata {
    /// Manual entry stamped with the current time.
    pub fn manual_now() -> Self {
        Self {
            platform: default_platform(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            url: None,
            quote: None,
        }
    }
}

/// One entry in a file's citation sidecar.
///
/// `url` and `quote` always serialize, as `null` when absent, so every
/// sidecar entry carries the full `{platform, timestamp, url, quote}` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CitationRecord {
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl From<&SourceMetadata> for CitationRecord {
    fn from(meta: &SourceMetadata) -> Self {
        Self {
            platform: meta.platform.clone(),
            timestamp: meta.timestamp.clone(),
            url: meta.url.clone(),
            quote: meta.quote.clone(),
            note: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EditAction {
    #[default]
    #[serde(alias = "modify")]
    Append,
    Create,
    UpdateCitation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Primary,
    Secondary,
}

/// A single file edit proposed by the content router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edit {
    /// Vault-relative markdown path, e.g. `career/Job Search.md`.
    pub file: String,
    #[serde(default)]
    pub priority: Priority,
    /// Text to write, with `[1]` standing for this source's citation.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub action: EditAction,
    #[serde(default)]
    pub reason: String,
    /// Target H2 heading for a section-scoped insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Existing text that an `update_citation` edit appends a marker to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find: Option<String>,
}

/// Router output for one ingestion attempt. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditPlan {
    pub source_citation: CitationRecord,
    #[serde(default)]
    pub edits: Vec<Edit>,
}

/// An embedded unit of ingested text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: String,
    pub text: String,
    pub source_file: String,
    pub platform: String,
    pub timestamp: String,
    pub citation_id: Option<u32>,
    pub chunk_index: i64,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// A citation resolved against a file's sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextCitation {
    pub id: u32,
    pub platform: String,
    pub timestamp: String,
    pub url: Option<String>,
    pub quote: Option<String>,
    pub note: Option<String>,
}

impl ContextCitation {
    pub fn from_record(id: u32, record: &CitationRecord) -> Self {
        Self {
            id,
            platform: record.platform.clone(),
            timestamp: record.timestamp.clone(),
            url: record.url.clone(),
            quote: record.quote.clone(),
            note: record.note.clone(),
        }
    }
}

/// Evidence handed to the answer synthesizer. Lives for one query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchContext {
    pub file: String,
    pub text: String,
    #[serde(default)]
    pub citations: Vec<ContextCitation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Result of one ingestion call.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct IngestOutcome {
    pub success: bool,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub errors: Vec<String>,
    /// How many attempts the router/validate loop took.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub chunks_indexed: usize,
}
