//! Connectors: sources that hand new text to the ingestion pipeline.
//!
//! A [`Connector`] describes itself ([`ConnectorMetadata`]) and fetches
//! [`ConnectorData`] items newer than its last sync. [`Connector::sync`] is
//! provided: it loads the persisted `last_sync`, fetches, optionally ingests
//! each item, and saves the new `last_sync`.
//!
//! ```text
//! <state_dir>/connectors/<id>/state.json   {"last_sync": "2024-10-15T00:00:00Z"}
//! ```
//!
//! Built-in connectors are listed in a compile-time table of factories;
//! [`ConnectorRegistry::from_config`] instantiates every configured one.
//!
//! | Type | Ids | Source |
//! |------|-----|--------|
//! | `notes` | `notes:<name>` | text and markdown files dropped into a folder |

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::config::{Config, NotesConnectorConfig};
use crate::ingest::IngestionOrchestrator;
use crate::models::SourceMetadata;
use crate::progress::{SyncProgressEvent, SyncProgressReporter};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    /// `none`, `oauth`, `api_key` or `token`.
    pub auth_type: String,
    pub sync_interval_minutes: u32,
    pub capabilities: Vec<String>,
}

/// One item fetched from a source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorData {
    pub content: String,
    /// Stable id within the source (message id, relative path, ...).
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub platform: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SyncResult {
    pub success: bool,
    pub items_fetched: usize,
    pub items_ingested: usize,
    pub errors: Vec<String>,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

/// What a sync needs from its surroundings.
pub struct SyncContext<'a> {
    pub state_dir: &'a Path,
    /// Present when fetched items should be ingested.
    pub ingest: Option<&'a IngestionOrchestrator>,
    pub progress: &'a dyn SyncProgressReporter,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConnectorState {
    #[serde(default)]
    last_sync: Option<DateTime<Utc>>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

fn state_path(state_dir: &Path, id: &str) -> PathBuf {
    state_dir
        .join("connectors")
        .join(id.replace([':', '/', '\\'], "_"))
        .join("state.json")
}

fn load_state(state_dir: &Path, id: &str) -> ConnectorState {
    std::fs::read_to_string(state_path(state_dir, id))
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

/// Persisted `last_sync` for connector `id`, if any.
pub fn last_sync(state_dir: &Path, id: &str) -> Option<DateTime<Utc>> {
    load_state(state_dir, id).last_sync
}

/// Record `at` as connector `id`'s last sync, keeping other state keys.
pub fn save_last_sync(state_dir: &Path, id: &str, at: DateTime<Utc>) -> Result<()> {
    let mut state = load_state(state_dir, id);
    state.last_sync = Some(at);
    let path = state_path(state_dir, id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(&state)?)
        .with_context(|| format!("Failed to write connector state: {}", path.display()))
}

/// Text handed to the ingestion pipeline for one item.
pub fn ingest_text(connector_name: &str, item: &ConnectorData) -> String {
    format!(
        "[Source: {}] [Timestamp: {}] {}",
        connector_name,
        item.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        item.content.trim()
    )
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn metadata(&self) -> ConnectorMetadata;

    /// Items newer than `since` (all items when `None`), oldest first.
    async fn fetch_updates(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<ConnectorData>>;

    /// Fetch since the last sync, optionally ingest, then advance `last_sync`.
    ///
    /// `last_sync` only moves when the fetch itself succeeded; individual
    /// ingestion failures are reported in `errors`.
    async fn sync(&self, ctx: &SyncContext<'_>, limit: Option<usize>) -> SyncResult {
        let meta = self.metadata();
        let since = last_sync(ctx.state_dir, &meta.id);
        let started = Utc::now();
        ctx.progress.report(SyncProgressEvent::Discovering {
            connector: meta.id.clone(),
        });

        let items = match self.fetch_updates(since, limit).await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(connector = %meta.id, error = %e, "fetch failed");
                return SyncResult {
                    success: false,
                    errors: vec![e.to_string()],
                    last_sync: since,
                    ..SyncResult::default()
                };
            }
        };

        let mut result = SyncResult {
            success: true,
            items_fetched: items.len(),
            ..SyncResult::default()
        };
        tracing::info!(connector = %meta.id, fetched = items.len(), ?since, "fetched updates");

        if let Some(orchestrator) = ctx.ingest {
            let total = items.len() as u64;
            for (i, item) in items.iter().enumerate() {
                let metadata = SourceMetadata {
                    platform: item.platform.clone(),
                    timestamp: item.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    url: item.url.clone(),
                    quote: None,
                };
                let outcome = orchestrator
                    .ingest(&ingest_text(&meta.name, item), Some(metadata), None)
                    .await;
                if outcome.success {
                    result.items_ingested += 1;
                } else {
                    result.errors.push(format!(
                        "{}: {}",
                        item.source_id,
                        outcome.errors.join("; ")
                    ));
                }
                ctx.progress.report(SyncProgressEvent::Ingesting {
                    connector: meta.id.clone(),
                    n: i as u64 + 1,
                    total,
                });
            }
        }

        match save_last_sync(ctx.state_dir, &meta.id, started) {
            Ok(()) => result.last_sync = Some(started),
            Err(e) => {
                result.errors.push(e.to_string());
                result.last_sync = since;
            }
        }

        ctx.progress.report(SyncProgressEvent::Done {
            connector: meta.id.clone(),
            fetched: result.items_fetched as u64,
            ingested: result.items_ingested as u64,
        });
        result
    }
}

// ============ Registry ============

type Factory = fn(&Config) -> Result<Vec<Arc<dyn Connector>>>;

/// Built-in connector types.
const BUILTIN: &[(&str, Factory)] = &[("notes", notes_connectors as Factory)];

pub fn builtin_types() -> Vec<&'static str> {
    BUILTIN.iter().map(|(name, _)| *name).collect()
}

/// Connector instances by id.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connector configured in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (kind, factory) in BUILTIN {
            for connector in factory(config).with_context(|| format!("Failed to build {} connectors", kind))? {
                registry.register(connector);
            }
        }
        Ok(registry)
    }

    /// Add a connector, replacing any with the same id.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.metadata().id, connector);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(id).cloned()
    }

    pub fn list(&self) -> Vec<ConnectorMetadata> {
        self.connectors.values().map(|c| c.metadata()).collect()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn clear(&mut self) {
        self.connectors.clear();
    }
}

// ============ Notes drop folder ============

fn notes_connectors(config: &Config) -> Result<Vec<Arc<dyn Connector>>> {
    config
        .connectors
        .notes
        .iter()
        .map(|(name, cfg)| -> Result<Arc<dyn Connector>> {
            Ok(Arc::new(NotesConnector::new(name, cfg)?))
        })
        .collect()
}

/// Turns text files under a folder into connector items, by modification time.
pub struct NotesConnector {
    name: String,
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    platform: String,
    follow_symlinks: bool,
}

impl NotesConnector {
    pub fn new(name: &str, config: &NotesConnectorConfig) -> Result<Self> {
        let mut excludes = vec!["**/.git/**".to_string(), "**/.*/**".to_string()];
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            name: name.to_string(),
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            platform: config.platform.clone(),
            follow_symlinks: config.follow_symlinks,
        })
    }

    fn scan(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ConnectorData>> {
        if !self.root.is_dir() {
            bail!("Notes folder does not exist: {}", self.root.display());
        }

        let mut items = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(self.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = crate::vault::relative_path(&self.root, path);
            if self.exclude.is_match(&relative) || !self.include.is_match(&relative) {
                continue;
            }

            let modified: DateTime<Utc> = entry
                .metadata()?
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_default();
            if since.is_some_and(|s| modified <= s) {
                continue;
            }

            let content = match std::fs::read_to_string(path) {
                Ok(c) if !c.trim().is_empty() => c,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(file = %relative, error = %e, "skipping unreadable note");
                    continue;
                }
            };

            items.push(ConnectorData {
                content,
                title: path.file_stem().map(|s| s.to_string_lossy().to_string()),
                url: Some(format!("file://{}", path.display())),
                source_id: relative,
                timestamp: modified,
                platform: self.platform.clone(),
            });
        }

        items.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        Ok(items)
    }
}

#[async_trait]
impl Connector for NotesConnector {
    fn metadata(&self) -> ConnectorMetadata {
        ConnectorMetadata {
            id: format!("notes:{}", self.name),
            name: self.name.clone(),
            description: format!("Text and markdown files in {}", self.root.display()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            auth_type: "none".to_string(),
            sync_interval_minutes: 10,
            capabilities: vec!["read".to_string()],
        }
    }

    async fn fetch_updates(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<ConnectorData>> {
        let mut items = self.scan(since)?;
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        Ok(items)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn notes_config(root: &Path) -> NotesConnectorConfig {
        NotesConnectorConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.md".to_string(), "**/*.txt".to_string()],
            exclude_globs: vec![],
            platform: "Drive".to_string(),
            follow_symlinks: false,
        }
    }

    fn touch(path: &Path, content: &str, secs: u64) {
        std::fs::write(path, content).unwrap();
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[tokio::test]
    async fn test_notes_fetch_filters_and_orders() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("b.md"), "second", 2_000);
        touch(&dir.path().join("a.txt"), "first", 1_000);
        touch(&dir.path().join("c.pdf"), "ignored", 3_000);
        touch(&dir.path().join("empty.md"), "  ", 3_000);

        let c = NotesConnector::new("drop", &notes_config(dir.path())).unwrap();
        let items = c.fetch_updates(None, None).await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a.txt", "b.md"]);
        assert_eq!(items[0].platform, "Drive");

        let since = DateTime::<Utc>::from(SystemTime::UNIX_EPOCH + Duration::from_secs(1_500));
        let newer = c.fetch_updates(Some(since), None).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].source_id, "b.md");

        assert_eq!(c.fetch_updates(None, Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_persists_last_sync() {
        let notes = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        touch(&notes.path().join("a.md"), "hello", 1_000);

        let c = NotesConnector::new("drop", &notes_config(notes.path())).unwrap();
        let ctx = SyncContext {
            state_dir: state.path(),
            ingest: None,
            progress: &NoProgress,
        };

        let first = c.sync(&ctx, None).await;
        assert!(first.success);
        assert_eq!(first.items_fetched, 1);
        assert_eq!(first.items_ingested, 0);
        assert!(last_sync(state.path(), "notes:drop").is_some());
        assert!(state
            .path()
            .join("connectors/notes_drop/state.json")
            .exists());

        let second = c.sync(&ctx, None).await;
        assert!(second.success);
        assert_eq!(second.items_fetched, 0);
    }

    #[tokio::test]
    async fn test_sync_missing_root_fails_without_advancing() {
        let state = TempDir::new().unwrap();
        let c = NotesConnector::new("gone", &notes_config(Path::new("/nonexistent/brainvault"))).unwrap();
        let ctx = SyncContext {
            state_dir: state.path(),
            ingest: None,
            progress: &NoProgress,
        };
        let result = c.sync(&ctx, None).await;
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(last_sync(state.path(), "notes:gone").is_none());
    }

    #[test]
    fn test_ingest_text_prefix() {
        let item = ConnectorData {
            content: "Lunch with Sam\n".to_string(),
            source_id: "x".to_string(),
            timestamp: DateTime::<Utc>::from(SystemTime::UNIX_EPOCH),
            platform: "Manual".to_string(),
            url: None,
            title: None,
        };
        assert_eq!(
            ingest_text("drop", &item),
            "[Source: drop] [Timestamp: 1970-01-01T00:00:00Z] Lunch with Sam"
        );
    }

    #[test]
    fn test_registry_from_config() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::for_vault(dir.path());
        config
            .connectors
            .notes
            .insert("drop".to_string(), notes_config(dir.path()));
        let mut registry = ConnectorRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("notes:drop").is_some());
        assert_eq!(registry.list()[0].auth_type, "none");
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(builtin_types(), vec!["notes"]);
    }
}
