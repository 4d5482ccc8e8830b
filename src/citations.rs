//! Citation ledger: per-file maps of citation id → source record.
//!
//! [`CitationLedger`] is the seam; [`JsonSidecarLedger`] is the default
//! backend, storing each note's citations in a pretty-printed JSON file
//! next to it (`Job Search.md` → `Job Search.json`). Ids are scoped to a
//! single file, so edits to different files never conflict.
//!
//! ```json
//! {
//!   "1": { "platform": "Gmail", "timestamp": "2024-10-15T00:00:00Z",
//!          "url": null, "quote": "recruiter quoted base $150k" }
//! }
//! ```

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::models::CitationRecord;

pub type Citations = BTreeMap<u32, CitationRecord>;

/// Keys every stored citation entry must carry; `url` and `quote` may be null.
pub const REQUIRED_FIELDS: [&str; 4] = ["platform", "timestamp", "url", "quote"];

/// Storage for citation records, keyed by the markdown file they belong to.
pub trait CitationLedger: Send + Sync {
    /// All citations for `file`; empty when none exist yet.
    fn get_citations(&self, file: &Path) -> Result<Citations>;

    /// Merge `new` into the file's citations. Last write wins per id.
    fn add_citations(&self, file: &Path, new: Citations) -> Result<()>;

    /// Replace the record stored under `id`.
    fn update_citation(&self, file: &Path, id: u32, record: CitationRecord) -> Result<()> {
        let mut one = Citations::new();
        one.insert(id, record);
        self.add_citations(file, one)
    }

    /// Required keys absent from each stored entry, by id. Entries with every
    /// key present are omitted. Typed backends cannot lose keys.
    fn missing_fields(&self, _file: &Path) -> Result<BTreeMap<u32, Vec<&'static str>>> {
        Ok(BTreeMap::new())
    }

    /// One past the highest id in use for `file`.
    fn next_id(&self, file: &Path) -> Result<u32> {
        Ok(self
            .get_citations(file)?
            .keys()
            .next_back()
            .map_or(1, |max| max + 1))
    }
}

/// JSON sidecar files co-located with each note.
#[derive(Debug, Default, Clone)]
pub struct JsonSidecarLedger;

impl JsonSidecarLedger {
    pub fn new() -> Self {
        Self
    }

    pub fn sidecar_path(file: &Path) -> PathBuf {
        file.with_extension("json")
    }
}

impl CitationLedger for JsonSidecarLedger {
    fn get_citations(&self, file: &Path) -> Result<Citations> {
        let path = Self::sidecar_path(file);
        if !path.exists() {
            return Ok(Citations::new());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read citations: {}", path.display()))?;
        parse_sidecar(&raw).with_context(|| format!("Malformed citations: {}", path.display()))
    }

    fn missing_fields(&self, file: &Path) -> Result<BTreeMap<u32, Vec<&'static str>>> {
        let path = Self::sidecar_path(file);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read citations: {}", path.display()))?;
        let value: BTreeMap<String, serde_json::Value> = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed citations: {}", path.display()))?;

        let mut missing = BTreeMap::new();
        for (key, entry) in value {
            let Ok(id) = key.trim().parse::<u32>() else {
                continue;
            };
            let absent: Vec<&'static str> = match entry.as_object() {
                Some(obj) => REQUIRED_FIELDS
                    .into_iter()
                    .filter(|k| !obj.contains_key(*k))
                    .collect(),
                None => REQUIRED_FIELDS.to_vec(),
            };
            if !absent.is_empty() {
                missing.insert(id, absent);
            }
        }
        Ok(missing)
    }

    fn add_citations(&self, file: &Path, new: Citations) -> Result<()> {
        let mut citations = self.get_citations(file)?;
        citations.extend(new);

        let path = Self::sidecar_path(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&citations)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write citations: {}", path.display()))
    }
}

/// Parse a sidecar leniently: non-numeric keys and unreadable entries are
/// skipped; missing fields are filled with defaults.
pub fn parse_sidecar(raw: &str) -> Result<Citations> {
    let value: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw)?;
    let mut citations = Citations::new();
    for (key, entry) in value {
        let Ok(id) = key.trim().parse::<u32>() else {
            tracing::warn!(key = %key, "ignoring non-numeric citation key");
            continue;
        };
        match serde_json::from_value::<CitationRecord>(entry) {
            Ok(record) => {
                citations.insert(id, record);
            }
            Err(e) => tracing::warn!(id, error = %e, "ignoring unreadable citation entry"),
        }
    }
    Ok(citations)
}

/// Normalize records so every entry has a platform and a timestamp string.
pub fn clean_citations(citations: Citations) -> Citations {
    citations
        .into_iter()
        .map(|(id, mut record)| {
            if record.platform.trim().is_empty() {
                record.platform = "Manual".to_string();
            }
            record.timestamp = record.timestamp.trim().to_string();
            (id, record)
        })
        .collect()
}

/// Ids of all `[n]` markers in `text`, sorted and deduplicated.
pub fn marker_ids(text: &str) -> Vec<u32> {
    let mut ids = BTreeSet::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start && end < bytes.len() && bytes[end] == b']' {
                if let Ok(id) = text[start..end].parse::<u32>() {
                    ids.insert(id);
                }
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    ids.into_iter().collect()
}

/// Rewrite every `[from]` marker in `text` to `[to]`.
pub fn renumber_marker(text: &str, from: u32, to: u32) -> String {
    if from == to {
        return text.to_string();
    }
    text.replace(&format!("[{}]", from), &format!("[{}]", to))
}

/// In-process ledger, for tests and ephemeral vaults.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    files: RwLock<HashMap<PathBuf, Citations>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CitationLedger for InMemoryLedger {
    fn get_citations(&self, file: &Path) -> Result<Citations> {
        let files = self
            .files
            .read()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {}", e))?;
        Ok(files.get(file).cloned().unwrap_or_default())
    }

    fn add_citations(&self, file: &Path, new: Citations) -> Result<()> {
        let mut files = self
            .files
            .write()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {}", e))?;
        files.entry(file.to_path_buf()).or_default().extend(new);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(platform: &str) -> CitationRecord {
        CitationRecord {
            platform: platform.to_string(),
            timestamp: "2024-10-15T00:00:00Z".to_string(),
            url: None,
            quote: Some("q".to_string()),
            note: None,
        }
    }

    #[test]
    fn test_marker_ids() {
        assert_eq!(marker_ids("a [1] b [3]. c [1] [x] [] [12]"), vec![1, 3, 12]);
        assert!(marker_ids("no markers").is_empty());
        assert_eq!(marker_ids("[7"), Vec::<u32>::new());
    }

    #[test]
    fn test_renumber_marker() {
        assert_eq!(renumber_marker("x [1]. y [1].", 1, 4), "x [4]. y [4].");
        assert_eq!(renumber_marker("x [11].", 1, 4), "x [11].");
    }

    #[test]
    fn test_sidecar_roundtrip_and_next_id() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("career/Job Search.md");
        let ledger = JsonSidecarLedger::new();

        assert_eq!(ledger.next_id(&file).unwrap(), 1);
        let mut new = Citations::new();
        new.insert(1, record("Gmail"));
        new.insert(5, record("Slack"));
        ledger.add_citations(&file, new).unwrap();

        assert!(dir.path().join("career/Job Search.json").exists());
        assert_eq!(ledger.next_id(&file).unwrap(), 6);

        ledger.update_citation(&file, 1, record("LinkedIn")).unwrap();
        let got = ledger.get_citations(&file).unwrap();
        assert_eq!(got[&1].platform, "LinkedIn");
        assert_eq!(got[&5].platform, "Slack");
    }

    #[test]
    fn test_sidecar_writes_null_url_and_quote() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("n.md");
        let mut rec = record("Gmail");
        rec.quote = None;
        let mut new = Citations::new();
        new.insert(1, rec);
        JsonSidecarLedger.add_citations(&file, new).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("n.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["1"]["url"].is_null());
        assert!(value["1"].as_object().unwrap().contains_key("quote"));
    }

    #[test]
    fn test_parse_sidecar_is_lenient() {
        let parsed =
            parse_sidecar(r#"{"1": {"platform": "Gmail"}, "x": {}, "2": "bad"}"#).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[&1].timestamp, "");
    }

    #[test]
    fn test_clean_fills_platform() {
        let mut c = Citations::new();
        let mut r = record("");
        r.timestamp = " 2024 ".to_string();
        c.insert(2, r);
        let cleaned = clean_citations(c);
        assert_eq!(cleaned[&2].platform, "Manual");
        assert_eq!(cleaned[&2].timestamp, "2024");
    }

    #[test]
    fn test_in_memory_ledger() {
        let ledger = InMemoryLedger::new();
        let file = Path::new("/v/a.md");
        let mut c = Citations::new();
        c.insert(3, record("Drive"));
        ledger.add_citations(file, c).unwrap();
        assert_eq!(ledger.next_id(file).unwrap(), 4);
        assert!(ledger.get_citations(Path::new("/v/b.md")).unwrap().is_empty());
    }
}
