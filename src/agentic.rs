//! Agentic search: a bounded tool-use loop over the vault.
//!
//! The model gets two tools, `grep_vault` and `read_file`, and calls them
//! until it answers in plain text or the iteration bound is hit. Contexts
//! are then rebuilt from every file the tools touched: each file is re-read
//! and its first three body paragraphs become the context text, with `[n]`
//! markers resolved against the file's citations.
//!
//! `grep_vault` shells out to `rg` under a hard timeout and falls back to
//! an in-process regex walk when `rg` is missing, slow, or errors.
//! `read_file` refuses paths that leave the vault.

use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

use crate::citations::{marker_ids, CitationLedger, Citations};
use crate::config::AgenticConfig;
use crate::llm::{CompletionRequest, ContentBlock, LanguageModel, Message, Role, ToolSpec};
use crate::models::{ContextCitation, SearchContext};
use crate::vault::{relative_path, resolve_in_vault, VaultPathError, ABOUT_FILE};

const MAX_CONTEXT_PARAGRAPHS: usize = 3;
const BOILERPLATE_MARKER: &str = "This file contains";
const LOOP_MAX_TOKENS: u32 = 4000;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Access denied: path escapes the vault: {0}")]
    PathEscapes(String),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Invalid pattern: {0}")]
    BadPattern(String),
    #[error("Invalid tool input: {0}")]
    InvalidInput(String),
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VaultPathError> for ToolError {
    fn from(e: VaultPathError) -> Self {
        match e {
            VaultPathError::Escapes(p) => ToolError::PathEscapes(p),
            VaultPathError::Invalid(p) => ToolError::InvalidInput(p),
        }
    }
}

/// A parsed tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    Grep { pattern: String, limit: usize },
    Read { path: String },
}

impl ToolCall {
    pub fn parse(
        name: &str,
        input: &serde_json::Value,
        default_limit: usize,
    ) -> Result<Self, ToolError> {
        match name {
            "grep_vault" => {
                let pattern = input
                    .get("pattern")
                    .and_then(|p| p.as_str())
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| ToolError::InvalidInput("grep_vault needs 'pattern'".to_string()))?;
                let limit = input
                    .get("limit")
                    .and_then(|l| l.as_u64())
                    .map_or(default_limit, |l| l as usize)
                    .max(1);
                Ok(ToolCall::Grep {
                    pattern: pattern.to_string(),
                    limit,
                })
            }
            "read_file" => {
                let path = input
                    .get("filepath")
                    .and_then(|p| p.as_str())
                    .ok_or_else(|| ToolError::InvalidInput("read_file needs 'filepath'".to_string()))?;
                Ok(ToolCall::Read {
                    path: path.to_string(),
                })
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

pub fn tool_specs(default_limit: usize) -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "grep_vault".to_string(),
            description: "Search all markdown files in the vault with a case-insensitive regex. \
                          Returns matching lines, most recently modified files first."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regex pattern (case-insensitive)"},
                    "limit": {"type": "integer", "description": "Maximum matches to return", "default": default_limit}
                },
                "required": ["pattern"]
            }),
        },
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read a markdown file from the vault along with its citations.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "filepath": {"type": "string", "description": "Path relative to the vault, e.g. 'career/Job Search.md'"}
                },
                "required": ["filepath"]
            }),
        },
    ]
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GrepMatch {
    pub file: String,
    pub line_number: u64,
    pub match_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadResult {
    pub filepath: String,
    pub content: String,
    pub citations: Citations,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgenticResult {
    pub success: bool,
    pub query: String,
    pub contexts: Vec<SearchContext>,
    pub iterations: usize,
    /// The model's closing text, when it produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgenticResult {
    fn failed(query: &str, iterations: usize, error: impl Into<String>) -> Self {
        Self {
            success: false,
            query: query.to_string(),
            contexts: Vec::new(),
            iterations,
            final_text: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone)]
pub struct AgenticSearch {
    root: PathBuf,
    model: Arc<dyn LanguageModel>,
    ledger: Arc<dyn CitationLedger>,
    config: AgenticConfig,
}

impl AgenticSearch {
    pub fn new(
        root: impl Into<PathBuf>,
        model: Arc<dyn LanguageModel>,
        ledger: Arc<dyn CitationLedger>,
        config: AgenticConfig,
    ) -> Self {
        Self {
            root: root.into(),
            model,
            ledger,
            config,
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are a search agent for a personal knowledge vault of markdown notes.\n\n\
             Answer the user's query by searching and reading their notes.\n\n\
             Tools:\n\
             1. grep_vault(pattern, limit={}) - regex search over all notes, recent files first\n\
             2. read_file(filepath) - read one note and its citations\n\n\
             Strategy:\n\
             - grep for the key names and terms in the query\n\
             - read the most promising files\n\
             - stop calling tools once you have enough to answer\n\n\
             Do not read more than 5 files unless necessary.",
            self.config.grep_limit
        )
    }

    pub async fn search(&self, query: &str) -> AgenticResult {
        tracing::info!(query = %query, "agentic search");

        let mut messages = vec![Message::user(query)];
        let mut touched: Vec<String> = Vec::new();
        let tools = tool_specs(self.config.grep_limit);

        for iteration in 1..=self.config.max_iterations {
            let request = CompletionRequest {
                system: Some(self.system_prompt()),
                messages: messages.clone(),
                tools: tools.clone(),
                max_tokens: Some(LOOP_MAX_TOKENS),
                temperature: None,
            };

            let completion = match self.model.complete(request).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, iteration, "agentic search model call failed");
                    return AgenticResult::failed(query, iteration, format!("LLM error: {}", e));
                }
            };

            let calls: Vec<(String, String, serde_json::Value)> = completion
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();
            messages.push(Message::blocks(Role::Assistant, completion.content.clone()));

            if calls.is_empty() {
                let contexts = self.extract_contexts(&touched);
                tracing::info!(iterations = iteration, contexts = contexts.len(), "agentic search complete");
                let text = completion.joined_text();
                return AgenticResult {
                    success: true,
                    query: query.to_string(),
                    contexts,
                    iterations: iteration,
                    final_text: (!text.trim().is_empty()).then_some(text),
                    error: None,
                };
            }

            let mut results = Vec::with_capacity(calls.len());
            for (id, name, input) in calls {
                tracing::debug!(tool = %name, input = %input, "tool call");
                let (content, is_error) =
                    match ToolCall::parse(&name, &input, self.config.grep_limit) {
                        Ok(call) => match self.execute(&call, &mut touched).await {
                            Ok(value) => (value.to_string(), false),
                            Err(e) => (json!({"error": e.to_string()}).to_string(), true),
                        },
                        Err(e) => (json!({"error": e.to_string()}).to_string(), true),
                    };
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id,
                    content,
                    is_error,
                });
            }
            messages.push(Message::blocks(Role::User, results));
        }

        tracing::warn!(max = self.config.max_iterations, "agentic search hit iteration bound");
        AgenticResult::failed(query, self.config.max_iterations, "Max iterations reached")
    }

    /// Run one tool, recording every file it touches.
    pub async fn execute(
        &self,
        call: &ToolCall,
        touched: &mut Vec<String>,
    ) -> Result<serde_json::Value, ToolError> {
        match call {
            ToolCall::Grep { pattern, limit } => {
                let matches = grep_vault(
                    &self.root,
                    pattern,
                    *limit,
                    Duration::from_secs(self.config.grep_timeout_secs),
                )
                .await?;
                touched.extend(
                    matches
                        .iter()
                        .filter_map(|m| canonical_path(&self.root, &m.file)),
                );
                Ok(json!({
                    "matches": matches,
                    "count": matches.len(),
                    "pattern": pattern,
                }))
            }
            ToolCall::Read { path } => {
                let result = read_file(&self.root, path, self.ledger.as_ref())?;
                touched.push(result.filepath.clone());
                Ok(serde_json::to_value(result).map_err(|e| ToolError::InvalidInput(e.to_string()))?)
            }
        }
    }

    /// One context per distinct touched file, first occurrence wins.
    ///
    /// Paths are compared in canonical vault-relative form, so `./a/B.md`
    /// and `a/B.md` count as one file.
    pub fn extract_contexts(&self, touched: &[String]) -> Vec<SearchContext> {
        let mut seen = HashSet::new();
        let mut contexts = Vec::new();

        for raw in touched {
            let Some(file) = canonical_path(&self.root, raw) else {
                continue;
            };
            if !seen.insert(file.clone()) {
                continue;
            }
            let is_about = Path::new(&file)
                .file_name()
                .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(ABOUT_FILE));
            if is_about {
                continue;
            }
            let path = self.root.join(&file);
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };

            let paragraphs = body_paragraphs(&content);
            if paragraphs.is_empty() {
                continue;
            }
            let text = paragraphs
                .into_iter()
                .take(MAX_CONTEXT_PARAGRAPHS)
                .collect::<Vec<_>>()
                .join("\n\n");

            let citations = self.ledger.get_citations(&path).unwrap_or_default();
            let resolved = marker_ids(&text)
                .into_iter()
                .filter_map(|id| citations.get(&id).map(|r| ContextCitation::from_record(id, r)))
                .collect();

            contexts.push(SearchContext {
                file,
                text,
                citations: resolved,
                score: None,
            });
        }
        contexts
    }
}

/// Vault-relative `a/B.md` form of a tool-supplied path, `None` when it
/// cannot be resolved inside the vault.
fn canonical_path(root: &Path, file: &str) -> Option<String> {
    resolve_in_vault(root, file)
        .ok()
        .map(|path| relative_path(root, &path))
        .filter(|rel| !rel.is_empty())
}

/// Non-empty paragraphs that are neither headings nor folder boilerplate.
pub fn body_paragraphs(content: &str) -> Vec<&str> {
    content
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty() && !p.starts_with('#') && !p.contains(BOILERPLATE_MARKER))
        .collect()
}

/// Read a vault note and its citations.
pub fn read_file(
    root: &Path,
    filepath: &str,
    ledger: &dyn CitationLedger,
) -> Result<ReadResult, ToolError> {
    let path = resolve_in_vault(root, filepath)?;
    if !path.is_file() {
        return Err(ToolError::NotFound(filepath.to_string()));
    }
    let content = std::fs::read_to_string(&path)?;
    let citations = ledger.get_citations(&path).unwrap_or_default();
    Ok(ReadResult {
        filepath: relative_path(root, &path),
        length: content.chars().count(),
        content,
        citations,
    })
}

/// Case-insensitive regex search over the vault's markdown files.
///
/// Matches are ordered by file modification time (newest first), then by
/// line number, and truncated to `limit`.
pub async fn grep_vault(
    root: &Path,
    pattern: &str,
    limit: usize,
    timeout: Duration,
) -> Result<Vec<GrepMatch>, ToolError> {
    let matches = match grep_ripgrep(root, pattern, timeout).await {
        Some(m) => m,
        None => {
            let root = root.to_path_buf();
            let pattern = pattern.to_string();
            tokio::task::spawn_blocking(move || grep_fallback(&root, &pattern))
                .await
                .map_err(|e| ToolError::Io(std::io::Error::other(e)))??
        }
    };
    Ok(sort_and_limit(root, matches, limit))
}

/// `None` when `rg` is unavailable, times out, or fails.
async fn grep_ripgrep(root: &Path, pattern: &str, timeout: Duration) -> Option<Vec<GrepMatch>> {
    let mut cmd = tokio::process::Command::new("rg");
    cmd.args([
        "--line-number",
        "--no-heading",
        "--with-filename",
        "--null",
        "--color",
        "never",
        "-i",
        "--type",
        "md",
        "-e",
    ])
    .arg(pattern)
    .arg(root)
    .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "rg unavailable; using in-process grep");
            return None;
        }
        Err(_) => {
            tracing::warn!(?timeout, "rg timed out; using in-process grep");
            return None;
        }
    };

    match output.status.code() {
        Some(0) => Some(parse_rg_output(root, &String::from_utf8_lossy(&output.stdout))),
        Some(1) => Some(Vec::new()),
        _ => {
            tracing::debug!(stderr = %String::from_utf8_lossy(&output.stderr), "rg failed; using in-process grep");
            None
        }
    }
}

/// Parse `path\0line:text` records.
fn parse_rg_output(root: &Path, stdout: &str) -> Vec<GrepMatch> {
    stdout
        .lines()
        .filter_map(|line| {
            let (path, rest) = line.split_once('\0')?;
            let (num, text) = rest.split_once(':')?;
            Some(GrepMatch {
                file: crate::vault::relative_path(root, Path::new(path)),
                line_number: num.parse().ok()?,
                match_text: text.trim().to_string(),
            })
        })
        .collect()
}

pub fn grep_fallback(root: &Path, pattern: &str) -> Result<Vec<GrepMatch>, ToolError> {
    let re = regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| ToolError::BadPattern(e.to_string()))?;

    let mut matches = Vec::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        let file = crate::vault::relative_path(root, path);
        for (i, line) in content.lines().enumerate() {
            if re.is_match(line) {
                matches.push(GrepMatch {
                    file: file.clone(),
                    line_number: i as u64 + 1,
                    match_text: line.trim().to_string(),
                });
            }
        }
    }
    Ok(matches)
}

fn sort_and_limit(root: &Path, mut matches: Vec<GrepMatch>, limit: usize) -> Vec<GrepMatch> {
    let mut mtimes: HashMap<String, SystemTime> = HashMap::new();
    for m in &matches {
        mtimes.entry(m.file.clone()).or_insert_with(|| {
            std::fs::metadata(root.join(&m.file))
                .and_then(|md| md.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        });
    }
    matches.sort_by(|a, b| {
        mtimes[&b.file]
            .cmp(&mtimes[&a.file])
            .then_with(|| a.file.cmp(&b.file))
            .then(a.line_number.cmp(&b.line_number))
    });
    matches.truncate(limit);
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::citations::JsonSidecarLedger;
    use crate::llm::{Completion, ScriptedModel};
    use crate::models::CitationRecord;
    use tempfile::TempDir;

    fn vault() -> TempDir {
        let dir = TempDir::new().unwrap();
        let career = dir.path().join("career");
        std::fs::create_dir_all(&career).unwrap();
        std::fs::write(
            career.join("about.md"),
            "# Career\n\nThis file contains career notes.\n",
        )
        .unwrap();
        std::fs::write(
            career.join("Meta.md"),
            "# Meta\n\nApplied to Meta for SWE role [1].\n\nRecruiter quoted base $150k [1].\n\n## Related\n\n",
        )
        .unwrap();
        let mut citations = Citations::new();
        citations.insert(
            1,
            CitationRecord {
                platform: "Gmail".to_string(),
                timestamp: "2024-10-15T00:00:00Z".to_string(),
                url: None,
                quote: Some("base $150k".to_string()),
                note: None,
            },
        );
        JsonSidecarLedger::new()
            .add_citations(&career.join("Meta.md"), citations)
            .unwrap();
        dir
    }

    fn search(dir: &TempDir, model: Arc<ScriptedModel>) -> AgenticSearch {
        AgenticSearch::new(
            dir.path(),
            model,
            Arc::new(JsonSidecarLedger::new()),
            AgenticConfig::default(),
        )
    }

    #[test]
    fn test_parse_tool_calls() {
        assert_eq!(
            ToolCall::parse("grep_vault", &json!({"pattern": "Meta"}), 20).unwrap(),
            ToolCall::Grep {
                pattern: "Meta".to_string(),
                limit: 20
            }
        );
        assert_eq!(
            ToolCall::parse("read_file", &json!({"filepath": "a/B.md"}), 20).unwrap(),
            ToolCall::Read {
                path: "a/B.md".to_string()
            }
        );
        assert!(matches!(
            ToolCall::parse("rm_rf", &json!({}), 20),
            Err(ToolError::UnknownTool(_))
        ));
        assert!(matches!(
            ToolCall::parse("grep_vault", &json!({}), 20),
            Err(ToolError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_read_file_rejects_traversal() {
        let dir = vault();
        let result = read_file(dir.path(), "../../etc/passwd", &JsonSidecarLedger::new());
        assert!(matches!(result, Err(ToolError::PathEscapes(_))));
    }

    #[test]
    fn test_read_file_with_citations() {
        let dir = vault();
        let result = read_file(dir.path(), "career/Meta.md", &JsonSidecarLedger::new()).unwrap();
        assert!(result.content.contains("$150k"));
        assert_eq!(result.citations[&1].platform, "Gmail");
        assert!(matches!(
            read_file(dir.path(), "career/Nope.md", &JsonSidecarLedger::new()),
            Err(ToolError::NotFound(_))
        ));
    }

    #[test]
    fn test_grep_fallback_case_insensitive() {
        let dir = vault();
        let matches = grep_fallback(dir.path(), "META").unwrap();
        assert!(matches.iter().all(|m| m.file == "career/Meta.md"));
        assert_eq!(matches[0].line_number, 1);
        assert!(matches!(
            grep_fallback(dir.path(), "("),
            Err(ToolError::BadPattern(_))
        ));
    }

    #[tokio::test]
    async fn test_grep_orders_by_mtime_and_limits() {
        let dir = vault();
        let older = dir.path().join("career/Google.md");
        std::fs::write(&older, "# Google\n\nSWE role at Google.\n").unwrap();
        let file = std::fs::File::options().write(true).open(&older).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000))
            .unwrap();

        let matches = grep_vault(dir.path(), "swe role", 20, Duration::from_secs(5))
            .await
            .unwrap();
        let files: Vec<_> = matches.iter().map(|m| m.file.as_str()).collect();
        assert_eq!(files, vec!["career/Meta.md", "career/Google.md"]);

        let limited = grep_vault(dir.path(), "swe role", 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_body_paragraphs_skip_headers_and_boilerplate() {
        let paras = body_paragraphs("# T\n\nThis file contains stuff.\n\nReal one.\n\n## Related\n\n");
        assert_eq!(paras, vec!["Real one."]);
    }

    #[tokio::test]
    async fn test_loop_stops_after_max_iterations() {
        let dir = vault();
        let model = Arc::new(ScriptedModel::repeating(Completion::tool_use(
            "tu",
            "grep_vault",
            json!({"pattern": "Meta"}),
        )));
        let result = search(&dir, model.clone()).search("anything").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Max iterations reached"));
        assert_eq!(result.iterations, 10);
        assert_eq!(model.request_count(), 10);
    }

    #[tokio::test]
    async fn test_loop_extracts_contexts() {
        let dir = vault();
        let model = Arc::new(ScriptedModel::new());
        model.push(Completion::tool_use("t1", "grep_vault", json!({"pattern": "meta"})));
        model.push(Completion::tool_use("t2", "read_file", json!({"filepath": "career/Meta.md"})));
        model.push(Completion::text("Your Meta offer was $150k."));

        let result = search(&dir, model.clone()).search("What was my Meta offer?").await;
        assert!(result.success);
        assert_eq!(result.iterations, 3);
        assert_eq!(result.contexts.len(), 1);
        let ctx = &result.contexts[0];
        assert_eq!(ctx.file, "career/Meta.md");
        assert!(ctx.text.contains("150k"));
        assert_eq!(ctx.citations.len(), 1);
        assert_eq!(ctx.citations[0].platform, "Gmail");
        assert_eq!(result.final_text.as_deref(), Some("Your Meta offer was $150k."));

        // tool results went back to the model
        let third = &model.requests()[2];
        assert!(third.user_text().contains("\"filepath\":\"career/Meta.md\""));
    }

    #[test]
    fn test_contexts_dedupe_equivalent_paths() {
        let dir = vault();
        let search = search(&dir, Arc::new(ScriptedModel::new()));
        let contexts = search.extract_contexts(&[
            "career/Meta.md".to_string(),
            "./career/Meta.md".to_string(),
            "career/../career/Meta.md".to_string(),
        ]);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].file, "career/Meta.md");
    }

    #[tokio::test]
    async fn test_read_and_grep_of_same_file_yield_one_context() {
        let dir = vault();
        let model = Arc::new(ScriptedModel::new());
        model.push(Completion::tool_use("t1", "read_file", json!({"filepath": "./career/Meta.md"})));
        model.push(Completion::tool_use("t2", "grep_vault", json!({"pattern": "recruiter"})));
        model.push(Completion::text("done"));

        let result = search(&dir, model).search("meta").await;
        assert!(result.success);
        assert_eq!(result.contexts.len(), 1);
        assert_eq!(result.contexts[0].file, "career/Meta.md");
    }

    #[tokio::test]
    async fn test_traversal_is_a_tool_error_not_a_failure() {
        let dir = vault();
        let model = Arc::new(ScriptedModel::new());
        model.push(Completion::tool_use("t1", "read_file", json!({"filepath": "../../etc/passwd"})));
        model.push(Completion::text("Nothing there."));

        let result = search(&dir, model.clone()).search("passwords").await;
        assert!(result.success);
        assert!(result.contexts.is_empty());
        let second = model.requests()[1].user_text();
        assert!(second.contains("Access denied"));
    }
}
