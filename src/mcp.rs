//! MCP JSON-RPC tool surface over the vault.
//!
//! [`McpBridge`] exposes the read side of the vault to MCP clients (Claude
//! Desktop, Cursor) over Streamable HTTP. The server mounts it at `/mcp`
//! unless `[server] mcp = false`.
//!
//! | Tool | Does |
//! |------|------|
//! | `search` | Vector retrieval with filters, same contract as `POST /search` |
//! | `search_agentic` | Bounded grep/read loop; returns the contexts it gathered |
//! | `open` | Full text of one note plus its citation sidecar |
//! | `summarize` | Extractive summary of one note |
//! | `list` | Immediate children of a vault directory |
//!
//! Every tool is read-only. Ingestion stays on the HTTP API and the CLI,
//! where it is serialized behind the ingest lock.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::StreamableHttpService;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agentic::{body_paragraphs, read_file, ToolError};
use crate::app::Services;
use crate::retrieval::SearchRequest;
use crate::vault::{list_dir, VaultPathError};

const DEFAULT_SUMMARY_WORDS: usize = 150;
const MAX_BULLETS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum McpToolError {
    #[error("no tool registered with name: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Deserialize)]
struct QueryArgs {
    query: String,
}

#[derive(Debug, Deserialize)]
struct OpenArgs {
    file_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStyle {
    #[default]
    Concise,
    Bullets,
}

#[derive(Debug, Deserialize)]
struct SummarizeArgs {
    file_path: String,
    #[serde(default)]
    max_length: Option<usize>,
    #[serde(default)]
    style: SummaryStyle,
}

#[derive(Debug, Default, Deserialize)]
struct ListArgs {
    #[serde(default)]
    path: Option<String>,
}

/// Name, description and JSON input schema of every tool.
pub fn tool_definitions() -> Vec<(&'static str, &'static str, Value)> {
    vec![
        (
            "search",
            "Semantic search over the vault's indexed chunks. Returns ranked results \
             with file, snippet, scores and source platform.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Natural language query"},
                    "top_k": {"type": "integer", "minimum": 1},
                    "min_similarity": {"type": "number"},
                    "filters": {
                        "type": "object",
                        "properties": {
                            "platform": {"type": "string"},
                            "file_path": {"type": "string"},
                            "date_from": {"type": "string", "description": "ISO-8601"},
                            "date_to": {"type": "string", "description": "ISO-8601"}
                        }
                    }
                },
                "required": ["query"]
            }),
        ),
        (
            "search_agentic",
            "Let the assistant grep and read notes to answer a question. Returns the \
             notes it used, with resolved citations.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Question to research"}
                },
                "required": ["query"]
            }),
        ),
        (
            "open",
            "Full markdown of one vault note and its citation records.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string", "description": "Vault-relative path, e.g. career/Meta.md"}
                },
                "required": ["file_path"]
            }),
        ),
        (
            "summarize",
            "Short extractive summary of one vault note.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string"},
                    "max_length": {"type": "integer", "minimum": 1, "description": "Maximum words"},
                    "style": {"type": "string", "enum": ["concise", "bullets"]}
                },
                "required": ["file_path"]
            }),
        ),
        (
            "list",
            "List a vault directory. Directories come first.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Vault-relative directory; omit for the root"}
                }
            }),
        ),
    ]
}

/// Bridges [`Services`] to the MCP JSON-RPC protocol.
///
/// Each MCP session receives a clone of this struct; everything is behind
/// `Arc`, so all sessions share one set of services.
#[derive(Clone)]
pub struct McpBridge {
    services: Arc<Services>,
}

impl McpBridge {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Run one tool by name. Transport-independent, so tests call it directly.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value, McpToolError> {
        let root = &self.services.config.vault.root;
        tracing::debug!(tool = name, "mcp tool call");

        match name {
            "search" => {
                let request: SearchRequest = parse_args(args)?;
                if request.query.trim().is_empty() {
                    return Err(McpToolError::InvalidArguments(
                        "query cannot be empty".to_string(),
                    ));
                }
                to_json(&self.services.retrieval.search(&request).await)
            }
            "search_agentic" => {
                let QueryArgs { query } = parse_args(args)?;
                if query.trim().is_empty() {
                    return Err(McpToolError::InvalidArguments(
                        "query cannot be empty".to_string(),
                    ));
                }
                to_json(&self.services.agentic.search(&query).await)
            }
            "open" => {
                let OpenArgs { file_path } = parse_args(args)?;
                let file = read_file(root, &file_path, self.services.ledger.as_ref())?;
                to_json(&file)
            }
            "summarize" => {
                let args: SummarizeArgs = parse_args(args)?;
                let file = read_file(root, &args.file_path, self.services.ledger.as_ref())?;
                let max_words = args.max_length.unwrap_or(DEFAULT_SUMMARY_WORDS).max(1);
                let summary = summarize_note(&file.content, max_words, args.style);
                Ok(json!({
                    "source": file.filepath,
                    "word_count": summary.split_whitespace().count(),
                    "style": args.style,
                    "summary": summary,
                }))
            }
            "list" => {
                let ListArgs { path } = parse_args(args)?;
                let entries = list_dir(root, path.as_deref()).map_err(|e| {
                    match e.downcast_ref::<VaultPathError>() {
                        Some(VaultPathError::Escapes(p)) => {
                            McpToolError::Tool(ToolError::PathEscapes(p.clone()))
                        }
                        Some(VaultPathError::Invalid(m)) => McpToolError::InvalidArguments(m.clone()),
                        None => McpToolError::Failed(e.to_string()),
                    }
                })?;
                Ok(json!({
                    "path": path.unwrap_or_else(|| "/".to_string()),
                    "total": entries.len(),
                    "entries": entries,
                }))
            }
            other => Err(McpToolError::UnknownTool(other.to_string())),
        }
    }

    fn to_mcp_tool(name: &'static str, description: &'static str, schema: Value) -> Tool {
        let input_schema: Arc<serde_json::Map<String, Value>> = match schema {
            Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        Tool {
            name: Cow::Borrowed(name),
            title: None,
            description: Some(Cow::Borrowed(description)),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(true)),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, McpToolError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| McpToolError::InvalidArguments(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, McpToolError> {
    serde_json::to_value(value).map_err(|e| McpToolError::Failed(e.to_string()))
}

/// Extractive summary of a note body; headings and folder boilerplate are
/// skipped, citation markers are kept.
///
/// `Bullets` takes the first sentence of up to five paragraphs. `Concise`
/// takes the first `max_words` words and trims back to a sentence end when
/// one falls in the last 30%, otherwise appends `...`.
pub fn summarize_note(content: &str, max_words: usize, style: SummaryStyle) -> String {
    let paragraphs = body_paragraphs(content);

    match style {
        SummaryStyle::Bullets => paragraphs
            .iter()
            .take(MAX_BULLETS)
            .filter_map(|p| {
                let first = p.split(". ").next()?.trim().trim_end_matches('.');
                (!first.is_empty()).then(|| format!("- {}.", first))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        SummaryStyle::Concise => {
            let words: Vec<&str> = paragraphs
                .iter()
                .flat_map(|p| p.split_whitespace())
                .collect();
            if words.len() <= max_words {
                return words.join(" ");
            }
            let summary = words[..max_words].join(" ");
            match summary.rfind('.') {
                Some(end) if end as f64 > summary.len() as f64 * 0.7 => summary[..=end].to_string(),
                _ => format!("{}...", summary),
            }
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "brainvault".to_string(),
                title: Some("Brainvault".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Personal knowledge vault of cited markdown notes. Use search for fast \
                 semantic lookup, search_agentic for questions that need several notes, \
                 open or summarize to read a note, and list to browse folders."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = tool_definitions()
            .into_iter()
            .map(|(name, description, schema)| Self::to_mcp_tool(name, description, schema))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        tool_definitions()
            .into_iter()
            .find(|(n, _, _)| *n == name)
            .map(|(name, description, schema)| Self::to_mcp_tool(name, description, schema))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let args = request.arguments.map(Value::Object).unwrap_or(Value::Null);

        match self.call(&request.name, args).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(McpToolError::UnknownTool(name)) => Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", name),
                None,
            )),
            Err(e) => {
                tracing::warn!(tool = %request.name, error = %e, "mcp tool failed");
                Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
            }
        }
    }
}

/// Streamable HTTP service for `nest_service("/mcp", ..)`.
pub fn mcp_service(
    services: Arc<Services>,
) -> StreamableHttpService<McpBridge, LocalSessionManager> {
    StreamableHttpService::new(
        move || Ok(McpBridge::new(services.clone())),
        LocalSessionManager::default().into(),
        Default::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::citations::{CitationLedger, Citations, JsonSidecarLedger};
    use crate::config::{Config, EmbeddingConfig};
    use crate::llm::{Completion, ScriptedModel};
    use crate::models::CitationRecord;
    use crate::store::memory::InMemoryVectorStore;
    use tempfile::TempDir;

    const META: &str = "# Meta\n\nApplied to Meta for SWE role [1]. Recruiter was friendly.\n\n\
                        Recruiter quoted base $150k [1].\n\n## Related\n\n";

    fn bridge(dir: &TempDir, model: Arc<ScriptedModel>) -> McpBridge {
        let root = dir.path().join("vault");
        std::fs::create_dir_all(root.join("career")).unwrap();
        std::fs::write(root.join("career/Meta.md"), META).unwrap();
        let mut citations = Citations::new();
        citations.insert(
            1,
            CitationRecord {
                platform: "Gmail".to_string(),
                timestamp: "2024-10-15T00:00:00Z".to_string(),
                url: None,
                quote: None,
                note: None,
            },
        );
        JsonSidecarLedger::new()
            .add_citations(&root.join("career/Meta.md"), citations)
            .unwrap();

        let mut config = Config::for_vault(root);
        config.embedding = EmbeddingConfig::hashed(256);
        let services =
            Services::with_parts(config, model, Arc::new(InMemoryVectorStore::default())).unwrap();
        McpBridge::new(Arc::new(services))
    }

    #[test]
    fn test_tool_definitions() {
        let names: Vec<_> = tool_definitions().iter().map(|(n, _, _)| *n).collect();
        assert_eq!(names, vec!["search", "search_agentic", "open", "summarize", "list"]);
        for (_, _, schema) in tool_definitions() {
            assert_eq!(schema["type"], "object");
        }
    }

    #[tokio::test]
    async fn test_open_returns_note_and_citations() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir, Arc::new(ScriptedModel::new()));

        let result = bridge
            .call("open", json!({"file_path": "./career/Meta.md"}))
            .await
            .unwrap();
        assert_eq!(result["filepath"], "career/Meta.md");
        assert!(result["content"].as_str().unwrap().contains("$150k"));
        assert_eq!(result["citations"]["1"]["platform"], "Gmail");
    }

    #[tokio::test]
    async fn test_open_refuses_traversal() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir, Arc::new(ScriptedModel::new()));

        let err = bridge
            .call("open", json!({"file_path": "../../etc/passwd"}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpToolError::Tool(ToolError::PathEscapes(_))));

        let err = bridge.call("list", json!({"path": "../.."})).await.unwrap_err();
        assert!(matches!(err, McpToolError::Tool(ToolError::PathEscapes(_))));
    }

    #[tokio::test]
    async fn test_list_root() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir, Arc::new(ScriptedModel::new()));

        let root = bridge.call("list", Value::Null).await.unwrap();
        assert_eq!(root["path"], "/");
        assert_eq!(root["entries"][0]["name"], "career");
        assert_eq!(root["entries"][0]["is_dir"], true);

        let career = bridge.call("list", json!({"path": "career"})).await.unwrap();
        let names: Vec<_> = career["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Meta.json", "Meta.md"]);
    }

    #[tokio::test]
    async fn test_search_rejects_empty_query() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir, Arc::new(ScriptedModel::new()));

        assert!(matches!(
            bridge.call("search", json!({"query": "  "})).await,
            Err(McpToolError::InvalidArguments(_))
        ));
        assert!(matches!(
            bridge.call("search", json!({})).await,
            Err(McpToolError::InvalidArguments(_))
        ));
        let empty = bridge.call("search", json!({"query": "meta offer"})).await.unwrap();
        assert_eq!(empty["total"], 0);
    }

    #[tokio::test]
    async fn test_search_agentic_gathers_contexts() {
        let dir = TempDir::new().unwrap();
        let model = Arc::new(ScriptedModel::new());
        let bridge = bridge(&dir, model.clone());
        model.push(Completion::tool_use(
            "t1",
            "read_file",
            json!({"filepath": "career/Meta.md"}),
        ));
        model.push(Completion::text("Base was $150k."));

        let result = bridge
            .call("search_agentic", json!({"query": "What was my Meta offer?"}))
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["contexts"][0]["file"], "career/Meta.md");
        assert_eq!(result["contexts"][0]["citations"][0]["platform"], "Gmail");
    }

    #[tokio::test]
    async fn test_summarize_styles() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir, Arc::new(ScriptedModel::new()));

        let bullets = bridge
            .call("summarize", json!({"file_path": "career/Meta.md", "style": "bullets"}))
            .await
            .unwrap();
        assert_eq!(
            bullets["summary"],
            "- Applied to Meta for SWE role [1].\n- Recruiter quoted base $150k [1]."
        );

        let short = bridge
            .call("summarize", json!({"file_path": "career/Meta.md", "max_length": 3}))
            .await
            .unwrap();
        assert_eq!(short["summary"], "Applied to Meta...");
        assert_eq!(short["style"], "concise");
    }

    #[test]
    fn test_concise_summary_ends_on_sentence() {
        let text = "# T\n\nOne two three four five six seven eight nine ten. Eleven twelve.\n";
        assert_eq!(
            summarize_note(text, 11, SummaryStyle::Concise),
            "One two three four five six seven eight nine ten."
        );
        assert_eq!(
            summarize_note(text, 50, SummaryStyle::Concise),
            "One two three four five six seven eight nine ten. Eleven twelve."
        );
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir, Arc::new(ScriptedModel::new()));
        assert!(matches!(
            bridge.call("delete_everything", json!({})).await,
            Err(McpToolError::UnknownTool(_))
        ));
    }
}
