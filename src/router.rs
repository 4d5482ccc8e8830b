//! Content router: one LLM call turns new content into an [`EditPlan`].
//!
//! The router decides what to say before deciding where to put it. Its
//! prompt contract fixes:
//!
//! - one citation per source, referenced as `[1]` in every edit;
//! - `primary` edits carry full detail, `secondary` edits a single fact;
//! - a restated fact from the same source yields an empty plan;
//! - a fact confirmed by a different source becomes an `update_citation`
//!   edit whose `find` names the existing line.
//!
//! Routing never fails. An unreachable model or an unparseable reply falls
//! back to appending the raw context to `personal/Notes.md`.

use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use crate::llm::{complete_json, LanguageModel};
use crate::models::{CitationRecord, Edit, EditAction, EditPlan, Priority, SourceMetadata};
use crate::vault::{list_vault_files, VaultFileInfo};

pub const FALLBACK_FILE: &str = "personal/Notes.md";
const MAX_LISTED_FILES: usize = 20;
const QUOTE_CHARS: usize = 200;
const ROUTER_MAX_TOKENS: u32 = 3000;

const SYSTEM_PROMPT: &str = r###"You are the content router for a personal knowledge vault of markdown notes.

Your job: read new information and produce SPECIFIC EDIT PLANS for vault files.

RULES:
1. Decide WHAT to say first, then WHERE to put it.
2. Use ONE citation per source. Reference it as [1] after every fact it supports.
3. Only select files you have a concrete edit for. Never select files "just in case".
4. PRIMARY edits carry full detail (amounts, dates, names). SECONDARY edits carry the key fact only.
5. Prefer existing files. Create a new file only when no existing file fits.
6. New files go under a category folder: personal/, career/, projects/, research/, social/, finance/, health/, learning/.
7. If the content restates a fact already in the vault from the SAME source, return an empty "edits" list.
8. If a DIFFERENT source confirms a fact already in the vault, use action "update_citation" with "find" set to the exact existing text; do not rewrite the prose.
9. To put content under a specific "## " heading, set "section" to that heading's text.

OUTPUT FORMAT (JSON only):
{
  "source_citation": {
    "platform": "Gmail",
    "timestamp": "2024-10-15T00:00:00Z",
    "quote": "Most representative excerpt of the source (100-200 chars)",
    "note": "What this source is"
  },
  "edits": [
    {
      "file": "career/Job Search.md",
      "priority": "primary",
      "content": "Received offer from Netflix for Software Engineer [1]. Base salary $155k [1].",
      "action": "append",
      "section": "Offers",
      "reason": "Main record of the job search"
    },
    {
      "file": "personal/About Me.md",
      "priority": "secondary",
      "content": "Accepted position at Netflix [1].",
      "action": "append",
      "reason": "Brief career update"
    },
    {
      "file": "career/Job Search.md",
      "priority": "secondary",
      "content": "",
      "action": "update_citation",
      "find": "Interviewed at Netflix on October 2",
      "reason": "Second source confirms an existing fact"
    }
  ]
}

"action" is one of: append, create, update_citation."###;

/// Attempt state for the route → mutate → validate loop.
///
/// `errors` holds the previous attempt's validation failures; they are
/// rendered into the next prompt as correction instructions.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryContext {
    pub attempt: u32,
    pub errors: Vec<String>,
    pub original: String,
}

impl RetryContext {
    pub fn first(original: impl Into<String>) -> Self {
        Self {
            attempt: 1,
            errors: Vec::new(),
            original: original.into(),
        }
    }

    pub fn next(&self, errors: Vec<String>) -> Self {
        Self {
            attempt: self.attempt + 1,
            errors,
            original: self.original.clone(),
        }
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 1 && !self.errors.is_empty()
    }
}

/// The plan as the model returns it, before defaults are filled in.
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    source_citation: Option<RawCitation>,
    edits: Vec<Edit>,
}

#[derive(Debug, Deserialize, Default)]
struct RawCitation {
    #[serde(default)]
    quote: Option<String>,
    #[serde(default)]
    note: Option<String>,
}

pub struct ContentRouter {
    model: Arc<dyn LanguageModel>,
}

impl ContentRouter {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Produce an edit plan for `retry.original`. Never fails.
    pub async fn route(
        &self,
        vault_root: &Path,
        retry: &RetryContext,
        metadata: &SourceMetadata,
    ) -> EditPlan {
        match self.try_route(vault_root, retry, metadata).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, attempt = retry.attempt, "routing failed; using fallback plan");
                fallback_plan(&retry.original, metadata, &e.to_string())
            }
        }
    }

    async fn try_route(
        &self,
        vault_root: &Path,
        retry: &RetryContext,
        metadata: &SourceMetadata,
    ) -> anyhow::Result<EditPlan> {
        let files = list_vault_files(vault_root, false)?;
        let prompt = build_prompt(&files, retry, metadata);

        let raw: RawPlan =
            complete_json(self.model.as_ref(), Some(SYSTEM_PROMPT), &prompt, ROUTER_MAX_TOKENS)
                .await?;

        for edit in &raw.edits {
            if edit.file.trim().is_empty() {
                anyhow::bail!("edit is missing a target file");
            }
            if edit.action != EditAction::UpdateCitation && edit.content.trim().is_empty() {
                anyhow::bail!("edit for {} has no content", edit.file);
            }
        }

        let plan = EditPlan {
            source_citation: source_citation(&retry.original, metadata, raw.source_citation),
            edits: raw.edits,
        };
        tracing::info!(edits = plan.edits.len(), attempt = retry.attempt, "edit plan ready");
        for edit in &plan.edits {
            tracing::debug!(file = %edit.file, action = ?edit.action, priority = ?edit.priority, reason = %edit.reason, "planned edit");
        }
        Ok(plan)
    }
}

/// Render the user prompt: content, source, candidate files, and any
/// corrections from the previous attempt.
pub fn build_prompt(
    files: &[VaultFileInfo],
    retry: &RetryContext,
    metadata: &SourceMetadata,
) -> String {
    let file_list = if files.is_empty() {
        "(Vault is empty)".to_string()
    } else {
        files
            .iter()
            .take(MAX_LISTED_FILES)
            .map(|f| {
                let preview = f.preview.replace('\n', " | ");
                format!("- {}: {}", f.relative_path, preview)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let timestamp = if metadata.timestamp.is_empty() {
        "N/A"
    } else {
        metadata.timestamp.as_str()
    };

    let mut prompt = format!(
        "Analyze this content and create specific edit plans.\n\n\
         CONTENT TO INGEST:\n{}\n\n\
         SOURCE INFO:\n- Platform: {}\n- Timestamp: {}\n\n\
         EXISTING FILES IN VAULT:\n{}\n\n\
         Write the actual text to add (do not describe it), use [1] for the citation, \
         and only include files you have specific edits for.",
        retry.original, metadata.platform, timestamp, file_list
    );

    if retry.is_retry() {
        prompt.push_str(&format!(
            "\n\nCORRECTIONS REQUIRED (attempt {}):\nThe previous edit plan produced invalid notes:\n",
            retry.attempt
        ));
        for err in &retry.errors {
            prompt.push_str(&format!("- {}\n", err));
        }
        prompt.push_str(
            "Fix these problems. Every note needs a '# Title' line and a '## Related' section, \
             headings must be '#' to '######' followed by a space, and every [n] marker must cite the source.",
        );
    }

    prompt
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Caller metadata owns provenance; the model may only add a quote and note.
fn source_citation(
    context: &str,
    metadata: &SourceMetadata,
    raw: Option<RawCitation>,
) -> CitationRecord {
    let raw = raw.unwrap_or_default();
    let quote = metadata
        .quote
        .clone()
        .or(raw.quote.filter(|q| !q.trim().is_empty()))
        .unwrap_or_else(|| truncate_chars(context, QUOTE_CHARS));
    CitationRecord {
        platform: metadata.platform.clone(),
        timestamp: metadata.timestamp.clone(),
        url: metadata.url.clone(),
        quote: Some(quote),
        note: raw.note.filter(|n| !n.trim().is_empty()),
    }
}

/// Append the raw context to the notes file so nothing is dropped.
pub fn fallback_plan(context: &str, metadata: &SourceMetadata, reason: &str) -> EditPlan {
    let mut citation = CitationRecord::from(metadata);
    if citation.quote.is_none() {
        citation.quote = Some(truncate_chars(context, QUOTE_CHARS));
    }
    citation.note = Some("Ingested content".to_string());

    let body = context.trim().trim_end_matches('.');
    EditPlan {
        source_citation: citation,
        edits: vec![Edit {
            file: FALLBACK_FILE.to_string(),
            priority: Priority::Primary,
            content: format!("{} [1].", body),
            action: EditAction::Append,
            reason: format!("Fallback due to error: {}", reason),
            section: None,
            find: None,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, ScriptedModel};
    use tempfile::TempDir;

    fn gmail() -> SourceMetadata {
        SourceMetadata {
            platform: "Gmail".to_string(),
            timestamp: "2024-10-15T00:00:00Z".to_string(),
            url: None,
            quote: None,
        }
    }

    #[test]
    fn test_prompt_lists_empty_vault() {
        let prompt = build_prompt(&[], &RetryContext::first("hello"), &gmail());
        assert!(prompt.contains("(Vault is empty)"));
        assert!(prompt.contains("- Platform: Gmail"));
        assert!(!prompt.contains("CORRECTIONS REQUIRED"));
    }

    #[test]
    fn test_system_prompt_is_complete() {
        assert!(SYSTEM_PROMPT.contains("a specific \"## \" heading"));
        assert!(SYSTEM_PROMPT.contains("\"source_citation\""));
        assert!(SYSTEM_PROMPT.ends_with("append, create, update_citation."));
    }

    #[test]
    fn test_prompt_caps_file_list() {
        let files: Vec<_> = (0..30)
            .map(|i| VaultFileInfo {
                folder: "career".to_string(),
                filename: format!("F{:02}.md", i),
                relative_path: format!("career/F{:02}.md", i),
                preview: "# F".to_string(),
            })
            .collect();
        let prompt = build_prompt(&files, &RetryContext::first("x"), &gmail());
        assert!(prompt.contains("career/F19.md"));
        assert!(!prompt.contains("career/F20.md"));
    }

    #[test]
    fn test_retry_feedback_in_prompt() {
        let retry = RetryContext::first("content")
            .next(vec!["career/Meta.md: missing '## Related' section".to_string()]);
        assert_eq!(retry.attempt, 2);
        let prompt = build_prompt(&[], &retry, &gmail());
        assert!(prompt.contains("CORRECTIONS REQUIRED (attempt 2)"));
        assert!(prompt.contains("- career/Meta.md: missing '## Related' section"));
    }

    #[test]
    fn test_fallback_plan() {
        let plan = fallback_plan("Met Alice at the conference.", &gmail(), "boom");
        assert_eq!(plan.edits.len(), 1);
        assert_eq!(plan.edits[0].file, FALLBACK_FILE);
        assert_eq!(plan.edits[0].content, "Met Alice at the conference [1].");
        assert_eq!(plan.source_citation.platform, "Gmail");
        assert_eq!(
            plan.source_citation.quote.as_deref(),
            Some("Met Alice at the conference.")
        );
    }

    #[tokio::test]
    async fn test_route_parses_plan_and_pins_provenance() {
        let dir = TempDir::new().unwrap();
        let model = Arc::new(ScriptedModel::new());
        model.push_text(
            r#"```json
            {"source_citation": {"platform": "Slack", "timestamp": "bogus", "quote": "recruiter quoted base $150k", "note": "Recruiter email"},
             "edits": [{"file": "career/Meta.md", "priority": "primary", "content": "Applied to Meta [1].", "action": "create", "reason": "new"}]}
            ```"#,
        );
        let router = ContentRouter::new(model.clone());
        let plan = router
            .route(dir.path(), &RetryContext::first("Applied to Meta"), &gmail())
            .await;

        assert_eq!(plan.edits.len(), 1);
        assert_eq!(plan.edits[0].action, EditAction::Create);
        assert_eq!(plan.source_citation.platform, "Gmail");
        assert_eq!(plan.source_citation.timestamp, "2024-10-15T00:00:00Z");
        assert_eq!(plan.source_citation.quote.as_deref(), Some("recruiter quoted base $150k"));
        assert_eq!(plan.source_citation.note.as_deref(), Some("Recruiter email"));
        assert_eq!(model.request_count(), 1);
    }

    #[tokio::test]
    async fn test_route_accepts_empty_plan() {
        let dir = TempDir::new().unwrap();
        let model = Arc::new(ScriptedModel::repeating(Completion::text(r#"{"edits": []}"#)));
        let router = ContentRouter::new(model);
        let plan = router
            .route(dir.path(), &RetryContext::first("dup"), &gmail())
            .await;
        assert!(plan.edits.is_empty());
        assert_eq!(plan.source_citation.quote.as_deref(), Some("dup"));
    }

    #[tokio::test]
    async fn test_route_falls_back_on_model_failure() {
        let dir = TempDir::new().unwrap();
        let router = ContentRouter::new(Arc::new(ScriptedModel::failing()));
        let plan = router
            .route(dir.path(), &RetryContext::first("Note this"), &gmail())
            .await;
        assert_eq!(plan.edits[0].file, FALLBACK_FILE);
        assert!(plan.edits[0].reason.starts_with("Fallback due to error"));
    }

    #[tokio::test]
    async fn test_route_rejects_edit_without_file() {
        let dir = TempDir::new().unwrap();
        let model = Arc::new(ScriptedModel::repeating(Completion::text(
            r#"{"edits": [{"file": "", "content": "x [1]."}]}"#,
        )));
        let plan = ContentRouter::new(model)
            .route(dir.path(), &RetryContext::first("x"), &gmail())
            .await;
        assert_eq!(plan.edits[0].file, FALLBACK_FILE);
    }
}
