//! Answer synthesis and the ask pipeline.
//!
//! [`AnswerSynthesizer`] turns search contexts plus recent conversation into
//! a direct answer. [`ChatPersona`] answers in the vault owner's voice for a
//! chat workspace, adapting tone to where the question was asked and never
//! citing sources. [`AskPipeline`] wires agentic search, the vector fallback
//! and the synthesizer together for `/ask`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agentic::AgenticSearch;
use crate::history::{ChatMessage, ChatRole};
use crate::llm::{complete_text, LanguageModel};
use crate::models::SearchContext;
use crate::retrieval::{RetrievalEngine, SearchRequest};

pub const NO_CONTEXT_ANSWER: &str =
    "I couldn't find any relevant information in your vault to answer that question.";
pub const PERSONA_NO_CONTEXT: &str =
    "I'm not sure - I don't have information about that in my notes.";
pub const PERSONA_UNAVAILABLE: &str =
    "Sorry, I'm having trouble accessing my notes right now. Could you ask again in a moment?";

const CONTEXT_CHARS: usize = 1000;
const HISTORY_MESSAGES: usize = 6;
const ANSWER_MAX_TOKENS: u32 = 1024;

const ANSWER_SYSTEM: &str = "You are a helpful assistant that answers questions from the user's personal knowledge vault.\n\n\
Your role:\n\
- Synthesize the provided contexts into clear, conversational answers\n\
- Keep track of the conversation across turns\n\
- Be direct and concise\n\
- Only use information present in the contexts\n\
- Say so when the contexts do not contain the answer";

const PERSONA_SYSTEM: &str = "You answer chat messages by speaking AS the vault owner, in the first person.\n\n\
Your role:\n\
- Use only what the owner's knowledge vault says\n\
- Adapt tone to the workspace and channel (professional or casual)\n\
- Keep replies brief and easy to scan\n\
- Acknowledge gaps gracefully\n\n\
Guardrails:\n\
- Nothing offensive, discriminatory, or unprofessional\n\
- No confidential details unless clearly appropriate for the channel\n\
- No claims that are not in the vault\n\
- When unsure whether something is appropriate, leave it out";

/// `[Source i: file]` blocks, each capped at 1000 chars, separated by `---`.
pub fn format_contexts(contexts: &[SearchContext]) -> String {
    contexts
        .iter()
        .enumerate()
        .map(|(i, ctx)| {
            let text = match ctx.text.char_indices().nth(CONTEXT_CHARS) {
                Some((cut, _)) => format!("{}...", &ctx.text[..cut]),
                None => ctx.text.clone(),
            };
            format!("[Source {}: {}]\n{}", i + 1, ctx.file, text)
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn format_history(history: &[ChatMessage], heading: &str, user: &str, assistant: &str) -> String {
    if history.is_empty() {
        return String::new();
    }
    let skip = history.len().saturating_sub(HISTORY_MESSAGES);
    let mut out = format!("{}:\n", heading);
    for msg in &history[skip..] {
        let label = match msg.role {
            ChatRole::User => user,
            ChatRole::Assistant => assistant,
        };
        out.push_str(&format!("{}: {}\n", label, msg.content));
    }
    out.push('\n');
    out
}

pub struct AnswerSynthesizer {
    model: Arc<dyn LanguageModel>,
}

impl AnswerSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub async fn synthesize(
        &self,
        query: &str,
        contexts: &[SearchContext],
        history: &[ChatMessage],
    ) -> String {
        if contexts.is_empty() {
            return NO_CONTEXT_ANSWER.to_string();
        }

        let prompt = format!(
            "Based on the following information from the user's vault, answer their question clearly and concisely.\n\n\
             {}Current Question: {}\n\n\
             Information from vault:\n{}\n\n\
             Instructions:\n\
             - Answer directly and conversationally\n\
             - Use only the information in the contexts\n\
             - Treat follow-up questions in light of the previous conversation\n\
             - If the contexts only partly answer the question, say what you can and cannot answer\n\n\
             Answer:",
            format_history(history, "Previous conversation", "User", "Assistant"),
            query,
            format_contexts(contexts)
        );

        match complete_text(
            self.model.as_ref(),
            Some(ANSWER_SYSTEM),
            &prompt,
            0.3,
            ANSWER_MAX_TOKENS,
        )
        .await
        {
            Ok(answer) => answer.trim().to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "answer synthesis failed");
                format!("Error processing question: {}", e)
            }
        }
    }
}

/// Where a persona question was asked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatScene {
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub asker: Option<String>,
}

pub struct ChatPersona {
    model: Arc<dyn LanguageModel>,
}

impl ChatPersona {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub async fn reply(
        &self,
        question: &str,
        contexts: &[SearchContext],
        scene: &ChatScene,
        history: &[ChatMessage],
    ) -> String {
        if contexts.is_empty() {
            return PERSONA_NO_CONTEXT.to_string();
        }

        let workspace = scene.workspace.as_deref().unwrap_or("Unknown workspace");
        let channel = scene.channel.as_deref().unwrap_or("Unknown channel");
        let asker = scene.asker.as_deref().unwrap_or("Someone");

        let prompt = format!(
            "You are replying in chat AS the vault owner.\n\n\
             {}Current question from {}: {}\n\n\
             Chat context:\n- Workspace: {}\n- Channel: {}\n- Asker: {}\n\n\
             Information from your knowledge vault:\n{}\n\n\
             Instructions:\n\
             - Answer in the first person (\"I\", \"my\")\n\
             - Work names, company names or formal channels call for a professional tone; casual spaces for a friendly one; default to friendly-professional\n\
             - Keep it brief, like a real chat message\n\
             - Do NOT include source citations or file references\n\
             - Never say anything that could harm your reputation\n\
             - If the vault only partly answers, say what you know and what you don't\n\n\
             Answer:",
            format_history(history, "Recent conversation", "Question", "Your answer"),
            asker,
            question,
            workspace,
            channel,
            asker,
            format_contexts(contexts)
        );

        match complete_text(
            self.model.as_ref(),
            Some(PERSONA_SYSTEM),
            &prompt,
            0.5,
            ANSWER_MAX_TOKENS,
        )
        .await
        {
            Ok(answer) => answer.trim().to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "persona reply failed");
                PERSONA_UNAVAILABLE.to_string()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub contexts: Vec<SearchContext>,
    /// `agentic` or `vector`.
    pub strategy: String,
    #[serde(default)]
    pub iterations: usize,
}

/// Agentic search first; vector retrieval when the loop fails.
pub struct AskPipeline {
    agentic: AgenticSearch,
    retrieval: Option<Arc<RetrievalEngine>>,
    synthesizer: AnswerSynthesizer,
}

impl AskPipeline {
    pub fn new(
        agentic: AgenticSearch,
        retrieval: Option<Arc<RetrievalEngine>>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            agentic,
            retrieval,
            synthesizer: AnswerSynthesizer::new(model),
        }
    }

    pub async fn gather(&self, query: &str) -> (Vec<SearchContext>, &'static str, usize) {
        let result = self.agentic.search(query).await;
        if result.success {
            return (result.contexts, "agentic", result.iterations);
        }

        tracing::warn!(error = ?result.error, "agentic search failed; falling back to vector retrieval");
        let contexts = match &self.retrieval {
            Some(engine) => engine
                .search(&SearchRequest::new(query))
                .await
                .results
                .iter()
                .map(|r| r.to_context())
                .collect(),
            None => Vec::new(),
        };
        (contexts, "vector", result.iterations)
    }

    pub async fn ask(&self, query: &str, history: &[ChatMessage]) -> AskResponse {
        let (contexts, strategy, iterations) = self.gather(query).await;
        let answer = self.synthesizer.synthesize(query, &contexts, history).await;
        AskResponse {
            answer,
            contexts,
            strategy: strategy.to_string(),
            iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, ScriptedModel};

    fn ctx(file: &str, text: &str) -> SearchContext {
        SearchContext {
            file: file.to_string(),
            text: text.to_string(),
            citations: Vec::new(),
            score: None,
        }
    }

    #[test]
    fn test_format_contexts_truncates() {
        let long = "x".repeat(1200);
        let out = format_contexts(&[ctx("a.md", "short"), ctx("b.md", &long)]);
        assert!(out.starts_with("[Source 1: a.md]\nshort\n\n---\n\n[Source 2: b.md]\n"));
        assert!(out.ends_with(&format!("{}...", "x".repeat(1000))));
    }

    #[tokio::test]
    async fn test_no_contexts_short_circuits() {
        let model = Arc::new(ScriptedModel::new());
        let s = AnswerSynthesizer::new(model.clone());
        assert_eq!(s.synthesize("q", &[], &[]).await, NO_CONTEXT_ANSWER);
        assert_eq!(model.request_count(), 0);
    }

    #[tokio::test]
    async fn test_synthesize_includes_last_six_messages() {
        let model = Arc::new(ScriptedModel::repeating(Completion::text("  $150k base.  ")));
        let s = AnswerSynthesizer::new(model.clone());
        let history: Vec<_> = (0..8).map(|i| ChatMessage::user(format!("turn{}", i))).collect();
        let answer = s
            .synthesize("What was my Meta offer?", &[ctx("career/Meta.md", "base $150k")], &history)
            .await;
        assert_eq!(answer, "$150k base.");

        let req = &model.requests()[0];
        let prompt = req.user_text();
        assert!(!prompt.contains("turn1\n"));
        assert!(prompt.contains("User: turn2"));
        assert!(prompt.contains("User: turn7"));
        assert_eq!(req.temperature, Some(0.3));
    }

    #[tokio::test]
    async fn test_synthesize_error_is_graceful() {
        let s = AnswerSynthesizer::new(Arc::new(ScriptedModel::failing()));
        let answer = s.synthesize("q", &[ctx("a.md", "t")], &[]).await;
        assert!(answer.starts_with("Error processing question"));
    }

    #[tokio::test]
    async fn test_persona_fallbacks() {
        let p = ChatPersona::new(Arc::new(ScriptedModel::failing()));
        let scene = ChatScene::default();
        assert_eq!(p.reply("q", &[], &scene, &[]).await, PERSONA_NO_CONTEXT);
        assert_eq!(
            p.reply("q", &[ctx("a.md", "t")], &scene, &[]).await,
            PERSONA_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_persona_prompt_carries_scene() {
        let model = Arc::new(ScriptedModel::repeating(Completion::text("I start in July.")));
        let p = ChatPersona::new(model.clone());
        let scene = ChatScene {
            workspace: Some("Acme Corp".to_string()),
            channel: Some("eng".to_string()),
            asker: Some("Dana".to_string()),
        };
        let reply = p
            .reply("When do you start?", &[ctx("career/Job.md", "Start date July 14")], &scene, &[])
            .await;
        assert_eq!(reply, "I start in July.");
        let req = &model.requests()[0];
        assert!(req.user_text().contains("- Workspace: Acme Corp"));
        assert_eq!(req.temperature, Some(0.5));
    }
}
