//! # Brainvault
//!
//! A personal knowledge vault: free-form text goes in, and an LLM router files
//! it into categorized markdown notes with numbered citations and JSON
//! provenance sidecars. Questions come back out through a bounded agentic
//! search over the notes (grep + read tools), with vector retrieval as the
//! fallback, and a synthesized answer.
//!
//! ## Architecture
//!
//! ```text
//!  text ──▶ ContentRouter ──▶ FileMutator ──▶ CitationLedger ──▶ validate
//!                ▲                                                 │
//!                └───────────── RetryContext(errors) ◀─────────────┘
//!                                     │ chunks
//!                                     ▼
//!  question ──▶ AgenticSearch ──▶ contexts ──▶ AnswerSynthesizer ──▶ answer
//!                    │ fails                       ▲
//!                    ▼                             │
//!             RetrievalEngine ◀── VectorStore ─────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`vault`] | Vault layout, path guard, listing |
//! | [`citations`] | Citation sidecars and `[n]` markers |
//! | [`fuzzy`] | Section and filename fuzzy matching |
//! | [`llm`] | Language model client and tool-use messages |
//! | [`router`] | Content routing into edit plans |
//! | [`mutator`] | Applying edits to notes |
//! | [`validate`] | Structural note validation |
//! | [`ingest`] | Route/mutate/validate/retry orchestration |
//! | [`chunk`] | Text chunking for the vector index |
//! | [`embedding`] | Embedding providers and the query cache |
//! | [`store`] | Vector store backends |
//! | [`retrieval`] | Ranked vector search |
//! | [`agentic`] | Tool-use search loop |
//! | [`synthesis`] | Answer and persona synthesis |
//! | [`history`] | Bounded conversation history |
//! | [`connectors`] | Source connectors and their registry |
//! | [`progress`] | Sync progress reporting |
//! | [`app`] | Service wiring |
//! | [`server`] | HTTP API |
//! | [`mcp`] | MCP tool surface mounted by the server |

pub mod agentic;
pub mod app;
pub mod chunk;
pub mod citations;
pub mod config;
pub mod connectors;
pub mod embedding;
pub mod fuzzy;
pub mod history;
pub mod ingest;
pub mod llm;
pub mod mcp;
pub mod models;
pub mod mutator;
pub mod progress;
pub mod retrieval;
pub mod router;
pub mod server;
pub mod store;
pub mod synthesis;
pub mod validate;
pub mod vault;
