//! # Brainvault CLI (`bv`)
//!
//! ## Usage
//!
//! ```bash
//! bv --config ./brainvault.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bv init` | Create the vault skeleton (and a config file if missing) |
//! | `bv ingest "<text>"` | Route text into the vault with citations |
//! | `bv search "<query>"` | Vector search over indexed chunks |
//! | `bv ask "<question>"` | Agentic search plus a synthesized answer |
//! | `bv connectors` | List configured connectors |
//! | `bv sync <id>` | Fetch updates from a connector |
//! | `bv stats` | Vector collection statistics |
//! | `bv serve` | Start the HTTP API |
//! | `bv completions <shell>` | Print shell completions |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); results go to stdout.

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use brainvault::app::Services;
use brainvault::config::{load_config, Config};
use brainvault::connectors::{ConnectorRegistry, SyncContext};
use brainvault::embedding::CachedEmbedder;
use brainvault::models::SourceMetadata;
use brainvault::progress::ProgressMode;
use brainvault::retrieval::{RetrievalEngine, SearchFilters, SearchRequest, SearchResponse};
use brainvault::store::open_store;
use brainvault::vault::init_vault;

#[derive(Parser)]
#[command(
    name = "bv",
    about = "Brainvault: a personal knowledge vault with cited notes and grounded answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./brainvault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the category folders, about.md files and state directory.
    ///
    /// Writes a default config to `--config` when none exists. Safe to rerun.
    Init {
        /// Vault root used when no config file exists yet.
        #[arg(long, default_value = "./vault")]
        vault: PathBuf,
    },

    /// Ingest a piece of text into the vault.
    Ingest {
        /// Text to ingest. Use `-` to read stdin.
        text: String,
        #[arg(long, default_value = "Manual")]
        platform: String,
        /// ISO-8601 timestamp (defaults to now).
        #[arg(long)]
        timestamp: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        quote: Option<String>,
        /// Override `[ingest].max_retries`.
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Search indexed chunks.
    Search {
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        /// Exact platform match (e.g. `LinkedIn`).
        #[arg(long)]
        platform: Option<String>,
        /// Substring of the source file path.
        #[arg(long)]
        file: Option<String>,
        /// Lower timestamp bound (ISO-8601 prefix).
        #[arg(long)]
        from: Option<String>,
        /// Upper timestamp bound (ISO-8601 prefix).
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        min_similarity: Option<f64>,
        /// Print the raw JSON response.
        #[arg(long)]
        json: bool,
    },

    /// Answer a question from the vault.
    Ask { query: String },

    /// List configured connectors.
    Connectors,

    /// Fetch updates from a connector (`notes:<name>` or `all`).
    Sync {
        connector: String,
        /// Ingest fetched items into the vault.
        #[arg(long)]
        ingest: bool,
        #[arg(long)]
        limit: Option<usize>,
        /// Progress output on stderr. Defaults to human on a TTY, else off.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show vector collection statistics.
    Stats,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Print shell completions.
    Completions { shell: clap_complete::Shell },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Commands that don't require an existing config
    match &cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "bv", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Init { vault } => return run_init(&cli.config, vault),
        _ => {}
    }

    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),
        Commands::Ingest {
            text,
            platform,
            timestamp,
            url,
            quote,
            max_retries,
        } => {
            let text = if text == "-" {
                std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")?
            } else {
                text
            };
            let metadata = SourceMetadata {
                platform,
                timestamp: timestamp.unwrap_or_default(),
                url,
                quote,
            };
            let services = Services::from_config(cfg).await?;
            let outcome = services
                .orchestrator
                .ingest(&text, Some(metadata), max_retries)
                .await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Commands::Search {
            query,
            top_k,
            platform,
            file,
            from,
            to,
            min_similarity,
            json,
        } => {
            let engine = retrieval_engine(&cfg).await?;
            let request = SearchRequest {
                query,
                top_k,
                min_similarity,
                filters: SearchFilters {
                    platform,
                    file_path: file,
                    date_from: from,
                    date_to: to,
                },
            };
            let response = engine.search(&request).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_search(&response);
            }
        }
        Commands::Ask { query } => {
            let services = Services::from_config(cfg).await?;
            let response = services.ask.ask(&query, &[]).await;
            println!("{}", response.answer);
            if !response.contexts.is_empty() {
                println!("\nSources ({}):", response.strategy);
                for ctx in &response.contexts {
                    println!("  - {}", ctx.file);
                }
            }
        }
        Commands::Connectors => {
            let registry = ConnectorRegistry::from_config(&cfg)?;
            if registry.is_empty() {
                println!("No connectors configured.");
            }
            for meta in registry.list() {
                println!("{}  {}  (every {} min)", meta.id, meta.description, meta.sync_interval_minutes);
            }
        }
        Commands::Sync {
            connector,
            ingest,
            limit,
            progress,
        } => {
            run_sync(cfg, &connector, ingest, limit, progress.unwrap_or_else(ProgressMode::default_for_tty)).await?;
        }
        Commands::Stats => {
            let stats = retrieval_engine(&cfg).await?.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Serve => {
            let registry = ConnectorRegistry::from_config(&cfg)?;
            let services = Services::from_config(cfg).await?;
            brainvault::server::run_server(services, registry).await?;
        }
    }

    Ok(())
}

fn run_init(config_path: &Path, vault: &Path) -> anyhow::Result<()> {
    let cfg = if config_path.exists() {
        load_config(config_path)?
    } else {
        let cfg = Config::for_vault(vault);
        std::fs::write(
            config_path,
            format!("[vault]\nroot = {:?}\n", vault.display().to_string()),
        )
        .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        println!("Wrote {}", config_path.display());
        cfg
    };

    let model = cfg
        .embedding
        .model
        .as_deref()
        .unwrap_or(&cfg.embedding.provider);
    let folders = init_vault(&cfg.vault.root, &cfg.vault.state_dir(), model)?;
    println!(
        "Vault ready at {} ({} folders)",
        cfg.vault.root.display(),
        folders.len()
    );
    Ok(())
}

async fn retrieval_engine(cfg: &Config) -> anyhow::Result<RetrievalEngine> {
    let store = open_store(cfg).await?;
    let embedder = Arc::new(CachedEmbedder::new(cfg.embedding.clone())?);
    Ok(RetrievalEngine::new(store, embedder, cfg.retrieval.clone()))
}

fn print_search(response: &SearchResponse) {
    if let Some(err) = &response.error {
        eprintln!("warning: {}", err);
    }
    if response.results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, r) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}  ({})",
            i + 1,
            r.final_score,
            r.file,
            r.platform.as_deref().unwrap_or("unknown")
        );
        println!("   {}", r.snippet);
    }
    println!("\n{} results in {:.1} ms", response.total, response.took_ms);
}

async fn run_sync(
    cfg: Config,
    connector: &str,
    ingest: bool,
    limit: Option<usize>,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let registry = ConnectorRegistry::from_config(&cfg)?;
    let targets = if connector == "all" {
        registry.list().into_iter().map(|m| m.id).collect()
    } else if registry.get(connector).is_some() {
        vec![connector.to_string()]
    } else {
        bail!("Unknown connector: {} (see `bv connectors`)", connector);
    };

    let state_dir = cfg.vault.state_dir();
    let services = if ingest {
        Some(Services::from_config(cfg).await?)
    } else {
        None
    };
    let reporter = progress.reporter();

    let mut failed = false;
    for id in targets {
        let Some(c) = registry.get(&id) else { continue };
        let ctx = SyncContext {
            state_dir: &state_dir,
            ingest: services.as_ref().map(|s| &s.orchestrator),
            progress: reporter.as_ref(),
        };
        let result = c.sync(&ctx, limit).await;
        failed |= !result.success;
        println!("{}", serde_json::json!({ "connector": id, "result": result }));
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
