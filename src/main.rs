//! # Vault Context CLI (`vctx`)
//!
//! Command-line front end for the retrieval engine. Every command builds one
//! [`Engine`] from the config file and talks to the vault through it.
//!
//! ## Usage
//!
//! ```bash
//! vctx --config ./config/vctx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vctx list [root]` | Walk the vault and print every path |
//! | `vctx search "<query>"` | Ranked, deduplicated matches |
//! | `vctx ask "<query>"` | Budgeted context block with citations |
//! | `vctx read <path>` | Print one note |
//! | `vctx put <path>` | Create or replace a note |
//! | `vctx stats` | Cache, transport and circuit state |
//! | `vctx clear-cache` | Drop cached listings and notes |
//! | `vctx tools` | List tool schemas |
//! | `vctx serve` | Start the HTTP + MCP tool server |
//! | `vctx completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Context for a question, capped at 2000 tokens
//! vctx ask "how do we rotate api keys" --budget 2000
//!
//! # Only search notes tagged #runbook
//! vctx search "tag:runbook failover"
//!
//! # Point at a vault without a config file
//! vctx --base-url https://127.0.0.1:27124 list Projects
//! ```

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use vault_context::config::{self, Config};
use vault_context::engine::Engine;
use vault_context::models::Candidate;
use vault_context::server;
use vault_context::traits::ToolRegistry;

/// Vault Context: retrieval and ranking over a note vault served by an
/// HTTP file API.
#[derive(Parser)]
#[command(
    name = "vctx",
    about = "Vault Context: budgeted retrieval over a note vault",
    version,
    long_about = "Vault Context walks a note vault over its HTTP file API, ranks notes \
    against a query (TF-IDF plus path, tag and freshness boosts), removes near-duplicates \
    and packs the best excerpts into a token budget. Results are available from the CLI, \
    an HTTP tool server and an MCP endpoint."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vctx.toml")]
    config: PathBuf,

    /// Vault base URL. Overrides `[vault].base_url`; when the config file
    /// does not exist, every other setting uses its default.
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk the vault from a directory and print every path found.
    List {
        /// Directory to start from (vault root when omitted).
        #[arg(default_value = "")]
        root: String,

        /// Maximum directory depth.
        #[arg(long)]
        depth: Option<usize>,

        /// Only print files matching this glob, e.g. `**/*.md`.
        #[arg(long)]
        glob: Option<String>,
    },

    /// Rank notes against a query.
    ///
    /// Supports `tag:`, `path:` and `ext:` filters inside the query text.
    /// An empty query returns a sample of the vault.
    Search {
        query: String,

        #[arg(long, default_value = "20")]
        limit: usize,

        /// Print the raw JSON result.
        #[arg(long)]
        json: bool,
    },

    /// Build a context block for a question within a token budget.
    Ask {
        query: String,

        /// Token budget (defaults to `[context].token_budget`).
        #[arg(long)]
        budget: Option<usize>,

        /// Candidates considered before assembly.
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Print the raw JSON result, including the pipeline trace.
        #[arg(long)]
        json: bool,
    },

    /// Print a note.
    Read { path: String },

    /// Create or replace a note.
    Put {
        path: String,

        /// Read the note body from this file.
        #[arg(long, conflicts_with = "content")]
        file: Option<PathBuf>,

        /// Note body given inline.
        #[arg(long)]
        content: Option<String>,
    },

    /// Show cache, transport and circuit breaker state.
    Stats,

    /// Drop every cached listing and note.
    ClearCache,

    /// List the tools exposed by `serve`, with their parameter schemas.
    Tools,

    /// Start the HTTP tool server and MCP endpoint on `[server].bind`.
    Serve,

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn load(cli: &Cli) -> Result<Config> {
    let mut cfg = match (&cli.base_url, cli.config.exists()) {
        (Some(url), false) => Config::for_base_url(url),
        _ => config::load_config(&cli.config)?,
    };
    if let Some(url) = &cli.base_url {
        cfg.vault.base_url = url.clone();
    }
    config::validate(&cfg)?;
    Ok(cfg)
}

/// A token cancelled on Ctrl-C, so long walks stop promptly.
fn interruptible(engine: &Arc<Engine>) -> CancellationToken {
    let token = engine.request_token(None);
    let guard = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = guard.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                guard.cancel();
            }
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vault_context=info")),
        )
        .init();

    let cli = Cli::parse();

    // Commands that don't need a vault
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        generate(*shell, &mut cmd, "vctx", &mut std::io::stdout());
        return Ok(());
    }
    if let Commands::Tools = &cli.command {
        let registry = ToolRegistry::with_builtins();
        println!("{}", serde_json::to_string_pretty(&registry.infos())?);
        return Ok(());
    }

    let cfg = load(&cli)?;
    let engine = Arc::new(Engine::new(cfg)?);
    let cancel = interruptible(&engine);

    let outcome = run(&cli.command, &engine, &cancel).await;
    cancel.cancel();
    if !matches!(cli.command, Commands::Serve) {
        engine.shutdown();
    }
    outcome
}

async fn run(command: &Commands, engine: &Arc<Engine>, cancel: &CancellationToken) -> Result<()> {
    match command {
        Commands::List { root, depth, glob } => {
            let inventory = engine
                .list_vault(root, *depth, glob.as_deref(), cancel)
                .await?;
            for entry in &inventory.entries {
                println!("{}", entry.path);
            }
            for skipped in &inventory.skipped {
                eprintln!("skipped {} ({})", skipped.path, skipped.reason);
            }
        }
        Commands::Search { query, limit, json } => {
            let out = engine.search(query, *limit, cancel).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            if out.candidates.is_empty() {
                println!("No results.");
            }
            for (i, c) in out.candidates.iter().enumerate() {
                print_candidate(i + 1, c);
            }
            if out.partial {
                eprintln!(
                    "partial result: {} path(s) could not be read",
                    out.skipped.len()
                );
            }
        }
        Commands::Ask {
            query,
            budget,
            limit,
            json,
        } => {
            let out = engine.ask(query, *budget, *limit, cancel).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            print!("{}", out.context.render());
            eprintln!(
                "{} / {} tokens from {} note(s){}",
                out.context.total_tokens,
                out.context.budget,
                out.context.chunks.len(),
                if out.partial { " (partial)" } else { "" }
            );
        }
        Commands::Read { path } => {
            let note = engine.read_note(path, cancel).await?;
            println!("{}", note.content);
        }
        Commands::Put {
            path,
            file,
            content,
        } => {
            let body = note_body(file.as_deref(), content.as_deref())?;
            engine.put_note(path, &body, cancel).await?;
            println!("Wrote {} ({} bytes).", path, body.len());
        }
        Commands::Stats => {
            print!("{}", engine.stats().render());
        }
        Commands::ClearCache => {
            let removed = engine.clear_cache();
            println!("Cleared {} cache entries.", removed);
        }
        Commands::Serve => {
            let tools = Arc::new(ToolRegistry::with_builtins());
            server::run_server(engine.clone(), tools).await?;
        }
        Commands::Tools | Commands::Completions { .. } => {
            // Handled above (before config loading)
        }
    }
    Ok(())
}

fn note_body(file: Option<&Path>, content: Option<&str>) -> Result<String> {
    match (file, content) {
        (Some(path), _) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        (None, Some(text)) => Ok(text.to_string()),
        (None, None) => bail!("one of --file or --content is required"),
    }
}

fn print_candidate(rank: usize, c: &Candidate) {
    println!(
        "{:>3}. {:.3}  {}  [{}]",
        rank,
        c.score,
        c.path,
        format!("{:?}", c.match_type).to_lowercase()
    );
    if !c.snippet.is_empty() {
        println!("     {}", c.snippet);
    }
}
