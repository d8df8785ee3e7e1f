//! Operate a memory database by hand.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable; only
//! `record`, `summarize`, and `compact` call the text generator.
//!
//! # Examples
//!
//! ```sh
//! # Record a turn (auto-summarizes when the session nears its limit)
//! mnemo --user alice --session s1 record --role user "I moved to Lisbon."
//!
//! # Show the bounded prompt for the next generation call
//! mnemo --user alice --session s1 prompt --base "You are helpful." --rag-file docs.txt
//!
//! # Summarize or compact on demand
//! mnemo --user alice --session s1 summarize
//! mnemo --user alice compact --force
//!
//! # Sizes, limits, and compaction history
//! mnemo --user alice --session s1 stats --json
//! ```

use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mnemo_rs::prelude::*;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Bounded conversational memory: record turns, summarize, compact, and
/// build prompts against a SQLite database.
#[derive(Parser)]
#[command(name = "mnemo")]
struct Cli {
    /// SQLite database file (created if missing)
    #[arg(long, default_value = "mnemo.db")]
    db: PathBuf,

    /// JSON file with memory configuration overrides
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model used when the configuration names none
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// User the command applies to
    #[arg(long, default_value = "default")]
    user: String,

    /// Session the command applies to
    #[arg(long, default_value = "default")]
    session: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Append a turn to the session
    Record {
        /// Who said it: user or assistant
        #[arg(long, default_value = "user")]
        role: TurnRole,

        /// Turn text; read from stdin when omitted
        text: Option<String>,
    },

    /// Print the assembled prompt and its metrics
    Prompt {
        /// Base instructions placed first in the prompt
        #[arg(long, default_value = "")]
        base: String,

        /// File with retrieved context to include
        #[arg(long)]
        rag_file: Option<PathBuf>,

        /// Print metrics only
        #[arg(long)]
        metrics_only: bool,
    },

    /// Summarize the session into the user's summary now
    Summarize {
        /// Trigger reason recorded in the audit log
        #[arg(long, default_value = TRIGGER_MANUAL)]
        reason: String,
    },

    /// Compact the user's summary
    Compact {
        /// Skip the 90% threshold (the minimum size still applies)
        #[arg(long)]
        force: bool,
    },

    /// Show the user's summary
    Summary,

    /// Show memory usage and compaction history
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete the session transcript, the summary, or both
    Clear {
        /// Delete the session transcript
        #[arg(long)]
        session: bool,

        /// Delete the user's summary
        #[arg(long)]
        summary: bool,
    },
}

#[derive(Serialize)]
struct StatsReport {
    memory: MemoryStats,
    compression: CompressionStats,
    pressure: Option<MemoryPressure>,
}

// ── Setup ──────────────────────────────────────────────────────────

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<MemoryConfig, String> {
    let config = match &cli.config {
        Some(path) => MemoryConfig::from_json_file(path)
            .map_err(|e| format!("failed to load config '{}': {e}", path.display()))?,
        None => MemoryConfig::default(),
    };
    Ok(config)
}

fn read_stdin_content() -> Result<String, String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("failed to read stdin: {e}"))?;
    Ok(buf)
}

// ── Commands ───────────────────────────────────────────────────────

async fn run(cli: &Cli, engine: &MemoryEngine) -> Result<String, String> {
    let user = cli.user.as_str();
    let session = cli.session.as_str();

    match &cli.command {
        Command::Record { role, text } => {
            let text = match text {
                Some(t) => t.clone(),
                None => read_stdin_content()?,
            };
            let text = text.trim();
            if text.is_empty() {
                return Err("turn text is empty".to_string());
            }
            let recorded = engine
                .record_turn(user, session, *role, text)
                .await
                .map_err(|e| e.to_string())?;
            let mut out = format!(
                "recorded turn {} ({} chars in session)",
                recorded.turn.id, recorded.session_chars
            );
            if let Some(outcome) = recorded.summarization {
                out.push_str(&format!("\nauto-summarization: {outcome:?}"));
            }
            Ok(out)
        }

        Command::Prompt {
            base,
            rag_file,
            metrics_only,
        } => {
            let rag = match rag_file {
                Some(path) => std::fs::read_to_string(path)
                    .map_err(|e| format!("failed to read '{}': {e}", path.display()))?,
                None => String::new(),
            };
            let assembled = engine
                .build_prompt(user, session, base, &rag)
                .map_err(|e| e.to_string())?;
            let metrics = assembled.metrics.to_log_string();
            if *metrics_only {
                Ok(metrics)
            } else {
                Ok(format!("{}\n\n--- {metrics}", assembled.prompt))
            }
        }

        Command::Summarize { reason } => {
            let outcome = engine
                .force_summarize(user, session, reason)
                .await
                .map_err(|e| e.to_string())?;
            Ok(format!("{outcome:?}"))
        }

        Command::Compact { force } => {
            let compacted = if *force {
                engine.compact_now(user).await
            } else {
                engine.check_and_compact(user).await
            }
            .map_err(|e| e.to_string())?;
            Ok(if compacted {
                "summary compacted".to_string()
            } else {
                "summary not compacted".to_string()
            })
        }

        Command::Summary => Ok(engine
            .get_summary(user)
            .map_err(|e| e.to_string())?
            .unwrap_or_else(|| "(no summary)".to_string())),

        Command::Stats { json } => {
            let report = StatsReport {
                memory: engine
                    .memory_stats(user, session)
                    .map_err(|e| e.to_string())?,
                compression: engine
                    .compression_stats(user)
                    .map_err(|e| e.to_string())?,
                pressure: engine
                    .memory_pressure(user, session)
                    .map_err(|e| e.to_string())?,
            };
            if *json {
                return serde_json::to_string_pretty(&report)
                    .map_err(|e| format!("failed to format stats: {e}"));
            }
            let m = &report.memory;
            let c = &report.compression;
            Ok(format!(
                "session: {} / {} chars ({:.1}%)\nsummary: {} / {} chars\ncompactions: {} (avg ratio {:.2}, {} chars saved)\npressure: {}",
                m.session_chars,
                m.session_limit,
                m.session_usage_percent,
                m.persistent_chars,
                m.persistent_limit,
                c.total_compressions,
                c.avg_compression_ratio,
                c.total_chars_saved,
                report.pressure.map_or("none", MemoryPressure::as_str),
            ))
        }

        Command::Clear { session: s, summary } => {
            if !s && !summary {
                return Err("pass --session, --summary, or both".to_string());
            }
            let mut out = Vec::new();
            if *s {
                let removed = engine.clear_session(session).map_err(|e| e.to_string())?;
                out.push(format!("removed {removed} turn(s)"));
            }
            if *summary {
                let removed = engine.clear_summary(user).map_err(|e| e.to_string())?;
                out.push(if removed {
                    "summary deleted".to_string()
                } else {
                    "no summary to delete".to_string()
                });
            }
            Ok(out.join("\n"))
        }
    }
}

async fn start(cli: &Cli) -> Result<String, String> {
    let config = Arc::new(load_config(cli)?);
    let db = Database::open(&cli.db, config.storage_retry.clone()).map_err(|e| e.to_string())?;

    let api_key = std::env::var("OPENROUTER_KEY").unwrap_or_default();
    let generates = matches!(
        cli.command,
        Command::Record { .. } | Command::Summarize { .. } | Command::Compact { .. }
    );
    if api_key.is_empty() && generates {
        tracing::warn!("OPENROUTER_KEY is not set; generation calls will fail");
    }
    let generator =
        OpenRouterGenerator::new(api_key, cli.model.as_str()).map_err(|e| e.to_string())?;

    let (audit, writer) = AuditLog::spawn_writer(db.clone());
    let engine = MemoryEngine::new(db, Arc::new(generator), config, audit);
    let result = run(cli, &engine).await;

    // Flush queued audit events before exiting.
    drop(engine);
    if let Err(e) = writer.await {
        tracing::error!(error = %e, "Audit writer did not shut down cleanly");
    }
    result
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    match start(&cli).await {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
