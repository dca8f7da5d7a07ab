//! # sheetqa CLI
//!
//! Chat with a spreadsheet from the terminal, or serve the same chat over
//! HTTP.
//!
//! ## Usage
//!
//! ```bash
//! sheetqa --config ./config/sheetqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sheetqa preview <file>` | Show the first rows of the first sheet |
//! | `sheetqa ask <file> "<question>"` | Index the file and stream one answer |
//! | `sheetqa chat [<file>]` | Interactive chat with `/load`, `/clear`, `/history` |
//! | `sheetqa serve` | Start the HTTP + SSE server |
//!
//! Answers go to stdout; logs go to stderr (`RUST_LOG`, default `sheetqa=info`).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use sheetqa::config::{self, Config};
use sheetqa::embedding::create_embedder;
use sheetqa::generation::OllamaGenerator;
use sheetqa::ingest::{ingest_upload, Services, Upload};
use sheetqa::models::{Role, SUPPORTED_EXTENSIONS};
use sheetqa::preview::Preview;
use sheetqa::query::ask;
use sheetqa::server;
use sheetqa::session::Session;

/// sheetqa: ask questions about a spreadsheet, answered by a local LLM.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "sheetqa",
    about = "sheetqa: chat with a spreadsheet using a local LLM",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sheetqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a table preview of the first sheet.
    Preview {
        /// Workbook to preview (.xlsx or .xls).
        file: PathBuf,
    },

    /// Index a workbook and answer one question.
    Ask {
        /// Workbook to ask about (.xlsx or .xls).
        file: PathBuf,
        /// The question.
        question: String,
    },

    /// Interactive chat session.
    ///
    /// Type a question to ask about the loaded workbook, or one of:
    /// `/load <file>`, `/clear`, `/history`, `/sources`, `/quit`.
    Chat {
        /// Workbook to load at startup.
        file: Option<PathBuf>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sheetqa=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Preview { file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("cannot read {}", file.display()))?;
            let preview_cfg = cfg.preview.clone();
            let preview =
                tokio::task::spawn_blocking(move || Preview::from_bytes(&bytes, &preview_cfg))
                    .await??;
            print!("{}", preview.render_text(cfg.preview.max_col_width));
        }
        Commands::Ask { file, question } => {
            let services = build_services(&cfg).await?;
            let mut session = Session::new();
            load(&mut session, &file, &services, false).await?;
            answer(&mut session, &question).await?;
        }
        Commands::Chat { file } => {
            let services = build_services(&cfg).await?;
            run_chat(&services, file.as_deref()).await?;
        }
        Commands::Serve => {
            let services = build_services(&cfg).await?;
            server::run_server(services).await?;
        }
    }

    Ok(())
}

/// Create the embedder and generator. An unreachable generator is fatal.
async fn build_services(cfg: &Config) -> Result<Services> {
    if !cfg.embedding.is_enabled() {
        bail!("embedding.provider is 'disabled'; indexing a workbook requires embeddings");
    }
    let embedder = create_embedder(&cfg.embedding)?;
    let generator = OllamaGenerator::new(&cfg.llm)?;
    generator
        .health_check()
        .await
        .context("generation backend unavailable")?;
    tracing::info!(
        embedder = embedder.model_name(),
        llm = %cfg.llm.model,
        "services ready"
    );
    Ok(Services::new(cfg.clone(), embedder, Arc::new(generator)))
}

async fn load(session: &mut Session, file: &Path, services: &Services, show_preview: bool) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let outcome = ingest_upload(session, Upload::new(name.clone(), bytes), services).await?;
    if outcome.cached {
        eprintln!("{} already indexed; reusing it.", name);
    } else {
        eprintln!("Indexed {} ({} chunks). Ready to chat!", name, outcome.chunks);
    }
    if show_preview {
        print!("{}", outcome.preview.render_text(services.config.preview.max_col_width));
    }
    Ok(())
}

/// Stream one answer to stdout.
async fn answer(session: &mut Session, question: &str) -> Result<()> {
    let mut sink = |fragment: &str, _partial: &str| {
        print!("{}", fragment);
        let _ = std::io::stdout().flush();
    };
    let result = ask(session, question, &mut sink).await;
    println!();
    result?;
    Ok(())
}

async fn run_chat(services: &Services, file: Option<&Path>) -> Result<()> {
    let mut session = Session::new();
    if let Some(file) = file {
        load(&mut session, file, services, true).await?;
    }
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        let outcome = match command {
            "/quit" | "/exit" => break,
            "/help" => {
                print_help();
                Ok(())
            }
            "/load" if arg.trim().is_empty() => {
                eprintln!("usage: /load <file>");
                Ok(())
            }
            "/load" => load(&mut session, Path::new(arg.trim()), services, true).await,
            "/clear" => {
                session.reset();
                println!("Chat cleared.");
                Ok(())
            }
            "/history" => {
                for msg in session.transcript() {
                    let who = match msg.role {
                        Role::User => "you",
                        Role::Assistant => "assistant",
                    };
                    println!("[{}] {}: {}", msg.created_at.format("%H:%M:%S"), who, msg.content);
                }
                Ok(())
            }
            "/sources" => {
                match session.context() {
                    Some(sources) => {
                        for (i, s) in sources.iter().enumerate() {
                            println!("--- source {} (score {:.3}) ---\n{}", i + 1, s.score, s.text);
                        }
                    }
                    None => println!("No sources yet."),
                }
                Ok(())
            }
            _ => answer(&mut session, line).await,
        };
        if let Err(e) = outcome {
            eprintln!("error: {:#}", e);
        }
    }
    Ok(())
}

fn print_help() {
    let exts: Vec<String> = SUPPORTED_EXTENSIONS.iter().map(|e| format!(".{}", e)).collect();
    eprintln!(
        "Ask a question about the loaded workbook ({}).\n\
         Commands: /load <file>, /clear, /history, /sources, /help, /quit",
        exts.join(", ")
    );
}
