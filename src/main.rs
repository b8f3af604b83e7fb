//! # docchat CLI
//!
//! The `docchat` binary runs the chat backend and a few helpers for setting
//! it up and debugging the workflow it talks to.
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat serve` | Start the HTTP server |
//! | `docchat check` | Validate the configuration and print a summary |
//! | `docchat ask "<question>"` | Send one question to the webhook |
//! | `docchat normalize [FILE]` | Normalize a saved webhook response |
//! | `docchat hash-password <PASSWORD>` | Print a digest for `[[auth.users]]` |
//!
//! `normalize` and `hash-password` do not read the configuration file.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docchat::config::{self, Config};
use docchat::normalize::normalize_response;
use docchat::webhook::{AnswerBackend, ChatTurn, WebhookClient};

/// docchat: backend for a document chat assistant.
///
/// Commands that need configuration read it from `--config`. See
/// `config/docchat.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "Backend for a document chat assistant",
    version,
    long_about = "docchat forwards chat turns to a workflow webhook with retries, normalizes \
    the responses into one message format, keeps per-session history, and proxies cited PDFs \
    for the preview pane."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Serves the JSON API and, when `server.static_dir` is set, the UI
    /// bundle. Runs until interrupted.
    Serve,

    /// Validate the configuration file and print a summary.
    Check,

    /// Send a single question to the webhook and print the answer.
    Ask {
        /// The question.
        question: String,

        /// Session id to send with the question. A fresh one is generated
        /// when omitted.
        #[arg(long)]
        session: Option<String>,

        /// Ask the workflow to include web search results.
        #[arg(long)]
        web_search: bool,
    },

    /// Normalize a saved webhook response body and print it as JSON.
    ///
    /// Reads from stdin when no file is given.
    Normalize {
        /// File containing the raw response body.
        file: Option<PathBuf>,
    },

    /// Print the SHA-256 digest of a password for `[[auth.users]]`.
    HashPassword {
        password: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("docchat=info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    // Commands that don't require config
    match &cli.command {
        Commands::Normalize { file } => {
            return run_normalize(file.as_deref());
        }
        Commands::HashPassword { password } => {
            println!("{}", docchat::auth::hash_password(password));
            return Ok(());
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            docchat::server::run_server(&cfg).await?;
        }
        Commands::Check => {
            print_summary(&cli.config, &cfg);
        }
        Commands::Ask {
            question,
            session,
            web_search,
        } => {
            run_ask(&cfg, question, session, web_search).await?;
        }
        Commands::Normalize { .. } | Commands::HashPassword { .. } => {}
    }

    Ok(())
}

fn run_normalize(file: Option<&std::path::Path>) -> anyhow::Result<()> {
    let body = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };
    let answer = normalize_response(&body)?;
    println!("{}", serde_json::to_string_pretty(&answer)?);
    Ok(())
}

fn print_summary(path: &std::path::Path, cfg: &Config) {
    println!("Configuration OK: {}", path.display());
    println!("  bind:          {}", cfg.server.bind);
    match &cfg.server.static_dir {
        Some(dir) => println!("  static_dir:    {}", dir.display()),
        None => println!("  static_dir:    (none, API only)"),
    }
    println!("  webhook:       {}", cfg.webhook.url);
    println!(
        "  documents:     {}",
        cfg.webhook.documents_url.as_deref().unwrap_or("(not configured)")
    );
    println!(
        "  retries:       {} (backoff {}-{} ms)",
        cfg.webhook.max_retries, cfg.webhook.backoff_base_ms, cfg.webhook.backoff_max_ms
    );
    println!(
        "  sessions:      max {} sessions, {} messages each",
        cfg.sessions.max_sessions, cfg.sessions.max_messages
    );
    println!("  pdf template:  {}", cfg.pdf.download_url_template);
    match &cfg.auth {
        Some(auth) => println!("  auth:          {} user(s)", auth.users.len()),
        None => println!("  auth:          disabled"),
    }
}

async fn run_ask(
    cfg: &Config,
    question: String,
    session: Option<String>,
    web_search: bool,
) -> anyhow::Result<()> {
    let client = WebhookClient::new(&cfg.webhook)?;
    let session_id = session.unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4()));
    let turn = ChatTurn {
        session_id,
        message: question,
        web_search,
        history: Vec::new(),
    };

    let answer = client.ask(&turn).await?;
    println!("{}", answer.text);

    if !answer.references.is_empty() {
        println!();
        println!("References:");
        for r in &answer.references {
            match r.lines {
                Some(lines) => println!("  - {} [{}] lines {}-{}", r.name, r.file_id, lines.start, lines.end),
                None => println!("  - {} [{}]", r.name, r.file_id),
            }
        }
    }
    if !answer.web_sources.is_empty() {
        println!();
        println!("Web:");
        for w in &answer.web_sources {
            println!("  - {} <{}>", w.title, w.url);
        }
    }
    Ok(())
}
