//! Tether - resumable agent turns and a reliable remote terminal.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tether_cli::{commands, config, logging, HttpTurnBackend, WsTerminalTransport};
use tether_core::{SqliteStore, TerminalSession, TurnSession};
use tether_types::{SessionMode, SubmitOptions};

use config::Config;
use logging::{LogConfig, LogFormat};

/// Tether - resumable agent turns and a reliable remote terminal.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Drive agent turns and a remote terminal across reloads and network drops")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the turn backend base URL
    #[arg(long, value_name = "URL", global = true)]
    api_url: Option<String>,

    /// Override the terminal WebSocket URL
    #[arg(long, value_name = "URL", global = true)]
    terminal_url: Option<String>,

    /// Enable verbose logging (INFO level for most targets)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable trace logging (TRACE level for everything)
    #[arg(long, global = true)]
    trace: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Set log level for specific targets (e.g., "ws=debug" or "recovery=trace").
    /// Can be specified multiple times. Targets are prefixed with "tether::" automatically.
    #[arg(long = "log", value_name = "TARGET=LEVEL", global = true)]
    log_overrides: Vec<String>,

    /// Log output format
    #[arg(long = "log-format", value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit, recover and control agent turns
    Turn {
        #[command(subcommand)]
        action: TurnAction,
    },
    /// Inspect and resolve drafts produced by turns
    Draft {
        #[command(subcommand)]
        action: DraftAction,
    },
    /// Attach an interactive line-oriented terminal
    Terminal {
        /// new, attach or resume
        #[arg(long, default_value = "attach")]
        mode: SessionMode,
        #[arg(long)]
        cols: Option<u16>,
        #[arg(long)]
        rows: Option<u16>,
    },
}

#[derive(Subcommand, Debug)]
enum TurnAction {
    /// Submit a message and stream the response
    Submit {
        #[arg(short, long)]
        target: String,
        /// Extra backend option; can be repeated
        #[arg(long = "option", value_name = "KEY=VALUE", value_parser = parse_option)]
        options: Vec<(String, String)>,
        message: String,
    },
    /// Resume turns left unfinished by an earlier run
    Recover {
        /// Only this target; all pending targets otherwise
        #[arg(short, long)]
        target: Option<String>,
    },
    /// Interrupt the target's running turn
    Cancel {
        #[arg(short, long)]
        target: String,
    },
    /// Reset the agent thread for a key
    Reset {
        #[arg(short, long)]
        key: String,
    },
}

#[derive(Subcommand, Debug)]
enum DraftAction {
    Show {
        #[arg(short, long)]
        target: String,
        /// Live document to check staleness against
        #[arg(long, value_name = "FILE")]
        document: Option<PathBuf>,
    },
    Apply {
        #[arg(short, long)]
        target: String,
        #[arg(long, value_name = "FILE")]
        document: Option<PathBuf>,
        /// Apply even if the document changed since the draft was made
        #[arg(long)]
        force: bool,
    },
    Discard {
        #[arg(short, long)]
        target: String,
    },
}

fn parse_option(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("Invalid option '{}'. Use KEY=VALUE.", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_cli(
        cli.verbose,
        cli.debug,
        cli.trace,
        cli.quiet,
        cli.log_overrides,
        cli.log_format,
    );
    logging::init(&log_config);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }
    if let Some(url) = cli.terminal_url {
        config.terminal_url = url;
    }

    tracing::info!(target: "tether::startup", "Using store {}", config.store_path.display());
    let store = Arc::new(SqliteStore::open(&config.store_path)?);

    match cli.command {
        Command::Turn { action } => {
            let backend = Arc::new(HttpTurnBackend::new(&config.api_base_url)?);
            let session = TurnSession::new(backend, store, config.turn_session());
            match action {
                TurnAction::Submit {
                    target,
                    options,
                    message,
                } => {
                    let options: SubmitOptions = options.into_iter().collect();
                    commands::turn_submit(&session, &target, &message, options).await
                }
                TurnAction::Recover { target } => commands::turn_recover(&session, target.as_deref()).await,
                TurnAction::Cancel { target } => commands::turn_cancel(&session, &target).await,
                TurnAction::Reset { key } => commands::turn_reset(&session, &key).await,
            }
        }
        Command::Draft { action } => {
            let backend = Arc::new(HttpTurnBackend::new(&config.api_base_url)?);
            let session = TurnSession::new(backend, store, config.turn_session());
            match action {
                DraftAction::Show { target, document } => {
                    commands::draft_show(&session, &target, document.as_deref()).await
                }
                DraftAction::Apply {
                    target,
                    document,
                    force,
                } => commands::draft_apply(&session, &target, document.as_deref(), force).await,
                DraftAction::Discard { target } => commands::draft_discard(&session, &target).await,
            }
        }
        Command::Terminal { mode, cols, rows } => {
            let mut terminal_config = config.terminal();
            terminal_config.cols = cols.unwrap_or(terminal_config.cols);
            terminal_config.rows = rows.unwrap_or(terminal_config.rows);

            tracing::info!(target: "tether::startup", "Terminal endpoint {}", config.terminal_url);
            let transport = Arc::new(WsTerminalTransport::new(&config.terminal_url)?);
            let handle = TerminalSession::spawn(terminal_config, transport, store);
            commands::terminal(handle, mode).await
        }
    }
}
