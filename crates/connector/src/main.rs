//! Share Connector
//!
//! Serves file-share operations over a Unix socket, or runs one exchange
//! against a running server.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use connector::backend::LocalConnector;
use connector::config::Config;
use connector::protocol::status::status_name;
use connector::{client, ExchangeOutcome, Server};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Share Connector - file-share operations over a local socket.
#[derive(Parser, Debug)]
#[command(name = "share-connector")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve share requests until idle or interrupted
    Server {
        /// Unix socket path
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,

        /// Seconds without activity before exiting
        #[arg(long, value_name = "SECS")]
        idle_timeout: Option<u64>,

        /// Directory holding one subdirectory per server
        #[arg(long, value_name = "DIR")]
        backend_root: Option<PathBuf>,
    },

    /// Run one operation against a running server
    Client(ClientArgs),
}

/// Operation requested by the client.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    List,
    Download,
    Upload,
    AddFolder,
    Delete,
    TestConnection,
}

impl Operation {
    fn op_code(self) -> u8 {
        match self {
            Operation::List => 1,
            Operation::Download => 2,
            Operation::Upload => 3,
            Operation::AddFolder => 4,
            Operation::Delete => 5,
            Operation::TestConnection => 6,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Operation to perform
    #[arg(long, value_enum)]
    pub op: Operation,

    /// Target URL, [smb://]server/share/path
    #[arg(long)]
    pub url: String,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    #[arg(long)]
    pub workgroup: Option<String>,

    /// Authenticate with kerberos
    #[arg(long)]
    pub kerberos: bool,

    /// Request id sent with every packet
    #[arg(long)]
    pub request_id: Option<String>,

    /// List folders only
    #[arg(long)]
    pub show_only_folders: bool,

    /// Leave hidden entries out of listings
    #[arg(long)]
    pub hide_hidden: bool,

    /// Entries per listing page
    #[arg(long, value_name = "N")]
    pub page_size: Option<u32>,

    /// First byte to download
    #[arg(long, value_name = "N")]
    pub start_offset: Option<u64>,

    /// Last byte to download (inclusive)
    #[arg(long, value_name = "N")]
    pub end_offset: Option<u64>,

    /// Download destination
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Upload source
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Socket buffer and data chunk size
    #[arg(long, value_name = "N")]
    pub buffer_size: Option<usize>,

    /// Unix socket path
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

impl ClientArgs {
    fn apply(&self, config: &mut Config) {
        let request = &mut config.request;
        request.op_code = self.op.op_code();
        request.url = self.url.clone();
        if let Some(user) = &self.user {
            request.user_name = user.clone();
        }
        if let Some(password) = &self.password {
            request.password = password.clone();
        }
        if let Some(workgroup) = &self.workgroup {
            request.workgroup = workgroup.clone();
        }
        if let Some(request_id) = &self.request_id {
            request.request_id = request_id.clone();
        }
        request.kerberos |= self.kerberos;
        request.show_only_folders |= self.show_only_folders;
        if self.hide_hidden {
            request.show_hidden_files = false;
        }
        if let Some(page_size) = self.page_size {
            request.page_size = page_size;
        }
        if let Some(start) = self.start_offset {
            request.start_offset = start;
        }
        if let Some(end) = self.end_offset {
            request.end_offset = end;
        }
        if let Some(output) = &self.output {
            request.output_file = output.clone();
        }
        if let Some(input) = &self.input {
            request.input_file = input.clone();
        }
        if let Some(size) = self.buffer_size {
            config.buffers.unix_sock_buffer = size;
        }
        if let Some(socket) = &self.socket {
            config.connector.socket_path = socket.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides, then command line flags
    config.apply_env_overrides();
    match &cli.command {
        Commands::Server {
            socket,
            idle_timeout,
            backend_root,
        } => {
            if let Some(socket) = socket {
                config.connector.socket_path = socket.clone();
            }
            if let Some(secs) = idle_timeout {
                config.connector.idle_timeout = *secs;
            }
            if let Some(root) = backend_root {
                config.backend.root = root.clone();
            }
        }
        Commands::Client(args) => args.apply(&mut config),
    }

    config.validate()?;

    // Held until main returns so buffered log lines are flushed
    let _log_guard = init_logging(&config, cli.verbose)?;
    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    let mut signals = ShutdownSignals::install().context("Failed to install signal handlers")?;

    match cli.command {
        Commands::Server { .. } => {
            tracing::info!(
                "Share connector server starting (backend root {})",
                config.backend.root.display()
            );
            let connector = Arc::new(LocalConnector::new(&config.backend.root));
            let server = Server::bind(&config, connector).await?;

            let shutdown = server.shutdown_token();
            tokio::spawn(async move {
                signals.recv().await;
                shutdown.cancel();
            });

            server.run().await?;
            tracing::info!("Share connector server stopped");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Client(args) => {
            let outcome = tokio::select! {
                outcome = client::run(&config) => outcome?,
                _ = signals.recv() => {
                    tracing::warn!("Interrupted before the exchange finished");
                    return Ok(ExitCode::FAILURE);
                }
            };
            print_outcome(&outcome, args.json)?;

            if outcome.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                tracing::error!(
                    "Exchange failed with status {} ({})",
                    outcome.code(),
                    status_name(outcome.code()).unwrap_or("errno")
                );
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` wins over the configured level; `--verbose` forces debug. A
/// configured log file is written through a non-blocking appender whose
/// guard must outlive all logging.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.connector.log_level.to_lowercase()))
    };

    if config.connector.log_file.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
        return Ok(None);
    }

    let path = Path::new(&config.connector.log_file);
    let file_name = path
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", path.display()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// SIGTERM and SIGINT listeners.
struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    fn install() -> io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for a shutdown signal (SIGTERM or SIGINT).
    async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
            _ = self.sigint.recv() => {
                tracing::info!("Received SIGINT");
            }
        }
    }
}

fn print_outcome(outcome: &ExchangeOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        let report = match outcome {
            ExchangeOutcome::Completed { entries, bytes } => serde_json::json!({
                "success": true,
                "bytes": bytes,
                "entries": entries,
            }),
            ExchangeOutcome::Failed { code, message } => serde_json::json!({
                "success": false,
                "code": code,
                "message": message,
            }),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match outcome {
        ExchangeOutcome::Completed { entries, bytes } => {
            for entry in entries {
                println!(
                    "{} {:>12}  {}",
                    if entry.is_directory { 'd' } else { '-' },
                    entry.size,
                    entry.name
                );
            }
            if *bytes > 0 {
                println!("{} bytes transferred", bytes);
            }
        }
        ExchangeOutcome::Failed { code, message } => {
            eprintln!("Error {}: {}", code, message);
        }
    }
    Ok(())
}
