use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tessera_cache::SingleFlightCache;
use tessera_config::{LogBuffer, TesseraConfig};
use tessera_jsonrpc::{Connection, ConnectionOptions};
use tessera_router::RelayOptions;
use tessera_server::{HandlerOptions, RemoteBackend, WorkspaceHandler};

#[derive(Parser)]
#[command(name = "tessera", version, about = "Tessera code intelligence proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relay editor clients to an analysis backend, one private working copy per client
    Relay(RelayArgs),
    /// Serve one workspace on stdio, delegating analysis to a backend
    Serve(ServeArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to a `tessera.toml` config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct RelayArgs {
    /// Address to accept clients on (overrides `relay.listen`)
    #[arg(long)]
    listen: Option<String>,
    /// Address of the analysis backend (overrides `relay.backend`)
    #[arg(long)]
    backend: Option<String>,
    /// Reject text document modifications
    #[arg(long)]
    read_only: bool,
    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args)]
struct ServeArgs {
    /// Address of the analysis backend
    #[arg(long)]
    backend: String,
    #[command(flatten)]
    config: ConfigArgs,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = match &cli.command {
        Command::Relay(args) => args.config.config.as_deref(),
        Command::Serve(args) => args.config.config.as_deref(),
    };
    let config = load_config(config_path)?;
    let log_buffer = tessera_config::init_tracing(&config.logging);
    let logs_on_stderr = config.logging.stderr;

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")
        .and_then(|runtime| match cli.command {
            Command::Relay(args) => runtime.block_on(relay(args, config)),
            Command::Serve(args) => runtime.block_on(serve(args, config)),
        });

    if result.is_err() && !logs_on_stderr {
        if let Some(report) = recent_log_report(&log_buffer, FAILURE_LOG_LINES) {
            eprint!("{report}");
        }
    }
    result
}

/// Log lines echoed to stderr when a command fails with stderr logging off.
const FAILURE_LOG_LINES: usize = 20;

fn recent_log_report(buffer: &LogBuffer, lines: usize) -> Option<String> {
    let recent = buffer.recent(lines);
    if recent.is_empty() {
        return None;
    }
    let mut report = format!("last {} log lines:\n", recent.len());
    for line in recent {
        report.push_str("  ");
        report.push_str(&line);
        report.push('\n');
    }
    Some(report)
}

fn load_config(path: Option<&std::path::Path>) -> Result<TesseraConfig> {
    let mut config = match path {
        Some(path) => TesseraConfig::load_from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TesseraConfig::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

async fn relay(args: RelayArgs, config: TesseraConfig) -> Result<()> {
    let listen = args
        .listen
        .or_else(|| config.relay.listen.clone())
        .context("no listen address; pass --listen or set relay.listen")?;
    let backend = args
        .backend
        .or_else(|| config.relay.backend.clone())
        .context("no backend address; pass --backend or set relay.backend")?;

    let mut options = RelayOptions::from_config(&config.relay);
    options.read_only |= args.read_only;

    let listener = tessera_router::bind(&listen).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "tessera.cli", "interrupt received");
            let _ = shutdown_tx.send(true);
        }
    });

    tessera_router::serve_tcp(listener, backend, options, shutdown_rx).await
}

async fn serve(args: ServeArgs, config: TesseraConfig) -> Result<()> {
    tracing::info!(target: "tessera.cli", backend = %args.backend, "connecting to backend");
    let stream = tokio::net::TcpStream::connect(&args.backend)
        .await
        .with_context(|| format!("connect to backend {}", args.backend))?;
    let frame_options = ConnectionOptions {
        max_frame_bytes: config.relay.max_frame_bytes,
    };
    let (backend_conn, backend_incoming) = Connection::with_options(stream, frame_options.clone());
    // Backend-initiated traffic is relayed to the client by the handler's serve loop.
    let backend = Arc::new(RemoteBackend::new(backend_conn, backend_incoming));

    let cache = Arc::new(SingleFlightCache::new(config.cache.capacity));
    let handler = WorkspaceHandler::new(backend, HandlerOptions::from_config(&config, cache));

    let (client, incoming) =
        Connection::from_parts(tokio::io::stdin(), tokio::io::stdout(), frame_options);
    tracing::info!(target: "tessera.cli", backend = %args.backend, "serving workspace on stdio");
    handler.serve(client, incoming).await;
    Ok(())
}
