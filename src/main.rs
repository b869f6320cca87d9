//! proxiable - serve, probe and supervise UNIX domain socket listeners

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxiable::cluster::Coordinator;
use proxiable::config::Config;
use proxiable::instrument::orphan::{self, Inspection, ProbeResult};
use proxiable::{ListenAddr, Proxiable, ProxiableOptions, Server};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "proxiable")]
#[command(about = "Keep UNIX domain socket servers reachable and clean up after them")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen on an address until terminated
    Serve {
        /// Socket path or host:port (defaults to <runtime_dir>/proxiable/<name>.sock)
        address: Option<String>,

        /// Server name used for the default socket path
        #[arg(short, long, default_value = "default")]
        name: String,
    },
    /// Report whether a socket path is live, orphaned or something else
    Probe {
        path: PathBuf,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run `serve` in a worker process and unlink its socket on exit
    Supervise {
        /// Socket path or host:port (defaults to <runtime_dir>/proxiable/<name>.sock)
        address: Option<String>,

        /// Server name used for the default socket path
        #[arg(short, long, default_value = "default")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is the notice pipe when running as a worker
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Serve { address, name } => {
            let address = resolve_address(&config, address, &name);
            serve(address, ProxiableOptions::from_config(&config)?).await
        }
        Commands::Probe { path, json } => probe(&path, json).await,
        Commands::Supervise { address, name } => {
            let address = resolve_address(&config, address, &name);
            supervise(address, cli.config.as_deref()).await
        }
    }
}

fn resolve_address(config: &Config, address: Option<String>, name: &str) -> ListenAddr {
    match address {
        Some(raw) => match raw.parse::<ListenAddr>() {
            Ok(address) => address,
            Err(never) => match never {},
        },
        None => ListenAddr::Path(config.socket_path(name)),
    }
}

async fn serve(address: ListenAddr, options: ProxiableOptions) -> Result<()> {
    if let Some(parent) = address.as_path().and_then(Path::parent) {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create socket directory {:?}", parent))?;
        }
    }

    // Installed before binding so a signal never bypasses the exit hooks
    let shutdown = exit_signals()?;

    let server = Proxiable::new(options).wrap(Server::new());
    let bound = server.listen(address).await?;
    tracing::info!("Serving on {}", bound);

    tokio::select! {
        _ = accept_loop(&server) => Ok(()),
        received = shutdown => {
            tracing::info!("Received {}, exiting", received);
            // exit hooks close the server, which removes the socket file
            std::process::exit(0)
        }
    }
}

/// Accept and immediately drop connections; no protocol is spoken here
async fn accept_loop(server: &Server) {
    loop {
        match server.accept().await {
            Ok(connection) => {
                tracing::debug!("Accepted {:?}", connection);
                drop(connection);
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {}", e);
                break;
            }
        }
    }
}

/// Register SIGTERM, SIGINT and SIGHUP now; the future resolves to the name
/// of the first one received
fn exit_signals() -> Result<impl Future<Output = &'static str>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(async move {
        tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
            _ = hangup.recv() => "SIGHUP",
        }
    })
}

async fn probe(path: &Path, json: bool) -> Result<()> {
    let (status, detail) = match orphan::inspect(path).await {
        Inspection::Missing => ("missing", None),
        Inspection::NotASocket => ("not-a-socket", None),
        Inspection::Probed(ProbeResult::Live) => ("live", None),
        Inspection::Probed(ProbeResult::Orphan) => ("orphan", None),
        Inspection::Probed(ProbeResult::Ambiguous(kind)) => ("ambiguous", Some(kind.to_string())),
    };

    if json {
        let report = serde_json::json!({
            "path": path,
            "status": status,
            "error": detail,
        });
        println!("{}", serde_json::to_string(&report)?);
    } else {
        match detail {
            Some(detail) => println!("{}: {} ({})", path.display(), status, detail),
            None => println!("{}: {}", path.display(), status),
        }
    }
    Ok(())
}

async fn supervise(address: ListenAddr, config: Option<&Path>) -> Result<()> {
    let coordinator = Arc::new(Coordinator::new());

    let mut command = tokio::process::Command::new(std::env::current_exe()?);
    if let Some(config) = config {
        command.arg("--config").arg(config);
    }
    command
        .arg("serve")
        .arg(address.to_string())
        .kill_on_drop(true);

    let shutdown = exit_signals()?;
    let mut worker = coordinator.spawn_worker(command)?;

    tokio::select! {
        status = worker.child.wait() => {
            tracing::info!("Worker {} exited: {}", worker.id, status?);
        }
        received = shutdown => {
            tracing::info!("Received {}, stopping worker {}", received, worker.id);
            worker.terminate()?;
            let status = worker.child.wait().await?;
            tracing::info!("Worker {} exited: {}", worker.id, status);
        }
    }

    // Exit hooks unlink whatever the worker reported listening on
    Ok(())
}
