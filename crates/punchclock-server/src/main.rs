//! Punchclock Server
//!
//! HTTP service that issues terminal tokens and records attendance scans.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use punchclock_core::config::{default_database_path, load_config};
use punchclock_core::tracing_init::init_tracing;
use punchclock_core::{Clock, SystemClock};
use punchclock_server::http::build_router;
use punchclock_server::state::AppState;
use punchclock_server::storage::AttendanceDatabase;
use punchclock_server::tasks;

#[derive(Parser, Debug)]
#[command(name = "punchclock-server")]
#[command(version, about = "Punchclock attendance server - terminal tokens and hash-chained records")]
struct Args {
    /// Path to a JSON settings file.
    #[arg(long, env = "PUNCHCLOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on. Overrides the settings file.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.listen_addr = addr.to_string();
    }
    if let Some(path) = args.db_path {
        config.server.database_path = Some(path);
    }
    if args.log_json {
        config.server.log_json = true;
    }

    init_tracing("punchclock_server=info", config.server.log_json);

    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {e}", config.server.listen_addr))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        "Starting punchclock-server"
    );

    let db_path = match &config.server.database_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening attendance database");
    let db = AttendanceDatabase::open(&db_path).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tokens = config.tokens.clone();
    let (state, summary_rx) = AppState::new(db, config, clock)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = vec![tasks::spawn_rotation_supervisor(
        state.db.clone(),
        state.issuer.clone(),
        Duration::from_secs(tokens.rotation_interval_secs),
        shutdown_rx.clone(),
    )];
    handles.push(tasks::spawn_issuance_cleanup(
        state.db.clone(),
        Arc::clone(&state.nonces),
        Arc::clone(&state.clock),
        Duration::from_secs(tokens.cleanup_interval_secs),
        tokens.cleanup_grace_secs,
        shutdown_rx.clone(),
    ));
    handles.push(tasks::spawn_summary_worker(
        state.summaries.clone(),
        summary_rx,
        shutdown_rx,
    ));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");

    tokio::select! {
        result = axum::serve(listener, build_router(state)) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    if shutdown_tx.send(true).is_err() {
        warn!("Background tasks already stopped");
    }
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Server stopped");
    Ok(())
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("punchclock").join("attendance.db"))
        .or_else(default_database_path)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine data directory"))
}
