//! Standalone event-stream server.
//!
//! Runs the fleet core and the WebSocket surface only, for deployments
//! that front the HTTP API elsewhere. Exits 0 on clean shutdown and 1
//! on a configuration error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use carousel_api::config::ConfigStore;
use carousel_api::domain::{EventBus, FleetManager, FleetOptions};
use carousel_api::interfaces::{self, ws, ApiState};
use carousel_api::logging::{self, AuditTrail};

#[derive(Debug, Parser)]
#[command(
    name = "carousel-ws",
    about = "Standalone real-time event-stream server for a carousel PLC fleet",
    version
)]
struct Args {
    /// Directory holding config.json / config_multi_plc.json
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listener port
    #[arg(long, default_value_t = 8765)]
    port: u16,

    /// error | warn | info | debug | trace
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds between background status polls
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let store = ConfigStore::new(&args.config_dir);
    let fleet_config = store.load_fleet().context("loading configuration")?;

    let log_dir = args.config_dir.join("logs");
    logging::init_with_file(
        args.log_level
            .as_deref()
            .unwrap_or(&fleet_config.logging.level),
        Some(&log_dir.join(logging::GENERAL_LOG)),
    );

    let audit = Arc::new(
        AuditTrail::open(&log_dir, &fleet_config.logging).context("opening audit logs")?,
    );
    let fleet = Arc::new(
        FleetManager::new(
            &fleet_config.plc_machines,
            EventBus::default(),
            audit,
            FleetOptions {
                poll_interval: Duration::from_secs(args.poll_interval.max(1)),
                lock_dir: args.config_dir.clone(),
            },
        )
        .context("building fleet")?,
    );
    fleet.start_pollers();

    let cancel = CancellationToken::new();
    let state = ApiState::new(Arc::clone(&fleet), cancel.clone());
    let broadcast = ws::spawn_status_broadcast(state.clone());
    let app = interfaces::ws_router(state);

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("binding {}:{}", args.host, args.port))?;
    info!(
        "event-stream server listening on ws://{}:{}/ws ({} machine(s))",
        args.host,
        args.port,
        fleet.machine_count()
    );

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let serve_cancel = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
    .await
    .context("serving")?;

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), broadcast).await;
    fleet.shutdown().await;
    info!("clean shutdown");
    Ok(())
}
