//! Console server: hosts the workers in-process and exposes the job queue,
//! agent state and the human input channel over HTTP.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use autoapply::io::init::{DEFAULT_STATE_DIR, StatePaths};
use autoapply::io::intervention::InterventionGate;
use autoapply::io::model::OllamaClient;
use autoapply::io::monitor::Monitor;
use autoapply::io::process::DriverProcess;
use autoapply::io::store::JobStore;
use autoapply::io::webdriver::WebDriverFactory;
use autoapply::worker::{PoolSpec, spawn_workers};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::state::AppState;

const DRIVER_READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "autoapply-ui")]
#[command(about = "Console API for the autoapply workers")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// State directory (created by `autoapply init`)
    #[arg(long, default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Number of worker threads; 0 serves the API only
    #[arg(long, default_value_t = 1)]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("autoapply=info".parse()?)
                .add_directive("autoapply_ui=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let paths = StatePaths::new(&args.state_dir);
    info!(state_dir = %paths.state_dir.display(), "starting autoapply-ui");

    let gate = InterventionGate::new();
    let monitor = Monitor::new();
    let spec = PoolSpec::load(paths, gate.clone(), monitor.clone())?;
    let store = JobStore::open(&spec.paths.db_path).context("open job store for the API")?;
    let state = AppState::new(store, gate, monitor.handle());

    sse::start_event_bridge(monitor.handle().subscribe(), (*state.event_tx).clone());
    // Workers hold their own reporters; the bridge ends once they are gone.
    drop(monitor);

    let config = &spec.config;
    let _driver = if args.workers > 0 && !config.browser.driver_command.is_empty() {
        Some(DriverProcess::spawn(
            &config.browser.driver_command,
            &config.browser.webdriver_url,
            DRIVER_READY_TIMEOUT,
        )?)
    } else {
        None
    };
    let shutdown = Arc::new(AtomicBool::new(false));
    let handles = if args.workers > 0 {
        let model = OllamaClient::new(&config.model.base_url, config.model_timeout())?;
        let factory = WebDriverFactory::new(config.browser.clone());
        spawn_workers(&spec, args.workers, factory, model, Arc::clone(&shutdown))?
    } else {
        info!("no workers requested, API-only mode");
        Vec::new()
    };
    drop(spec);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("stopping workers after their current job");
    shutdown.store(true, Ordering::SeqCst);
    let _ = state.gate.cancel();
    tokio::task::spawn_blocking(move || {
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    })
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
