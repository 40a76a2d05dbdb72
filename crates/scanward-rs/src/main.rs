mod api;
mod config;
mod db;
mod jobs;
mod ledger;
mod models;
mod orchestrator;
mod parser;
mod runner;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::AppConfig,
    db::SqliteLedger,
    jobs::completion_loop,
    ledger::{MemoryLedger, TaskLedger},
    orchestrator::TaskOrchestrator,
    runner::{preflight, CommandRunner, TokioLauncher},
};

/// `database_url` value that keeps tasks in process memory only.
const MEMORY_LEDGER: &str = "memory";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: TaskOrchestrator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    preflight::ensure_supported_platform()?;
    let config = AppConfig::load()?;

    let ledger: Arc<dyn TaskLedger> = if config.database_url == MEMORY_LEDGER {
        info!("using in-memory task ledger, tasks are lost on restart");
        Arc::new(MemoryLedger::new())
    } else {
        let pool = db::create_pool(&config.database_url)
            .await
            .with_context(|| format!("failed to open {}", config.database_url))?;
        db::run_migrations(&pool).await?;
        Arc::new(SqliteLedger::new(pool))
    };

    let toolchain = Arc::new(preflight::resolve_toolchain(&config)?);
    let (runner, completions) =
        CommandRunner::new(toolchain, ledger.clone(), Arc::new(TokioLauncher)).await?;

    tokio::spawn(completion_loop(ledger.clone(), completions));

    let state = AppState {
        orchestrator: TaskOrchestrator::new(ledger, Arc::new(runner)),
    };

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "scanward-rs listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
