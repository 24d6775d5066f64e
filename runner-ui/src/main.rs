//! patchrunner API server: start, inspect and cancel jobs, stream their logs.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use patchrunner::engine::Engine;
use patchrunner::io::config::{RunnerConfig, load_config};
use patchrunner::io::store::MemoryStore;
use patchrunner::io::tracker::GhCli;
use patchrunner::provider::ProviderRegistry;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "patchrunner-ui")]
#[command(about = "HTTP API for running coding-agent jobs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Config file (TOML). Missing file means defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Router with the API nested under `/api`.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", routes::api_router())
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("patchrunner_ui=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => RunnerConfig::default(),
    };
    let tracker = Arc::new(GhCli::new(config.metadata_limits()));
    let providers = ProviderRegistry::builtin(&config);
    let engine = Engine::new(config, Arc::new(MemoryStore::new()), tracker, providers)?;
    let state = AppState::new(engine);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}
