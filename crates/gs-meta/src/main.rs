use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gs_kvstore::{MemActionStore, MemStore};
use gs_meta::{MetaConfig, MetaState};
use tracing::info;

#[derive(Parser)]
struct Cli {
    /// Path to a TOML config file. Missing fields fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gs_log::init("gs-meta");
    let cli = Cli::parse();

    let config: MetaConfig = match &cli.config {
        Some(path) => toml::from_str(&tokio::fs::read_to_string(path).await?)?,
        None => MetaConfig::default(),
    };
    let bind_addr = config.bind_addr;

    // TODO: wire real networked PlanStore/ActionStore implementations once
    // a store backend is chosen; the in-memory ones are a placeholder.
    let state = MetaState::new(config, Arc::new(MemStore::new()), Arc::new(MemActionStore::new()));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "gs-meta listening");
    axum::serve(listener, gs_meta::api::router(state)).await?;
    Ok(())
}
