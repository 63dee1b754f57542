use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gs_agent::config::AgentConfig;
use gs_agent::state::ping_loop;
use gs_agent::AgentState;
use gs_kvstore::MemActionStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
struct Cli {
    /// Path to a TOML config file. Missing fields fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gs_log::init("gs-agent");
    let cli = Cli::parse();

    let config: AgentConfig = match &cli.config {
        Some(path) => toml::from_str(&tokio::fs::read_to_string(path).await?)?,
        None => AgentConfig::default(),
    };
    let bind_addr = config.bind_addr;

    // TODO: wire a real ActionStore client once the kvstore's network
    // transport is chosen; MemActionStore is a placeholder for local runs.
    let action_store = Arc::new(MemActionStore::new());
    let state = AgentState::new(config, action_store);

    let cancel = CancellationToken::new();
    let ping_task = tokio::spawn(ping_loop(Arc::clone(&state), cancel.clone()));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "gs-agent listening");
    axum::serve(listener, gs_agent::http::router(state)).await?;

    cancel.cancel();
    let _ = ping_task.await;
    Ok(())
}
