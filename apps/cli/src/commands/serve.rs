//! Long-running modes: the HTTP server and a standalone worker pool.

use anyhow::{Context as _, Result};
use chimp_core::{server, ChimpServices};
use colored::Colorize;
use tracing::info;

use super::Context;

pub async fn serve(ctx: &Context) -> Result<()> {
    let services = ctx.services()?;
    println!(
        "{} CHIMP server on http://{} ({} plugins)",
        "▶".green(),
        services.config.server.address,
        services.load_report.loaded.len()
    );
    server::run(services).await.context("Server error")
}

/// Runs workers against the shared stores until Ctrl-C.
pub async fn worker(ctx: &Context, workers: Option<usize>) -> Result<()> {
    let mut config = ctx.config()?;
    if let Some(workers) = workers {
        config.dispatcher.workers = workers.max(1);
    }
    let services = ChimpServices::from_config(config).context("Failed to open stores")?;

    let mut pool = services.worker_pool();
    pool.start().map_err(anyhow::Error::msg)?;
    println!("{} Workers running: {}", "▶".green(), pool.worker_ids().join(", "));

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Stopping workers");
    pool.shutdown().await;
    println!("{} Workers stopped", "■".yellow());
    Ok(())
}
