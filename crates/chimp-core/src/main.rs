//! CHIMP server entry point.
//!
//! Serves the HTTP API and, unless `server.run_workers` is off, the worker pool.

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chimp_core::{server, ChimpConfig, ChimpServices};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chimp_core=debug,chimp_orchestrator=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ChimpConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let services = match ChimpServices::from_config(config) {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, "Failed to open stores");
            std::process::exit(1);
        }
    };
    for rejected in &services.load_report.rejected {
        error!(plugin = %rejected.name, reason = %rejected.reason, "Plugin rejected");
    }
    info!(plugins = ?services.load_report.loaded, "Plugins loaded");

    if let Err(e) = server::run(services).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
