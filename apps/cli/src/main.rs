//! CHIMP CLI - Command-line interface for the CHIMP training service
//!
//! The `chimp` command runs the HTTP server or a standalone worker pool and
//! drives the orchestrator directly against the configured stores: listing
//! plugins, submitting and inspecting runs, uploading datasets and promoting
//! model versions.

mod commands;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{datasets, models, plugins, runs, serve, Context};

/// CHIMP - plugin-driven training orchestration
#[derive(Parser, Debug)]
#[command(
    name = "chimp",
    author,
    version,
    about = "CHIMP - plugin-driven training orchestration",
    long_about = "Runs training plugins as durable, at-least-once jobs and manages the resulting \
                  model versions.\nCommands other than `serve` and `worker` act directly on the \
                  configured stores."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Configuration file (defaults to ./chimp.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (and the worker pool unless disabled in config)
    Serve,

    /// Run a worker pool without the HTTP API until interrupted
    Worker {
        /// Number of workers (overrides dispatcher.workers)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// List loaded training plugins
    Plugins {
        /// Print full descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Queue a training run
    Submit {
        /// Plugin name
        plugin: String,

        /// Plugin argument as key=value (repeatable)
        #[arg(short, long = "arg", value_parser = commands::parse_key_value)]
        args: Vec<(String, String)>,

        /// Dataset reference as name=prefix (repeatable)
        #[arg(short, long = "dataset", value_parser = commands::parse_key_value)]
        datasets: Vec<(String, String)>,

        /// Execute the run in this process and wait for it to finish
        #[arg(long)]
        wait: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one run
    Status {
        run_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    Runs {
        /// Only runs in this status (queued, running, succeeded, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of runs
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Model versions and promotion
    #[command(subcommand)]
    Models(models::ModelsCommand),

    /// Named datasets in the artifact store
    #[command(subcommand)]
    Datasets(datasets::DatasetsCommand),

    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let ctx = Context::new(args.config);
    match command {
        Command::Serve => serve::serve(&ctx).await?,
        Command::Worker { workers } => serve::worker(&ctx, workers).await?,
        Command::Plugins { json } => plugins::execute(&ctx, json)?,
        Command::Submit { plugin, args, datasets, wait, json } => {
            runs::submit(&ctx, &plugin, args, datasets, wait, json).await?;
        }
        Command::Status { run_id, json } => runs::status(&ctx, &run_id, json).await?,
        Command::Runs { status, limit, json } => {
            runs::list(&ctx, status.as_deref(), limit, json).await?;
        }
        Command::Models(cmd) => models::execute(&ctx, cmd).await?,
        Command::Datasets(cmd) => datasets::execute(&ctx, cmd).await?,
        Command::Completions { shell } => {
            generate(shell, &mut Args::command(), "chimp", &mut std::io::stdout());
        }
    }

    Ok(())
}
