//! Named datasets.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use chimp_core::datasets;
use colored::Colorize;

use super::{print_json, Context};

#[derive(Debug, clap::Subcommand)]
pub enum DatasetsCommand {
    /// List stored datasets
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Unpack a .tar.gz archive into datasets/<name>/
    Upload {
        /// Alphanumeric dataset name
        name: String,
        /// Path to the archive
        archive: PathBuf,
    },
}

pub async fn execute(ctx: &Context, command: DatasetsCommand) -> Result<()> {
    match command {
        DatasetsCommand::List { json } => list(ctx, json).await,
        DatasetsCommand::Upload { name, archive } => upload(ctx, &name, archive).await,
    }
}

async fn list(ctx: &Context, json: bool) -> Result<()> {
    let services = ctx.services()?;
    let names = datasets::list(services.stores.artifacts.as_ref()).await?;
    if json {
        return print_json(&names);
    }
    if names.is_empty() {
        println!("{}", "No datasets.".dimmed());
    }
    for name in names {
        println!("{name}\t{}", datasets::dataset_prefix(&name).dimmed());
    }
    Ok(())
}

async fn upload(ctx: &Context, name: &str, archive: PathBuf) -> Result<()> {
    if !datasets::is_valid_name(name) {
        anyhow::bail!("Dataset name '{name}' must be alphanumeric");
    }
    let bytes = tokio::fs::read(&archive)
        .await
        .with_context(|| format!("Failed to read {}", archive.display()))?;
    let services = ctx.services()?;
    let upload = datasets::upload(services.stores.artifacts.as_ref(), name, bytes).await?;
    println!(
        "{} Uploaded {} files to {}",
        "✓".green(),
        upload.files,
        upload.prefix.cyan()
    );
    Ok(())
}
