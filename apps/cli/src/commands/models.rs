//! Model versions and promotion.

use anyhow::{Context as _, Result};
use chimp_core::Calibration;
use chimp_orchestrator::ModelStage;
use colored::Colorize;

use super::{print_json, table, Context};

#[derive(Debug, clap::Subcommand)]
pub enum ModelsCommand {
    /// List the versions of a model
    Versions {
        experiment: String,
        model: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move a version to another stage (none, staging, production)
    Promote {
        experiment: String,
        model: String,
        version: u32,
        stage: String,
    },
    /// Show the latest version in a stage (production by default)
    Production {
        experiment: String,
        model: String,

        #[arg(short, long, default_value = "production")]
        stage: String,

        /// Prefer this user's calibrated model
        #[arg(long, conflicts_with = "run_id")]
        user: Option<String>,

        /// Prefer the model registered by this calibration run
        #[arg(long)]
        run_id: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_stage(raw: &str) -> Result<ModelStage> {
    raw.parse::<ModelStage>().map_err(anyhow::Error::msg)
}

pub async fn execute(ctx: &Context, command: ModelsCommand) -> Result<()> {
    match command {
        ModelsCommand::Versions { experiment, model, json } => {
            versions(ctx, &experiment, &model, json).await
        }
        ModelsCommand::Promote { experiment, model, version, stage } => {
            promote(ctx, &experiment, &model, version, &stage).await
        }
        ModelsCommand::Production { experiment, model, stage, user, run_id, json } => {
            let calibration = match (run_id.as_deref(), user.as_deref()) {
                (Some(run_id), _) => Some(Calibration::Run(run_id)),
                (None, Some(user)) => Some(Calibration::User(user)),
                (None, None) => None,
            };
            production(ctx, &experiment, &model, &stage, calibration, json).await
        }
    }
}

async fn versions(ctx: &Context, experiment: &str, model: &str, json: bool) -> Result<()> {
    let services = ctx.services()?;
    let versions = services.promotion.list_versions(experiment, model).await?;
    if json {
        return print_json(&versions);
    }
    if versions.is_empty() {
        println!("{}", format!("No versions of {experiment}/{model}.").dimmed());
        return Ok(());
    }

    let mut out = table(&["Version", "Stage", "Run", "Artifact", "Created"]);
    for version in &versions {
        out.add_row(vec![
            version.version.to_string(),
            version.stage.to_string(),
            version.run_id.clone(),
            version.artifact_uri.clone(),
            version.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{out}");
    Ok(())
}

async fn promote(
    ctx: &Context,
    experiment: &str,
    model: &str,
    version: u32,
    stage: &str,
) -> Result<()> {
    let target = parse_stage(stage)?;
    let services = ctx.services()?;
    let change = services
        .promotion
        .promote(experiment, model, version, target)
        .await
        .with_context(|| format!("Failed to move {experiment}/{model} v{version} to {target}"))?;

    if change.previous_stage == target {
        println!("{} {experiment}/{model} v{version} is already in {target}", "=".yellow());
    } else {
        println!(
            "{} {experiment}/{model} v{version}: {} -> {}",
            "✓".green(),
            change.previous_stage,
            target.to_string().bold()
        );
    }
    if let Some(demoted) = change.demoted {
        println!("  v{} demoted to {}", demoted.version, demoted.stage);
    }
    Ok(())
}

async fn production(
    ctx: &Context,
    experiment: &str,
    model: &str,
    stage: &str,
    calibration: Option<Calibration<'_>>,
    json: bool,
) -> Result<()> {
    let stage = parse_stage(stage)?;
    let services = ctx.services()?;
    let resolved = match calibration {
        Some(calibration) => {
            services.resolver.resolve_calibrated(experiment, model, stage, calibration).await?
        }
        None => services.resolver.resolve(experiment, model, stage).await?,
    };
    let Some(resolved) = resolved else {
        anyhow::bail!("No {stage} version of {experiment}/{model}");
    };
    if json {
        return print_json(&resolved);
    }
    let origin = if resolved.calibrated { ", calibrated" } else { "" };
    println!(
        "{}/{} v{} ({}{origin})",
        resolved.experiment_name, resolved.model_name, resolved.version, resolved.stage
    );
    println!("{}", resolved.artifact_uri);
    Ok(())
}
