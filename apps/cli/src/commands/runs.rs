//! Run submission and inspection.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chimp_orchestrator::{JobDispatcher, RunStatus, TrainingRun};
use colored::Colorize;
use serde_json::json;

use super::{print_json, table, Context};

const LOCAL_WORKER_ID: &str = "cli";
const MAX_IDLE_POLLS: u32 = 600;

pub async fn submit(
    ctx: &Context,
    plugin: &str,
    args: Vec<(String, String)>,
    datasets: Vec<(String, String)>,
    wait: bool,
    json_output: bool,
) -> Result<()> {
    let services = ctx.services()?;
    let run_id = services
        .dispatcher
        .submit(plugin, args.into_iter().collect(), datasets.into_iter().collect())
        .await
        .with_context(|| format!("Failed to submit run of '{plugin}'"))?;

    if !wait {
        if json_output {
            return print_json(&json!({ "run_id": run_id, "status": RunStatus::Queued }));
        }
        println!("{} Queued run {}", "✓".green(), run_id.cyan());
        return Ok(());
    }

    let run = run_locally(&services.dispatcher, &run_id).await?;
    if json_output {
        return print_json(&run);
    }
    print_run(&run);
    if run.status == RunStatus::Failed {
        anyhow::bail!("Run {} failed", run.run_id);
    }
    Ok(())
}

/// Processes deliveries in this process until `run_id` is terminal.
///
/// Other queued runs ahead of it are executed along the way.
async fn run_locally(dispatcher: &JobDispatcher, run_id: &str) -> Result<TrainingRun> {
    let mut idle = 0;
    loop {
        let run = dispatcher.poll(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        match dispatcher.process_next(LOCAL_WORKER_ID).await? {
            chimp_orchestrator::ProcessOutcome::Idle => {
                idle += 1;
                if idle > MAX_IDLE_POLLS {
                    anyhow::bail!("Run {run_id} is held by another worker; giving up waiting");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            _ => idle = 0,
        }
    }
}

pub async fn status(ctx: &Context, run_id: &str, json_output: bool) -> Result<()> {
    let services = ctx.services()?;
    let run = services.dispatcher.poll(run_id).await?;
    if json_output {
        return print_json(&run);
    }
    print_run(&run);
    Ok(())
}

pub async fn list(
    ctx: &Context,
    status: Option<&str>,
    limit: usize,
    json_output: bool,
) -> Result<()> {
    let status = status.map(str::parse::<RunStatus>).transpose().map_err(anyhow::Error::msg)?;
    let services = ctx.services()?;
    let runs = services.dispatcher.list_runs(status, limit.max(1)).await?;

    if json_output {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("{}", "No runs.".dimmed());
        return Ok(());
    }

    let mut out = table(&["Run", "Plugin", "Status", "Attempts", "Model", "Created"]);
    for run in &runs {
        let model = match (&run.experiment_name, run.model_version) {
            (Some(experiment), Some(version)) => format!("{experiment} v{version}"),
            _ => "-".to_string(),
        };
        out.add_row(vec![
            run.run_id.clone(),
            run.plugin_name.clone(),
            run.status.to_string(),
            run.attempts.to_string(),
            model,
            run.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{out}");
    Ok(())
}

fn colored_status(status: RunStatus) -> colored::ColoredString {
    match status {
        RunStatus::Queued => status.to_string().yellow(),
        RunStatus::Running => status.to_string().cyan(),
        RunStatus::Succeeded => status.to_string().green(),
        RunStatus::Failed => status.to_string().red(),
    }
}

fn print_map<V: std::fmt::Display>(title: &str, map: &BTreeMap<String, V>) {
    if map.is_empty() {
        return;
    }
    println!("  {}", title.bold());
    for (key, value) in map {
        println!("    {key}: {value}");
    }
}

fn print_run(run: &TrainingRun) {
    println!("{} {}", "Run".bold(), run.run_id.cyan());
    println!("  plugin:   {}", run.plugin_name);
    println!("  status:   {}", colored_status(run.status));
    println!("  attempts: {}", run.attempts);
    if let Some(worker) = &run.worker_id {
        println!("  worker:   {worker}");
    }
    if let Some(uri) = &run.result_model_uri {
        println!("  model:    {uri}");
    }
    if let (Some(experiment), Some(version)) = (&run.experiment_name, run.model_version) {
        println!("  version:  {experiment} v{version}");
    }
    if let Some(error) = &run.error {
        println!("  error:    {}", error.red());
    }
    print_map("arguments", &run.submitted_args);
    print_map("datasets", &run.dataset_refs);
    print_map("metrics", &run.metrics);
}
