//! `chimp plugins`

use anyhow::Result;
use colored::Colorize;

use super::{print_json, table, Context};

pub fn execute(ctx: &Context, json: bool) -> Result<()> {
    let services = ctx.services()?;
    let descriptors = services.dispatcher.registry().list();

    if json {
        return print_json(&descriptors);
    }

    for rejected in &services.load_report.rejected {
        eprintln!("{} plugin '{}' rejected: {}", "✗".red(), rejected.name, rejected.reason);
    }
    if descriptors.is_empty() {
        println!("{}", "No plugins loaded.".dimmed());
        return Ok(());
    }

    let mut out = table(&["Name", "Version", "Arguments", "Datasets", "Description"]);
    for descriptor in &descriptors {
        let arguments = descriptor
            .arguments
            .values()
            .map(|arg| if arg.optional { format!("[{}]", arg.name) } else { arg.name.clone() })
            .collect::<Vec<_>>()
            .join(", ");
        let datasets = descriptor
            .datasets
            .values()
            .map(|ds| if ds.optional { format!("[{}]", ds.name) } else { ds.name.clone() })
            .collect::<Vec<_>>()
            .join(", ");
        out.add_row(vec![
            descriptor.name.clone(),
            descriptor.version.clone(),
            arguments,
            datasets,
            descriptor.description.clone(),
        ]);
    }
    println!("{out}");
    Ok(())
}
