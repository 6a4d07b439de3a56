//! Minimal plugin used to smoke-test a deployment.

use async_trait::async_trait;
use chimp_training::{
    ArgumentSpec, PluginDescriptor, PluginResult, RunContext, RunResult, TrainingPlugin,
};
use tracing::info;

pub const PLUGIN_NAME: &str = "example";

/// Produces no model; echoes its `message` argument back as a tag.
#[derive(Debug, Clone, Default)]
pub struct ExamplePlugin;

#[async_trait]
impl TrainingPlugin for ExamplePlugin {
    fn describe(&self) -> PluginDescriptor {
        PluginDescriptor::new(
            PLUGIN_NAME,
            "1.0",
            "Example plugin that trains nothing and reports a single metric.",
        )
        .with_argument(ArgumentSpec::optional("message", "str", "Echoed back as the 'message' tag"))
    }

    async fn run(&self, ctx: &RunContext<'_>) -> PluginResult<RunResult> {
        info!(run_id = %ctx.run_id, "Running example plugin");
        let mut result = RunResult::default().with_metric("ok", 1.0);
        if let Some(message) = ctx.args.get("message") {
            result = result.with_tag("message", message);
        }
        Ok(result)
    }
}
