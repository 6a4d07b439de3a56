//! Scriptable plugin for tests and demos.

use async_trait::async_trait;
use chimp_training::{
    ModelArtifact, ModelType, PluginDescriptor, PluginExecutionError, PluginResult, RunContext,
    RunResult, TrainingPlugin,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Behavior {
    Succeed,
    Fail(String),
    Panic,
}

/// A plugin whose descriptor and outcome are fixed up front.
///
/// Counts its executions and remembers which dataset files it saw, so tests
/// can assert on exactly-once execution and materialization.
#[derive(Debug)]
pub struct StaticPlugin {
    descriptor: PluginDescriptor,
    behavior: Behavior,
    writes_model: bool,
    delay: Duration,
    executions: AtomicUsize,
    seen_datasets: Mutex<BTreeMap<String, Vec<String>>>,
}

impl StaticPlugin {
    /// Succeeds without producing a model.
    #[must_use]
    pub fn new(descriptor: PluginDescriptor) -> Self {
        Self {
            descriptor,
            behavior: Behavior::Succeed,
            writes_model: false,
            delay: Duration::ZERO,
            executions: AtomicUsize::new(0),
            seen_datasets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Writes `output/model.bin` (containing the run id) and returns it.
    #[must_use]
    pub fn with_model(mut self) -> Self {
        self.writes_model = true;
        self
    }

    /// Fails every run with `cause`. Model files are still written first when
    /// [`with_model`](Self::with_model) is set.
    #[must_use]
    pub fn failing(mut self, cause: impl Into<String>) -> Self {
        self.behavior = Behavior::Fail(cause.into());
        self
    }

    #[must_use]
    pub fn panicking(mut self) -> Self {
        self.behavior = Behavior::Panic;
        self
    }

    /// Sleeps for `delay` inside every run.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Relative file names of each dataset seen by the latest run.
    pub fn seen_datasets(&self) -> BTreeMap<String, Vec<String>> {
        self.seen_datasets.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TrainingPlugin for StaticPlugin {
    fn describe(&self) -> PluginDescriptor {
        self.descriptor.clone()
    }

    async fn run(&self, ctx: &RunContext<'_>) -> PluginResult<RunResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);

        let mut seen = BTreeMap::new();
        for (name, handle) in ctx.datasets {
            let files = handle
                .list_files()?
                .iter()
                .filter_map(|path| path.strip_prefix(handle.path()).ok())
                .map(|path| path.to_string_lossy().replace('\\', "/"))
                .collect();
            seen.insert(name.clone(), files);
        }
        if let Ok(mut slot) = self.seen_datasets.lock() {
            *slot = seen;
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut result = RunResult::default()
            .with_metric("accuracy", 0.9)
            .with_hyperparameter("epochs", ctx.args.get("epochs").unwrap_or("1"))
            .with_tag("plugin", self.descriptor.name.clone());
        if self.writes_model {
            let path = ctx.workspace.output_dir().join("model.bin");
            std::fs::write(&path, ctx.run_id.as_bytes())?;
            result = result.with_model(ModelArtifact::new(path, ModelType::Other));
        }

        match &self.behavior {
            Behavior::Succeed => Ok(result),
            Behavior::Fail(cause) => Err(PluginExecutionError::new(cause.clone())),
            Behavior::Panic => panic!("plugin '{}' panicked on purpose", self.descriptor.name),
        }
    }
}
