//! End-to-end tests for the orchestration flow
//!
//! Submission through a running worker pool, model registration, promotion and
//! production lookup, all on in-memory stores.

use chimp_orchestrator::testing::StaticPlugin;
use chimp_orchestrator::{
    ArtifactStore, CalibrationCoordinator, DispatcherConfig, JobDispatcher, ModelStage,
    PluginRegistry, PromotionWorkflow, RunStatus, SampleUpload, Stores, TrainingRun, WorkerPool,
    WorkerPoolConfig, CALIBRATION_DATASET,
};
use chimp_training::{ArgumentSpec, CategorySet, DatasetSpec, PluginDescriptor, TrainingPlugin};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new("emotions", "1.0", "per-user emotion model")
        .with_argument(ArgumentSpec::optional("user_id", "str", "calibrating user"))
        .with_dataset(DatasetSpec::optional(CALIBRATION_DATASET, "calibration archives"))
}

fn setup(plugins: Vec<Arc<dyn TrainingPlugin>>) -> (Arc<JobDispatcher>, Stores) {
    let mut registry = PluginRegistry::new();
    registry.load(plugins);
    let stores = Stores::in_memory();
    let config = DispatcherConfig {
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        ..DispatcherConfig::default()
    };
    (Arc::new(JobDispatcher::new(Arc::new(registry), stores.clone(), config)), stores)
}

async fn wait_terminal(dispatcher: &JobDispatcher, run_id: &str) -> TrainingRun {
    for _ in 0..500 {
        let run = dispatcher.poll(run_id).await.unwrap();
        if run.status.is_terminal() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not finish");
}

#[tokio::test]
async fn test_submit_run_promote_and_resolve() {
    let plugin = Arc::new(StaticPlugin::new(descriptor()).with_model());
    let (dispatcher, stores) = setup(vec![plugin.clone()]);
    let mut pool = WorkerPool::new(
        Arc::clone(&dispatcher),
        WorkerPoolConfig {
            workers: 2,
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        },
    );
    pool.start().unwrap();

    let first = dispatcher.submit("emotions", BTreeMap::new(), BTreeMap::new()).await.unwrap();
    let first = wait_terminal(&dispatcher, &first).await;
    assert_eq!(first.status, RunStatus::Succeeded);
    assert!(first.result_model_uri.is_some());

    let promotion = PromotionWorkflow::new(Arc::clone(&stores.experiments));
    promotion.promote("emotions", "emotions", 1, ModelStage::Staging).await.unwrap();
    promotion.promote("emotions", "emotions", 1, ModelStage::Production).await.unwrap();

    let production = promotion.production_version("emotions", "emotions").await.unwrap().unwrap();
    assert_eq!(production.version, 1);
    assert_eq!(Some(production.artifact_uri.clone()), first.result_model_uri);

    let second = dispatcher.submit("emotions", BTreeMap::new(), BTreeMap::new()).await.unwrap();
    let second = wait_terminal(&dispatcher, &second).await;
    assert_eq!(second.model_version, Some(2));

    promotion.promote("emotions", "emotions", 2, ModelStage::Staging).await.unwrap();
    let change =
        promotion.promote("emotions", "emotions", 2, ModelStage::Production).await.unwrap();
    assert_eq!(change.demoted.map(|v| v.version), Some(1));

    let production = promotion.production_version("emotions", "emotions").await.unwrap().unwrap();
    assert_eq!(production.version, 2);

    pool.shutdown().await;
    assert_eq!(plugin.executions(), 2);
}

#[tokio::test]
async fn test_failing_plugin_leaves_no_artifacts() {
    let plugin =
        Arc::new(StaticPlugin::new(descriptor()).with_model().failing("labels out of range"));
    let (dispatcher, stores) = setup(vec![plugin]);
    let mut pool = WorkerPool::new(
        Arc::clone(&dispatcher),
        WorkerPoolConfig {
            workers: 1,
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        },
    );
    pool.start().unwrap();

    let run_id = dispatcher.submit("emotions", BTreeMap::new(), BTreeMap::new()).await.unwrap();
    let run = wait_terminal(&dispatcher, &run_id).await;
    pool.shutdown().await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(!run.error.unwrap_or_default().is_empty());
    assert!(stores.artifacts.list(&format!("runs/{run_id}/")).await.unwrap().is_empty());
    assert!(stores.experiments.list_versions("emotions", "emotions").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_calibration_session_trains_user_model() {
    let plugin = Arc::new(StaticPlugin::new(descriptor()).with_model());
    let (dispatcher, stores) = setup(vec![plugin.clone()]);
    let coordinator =
        CalibrationCoordinator::new(Arc::clone(&stores.artifacts), CategorySet::default());

    for (i, label) in ["happy", "sad", "angry"].iter().enumerate() {
        coordinator
            .add_sample(
                "socket-1",
                SampleUpload {
                    user_id: "bob".to_string(),
                    label: (*label).to_string(),
                    blob: vec![i as u8; 16],
                    timestamp: format!("2024-05-01T12:00:0{i}.000Z"),
                },
            )
            .await
            .unwrap();
    }

    let (receipt, run_id) =
        coordinator.flush_and_submit("socket-1", &dispatcher, "emotions").await.unwrap();
    assert_eq!(receipt.samples, 3);
    dispatcher.process_next("w-1").await.unwrap();

    let run = dispatcher.poll(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.submitted_args.get("user_id").map(String::as_str), Some("bob"));
    assert_eq!(plugin.seen_datasets()[CALIBRATION_DATASET].len(), 1);
}
