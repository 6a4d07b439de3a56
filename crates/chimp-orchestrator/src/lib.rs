//! Training orchestrator for CHIMP.
//!
//! Runs arbitrary training plugins reliably:
//! - `registry`: the read-only plugin catalog built at startup
//! - `dispatcher` / `worker`: durable, at-least-once execution of runs
//! - `store`: run store, work queue, artifact store and experiment registry seams
//! - `promotion`: model stage transitions with a single production version
//! - `ingestion`: calibration sessions packed into archives for training

pub mod dispatcher;
pub mod error;
pub mod ingestion;
pub mod lifecycle;
pub mod progress;
pub mod promotion;
pub mod registry;
pub mod run;
pub mod store;
pub mod testing;
pub mod worker;

pub use dispatcher::{DispatcherConfig, JobDispatcher, ProcessOutcome};
pub use error::{OrchestrationError, Result};
pub use ingestion::{
    archive_key, CalibrationCoordinator, FlushReceipt, SampleUpload, CALIBRATION_DATASET,
};
pub use lifecycle::{ModelStage, RunStatus};
pub use progress::{ProgressReporter, RunEvent, RunMetrics};
pub use promotion::PromotionWorkflow;
pub use registry::{LoadReport, PluginRegistry, RegisteredPlugin, RejectedPlugin};
pub use run::{ClaimOutcome, RunCompletion, TrainingRun};
pub use store::{
    ArtifactStore, Delivery, ExperimentRegistry, ExperimentRun, ModelVersion, NewModelVersion,
    QueueDepth, RunStore, StageChange, Stores, WorkQueue,
};
pub use worker::{WorkerPool, WorkerPoolConfig};
