//! Calibration data ingestion.
//!
//! Clients stream labelled samples into a session. A flush packs the session
//! into one gzip-compressed tar archive in the artifact store; the archive key
//! can then be handed to a plugin as its `calibration` dataset.

use crate::dispatcher::JobDispatcher;
use crate::error::{OrchestrationError, Result};
use crate::registry::PluginRegistry;
use crate::store::ArtifactStore;
use chimp_training::{write_archive, CalibrationSample, CategorySet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Dataset name calibration archives are submitted under.
pub const CALIBRATION_DATASET: &str = "calibration";

/// One labelled sample as received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleUpload {
    pub user_id: String,
    pub label: String,
    pub blob: Vec<u8>,
    pub timestamp: String,
}

#[derive(Debug, Default)]
struct CalibrationSession {
    user_id: String,
    samples: Vec<CalibrationSample>,
    timestamps: HashSet<String>,
}

/// Where a flushed session ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReceipt {
    pub session_id: String,
    pub user_id: String,
    pub batch_id: String,
    pub key: String,
    pub uri: String,
    pub samples: usize,
}

/// Buffers calibration sessions and writes them out as archives.
pub struct CalibrationCoordinator {
    artifacts: Arc<dyn ArtifactStore>,
    categories: CategorySet,
    sessions: RwLock<HashMap<String, CalibrationSession>>,
}

impl std::fmt::Debug for CalibrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationCoordinator")
            .field("categories", &self.categories)
            .finish_non_exhaustive()
    }
}

impl CalibrationCoordinator {
    #[must_use]
    pub fn new(artifacts: Arc<dyn ArtifactStore>, categories: CategorySet) -> Self {
        Self { artifacts, categories, sessions: RwLock::new(HashMap::new()) }
    }

    /// Uses the category set declared by `plugin_name`, falling back to
    /// `fallback` when the plugin is unknown or declares none.
    #[must_use]
    pub fn for_plugin(
        artifacts: Arc<dyn ArtifactStore>,
        registry: &PluginRegistry,
        plugin_name: &str,
        fallback: CategorySet,
    ) -> Self {
        let categories = registry
            .get(plugin_name)
            .ok()
            .filter(|entry| !entry.descriptor.categories.is_empty())
            .map_or(fallback, |entry| CategorySet::new(entry.descriptor.categories.iter()));
        Self::new(artifacts, categories)
    }

    #[must_use]
    pub fn categories(&self) -> &CategorySet {
        &self.categories
    }

    /// Buffers one sample.
    ///
    /// # Errors
    /// `InvalidLabel`, `DuplicateSample`, or `InvalidSample` when the user id
    /// differs from the one the session started with. The session is unchanged
    /// on error.
    pub async fn add_sample(&self, session_id: &str, sample: SampleUpload) -> Result<usize> {
        self.add_samples(session_id, vec![sample]).await
    }

    /// Buffers a batch of samples; either all are accepted or none.
    ///
    /// Returns the session's sample count afterwards.
    pub async fn add_samples(&self, session_id: &str, samples: Vec<SampleUpload>) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let existing = sessions.get(session_id);

        let mut user_id = existing.map(|session| session.user_id.clone());
        let mut batch_timestamps = HashSet::new();
        for sample in &samples {
            self.categories.validate(&sample.label)?;
            match &user_id {
                Some(user) if *user != sample.user_id => {
                    return Err(OrchestrationError::InvalidSample {
                        session: session_id.to_string(),
                        reason: format!(
                            "user '{}' does not match session user '{user}'",
                            sample.user_id
                        ),
                    });
                }
                Some(_) => {}
                None => user_id = Some(sample.user_id.clone()),
            }
            let seen =
                existing.is_some_and(|session| session.timestamps.contains(&sample.timestamp));
            if seen || !batch_timestamps.insert(sample.timestamp.clone()) {
                return Err(OrchestrationError::DuplicateSample {
                    session: session_id.to_string(),
                    timestamp: sample.timestamp.clone(),
                });
            }
        }

        let session = sessions.entry(session_id.to_string()).or_default();
        if let Some(user) = user_id {
            session.user_id = user;
        }
        for sample in samples {
            session.timestamps.insert(sample.timestamp.clone());
            session.samples.push(CalibrationSample {
                label: sample.label.trim().to_ascii_lowercase(),
                blob: sample.blob,
                timestamp: sample.timestamp,
            });
        }
        debug!(
            session_id = %session_id,
            samples = session.samples.len(),
            "Calibration samples buffered"
        );
        Ok(session.samples.len())
    }

    pub async fn sample_count(&self, session_id: &str) -> usize {
        self.sessions.read().await.get(session_id).map_or(0, |session| session.samples.len())
    }

    /// Drops a session's buffer. Returns how many samples were discarded.
    pub async fn discard(&self, session_id: &str) -> usize {
        let removed = self.sessions.write().await.remove(session_id);
        let count = removed.map_or(0, |session| session.samples.len());
        if count > 0 {
            info!(session_id = %session_id, samples = count, "Calibration session discarded");
        }
        count
    }

    /// Per-label sample counts of a session, for progress display.
    pub async fn label_counts(&self, session_id: &str) -> BTreeMap<String, usize> {
        let sessions = self.sessions.read().await;
        let mut counts = BTreeMap::new();
        if let Some(session) = sessions.get(session_id) {
            for sample in &session.samples {
                *counts.entry(sample.label.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Writes the session to the artifact store as one archive.
    ///
    /// The buffer is cleared only after the store accepted the archive, so a
    /// failed flush can simply be retried.
    ///
    /// # Errors
    /// `EmptySession` if nothing is buffered, or the store's error.
    pub async fn flush(&self, session_id: &str) -> Result<FlushReceipt> {
        // The lock spans the upload so no sample lands between archive and clear.
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get(session_id)
            .filter(|session| !session.samples.is_empty())
            .ok_or_else(|| OrchestrationError::EmptySession(session_id.to_string()))?;

        let archive = write_archive(&session.user_id, &session.samples)?;
        let batch_id = uuid::Uuid::new_v4().to_string();
        let key = archive_key(&session.user_id, &batch_id);
        let uri = self.artifacts.put(&key, &archive).await?;

        let receipt = FlushReceipt {
            session_id: session_id.to_string(),
            user_id: session.user_id.clone(),
            batch_id,
            key,
            uri,
            samples: session.samples.len(),
        };
        sessions.remove(session_id);

        info!(
            session_id = %session_id,
            user_id = %receipt.user_id,
            key = %receipt.key,
            samples = receipt.samples,
            "Calibration session flushed"
        );
        Ok(receipt)
    }

    /// Flushes the session and queues a run of `plugin_name` on the archive.
    ///
    /// The run gets the archive as its `calibration` dataset and the session's
    /// user as its `user_id` argument (when the session has one).
    pub async fn flush_and_submit(
        &self,
        session_id: &str,
        dispatcher: &JobDispatcher,
        plugin_name: &str,
    ) -> Result<(FlushReceipt, String)> {
        // Reject unknown plugins before the buffer is consumed.
        dispatcher.registry().get(plugin_name)?;
        let receipt = self.flush(session_id).await?;

        let mut args = BTreeMap::new();
        if !receipt.user_id.is_empty() {
            args.insert("user_id".to_string(), receipt.user_id.clone());
        }
        let datasets = BTreeMap::from([(CALIBRATION_DATASET.to_string(), receipt.key.clone())]);
        let run_id = dispatcher.submit(plugin_name, args, datasets).await?;
        info!(
            session_id = %session_id,
            run_id = %run_id,
            plugin = %plugin_name,
            "Calibration run submitted"
        );
        Ok((receipt, run_id))
    }
}

/// `calibration/<user or "global">/<batch_id>.tar.gz`
#[must_use]
pub fn archive_key(user_id: &str, batch_id: &str) -> String {
    let owner: String = user_id
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let owner = if owner.is_empty() { "global".to_string() } else { owner };
    format!("calibration/{owner}/{batch_id}.tar.gz")
}
