//! Plugin registry.
//!
//! Populated once at startup and shared read-only afterwards, so lookups need
//! no locking: mutation requires `&mut self` and the built registry is handed
//! around as `Arc<PluginRegistry>`.

use crate::error::{OrchestrationError, Result};
use chimp_training::{PluginDescriptor, TrainingPlugin};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A plugin together with the descriptor it reported at registration.
#[derive(Clone)]
pub struct RegisteredPlugin {
    pub descriptor: PluginDescriptor,
    pub plugin: Arc<dyn TrainingPlugin>,
}

impl fmt::Debug for RegisteredPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredPlugin")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// A plugin that was left out of the registry during [`PluginRegistry::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedPlugin {
    pub name: String,
    pub reason: String,
}

/// Outcome of [`PluginRegistry::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub rejected: Vec<RejectedPlugin>,
}

/// Catalog of training plugins keyed by descriptor name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, RegisteredPlugin>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin under the name its descriptor reports.
    ///
    /// # Errors
    /// `InvalidDescriptor` if the descriptor is malformed, `DuplicatePlugin` if
    /// the name is taken. The registry is unchanged on error.
    pub fn register(&mut self, plugin: Arc<dyn TrainingPlugin>) -> Result<&PluginDescriptor> {
        let descriptor = plugin.describe();
        self.insert(plugin, descriptor)
    }

    fn insert(
        &mut self,
        plugin: Arc<dyn TrainingPlugin>,
        descriptor: PluginDescriptor,
    ) -> Result<&PluginDescriptor> {
        descriptor.validate().map_err(|err| OrchestrationError::InvalidDescriptor {
            plugin: descriptor.name.clone(),
            reason: err.to_string(),
        })?;

        let name = descriptor.name.clone();
        if self.plugins.contains_key(&name) {
            warn!(plugin = %name, "Rejected duplicate plugin registration");
            return Err(OrchestrationError::DuplicatePlugin(name));
        }

        debug!(plugin = %name, version = %descriptor.version, "Registering plugin");
        let entry = self.plugins.entry(name).or_insert(RegisteredPlugin { descriptor, plugin });
        Ok(&entry.descriptor)
    }

    /// Registers every candidate, skipping (and reporting) the ones that fail.
    ///
    /// A plugin whose `describe` panics is rejected under the placeholder name
    /// `<plugin #index>`.
    pub fn load<I>(&mut self, candidates: I) -> LoadReport
    where
        I: IntoIterator<Item = Arc<dyn TrainingPlugin>>,
    {
        let mut report = LoadReport::default();
        for (index, plugin) in candidates.into_iter().enumerate() {
            let descriptor = match panic::catch_unwind(AssertUnwindSafe(|| plugin.describe())) {
                Ok(descriptor) => descriptor,
                Err(_) => {
                    let name = format!("<plugin #{index}>");
                    warn!(plugin = %name, "Plugin panicked while describing itself");
                    report.rejected.push(RejectedPlugin {
                        name,
                        reason: "describe panicked".to_string(),
                    });
                    continue;
                }
            };
            let reported_name = descriptor.name.clone();
            match self.insert(plugin, descriptor) {
                Ok(descriptor) => report.loaded.push(descriptor.name.clone()),
                Err(err) => {
                    warn!(plugin = %reported_name, error = %err, "Failed to load plugin");
                    report
                        .rejected
                        .push(RejectedPlugin { name: reported_name, reason: err.to_string() });
                }
            }
        }
        info!(loaded = report.loaded.len(), rejected = report.rejected.len(), "Plugins loaded");
        report
    }

    /// # Errors
    /// `UnknownPlugin` if no plugin has that name.
    pub fn get(&self, name: &str) -> Result<&RegisteredPlugin> {
        self.plugins.get(name).ok_or_else(|| OrchestrationError::UnknownPlugin(name.to_string()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Descriptors sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<PluginDescriptor> {
        self.plugins.values().map(|entry| entry.descriptor.clone()).collect()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
