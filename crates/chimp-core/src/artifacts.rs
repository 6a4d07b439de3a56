//! Filesystem artifact store.
//!
//! Keys are `/`-separated relative paths under a root directory. Writes go to a
//! temporary file in the target directory and are renamed into place, so a
//! reader never sees a half-written object.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chimp_orchestrator::{ArtifactStore, OrchestrationError, Result};
use chimp_training::TrainingError;
use tracing::debug;
use walkdir::WalkDir;

const UPLOAD_PREFIX: &str = ".chimp-upload-";

/// Artifact store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Opens (and creates) the store root.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl AsRef<Path>) -> std::io::Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = root.as_ref().canonicalize()?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.contains('\\')
            && relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(OrchestrationError::Training(TrainingError::Artifact(format!(
                "invalid artifact key '{key}'"
            ))));
        }
        Ok(self.root.join(relative))
    }

    /// Directory holding every key that starts with `prefix`, if it can exist.
    fn listing_root(&self, prefix: &str) -> Option<PathBuf> {
        let dir = prefix.rfind('/').map_or("", |end| &prefix[..end]);
        if dir.is_empty() {
            return Some(self.root.clone());
        }
        let valid = !dir.contains('\\')
            && Path::new(dir).components().all(|c| matches!(c, Component::Normal(_)));
        valid.then(|| self.root.join(dir)).filter(|path| path.is_dir())
    }

    fn list_sync(&self, prefix: &str) -> Result<Vec<String>> {
        let Some(start) = self.listing_root(prefix) else {
            return Ok(Vec::new());
        };
        let mut keys = Vec::new();
        for entry in WalkDir::new(start).min_depth(1) {
            let entry =
                entry.map_err(|e| OrchestrationError::store(format!("listing artifacts: {e}")))?;
            if !entry.file_type().is_file()
                || entry.file_name().to_string_lossy().starts_with(UPLOAD_PREFIX)
            {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn put_sync(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut file = tempfile::Builder::new().prefix(UPLOAD_PREFIX).tempfile_in(parent)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Removes now-empty directories between `path` and the root.
    fn prune_empty_parents(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == self.root || std::fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
    }
}

fn io_error(key: &str, err: std::io::Error) -> OrchestrationError {
    if err.kind() == std::io::ErrorKind::NotFound {
        OrchestrationError::ArtifactNotFound(key.to_string())
    } else {
        OrchestrationError::store(format!("artifact '{key}': {err}"))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| io_error(key, e))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(key)?;
        let data = bytes.to_vec();
        let target = path.clone();
        tokio::task::spawn_blocking(move || Self::put_sync(&target, &data))
            .await
            .map_err(|e| OrchestrationError::store(format!("artifact writer panicked: {e}")))?
            .map_err(|e| io_error(key, e))?;
        debug!(key = %key, bytes = bytes.len(), "Artifact stored");
        Ok(self.uri(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let store = self.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || store.list_sync(&prefix))
            .await
            .map_err(|e| OrchestrationError::store(format!("artifact listing panicked: {e}")))?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_empty_parents(&path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }

    fn uri(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}
