use crate::error::TrainingResult;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// An ephemeral directory owned by exactly one run.
///
/// The directory and everything inside it is removed when the value is dropped,
/// including when the run fails or panics.
#[derive(Debug)]
pub struct ScratchDirectory {
    dir: TempDir,
}

impl ScratchDirectory {
    /// Create a scratch directory for `run_id` under `root` (or the system temp
    /// dir when `root` is `None`).
    pub fn acquire(root: Option<&Path>, run_id: &str) -> TrainingResult<Self> {
        let prefix = format!("chimp-run-{run_id}-");
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                tempfile::Builder::new().prefix(&prefix).tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix(&prefix).tempdir()?,
        };
        let scratch = Self { dir };
        std::fs::create_dir_all(scratch.datasets_dir())?;
        std::fs::create_dir_all(scratch.output_dir())?;
        Ok(scratch)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Where the dispatcher materializes declared datasets.
    #[must_use]
    pub fn datasets_dir(&self) -> PathBuf {
        self.path().join("datasets")
    }

    #[must_use]
    pub fn dataset_dir(&self, name: &str) -> PathBuf {
        self.datasets_dir().join(name)
    }

    /// Where plugins are expected to write model artifacts.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.path().join("output")
    }

    /// Resolve a path a plugin returned. Relative paths are relative to the
    /// scratch root; paths escaping the scratch directory yield `None`.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> Option<PathBuf> {
        let candidate =
            if path.is_absolute() { path.to_path_buf() } else { self.path().join(path) };
        let canonical = candidate.canonicalize().ok()?;
        let root = self.path().canonicalize().ok()?;
        canonical.starts_with(&root).then_some(canonical)
    }
}
