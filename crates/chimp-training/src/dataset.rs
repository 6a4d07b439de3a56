use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A dataset materialized into a run's scratch directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHandle {
    /// Dataset name as declared by the plugin descriptor.
    pub name: String,
    /// Artifact-store key prefix the dataset was fetched from.
    pub source: String,
    /// Local directory holding the fetched objects (relative layout preserved).
    pub path: PathBuf,
    /// Number of objects fetched.
    pub files: usize,
}

impl DatasetHandle {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// List the files under this dataset, sorted for stable iteration.
    pub fn list_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        collect(&self.path, &mut out)?;
        out.sort();
        Ok(out)
    }
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Normalize a store key prefix so it always denotes a "folder".
#[must_use]
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() { String::new() } else { format!("{trimmed}/") }
}
