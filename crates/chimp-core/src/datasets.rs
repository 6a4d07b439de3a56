//! Named datasets in the artifact store.
//!
//! A dataset is a key prefix `datasets/<name>/`. Uploads arrive as a
//! gzip-compressed tar archive whose regular files are stored under that prefix
//! with their relative paths preserved; a run then references the dataset by
//! the prefix.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::Component;

use chimp_orchestrator::{ArtifactStore, OrchestrationError, Result};
use chimp_training::normalize_prefix;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const DATASET_ROOT: &str = "datasets";

/// Where an uploaded dataset was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetUpload {
    pub name: String,
    /// Prefix to pass as a dataset reference when submitting runs.
    pub prefix: String,
    pub files: usize,
}

/// Dataset names are plain ASCII alphanumerics.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

#[must_use]
pub fn dataset_prefix(name: &str) -> String {
    normalize_prefix(&format!("{DATASET_ROOT}/{name}"))
}

fn invalid(name: &str, reason: impl Into<String>) -> OrchestrationError {
    OrchestrationError::InvalidSubmission {
        plugin: format!("dataset '{name}'"),
        reason: reason.into(),
    }
}

/// Reads every regular file out of a `.tar.gz` archive.
///
/// Entries with absolute paths or `..` components are rejected.
pub fn unpack_archive(name: &str, bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| invalid(name, format!("not a tar.gz archive: {e}")))?;

    let mut files = Vec::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| invalid(name, format!("corrupt archive: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| invalid(name, format!("unreadable entry path: {e}")))?
            .into_owned();

        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => return Err(invalid(name, format!("unsafe entry path '{}'", path.display()))),
            }
        }
        if parts.is_empty() {
            continue;
        }

        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| invalid(name, format!("corrupt entry '{}': {e}", path.display())))?;
        files.push((parts.join("/"), contents));
    }
    Ok(files)
}

/// Unpacks `archive` into `datasets/<name>/`.
///
/// # Errors
/// `InvalidSubmission` for a bad name, an unreadable archive or an archive
/// without files; store errors otherwise.
pub async fn upload(
    artifacts: &dyn ArtifactStore,
    name: &str,
    archive: Vec<u8>,
) -> Result<DatasetUpload> {
    if !is_valid_name(name) {
        return Err(invalid(name, "dataset names must be alphanumeric"));
    }
    let owned_name = name.to_string();
    let files = tokio::task::spawn_blocking(move || unpack_archive(&owned_name, &archive))
        .await
        .map_err(|e| OrchestrationError::store(format!("archive task failed: {e}")))??;
    if files.is_empty() {
        return Err(invalid(name, "archive contains no files"));
    }

    let prefix = dataset_prefix(name);
    for (path, contents) in &files {
        let key = format!("{prefix}{path}");
        debug!(key = %key, bytes = contents.len(), "Storing dataset file");
        artifacts.put(&key, contents).await?;
    }
    info!(dataset = %name, files = files.len(), "Dataset uploaded");
    Ok(DatasetUpload { name: name.to_string(), prefix, files: files.len() })
}

/// Names of the datasets currently stored, sorted.
pub async fn list(artifacts: &dyn ArtifactStore) -> Result<Vec<String>> {
    let root = normalize_prefix(DATASET_ROOT);
    let names: BTreeSet<String> = artifacts
        .list(&root)
        .await?
        .iter()
        .filter_map(|key| key.strip_prefix(&root))
        .filter_map(|rest| rest.split_once('/').map(|(name, _)| name.to_string()))
        .collect();
    Ok(names.into_iter().collect())
}

#[cfg(test)]
pub(crate) fn build_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chimp_orchestrator::store::InMemoryArtifactStore;

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("emotions2024"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("../etc"));
        assert!(!is_valid_name("my-data"));
    }

    #[tokio::test]
    async fn test_upload_and_list() {
        let store = InMemoryArtifactStore::new();
        let archive = build_archive(&[("train/happy/a.png", b"a"), ("./train/sad/b.png", b"b")]);

        let upload = upload(&store, "emotions", archive).await.unwrap();
        assert_eq!(upload.prefix, "datasets/emotions/");
        assert_eq!(upload.files, 2);
        assert_eq!(store.get("datasets/emotions/train/sad/b.png").await.unwrap(), b"b");
        assert_eq!(list(&store).await.unwrap(), vec!["emotions"]);
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let store = InMemoryArtifactStore::new();
        assert!(matches!(
            upload(&store, "bad name", build_archive(&[("a", b"a")])).await,
            Err(OrchestrationError::InvalidSubmission { .. })
        ));
        assert!(matches!(
            upload(&store, "junk", b"not an archive".to_vec()).await,
            Err(OrchestrationError::InvalidSubmission { .. })
        ));
        assert!(store.is_empty());
    }
}
