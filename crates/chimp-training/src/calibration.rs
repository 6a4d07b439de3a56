use crate::error::{TrainingError, TrainingResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;

/// Emotion labels used when neither the plugin nor the configuration declares any.
pub const DEFAULT_CATEGORIES: [&str; 7] =
    ["angry", "disgust", "fear", "happy", "neutral", "sad", "surprise"];

const MANIFEST_NAME: &str = "manifest.json";

/// One labelled clip or frame recorded by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub label: String,
    #[serde(skip)]
    pub blob: Vec<u8>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ManifestEntry {
    label: String,
    timestamp: String,
    file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ArchiveManifest {
    user_id: String,
    samples: Vec<ManifestEntry>,
}

/// The fixed label set a calibration session is validated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySet(Vec<String>);

impl CategorySet {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(|l| l.into().trim().to_ascii_lowercase()).collect())
    }

    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        let label = label.trim().to_ascii_lowercase();
        self.0.iter().any(|c| *c == label)
    }

    pub fn validate(&self, label: &str) -> TrainingResult<()> {
        if self.contains(label) {
            Ok(())
        } else {
            Err(TrainingError::InvalidLabel { label: label.to_string(), expected: self.0.clone() })
        }
    }

    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.0
    }
}

impl Default for CategorySet {
    fn default() -> Self {
        Self::new(DEFAULT_CATEGORIES)
    }
}

/// Make a client timestamp safe for use in a file name.
#[must_use]
pub fn sanitize_timestamp(timestamp: &str) -> String {
    timestamp.replace('T', "_").replace([':', '.'], "-").replace('/', "-")
}

/// Pack samples into a gzip-compressed tar with an ordered manifest.
pub fn write_archive(user_id: &str, samples: &[CalibrationSample]) -> TrainingResult<Vec<u8>> {
    let mut entries = Vec::with_capacity(samples.len());
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

    for (idx, sample) in samples.iter().enumerate() {
        let file = format!(
            "{}/{idx:04}_{}.webm",
            sample.label.trim().to_ascii_lowercase(),
            sanitize_timestamp(&sample.timestamp)
        );
        append(&mut builder, &file, &sample.blob)?;
        entries.push(ManifestEntry {
            label: sample.label.clone(),
            timestamp: sample.timestamp.clone(),
            file,
        });
    }

    let manifest = ArchiveManifest { user_id: user_id.to_string(), samples: entries };
    append(&mut builder, MANIFEST_NAME, &serde_json::to_vec_pretty(&manifest)?)?;

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Unpack an archive written by [`write_archive`], preserving sample order.
pub fn read_archive(bytes: &[u8]) -> TrainingResult<(String, Vec<CalibrationSample>)> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.insert(path, data);
    }

    let manifest_bytes = files
        .remove(MANIFEST_NAME)
        .ok_or_else(|| TrainingError::Archive("archive has no manifest.json".to_string()))?;
    let manifest: ArchiveManifest = serde_json::from_slice(&manifest_bytes)?;

    let mut samples = Vec::with_capacity(manifest.samples.len());
    for entry in manifest.samples {
        let blob = files
            .remove(&entry.file)
            .ok_or_else(|| TrainingError::Archive(format!("archive is missing '{}'", entry.file)))?;
        samples.push(CalibrationSample { label: entry.label, blob, timestamp: entry.timestamp });
    }
    Ok((manifest.user_id, samples))
}

fn append<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> TrainingResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data)?;
    Ok(())
}
