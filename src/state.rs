//! Per-file and per-batch transfer state.
//!
//! A [`LogicalFile`] lives from the moment the orchestrator starts working on
//! one file until its finalizer succeeds. Chunk results move from a worker to
//! the file's collector by value and are never shared.
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::plan::ChunkDescriptor;

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Identity token that ties the chunks of one file to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionToken {
    /// Signed direct link, credential already appended.
    DownloadLink(String),
    /// Upload session id returned by precreate.
    UploadId(String),
}

/// One file transferred end-to-end.
#[derive(Debug, Clone)]
pub struct LogicalFile {
    pub remote_path: String,
    pub local_path: PathBuf,
    /// Byte offset of this object inside `local_path`. Non-zero only for the
    /// second and later parts of a split upload.
    pub local_offset: u64,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkDescriptor>,
    pub direction: Direction,
    pub session: SessionToken,
}

impl LogicalFile {
    /// Short name shown next to the progress bar.
    pub fn label(&self) -> String {
        match self.direction {
            Direction::Upload => self.remote_path.clone(),
            Direction::Download => self.local_path.display().to_string(),
        }
    }

    /// Path of the on-disk artifact for chunk `index` of a download.
    pub fn chunk_artifact_path(&self, index: usize) -> PathBuf {
        chunk_artifact_path(&self.local_path, index)
    }
}

/// `<final path>_<index>`, a sibling of the reassembled file.
pub fn chunk_artifact_path(final_path: &Path, index: usize) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(format!("_{index}"));
    PathBuf::from(name)
}

/// `<final path>.parts.json`, recording which plan produced the artifacts.
pub fn artifact_plan_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".parts.json");
    PathBuf::from(name)
}

/// The plan a download's chunk artifacts were cut from.
///
/// Stored next to the artifacts as JSON. Artifacts left by a run with a
/// different chunk size or different remote content must not be reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    /// Content md5 reported by the listing, lowercase.
    #[serde(default)]
    pub md5: Option<String>,
}

impl ArtifactPlan {
    pub fn for_file(file: &LogicalFile, md5: Option<&str>) -> Self {
        Self {
            total_size: file.total_size,
            chunk_size: file.chunk_size,
            md5: md5.map(str::to_ascii_lowercase),
        }
    }

    /// Reads the plan stored for `final_path`. A missing or unreadable
    /// record yields `None`.
    pub async fn load(final_path: &Path) -> Result<Option<Self>, TransferError> {
        let path = artifact_plan_path(final_path);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransferError::io(&path, e)),
        }
    }

    pub async fn save(&self, final_path: &Path) -> Result<(), TransferError> {
        let path = artifact_plan_path(final_path);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TransferError::io(&path, e.into()))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| TransferError::io(&path, e))
    }
}

/// Where the bytes of a finished chunk are held.
#[derive(Debug, Clone)]
pub enum ChunkArtifact {
    /// Chunk file on disk (downloads).
    File(PathBuf),
    /// Payload kept in memory.
    Memory(Bytes),
    /// Nothing to hand over beyond the fingerprint (uploads).
    None,
}

/// Output of one completed chunk operation.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub index: usize,
    pub artifact: ChunkArtifact,
    /// Lowercase hex md5 for uploads.
    pub fingerprint: Option<String>,
}

/// A remote file to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub size: u64,
    /// Direct link with the access token already appended.
    pub link: String,
    pub md5: Option<String>,
}

/// A local file to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSpec {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
}

/// One unit of a batch.
#[derive(Debug, Clone)]
pub enum TransferJob {
    Download(DownloadSpec),
    Upload(UploadSpec),
}

/// Every file submitted by one invocation.
#[derive(Debug, Clone, Default)]
pub struct TransferBatch {
    pub jobs: Vec<TransferJob>,
}

impl TransferBatch {
    pub fn downloads(specs: impl IntoIterator<Item = DownloadSpec>) -> Self {
        Self {
            jobs: specs.into_iter().map(TransferJob::Download).collect(),
        }
    }

    pub fn uploads(specs: impl IntoIterator<Item = UploadSpec>) -> Self {
        Self {
            jobs: specs.into_iter().map(TransferJob::Upload).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// How a file left the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Bytes were moved and the file was finalized.
    Transferred,
    /// Nothing to do: local file already complete, or the provider already
    /// holds identical content.
    AlreadyPresent,
}

/// Successful batch summary.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(String, FileOutcome)>,
}

impl BatchReport {
    pub fn count(&self, outcome: FileOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_artifact_path_is_sibling() {
        let p = chunk_artifact_path(Path::new("./dir/movie.mkv"), 2);
        assert_eq!(p, PathBuf::from("./dir/movie.mkv_2"));
    }

    #[tokio::test]
    async fn test_artifact_plan_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("movie.mkv");
        assert_eq!(ArtifactPlan::load(&target).await.unwrap(), None);

        let plan = ArtifactPlan {
            total_size: 10,
            chunk_size: 4,
            md5: Some("abc".into()),
        };
        plan.save(&target).await.unwrap();
        assert!(dir.path().join("movie.mkv.parts.json").exists());
        assert_eq!(ArtifactPlan::load(&target).await.unwrap(), Some(plan));
    }

    #[tokio::test]
    async fn test_corrupt_artifact_plan_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("x.bin");
        std::fs::write(artifact_plan_path(&target), b"{not json").unwrap();
        assert_eq!(ArtifactPlan::load(&target).await.unwrap(), None);
    }

    #[test]
    fn test_batch_report_counts() {
        let report = BatchReport {
            outcomes: vec![
                ("a".into(), FileOutcome::Transferred),
                ("b".into(), FileOutcome::AlreadyPresent),
                ("c".into(), FileOutcome::Transferred),
            ],
        };
        assert_eq!(report.count(FileOutcome::Transferred), 2);
        assert_eq!(report.count(FileOutcome::AlreadyPresent), 1);
    }
}
