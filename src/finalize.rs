//! Turning a complete, ordered set of chunk results into a finished file.
//!
//! Downloads are reassembled locally and their chunk artifacts removed;
//! uploads are committed on the provider with their fingerprint manifest.
use std::path::{Path, PathBuf};

use futures_util::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::CreatedObject;
use crate::error::TransferError;
use crate::state::{ChunkArtifact, ChunkResult, LogicalFile, SessionToken};
use crate::worker::WorkerPool;

/// A chunk artifact that could not be removed.
#[derive(Debug)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub error: std::io::Error,
}

/// Non-blocking sink for cleanup failures. They are logged, never fatal.
#[derive(Clone)]
pub struct CleanupSink {
    tx: mpsc::UnboundedSender<CleanupFailure>,
}

impl CleanupSink {
    /// Starts the task that logs failures; it yields them all once every
    /// sink clone is dropped.
    pub fn spawn() -> (Self, JoinHandle<Vec<CleanupFailure>>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<CleanupFailure>();
        let drain = tokio::spawn(async move {
            let mut failures = Vec::new();
            while let Some(failure) = rx.recv().await {
                warn!(
                    path = %failure.path.display(),
                    error = %failure.error,
                    "could not remove chunk artifact"
                );
                failures.push(failure);
            }
            failures
        });
        (Self { tx }, drain)
    }

    pub fn report(&self, path: PathBuf, error: std::io::Error) {
        // A closed drain only means nobody is listening any more.
        let _ = self.tx.send(CleanupFailure { path, error });
    }
}

/// Appends every chunk to `target` in the given order and flushes it.
///
/// `results` must already be sorted by index. Returns the bytes written.
pub async fn reassemble(target: &Path, results: &[ChunkResult]) -> Result<u64, TransferError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::io(parent, e))?;
    }

    let mut out = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .await
        .map_err(|e| TransferError::io(target, e))?;

    let mut written = 0u64;
    for result in results {
        written += match &result.artifact {
            ChunkArtifact::File(path) => {
                let mut chunk = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| TransferError::io(path, e))?;
                tokio::io::copy(&mut chunk, &mut out)
                    .await
                    .map_err(|e| TransferError::io(target, e))?
            }
            ChunkArtifact::Memory(bytes) => {
                out.write_all(bytes)
                    .await
                    .map_err(|e| TransferError::io(target, e))?;
                bytes.len() as u64
            }
            ChunkArtifact::None => {
                return Err(TransferError::Precondition(format!(
                    "chunk {} has no payload to reassemble",
                    result.index
                )));
            }
        };
    }

    out.flush().await.map_err(|e| TransferError::io(target, e))?;
    out.sync_all()
        .await
        .map_err(|e| TransferError::io(target, e))?;
    Ok(written)
}

/// Deletes the on-disk artifacts of `results` concurrently.
///
/// Must only be called once the reassembled file is flushed. Failures go to
/// `sink`; the returned handle completes when every deletion has finished.
pub fn remove_artifacts(results: Vec<ChunkResult>, sink: CleanupSink) -> JoinHandle<()> {
    let paths: Vec<PathBuf> = results
        .into_iter()
        .filter_map(|r| match r.artifact {
            ChunkArtifact::File(path) => Some(path),
            _ => None,
        })
        .collect();

    tokio::spawn(async move {
        let deletions = paths.into_iter().map(|path| {
            let sink = sink.clone();
            async move {
                if let Err(error) = tokio::fs::remove_file(&path).await {
                    sink.report(path, error);
                }
            }
        });
        join_all(deletions).await;
    })
}

/// Ordered fingerprint manifest of an upload.
pub fn manifest(results: &[ChunkResult]) -> Result<Vec<String>, TransferError> {
    results
        .iter()
        .map(|r| {
            r.fingerprint.clone().ok_or_else(|| {
                TransferError::Precondition(format!("chunk {} has no fingerprint", r.index))
            })
        })
        .collect()
}

/// Commits an upload. Failure leaves the uploaded parts orphaned.
pub async fn commit(
    pool: &WorkerPool,
    file: &LogicalFile,
    results: &[ChunkResult],
) -> Result<CreatedObject, TransferError> {
    let SessionToken::UploadId(upload_id) = &file.session else {
        return Err(TransferError::Precondition(format!(
            "{} has no upload session",
            file.remote_path
        )));
    };
    let block_list = manifest(results)?;

    let created = pool
        .run_once(|| {
            pool.api()
                .create(&file.remote_path, file.total_size, &block_list, upload_id)
        })
        .await?;
    info!(path = %created.path, size = file.total_size, "upload committed");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn file_result(index: usize, path: PathBuf) -> ChunkResult {
        ChunkResult {
            index,
            artifact: ChunkArtifact::File(path),
            fingerprint: None,
        }
    }

    #[tokio::test]
    async fn test_reassemble_in_index_order() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out").join("hello.txt");
        let parts = ["Hel", "lo ", "World"];
        let mut results = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let path = dir.path().join(format!("hello.txt_{i}"));
            std::fs::write(&path, part).unwrap();
            results.push(file_result(i, path));
        }

        let written = reassemble(&target, &results).await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "Hello World");
    }

    #[tokio::test]
    async fn test_reassemble_memory_artifacts() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("mem.bin");
        let results = vec![
            ChunkResult {
                index: 0,
                artifact: ChunkArtifact::Memory(Bytes::from_static(b"ab")),
                fingerprint: None,
            },
            ChunkResult {
                index: 1,
                artifact: ChunkArtifact::Memory(Bytes::from_static(b"cd")),
                fingerprint: None,
            },
        ];
        reassemble(&target, &results).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"abcd");
    }

    fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut all = Vec::new();
        for (i, first) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, *first);
                all.push(tail);
            }
        }
        all
    }

    #[tokio::test]
    async fn test_every_arrival_order_reassembles_the_same_bytes() {
        let dir = tempdir().unwrap();
        let parts: [&[u8]; 4] = [b"alpha-", b"beta-", b"gamma-", b"delta"];
        for (i, part) in parts.iter().enumerate() {
            std::fs::write(dir.path().join(format!("src_{i}")), part).unwrap();
        }

        let orders = permutations(&[0, 1, 2, 3]);
        assert_eq!(orders.len(), 24);
        for (n, order) in orders.iter().enumerate() {
            let (sink, collector) = crate::collector::channel(parts.len());
            for &i in order {
                sink.deliver(file_result(i, dir.path().join(format!("src_{i}"))))
                    .unwrap();
            }
            drop(sink);

            let results = collector
                .collect(&tokio_util::sync::CancellationToken::new())
                .await
                .unwrap();
            let target = dir.path().join(format!("out_{n}"));
            reassemble(&target, &results).await.unwrap();
            assert_eq!(
                std::fs::read(&target).unwrap(),
                b"alpha-beta-gamma-delta",
                "arrival order {order:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_artifact_is_io_error() {
        let dir = tempdir().unwrap();
        let results = vec![file_result(0, dir.path().join("gone_0"))];
        let err = reassemble(&dir.path().join("gone"), &results)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io { .. }));
    }

    #[tokio::test]
    async fn test_remove_artifacts_reports_failures() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("a_0");
        std::fs::write(&present, b"x").unwrap();
        let results = vec![
            file_result(0, present.clone()),
            file_result(1, dir.path().join("a_1")),
        ];

        let (sink, drain) = CleanupSink::spawn();
        remove_artifacts(results, sink).await.unwrap();
        let failures = drain.await.unwrap();

        assert!(!present.exists());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, dir.path().join("a_1"));
    }

    #[test]
    fn test_manifest_requires_fingerprints() {
        let ok = vec![
            ChunkResult {
                index: 0,
                artifact: ChunkArtifact::None,
                fingerprint: Some("aa".into()),
            },
            ChunkResult {
                index: 1,
                artifact: ChunkArtifact::None,
                fingerprint: Some("bb".into()),
            },
        ];
        assert_eq!(manifest(&ok).unwrap(), vec!["aa", "bb"]);

        let missing = vec![ChunkResult {
            index: 0,
            artifact: ChunkArtifact::None,
            fingerprint: None,
        }];
        assert!(manifest(&missing).is_err());
    }
}
