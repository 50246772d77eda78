//! Batch driver.
//!
//! Runs every file's pipeline concurrently over one worker pool and one
//! progress surface. The first batch-fatal file error cancels the batch;
//! files stopped that way are reported as aborted, not failed.
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api::PanApi;
use crate::config::EngineConfig;
use crate::downloader::download_file;
use crate::error::{BatchError, FileFailure, TransferError};
use crate::finalize::CleanupSink;
use crate::observer::{HiddenProgress, ProgressSurface};
use crate::state::{BatchReport, DownloadSpec, FileOutcome, TransferBatch, TransferJob, UploadSpec};
use crate::uploader::{UploadObject, upload_object};
use crate::worker::WorkerPool;

/// One pipeline run: a download, or one provider object of an upload.
enum Unit {
    Download(DownloadSpec),
    Upload(UploadObject),
}

impl Unit {
    fn name(&self) -> &str {
        match self {
            Unit::Download(spec) => &spec.remote_path,
            Unit::Upload(object) => &object.remote_path,
        }
    }
}

/// Splits an upload into provider objects no larger than `max_object_size`.
///
/// Parts are named `<remote>.part1`, `<remote>.part2`, ... When `split` is
/// off an oversized file is a precondition failure.
pub fn split_upload(
    spec: &UploadSpec,
    max_object_size: u64,
    split: bool,
) -> Result<Vec<UploadObject>, TransferError> {
    if spec.size <= max_object_size {
        return Ok(vec![UploadObject {
            local_path: spec.local_path.clone(),
            local_offset: 0,
            size: spec.size,
            remote_path: spec.remote_path.clone(),
        }]);
    }
    if !split || max_object_size == 0 {
        return Err(TransferError::Precondition(format!(
            "{} is {} bytes, above the {max_object_size} byte object limit",
            spec.local_path.display(),
            spec.size
        )));
    }

    let parts = spec.size.div_ceil(max_object_size);
    Ok((0..parts)
        .map(|i| {
            let offset = i * max_object_size;
            UploadObject {
                local_path: spec.local_path.clone(),
                local_offset: offset,
                size: max_object_size.min(spec.size - offset),
                remote_path: format!("{}.part{}", spec.remote_path, i + 1),
            }
        })
        .collect())
}

/// Runs transfer batches against one provider.
pub struct TransferEngine {
    api: Arc<dyn PanApi>,
    config: EngineConfig,
    progress: Arc<dyn ProgressSurface>,
    cancel: CancellationToken,
}

impl TransferEngine {
    pub fn new(api: Arc<dyn PanApi>, config: EngineConfig) -> Self {
        Self {
            api,
            config,
            progress: Arc::new(HiddenProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSurface>) -> Self {
        self.progress = progress;
        self
    }

    /// Batches run under a child of `cancel`; cancelling it aborts them.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Transfers every file of `batch` and waits for all of them.
    pub async fn run(&self, batch: TransferBatch) -> Result<BatchReport, BatchError> {
        let batch_cancel = self.cancel.child_token();
        let pool = WorkerPool::new(
            self.api.clone(),
            self.config.concurrency,
            self.config.retry,
            self.config.request_pacing,
            batch_cancel.clone(),
        );
        let (cleanup, drain) = CleanupSink::spawn();

        let mut failures = Vec::new();
        let mut units = Vec::new();
        for job in batch.jobs {
            match job {
                TransferJob::Download(spec) => units.push(Unit::Download(spec)),
                TransferJob::Upload(spec) => match split_upload(
                    &spec,
                    self.config.max_object_size,
                    self.config.split_oversized,
                ) {
                    Ok(objects) => {
                        if objects.len() > 1 {
                            info!(path = %spec.remote_path, parts = objects.len(), "splitting oversized upload");
                        }
                        units.extend(objects.into_iter().map(Unit::Upload));
                    }
                    Err(error) => failures.push(FileFailure {
                        path: spec.remote_path,
                        error,
                    }),
                },
            }
        }
        debug!(files = units.len(), concurrency = self.config.concurrency, "batch started");

        let results: Vec<(String, Result<FileOutcome, TransferError>)> = stream::iter(units)
            .map(|unit| {
                let pool = pool.child();
                let batch_cancel = &batch_cancel;
                let cleanup = &cleanup;
                async move {
                    let result = self.run_unit(&pool, &unit, cleanup).await;
                    if let Err(e) = &result
                        && e.is_batch_fatal()
                    {
                        error!(path = %unit.name(), error = %e, "file failed, aborting batch");
                        batch_cancel.cancel();
                    }
                    (unit.name().to_string(), result)
                }
            })
            .buffer_unordered(self.config.concurrent_files.max(1))
            .collect()
            .await;

        drop(cleanup);
        if let Ok(leftovers) = drain.await
            && !leftovers.is_empty()
        {
            debug!(count = leftovers.len(), "chunk artifacts left behind");
        }

        let mut report = BatchReport::default();
        let mut aborted = Vec::new();
        for (path, result) in results {
            match result {
                Ok(outcome) => report.outcomes.push((path, outcome)),
                Err(TransferError::Cancelled) => aborted.push(path),
                Err(error) => failures.push(FileFailure { path, error }),
            }
        }

        if failures.is_empty() && aborted.is_empty() {
            info!(
                transferred = report.count(FileOutcome::Transferred),
                skipped = report.count(FileOutcome::AlreadyPresent),
                "batch complete"
            );
            Ok(report)
        } else {
            Err(BatchError { failures, aborted })
        }
    }

    async fn run_unit(
        &self,
        pool: &WorkerPool,
        unit: &Unit,
        cleanup: &CleanupSink,
    ) -> Result<FileOutcome, TransferError> {
        if pool.cancel_token().is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        match unit {
            Unit::Download(spec) => {
                download_file(
                    pool,
                    spec,
                    self.config.download_chunk_size,
                    self.progress.as_ref(),
                    cleanup,
                )
                .await
            }
            Unit::Upload(object) => {
                upload_object(
                    pool,
                    object,
                    self.config.upload_chunk_size,
                    self.config.concurrency,
                    self.progress.as_ref(),
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(size: u64) -> UploadSpec {
        UploadSpec {
            local_path: PathBuf::from("/data/disk.img"),
            remote_path: "/apps/t/disk.img".into(),
            size,
        }
    }

    #[test]
    fn test_small_upload_is_one_object() {
        let objects = split_upload(&spec(10), 10, true).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].remote_path, "/apps/t/disk.img");
        assert_eq!(objects[0].size, 10);
    }

    #[test]
    fn test_oversized_upload_is_split_into_parts() {
        let objects = split_upload(&spec(25), 10, true).unwrap();
        let names: Vec<&str> = objects.iter().map(|o| o.remote_path.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "/apps/t/disk.img.part1",
                "/apps/t/disk.img.part2",
                "/apps/t/disk.img.part3"
            ]
        );
        let ranges: Vec<(u64, u64)> = objects.iter().map(|o| (o.local_offset, o.size)).collect();
        assert_eq!(ranges, vec![(0, 10), (10, 10), (20, 5)]);
    }

    #[test]
    fn test_oversized_upload_without_split_fails() {
        let err = split_upload(&spec(11), 10, false).unwrap_err();
        assert!(matches!(err, TransferError::Precondition(_)));
        assert!(!err.is_batch_fatal());
    }
}
