//! Chunk workers.
//!
//! Every network operation of a batch goes through one [`WorkerPool`]: a
//! permit from the shared semaphore is held only while the request is in
//! flight, never while chunk bytes are read from or written to disk.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::PanApi;
use crate::collector::{ChunkSink, Collector};
use crate::config::RetryPolicy;
use crate::error::TransferError;
use crate::observer::ProgressObserver;
use crate::plan::ChunkDescriptor;
use crate::state::{ChunkArtifact, ChunkResult, LogicalFile, SessionToken};
use crate::utils::{md5_hex, read_range};

/// Upper bound of the random jitter added to request pacing.
const PACING_JITTER_MS: u64 = 100;

/// Runs chunk operations under the batch's concurrency budget.
#[derive(Clone)]
pub struct WorkerPool {
    api: Arc<dyn PanApi>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    retry: RetryPolicy,
    pacing: Duration,
}

impl WorkerPool {
    pub fn new(
        api: Arc<dyn PanApi>,
        concurrency: usize,
        retry: RetryPolicy,
        pacing: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            cancel,
            retry,
            pacing,
        }
    }

    /// Same budget, with a cancellation token scoped below this pool's.
    ///
    /// Cancelling the child stops only its workers; cancelling the parent
    /// stops everyone.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn api(&self) -> &Arc<dyn PanApi> {
        &self.api
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Permits currently free in the shared budget.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, TransferError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| TransferError::Cancelled)
            }
        }
    }

    /// Sleeps for `delay` unless the pool is cancelled first.
    pub async fn pause(&self, delay: Duration) -> Result<(), TransferError> {
        if delay.is_zero() {
            return if self.cancel.is_cancelled() {
                Err(TransferError::Cancelled)
            } else {
                Ok(())
            };
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn pace(&self) -> Result<(), TransferError> {
        if self.pacing.is_zero() {
            return self.pause(Duration::ZERO).await;
        }
        let jitter = rand::thread_rng().gen_range(0..=PACING_JITTER_MS);
        self.pause(self.pacing + Duration::from_millis(jitter)).await
    }

    /// Runs one network operation until it succeeds.
    ///
    /// Each attempt holds a permit only for its own duration. Retryable
    /// failures are absorbed; anything else, an exhausted retry policy, or
    /// cancellation ends the loop.
    pub async fn run_network<T, F, Fut>(
        &self,
        what: &str,
        observer: &dyn ProgressObserver,
        mut op: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let result = {
                let _permit = self.acquire().await?;
                self.pace().await?;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
                    result = op() => result,
                }
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && self.retry.allows(attempt) => {
                    warn!(what, attempt, error = %e, "retrying");
                    observer.message(format!("retry #{attempt}: {e}"));
                    self.pause(self.retry.delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs a single network operation under a permit, without retrying.
    pub async fn run_once<T, F, Fut>(&self, op: F) -> Result<T, TransferError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let _permit = self.acquire().await?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            result = op() => result,
        }
    }

    /// Fetches one byte range, stores it as a chunk artifact and hands it on.
    pub async fn download_chunk(
        &self,
        file: Arc<LogicalFile>,
        chunk: ChunkDescriptor,
        observer: Arc<dyn ProgressObserver>,
        sink: ChunkSink,
    ) -> Result<(), TransferError> {
        let SessionToken::DownloadLink(link) = &file.session else {
            return Err(TransferError::Precondition(format!(
                "{} has no download link",
                file.remote_path
            )));
        };

        let what = format!("{} chunk {}", file.remote_path, chunk.index);
        let bytes = self
            .run_network(&what, observer.as_ref(), || {
                self.api.fetch(link, Some(chunk))
            })
            .await?;

        let artifact = file.chunk_artifact_path(chunk.index);
        if let Some(parent) = artifact.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }
        tokio::fs::write(&artifact, &bytes)
            .await
            .map_err(|e| TransferError::io(&artifact, e))?;

        sink.deliver(ChunkResult {
            index: chunk.index,
            artifact: ChunkArtifact::File(artifact),
            fingerprint: None,
        })?;
        observer.inc(chunk.length);
        Ok(())
    }

    /// Reads one chunk of a local file and uploads it as part `chunk.index`.
    ///
    /// `staging` bounds how many chunk payloads of this file sit in memory.
    /// Bytes that no longer match `expected_md5` mean the local file changed
    /// after fingerprinting, which fails the file. An acknowledgement that
    /// does not match is treated as a transient failure and the part is sent
    /// again.
    pub async fn upload_chunk(
        &self,
        file: Arc<LogicalFile>,
        chunk: ChunkDescriptor,
        expected_md5: String,
        staging: Arc<Semaphore>,
        observer: Arc<dyn ProgressObserver>,
        sink: ChunkSink,
    ) -> Result<(), TransferError> {
        let SessionToken::UploadId(upload_id) = &file.session else {
            return Err(TransferError::Precondition(format!(
                "{} has no upload session",
                file.remote_path
            )));
        };

        let _staged = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            permit = staging.acquire_owned() => permit.map_err(|_| TransferError::Cancelled)?,
        };

        let data = read_range(
            &file.local_path,
            file.local_offset + chunk.offset,
            chunk.length,
        )
        .await?;
        if !md5_hex(&data).eq_ignore_ascii_case(&expected_md5) {
            return Err(TransferError::Precondition(format!(
                "{} changed during upload (part {})",
                file.local_path.display(),
                chunk.index
            )));
        }

        let what = format!("{} part {}", file.remote_path, chunk.index);
        let md5 = self
            .run_network(&what, observer.as_ref(), || {
                let data = data.clone();
                let expected = expected_md5.as_str();
                let remote = file.remote_path.as_str();
                async move {
                    let acked = self
                        .api
                        .upload_part(remote, upload_id, chunk.index, data)
                        .await?;
                    if acked.eq_ignore_ascii_case(expected) {
                        Ok(acked.to_ascii_lowercase())
                    } else {
                        Err(TransferError::Network(format!(
                            "part {} acknowledged with md5 {acked}, expected {expected}",
                            chunk.index
                        )))
                    }
                }
            })
            .await?;

        sink.deliver(ChunkResult {
            index: chunk.index,
            artifact: ChunkArtifact::None,
            fingerprint: Some(md5),
        })?;
        observer.inc(chunk.length);
        Ok(())
    }

    /// Spawns one chunk task. A failure other than cancellation cancels this
    /// pool's token so the task's siblings stop early.
    pub fn spawn<Fut>(&self, task: Fut) -> JoinHandle<Result<(), TransferError>>
    where
        Fut: Future<Output = Result<(), TransferError>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let result = task.await;
            if let Err(e) = &result
                && !matches!(e, TransferError::Cancelled)
            {
                cancel.cancel();
            }
            result
        })
    }

    /// Drops the caller's sink, waits for the collector and then for every
    /// task. A worker's own error is reported ahead of the cancellation it
    /// caused.
    pub async fn gather(
        &self,
        sink: ChunkSink,
        collector: Collector,
        tasks: Vec<JoinHandle<Result<(), TransferError>>>,
    ) -> Result<Vec<ChunkResult>, TransferError> {
        drop(sink);
        let collected = collector.collect(&self.cancel).await;

        let mut failure: Option<TransferError> = None;
        for task in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(TransferError::TaskFailed(e.to_string())),
            };
            if let Err(e) = outcome {
                let replace = match &failure {
                    None => true,
                    Some(TransferError::Cancelled) => !matches!(e, TransferError::Cancelled),
                    Some(_) => false,
                };
                if replace {
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => collected,
        }
    }
}

/// Fingerprints every chunk of a local file, in index order.
pub async fn fingerprint_chunks(file: &LogicalFile) -> Result<Vec<String>, TransferError> {
    let mut manifest = Vec::with_capacity(file.chunks.len());
    for chunk in &file.chunks {
        let data = read_range(
            &file.local_path,
            file.local_offset + chunk.offset,
            chunk.length,
        )
        .await?;
        manifest.push(md5_hex(&data));
    }
    Ok(manifest)
}
