//! Download pipeline for one remote file.
//!
//! Skip check, plan, fetch chunk artifacts, collect, reassemble, then clean
//! up the artifacts. Files no larger than one chunk are fetched in a single
//! request straight to their destination.
use std::sync::Arc;

use tracing::{debug, info};

use crate::collector;
use crate::error::TransferError;
use crate::finalize::{CleanupSink, reassemble, remove_artifacts};
use crate::observer::{ProgressObserver, ProgressSurface};
use crate::plan::plan;
use crate::skip::{SkipDecision, check_local, partition_download_chunks};
use crate::state::{
    Direction, DownloadSpec, FileOutcome, LogicalFile, SessionToken, artifact_plan_path,
};
use crate::worker::WorkerPool;

/// Brings `spec.local_path` to the remote content.
///
/// `pool` should be scoped to this file (see [`WorkerPool::child`]) so a
/// failing chunk only stops its own siblings.
pub async fn download_file(
    pool: &WorkerPool,
    spec: &DownloadSpec,
    chunk_size: u64,
    progress: &dyn ProgressSurface,
    cleanup: &CleanupSink,
) -> Result<FileOutcome, TransferError> {
    if check_local(&spec.local_path, spec.size).await? == SkipDecision::AlreadySatisfied {
        info!(path = %spec.local_path.display(), "already downloaded, skipping");
        return Ok(FileOutcome::AlreadyPresent);
    }

    ensure_parent(&spec.local_path).await?;

    if spec.size == 0 {
        tokio::fs::File::create(&spec.local_path)
            .await
            .map_err(|e| TransferError::io(&spec.local_path, e))?;
        info!(path = %spec.local_path.display(), "created empty file");
        return Ok(FileOutcome::Transferred);
    }

    let label = spec.local_path.display().to_string();
    let bar = progress.add_bar(spec.size, &label);

    if spec.size <= chunk_size {
        download_whole(pool, spec, bar.as_ref()).await?;
    } else {
        download_chunked(pool, spec, chunk_size, bar.clone(), cleanup).await?;
    }

    info!(path = %spec.local_path.display(), size = spec.size, "download complete");
    Ok(FileOutcome::Transferred)
}

/// One request, body written directly to the destination.
async fn download_whole(
    pool: &WorkerPool,
    spec: &DownloadSpec,
    bar: &dyn ProgressObserver,
) -> Result<(), TransferError> {
    let expected = spec.size;
    let bytes = pool
        .run_network(&spec.remote_path, bar, || {
            let fetch = pool.api().fetch(&spec.link, None);
            async move {
                let bytes = fetch.await?;
                if bytes.len() as u64 != expected {
                    return Err(TransferError::Network(format!(
                        "short body: {} of {expected} bytes",
                        bytes.len()
                    )));
                }
                Ok(bytes)
            }
        })
        .await?;

    tokio::fs::write(&spec.local_path, &bytes)
        .await
        .map_err(|e| TransferError::io(&spec.local_path, e))?;
    bar.inc(expected);
    bar.finish();
    Ok(())
}

async fn download_chunked(
    pool: &WorkerPool,
    spec: &DownloadSpec,
    chunk_size: u64,
    bar: Arc<dyn ProgressObserver>,
    cleanup: &CleanupSink,
) -> Result<(), TransferError> {
    let file = Arc::new(LogicalFile {
        remote_path: spec.remote_path.clone(),
        local_path: spec.local_path.clone(),
        local_offset: 0,
        total_size: spec.size,
        chunk_size,
        chunks: plan(spec.size, chunk_size)?,
        direction: Direction::Download,
        session: SessionToken::DownloadLink(spec.link.clone()),
    });

    let (satisfied, pending) = partition_download_chunks(&file, spec.md5.as_deref()).await?;
    debug!(
        path = %file.remote_path,
        chunks = file.chunks.len(),
        reused = satisfied.len(),
        "download planned"
    );
    for result in &satisfied {
        bar.inc(file.chunks[result.index].length);
    }

    let (sink, mut collector) = collector::channel(file.chunks.len());
    collector.seed(satisfied);

    let tasks = pending
        .into_iter()
        .map(|chunk| {
            let worker = pool.clone();
            let file = file.clone();
            let bar = bar.clone();
            let sink = sink.clone();
            pool.spawn(async move { worker.download_chunk(file, chunk, bar, sink).await })
        })
        .collect();

    let results = pool.gather(sink, collector, tasks).await?;
    reassemble(&file.local_path, &results).await?;
    bar.finish();

    remove_artifacts(results, cleanup.clone())
        .await
        .map_err(|e| TransferError::TaskFailed(e.to_string()))?;

    let record = artifact_plan_path(&file.local_path);
    if let Err(e) = tokio::fs::remove_file(&record).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        cleanup.report(record, e);
    }
    Ok(())
}

async fn ensure_parent(path: &std::path::Path) -> Result<(), TransferError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::io(parent, e)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CreatedObject, DownloadLink, PanApi, RemoteEntry, UploadSession};
    use crate::config::RetryPolicy;
    use crate::observer::HiddenProgress;
    use crate::plan::ChunkDescriptor;
    use crate::state::ArtifactPlan;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    /// Serves slices of a fixed body.
    struct Body {
        data: Vec<u8>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl PanApi for Body {
        async fn list_recursive(&self, _: &str) -> Result<Vec<RemoteEntry>, TransferError> {
            Ok(vec![])
        }
        async fn list_dir(&self, _: &str) -> Result<Vec<RemoteEntry>, TransferError> {
            Ok(vec![])
        }
        async fn download_links(&self, _: &[u64]) -> Result<Vec<DownloadLink>, TransferError> {
            Ok(vec![])
        }
        async fn precreate(
            &self,
            _: &str,
            _: u64,
            _: &[String],
        ) -> Result<UploadSession, TransferError> {
            Err(TransferError::Precondition("unused".into()))
        }
        async fn upload_part(
            &self,
            _: &str,
            _: &str,
            _: usize,
            _: Bytes,
        ) -> Result<String, TransferError> {
            Err(TransferError::Precondition("unused".into()))
        }
        async fn create(
            &self,
            _: &str,
            _: u64,
            _: &[String],
            _: &str,
        ) -> Result<CreatedObject, TransferError> {
            Err(TransferError::Precondition("unused".into()))
        }
        async fn fetch(
            &self,
            _: &str,
            range: Option<ChunkDescriptor>,
        ) -> Result<Bytes, TransferError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let slice = match range {
                Some(c) => &self.data[c.offset as usize..=c.end_inclusive() as usize],
                None => &self.data[..],
            };
            Ok(Bytes::copy_from_slice(slice))
        }
    }

    fn setup(data: &[u8]) -> (Arc<Body>, WorkerPool) {
        let api = Arc::new(Body {
            data: data.to_vec(),
            fetches: AtomicUsize::new(0),
        });
        let pool = WorkerPool::new(
            api.clone(),
            2,
            RetryPolicy {
                max_attempts: Some(2),
                delay: Duration::ZERO,
            },
            Duration::ZERO,
            CancellationToken::new(),
        );
        (api, pool)
    }

    fn spec(dir: &std::path::Path, size: u64) -> DownloadSpec {
        DownloadSpec {
            remote_path: "/apps/t/data.bin".into(),
            local_path: dir.join("nested").join("data.bin"),
            size,
            link: "http://dl/data.bin".into(),
            md5: None,
        }
    }

    #[tokio::test]
    async fn test_chunked_download_reassembles_and_cleans_up() {
        let data: Vec<u8> = (0..10u8).collect();
        let (api, pool) = setup(&data);
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), 10);
        let (cleanup, drain) = CleanupSink::spawn();

        let outcome = download_file(&pool, &spec, 4, &HiddenProgress, &cleanup)
            .await
            .unwrap();
        drop(cleanup);

        assert_eq!(outcome, FileOutcome::Transferred);
        assert_eq!(std::fs::read(&spec.local_path).unwrap(), data);
        assert_eq!(api.fetches.load(Ordering::SeqCst), 3);
        for i in 0..3 {
            assert!(!crate::state::chunk_artifact_path(&spec.local_path, i).exists());
        }
        assert!(drain.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_chunk_artifact_is_reused() {
        let data: Vec<u8> = (0..10u8).collect();
        let (api, pool) = setup(&data);
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), 10);
        std::fs::create_dir_all(spec.local_path.parent().unwrap()).unwrap();
        ArtifactPlan {
            total_size: 10,
            chunk_size: 4,
            md5: None,
        }
        .save(&spec.local_path)
        .await
        .unwrap();
        std::fs::write(
            crate::state::chunk_artifact_path(&spec.local_path, 1),
            &data[4..8],
        )
        .unwrap();
        let (cleanup, _drain) = CleanupSink::spawn();

        download_file(&pool, &spec, 4, &HiddenProgress, &cleanup)
            .await
            .unwrap();
        assert_eq!(api.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read(&spec.local_path).unwrap(), data);
        assert!(!artifact_plan_path(&spec.local_path).exists());
    }

    #[tokio::test]
    async fn test_artifact_from_other_chunk_size_is_not_spliced_in() {
        let data: Vec<u8> = (0..10u8).collect();
        let (api, pool) = setup(&data);
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), 10);
        std::fs::create_dir_all(spec.local_path.parent().unwrap()).unwrap();
        // Left by an earlier run with 4-byte chunks: chunk 2 held bytes 8..10.
        ArtifactPlan {
            total_size: 10,
            chunk_size: 4,
            md5: None,
        }
        .save(&spec.local_path)
        .await
        .unwrap();
        std::fs::write(
            crate::state::chunk_artifact_path(&spec.local_path, 2),
            &data[8..10],
        )
        .unwrap();
        let (cleanup, _drain) = CleanupSink::spawn();

        download_file(&pool, &spec, 2, &HiddenProgress, &cleanup)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&spec.local_path).unwrap(), data);
        assert_eq!(api.fetches.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_artifact_of_changed_remote_content_is_refetched() {
        let data: Vec<u8> = (0..10u8).collect();
        let (api, pool) = setup(&data);
        let dir = tempdir().unwrap();
        let mut spec = spec(dir.path(), 10);
        spec.md5 = Some("new-content".into());
        std::fs::create_dir_all(spec.local_path.parent().unwrap()).unwrap();
        ArtifactPlan {
            total_size: 10,
            chunk_size: 4,
            md5: Some("old-content".into()),
        }
        .save(&spec.local_path)
        .await
        .unwrap();
        std::fs::write(
            crate::state::chunk_artifact_path(&spec.local_path, 0),
            b"zzzz",
        )
        .unwrap();
        let (cleanup, _drain) = CleanupSink::spawn();

        download_file(&pool, &spec, 4, &HiddenProgress, &cleanup)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&spec.local_path).unwrap(), data);
        assert_eq!(api.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_complete_file_is_skipped() {
        let data = b"already here".to_vec();
        let (api, pool) = setup(&data);
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), data.len() as u64);
        std::fs::create_dir_all(spec.local_path.parent().unwrap()).unwrap();
        std::fs::write(&spec.local_path, &data).unwrap();
        let (cleanup, _drain) = CleanupSink::spawn();

        let outcome = download_file(&pool, &spec, 4, &HiddenProgress, &cleanup)
            .await
            .unwrap();
        assert_eq!(outcome, FileOutcome::AlreadyPresent);
        assert_eq!(api.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_small_file_single_request() {
        let data = b"tiny".to_vec();
        let (api, pool) = setup(&data);
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), 4);
        let (cleanup, _drain) = CleanupSink::spawn();

        download_file(&pool, &spec, 1024, &HiddenProgress, &cleanup)
            .await
            .unwrap();
        assert_eq!(api.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&spec.local_path).unwrap(), data);
        assert!(!crate::state::chunk_artifact_path(&spec.local_path, 0).exists());
    }

    #[tokio::test]
    async fn test_short_body_is_retried_then_fails() {
        let (api, pool) = setup(b"abc");
        let dir = tempdir().unwrap();
        // Provider claims 5 bytes but only 3 arrive.
        let spec = spec(dir.path(), 5);
        let (cleanup, _drain) = CleanupSink::spawn();

        let err = download_file(&pool, &spec, 1024, &HiddenProgress, &cleanup)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Network(_)));
        assert_eq!(api.fetches.load(Ordering::SeqCst), 2);
        assert!(!spec.local_path.exists());
    }

    #[tokio::test]
    async fn test_zero_byte_file_needs_no_network() {
        let (api, pool) = setup(b"");
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), 0);
        let (cleanup, _drain) = CleanupSink::spawn();

        download_file(&pool, &spec, 4, &HiddenProgress, &cleanup)
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(&spec.local_path).unwrap().len(), 0);
        assert_eq!(api.fetches.load(Ordering::SeqCst), 0);
    }
}
