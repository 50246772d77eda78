//! Upload pipeline for one remote object.
//!
//! Fingerprint every part, open a session, send the parts the provider still
//! needs, collect their acknowledgements and commit the manifest.
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::collector;
use crate::error::TransferError;
use crate::finalize::commit;
use crate::observer::ProgressSurface;
use crate::plan::{ChunkDescriptor, plan};
use crate::skip::upload_part_needed;
use crate::state::{
    ChunkArtifact, ChunkResult, Direction, FileOutcome, LogicalFile, SessionToken,
};
use crate::worker::{WorkerPool, fingerprint_chunks};

/// One remote object built from a byte range of a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadObject {
    pub local_path: PathBuf,
    /// Where the object starts inside `local_path`.
    pub local_offset: u64,
    pub size: u64,
    pub remote_path: String,
}

/// Uploads `object` in parts of `chunk_size` bytes.
///
/// At most `staging_limit` part payloads of this object are held in memory
/// at once. `pool` should be scoped to this object.
pub async fn upload_object(
    pool: &WorkerPool,
    object: &UploadObject,
    chunk_size: u64,
    staging_limit: usize,
    progress: &dyn ProgressSurface,
) -> Result<FileOutcome, TransferError> {
    let mut chunks = plan(object.size, chunk_size)?;
    if chunks.is_empty() {
        // The provider still wants one (empty) part for an empty file.
        chunks.push(ChunkDescriptor {
            index: 0,
            offset: 0,
            length: 0,
        });
    }

    let mut file = LogicalFile {
        remote_path: object.remote_path.clone(),
        local_path: object.local_path.clone(),
        local_offset: object.local_offset,
        total_size: object.size,
        chunk_size,
        chunks,
        direction: Direction::Upload,
        session: SessionToken::UploadId(String::new()),
    };

    let block_list = fingerprint_chunks(&file).await?;
    let session = pool
        .run_once(|| {
            pool.api()
                .precreate(&object.remote_path, object.size, &block_list)
        })
        .await?;

    if session.already_exists {
        info!(path = %object.remote_path, "provider already has identical content");
        return Ok(FileOutcome::AlreadyPresent);
    }
    file.session = SessionToken::UploadId(session.upload_id.clone());
    let file = Arc::new(file);

    let bar = progress.add_bar(object.size, &file.label());
    let (sink, mut collector) = collector::channel(file.chunks.len());
    let staging = Arc::new(Semaphore::new(staging_limit.max(1)));

    let mut tasks = Vec::new();
    for chunk in &file.chunks {
        let md5 = block_list[chunk.index].clone();
        if !upload_part_needed(&session, chunk.index) {
            collector.seed([ChunkResult {
                index: chunk.index,
                artifact: ChunkArtifact::None,
                fingerprint: Some(md5),
            }]);
            bar.inc(chunk.length);
            continue;
        }

        let worker = pool.clone();
        let file = file.clone();
        let chunk = *chunk;
        let staging = staging.clone();
        let bar = bar.clone();
        let sink = sink.clone();
        tasks.push(pool.spawn(async move {
            worker
                .upload_chunk(file, chunk, md5, staging, bar, sink)
                .await
        }));
    }
    debug!(
        path = %file.remote_path,
        parts = file.chunks.len(),
        sending = tasks.len(),
        "upload session opened"
    );

    let results = pool.gather(sink, collector, tasks).await?;
    commit(pool, &file, &results).await?;
    bar.finish();
    Ok(FileOutcome::Transferred)
}
