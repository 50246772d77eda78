//! Deciding what is already done before any worker starts.
//!
//! All checks for a file run sequentially and complete before its workers
//! are spawned, so no worker can race with a stale partial being removed.
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::api::UploadSession;
use crate::error::TransferError;
use crate::plan::ChunkDescriptor;
use crate::state::{ArtifactPlan, ChunkArtifact, ChunkResult, LogicalFile};
use crate::utils::existing_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    AlreadySatisfied,
    NeedsTransfer,
}

/// Compares an existing local file against the size it should have.
///
/// An exact match is satisfied. A mismatching file is removed so the
/// transfer starts from nothing; an absent file simply needs transfer.
pub async fn check_local(path: &Path, expected_size: u64) -> Result<SkipDecision, TransferError> {
    match existing_size(path).await? {
        Some(size) if size == expected_size => {
            debug!(path = %path.display(), size, "already complete");
            Ok(SkipDecision::AlreadySatisfied)
        }
        Some(size) => {
            debug!(
                path = %path.display(),
                size,
                expected_size,
                "removing stale partial"
            );
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| TransferError::io(path, e))?;
            Ok(SkipDecision::NeedsTransfer)
        }
        None => Ok(SkipDecision::NeedsTransfer),
    }
}

/// Splits a download's chunks into those whose artifact is already on disk
/// and those that must be fetched.
///
/// Artifacts are only trusted when the plan recorded next to them matches
/// this file's size, chunk size and content `md5`. Otherwise every
/// `<final>_<i>` artifact is removed and the current plan is recorded.
pub async fn partition_download_chunks(
    file: &LogicalFile,
    md5: Option<&str>,
) -> Result<(Vec<ChunkResult>, Vec<ChunkDescriptor>), TransferError> {
    let current = ArtifactPlan::for_file(file, md5);
    if ArtifactPlan::load(&file.local_path).await?.as_ref() != Some(&current) {
        let removed = remove_chunk_artifacts(&file.local_path).await?;
        if removed > 0 {
            debug!(
                path = %file.local_path.display(),
                removed,
                "discarding artifacts of a different plan"
            );
        }
        current.save(&file.local_path).await?;
    }

    let mut satisfied = Vec::new();
    let mut pending = Vec::new();

    for chunk in &file.chunks {
        let artifact = file.chunk_artifact_path(chunk.index);
        match check_local(&artifact, chunk.length).await? {
            SkipDecision::AlreadySatisfied => satisfied.push(ChunkResult {
                index: chunk.index,
                artifact: ChunkArtifact::File(artifact),
                fingerprint: None,
            }),
            SkipDecision::NeedsTransfer => pending.push(*chunk),
        }
    }

    Ok((satisfied, pending))
}

/// Deletes every `<final>_<digits>` sibling of `final_path`, whatever plan
/// produced it. Returns how many were removed.
pub async fn remove_chunk_artifacts(final_path: &Path) -> Result<usize, TransferError> {
    let Some(name) = final_path.file_name().and_then(|n| n.to_str()) else {
        return Ok(0);
    };
    let dir = match final_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = format!("{name}_");

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(TransferError::io(&dir, e)),
    };
    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| TransferError::io(&dir, e))?
    {
        let file_name = entry.file_name();
        let Some(index) = file_name
            .to_str()
            .and_then(|n| n.strip_prefix(prefix.as_str()))
        else {
            continue;
        };
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let path = entry.path();
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| TransferError::io(&path, e))?;
        removed += 1;
    }
    Ok(removed)
}

/// Whether the provider still needs part `index` of an upload session.
pub fn upload_part_needed(session: &UploadSession, index: usize) -> bool {
    session.needed_parts.is_empty() || session.needed_parts.contains(&index)
}
