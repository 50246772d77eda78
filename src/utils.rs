//! Utility helpers used across the crate.
//!
//! Path manipulation for remote and local names, md5 fingerprints, and
//! reading byte ranges out of local files.
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::TransferError;

/// Splits a remote path at its last `/`.
///
/// The directory part keeps its trailing slash: `/a/b/c.txt` becomes
/// `("/a/b/", "c.txt")`.
pub fn divide_dir_and_file(path: &str) -> Result<(&str, &str), TransferError> {
    match path.rfind('/') {
        Some(i) => Ok((&path[..=i], &path[i + 1..])),
        None => Err(TransferError::Precondition(format!(
            "remote path {path:?} has no directory separator"
        ))),
    }
}

/// Removes leading and trailing slashes from an upload prefix.
pub fn normalize_prefix(prefix: &str) -> &str {
    prefix.trim_matches('/')
}

/// Drops a leading `./` and trailing slashes from a local path argument.
pub fn normalize_local_path(path: &str) -> &str {
    let path = path.strip_prefix("./").unwrap_or(path);
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { path } else { trimmed }
}

/// Joins remote path segments with single slashes, skipping empty ones.
pub fn join_remote(segments: &[&str]) -> String {
    let mut out = String::new();
    for segment in segments {
        let segment = segment.trim_matches('/');
        if segment.is_empty() {
            continue;
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() { "/".into() } else { out }
}

/// Local destination of `remote_path` once `strip` is removed from its front.
pub fn local_target(output_dir: &Path, remote_path: &str, strip: &str) -> PathBuf {
    let relative = remote_path.strip_prefix(strip).unwrap_or(remote_path);
    let mut target = output_dir.to_path_buf();
    for part in relative.split('/').filter(|p| !p.is_empty()) {
        target.push(part);
    }
    target
}

/// Lowercase hex md5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Reads `length` bytes at `offset` from a local file.
pub async fn read_range(path: &Path, offset: u64, length: u64) -> Result<Bytes, TransferError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| TransferError::io(path, e))?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(Bytes::from(buf))
}

/// Size of a local file, or `None` when it does not exist.
pub async fn existing_size(path: &Path) -> Result<Option<u64>, TransferError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TransferError::io(path, e)),
    }
}
