//! Turning a user-supplied path into transfer jobs.
//!
//! Downloads are seeded from the provider's listing; uploads from walking
//! the local file system.
use std::collections::HashMap;
use std::path::{Component, Path};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::api::{PanApi, RemoteEntry};
use crate::error::TransferError;
use crate::state::{DownloadSpec, UploadSpec};
use crate::utils::{divide_dir_and_file, join_remote, local_target, normalize_local_path, normalize_prefix};

/// Provider errno for "no such file or directory".
const ERRNO_NOT_EXIST: i64 = -9;

/// Lists `remote_path` and resolves a direct link for every file below it.
///
/// A directory is downloaded with its own name under `output_dir`; a single
/// file lands directly in `output_dir`.
pub async fn resolve_download(
    api: &dyn PanApi,
    remote_path: &str,
    output_dir: &Path,
) -> Result<Vec<DownloadSpec>, TransferError> {
    let remote_path = match remote_path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    let (parent, name) = divide_dir_and_file(remote_path)?;

    let listing = match api.list_recursive(remote_path).await {
        Ok(entries) => entries,
        Err(TransferError::Api { errno, .. }) if errno == ERRNO_NOT_EXIST => Vec::new(),
        Err(e) => return Err(e),
    };

    let files: Vec<RemoteEntry> = if listing.is_empty() {
        // Either a plain file or nothing at all; look it up in its parent.
        let dir = match parent.trim_end_matches('/') {
            "" => "/",
            dir => dir,
        };
        let entry = api
            .list_dir(dir)
            .await?
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| TransferError::NotFound(remote_path.to_string()))?;
        if entry.is_dir {
            info!(path = remote_path, "directory is empty, nothing to download");
            Vec::new()
        } else {
            vec![entry]
        }
    } else {
        listing.into_iter().filter(|e| !e.is_dir).collect()
    };

    if files.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<u64> = files.iter().map(|e| e.fs_id).collect();
    let mut links: HashMap<u64, String> = api
        .download_links(&ids)
        .await?
        .into_iter()
        .map(|link| (link.fs_id, link.url))
        .collect();

    let specs = files
        .into_iter()
        .map(|entry| {
            let link = links
                .remove(&entry.fs_id)
                .ok_or_else(|| TransferError::NotFound(format!("download link for {}", entry.path)))?;
            Ok(DownloadSpec {
                local_path: local_target(output_dir, &entry.path, parent),
                remote_path: entry.path,
                size: entry.size,
                link,
                md5: entry.md5,
            })
        })
        .collect::<Result<Vec<_>, TransferError>>()?;

    debug!(path = remote_path, files = specs.len(), "download resolved");
    Ok(specs)
}

/// Enumerates the regular files at or below `local_path`.
///
/// Each file goes to `remote_root/prefix/<local path>`.
pub fn resolve_upload(
    local_path: &str,
    prefix: Option<&str>,
    remote_root: &str,
) -> Result<Vec<UploadSpec>, TransferError> {
    let local_path = normalize_local_path(local_path);
    let prefix = prefix.map(normalize_prefix).unwrap_or_default();

    let mut specs = Vec::new();
    for entry in WalkDir::new(local_path).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(Path::new(local_path)).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("file system loop"));
            TransferError::io(path, source)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let size = entry
            .metadata()
            .map_err(|e| TransferError::io(entry.path(), e.into()))?
            .len();
        let relative = remote_segments(entry.path());
        specs.push(UploadSpec {
            local_path: entry.path().to_path_buf(),
            remote_path: join_remote(&[remote_root, prefix, &relative]),
            size,
        });
    }

    debug!(path = local_path, files = specs.len(), "upload resolved");
    Ok(specs)
}

/// Local path as `/`-separated segments, without root, `.` or `..` parts.
fn remote_segments(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
