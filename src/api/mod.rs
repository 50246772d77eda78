//! Provider collaborators used by the engine.
//!
//! [`PanApi`] is the seam between the transfer engine and the provider.
//! [`PanClient`] implements it over HTTP; tests substitute their own.
mod client;
mod types;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransferError;
use crate::plan::ChunkDescriptor;

pub use client::{Endpoints, PanClient};
pub use types::{CreatedObject, DownloadLink, RemoteEntry, UploadSession};

/// Provider's maximum number of file ids per link-resolution request.
pub const MAX_IDS_PER_REQUEST: usize = 100;

/// Operations the engine needs from the storage provider.
///
/// Every method performs exactly one logical attempt; retrying is the
/// caller's business.
#[async_trait]
pub trait PanApi: Send + Sync {
    /// Lists everything below `path`, recursively. Empty when `path` is a file.
    async fn list_recursive(&self, path: &str) -> Result<Vec<RemoteEntry>, TransferError>;

    /// Lists the direct children of `dir`.
    async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteEntry>, TransferError>;

    /// Resolves direct links for `fs_ids`, with the access credential appended.
    async fn download_links(&self, fs_ids: &[u64]) -> Result<Vec<DownloadLink>, TransferError>;

    /// Opens an upload session for a file with the given fingerprint manifest.
    async fn precreate(
        &self,
        remote_path: &str,
        size: u64,
        block_list: &[String],
    ) -> Result<UploadSession, TransferError>;

    /// Uploads part `seq` of a session and returns the provider's md5 for it.
    async fn upload_part(
        &self,
        remote_path: &str,
        upload_id: &str,
        seq: usize,
        data: Bytes,
    ) -> Result<String, TransferError>;

    /// Commits the uploaded parts as one remote object.
    async fn create(
        &self,
        remote_path: &str,
        size: u64,
        block_list: &[String],
        upload_id: &str,
    ) -> Result<CreatedObject, TransferError>;

    /// Fetches `range` of `link`, or the whole object when `range` is `None`.
    async fn fetch(
        &self,
        link: &str,
        range: Option<ChunkDescriptor>,
    ) -> Result<Bytes, TransferError>;
}
