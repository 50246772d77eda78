//! Request and response bodies of the provider's REST API.
//!
//! Only the fields the engine needs are modelled.
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteEntry {
    #[serde(rename = "is_dir", default, deserialize_with = "bool_from_int")]
    pub is_dir: bool,
    #[serde(default)]
    pub size: u64,
    pub path: String,
    #[serde(rename = "server_filename", default)]
    pub name: String,
    #[serde(rename = "fs_id")]
    pub fs_id: u64,
    #[serde(default)]
    pub md5: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListResponse {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub errmsg: Option<String>,
    #[serde(default)]
    pub list: Vec<RemoteEntry>,
    #[serde(default)]
    pub has_more: i64,
    #[serde(default)]
    pub cursor: u64,
}

/// A resolved direct link for one file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DownloadLink {
    #[serde(rename = "dlink")]
    pub url: String,
    #[serde(rename = "fs_id")]
    pub fs_id: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileMetasResponse {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub errmsg: Option<String>,
    #[serde(default)]
    pub list: Vec<DownloadLink>,
}

/// Upload session opened by precreate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    /// Sequence numbers the provider still needs. Empty means all of them.
    pub needed_parts: Vec<usize>,
    /// The provider already holds identical content; nothing to upload.
    pub already_exists: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PrecreateResponse {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub errmsg: Option<String>,
    #[serde(default)]
    pub return_type: i64,
    #[serde(default)]
    pub block_list: Vec<usize>,
    #[serde(rename = "uploadid", default)]
    pub upload_id: String,
}

impl From<PrecreateResponse> for UploadSession {
    fn from(resp: PrecreateResponse) -> Self {
        UploadSession {
            upload_id: resp.upload_id,
            needed_parts: resp.block_list,
            already_exists: resp.return_type == 2,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadPartResponse {
    #[serde(default)]
    pub md5: String,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_msg: Option<String>,
}

/// The committed remote object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedObject {
    #[serde(default)]
    pub path: String,
    #[serde(rename = "fs_id", default)]
    pub fs_id: u64,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateResponse {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub errmsg: Option<String>,
    #[serde(flatten)]
    pub object: CreatedObject,
}

/// Returns `Err(Api)` when the provider reported a non-zero error code.
pub(crate) fn check_errno(errno: i64, errmsg: Option<String>) -> Result<(), TransferError> {
    if errno == 0 {
        Ok(())
    } else {
        Err(TransferError::Api {
            errno,
            message: errmsg.unwrap_or_default(),
        })
    }
}

fn bool_from_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let n = i64::deserialize(deserializer)?;
    Ok(n != 0)
}
