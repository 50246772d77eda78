//! HTTP implementation of [`PanApi`].
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{RANGE, USER_AGENT};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::types::{
    CreateResponse, FileMetasResponse, ListResponse, PrecreateResponse, UploadPartResponse,
    check_errno,
};
use super::{CreatedObject, DownloadLink, MAX_IDS_PER_REQUEST, PanApi, RemoteEntry, UploadSession};
use crate::error::TransferError;
use crate::plan::ChunkDescriptor;
use crate::throttle::Throttle;

/// The provider rejects requests without this user agent.
const CLIENT_USER_AGENT: &str = "pan.baidu.com";
const LIST_PAGE_SIZE: usize = 1000;

/// Base URLs of the two API hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Metadata, listing, precreate and create.
    pub pan: String,
    /// Chunk uploads.
    pub pcs: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            pan: "https://pan.baidu.com".into(),
            pcs: "https://d.pcs.baidu.com".into(),
        }
    }
}

impl Endpoints {
    /// Both hosts at the same base URL. Handy for a mock server.
    pub fn single(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            pan: base.clone(),
            pcs: base,
        }
    }
}

/// Talks to the provider with one shared connection pool.
#[derive(Clone)]
pub struct PanClient {
    http: reqwest::Client,
    access_token: String,
    endpoints: Endpoints,
    throttle: Option<Throttle>,
}

impl PanClient {
    pub fn new(access_token: impl Into<String>) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder()
            .user_agent(CLIENT_USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.into(),
            endpoints: Endpoints::default(),
            throttle: None,
        })
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Caps the combined transfer rate of every request made by this client.
    pub fn with_throttle(mut self, throttle: Option<Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Appends the access credential to a signed link.
    pub fn authorize_link(&self, link: &str) -> Result<String, TransferError> {
        let mut url = Url::parse(link)
            .map_err(|e| TransferError::Precondition(format!("bad download link {link}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("access_token", &self.access_token);
        Ok(url.into())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, TransferError> {
        let response = self
            .http
            .get(url)
            .query(&[("access_token", self.access_token.as_str())])
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        method: &str,
        form: &[(&str, String)],
    ) -> Result<T, TransferError> {
        let url = format!("{}/rest/2.0/xpan/file", self.endpoints.pan);
        let response = self
            .http
            .post(url)
            .query(&[("method", method), ("access_token", self.access_token.as_str())])
            .form(form)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn admit(&self, len: usize) {
        if let Some(throttle) = &self.throttle {
            throttle.admit(len).await;
        }
    }
}

fn block_list_json(block_list: &[String]) -> Result<String, TransferError> {
    serde_json::to_string(block_list)
        .map_err(|e| TransferError::Precondition(format!("encoding block list: {e}")))
}

#[async_trait]
impl PanApi for PanClient {
    async fn list_recursive(&self, path: &str) -> Result<Vec<RemoteEntry>, TransferError> {
        let url = format!("{}/rest/2.0/xpan/multimedia", self.endpoints.pan);
        let mut entries = Vec::new();
        let mut start = 0u64;

        loop {
            let page: ListResponse = self
                .get_json(
                    &url,
                    &[
                        ("method", "listall".into()),
                        ("path", path.to_string()),
                        ("recursion", "1".into()),
                        ("start", start.to_string()),
                        ("limit", LIST_PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            check_errno(page.errno, page.errmsg)?;
            entries.extend(page.list);

            if page.has_more != 1 || page.cursor <= start {
                break;
            }
            start = page.cursor;
        }

        debug!(path, count = entries.len(), "listed recursively");
        Ok(entries)
    }

    async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteEntry>, TransferError> {
        let url = format!("{}/rest/2.0/xpan/file", self.endpoints.pan);
        let mut entries = Vec::new();
        let mut start = 0usize;

        loop {
            let page: ListResponse = self
                .get_json(
                    &url,
                    &[
                        ("method", "list".into()),
                        ("dir", dir.to_string()),
                        ("start", start.to_string()),
                        ("limit", LIST_PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            check_errno(page.errno, page.errmsg)?;
            let received = page.list.len();
            entries.extend(page.list);

            if received < LIST_PAGE_SIZE {
                break;
            }
            start += received;
        }

        Ok(entries)
    }

    async fn download_links(&self, fs_ids: &[u64]) -> Result<Vec<DownloadLink>, TransferError> {
        let url = format!("{}/rest/2.0/xpan/multimedia", self.endpoints.pan);
        let mut links = Vec::with_capacity(fs_ids.len());

        for batch in fs_ids.chunks(MAX_IDS_PER_REQUEST) {
            let ids = serde_json::to_string(batch)
                .map_err(|e| TransferError::Precondition(format!("encoding fs ids: {e}")))?;
            let resp: FileMetasResponse = self
                .get_json(
                    &url,
                    &[
                        ("method", "filemetas".into()),
                        ("fsids", ids),
                        ("dlink", "1".into()),
                    ],
                )
                .await?;
            check_errno(resp.errno, resp.errmsg)?;

            for mut link in resp.list {
                link.url = self.authorize_link(&link.url)?;
                links.push(link);
            }
        }

        Ok(links)
    }

    async fn precreate(
        &self,
        remote_path: &str,
        size: u64,
        block_list: &[String],
    ) -> Result<UploadSession, TransferError> {
        let resp: PrecreateResponse = self
            .post_form(
                "precreate",
                &[
                    ("path", remote_path.to_string()),
                    ("size", size.to_string()),
                    ("isdir", "0".into()),
                    ("block_list", block_list_json(block_list)?),
                    ("autoinit", "1".into()),
                    ("rtype", "1".into()),
                ],
            )
            .await?;
        check_errno(resp.errno, resp.errmsg.clone())?;
        Ok(resp.into())
    }

    async fn upload_part(
        &self,
        remote_path: &str,
        upload_id: &str,
        seq: usize,
        data: Bytes,
    ) -> Result<String, TransferError> {
        self.admit(data.len()).await;

        let url = format!("{}/rest/2.0/pcs/superfile2", self.endpoints.pcs);
        let len = data.len() as u64;
        let part = Part::stream_with_length(data, len).file_name("file");
        let form = Form::new().part("file", part);

        let response = self
            .http
            .post(url)
            .query(&[
                ("method", "upload"),
                ("type", "tmpfile"),
                ("access_token", self.access_token.as_str()),
                ("path", remote_path),
                ("uploadid", upload_id),
            ])
            .query(&[("partseq", seq)])
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        let resp: UploadPartResponse = response.json().await?;

        if resp.error_code != 0 {
            return Err(TransferError::Api {
                errno: resp.error_code,
                message: resp.error_msg.unwrap_or_default(),
            });
        }
        if resp.md5.is_empty() {
            return Err(TransferError::Network(format!(
                "part {seq} of {remote_path} was not acknowledged"
            )));
        }
        Ok(resp.md5)
    }

    async fn create(
        &self,
        remote_path: &str,
        size: u64,
        block_list: &[String],
        upload_id: &str,
    ) -> Result<CreatedObject, TransferError> {
        let resp: CreateResponse = self
            .post_form(
                "create",
                &[
                    ("path", remote_path.to_string()),
                    ("size", size.to_string()),
                    ("isdir", "0".into()),
                    ("block_list", block_list_json(block_list)?),
                    ("uploadid", upload_id.to_string()),
                    ("rtype", "1".into()),
                ],
            )
            .await?;
        check_errno(resp.errno, resp.errmsg)?;
        Ok(resp.object)
    }

    async fn fetch(
        &self,
        link: &str,
        range: Option<ChunkDescriptor>,
    ) -> Result<Bytes, TransferError> {
        let mut request = self.http.get(link).header(USER_AGENT, CLIENT_USER_AGENT);
        if let Some(chunk) = range {
            request = request.header(RANGE, chunk.range_header());
        }

        let mut response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut buf = match range {
            Some(chunk) => BytesMut::with_capacity(chunk.length as usize),
            None => BytesMut::new(),
        };
        while let Some(piece) = response.chunk().await? {
            self.admit(piece.len()).await;
            buf.extend_from_slice(&piece);
        }

        if let Some(chunk) = range
            && buf.len() as u64 != chunk.length
        {
            return Err(TransferError::Network(format!(
                "short read for {}: got {} of {} bytes",
                chunk.range_header(),
                buf.len(),
                chunk.length
            )));
        }

        Ok(buf.freeze())
    }
}
