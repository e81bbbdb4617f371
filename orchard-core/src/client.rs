use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::adapter::{
    RemoteAdapter, RemoteEntry, RemoteMetadata, UploadResult, VersionStamp,
};

const DEFAULT_BASE_URL: &str = "https://docws.icloud.com";
const LIST_PAGE_SIZE: u32 = 200;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote object not found")]
    NotFound,
    #[error("remote version precondition failed")]
    PreconditionFailed,
    #[error("remote content not modified")]
    NotModified,
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl RemoteError {
    pub fn classification(&self) -> Option<ErrorClass> {
        match self {
            RemoteError::Api { status, .. } => Some(classify_status(*status)),
            RemoteError::Request(_) | RemoteError::Io(_) => Some(ErrorClass::Transient),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ErrorClass::RateLimit | ErrorClass::Transient)
        )
    }
}

fn classify_status(status: StatusCode) -> ErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT)
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// HTTP implementation of the adapter against the cloud-docs REST surface.
#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, RemoteError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn list_page(
        &self,
        folder_cloud_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<EntryPage, RemoteError> {
        let mut url = self.endpoint(&["v1", "folders", folder_cloud_id, "children"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::NOT_FOUND => Err(RemoteError::NotFound),
            StatusCode::PRECONDITION_FAILED => Err(RemoteError::PreconditionFailed),
            StatusCode::NOT_MODIFIED => Err(RemoteError::NotModified),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(RemoteError::Api { status, body })
            }
        }
    }

    async fn stream_body(source: &Path) -> Result<reqwest::Body, RemoteError> {
        let file = tokio::fs::File::open(source).await?;
        Ok(reqwest::Body::wrap_stream(ReaderStream::new(file)))
    }
}

#[async_trait::async_trait]
impl RemoteAdapter for DriveClient {
    async fn list(&self, folder_cloud_id: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self.list_page(folder_cloud_id, LIST_PAGE_SIZE, offset).await?;
            offset = offset.saturating_add(page.items.len() as u32);
            let total = page.total;
            let page_len = page.items.len();
            items.extend(page.items);
            if offset >= total || page_len == 0 {
                break;
            }
        }
        Ok(items)
    }

    async fn metadata(&self, cloud_id: &str) -> Result<RemoteMetadata, RemoteError> {
        let url = self.endpoint(&["v1", "items", cloud_id])?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn download_range(
        &self,
        cloud_id: &str,
        start: u64,
        end: u64,
        if_match: Option<&str>,
    ) -> Result<Bytes, RemoteError> {
        let url = self.endpoint(&["v1", "items", cloud_id, "content"])?;
        let mut request = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .header("Range", format!("bytes={start}-{end}"));
        if let Some(etag) = if_match {
            request = request.header("If-Match", etag);
        }
        let response = Self::check_status(request.send().await?).await?;
        Ok(response.bytes().await?)
    }

    async fn download(
        &self,
        cloud_id: &str,
        if_match: Option<&str>,
        target: &Path,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(&["v1", "items", cloud_id, "content"])?;
        let mut request = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value());
        if let Some(etag) = if_match {
            request = request.header("If-Match", etag);
        }
        let response = Self::check_status(request.send().await?).await?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(target).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn upload(
        &self,
        parent_cloud_id: &str,
        name: &str,
        source: &Path,
        if_match: Option<&str>,
    ) -> Result<UploadResult, RemoteError> {
        let mut url = self.endpoint(&["v1", "folders", parent_cloud_id, "items"])?;
        url.query_pairs_mut().append_pair("name", name);
        let mut request = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .body(Self::stream_body(source).await?);
        if let Some(etag) = if_match {
            request = request.header("If-Match", etag);
        }
        Self::handle_response(request.send().await?).await
    }

    async fn update(
        &self,
        cloud_id: &str,
        source: &Path,
        if_match: &str,
    ) -> Result<UploadResult, RemoteError> {
        let url = self.endpoint(&["v1", "items", cloud_id, "content"])?;
        let request = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .header("If-Match", if_match)
            .body(Self::stream_body(source).await?);
        Self::handle_response(request.send().await?).await
    }

    async fn create_folder(
        &self,
        parent_cloud_id: &str,
        name: &str,
    ) -> Result<UploadResult, RemoteError> {
        let mut url = self.endpoint(&["v1", "folders", parent_cloud_id, "folders"])?;
        url.query_pairs_mut().append_pair("name", name);
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn rename(
        &self,
        cloud_id: &str,
        new_name: &str,
        if_match: &str,
    ) -> Result<VersionStamp, RemoteError> {
        let mut url = self.endpoint(&["v1", "items", cloud_id, "rename"])?;
        url.query_pairs_mut().append_pair("name", new_name);
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .header("If-Match", if_match)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn move_item(
        &self,
        cloud_id: &str,
        new_parent_cloud_id: &str,
        if_match: &str,
    ) -> Result<VersionStamp, RemoteError> {
        let mut url = self.endpoint(&["v1", "items", cloud_id, "move"])?;
        url.query_pairs_mut().append_pair("parent", new_parent_cloud_id);
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .header("If-Match", if_match)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn delete(&self, cloud_id: &str, if_match: Option<&str>) -> Result<(), RemoteError> {
        let url = self.endpoint(&["v1", "items", cloud_id])?;
        let mut request = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value());
        if let Some(etag) = if_match {
            request = request.header("If-Match", etag);
        }
        Self::check_status(request.send().await?).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct EntryPage {
    items: Vec<RemoteEntry>,
    #[allow(dead_code)]
    limit: u32,
    #[allow(dead_code)]
    offset: u32,
    total: u32,
}
