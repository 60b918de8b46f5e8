//! HTTP transport to the PRINCIPAL.
//!
//! The dispatcher and the migration pipeline only see the [`Transport`]
//! trait. [`HttpTransport`] implements it with `reqwest`; every request
//! carries the configured sync timeout.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use possync_engine::{
    ChangesRequest, ChangesResponse, ManifestRequest, ManifestResponse, PingResponse,
    PullBatchRequest, PullBatchResponse, PushRequest, PushResponse, SyncConfig,
};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Calls a node makes to the PRINCIPAL.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `GET /ping`
    async fn ping(&self) -> SyncResult<PingResponse>;

    /// `POST /sync/push`
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// `POST /sync/pull`
    async fn pull_changes(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse>;

    /// `POST /migration/manifest`
    async fn manifest(&self, request: &ManifestRequest) -> SyncResult<ManifestResponse>;

    /// `POST /migration/pull_batch`
    async fn pull_batch(&self, request: &PullBatchRequest) -> SyncResult<PullBatchResponse>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("possync-node/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Transport for the remote named in a node configuration.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        let (url, _) = config.remote()?;
        Self::new(url, Duration::from_secs(config.sync_timeout_secs))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> SyncResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        decode(path, response).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn ping(&self) -> SyncResult<PingResponse> {
        let response = self.client.get(self.url("/ping")).send().await?;
        decode("/ping", response).await
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        tracing::debug!(
            model = %request.model,
            operation = %request.operation,
            records = request.records.len(),
            "Pushing batch"
        );
        self.post_json("/sync/push", request).await
    }

    async fn pull_changes(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse> {
        self.post_json("/sync/pull", request).await
    }

    async fn manifest(&self, request: &ManifestRequest) -> SyncResult<ManifestResponse> {
        self.post_json("/migration/manifest", request).await
    }

    async fn pull_batch(&self, request: &PullBatchRequest) -> SyncResult<PullBatchResponse> {
        self.post_json("/migration/pull_batch", request).await
    }
}

/// Map an HTTP response onto a decoded body or a classified error.
///
/// Authentication failures are configuration errors; server errors and
/// unreadable bodies are transport errors; other client errors are remote
/// rejections of the request.
async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> SyncResult<T> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SyncError::Configuration(format!(
            "{} rejected credentials ({})",
            path, status
        )));
    }
    if status.is_server_error() {
        return Err(SyncError::Transport(format!("{} returned {}", path, status)));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SyncError::Remote(format!("{} returned {}: {}", path, status, body)));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| SyncError::Transport(format!("{} sent an unreadable body: {}", path, e)))
}
