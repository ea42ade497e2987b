//! Transport seam between the client engine and the server. The sync
//! services only see this trait, so tests inject stubs and the manager never
//! knows whether bytes went over HTTP.

use async_trait::async_trait;
use kioku::{
    Error, LibraryError, SyncErrorKind,
    config::SyncTuning,
    model::SyncVersion,
    schema::sync::{PullResponse, PushRequest, PushResponse},
};
use reqwest::StatusCode;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, body: &PushRequest) -> Result<PushResponse, Error>;
    async fn pull(&self, last_sync_version: SyncVersion) -> Result<PullResponse, Error>;
}

/// HTTP transport against the kioku server. Fixed request timeout; failures
/// map onto the sync error taxonomy so the queue and manager can tell
/// transient trouble from quarantine-worthy rejections.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    user_id: Uuid,
}

impl HttpTransport {
    pub fn new(base_url: &str, user_id: Uuid, tuning: &SyncTuning) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(tuning.request_timeout_ms))
            .build()
            .map_err(|e| {
                Error::Library(LibraryError::Sync(SyncErrorKind::Transient(e.to_string())))
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id,
        })
    }

    async fn classify(response: reqwest::Response) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let kind = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncErrorKind::Unauthorized,
            StatusCode::BAD_REQUEST => SyncErrorKind::Validation(body),
            _ => SyncErrorKind::Transient(format!("{}: {}", status, body)),
        };
        Err(Error::Library(LibraryError::Sync(kind)))
    }

    fn transient(e: reqwest::Error) -> Error {
        Error::Library(LibraryError::Sync(SyncErrorKind::Transient(e.to_string())))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, body: &PushRequest) -> Result<PushResponse, Error> {
        let response = self
            .client
            .post(format!("{}/api/sync/push", self.base_url))
            .header("x-user-id", self.user_id.to_string())
            .json(body)
            .send()
            .await
            .map_err(Self::transient)?;
        Self::classify(response)
            .await?
            .json()
            .await
            .map_err(Self::transient)
    }

    async fn pull(&self, last_sync_version: SyncVersion) -> Result<PullResponse, Error> {
        let response = self
            .client
            .get(format!(
                "{}/api/sync/pull?lastSyncVersion={}",
                self.base_url, last_sync_version
            ))
            .header("x-user-id", self.user_id.to_string())
            .send()
            .await
            .map_err(Self::transient)?;
        Self::classify(response)
            .await?
            .json()
            .await
            .map_err(Self::transient)
    }
}
