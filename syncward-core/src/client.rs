use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::EngineConfig;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8384";
const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Client for the engine's `/rest` control plane.
///
/// Every request carries the engine API key. The client is cheap to clone and
/// is shared between the startup handshake, the config mirror and the event
/// poller.
#[derive(Clone)]
pub struct EngineClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl EngineClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, api_key)
    }

    pub fn with_base_url(base_url: &str, api_key: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            api_key: api_key.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn ping(&self) -> Result<(), ApiError> {
        let url = self.endpoint("/rest/system/ping")?;
        let response = self.get(url).send().await?;
        Self::handle_empty(response).await
    }

    pub async fn system_version(&self) -> Result<SystemVersion, ApiError> {
        let url = self.endpoint("/rest/system/version")?;
        let response = self.get(url).send().await?;
        Self::handle_response(response).await
    }

    pub async fn system_status(&self) -> Result<SystemStatus, ApiError> {
        let url = self.endpoint("/rest/system/status")?;
        let response = self.get(url).send().await?;
        Self::handle_response(response).await
    }

    pub async fn get_config(&self) -> Result<EngineConfig, ApiError> {
        let url = self.endpoint("/rest/system/config")?;
        let response = self.get(url).send().await?;
        Self::handle_response(response).await
    }

    /// Replaces the whole engine configuration.
    pub async fn post_config(&self, config: &EngineConfig) -> Result<(), ApiError> {
        let url = self.endpoint("/rest/system/config")?;
        let response = self.post(url).json(config).send().await?;
        Self::handle_empty(response).await
    }

    /// Fetches events with an id greater than `since`.
    ///
    /// `limit == 0` asks for every buffered event. Elements that do not decode
    /// are counted in [`EventBatch::malformed`] instead of failing the batch.
    pub async fn events(
        &self,
        since: u64,
        limit: u32,
        timeout: Option<Duration>,
    ) -> Result<EventBatch, ApiError> {
        let mut url = self.endpoint("/rest/events")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("since", &since.to_string())
                .append_pair("limit", &limit.to_string());
            if let Some(timeout) = timeout {
                query.append_pair("timeout", &timeout.as_secs().to_string());
            }
        }
        let response = self.get(url).send().await?;
        let raw: Vec<serde_json::Value> = Self::handle_response(response).await?;
        Ok(EventBatch::from_raw(raw))
    }

    pub async fn connections(&self) -> Result<Connections, ApiError> {
        let url = self.endpoint("/rest/system/connections")?;
        let response = self.get(url).send().await?;
        Self::handle_response(response).await
    }

    pub async fn db_status(&self, folder: &str) -> Result<FolderStatus, ApiError> {
        let mut url = self.endpoint("/rest/db/status")?;
        url.query_pairs_mut().append_pair("folder", folder);
        let response = self.get(url).send().await?;
        Self::handle_response(response).await
    }

    pub async fn override_folder(&self, folder: &str) -> Result<(), ApiError> {
        let mut url = self.endpoint("/rest/db/override")?;
        url.query_pairs_mut().append_pair("folder", folder);
        let response = self.post(url).send().await?;
        Self::handle_empty(response).await
    }

    pub async fn shutdown(&self) -> Result<(), ApiError> {
        let url = self.endpoint("/rest/system/shutdown")?;
        let response = self.post(url).send().await?;
        Self::handle_empty(response).await
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        self.http.get(url).header(API_KEY_HEADER, &self.api_key)
    }

    fn post(&self, url: Url) -> reqwest::RequestBuilder {
        self.http.post(url).header(API_KEY_HEADER, &self.api_key)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), ApiError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> ApiError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ApiError::Api { status, body }
    }
}

impl ApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Request(err) => err.is_connect() || err.is_timeout(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemVersion {
    pub version: String,
    pub long_version: String,
    pub os: String,
    pub arch: String,
    pub codename: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemStatus {
    #[serde(rename = "myID")]
    pub my_id: String,
    pub uptime: u64,
    pub start_time: String,
    pub alloc: u64,
    pub goroutines: u64,
}

/// One entry of the engine event log.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Event {
    pub id: u64,
    #[serde(rename = "globalID", default)]
    pub global_id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBatch {
    /// Decoded events in the order the engine returned them.
    pub events: Vec<Event>,
    pub malformed: usize,
}

impl EventBatch {
    pub fn from_raw(raw: Vec<serde_json::Value>) -> Self {
        let mut batch = EventBatch::default();
        for value in raw {
            match serde_json::from_value::<Event>(value) {
                Ok(event) => batch.events.push(event),
                Err(_) => batch.malformed += 1,
            }
        }
        batch
    }

    pub fn max_id(&self) -> Option<u64> {
        self.events.iter().map(|event| event.id).max()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.malformed == 0
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Connections {
    #[serde(default)]
    pub total: Connection,
    #[serde(default)]
    pub connections: BTreeMap<String, Connection>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Connection {
    pub at: String,
    pub in_bytes_total: u64,
    pub out_bytes_total: u64,
    pub address: String,
    pub client_version: String,
    pub connected: bool,
    pub paused: bool,
    #[serde(rename = "type")]
    pub connection_type: String,
    /// Receive rate in bits per second, computed locally between snapshots.
    pub in_bits: u64,
    pub out_bits: u64,
    /// Remote completion percentage, filled from the local completion cache.
    pub completion: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FolderStatus {
    pub global_bytes: u64,
    pub global_deleted: u64,
    pub global_files: u64,
    pub in_sync_bytes: u64,
    pub in_sync_files: u64,
    pub local_bytes: u64,
    pub local_files: u64,
    pub need_bytes: u64,
    pub need_deletes: u64,
    pub need_files: u64,
    pub state: String,
    pub state_changed: String,
    pub errors: u64,
    pub pull_errors: u64,
    pub invalid: String,
    pub version: u64,
}

impl FolderStatus {
    pub fn completion_percent(&self) -> f64 {
        if self.global_bytes == 0 {
            return 100.0;
        }
        (self.in_sync_bytes as f64 * 100.0 / self.global_bytes as f64).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_api_statuses() {
        let auth = ApiError::Api {
            status: StatusCode::FORBIDDEN,
            body: String::new(),
        };
        assert_eq!(auth.classification(), Some(ApiErrorClass::Auth));
        assert!(!auth.is_retryable());

        let busy = ApiError::Api {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        assert_eq!(busy.classification(), Some(ApiErrorClass::Transient));
        assert!(busy.is_retryable());
    }

    #[test]
    fn event_batch_skips_malformed_elements() {
        let batch = EventBatch::from_raw(vec![
            json!({"id": 5, "type": "Ping"}),
            json!({"type": "NoId"}),
            json!({"id": 9, "type": "ConfigSaved", "data": {}}),
        ]);
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.malformed, 1);
        assert_eq!(batch.max_id(), Some(9));
    }

    #[test]
    fn folder_completion_handles_empty_folder() {
        let status = FolderStatus::default();
        assert_eq!(status.completion_percent(), 100.0);

        let status = FolderStatus {
            global_bytes: 200,
            in_sync_bytes: 50,
            ..FolderStatus::default()
        };
        assert_eq!(status.completion_percent(), 25.0);
    }
}
