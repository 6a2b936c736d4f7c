use crate::infrastructure::activity_store::StateSnapshot;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use url::Url;

const SUBSCRIPTION_CAPACITY: usize = 16;
const SUMMARY_KEY_LIMIT: usize = 10;
const DOCUMENTS: &str = "userStates";
const LARGE_OBJECTS: &str = "largeObjects";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Document,
    LargeObject,
}

/// Shape of a snapshot too large to embed: top-level keys and their count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateSummary {
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub key_count: usize,
}

impl StateSummary {
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self {
                value_type: "object".to_string(),
                keys: map.keys().take(SUMMARY_KEY_LIMIT).cloned().collect(),
                key_count: map.len(),
            },
            serde_json::Value::Array(items) => Self {
                value_type: "array".to_string(),
                keys: Vec::new(),
                key_count: items.len(),
            },
            _ => Self {
                value_type: "scalar".to_string(),
                keys: Vec::new(),
                key_count: 0,
            },
        }
    }
}

/// The per-user remote record. `last_sync` is assigned by the remote on write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    pub user_id: String,
    pub storage_type: StorageType,
    #[serde(default)]
    pub state_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_summary: Option<StateSummary>,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RemoteDocumentClient: Send + Sync {
    async fn get_document(&self, user_id: &str) -> Result<Option<RemoteDocument>, InfraError>;

    /// Unconditionally overwrites the user's document and returns it as stored.
    async fn put_document(
        &self,
        user_id: &str,
        document: &RemoteDocument,
    ) -> Result<RemoteDocument, InfraError>;

    /// Every document written for `user_id` after subscribing.
    async fn subscribe(
        &self,
        user_id: &str,
    ) -> Result<broadcast::Receiver<RemoteDocument>, InfraError>;
}

#[async_trait]
pub trait LargeObjectStore: Send + Sync {
    async fn put_object(&self, user_id: &str, payload: &str) -> Result<(), InfraError>;
    async fn get_object(&self, user_id: &str) -> Result<Option<String>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    pub base_url: Url,
    pub token: Option<String>,
    pub poll_interval: Duration,
}

/// HTTP client for the remote store. Documents live at
/// `{base}/userStates/{user}` and oversized payloads at
/// `{base}/largeObjects/{user}`, behind the same bearer token. Subscriptions
/// poll and forward documents whose `lastSync` advanced.
pub struct ReqwestRemoteDocumentClient {
    client: Client,
    endpoint: RemoteEndpoint,
}

impl ReqwestRemoteDocumentClient {
    pub fn new(endpoint: RemoteEndpoint) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::Remote(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn http_error(status: StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("remote store api error: http {}", status.as_u16())
        } else {
            format!("remote store api error: http {}; body={body}", status.as_u16())
        };
        InfraError::Remote(message)
    }

    fn resource_url(base_url: &Url, collection: &str, user_id: &str) -> Result<Url, InfraError> {
        let mut url = base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::Remote("remote store base URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push(collection);
            segments.push(user_id.trim());
        }
        Ok(url)
    }

    /// Body of a `GET`, or `None` on 404.
    async fn get_text(
        client: &Client,
        endpoint: &RemoteEndpoint,
        collection: &str,
        user_id: &str,
    ) -> Result<Option<String>, InfraError> {
        let url = Self::resource_url(&endpoint.base_url, collection, user_id)?;
        let mut request = client.get(url);
        if let Some(token) = endpoint.token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|error| {
            InfraError::Remote(format!("network error while loading {collection}: {error}"))
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::Remote(format!("failed reading {collection} response: {error}"))
        })?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(Some(body))
    }

    /// Sends a `PUT` and returns the response body.
    async fn put_body(
        &self,
        collection: &str,
        user_id: &str,
        request: impl FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    ) -> Result<String, InfraError> {
        Self::ensure_non_empty(user_id, "user id")?;
        let url = Self::resource_url(&self.endpoint.base_url, collection, user_id)?;
        let mut builder = request(self.client.put(url));
        if let Some(token) = self.endpoint.token.as_deref() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|error| {
            InfraError::Remote(format!("network error while saving {collection}: {error}"))
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::Remote(format!("failed reading {collection} save response: {error}"))
        })?;
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(body)
    }

    async fn fetch(
        client: &Client,
        endpoint: &RemoteEndpoint,
        user_id: &str,
    ) -> Result<Option<RemoteDocument>, InfraError> {
        let Some(body) = Self::get_text(client, endpoint, DOCUMENTS, user_id).await? else {
            return Ok(None);
        };
        let document = serde_json::from_str(&body).map_err(|error| {
            InfraError::Remote(format!("invalid remote document payload: {error}"))
        })?;
        Ok(Some(document))
    }
}

#[async_trait]
impl RemoteDocumentClient for ReqwestRemoteDocumentClient {
    async fn get_document(&self, user_id: &str) -> Result<Option<RemoteDocument>, InfraError> {
        Self::ensure_non_empty(user_id, "user id")?;
        Self::fetch(&self.client, &self.endpoint, user_id).await
    }

    async fn put_document(
        &self,
        user_id: &str,
        document: &RemoteDocument,
    ) -> Result<RemoteDocument, InfraError> {
        let body = self
            .put_body(DOCUMENTS, user_id, |request| request.json(document))
            .await?;

        if body.trim().is_empty() {
            let mut stored = document.clone();
            stored.last_sync = Some(Utc::now());
            return Ok(stored);
        }
        serde_json::from_str(&body).map_err(|error| {
            InfraError::Remote(format!("invalid remote save payload: {error}"))
        })
    }

    async fn subscribe(
        &self,
        user_id: &str,
    ) -> Result<broadcast::Receiver<RemoteDocument>, InfraError> {
        Self::ensure_non_empty(user_id, "user id")?;

        let (sender, receiver) = broadcast::channel(SUBSCRIPTION_CAPACITY);
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let user_id = user_id.trim().to_string();

        tokio::spawn(async move {
            let mut last_seen: Option<DateTime<Utc>> = None;
            let mut ticker = tokio::time::interval(endpoint.poll_interval);
            loop {
                ticker.tick().await;
                if sender.receiver_count() == 0 {
                    break;
                }
                match Self::fetch(&client, &endpoint, &user_id).await {
                    Ok(Some(document)) if document.last_sync > last_seen => {
                        last_seen = document.last_sync;
                        let _ = sender.send(document);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(user_id = %user_id, error = %error, "remote document poll failed");
                    }
                }
            }
        });

        Ok(receiver)
    }
}

#[async_trait]
impl LargeObjectStore for ReqwestRemoteDocumentClient {
    async fn put_object(&self, user_id: &str, payload: &str) -> Result<(), InfraError> {
        let payload = payload.to_string();
        self.put_body(LARGE_OBJECTS, user_id, |request| {
            request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload)
        })
        .await?;
        Ok(())
    }

    async fn get_object(&self, user_id: &str) -> Result<Option<String>, InfraError> {
        Self::ensure_non_empty(user_id, "user id")?;
        Self::get_text(&self.client, &self.endpoint, LARGE_OBJECTS, user_id).await
    }
}

type NowProvider = std::sync::Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Remote document and large-object store held in memory. Writes are
/// broadcast to subscribers, mirroring a push-capable backend.
pub struct InMemoryRemoteStore {
    documents: Mutex<HashMap<String, RemoteDocument>>,
    objects: Mutex<HashMap<String, String>>,
    channels: Mutex<HashMap<String, broadcast::Sender<RemoteDocument>>>,
    now_provider: NowProvider,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            now_provider: std::sync::Arc::new(Utc::now),
        }
    }
}

impl InMemoryRemoteStore {
    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn lock<'a, T>(
        mutex: &'a Mutex<T>,
        name: &str,
    ) -> Result<std::sync::MutexGuard<'a, T>, InfraError> {
        mutex
            .lock()
            .map_err(|error| InfraError::Remote(format!("{name} lock poisoned: {error}")))
    }

    fn sender(&self, user_id: &str) -> Result<broadcast::Sender<RemoteDocument>, InfraError> {
        let mut channels = Self::lock(&self.channels, "remote channels")?;
        Ok(channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_CAPACITY).0)
            .clone())
    }
}

#[async_trait]
impl RemoteDocumentClient for InMemoryRemoteStore {
    async fn get_document(&self, user_id: &str) -> Result<Option<RemoteDocument>, InfraError> {
        Ok(Self::lock(&self.documents, "remote documents")?
            .get(user_id)
            .cloned())
    }

    async fn put_document(
        &self,
        user_id: &str,
        document: &RemoteDocument,
    ) -> Result<RemoteDocument, InfraError> {
        let mut stored = document.clone();
        stored.last_sync = Some((self.now_provider)());
        Self::lock(&self.documents, "remote documents")?
            .insert(user_id.to_string(), stored.clone());
        let _ = self.sender(user_id)?.send(stored.clone());
        Ok(stored)
    }

    async fn subscribe(
        &self,
        user_id: &str,
    ) -> Result<broadcast::Receiver<RemoteDocument>, InfraError> {
        Ok(self.sender(user_id)?.subscribe())
    }
}

#[async_trait]
impl LargeObjectStore for InMemoryRemoteStore {
    async fn put_object(&self, user_id: &str, payload: &str) -> Result<(), InfraError> {
        Self::lock(&self.objects, "remote objects")?
            .insert(user_id.to_string(), payload.to_string());
        Ok(())
    }

    async fn get_object(&self, user_id: &str) -> Result<Option<String>, InfraError> {
        Ok(Self::lock(&self.objects, "remote objects")?
            .get(user_id)
            .cloned())
    }
}
