use crate::infrastructure::activity_store::StateSnapshot;
use crate::infrastructure::config::{RemoteApplyPolicy, DEFAULT_LARGE_PAYLOAD_THRESHOLD_BYTES};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_document_client::{
    LargeObjectStore, RemoteDocument, RemoteDocumentClient, StateSummary, StorageType,
};
use crate::infrastructure::sync_state_repository::SyncStateRepository;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{sleep, Duration as TokioDuration};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

/// One attempt by default; the next periodic or debounced push is the retry.
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 200,
        }
    }
}

/// Result of a push or pull as reported to callers. Failures never escape
/// as errors past the command boundary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<StorageType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<bool>,
}

impl SyncOutcome {
    pub fn failed(error: &InfraError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            storage_type: None,
            size_bytes: None,
            applied: None,
        }
    }

    pub fn saved(receipt: &SaveReceipt) -> Self {
        Self {
            success: true,
            error: None,
            storage_type: Some(receipt.storage_type),
            size_bytes: Some(receipt.size_bytes),
            applied: None,
        }
    }

    pub fn pulled(applied: bool) -> Self {
        Self {
            success: true,
            error: None,
            storage_type: None,
            size_bytes: None,
            applied: Some(applied),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub storage_type: StorageType,
    pub size_bytes: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedState {
    pub snapshot: StateSnapshot,
    pub storage_type: StorageType,
    pub state_size: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyDecision {
    Apply,
    SkipOlder,
}

/// Whether a remote snapshot stamped `remote` may replace local state stamped `local`.
pub fn decide_apply(
    policy: RemoteApplyPolicy,
    local: Option<DateTime<Utc>>,
    remote: Option<DateTime<Utc>>,
) -> ApplyDecision {
    match policy {
        RemoteApplyPolicy::AlwaysOverwrite => ApplyDecision::Apply,
        RemoteApplyPolicy::NewerOnly => match (local, remote) {
            (None, _) => ApplyDecision::Apply,
            (Some(_), None) => ApplyDecision::SkipOlder,
            (Some(local), Some(remote)) if remote >= local => ApplyDecision::Apply,
            (Some(_), Some(_)) => ApplyDecision::SkipOlder,
        },
    }
}

pub struct RemoteSyncService<C, L, S>
where
    C: RemoteDocumentClient,
    L: LargeObjectStore,
    S: SyncStateRepository,
{
    document_client: Arc<C>,
    large_objects: Arc<L>,
    sync_state_repository: Arc<S>,
    threshold_bytes: u64,
    retry_policy: RetryPolicy,
    now_provider: NowProvider,
}

impl<C, L, S> RemoteSyncService<C, L, S>
where
    C: RemoteDocumentClient,
    L: LargeObjectStore,
    S: SyncStateRepository,
{
    pub fn new(document_client: Arc<C>, large_objects: Arc<L>, sync_state_repository: Arc<S>) -> Self {
        Self {
            document_client,
            large_objects,
            sync_state_repository,
            threshold_bytes: DEFAULT_LARGE_PAYLOAD_THRESHOLD_BYTES,
            retry_policy: RetryPolicy::default(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_threshold_bytes(mut self, threshold_bytes: u64) -> Self {
        self.threshold_bytes = threshold_bytes;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn document_client(&self) -> &Arc<C> {
        &self.document_client
    }

    /// Pushes `snapshot`, embedding it unless its encoded size exceeds the threshold.
    pub async fn save_state(
        &self,
        user_id: &str,
        snapshot: &StateSnapshot,
    ) -> Result<SaveReceipt, InfraError> {
        let user_id = normalized_user(user_id)?;
        let encoded = serde_json::to_string(snapshot)?;
        let size_bytes = encoded.len() as u64;

        let document = if size_bytes > self.threshold_bytes {
            self.large_objects.put_object(user_id, &encoded).await?;
            RemoteDocument {
                user_id: user_id.to_string(),
                storage_type: StorageType::LargeObject,
                state_size: size_bytes,
                state: None,
                state_summary: Some(StateSummary::of(&serde_json::to_value(snapshot)?)),
                last_sync: None,
            }
        } else {
            RemoteDocument {
                user_id: user_id.to_string(),
                storage_type: StorageType::Document,
                state_size: size_bytes,
                state: Some(snapshot.clone()),
                state_summary: None,
                last_sync: None,
            }
        };

        let stored = self.put_with_retry(user_id, &document).await?;
        self.sync_state_repository
            .record_push((self.now_provider)())?;
        if let Some(last_sync) = stored.last_sync {
            self.sync_state_repository.record_remote_sync(last_sync)?;
        }

        tracing::info!(
            user_id,
            size_bytes,
            storage_type = ?document.storage_type,
            "pushed state to remote"
        );
        Ok(SaveReceipt {
            storage_type: document.storage_type,
            size_bytes,
            last_sync: stored.last_sync,
        })
    }

    /// `None` when the user has no remote document yet.
    pub async fn load_user_state(&self, user_id: &str) -> Result<Option<LoadedState>, InfraError> {
        let user_id = normalized_user(user_id)?;
        let Some(document) = self.document_client.get_document(user_id).await? else {
            return Ok(None);
        };
        let loaded = self.resolve_remote(user_id, document).await?;
        Ok(Some(loaded))
    }

    /// Turns a pushed document into the snapshot it describes.
    pub async fn resolve_remote(
        &self,
        user_id: &str,
        document: RemoteDocument,
    ) -> Result<LoadedState, InfraError> {
        let snapshot = match document.storage_type {
            StorageType::Document => document.state.ok_or_else(|| {
                InfraError::Remote("remote document has no embedded state".to_string())
            })?,
            StorageType::LargeObject => {
                let payload = self
                    .large_objects
                    .get_object(user_id)
                    .await?
                    .ok_or_else(|| InfraError::NotFound(format!("large object for {user_id}")))?;
                serde_json::from_str(&payload)?
            }
        };
        Ok(LoadedState {
            snapshot,
            storage_type: document.storage_type,
            state_size: document.state_size,
            last_sync: document.last_sync,
        })
    }

    /// True when `last_sync` was already recorded, e.g. the echo of our own push.
    pub fn already_seen(&self, last_sync: Option<DateTime<Utc>>) -> Result<bool, InfraError> {
        let Some(last_sync) = last_sync else {
            return Ok(false);
        };
        let state = self.sync_state_repository.load()?;
        Ok(state
            .last_remote_sync
            .is_some_and(|recorded| last_sync <= recorded))
    }

    pub fn record_remote_sync(&self, last_sync: Option<DateTime<Utc>>) -> Result<(), InfraError> {
        match last_sync {
            Some(last_sync) => self.sync_state_repository.record_remote_sync(last_sync),
            None => Ok(()),
        }
    }

    async fn put_with_retry(
        &self,
        user_id: &str,
        document: &RemoteDocument,
    ) -> Result<RemoteDocument, InfraError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match self.document_client.put_document(user_id, document).await {
                Ok(stored) => return Ok(stored),
                Err(error) if should_retry(&error) && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt as u32));
                    tracing::warn!(attempt, error = %error, "remote save failed, retrying");
                    sleep(TokioDuration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn normalized_user(user_id: &str) -> Result<&str, InfraError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(InfraError::Precondition("no sync user configured".to_string()));
    }
    Ok(user_id)
}

fn should_retry(error: &InfraError) -> bool {
    match error {
        InfraError::Remote(message) => {
            let message = message.to_ascii_lowercase();
            message.contains("network error")
                || message.contains("timeout")
                || message.contains("timed out")
                || message.contains("temporarily unavailable")
                || message.contains("connection reset")
        }
        _ => false,
    }
}
