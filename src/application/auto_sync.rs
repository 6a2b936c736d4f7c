use crate::application::commands::{
    apply_loaded_state, pull_remote_with, push_state_with, remote_sync_service, AppState, StateChange,
};
use crate::application::remote_sync::RemoteSyncService;
use crate::infrastructure::config::SyncConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_document_client::{
    LargeObjectStore, RemoteDocument, RemoteDocumentClient,
};
use crate::infrastructure::sync_state_repository::SyncStateRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const COMMAND: &str = "auto_sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSyncSettings {
    pub interval: Duration,
    pub debounce: Duration,
}

impl AutoSyncSettings {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            interval: Duration::from_secs(sync.auto_sync_interval_seconds.max(1)),
            debounce: Duration::from_millis(sync.auto_save_debounce_ms),
        }
    }
}

/// Pulls the remote state once, then starts auto-sync against the
/// configured HTTP endpoint.
pub async fn start_configured_auto_sync(
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, InfraError> {
    let settings = AutoSyncSettings::from_config(&state.sync_config()?);
    let (service, user_id) = remote_sync_service(&state)?;
    let pulled = pull_remote_with(&state, &service, &user_id).await;
    tracing::info!(success = pulled.success, applied = ?pulled.applied, "initial remote pull finished");
    Ok(spawn_auto_sync(state, Arc::new(service), user_id, settings, cancel).await)
}

/// Subscribes to local changes and to the remote document, then runs the
/// sync loop on its own task until `cancel` fires.
pub async fn spawn_auto_sync<C, L, S>(
    state: Arc<AppState>,
    service: Arc<RemoteSyncService<C, L, S>>,
    user_id: String,
    settings: AutoSyncSettings,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    C: RemoteDocumentClient + 'static,
    L: LargeObjectStore + 'static,
    S: SyncStateRepository + 'static,
{
    let changes = state.subscribe_changes();
    let remote = match service.document_client().subscribe(&user_id).await {
        Ok(receiver) => Some(receiver),
        Err(error) => {
            tracing::warn!(user_id = %user_id, error = %error, "remote subscription unavailable");
            state.log_error(COMMAND, &format!("remote subscription unavailable: {error}"));
            None
        }
    };

    tokio::spawn(run_loop(
        state, service, user_id, settings, changes, remote, cancel,
    ))
}

async fn run_loop<C, L, S>(
    state: Arc<AppState>,
    service: Arc<RemoteSyncService<C, L, S>>,
    user_id: String,
    settings: AutoSyncSettings,
    mut changes: broadcast::Receiver<StateChange>,
    mut remote: Option<broadcast::Receiver<RemoteDocument>>,
    cancel: CancellationToken,
) where
    C: RemoteDocumentClient,
    L: LargeObjectStore,
    S: SyncStateRepository,
{
    let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let debounce = sleep(settings.debounce);
    tokio::pin!(debounce);
    let mut pending = false;

    tracing::info!(user_id = %user_id, "auto-sync started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                pending = false;
                push(&state, &service, &user_id, "periodic").await;
            }
            _ = &mut debounce, if pending => {
                pending = false;
                push(&state, &service, &user_id, "debounced").await;
            }
            change = changes.recv() => match change {
                Ok(StateChange::Local) | Err(RecvError::Lagged(_)) => {
                    pending = true;
                    debounce.as_mut().reset(Instant::now() + settings.debounce);
                }
                Ok(StateChange::Remote) => {}
                Err(RecvError::Closed) => break,
            },
            document = next_document(&mut remote) => match document {
                Some(document) => handle_remote(&state, &service, &user_id, document).await,
                None => {
                    tracing::warn!(user_id = %user_id, "remote subscription closed");
                    remote = None;
                }
            },
        }
    }
    tracing::info!(user_id = %user_id, "auto-sync stopped");
}

async fn push<C, L, S>(
    state: &AppState,
    service: &RemoteSyncService<C, L, S>,
    user_id: &str,
    trigger: &str,
) where
    C: RemoteDocumentClient,
    L: LargeObjectStore,
    S: SyncStateRepository,
{
    let outcome = push_state_with(state, service, user_id).await;
    tracing::debug!(trigger, success = outcome.success, "auto-sync push finished");
}

/// Waits for the next remote document; never resolves without a subscription.
async fn next_document(
    remote: &mut Option<broadcast::Receiver<RemoteDocument>>,
) -> Option<RemoteDocument> {
    let Some(receiver) = remote.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(document) => return Some(document),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "remote subscription lagged");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn handle_remote<C, L, S>(
    state: &AppState,
    service: &RemoteSyncService<C, L, S>,
    user_id: &str,
    document: RemoteDocument,
) where
    C: RemoteDocumentClient,
    L: LargeObjectStore,
    S: SyncStateRepository,
{
    match service.already_seen(document.last_sync) {
        Ok(true) => {
            tracing::debug!(last_sync = ?document.last_sync, "ignored remote document already seen");
            return;
        }
        Ok(false) => {}
        Err(error) => {
            report_failure(state, &error);
            return;
        }
    }

    let result = match service.resolve_remote(user_id, document).await {
        Ok(loaded) => apply_loaded_state(state, service, loaded),
        Err(error) => Err(error),
    };
    match result {
        Ok(decision) => tracing::info!(decision = ?decision, "handled remote document"),
        Err(error) => report_failure(state, &error),
    }
}

fn report_failure(state: &AppState, error: &InfraError) {
    tracing::warn!(error = %error, "failed to apply remote document");
    state.log_error(COMMAND, &error.to_string());
}
