use crate::application::bootstrap::{bootstrap_workspace, WorkspaceLayout};
use crate::application::remote_sync::{
    decide_apply, ApplyDecision, LoadedState, RemoteSyncService, SyncOutcome,
};
use crate::domain::analytics::{
    format_date, goal_progress, session_totals, sessions_between, summarize, total_time_for_task,
    week_range, AnalyticsRange, AnalyticsSummary, GoalProgress, SessionTotals,
};
use crate::domain::models::{
    Activity, Gap, Holiday, LabelRegistry, Moment, PausedTask, UserSettings, WorkSession,
    DEFAULT_CATEGORIES, GENERAL_PROJECT,
};
use crate::domain::reconciler::{
    apply_edit, check_against_held, detect_gaps, fill_all_gaps, fill_single_gap, preview_gaps_after_edit,
    remove_activity, ActivityEdit, ReconcileError,
};
use crate::domain::tracker::{
    PausedTaskChange, StaleOutcome, StaleSession, StopOutcome, TrackerState, TransitionError,
};
use crate::infrastructure::activity_store::{ActivityStore, LabelDefaults, StateSnapshot};
use crate::infrastructure::config::{
    load_configs_with_env, save_sync_config, ConfigBundle, SyncConfig,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_document_client::{
    LargeObjectStore, RemoteDocumentClient, RemoteEndpoint, ReqwestRemoteDocumentClient,
};
use crate::infrastructure::storage::SqliteKeyValueStore;
use crate::infrastructure::sync_state_repository::{
    SqliteSyncStateRepository, SyncStateRepository,
};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use url::Url;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Documents and large objects both go to the configured HTTP endpoint.
pub type HttpRemoteSyncService = RemoteSyncService<
    ReqwestRemoteDocumentClient,
    ReqwestRemoteDocumentClient,
    SqliteSyncStateRepository,
>;

/// Where a state change came from. Only local changes are pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Local,
    Remote,
}

pub struct AppState {
    layout: WorkspaceLayout,
    config: Mutex<ConfigBundle>,
    timezone: Tz,
    store: ActivityStore,
    tracker: Mutex<TrackerState>,
    stale_session: Mutex<Option<StaleSession>>,
    changes: broadcast::Sender<StateChange>,
    now_provider: NowProvider,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        Self::with_clock(workspace_root, Arc::new(Utc::now))
    }

    pub fn with_clock(workspace_root: PathBuf, now_provider: NowProvider) -> Result<Self, InfraError> {
        let layout = bootstrap_workspace(&workspace_root)?;
        let config = load_configs_with_env(&layout.config_dir)?;
        let timezone = config.app.timezone()?;
        let label_defaults = LabelDefaults {
            projects: LabelRegistry::with_labels(config.labels.default_projects.clone()),
            categories: LabelRegistry::with_labels(config.labels.default_categories.clone()),
        };
        let store = ActivityStore::new(Arc::new(SqliteKeyValueStore::new(&layout.database_path)))
            .with_label_defaults(label_defaults)
            .with_now_provider(Arc::clone(&now_provider));
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        let state = Self {
            layout,
            config: Mutex::new(config),
            timezone,
            store,
            tracker: Mutex::new(TrackerState::NoSession),
            stale_session: Mutex::new(None),
            changes,
            now_provider,
            log_guard: Mutex::new(()),
        };

        let (tracker, stale) = state.restore_tracker()?;
        *lock(&state.tracker, "tracker")? = tracker;
        *lock(&state.stale_session, "stale session")? = stale;
        Ok(state)
    }

    pub fn workspace_root(&self) -> &Path {
        &self.layout.workspace_root
    }

    pub fn config_dir(&self) -> &Path {
        &self.layout.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.layout.database_path
    }

    pub fn store(&self) -> &ActivityStore {
        &self.store
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn sync_config(&self) -> Result<SyncConfig, InfraError> {
        Ok(lock(&self.config, "config")?.sync.clone())
    }

    /// Export of the stored state taken under the tracker lock, so a
    /// transition is never seen half written.
    pub fn snapshot(&self) -> Result<StateSnapshot, InfraError> {
        let _tracker = lock(&self.tracker, "tracker")?;
        Ok(self.store.snapshot())
    }

    /// Receives a notice after every committed change.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.append_log("error", command, message);
    }

    fn append_log(&self, level: &str, command: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.layout.logs_dir.join("commands.log");
        let payload = serde_json::json!({
            "timestamp": (self.now_provider)().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }

    fn moment(&self) -> Moment {
        Moment::at((self.now_provider)(), self.timezone)
    }

    fn today(&self) -> NaiveDate {
        (self.now_provider)()
            .with_timezone(&self.timezone)
            .date_naive()
    }

    fn signal(&self, change: StateChange) {
        let _ = self.changes.send(change);
    }

    /// Rebuilds the tracker from the persisted active keys and settles a
    /// session left open on an earlier day.
    fn restore_tracker(&self) -> Result<(TrackerState, Option<StaleSession>), InfraError> {
        let (active_session, active_activity) = self.store.load_active_state();
        let policy = lock(&self.config, "config")?.app.stale_session_policy;
        let today = format_date(self.today());
        let report = TrackerState::restore(active_session, active_activity, &today, policy);

        if let Some(stale) = &report.stale {
            self.settle_stale(stale)?;
        }
        Ok((report.state, report.stale))
    }

    fn settle_stale(&self, stale: &StaleSession) -> Result<(), InfraError> {
        let identity = stale.session.identity();
        match stale.outcome {
            StaleOutcome::AutoClosed => {
                self.store.upsert_session(&stale.session)?;
                self.store.clear_active_state()?;
                tracing::info!(session = %identity, "auto-closed work session from a previous day");
            }
            StaleOutcome::Discarded => {
                self.store.remove_session(&identity)?;
                self.store.clear_active_state()?;
                tracing::info!(session = %identity, "discarded empty work session from a previous day");
            }
            StaleOutcome::Flagged => {
                tracing::warn!(session = %identity, "work session from a previous day is still open");
            }
            StaleOutcome::LeftOpen => {
                tracing::debug!(session = %identity, "left previous-day work session open");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaleSessionResponse {
    pub identity: String,
    pub date: String,
    pub outcome: StaleOutcome,
}

impl From<&StaleSession> for StaleSessionResponse {
    fn from(stale: &StaleSession) -> Self {
        Self {
            identity: stale.session.identity(),
            date: stale.session.date.clone(),
            outcome: stale.outcome,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStateResponse {
    pub state: String,
    pub session: Option<WorkSession>,
    pub current_activity: Option<Activity>,
    pub totals: SessionTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_session: Option<StaleSessionResponse>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StopActivityResponse {
    /// True when a task stopped and completed/paused must be chosen next.
    pub needs_status: bool,
    pub activity: Activity,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeekViewResponse {
    pub start_date: String,
    pub end_date: String,
    pub sessions: Vec<WorkSession>,
    pub holidays: Vec<Holiday>,
    pub summary: AnalyticsSummary,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FillGapsResponse {
    pub filled: usize,
    pub session: WorkSession,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettingsInput {
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

pub fn get_tracker_state_impl(state: &AppState) -> Result<TrackerStateResponse, InfraError> {
    let tracker = lock(&state.tracker, "tracker")?;
    tracker_response(state, &tracker)
}

pub fn start_work_day_impl(state: &AppState) -> Result<WorkSession, InfraError> {
    let moment = state.moment();
    let session = transition(state, |tracker| tracker.start_work_day(&moment).cloned())?;
    *lock(&state.stale_session, "stale session")? = None;

    state.log_info(
        "start_work_day",
        &format!("started work day {}", session.identity()),
    );
    state.signal(StateChange::Local);
    Ok(session)
}

pub fn start_task_impl(
    state: &AppState,
    description: String,
    project: Option<String>,
    category: Option<String>,
) -> Result<Activity, InfraError> {
    let project = label_or(project, GENERAL_PROJECT);
    let category = label_or(category, DEFAULT_CATEGORIES[0]);
    let moment = state.moment();
    let activity = transition(state, |tracker| {
        tracker
            .start_task(&description, &project, &category, &moment)
            .cloned()
    })?;

    state.log_info("start_task", &format!("started task '{}'", activity.description));
    state.signal(StateChange::Local);
    Ok(activity)
}

pub fn start_break_impl(
    state: &AppState,
    description: Option<String>,
) -> Result<Activity, InfraError> {
    let moment = state.moment();
    let activity = transition(state, |tracker| {
        tracker.start_break(description.as_deref(), &moment).cloned()
    })?;

    state.log_info("start_break", &format!("started break at {}", activity.start_time));
    state.signal(StateChange::Local);
    Ok(activity)
}

pub fn stop_activity_impl(state: &AppState) -> Result<StopActivityResponse, InfraError> {
    let moment = state.moment();
    let outcome = transition(state, |tracker| tracker.stop_activity(&moment))?;
    let response = match outcome {
        StopOutcome::AwaitingStatus(activity) => StopActivityResponse {
            needs_status: true,
            activity,
        },
        StopOutcome::BreakRecorded(activity) => StopActivityResponse {
            needs_status: false,
            activity,
        },
    };

    state.log_info(
        "stop_activity",
        &format!(
            "stopped {} '{}' after {}s",
            response.activity.activity_type.as_str(),
            response.activity.description,
            response.activity.duration
        ),
    );
    state.signal(StateChange::Local);
    Ok(response)
}

pub fn complete_task_impl(state: &AppState) -> Result<TrackerStateResponse, InfraError> {
    let change = transition(state, TrackerState::complete_task)?;
    apply_paused_change(state, change)?;
    state.log_info("complete_task", "marked task completed");
    state.signal(StateChange::Local);
    get_tracker_state_impl(state)
}

pub fn pause_task_impl(state: &AppState) -> Result<TrackerStateResponse, InfraError> {
    let moment = state.moment();
    let change = transition(state, |tracker| tracker.pause_task(&moment))?;
    apply_paused_change(state, change)?;
    state.log_info("pause_task", "paused task");
    state.signal(StateChange::Local);
    get_tracker_state_impl(state)
}

pub fn resume_paused_task_impl(state: &AppState, description: String) -> Result<Activity, InfraError> {
    let description = description.trim();
    let paused = state
        .store
        .find_paused_task(description)
        .ok_or_else(|| InfraError::NotFound(format!("paused task '{description}'")))?;
    let moment = state.moment();
    let activity = transition(state, |tracker| {
        tracker.resume_paused_task(&paused, &moment).cloned()
    })?;
    state.store.remove_paused_task(&paused.description)?;

    state.log_info(
        "resume_paused_task",
        &format!("resumed '{}' with {}s already logged", paused.description, paused.total_time),
    );
    state.signal(StateChange::Local);
    Ok(activity)
}

pub fn end_work_day_impl(state: &AppState) -> Result<WorkSession, InfraError> {
    let moment = state.moment();
    let session = transition(state, |tracker| tracker.end_work_day(&moment).cloned())?;

    state.log_info(
        "end_work_day",
        &format!(
            "ended work day {} with {} activities",
            session.identity(),
            session.activities.len()
        ),
    );
    state.signal(StateChange::Local);
    Ok(session)
}

/// Sessions ordered by date and start, optionally limited to one day.
pub fn list_sessions_impl(
    state: &AppState,
    date: Option<String>,
) -> Result<Vec<WorkSession>, InfraError> {
    let mut sessions = match date {
        Some(date) => {
            let date = parse_date_input(&date)?;
            state.store.sessions_on(&format_date(date))
        }
        None => state.store.load_sessions(),
    };
    sessions.sort_by(|left, right| {
        (left.date.as_str(), left.start_epoch).cmp(&(right.date.as_str(), right.start_epoch))
    });
    Ok(sessions)
}

pub fn list_week_impl(state: &AppState, week_offset: i64) -> Result<WeekViewResponse, InfraError> {
    let (start, end) = week_range(state.today(), week_offset);
    let sessions = state.store.load_sessions();
    let in_week = sessions_between(&sessions, start, end)
        .cloned()
        .collect::<Vec<_>>();
    let (start_date, end_date) = (format_date(start), format_date(end));
    let holidays = state
        .store
        .holidays()
        .into_iter()
        .filter(|holiday| holiday.date >= start_date && holiday.date <= end_date)
        .collect();

    Ok(WeekViewResponse {
        summary: summarize(&in_week, start, end),
        start_date,
        end_date,
        sessions: in_week,
        holidays,
    })
}

pub fn edit_activity_impl(
    state: &AppState,
    session_identity: String,
    index: usize,
    edit: ActivityEdit,
) -> Result<Activity, InfraError> {
    let (_, activity) = change_session(state, &session_identity, |activities| {
        apply_edit(activities, index, edit)
    })?;
    state.log_info(
        "edit_activity",
        &format!(
            "edited '{}' to {}-{}",
            activity.description,
            activity.start_time,
            activity.end_time.as_deref().unwrap_or_default()
        ),
    );
    Ok(activity)
}

pub fn preview_edit_gaps_impl(
    state: &AppState,
    session_identity: String,
    index: usize,
    start_time: String,
    end_time: String,
) -> Result<Vec<Gap>, InfraError> {
    let session = find_session(state, &session_identity)?;
    if index >= session.activities.len() {
        return Err(ReconcileError::ActivityNotFound(index).into());
    }
    Ok(preview_gaps_after_edit(
        &session.activities,
        index,
        &start_time,
        &end_time,
    ))
}

pub fn delete_activity_impl(
    state: &AppState,
    session_identity: String,
    index: usize,
) -> Result<Activity, InfraError> {
    let (_, removed) = change_session(state, &session_identity, |activities| {
        remove_activity(activities, index)
    })?;
    state.log_info(
        "delete_activity",
        &format!("deleted '{}' from {session_identity}", removed.description),
    );
    Ok(removed)
}

/// Deletes a stored session. The session currently being tracked is refused
/// until its day has ended.
pub fn delete_session_impl(state: &AppState, session_identity: String) -> Result<bool, InfraError> {
    let mut tracker = lock(&state.tracker, "tracker")?;
    let is_tracked = tracker
        .session()
        .is_some_and(|session| session.identity() == session_identity);
    if is_tracked {
        if !matches!(&*tracker, TrackerState::Closed { .. }) {
            return Err(InfraError::Precondition(
                "cannot delete the work session in progress".to_string(),
            ));
        }
        *tracker = TrackerState::NoSession;
    }

    let removed = state.store.remove_session(&session_identity)?;
    drop(tracker);
    if removed {
        state.log_info("delete_session", &format!("deleted session {session_identity}"));
        state.signal(StateChange::Local);
    }
    Ok(removed)
}

pub fn list_gaps_impl(state: &AppState, session_identity: String) -> Result<Vec<Gap>, InfraError> {
    let session = find_session(state, &session_identity)?;
    Ok(detect_gaps(&session.activities))
}

pub fn fill_gap_impl(
    state: &AppState,
    session_identity: String,
    start_time: String,
    end_time: String,
) -> Result<Activity, InfraError> {
    let (_, filler) = change_session(state, &session_identity, |activities| {
        fill_single_gap(activities, &start_time, &end_time)
    })?;
    state.log_info(
        "fill_gap",
        &format!("filled {}-{} in {session_identity}", start_time, end_time),
    );
    Ok(filler)
}

pub fn fill_all_gaps_impl(
    state: &AppState,
    session_identity: String,
) -> Result<FillGapsResponse, InfraError> {
    let (session, filled) = change_session(state, &session_identity, |activities| {
        Ok(fill_all_gaps(activities))
    })?;
    state.log_info(
        "fill_all_gaps",
        &format!("filled {filled} gaps in {session_identity}"),
    );
    Ok(FillGapsResponse { filled, session })
}

pub fn list_paused_tasks_impl(state: &AppState) -> Result<Vec<PausedTask>, InfraError> {
    Ok(state.store.paused_tasks())
}

pub fn discard_paused_task_impl(state: &AppState, description: String) -> Result<bool, InfraError> {
    let removed = state.store.remove_paused_task(description.trim())?;
    if removed {
        state.signal(StateChange::Local);
    }
    Ok(removed)
}

/// Seconds logged against a task description across every stored session.
pub fn task_total_time_impl(state: &AppState, description: String) -> Result<i64, InfraError> {
    Ok(total_time_for_task(
        &state.store.load_sessions(),
        description.trim(),
    ))
}

pub fn list_projects_impl(state: &AppState) -> Result<Vec<String>, InfraError> {
    Ok(state.store.projects().labels().to_vec())
}

pub fn add_project_impl(state: &AppState, label: String) -> Result<Vec<String>, InfraError> {
    let registry = state.store.add_project(&label)?;
    labels_changed(state, "add_project", &label, registry)
}

pub fn remove_project_impl(state: &AppState, label: String) -> Result<Vec<String>, InfraError> {
    let registry = state.store.remove_project(&label)?;
    labels_changed(state, "remove_project", &label, registry)
}

pub fn list_categories_impl(state: &AppState) -> Result<Vec<String>, InfraError> {
    Ok(state.store.categories().labels().to_vec())
}

pub fn add_category_impl(state: &AppState, label: String) -> Result<Vec<String>, InfraError> {
    let registry = state.store.add_category(&label)?;
    labels_changed(state, "add_category", &label, registry)
}

pub fn remove_category_impl(state: &AppState, label: String) -> Result<Vec<String>, InfraError> {
    let registry = state.store.remove_category(&label)?;
    labels_changed(state, "remove_category", &label, registry)
}

pub fn list_holidays_impl(state: &AppState) -> Result<Vec<Holiday>, InfraError> {
    Ok(state.store.holidays())
}

pub fn add_holiday_impl(
    state: &AppState,
    date: String,
    name: String,
) -> Result<Vec<Holiday>, InfraError> {
    let date = format_date(parse_date_input(&date)?);
    let holidays = state.store.add_holiday(Holiday { date, name })?;
    state.signal(StateChange::Local);
    Ok(holidays)
}

pub fn remove_holiday_impl(state: &AppState, date: String) -> Result<bool, InfraError> {
    let removed = state.store.remove_holiday(date.trim())?;
    if removed {
        state.signal(StateChange::Local);
    }
    Ok(removed)
}

pub fn get_settings_impl(state: &AppState) -> Result<UserSettings, InfraError> {
    Ok(state.store.settings())
}

pub fn update_settings_impl(
    state: &AppState,
    settings: UserSettings,
) -> Result<UserSettings, InfraError> {
    state.store.save_settings(&settings)?;
    state.log_info(
        "update_settings",
        &format!(
            "goals set to {}h daily and {}h weekly",
            settings.daily_goal_hours, settings.weekly_goal_hours
        ),
    );
    state.signal(StateChange::Local);
    Ok(settings)
}

pub fn analytics_summary_impl(
    state: &AppState,
    range: AnalyticsRange,
) -> Result<AnalyticsSummary, InfraError> {
    let sessions = state.store.load_sessions();
    let (start, end) = range.resolve(state.today(), &sessions);
    Ok(summarize(&sessions, start, end))
}

pub fn goal_progress_impl(state: &AppState) -> Result<GoalProgress, InfraError> {
    Ok(goal_progress(
        &state.store.load_sessions(),
        state.today(),
        &state.store.settings(),
    ))
}

pub fn export_snapshot_impl(state: &AppState) -> Result<StateSnapshot, InfraError> {
    state.snapshot()
}

/// Replaces local state with a remote snapshot when the apply policy allows
/// it. Does not count as a local change, so it is never pushed back.
pub fn apply_remote_snapshot_impl(
    state: &AppState,
    snapshot: &StateSnapshot,
) -> Result<ApplyDecision, InfraError> {
    let policy = lock(&state.config, "config")?.sync.remote_apply_policy;
    let mut tracker = lock(&state.tracker, "tracker")?;
    let local = state.store.last_modified();
    let decision = decide_apply(policy, local, snapshot.last_modified);
    if decision == ApplyDecision::SkipOlder {
        tracing::info!(
            local = ?local,
            remote = ?snapshot.last_modified,
            "skipped remote snapshot older than local state"
        );
        return Ok(decision);
    }

    state.store.apply_snapshot(snapshot)?;
    let (restored, stale) = state.restore_tracker()?;
    *tracker = restored;
    *lock(&state.stale_session, "stale session")? = stale;
    drop(tracker);

    state.log_info(
        "apply_remote_snapshot",
        &format!(
            "applied remote snapshot with {} sessions",
            snapshot.work_sessions.as_ref().map_or(0, Vec::len)
        ),
    );
    state.signal(StateChange::Remote);
    Ok(decision)
}

pub fn get_sync_config_impl(state: &AppState) -> Result<SyncConfig, InfraError> {
    state.sync_config()
}

pub fn configure_sync_impl(
    state: &AppState,
    input: SyncSettingsInput,
) -> Result<SyncConfig, InfraError> {
    let mut config = lock(&state.config, "config")?;
    let mut sync = config.sync.clone();
    sync.enabled = input.enabled;
    sync.endpoint = non_blank(input.endpoint);
    sync.user_id = non_blank(input.user_id);
    save_sync_config(state.config_dir(), &sync)?;
    config.sync = sync.clone();
    drop(config);

    state.log_info(
        "configure_sync",
        &format!("sync {}", if sync.enabled { "enabled" } else { "disabled" }),
    );
    Ok(sync)
}

/// Builds the HTTP-backed sync service for the configured user.
pub fn remote_sync_service(state: &AppState) -> Result<(HttpRemoteSyncService, String), InfraError> {
    let sync = state.sync_config()?;
    let user_id = sync
        .active_user()
        .ok_or_else(|| InfraError::Precondition("sync is disabled or has no user".to_string()))?
        .to_string();
    let endpoint = sync
        .endpoint
        .as_deref()
        .ok_or_else(|| InfraError::InvalidConfig("sync endpoint is not configured".to_string()))?;
    let base_url = Url::parse(endpoint).map_err(|error| {
        InfraError::InvalidConfig(format!("invalid sync endpoint '{endpoint}': {error}"))
    })?;

    let document_client = ReqwestRemoteDocumentClient::new(RemoteEndpoint {
        base_url,
        token: sync.token.clone(),
        poll_interval: Duration::from_secs(sync.poll_interval_seconds),
    });
    let remote = Arc::new(document_client);
    let service = RemoteSyncService::new(
        Arc::clone(&remote),
        remote,
        Arc::new(SqliteSyncStateRepository::new(state.database_path())),
    )
    .with_threshold_bytes(sync.large_payload_threshold_bytes)
    .with_now_provider(Arc::clone(&state.now_provider));
    Ok((service, user_id))
}

pub async fn sync_now_impl(state: &AppState) -> SyncOutcome {
    match remote_sync_service(state) {
        Ok((service, user_id)) => push_state_with(state, &service, &user_id).await,
        Err(error) => failed_outcome(state, "sync_now", &error),
    }
}

pub async fn pull_remote_impl(state: &AppState) -> SyncOutcome {
    match remote_sync_service(state) {
        Ok((service, user_id)) => pull_remote_with(state, &service, &user_id).await,
        Err(error) => failed_outcome(state, "pull_remote", &error),
    }
}

/// Pushes the current snapshot. Failures are logged and reported, never raised.
pub async fn push_state_with<C, L, S>(
    state: &AppState,
    service: &RemoteSyncService<C, L, S>,
    user_id: &str,
) -> SyncOutcome
where
    C: RemoteDocumentClient,
    L: LargeObjectStore,
    S: SyncStateRepository,
{
    let snapshot = match state.snapshot() {
        Ok(snapshot) => snapshot,
        Err(error) => return failed_outcome(state, "push_state", &error),
    };
    match service.save_state(user_id, &snapshot).await {
        Ok(receipt) => {
            state.log_info(
                "push_state",
                &format!(
                    "pushed {} bytes as {:?}",
                    receipt.size_bytes, receipt.storage_type
                ),
            );
            SyncOutcome::saved(&receipt)
        }
        Err(error) => failed_outcome(state, "push_state", &error),
    }
}

pub async fn pull_remote_with<C, L, S>(
    state: &AppState,
    service: &RemoteSyncService<C, L, S>,
    user_id: &str,
) -> SyncOutcome
where
    C: RemoteDocumentClient,
    L: LargeObjectStore,
    S: SyncStateRepository,
{
    let loaded = match service.load_user_state(user_id).await {
        Ok(Some(loaded)) => loaded,
        Ok(None) => return SyncOutcome::pulled(false),
        Err(error) => return failed_outcome(state, "pull_remote", &error),
    };
    match apply_loaded_state(state, service, loaded) {
        Ok(decision) => SyncOutcome::pulled(decision == ApplyDecision::Apply),
        Err(error) => failed_outcome(state, "pull_remote", &error),
    }
}

/// Applies a resolved remote state and remembers its `lastSync`.
pub fn apply_loaded_state<C, L, S>(
    state: &AppState,
    service: &RemoteSyncService<C, L, S>,
    loaded: LoadedState,
) -> Result<ApplyDecision, InfraError>
where
    C: RemoteDocumentClient,
    L: LargeObjectStore,
    S: SyncStateRepository,
{
    let decision = apply_remote_snapshot_impl(state, &loaded.snapshot)?;
    service.record_remote_sync(loaded.last_sync)?;
    Ok(decision)
}

fn failed_outcome(state: &AppState, command: &str, error: &InfraError) -> SyncOutcome {
    tracing::warn!(command, error = %error, "remote sync failed");
    state.log_error(command, &error.to_string());
    SyncOutcome::failed(error)
}

fn lock<'a, T>(mutex: &'a Mutex<T>, name: &str) -> Result<MutexGuard<'a, T>, InfraError> {
    mutex
        .lock()
        .map_err(|error| InfraError::Storage(format!("{name} lock poisoned: {error}")))
}

fn tracker_response(
    state: &AppState,
    tracker: &TrackerState,
) -> Result<TrackerStateResponse, InfraError> {
    let totals = tracker
        .session()
        .map(|session| {
            session_totals(
                session,
                tracker.current_activity(),
                (state.now_provider)().timestamp_millis(),
            )
        })
        .unwrap_or_default();
    let stale_session = lock(&state.stale_session, "stale session")?
        .as_ref()
        .map(StaleSessionResponse::from);

    Ok(TrackerStateResponse {
        state: tracker.label().to_string(),
        session: tracker.session().cloned(),
        current_activity: tracker.current_activity().cloned(),
        totals,
        stale_session,
    })
}

/// Runs a transition on a copy and swaps it in once the store accepted it.
fn transition<T, F>(state: &AppState, change: F) -> Result<T, InfraError>
where
    F: FnOnce(&mut TrackerState) -> Result<T, TransitionError>,
{
    let mut tracker = lock(&state.tracker, "tracker")?;
    let mut next = tracker.clone();
    let outcome = change(&mut next)?;
    commit_tracker(state, &next)?;
    *tracker = next;
    Ok(outcome)
}

fn commit_tracker(state: &AppState, tracker: &TrackerState) -> Result<(), InfraError> {
    if let Some(session) = tracker.session() {
        state.store.upsert_session(session)?;
    }
    let (session, activity) = tracker.active_parts();
    state.store.persist_active_state(session, activity)
}

/// Edits a stored session; the tracked session follows when it is the one
/// edited. The activity the tracker still holds bounds the edit as well.
fn change_session<T, F>(
    state: &AppState,
    session_identity: &str,
    change: F,
) -> Result<(WorkSession, T), InfraError>
where
    F: FnOnce(&mut Vec<Activity>) -> Result<T, ReconcileError>,
{
    let mut tracker = lock(&state.tracker, "tracker")?;
    let held = tracker
        .session()
        .filter(|session| session.identity() == session_identity)
        .and_then(|_| tracker.current_activity())
        .cloned();
    let (updated, outcome) = state.store.update_session_activities(session_identity, |activities| {
        let before = activities.clone();
        let outcome = change(activities)?;
        if let Some(held) = &held {
            check_against_held(&before, activities, held)?;
        }
        Ok(outcome)
    })?;

    if let Some(session) = tracker
        .session_mut()
        .filter(|session| session.identity() == session_identity)
    {
        session.activities = updated.activities.clone();
        let (session, activity) = tracker.active_parts();
        state.store.persist_active_state(session, activity)?;
    }
    drop(tracker);

    state.signal(StateChange::Local);
    Ok((updated, outcome))
}

fn apply_paused_change(state: &AppState, change: PausedTaskChange) -> Result<(), InfraError> {
    match change {
        PausedTaskChange::Upsert(paused) => state.store.upsert_paused_task(paused),
        PausedTaskChange::Remove(description) => {
            state.store.remove_paused_task(&description).map(|_| ())
        }
    }
}

fn labels_changed(
    state: &AppState,
    command: &str,
    label: &str,
    registry: LabelRegistry,
) -> Result<Vec<String>, InfraError> {
    state.log_info(command, label.trim());
    state.signal(StateChange::Local);
    Ok(registry.labels().to_vec())
}

fn find_session(state: &AppState, session_identity: &str) -> Result<WorkSession, InfraError> {
    state
        .store
        .find_session(session_identity)
        .ok_or_else(|| InfraError::NotFound(format!("session {session_identity}")))
}

fn parse_date_input(value: &str) -> Result<NaiveDate, InfraError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|error| InfraError::Validation(format!("invalid date '{value}': {error}")))
}

fn label_or(value: Option<String>, fallback: &str) -> String {
    non_blank(value).unwrap_or_else(|| fallback.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::{TempWorkspace, TestClock};
    use crate::domain::models::{ActivityType, TaskStatus};
    use crate::infrastructure::remote_document_client::{InMemoryRemoteStore, StorageType};
    use crate::infrastructure::sync_state_repository::InMemorySyncStateRepository;
    use std::fs;

    const MONDAY_NINE: &str = "2026-02-16T09:00:00Z";

    fn run_task(state: &AppState, clock: &TestClock, description: &str, minutes: i64) {
        start_task_impl(state, description.to_string(), None, None).expect("start task");
        clock.advance_minutes(minutes);
        let stopped = stop_activity_impl(state).expect("stop task");
        assert!(stopped.needs_status);
        complete_task_impl(state).expect("complete task");
    }

    fn in_memory_service(
        remote: Arc<InMemoryRemoteStore>,
    ) -> RemoteSyncService<InMemoryRemoteStore, InMemoryRemoteStore, InMemorySyncStateRepository>
    {
        RemoteSyncService::new(
            Arc::clone(&remote),
            remote,
            Arc::new(InMemorySyncStateRepository::default()),
        )
    }

    #[test]
    fn full_work_day_flow() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);

        let session = start_work_day_impl(&state).expect("start day");
        assert_eq!(session.date, "2026-02-16");
        assert_eq!(session.start_time, "09:00:00");

        run_task(&state, &clock, "Write report", 60);
        start_break_impl(&state, None).expect("start break");
        clock.advance_minutes(15);
        let stopped = stop_activity_impl(&state).expect("stop break");
        assert!(!stopped.needs_status);
        assert_eq!(stopped.activity.duration, 15 * 60);

        let ended = end_work_day_impl(&state).expect("end day");
        assert_eq!(ended.end_time.as_deref(), Some("10:15:00"));
        assert_eq!(ended.activities.len(), 2);
        assert_eq!(ended.activities[0].status, Some(TaskStatus::Completed));

        let sessions = list_sessions_impl(&state, None).expect("list sessions");
        assert_eq!(sessions, vec![ended]);
        assert_eq!(state.store().load_active_state(), (None, None));
        assert_eq!(
            get_tracker_state_impl(&state).expect("tracker").state,
            "closed"
        );

        let log = fs::read_to_string(workspace.path().join("logs").join("commands.log"))
            .expect("command log");
        assert!(log.contains("stopped task 'Write report' after 3600s"));
        assert!(log.contains("stopped break"));
    }

    #[test]
    fn end_work_day_without_activities_is_refused() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);

        start_work_day_impl(&state).expect("start day");
        assert!(matches!(
            end_work_day_impl(&state),
            Err(InfraError::Precondition(_))
        ));
        assert!(matches!(
            stop_activity_impl(&state),
            Err(InfraError::Precondition(_))
        ));
    }

    #[test]
    fn running_activity_survives_restart() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);
        start_work_day_impl(&state).expect("start day");
        let started =
            start_task_impl(&state, "Deep work".to_string(), Some("SNS Tech".to_string()), None)
                .expect("start task");
        drop(state);

        clock.advance_minutes(30);
        let reopened = workspace.app_state(&clock);
        let tracker = get_tracker_state_impl(&reopened).expect("tracker");
        assert_eq!(tracker.state, "running");
        assert_eq!(tracker.current_activity, Some(started));
        assert_eq!(tracker.totals.work_seconds, 30 * 60);
    }

    #[test]
    fn pause_and_resume_accumulate_in_paused_list() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);
        start_work_day_impl(&state).expect("start day");

        start_task_impl(&state, "Refactor".to_string(), None, None).expect("start task");
        clock.advance_minutes(30);
        stop_activity_impl(&state).expect("stop");
        pause_task_impl(&state).expect("pause");
        let paused = list_paused_tasks_impl(&state).expect("paused");
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].total_time, 1800);

        let resumed = resume_paused_task_impl(&state, "Refactor".to_string()).expect("resume");
        assert!(resumed.is_resumed);
        assert!(list_paused_tasks_impl(&state).expect("paused").is_empty());

        clock.advance_minutes(20);
        stop_activity_impl(&state).expect("stop");
        pause_task_impl(&state).expect("pause again");
        let paused = list_paused_tasks_impl(&state).expect("paused");
        assert_eq!(paused[0].total_time, 1800 + 1200);
        assert_eq!(
            task_total_time_impl(&state, "Refactor".to_string()).expect("total"),
            3000
        );

        assert!(matches!(
            resume_paused_task_impl(&state, "Unknown".to_string()),
            Err(InfraError::NotFound(_))
        ));
    }

    #[test]
    fn gaps_are_listed_and_filled_on_the_tracked_session() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);
        let session = start_work_day_impl(&state).expect("start day");

        run_task(&state, &clock, "Morning", 60);
        clock.advance_minutes(30);
        run_task(&state, &clock, "Late morning", 30);

        let gaps = list_gaps_impl(&state, session.identity()).expect("gaps");
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_time, "10:00:00");
        assert_eq!(gaps[0].end_time, "10:30:00");

        let filled = fill_all_gaps_impl(&state, session.identity()).expect("fill");
        assert_eq!(filled.filled, 1);
        assert_eq!(filled.session.activities.len(), 3);
        assert!(list_gaps_impl(&state, session.identity()).expect("gaps").is_empty());

        let tracker = get_tracker_state_impl(&state).expect("tracker");
        assert_eq!(
            tracker.session.map(|session| session.activities.len()),
            Some(3)
        );
    }

    #[test]
    fn edits_reject_overlaps_and_reach_the_tracker() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);
        let session = start_work_day_impl(&state).expect("start day");
        run_task(&state, &clock, "First", 60);
        run_task(&state, &clock, "Second", 60);

        let overlapping = ActivityEdit {
            activity_type: ActivityType::Task,
            description: "First".to_string(),
            project: "General".to_string(),
            category: "Other".to_string(),
            start_time: "09:00".to_string(),
            end_time: "10:30".to_string(),
        };
        assert!(matches!(
            edit_activity_impl(&state, session.identity(), 0, overlapping.clone()),
            Err(InfraError::Validation(_))
        ));

        let preview = preview_edit_gaps_impl(
            &state,
            session.identity(),
            0,
            "09:00".to_string(),
            "09:45".to_string(),
        )
        .expect("preview");
        assert_eq!(preview.len(), 1);

        let edited = edit_activity_impl(
            &state,
            session.identity(),
            0,
            ActivityEdit {
                end_time: "09:45".to_string(),
                ..overlapping
            },
        )
        .expect("edit");
        assert_eq!(edited.end_time.as_deref(), Some("09:45:00"));
        assert_eq!(edited.duration, 45 * 60);

        let tracked = get_tracker_state_impl(&state)
            .expect("tracker")
            .session
            .expect("tracked session");
        assert_eq!(tracked.activities[0].duration, 45 * 60);

        let removed = delete_activity_impl(&state, session.identity(), 1).expect("delete");
        assert_eq!(removed.description, "Second");
        assert!(matches!(
            delete_activity_impl(&state, session.identity(), 5),
            Err(InfraError::NotFound(_))
        ));
    }

    #[test]
    fn edits_cannot_reach_into_the_running_activity() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);
        let session = start_work_day_impl(&state).expect("start day");
        run_task(&state, &clock, "First", 60);
        start_task_impl(&state, "Second".to_string(), None, None).expect("start second");
        clock.advance_minutes(60);

        let stretched = ActivityEdit {
            activity_type: ActivityType::Task,
            description: "First".to_string(),
            project: "General".to_string(),
            category: "Other".to_string(),
            start_time: "09:00".to_string(),
            end_time: "10:30".to_string(),
        };
        assert!(matches!(
            edit_activity_impl(&state, session.identity(), 0, stretched.clone()),
            Err(InfraError::Validation(_))
        ));
        assert!(matches!(
            fill_gap_impl(
                &state,
                session.identity(),
                "10:15".to_string(),
                "10:45".to_string()
            ),
            Err(InfraError::Validation(_))
        ));

        let stopped = stop_activity_impl(&state).expect("stop second");
        assert!(stopped.needs_status);
        assert!(matches!(
            edit_activity_impl(&state, session.identity(), 0, stretched.clone()),
            Err(InfraError::Validation(_))
        ));
        complete_task_impl(&state).expect("complete second");

        let stored = state
            .store()
            .find_session(&session.identity())
            .expect("stored session");
        let times = stored
            .activities
            .iter()
            .map(|activity| (activity.start_time.as_str(), activity.end_time.as_deref()))
            .collect::<Vec<_>>();
        assert_eq!(
            times,
            vec![("09:00:00", Some("10:00:00")), ("10:00:00", Some("11:00:00"))]
        );

        edit_activity_impl(
            &state,
            session.identity(),
            0,
            ActivityEdit {
                end_time: "09:45".to_string(),
                ..stretched
            },
        )
        .expect("edit clear of the running activity");
    }

    #[test]
    fn snapshot_waits_for_a_transition_in_progress() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);
        start_work_day_impl(&state).expect("start day");

        let tracker = lock(&state.tracker, "tracker").expect("tracker lock");
        std::thread::scope(|scope| {
            let reader = scope.spawn(|| export_snapshot_impl(&state));
            std::thread::sleep(Duration::from_millis(50));
            assert!(!reader.is_finished());

            drop(tracker);
            let snapshot = reader
                .join()
                .expect("reader joins")
                .expect("snapshot");
            assert!(snapshot.active_session.is_some());
        });
    }

    #[test]
    fn tracked_session_cannot_be_deleted_until_closed() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);
        let session = start_work_day_impl(&state).expect("start day");
        run_task(&state, &clock, "Only task", 10);

        assert!(matches!(
            delete_session_impl(&state, session.identity()),
            Err(InfraError::Precondition(_))
        ));
        end_work_day_impl(&state).expect("end day");
        assert!(delete_session_impl(&state, session.identity()).expect("delete"));
        assert!(list_sessions_impl(&state, None).expect("list").is_empty());
        assert_eq!(
            get_tracker_state_impl(&state).expect("tracker").state,
            "no_session"
        );
    }

    #[test]
    fn auto_close_policy_settles_previous_day_on_start() {
        let workspace = TempWorkspace::new();
        let config_dir = workspace.path().join("config");
        fs::create_dir_all(&config_dir).expect("config dir");
        fs::write(
            config_dir.join("app.json"),
            r#"{"schema": 1, "timezone": "UTC", "staleSessionPolicy": "auto_close"}"#,
        )
        .expect("write app config");

        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);
        let session = start_work_day_impl(&state).expect("start day");
        run_task(&state, &clock, "Forgot to end", 60);
        start_task_impl(&state, "Still running".to_string(), None, None).expect("start");
        drop(state);

        clock.advance_minutes(24 * 60);
        let next_day = workspace.app_state(&clock);
        let tracker = get_tracker_state_impl(&next_day).expect("tracker");
        assert_eq!(tracker.state, "no_session");
        let stale = tracker.stale_session.expect("stale session reported");
        assert_eq!(stale.outcome, StaleOutcome::AutoClosed);
        assert_eq!(stale.identity, session.identity());

        let stored = next_day
            .store()
            .find_session(&session.identity())
            .expect("stored session");
        assert_eq!(stored.activities.len(), 2);
        assert_eq!(stored.end_time.as_deref(), Some("10:00:00"));
        assert_eq!(next_day.store().load_active_state(), (None, None));
    }

    #[test]
    fn labels_holidays_and_settings_signal_changes() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);
        let mut changes = state.subscribe_changes();

        let projects = add_project_impl(&state, "Client A".to_string()).expect("add project");
        assert!(projects.contains(&"Client A".to_string()));
        assert_eq!(changes.try_recv().expect("signal"), StateChange::Local);

        assert!(add_category_impl(&state, "  ".to_string()).is_err());
        assert!(matches!(
            remove_category_impl(&state, "Missing".to_string()),
            Err(InfraError::NotFound(_))
        ));

        let holidays =
            add_holiday_impl(&state, "2026-02-18".to_string(), "Founders Day".to_string())
                .expect("add holiday");
        assert_eq!(holidays.len(), 1);
        assert!(add_holiday_impl(&state, "18/02/2026".to_string(), "Bad".to_string()).is_err());

        let week = list_week_impl(&state, 0).expect("week");
        assert_eq!(week.start_date, "2026-02-16");
        assert_eq!(week.end_date, "2026-02-22");
        assert_eq!(week.holidays.len(), 1);

        let mut settings = get_settings_impl(&state).expect("settings");
        settings.daily_goal_hours = 6.0;
        update_settings_impl(&state, settings).expect("update settings");
        assert_eq!(goal_progress_impl(&state).expect("goals").daily_goal_hours, 6.0);
        settings = get_settings_impl(&state).expect("settings");
        settings.weekly_goal_hours = 0.0;
        assert!(update_settings_impl(&state, settings).is_err());
    }

    #[test]
    fn analytics_cover_finished_sessions() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);
        start_work_day_impl(&state).expect("start day");
        run_task(&state, &clock, "Planning", 90);
        end_work_day_impl(&state).expect("end day");

        let summary = analytics_summary_impl(&state, AnalyticsRange::CurrentWeek).expect("summary");
        assert_eq!(summary.total_work_seconds, 90 * 60);
        assert_eq!(summary.completed_tasks, 1);
        assert_eq!(summary.top_project.as_deref(), Some("General"));
    }

    #[test]
    fn older_remote_snapshot_is_skipped_and_newer_one_applied() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);
        add_project_impl(&state, "Local only".to_string()).expect("add project");
        let mut changes = state.subscribe_changes();

        let mut remote = StateSnapshot {
            custom_projects: Some(LabelRegistry::with_labels(["Remote"])),
            last_modified: Some(clock.now() - chrono::Duration::minutes(5)),
            ..StateSnapshot::default()
        };
        assert_eq!(
            apply_remote_snapshot_impl(&state, &remote).expect("apply"),
            ApplyDecision::SkipOlder
        );
        assert!(state.store().projects().contains("Local only"));

        remote.last_modified = Some(clock.now() + chrono::Duration::minutes(5));
        assert_eq!(
            apply_remote_snapshot_impl(&state, &remote).expect("apply"),
            ApplyDecision::Apply
        );
        assert_eq!(list_projects_impl(&state).expect("projects"), vec!["Remote"]);
        assert_eq!(changes.try_recv().expect("signal"), StateChange::Remote);
    }

    #[test]
    fn remote_snapshot_restores_running_activity() {
        let source_workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let source = source_workspace.app_state(&clock);
        start_work_day_impl(&source).expect("start day");
        start_task_impl(&source, "On laptop".to_string(), None, None).expect("start task");
        let snapshot = export_snapshot_impl(&source).expect("snapshot");

        let target_workspace = TempWorkspace::new();
        let target = target_workspace.app_state(&clock);
        apply_remote_snapshot_impl(&target, &snapshot).expect("apply");

        let tracker = get_tracker_state_impl(&target).expect("tracker");
        assert_eq!(tracker.state, "running");
        assert_eq!(
            tracker.current_activity.map(|activity| activity.description),
            Some("On laptop".to_string())
        );
    }

    #[tokio::test]
    async fn sync_now_reports_missing_configuration() {
        let workspace = TempWorkspace::new();
        let clock = TestClock::at(MONDAY_NINE);
        let state = workspace.app_state(&clock);

        let outcome = sync_now_impl(&state).await;
        assert!(!outcome.success);
        assert!(outcome.error.expect("error message").contains("sync is disabled"));

        configure_sync_impl(
            &state,
            SyncSettingsInput {
                enabled: true,
                endpoint: Some("not a url".to_string()),
                user_id: Some("user-1".to_string()),
            },
        )
        .expect_err("invalid endpoint rejected");
        let saved = configure_sync_impl(
            &state,
            SyncSettingsInput {
                enabled: true,
                endpoint: Some("https://sync.example.com/api".to_string()),
                user_id: Some(" user-1 ".to_string()),
            },
        )
        .expect("configure sync");
        assert_eq!(saved.active_user(), Some("user-1"));
        assert!(remote_sync_service(&state).is_ok());
    }

    #[tokio::test]
    async fn push_then_pull_replicates_sessions() {
        let remote = Arc::new(InMemoryRemoteStore::default());
        let clock = TestClock::at(MONDAY_NINE);

        let laptop_workspace = TempWorkspace::new();
        let laptop = laptop_workspace.app_state(&clock);
        start_work_day_impl(&laptop).expect("start day");
        run_task(&laptop, &clock, "Shared", 45);
        end_work_day_impl(&laptop).expect("end day");

        let pushed = push_state_with(&laptop, &in_memory_service(Arc::clone(&remote)), "user-1").await;
        assert!(pushed.success);

        let desktop_workspace = TempWorkspace::new();
        let desktop = desktop_workspace.app_state(&clock);
        let pulled =
            pull_remote_with(&desktop, &in_memory_service(Arc::clone(&remote)), "user-1").await;
        assert_eq!(pulled.applied, Some(true));
        assert_eq!(
            list_sessions_impl(&desktop, None).expect("list"),
            list_sessions_impl(&laptop, None).expect("list")
        );

        let missing = pull_remote_with(&desktop, &in_memory_service(remote), "user-2").await;
        assert_eq!(missing.applied, Some(false));
    }

    #[tokio::test]
    async fn oversized_snapshot_reaches_another_device() {
        let remote = Arc::new(InMemoryRemoteStore::default());
        let clock = TestClock::at(MONDAY_NINE);

        let laptop_workspace = TempWorkspace::new();
        let laptop = laptop_workspace.app_state(&clock);
        start_work_day_impl(&laptop).expect("start day");
        run_task(&laptop, &clock, "Large", 30);

        let laptop_service = in_memory_service(Arc::clone(&remote)).with_threshold_bytes(64);
        let pushed = push_state_with(&laptop, &laptop_service, "user-1").await;
        assert!(pushed.success);
        assert_eq!(pushed.storage_type, Some(StorageType::LargeObject));
        let document = remote
            .get_document("user-1")
            .await
            .expect("get document")
            .expect("document stored");
        assert!(document.state.is_none());
        assert!(document.state_summary.is_some());

        let desktop_workspace = TempWorkspace::new();
        let desktop = desktop_workspace.app_state(&clock);
        let desktop_service = in_memory_service(Arc::clone(&remote)).with_threshold_bytes(64);
        let pulled = pull_remote_with(&desktop, &desktop_service, "user-1").await;
        assert!(pulled.success, "{:?}", pulled.error);
        assert_eq!(pulled.applied, Some(true));
        assert_eq!(
            list_sessions_impl(&desktop, None).expect("list"),
            list_sessions_impl(&laptop, None).expect("list")
        );
    }
}
