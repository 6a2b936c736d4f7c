use crate::domain::models::{
    Activity, Holiday, LabelRegistry, PausedTask, UserSettings, WorkSession,
};
use crate::domain::reconciler::{sort_by_start, ReconcileError};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::{load_json, save_json, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const WORK_SESSIONS_KEY: &str = "workSessions";
pub const PAUSED_TASKS_KEY: &str = "pausedTasks";
pub const CUSTOM_PROJECTS_KEY: &str = "customProjects";
pub const CUSTOM_CATEGORIES_KEY: &str = "customCategories";
pub const HOLIDAYS_KEY: &str = "holidays";
pub const SETTINGS_KEY: &str = "settings";
pub const ACTIVE_SESSION_KEY: &str = "activeSession";
pub const ACTIVE_ACTIVITY_KEY: &str = "activeActivity";
pub const LAST_MODIFIED_KEY: &str = "lastModified";

pub const SNAPSHOT_VERSION: &str = "1.0.0";

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Everything that travels to and from the remote document. Absent
/// collections are left untouched when a snapshot is applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(default)]
    pub work_sessions: Option<Vec<WorkSession>>,
    #[serde(default)]
    pub active_session: Option<WorkSession>,
    #[serde(default)]
    pub active_activity: Option<Activity>,
    #[serde(default)]
    pub custom_projects: Option<LabelRegistry>,
    #[serde(default)]
    pub custom_categories: Option<LabelRegistry>,
    #[serde(default)]
    pub holidays: Option<Vec<Holiday>>,
    #[serde(default)]
    pub paused_tasks: Option<Vec<PausedTask>>,
    #[serde(default)]
    pub settings: Option<UserSettings>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelDefaults {
    pub projects: LabelRegistry,
    pub categories: LabelRegistry,
}

impl Default for LabelDefaults {
    fn default() -> Self {
        Self {
            projects: LabelRegistry::default_projects(),
            categories: LabelRegistry::default_categories(),
        }
    }
}

pub struct ActivityStore {
    kv: Arc<dyn KeyValueStore>,
    label_defaults: LabelDefaults,
    now_provider: NowProvider,
}

impl ActivityStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            label_defaults: LabelDefaults::default(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_label_defaults(mut self, label_defaults: LabelDefaults) -> Self {
        self.label_defaults = label_defaults;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn load_sessions(&self) -> Vec<WorkSession> {
        load_json(self.kv.as_ref(), WORK_SESSIONS_KEY, Vec::new())
    }

    /// Replaces the session with the same identity, or appends it.
    pub fn upsert_session(&self, session: &WorkSession) -> Result<(), InfraError> {
        session.validate().map_err(InfraError::Validation)?;
        let mut sessions = self.load_sessions();
        let identity = session.identity();
        match sessions
            .iter_mut()
            .find(|candidate| candidate.identity() == identity)
        {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        self.write(WORK_SESSIONS_KEY, &sessions)
    }

    pub fn find_session(&self, identity: &str) -> Option<WorkSession> {
        self.load_sessions()
            .into_iter()
            .find(|session| session.identity() == identity)
    }

    pub fn sessions_on(&self, date: &str) -> Vec<WorkSession> {
        self.load_sessions()
            .into_iter()
            .filter(|session| session.date == date)
            .collect()
    }

    pub fn remove_session(&self, identity: &str) -> Result<bool, InfraError> {
        let mut sessions = self.load_sessions();
        let before = sessions.len();
        sessions.retain(|session| session.identity() != identity);
        if sessions.len() == before {
            return Ok(false);
        }
        self.write(WORK_SESSIONS_KEY, &sessions)?;
        Ok(true)
    }

    /// Runs `change` against a stored session's activities and commits the
    /// result only when it succeeds.
    pub fn update_session_activities<T, F>(
        &self,
        identity: &str,
        change: F,
    ) -> Result<(WorkSession, T), InfraError>
    where
        F: FnOnce(&mut Vec<Activity>) -> Result<T, ReconcileError>,
    {
        let mut sessions = self.load_sessions();
        let session = sessions
            .iter_mut()
            .find(|session| session.identity() == identity)
            .ok_or_else(|| InfraError::NotFound(format!("session {identity}")))?;

        let mut activities = session.activities.clone();
        let outcome = change(&mut activities)?;
        sort_by_start(&mut activities);
        session.activities = activities;
        session.validate().map_err(InfraError::Validation)?;
        let updated = session.clone();

        self.write(WORK_SESSIONS_KEY, &sessions)?;
        Ok((updated, outcome))
    }

    pub fn load_active_state(&self) -> (Option<WorkSession>, Option<Activity>) {
        (
            load_json(self.kv.as_ref(), ACTIVE_SESSION_KEY, None),
            load_json(self.kv.as_ref(), ACTIVE_ACTIVITY_KEY, None),
        )
    }

    pub fn persist_active_state(
        &self,
        session: Option<&WorkSession>,
        activity: Option<&Activity>,
    ) -> Result<(), InfraError> {
        match session {
            Some(session) => save_json(self.kv.as_ref(), ACTIVE_SESSION_KEY, session)?,
            None => self.kv.remove(ACTIVE_SESSION_KEY)?,
        }
        match activity {
            Some(activity) => save_json(self.kv.as_ref(), ACTIVE_ACTIVITY_KEY, activity)?,
            None => self.kv.remove(ACTIVE_ACTIVITY_KEY)?,
        }
        self.touch()
    }

    pub fn clear_active_state(&self) -> Result<(), InfraError> {
        self.persist_active_state(None, None)
    }

    pub fn paused_tasks(&self) -> Vec<PausedTask> {
        load_json(self.kv.as_ref(), PAUSED_TASKS_KEY, Vec::new())
    }

    pub fn find_paused_task(&self, description: &str) -> Option<PausedTask> {
        self.paused_tasks()
            .into_iter()
            .find(|task| task.description == description)
    }

    pub fn upsert_paused_task(&self, paused: PausedTask) -> Result<(), InfraError> {
        let mut tasks = self.paused_tasks();
        match tasks
            .iter_mut()
            .find(|task| task.description == paused.description)
        {
            Some(existing) => *existing = paused,
            None => tasks.push(paused),
        }
        self.write(PAUSED_TASKS_KEY, &tasks)
    }

    pub fn remove_paused_task(&self, description: &str) -> Result<bool, InfraError> {
        let mut tasks = self.paused_tasks();
        let before = tasks.len();
        tasks.retain(|task| task.description != description);
        if tasks.len() == before {
            return Ok(false);
        }
        self.write(PAUSED_TASKS_KEY, &tasks)?;
        Ok(true)
    }

    pub fn projects(&self) -> LabelRegistry {
        load_json(
            self.kv.as_ref(),
            CUSTOM_PROJECTS_KEY,
            self.label_defaults.projects.clone(),
        )
    }

    pub fn categories(&self) -> LabelRegistry {
        load_json(
            self.kv.as_ref(),
            CUSTOM_CATEGORIES_KEY,
            self.label_defaults.categories.clone(),
        )
    }

    pub fn add_project(&self, label: &str) -> Result<LabelRegistry, InfraError> {
        self.change_labels(CUSTOM_PROJECTS_KEY, self.projects(), |registry| {
            registry.add(label).map_err(InfraError::Validation)
        })
    }

    pub fn remove_project(&self, label: &str) -> Result<LabelRegistry, InfraError> {
        self.change_labels(CUSTOM_PROJECTS_KEY, self.projects(), |registry| {
            remove_label(registry, label)
        })
    }

    pub fn add_category(&self, label: &str) -> Result<LabelRegistry, InfraError> {
        self.change_labels(CUSTOM_CATEGORIES_KEY, self.categories(), |registry| {
            registry.add(label).map_err(InfraError::Validation)
        })
    }

    pub fn remove_category(&self, label: &str) -> Result<LabelRegistry, InfraError> {
        self.change_labels(CUSTOM_CATEGORIES_KEY, self.categories(), |registry| {
            remove_label(registry, label)
        })
    }

    /// Holidays ordered by date.
    pub fn holidays(&self) -> Vec<Holiday> {
        let mut holidays: Vec<Holiday> = load_json(self.kv.as_ref(), HOLIDAYS_KEY, Vec::new());
        holidays.sort_by(|left, right| left.date.cmp(&right.date));
        holidays
    }

    pub fn add_holiday(&self, holiday: Holiday) -> Result<Vec<Holiday>, InfraError> {
        holiday.validate().map_err(InfraError::Validation)?;
        let mut holidays = self.holidays();
        if holidays.iter().any(|existing| existing.date == holiday.date) {
            return Err(InfraError::Validation(format!(
                "holiday already exists for {}",
                holiday.date
            )));
        }
        holidays.push(Holiday {
            date: holiday.date,
            name: holiday.name.trim().to_string(),
        });
        holidays.sort_by(|left, right| left.date.cmp(&right.date));
        self.write(HOLIDAYS_KEY, &holidays)?;
        Ok(holidays)
    }

    pub fn remove_holiday(&self, date: &str) -> Result<bool, InfraError> {
        let mut holidays = self.holidays();
        let before = holidays.len();
        holidays.retain(|holiday| holiday.date != date);
        if holidays.len() == before {
            return Ok(false);
        }
        self.write(HOLIDAYS_KEY, &holidays)?;
        Ok(true)
    }

    pub fn is_holiday(&self, date: &str) -> bool {
        self.holidays().iter().any(|holiday| holiday.date == date)
    }

    pub fn settings(&self) -> UserSettings {
        load_json(self.kv.as_ref(), SETTINGS_KEY, UserSettings::default())
    }

    pub fn save_settings(&self, settings: &UserSettings) -> Result<(), InfraError> {
        settings.validate().map_err(InfraError::Validation)?;
        self.write(SETTINGS_KEY, settings)
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        load_json(self.kv.as_ref(), LAST_MODIFIED_KEY, None)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let (active_session, active_activity) = self.load_active_state();
        StateSnapshot {
            work_sessions: Some(self.load_sessions()),
            active_session,
            active_activity,
            custom_projects: Some(self.projects()),
            custom_categories: Some(self.categories()),
            holidays: Some(self.holidays()),
            paused_tasks: Some(self.paused_tasks()),
            settings: Some(self.settings()),
            version: Some(SNAPSHOT_VERSION.to_string()),
            last_modified: self.last_modified(),
        }
    }

    /// Overwrites local state with `snapshot` in one write. Collections the
    /// snapshot omits keep their local values; the active keys always follow it.
    pub fn apply_snapshot(&self, snapshot: &StateSnapshot) -> Result<(), InfraError> {
        let mut entries: Vec<(&str, String)> = Vec::new();
        if let Some(sessions) = &snapshot.work_sessions {
            entries.push((WORK_SESSIONS_KEY, serde_json::to_string(sessions)?));
        }
        if let Some(projects) = &snapshot.custom_projects {
            entries.push((CUSTOM_PROJECTS_KEY, serde_json::to_string(projects)?));
        }
        if let Some(categories) = &snapshot.custom_categories {
            entries.push((CUSTOM_CATEGORIES_KEY, serde_json::to_string(categories)?));
        }
        if let Some(holidays) = &snapshot.holidays {
            entries.push((HOLIDAYS_KEY, serde_json::to_string(holidays)?));
        }
        if let Some(paused) = &snapshot.paused_tasks {
            entries.push((PAUSED_TASKS_KEY, serde_json::to_string(paused)?));
        }
        if let Some(settings) = &snapshot.settings {
            entries.push((SETTINGS_KEY, serde_json::to_string(settings)?));
        }
        entries.push((
            ACTIVE_SESSION_KEY,
            serde_json::to_string(&snapshot.active_session)?,
        ));
        entries.push((
            ACTIVE_ACTIVITY_KEY,
            serde_json::to_string(&snapshot.active_activity)?,
        ));
        let stamp = snapshot.last_modified.unwrap_or_else(|| (self.now_provider)());
        entries.push((LAST_MODIFIED_KEY, serde_json::to_string(&stamp)?));

        self.kv.set_many(&entries)
    }

    fn change_labels<F>(
        &self,
        key: &str,
        mut registry: LabelRegistry,
        change: F,
    ) -> Result<LabelRegistry, InfraError>
    where
        F: FnOnce(&mut LabelRegistry) -> Result<(), InfraError>,
    {
        change(&mut registry)?;
        self.write(key, &registry)?;
        Ok(registry)
    }

    fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), InfraError> {
        save_json(self.kv.as_ref(), key, value)?;
        self.touch()
    }

    fn touch(&self) -> Result<(), InfraError> {
        save_json(self.kv.as_ref(), LAST_MODIFIED_KEY, &(self.now_provider)())
    }
}

fn remove_label(registry: &mut LabelRegistry, label: &str) -> Result<(), InfraError> {
    if registry.remove(label) {
        Ok(())
    } else {
        Err(InfraError::NotFound(format!("label {}", label.trim())))
    }
}
