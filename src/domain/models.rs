use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROJECTS: [&str; 5] = [
    "General",
    "AML/CTF",
    "SNS Clockedin",
    "SNS Accounting",
    "SNS Tech",
];
pub const DEFAULT_CATEGORIES: [&str; 5] = ["Other", "Backend", "Frontend", "Meeting", "Break"];

pub const BREAK_LABEL: &str = "Break";
pub const GENERAL_PROJECT: &str = "General";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Task,
    Break,
}

impl ActivityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Break => "break",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Paused,
}

/// A single captured instant: epoch milliseconds plus the local calendar day
/// and time-of-day strings derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moment {
    pub epoch_ms: i64,
    pub date: String,
    pub time: String,
}

impl Moment {
    pub fn at(now: DateTime<Utc>, timezone: Tz) -> Self {
        let local = now.with_timezone(&timezone);
        Self {
            epoch_ms: now.timestamp_millis(),
            date: local.date_naive().format("%Y-%m-%d").to_string(),
            time: format_time_of_day(local.time()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub description: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub category: String,
    pub start_time: String,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub start_epoch: Option<i64>,
    #[serde(default)]
    pub end_epoch: Option<i64>,
    #[serde(default)]
    pub duration: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_filled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_resumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_time: Option<i64>,
}

impl Activity {
    /// Opens a new activity at `moment` with no end.
    pub fn open(
        activity_type: ActivityType,
        description: impl Into<String>,
        project: impl Into<String>,
        category: impl Into<String>,
        moment: &Moment,
    ) -> Self {
        Self {
            activity_type,
            description: description.into(),
            project: project.into(),
            category: category.into(),
            start_time: moment.time.clone(),
            end_time: None,
            start_epoch: Some(moment.epoch_ms),
            end_epoch: None,
            duration: 0,
            status: None,
            auto_filled: false,
            is_resumed: false,
            previous_time: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn is_task(&self) -> bool {
        self.activity_type == ActivityType::Task
    }

    /// Records without a status predate pause support and count as completed.
    pub fn effective_status(&self) -> TaskStatus {
        self.status.unwrap_or(TaskStatus::Completed)
    }

    /// Captures the end of the activity at `moment` and derives its duration.
    pub fn close_at(&mut self, moment: &Moment) {
        self.end_time = Some(moment.time.clone());
        self.end_epoch = Some(moment.epoch_ms);
        self.duration = match self.start_epoch {
            Some(start_epoch) => elapsed_seconds(start_epoch, moment.epoch_ms),
            None => duration_between(&self.start_time, &moment.time).unwrap_or(0),
        };
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.description, "activity.description")?;
        validate_time_of_day(&self.start_time, "activity.start_time")?;
        if let Some(end_time) = self.end_time.as_deref() {
            validate_time_of_day(end_time, "activity.end_time")?;
        }
        if self.duration < 0 {
            return Err("activity.duration must be >= 0".to_string());
        }
        if self.status == Some(TaskStatus::Paused) && !self.is_task() {
            return Err("activity.status paused is only valid for tasks".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkSession {
    pub date: String,
    pub start_time: String,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub start_epoch: Option<i64>,
    #[serde(default)]
    pub end_epoch: Option<i64>,
    #[serde(default)]
    pub activities: Vec<Activity>,
}

impl WorkSession {
    pub fn begin(moment: &Moment) -> Self {
        Self {
            date: moment.date.clone(),
            start_time: moment.time.clone(),
            end_time: None,
            start_epoch: Some(moment.epoch_ms),
            end_epoch: None,
            activities: Vec::new(),
        }
    }

    /// Identity key `(date, startEpoch-or-startTime)`.
    pub fn identity(&self) -> String {
        let marker = match self.start_epoch {
            Some(epoch) if epoch != 0 => epoch.to_string(),
            _ => self.start_time.clone(),
        };
        format!("{}__{}", self.date, marker)
    }

    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_date(&self.date, "session.date")?;
        validate_time_of_day(&self.start_time, "session.start_time")?;
        if self.is_closed() && self.activities.is_empty() {
            return Err("an ended session must contain at least one activity".to_string());
        }
        let open_count = self.activities.iter().filter(|activity| activity.is_open()).count();
        if open_count > 1 {
            return Err("session must not contain more than one open activity".to_string());
        }
        for activity in &self.activities {
            activity.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PausedTask {
    pub description: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub total_time: i64,
    #[serde(default)]
    pub paused_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Holiday {
    pub date: String,
    #[serde(default)]
    pub name: String,
}

impl Holiday {
    pub fn validate(&self) -> Result<(), String> {
        validate_date(&self.date, "holiday.date")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Gap {
    pub after_index: usize,
    pub start_time: String,
    pub end_time: String,
    pub duration_minutes: u32,
    pub duration_seconds: i64,
}

/// Preferences stored under the `settings` key. Unknown keys are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default = "default_daily_goal_hours")]
    pub daily_goal_hours: f64,
    #[serde(default = "default_weekly_goal_hours")]
    pub weekly_goal_hours: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            daily_goal_hours: default_daily_goal_hours(),
            weekly_goal_hours: default_weekly_goal_hours(),
            extra: serde_json::Map::new(),
        }
    }
}

impl UserSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.daily_goal_hours > 0.0 && self.daily_goal_hours <= 24.0) {
            return Err("settings.dailyGoalHours must be within (0, 24]".to_string());
        }
        if !(self.weekly_goal_hours > 0.0 && self.weekly_goal_hours <= 168.0) {
            return Err("settings.weeklyGoalHours must be within (0, 168]".to_string());
        }
        Ok(())
    }
}

/// User-managed, ordered set of classification labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct LabelRegistry(Vec<String>);

impl LabelRegistry {
    pub fn with_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::default();
        for label in labels {
            let _ = registry.add(&label.into());
        }
        registry
    }

    pub fn default_projects() -> Self {
        Self::with_labels(DEFAULT_PROJECTS)
    }

    pub fn default_categories() -> Self {
        Self::with_labels(DEFAULT_CATEGORIES)
    }

    pub fn add(&mut self, label: &str) -> Result<(), String> {
        let label = label.trim();
        validate_non_empty(label, "label")?;
        if self.contains(label) {
            return Err(format!("label already exists: {label}"));
        }
        self.0.push(label.to_string());
        Ok(())
    }

    pub fn remove(&mut self, label: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|candidate| candidate != label.trim());
        self.0.len() != before
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.iter().any(|candidate| candidate == label)
    }

    pub fn labels(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

pub fn format_time_of_day(time: NaiveTime) -> String {
    format!("{:02}:{:02}:{:02}", time.hour(), time.minute(), time.second())
}

/// Rewrites `HH:MM` or `HH:MM:SS` into `HH:MM:SS`.
pub fn normalize_time_of_day(value: &str) -> Option<String> {
    parse_time_of_day(value).map(format_time_of_day)
}

pub fn minutes_since_midnight(value: &str) -> Option<u32> {
    parse_time_of_day(value).map(|time| time.hour() * 60 + time.minute())
}

/// Whole-second difference between two time-of-day strings on a shared day.
pub fn duration_between(start: &str, end: &str) -> Option<i64> {
    let start = parse_time_of_day(start)?;
    let end = parse_time_of_day(end)?;
    Some((end - start).num_seconds())
}

pub fn elapsed_seconds(start_epoch_ms: i64, end_epoch_ms: i64) -> i64 {
    ((end_epoch_ms - start_epoch_ms) / 1000).max(0)
}

pub(crate) fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_date(value: &str, field_name: &str) -> Result<(), String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| format!("{field_name} must be YYYY-MM-DD"))?;
    Ok(())
}

pub(crate) fn validate_time_of_day(value: &str, field_name: &str) -> Result<(), String> {
    if parse_time_of_day(value).is_none() {
        return Err(format!("{field_name} must be HH:MM or HH:MM:SS"));
    }
    Ok(())
}

fn default_daily_goal_hours() -> f64 {
    8.0
}

fn default_weekly_goal_hours() -> f64 {
    40.0
}

fn is_false(value: &bool) -> bool {
    !*value
}
