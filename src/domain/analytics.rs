use crate::domain::models::{
    elapsed_seconds, parse_time_of_day, Activity, TaskStatus, UserSettings, WorkSession,
};
use chrono::{Datelike, Duration, Months, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AnalyticsRange {
    #[default]
    CurrentWeek,
    Last7Days,
    Last30Days,
    Last90Days,
    CurrentMonth,
    AllTime,
}

impl AnalyticsRange {
    /// Inclusive date bounds relative to `today`.
    pub fn resolve(self, today: NaiveDate, sessions: &[WorkSession]) -> (NaiveDate, NaiveDate) {
        match self {
            Self::CurrentWeek => week_range(today, 0),
            Self::Last7Days => (today - Duration::days(6), today),
            Self::Last30Days => (today - Duration::days(29), today),
            Self::Last90Days => (today - Duration::days(89), today),
            Self::CurrentMonth => {
                let first = today.with_day(1).unwrap_or(today);
                let last = first
                    .checked_add_months(Months::new(1))
                    .and_then(|next| next.pred_opt())
                    .unwrap_or(today);
                (first, last)
            }
            Self::AllTime => {
                let earliest = sessions
                    .iter()
                    .filter_map(|session| parse_date(&session.date))
                    .min()
                    .unwrap_or(today - Duration::days(30));
                (earliest, today)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub start_date: String,
    pub end_date: String,
    pub project_seconds: BTreeMap<String, i64>,
    pub category_seconds: BTreeMap<String, i64>,
    pub daily_work_seconds: BTreeMap<String, i64>,
    pub hourly_work_seconds: Vec<i64>,
    pub total_work_seconds: i64,
    pub total_break_seconds: i64,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub paused_tasks: usize,
    pub average_daily_work_seconds: i64,
    pub top_project: Option<String>,
    pub most_productive_day: Option<String>,
    pub completion_rate: u32,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionTotals {
    pub work_seconds: i64,
    pub break_seconds: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GoalProgress {
    pub today_work_seconds: i64,
    pub week_work_seconds: i64,
    pub daily_goal_hours: f64,
    pub weekly_goal_hours: f64,
    pub daily_percent: f64,
    pub weekly_percent: f64,
    pub daily_goal_exceeded: bool,
    pub weekly_goal_exceeded: bool,
}

pub fn summarize(sessions: &[WorkSession], start: NaiveDate, end: NaiveDate) -> AnalyticsSummary {
    let mut summary = AnalyticsSummary {
        start_date: format_date(start),
        end_date: format_date(end),
        project_seconds: BTreeMap::new(),
        category_seconds: BTreeMap::new(),
        daily_work_seconds: BTreeMap::new(),
        hourly_work_seconds: vec![0; 24],
        total_work_seconds: 0,
        total_break_seconds: 0,
        total_tasks: 0,
        completed_tasks: 0,
        paused_tasks: 0,
        average_daily_work_seconds: 0,
        top_project: None,
        most_productive_day: None,
        completion_rate: 0,
    };

    for session in sessions_between(sessions, start, end) {
        let day = summary
            .daily_work_seconds
            .entry(session.date.clone())
            .or_insert(0);
        for activity in &session.activities {
            if !activity.is_task() {
                summary.total_break_seconds += activity.duration;
                continue;
            }
            *day += activity.duration;
            *summary
                .project_seconds
                .entry(activity.project.clone())
                .or_insert(0) += activity.duration;
            *summary
                .category_seconds
                .entry(activity.category.clone())
                .or_insert(0) += activity.duration;
            summary.total_work_seconds += activity.duration;
            summary.total_tasks += 1;
            match activity.effective_status() {
                TaskStatus::Completed => summary.completed_tasks += 1,
                TaskStatus::Paused => summary.paused_tasks += 1,
            }
            if let Some(time) = parse_time_of_day(&activity.start_time) {
                summary.hourly_work_seconds[time.hour() as usize] += activity.duration;
            }
        }
    }

    let days = summary.daily_work_seconds.len() as i64;
    if days > 0 {
        summary.average_daily_work_seconds = summary.total_work_seconds / days;
    }
    summary.top_project = strict_max(&summary.project_seconds);
    summary.most_productive_day = strict_max(&summary.daily_work_seconds);
    if summary.total_tasks > 0 {
        let rate = summary.completed_tasks as f64 / summary.total_tasks as f64 * 100.0;
        summary.completion_rate = rate.round() as u32;
    }
    summary
}

/// Work and break seconds for a session, counting the running activity up to `now_epoch_ms`.
pub fn session_totals(
    session: &WorkSession,
    running: Option<&Activity>,
    now_epoch_ms: i64,
) -> SessionTotals {
    let mut totals = SessionTotals::default();
    let ongoing = running.map(|activity| {
        let seconds = match (activity.end_time.as_ref(), activity.start_epoch) {
            (Some(_), _) => activity.duration,
            (None, Some(start_epoch)) => elapsed_seconds(start_epoch, now_epoch_ms),
            (None, None) => 0,
        };
        (activity, seconds)
    });

    let finished = session
        .activities
        .iter()
        .map(|activity| (activity, activity.duration));
    for (activity, seconds) in finished.chain(ongoing) {
        if activity.is_task() {
            totals.work_seconds += seconds;
        } else {
            totals.break_seconds += seconds;
        }
    }
    totals
}

/// Monday through Sunday of the week containing `date`, shifted by `offset` weeks.
pub fn week_range(date: NaiveDate, offset: i64) -> (NaiveDate, NaiveDate) {
    let shifted = date + Duration::weeks(offset);
    let monday = shifted - Duration::days(i64::from(shifted.weekday().num_days_from_monday()));
    (monday, monday + Duration::days(6))
}

pub fn goal_progress(
    sessions: &[WorkSession],
    today: NaiveDate,
    settings: &UserSettings,
) -> GoalProgress {
    let today_work_seconds = task_seconds(sessions_between(sessions, today, today));
    let (week_start, week_end) = week_range(today, 0);
    let week_work_seconds = task_seconds(sessions_between(sessions, week_start, week_end));

    let daily_hours = today_work_seconds as f64 / 3600.0;
    let weekly_hours = week_work_seconds as f64 / 3600.0;
    GoalProgress {
        today_work_seconds,
        week_work_seconds,
        daily_goal_hours: settings.daily_goal_hours,
        weekly_goal_hours: settings.weekly_goal_hours,
        daily_percent: percent_of(daily_hours, settings.daily_goal_hours),
        weekly_percent: percent_of(weekly_hours, settings.weekly_goal_hours),
        daily_goal_exceeded: daily_hours > settings.daily_goal_hours,
        weekly_goal_exceeded: weekly_hours > settings.weekly_goal_hours,
    }
}

/// Seconds recorded against a task description across all sessions.
pub fn total_time_for_task(sessions: &[WorkSession], description: &str) -> i64 {
    sessions
        .iter()
        .flat_map(|session| &session.activities)
        .filter(|activity| activity.is_task() && activity.description == description)
        .map(|activity| activity.duration)
        .sum()
}

pub fn sessions_between(
    sessions: &[WorkSession],
    start: NaiveDate,
    end: NaiveDate,
) -> impl Iterator<Item = &WorkSession> {
    let (start, end) = (format_date(start), format_date(end));
    sessions
        .iter()
        .filter(move |session| session.date >= start && session.date <= end)
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn task_seconds<'a>(sessions: impl Iterator<Item = &'a WorkSession>) -> i64 {
    sessions
        .flat_map(|session| &session.activities)
        .filter(|activity| activity.is_task())
        .map(|activity| activity.duration)
        .sum()
}

fn percent_of(value: f64, goal: f64) -> f64 {
    if goal <= 0.0 {
        return 0.0;
    }
    (value / goal * 100.0).min(100.0)
}

/// First key holding a strictly positive maximum.
fn strict_max(values: &BTreeMap<String, i64>) -> Option<String> {
    let mut best: Option<(&String, i64)> = None;
    for (key, seconds) in values {
        if *seconds > best.map_or(0, |(_, current)| current) {
            best = Some((key, *seconds));
        }
    }
    best.map(|(key, _)| key.clone())
}
