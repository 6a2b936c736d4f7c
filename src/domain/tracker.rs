use crate::domain::models::{
    Activity, ActivityType, Moment, PausedTask, TaskStatus, WorkSession, BREAK_LABEL,
};
use crate::domain::reconciler::sort_by_start;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    Validation(String),
}

/// How a session left open on a previous day is treated on restore.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StaleSessionPolicy {
    #[default]
    LeaveOpen,
    Flag,
    AutoClose,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrackerState {
    #[default]
    NoSession,
    Open {
        session: WorkSession,
    },
    Running {
        session: WorkSession,
        activity: Activity,
    },
    AwaitingStatus {
        session: WorkSession,
        activity: Activity,
    },
    AwaitingNextAction {
        session: WorkSession,
    },
    Closed {
        session: WorkSession,
    },
}

/// Paused-task bookkeeping the caller must apply after a status choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PausedTaskChange {
    Upsert(PausedTask),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// A task stopped and now needs completed/paused.
    AwaitingStatus(Activity),
    /// A break stopped and was appended to the session.
    BreakRecorded(Activity),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleOutcome {
    LeftOpen,
    Flagged,
    AutoClosed,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleSession {
    pub session: WorkSession,
    pub outcome: StaleOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub state: TrackerState,
    pub stale: Option<StaleSession>,
}

impl TrackerState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoSession => "no_session",
            Self::Open { .. } => "open",
            Self::Running { .. } => "running",
            Self::AwaitingStatus { .. } => "awaiting_status",
            Self::AwaitingNextAction { .. } => "awaiting_next_action",
            Self::Closed { .. } => "closed",
        }
    }

    pub fn session(&self) -> Option<&WorkSession> {
        match self {
            Self::NoSession => None,
            Self::Open { session }
            | Self::Running { session, .. }
            | Self::AwaitingStatus { session, .. }
            | Self::AwaitingNextAction { session }
            | Self::Closed { session } => Some(session),
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut WorkSession> {
        match self {
            Self::NoSession => None,
            Self::Open { session }
            | Self::Running { session, .. }
            | Self::AwaitingStatus { session, .. }
            | Self::AwaitingNextAction { session }
            | Self::Closed { session } => Some(session),
        }
    }

    pub fn current_activity(&self) -> Option<&Activity> {
        match self {
            Self::Running { activity, .. } | Self::AwaitingStatus { activity, .. } => Some(activity),
            _ => None,
        }
    }

    /// The session and activity that must survive a reload. Closed days have none.
    pub fn active_parts(&self) -> (Option<&WorkSession>, Option<&Activity>) {
        match self {
            Self::NoSession | Self::Closed { .. } => (None, None),
            _ => (self.session(), self.current_activity()),
        }
    }

    pub fn start_work_day(&mut self, moment: &Moment) -> Result<&WorkSession, TransitionError> {
        if !matches!(self, Self::NoSession | Self::Closed { .. }) {
            return Err(self.invalid("start a work day"));
        }
        *self = Self::Open {
            session: WorkSession::begin(moment),
        };
        self.session()
            .ok_or_else(|| TransitionError::Precondition("session missing".to_string()))
    }

    pub fn start_task(
        &mut self,
        description: &str,
        project: &str,
        category: &str,
        moment: &Moment,
    ) -> Result<&Activity, TransitionError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(TransitionError::Validation(
                "task description must not be empty".to_string(),
            ));
        }
        let activity = Activity::open(
            ActivityType::Task,
            description,
            project.trim(),
            category.trim(),
            moment,
        );
        self.begin_activity("start a task", activity)
    }

    pub fn start_break(
        &mut self,
        description: Option<&str>,
        moment: &Moment,
    ) -> Result<&Activity, TransitionError> {
        let description = description
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(BREAK_LABEL);
        let activity = Activity::open(
            ActivityType::Break,
            description,
            BREAK_LABEL,
            BREAK_LABEL,
            moment,
        );
        self.begin_activity("start a break", activity)
    }

    pub fn resume_paused_task(
        &mut self,
        paused: &PausedTask,
        moment: &Moment,
    ) -> Result<&Activity, TransitionError> {
        let mut activity = Activity::open(
            ActivityType::Task,
            paused.description.clone(),
            paused.project.clone(),
            paused.category.clone(),
            moment,
        );
        activity.is_resumed = true;
        activity.previous_time = Some(paused.total_time);
        self.begin_activity("resume a paused task", activity)
    }

    pub fn stop_activity(&mut self, moment: &Moment) -> Result<StopOutcome, TransitionError> {
        let (mut session, mut activity) = match std::mem::take(self) {
            Self::Running { session, activity } => (session, activity),
            other => {
                *self = other;
                return Err(self.invalid("stop an activity"));
            }
        };

        activity.close_at(moment);
        if activity.is_task() {
            *self = Self::AwaitingStatus {
                session,
                activity: activity.clone(),
            };
            return Ok(StopOutcome::AwaitingStatus(activity));
        }

        activity.status = Some(TaskStatus::Completed);
        append_finished(&mut session, activity.clone());
        *self = Self::AwaitingNextAction { session };
        Ok(StopOutcome::BreakRecorded(activity))
    }

    pub fn complete_task(&mut self) -> Result<PausedTaskChange, TransitionError> {
        let (mut session, mut activity) = self.take_awaiting_status("complete a task")?;
        activity.status = Some(TaskStatus::Completed);
        let description = activity.description.clone();
        append_finished(&mut session, activity);
        *self = Self::AwaitingNextAction { session };
        Ok(PausedTaskChange::Remove(description))
    }

    pub fn pause_task(&mut self, moment: &Moment) -> Result<PausedTaskChange, TransitionError> {
        let (mut session, mut activity) = self.take_awaiting_status("pause a task")?;
        activity.status = Some(TaskStatus::Paused);
        let paused = PausedTask {
            description: activity.description.clone(),
            project: activity.project.clone(),
            category: activity.category.clone(),
            total_time: activity.previous_time.unwrap_or(0) + activity.duration,
            paused_at: rfc3339(moment.epoch_ms),
        };
        append_finished(&mut session, activity);
        *self = Self::AwaitingNextAction { session };
        Ok(PausedTaskChange::Upsert(paused))
    }

    /// Closes the day. A running activity is completed first.
    pub fn end_work_day(&mut self, moment: &Moment) -> Result<&WorkSession, TransitionError> {
        if let Self::Open { session } | Self::AwaitingNextAction { session } = self {
            if session.activities.is_empty() {
                return Err(TransitionError::Precondition(
                    "cannot end the work day without any activities".to_string(),
                ));
            }
        }

        let mut session = match std::mem::take(self) {
            Self::Running {
                mut session,
                mut activity,
            } => {
                activity.close_at(moment);
                activity.status = Some(TaskStatus::Completed);
                append_finished(&mut session, activity);
                session
            }
            Self::Open { session } | Self::AwaitingNextAction { session } => session,
            other => {
                *self = other;
                return Err(self.invalid("end the work day"));
            }
        };

        session.end_time = Some(moment.time.clone());
        session.end_epoch = Some(moment.epoch_ms);
        *self = Self::Closed { session };
        self.session()
            .ok_or_else(|| TransitionError::Precondition("session missing".to_string()))
    }

    /// Rebuilds the state from persisted active session and activity.
    pub fn restore(
        active_session: Option<WorkSession>,
        active_activity: Option<Activity>,
        today: &str,
        policy: StaleSessionPolicy,
    ) -> RestoreReport {
        let Some(mut session) = active_session.filter(|session| !session.is_closed()) else {
            return RestoreReport {
                state: Self::NoSession,
                stale: None,
            };
        };

        if session.date != today {
            return RestoreReport {
                state: Self::NoSession,
                stale: Some(resolve_stale(session, active_activity, policy)),
            };
        }

        let state = match active_activity {
            Some(activity) if activity.is_open() => Self::Running { session, activity },
            Some(activity) if activity.is_task() => Self::AwaitingStatus { session, activity },
            Some(mut activity) => {
                activity.status = Some(TaskStatus::Completed);
                append_finished(&mut session, activity);
                Self::AwaitingNextAction { session }
            }
            None if session.activities.is_empty() => Self::Open { session },
            None => Self::AwaitingNextAction { session },
        };
        RestoreReport { state, stale: None }
    }

    fn begin_activity(
        &mut self,
        action: &'static str,
        activity: Activity,
    ) -> Result<&Activity, TransitionError> {
        let session = match std::mem::take(self) {
            Self::Open { session } | Self::AwaitingNextAction { session } => session,
            other => {
                *self = other;
                return Err(self.invalid(action));
            }
        };
        *self = Self::Running { session, activity };
        self.current_activity()
            .ok_or_else(|| TransitionError::Precondition("activity missing".to_string()))
    }

    fn take_awaiting_status(
        &mut self,
        action: &'static str,
    ) -> Result<(WorkSession, Activity), TransitionError> {
        match std::mem::take(self) {
            Self::AwaitingStatus { session, activity } => Ok((session, activity)),
            other => {
                *self = other;
                Err(self.invalid(action))
            }
        }
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        TransitionError::InvalidTransition {
            action,
            state: self.label(),
        }
    }
}

fn append_finished(session: &mut WorkSession, activity: Activity) {
    session.activities.push(activity);
    sort_by_start(&mut session.activities);
}

fn resolve_stale(
    mut session: WorkSession,
    active_activity: Option<Activity>,
    policy: StaleSessionPolicy,
) -> StaleSession {
    let outcome = match policy {
        StaleSessionPolicy::LeaveOpen => StaleOutcome::LeftOpen,
        StaleSessionPolicy::Flag => StaleOutcome::Flagged,
        StaleSessionPolicy::AutoClose => {
            if let Some(mut activity) = active_activity {
                if activity.is_open() {
                    activity.end_time = Some(activity.start_time.clone());
                    activity.end_epoch = activity.start_epoch;
                    activity.duration = 0;
                }
                activity.status = Some(TaskStatus::Completed);
                append_finished(&mut session, activity);
            }
            match session.activities.last() {
                Some(last) => {
                    session.end_time = last.end_time.clone();
                    session.end_epoch = last.end_epoch.or(session.start_epoch);
                    StaleOutcome::AutoClosed
                }
                None => StaleOutcome::Discarded,
            }
        }
    };
    StaleSession { session, outcome }
}

fn rfc3339(epoch_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
