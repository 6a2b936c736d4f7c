use crate::domain::models::{
    duration_between, minutes_since_midnight, normalize_time_of_day, parse_time_of_day, Activity,
    ActivityType, Gap, TaskStatus, BREAK_LABEL, GENERAL_PROJECT,
};
use chrono::Timelike;
use serde::Deserialize;
use thiserror::Error;

pub const AUTO_FILL_DESCRIPTION: &str = "Untracked time (auto-filled)";

const SECONDS_PER_DAY: u32 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("missing input: {0}")]
    MissingInput(&'static str),
    #[error("invalid time '{0}': expected HH:MM or HH:MM:SS")]
    InvalidTime(String),
    #[error("end time must be after start time")]
    EndNotAfterStart,
    #[error("time range {start}-{end} overlaps with another activity ({other_start}-{other_end})")]
    Overlap {
        start: String,
        end: String,
        other_start: String,
        other_end: String,
    },
    #[error("activity not found at index {0}")]
    ActivityNotFound(usize),
}

/// Field values submitted through the manual edit path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEdit {
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub description: String,
    pub project: String,
    pub category: String,
    pub start_time: String,
    pub end_time: String,
}

/// Stable sort by start minute; unparseable starts sink to the end.
pub fn sort_by_start(activities: &mut [Activity]) {
    activities.sort_by_key(start_key);
}

pub fn detect_gaps(activities: &[Activity]) -> Vec<Gap> {
    if activities.len() < 2 {
        return Vec::new();
    }

    let mut ordered = activities.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|activity| start_key(activity));

    let mut gaps = Vec::new();
    for (index, pair) in ordered.windows(2).enumerate() {
        let (current, next) = (pair[0], pair[1]);
        let Some(end_time) = current.end_time.as_deref() else {
            continue;
        };
        let (Some(current_end), Some(next_start)) = (
            minutes_since_midnight(end_time),
            minutes_since_midnight(&next.start_time),
        ) else {
            continue;
        };
        if next_start <= current_end {
            continue;
        }

        let duration_minutes = next_start - current_end;
        let duration_seconds = duration_between(end_time, &next.start_time)
            .filter(|seconds| *seconds > 0)
            .unwrap_or(i64::from(duration_minutes) * 60);
        gaps.push(Gap {
            after_index: index,
            start_time: end_time.to_string(),
            end_time: next.start_time.clone(),
            duration_minutes,
            duration_seconds,
        });
    }
    gaps
}

/// Rejects `candidate` when its `[start, end)` intersects any sibling.
/// An open sibling occupies the rest of the day.
pub fn validate_edit<'a, I>(candidate: &Activity, siblings: I) -> Result<(), ReconcileError>
where
    I: IntoIterator<Item = &'a Activity>,
{
    let end_time = candidate
        .end_time
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .ok_or(ReconcileError::MissingInput("end time"))?;
    if candidate.start_time.trim().is_empty() {
        return Err(ReconcileError::MissingInput("start time"));
    }
    let new_start = seconds_of_day(&candidate.start_time)?;
    let new_end = seconds_of_day(end_time)?;
    if new_end <= new_start {
        return Err(ReconcileError::EndNotAfterStart);
    }

    for other in siblings {
        let Ok(other_start) = seconds_of_day(&other.start_time) else {
            continue;
        };
        let other_end = match other.end_time.as_deref() {
            Some(value) => match seconds_of_day(value) {
                Ok(seconds) => seconds,
                Err(_) => continue,
            },
            None => SECONDS_PER_DAY,
        };

        if new_start < other_end && new_end > other_start {
            return Err(ReconcileError::Overlap {
                start: candidate.start_time.clone(),
                end: end_time.to_string(),
                other_start: other.start_time.clone(),
                other_end: other
                    .end_time
                    .clone()
                    .unwrap_or_else(|| "open".to_string()),
            });
        }
    }
    Ok(())
}

/// Rejects activities added or changed since `before` that intersect `held`,
/// the activity the tracker has not yet written into the session.
pub fn check_against_held(
    before: &[Activity],
    after: &[Activity],
    held: &Activity,
) -> Result<(), ReconcileError> {
    after
        .iter()
        .filter(|activity| !before.contains(activity))
        .try_for_each(|activity| validate_edit(activity, std::iter::once(held)))
}

pub fn fill_gap(gap: &Gap) -> Activity {
    let duration = recalculate_duration(&gap.start_time, &gap.end_time)
        .unwrap_or(gap.duration_seconds);
    Activity {
        activity_type: ActivityType::Break,
        description: AUTO_FILL_DESCRIPTION.to_string(),
        project: GENERAL_PROJECT.to_string(),
        category: BREAK_LABEL.to_string(),
        start_time: gap.start_time.clone(),
        end_time: Some(gap.end_time.clone()),
        start_epoch: None,
        end_epoch: None,
        duration,
        status: Some(TaskStatus::Completed),
        auto_filled: true,
        is_resumed: false,
        previous_time: None,
    }
}

/// Fills every detected gap and returns how many were filled.
pub fn fill_all_gaps(activities: &mut Vec<Activity>) -> usize {
    let gaps = detect_gaps(activities);
    if gaps.is_empty() {
        return 0;
    }
    activities.extend(gaps.iter().map(fill_gap));
    sort_by_start(activities);
    gaps.len()
}

/// Fills a single gap bounded by `start_time` and `end_time`.
pub fn fill_single_gap(
    activities: &mut Vec<Activity>,
    start_time: &str,
    end_time: &str,
) -> Result<Activity, ReconcileError> {
    let start_time = normalize_or_keep(start_time)?;
    let end_time = normalize_or_keep(end_time)?;
    let duration = recalculate_duration(&start_time, &end_time)?;
    let filler = fill_gap(&Gap {
        after_index: 0,
        start_time,
        end_time,
        duration_minutes: u32::try_from(duration / 60).unwrap_or(0),
        duration_seconds: duration,
    });
    insert_activity(activities, filler.clone())?;
    Ok(filler)
}

/// Adds a finished activity after checking it against the existing ones.
pub fn insert_activity(
    activities: &mut Vec<Activity>,
    activity: Activity,
) -> Result<(), ReconcileError> {
    validate_edit(&activity, activities.iter())?;
    activities.push(activity);
    sort_by_start(activities);
    Ok(())
}

pub fn recalculate_duration(start_time: &str, end_time: &str) -> Result<i64, ReconcileError> {
    let start = parse_time_of_day(start_time)
        .ok_or_else(|| ReconcileError::InvalidTime(start_time.to_string()))?;
    let end = parse_time_of_day(end_time)
        .ok_or_else(|| ReconcileError::InvalidTime(end_time.to_string()))?;
    Ok((end - start).num_seconds())
}

/// Applies a manual edit. Nothing changes unless every check passes.
pub fn apply_edit(
    activities: &mut [Activity],
    index: usize,
    edit: ActivityEdit,
) -> Result<Activity, ReconcileError> {
    let Some(original) = activities.get(index) else {
        return Err(ReconcileError::ActivityNotFound(index));
    };

    let description = edit.description.trim();
    if description.is_empty() {
        return Err(ReconcileError::MissingInput("description"));
    }
    if edit.start_time.trim().is_empty() || edit.end_time.trim().is_empty() {
        return Err(ReconcileError::MissingInput("start and end times"));
    }
    let start_time = normalize_or_keep(&edit.start_time)?;
    let end_time = normalize_or_keep(&edit.end_time)?;

    let mut candidate = original.clone();
    candidate.activity_type = edit.activity_type;
    candidate.description = description.to_string();
    candidate.project = edit.project.trim().to_string();
    candidate.category = edit.category.trim().to_string();
    candidate.start_time = start_time;
    candidate.end_time = Some(end_time);

    let siblings = activities
        .iter()
        .enumerate()
        .filter(|(position, _)| *position != index)
        .map(|(_, activity)| activity);
    validate_edit(&candidate, siblings)?;

    let end_time = candidate.end_time.as_deref().unwrap_or_default();
    candidate.duration = recalculate_duration(&candidate.start_time, end_time)?;
    candidate.start_epoch = None;
    candidate.end_epoch = None;
    if !candidate.is_task() {
        candidate.status = Some(TaskStatus::Completed);
    }

    activities[index] = candidate.clone();
    sort_by_start(activities);
    Ok(candidate)
}

/// Gaps the session would have if the activity at `index` took the given times.
pub fn preview_gaps_after_edit(
    activities: &[Activity],
    index: usize,
    start_time: &str,
    end_time: &str,
) -> Vec<Gap> {
    let preview = activities
        .iter()
        .enumerate()
        .map(|(position, activity)| {
            if position != index {
                return activity.clone();
            }
            let mut changed = activity.clone();
            changed.start_time = start_time.to_string();
            changed.end_time = Some(end_time.to_string());
            changed
        })
        .collect::<Vec<_>>();
    detect_gaps(&preview)
}

pub fn remove_activity(
    activities: &mut Vec<Activity>,
    index: usize,
) -> Result<Activity, ReconcileError> {
    if index >= activities.len() {
        return Err(ReconcileError::ActivityNotFound(index));
    }
    Ok(activities.remove(index))
}

fn start_key(activity: &Activity) -> u32 {
    minutes_since_midnight(&activity.start_time).unwrap_or(u32::MAX)
}

fn seconds_of_day(value: &str) -> Result<u32, ReconcileError> {
    parse_time_of_day(value)
        .map(|time| time.num_seconds_from_midnight())
        .ok_or_else(|| ReconcileError::InvalidTime(value.to_string()))
}

fn normalize_or_keep(value: &str) -> Result<String, ReconcileError> {
    normalize_time_of_day(value).ok_or_else(|| ReconcileError::InvalidTime(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn finished(activity_type: ActivityType, description: &str, start: &str, end: &str) -> Activity {
        Activity {
            activity_type,
            description: description.to_string(),
            project: "General".to_string(),
            category: "Other".to_string(),
            start_time: start.to_string(),
            end_time: Some(end.to_string()),
            start_epoch: None,
            end_epoch: None,
            duration: duration_between(start, end).unwrap_or(0),
            status: Some(TaskStatus::Completed),
            auto_filled: false,
            is_resumed: false,
            previous_time: None,
        }
    }

    fn task(start: &str, end: &str) -> Activity {
        finished(ActivityType::Task, "work", start, end)
    }

    fn edit(start: &str, end: &str) -> ActivityEdit {
        ActivityEdit {
            activity_type: ActivityType::Task,
            description: "edited".to_string(),
            project: "General".to_string(),
            category: "Backend".to_string(),
            start_time: start.to_string(),
            end_time: end.to_string(),
        }
    }

    fn hhmm(minutes: u32) -> String {
        format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
    }

    fn assert_no_overlap(activities: &[Activity]) {
        for (left_index, left) in activities.iter().enumerate() {
            for right in activities.iter().skip(left_index + 1) {
                let left_end = left.end_time.as_deref().expect("finished activity");
                let right_end = right.end_time.as_deref().expect("finished activity");
                let separated = seconds_of_day(left_end).expect("valid")
                    <= seconds_of_day(&right.start_time).expect("valid")
                    || seconds_of_day(right_end).expect("valid")
                        <= seconds_of_day(&left.start_time).expect("valid");
                assert!(separated, "{left:?} overlaps {right:?}");
            }
        }
    }

    #[test]
    fn changed_activities_must_clear_the_held_activity() {
        let before = vec![task("09:00", "10:00")];
        let mut running = task("10:00", "10:00");
        running.end_time = None;

        let mut stretched = before.clone();
        apply_edit(&mut stretched, 0, edit("09:00", "10:30")).expect("valid among siblings");
        assert!(matches!(
            check_against_held(&before, &stretched, &running),
            Err(ReconcileError::Overlap { .. })
        ));

        let mut shortened = before.clone();
        apply_edit(&mut shortened, 0, edit("09:00", "09:45")).expect("edit");
        assert_eq!(check_against_held(&before, &shortened, &running), Ok(()));
    }

    #[test]
    fn detect_gaps_reports_single_gap() {
        let activities = vec![task("09:00", "10:00"), task("10:30", "11:00")];
        let gaps = detect_gaps(&activities);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_time, "10:00");
        assert_eq!(gaps[0].end_time, "10:30");
        assert_eq!(gaps[0].duration_minutes, 30);
        assert_eq!(gaps[0].duration_seconds, 1800);
    }

    #[test]
    fn detect_gaps_ignores_adjacency_and_short_lists() {
        assert!(detect_gaps(&[task("09:00", "10:00")]).is_empty());
        assert!(detect_gaps(&[task("09:00", "10:00"), task("10:00", "11:00")]).is_empty());
    }

    #[test]
    fn detect_gaps_sorts_before_comparing() {
        let activities = vec![task("13:00", "14:00"), task("09:00", "10:00")];
        let gaps = detect_gaps(&activities);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_time, "10:00");
        assert_eq!(gaps[0].end_time, "13:00");
    }

    #[test]
    fn detect_gaps_skips_open_activity() {
        let mut open = task("10:00", "10:30");
        open.end_time = None;
        let activities = vec![open, task("11:00", "12:00")];
        assert!(detect_gaps(&activities).is_empty());
    }

    #[test]
    fn validate_edit_rejects_overlap() {
        let mut candidate = task("09:30", "10:15");
        candidate.description = "candidate".to_string();
        let siblings = [task("10:00", "11:00")];
        let result = validate_edit(&candidate, siblings.iter());
        assert!(matches!(result, Err(ReconcileError::Overlap { .. })));
    }

    #[test]
    fn validate_edit_accepts_touching_intervals() {
        let candidate = task("09:00", "10:00");
        let siblings = [task("10:00", "11:00"), task("08:00", "09:00")];
        assert!(validate_edit(&candidate, siblings.iter()).is_ok());
    }

    #[test]
    fn validate_edit_requires_ordered_times() {
        let candidate = task("10:00", "10:00");
        assert_eq!(
            validate_edit(&candidate, std::iter::empty()),
            Err(ReconcileError::EndNotAfterStart)
        );
        let mut missing_end = task("10:00", "11:00");
        missing_end.end_time = None;
        assert_eq!(
            validate_edit(&missing_end, std::iter::empty()),
            Err(ReconcileError::MissingInput("end time"))
        );
    }

    #[test]
    fn validate_edit_treats_open_sibling_as_running_until_midnight() {
        let mut open = task("15:00", "15:00");
        open.end_time = None;
        let candidate = task("16:00", "16:30");
        assert!(validate_edit(&candidate, [open.clone()].iter()).is_err());
        let earlier = task("14:00", "15:00");
        assert!(validate_edit(&earlier, [open].iter()).is_ok());
    }

    #[test]
    fn fill_gap_produces_completed_break() {
        let gap = detect_gaps(&[task("09:00:00", "10:00:00"), task("10:45:00", "11:00:00")])
            .remove(0);
        let filler = fill_gap(&gap);
        assert_eq!(filler.activity_type, ActivityType::Break);
        assert!(filler.auto_filled);
        assert_eq!(filler.status, Some(TaskStatus::Completed));
        assert_eq!(filler.duration, 45 * 60);
        assert_eq!(filler.description, AUTO_FILL_DESCRIPTION);
    }

    #[test]
    fn fill_all_gaps_leaves_no_gaps() {
        let mut activities = vec![
            task("09:00", "10:00"),
            task("10:30", "11:00"),
            task("13:00", "14:00"),
        ];
        assert_eq!(fill_all_gaps(&mut activities), 2);
        assert_eq!(activities.len(), 5);
        assert!(detect_gaps(&activities).is_empty());
        assert_eq!(fill_all_gaps(&mut activities), 0);
        assert_no_overlap(&activities);
    }

    #[test]
    fn fill_single_gap_rejects_overlap() {
        let mut activities = vec![task("09:00", "10:00"), task("10:30", "11:00")];
        assert!(fill_single_gap(&mut activities, "09:30", "10:30").is_err());
        assert_eq!(activities.len(), 2);
        let filler = fill_single_gap(&mut activities, "10:00", "10:30").expect("fill gap");
        assert_eq!(filler.start_time, "10:00:00");
        assert_eq!(activities[1].description, AUTO_FILL_DESCRIPTION);
    }

    #[test]
    fn apply_edit_recomputes_duration_and_resorts() {
        let mut activities = vec![task("09:00", "10:00"), task("10:30", "11:00")];
        activities[0].start_epoch = Some(1);
        activities[0].end_epoch = Some(2);
        let updated = apply_edit(&mut activities, 0, edit("11:00", "12:15")).expect("apply edit");

        assert_eq!(updated.duration, 75 * 60);
        assert_eq!(updated.start_epoch, None);
        assert_eq!(activities[1].description, "edited");
        assert_eq!(activities[1].start_time, "11:00:00");
        assert_eq!(activities[0].start_time, "10:30");
    }

    #[test]
    fn apply_edit_rejects_overlap_without_mutation() {
        let mut activities = vec![task("09:00", "09:30"), task("10:00", "11:00")];
        let before = activities.clone();
        let result = apply_edit(&mut activities, 0, edit("09:30", "10:15"));
        assert!(matches!(result, Err(ReconcileError::Overlap { .. })));
        assert_eq!(activities, before);
    }

    #[test]
    fn apply_edit_rejects_blank_description_and_missing_times() {
        let mut activities = vec![task("09:00", "09:30")];
        let mut blank = edit("09:00", "09:30");
        blank.description = "  ".to_string();
        assert_eq!(
            apply_edit(&mut activities, 0, blank),
            Err(ReconcileError::MissingInput("description"))
        );
        assert_eq!(
            apply_edit(&mut activities, 0, edit("09:00", "")),
            Err(ReconcileError::MissingInput("start and end times"))
        );
        assert_eq!(
            apply_edit(&mut activities, 3, edit("09:00", "09:30")),
            Err(ReconcileError::ActivityNotFound(3))
        );
    }

    #[test]
    fn sort_by_start_keeps_equal_starts_in_original_order() {
        let mut activities = vec![
            finished(ActivityType::Task, "second", "10:00", "10:00:20"),
            finished(ActivityType::Task, "first", "09:00", "09:30"),
            finished(ActivityType::Break, "third", "10:00:30", "10:10"),
        ];
        sort_by_start(&mut activities);
        let order = activities
            .iter()
            .map(|activity| activity.description.as_str())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn preview_reports_gap_created_by_edit() {
        let activities = vec![task("09:00", "10:00"), task("10:00", "11:00")];
        let gaps = preview_gaps_after_edit(&activities, 0, "09:00", "09:40");
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].duration_minutes, 20);
    }

    #[test]
    fn recalculate_duration_uses_whole_seconds() {
        assert_eq!(recalculate_duration("09:00", "09:00:45"), Ok(45));
        assert!(recalculate_duration("nine", "10:00").is_err());
    }

    proptest! {
        #[test]
        fn accepted_inserts_never_overlap_and_fill_is_idempotent(
            intervals in proptest::collection::vec((0u32..1380u32, 1u32..120u32), 1..25)
        ) {
            let mut activities = Vec::new();
            for (start, length) in intervals {
                let end = (start + length).min(1439);
                let _ = insert_activity(&mut activities, task(&hhmm(start), &hhmm(end)));
            }
            assert_no_overlap(&activities);

            fill_all_gaps(&mut activities);
            prop_assert!(detect_gaps(&activities).is_empty());
            assert_no_overlap(&activities);
        }

        #[test]
        fn edits_preserve_no_overlap(
            edits in proptest::collection::vec((0usize..6usize, 0u32..1380u32, 1u32..90u32), 1..30)
        ) {
            let mut activities = (0..6u32)
                .map(|slot| task(&hhmm(slot * 120), &hhmm(slot * 120 + 60)))
                .collect::<Vec<_>>();
            for (index, start, length) in edits {
                let _ = apply_edit(&mut activities, index, edit(&hhmm(start), &hhmm(start + length)));
                assert_no_overlap(&activities);
            }
        }
    }
}
