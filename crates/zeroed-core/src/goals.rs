use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::datastore::{DataStore, Record};
use crate::datetime::{
    WeekStart, add_days, end_of_month, end_of_week, project_local_to_utc, start_of_month,
    start_of_week, to_project_date,
};
use crate::focus::{FocusSession, focus_minutes_between};
use crate::habits::HabitLog;
use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    TasksCompleted,
    FocusMinutes,
    HabitCompletions,
    /// Progress is recorded by hand.
    Custom,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetType::TasksCompleted => "tasks_completed",
            TargetType::FocusMinutes => "focus_minutes",
            TargetType::HabitCompletions => "habit_completions",
            TargetType::Custom => "custom",
        }
    }
}

impl FromStr for TargetType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "tasks" | "tasks_completed" => Ok(TargetType::TasksCompleted),
            "focus" | "focus_minutes" => Ok(TargetType::FocusMinutes),
            "habits" | "habit_completions" => Ok(TargetType::HabitCompletions),
            "custom" => Ok(TargetType::Custom),
            other => Err(anyhow!("unknown goal target: {other}")),
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalPeriod {
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl GoalPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            GoalPeriod::Daily => "daily",
            GoalPeriod::Weekly => "weekly",
            GoalPeriod::Monthly => "monthly",
            GoalPeriod::Custom => "custom",
        }
    }
}

impl FromStr for GoalPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(GoalPeriod::Daily),
            "weekly" | "week" => Ok(GoalPeriod::Weekly),
            "monthly" | "month" => Ok(GoalPeriod::Monthly),
            "custom" => Ok(GoalPeriod::Custom),
            other => Err(anyhow!("unknown goal period: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Goal {
    pub id: Uuid,

    pub user_id: Uuid,

    pub title: String,

    pub target_type: TargetType,

    pub target_value: u64,

    #[serde(default)]
    pub current_value: u64,

    pub period: GoalPeriod,

    pub start_date: NaiveDate,

    pub end_date: NaiveDate,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Record for Goal {
    const FILE: &'static str = "goals.data";
}

impl Goal {
    pub fn progress_percent(&self) -> u8 {
        if self.target_value == 0 {
            return 100;
        }
        let pct = self.current_value.saturating_mul(100) / self.target_value;
        u8::try_from(pct.min(100)).unwrap_or(100)
    }

    pub fn is_reached(&self) -> bool {
        self.current_value >= self.target_value
    }
}

/// Inclusive date window of the period containing `today`; `None` for custom.
pub fn period_range(
    period: GoalPeriod,
    today: NaiveDate,
    week_start: WeekStart,
) -> Option<(NaiveDate, NaiveDate)> {
    match period {
        GoalPeriod::Daily => Some((today, today)),
        GoalPeriod::Weekly => Some((
            start_of_week(today, week_start),
            end_of_week(today, week_start),
        )),
        GoalPeriod::Monthly => Some((start_of_month(today), end_of_month(today))),
        GoalPeriod::Custom => None,
    }
}

#[derive(Debug, Clone)]
pub struct NewGoal {
    pub title: String,
    pub target_type: TargetType,
    pub target_value: u64,
    pub period: GoalPeriod,
    /// Required for custom periods.
    pub range: Option<(NaiveDate, NaiveDate)>,
}

#[instrument(skip(store, goal, now), fields(title = %goal.title))]
pub fn create_goal(
    store: &DataStore,
    user_id: Uuid,
    goal: NewGoal,
    week_start: WeekStart,
    now: DateTime<Utc>,
) -> anyhow::Result<Goal> {
    let title = goal.title.trim().to_string();
    if title.is_empty() {
        return Err(anyhow!("goal title cannot be empty"));
    }
    if goal.target_value == 0 {
        return Err(anyhow!("goal target must be positive"));
    }
    let (start_date, end_date) = match goal.range {
        Some(range) => range,
        None => period_range(goal.period, to_project_date(now), week_start)
            .ok_or_else(|| anyhow!("custom goals need a start and end date"))?,
    };
    if end_date < start_date {
        return Err(anyhow!("goal ends before it starts"));
    }

    let created = Goal {
        id: Uuid::new_v4(),
        user_id,
        title,
        target_type: goal.target_type,
        target_value: goal.target_value,
        current_value: 0,
        period: goal.period,
        start_date,
        end_date,
        completed_at: None,
        created_at: now,
    };
    store.update(|goals: &mut Vec<Goal>| {
        goals.push(created.clone());
        Ok(())
    })?;
    info!(target = %created.target_type, value = created.target_value, "created goal");
    Ok(created)
}

fn window_bounds(
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<(DateTime<Utc>, DateTime<Utc>)> {
    let after = add_days(end, 1).ok_or_else(|| anyhow!("goal window overflows the calendar"))?;
    Ok((
        project_local_to_utc(start.and_time(NaiveTime::MIN))?,
        project_local_to_utc(after.and_time(NaiveTime::MIN))?,
    ))
}

struct Sources {
    tasks: Vec<Task>,
    sessions: Vec<FocusSession>,
    habit_logs: Vec<HabitLog>,
}

fn measure(goal: &Goal, sources: &Sources) -> anyhow::Result<Option<u64>> {
    let in_window = |day: NaiveDate| day >= goal.start_date && day <= goal.end_date;
    let value = match goal.target_type {
        TargetType::Custom => return Ok(None),
        TargetType::TasksCompleted => sources
            .tasks
            .iter()
            .filter(|t| t.user_id == goal.user_id && t.status == TaskStatus::Completed)
            .filter(|t| t.completed_at.is_some_and(|at| in_window(to_project_date(at))))
            .count() as u64,
        TargetType::FocusMinutes => {
            let (from, to) = window_bounds(goal.start_date, goal.end_date)?;
            focus_minutes_between(&sources.sessions, goal.user_id, from, to)
        }
        TargetType::HabitCompletions => sources
            .habit_logs
            .iter()
            .filter(|log| log.user_id == goal.user_id && in_window(log.date))
            .map(|log| u64::from(log.count))
            .sum(),
    };
    Ok(Some(value))
}

/// Rolls recurring goals into the current period, recomputes measured
/// progress and stamps `completed_at` the first time a target is met.
#[instrument(skip(store, now))]
pub fn refresh_goal_progress(
    store: &DataStore,
    user_id: Uuid,
    week_start: WeekStart,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<Goal>> {
    let sources = Sources {
        tasks: store.load()?,
        sessions: store.load()?,
        habit_logs: store.load()?,
    };
    let today = to_project_date(now);

    store.update(|goals: &mut Vec<Goal>| {
        let mut refreshed = Vec::new();
        for goal in goals.iter_mut().filter(|g| g.user_id == user_id) {
            if let Some((start, end)) = period_range(goal.period, today, week_start)
                && start != goal.start_date
            {
                debug!(goal = %goal.title, %start, "goal rolled into a new period");
                goal.start_date = start;
                goal.end_date = end;
                goal.completed_at = None;
                goal.current_value = 0;
            }
            if let Some(value) = measure(goal, &sources)? {
                goal.current_value = value;
            }
            if goal.is_reached() && goal.completed_at.is_none() {
                goal.completed_at = Some(now);
                info!(goal = %goal.title, "goal reached");
            }
            refreshed.push(goal.clone());
        }
        Ok(refreshed)
    })
}

/// Sets progress on a custom goal, found by title.
pub fn record_goal_progress(
    store: &DataStore,
    user_id: Uuid,
    title: &str,
    value: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<Goal> {
    store.update(|goals: &mut Vec<Goal>| {
        let goal = goals
            .iter_mut()
            .find(|g| g.user_id == user_id && g.title.eq_ignore_ascii_case(title.trim()))
            .ok_or_else(|| anyhow!("no goal titled {title}"))?;
        if goal.target_type != TargetType::Custom {
            return Err(anyhow!(
                "{} goals are measured automatically",
                goal.target_type
            ));
        }
        goal.current_value = value;
        if goal.is_reached() && goal.completed_at.is_none() {
            goal.completed_at = Some(now);
        }
        Ok(goal.clone())
    })
}

pub fn goals_for_user(store: &DataStore, user_id: Uuid) -> anyhow::Result<Vec<Goal>> {
    Ok(store
        .load::<Goal>()?
        .into_iter()
        .filter(|g| g.user_id == user_id)
        .collect())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, TimeZone, Utc};

    use super::{
        GoalPeriod, NewGoal, TargetType, create_goal, period_range, record_goal_progress,
        refresh_goal_progress,
    };
    use crate::datastore::DataStore;
    use crate::datetime::WeekStart;
    use crate::focus::{FocusKind, start_session, stop_session};
    use crate::habits::{Frequency, create_habit, log_habit};
    use crate::tasks::{TaskDraft, complete_task, create_task};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn period_windows() {
        let sunday = date(2026, 10, 18);
        assert_eq!(
            period_range(GoalPeriod::Weekly, sunday, WeekStart::Monday),
            Some((date(2026, 10, 12), sunday))
        );
        assert_eq!(
            period_range(GoalPeriod::Weekly, sunday, WeekStart::Sunday),
            Some((sunday, date(2026, 10, 24)))
        );
        assert_eq!(
            period_range(GoalPeriod::Monthly, date(2028, 2, 10), WeekStart::Monday),
            Some((date(2028, 2, 1), date(2028, 2, 29)))
        );
        assert_eq!(period_range(GoalPeriod::Custom, sunday, WeekStart::Monday), None);
    }

    #[test]
    fn progress_is_measured_and_capped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let user = store.profile().expect("profile").user_id;
        let now = Utc
            .with_ymd_and_hms(2026, 10, 15, 9, 0, 0)
            .single()
            .expect("valid now");

        let new_goal = |title: &str, target_type, target_value| NewGoal {
            title: title.to_string(),
            target_type,
            target_value,
            period: GoalPeriod::Weekly,
            range: None,
        };
        create_goal(&store, user, new_goal("Ship", TargetType::TasksCompleted, 2), WeekStart::Monday, now)
            .expect("goal");
        create_goal(&store, user, new_goal("Deep work", TargetType::FocusMinutes, 60), WeekStart::Monday, now)
            .expect("goal");
        create_goal(&store, user, new_goal("Stretch", TargetType::HabitCompletions, 3), WeekStart::Monday, now)
            .expect("goal");

        for title in ["a", "b", "c"] {
            let draft = TaskDraft {
                title: title.to_string(),
                ..TaskDraft::default()
            };
            create_task(&store, user, draft, None, now).expect("task");
        }
        complete_task(&store, user, "1", now).expect("done");
        complete_task(&store, user, "2", now).expect("done");
        complete_task(&store, user, "3", now).expect("done");

        start_session(&store, user, FocusKind::Focus, None, None, now).expect("start");
        stop_session(&store, user, now + Duration::minutes(30)).expect("stop");

        create_habit(&store, user, "Stretch", Frequency::Daily, 1, now).expect("habit");
        log_habit(&store, user, "stretch", date(2026, 10, 14), now).expect("log");

        let goals = refresh_goal_progress(&store, user, WeekStart::Monday, now).expect("refresh");
        let ship = &goals[0];
        assert_eq!(ship.current_value, 3);
        assert_eq!(ship.progress_percent(), 100);
        assert_eq!(ship.completed_at, Some(now));
        assert_eq!(goals[1].current_value, 30);
        assert_eq!(goals[1].progress_percent(), 50);
        assert!(goals[1].completed_at.is_none());
        assert_eq!(goals[2].current_value, 1);
        assert_eq!(goals[2].progress_percent(), 33);

        let later = now + Duration::days(7);
        let rolled = refresh_goal_progress(&store, user, WeekStart::Monday, later).expect("refresh");
        assert_eq!(rolled[0].start_date, date(2026, 10, 19));
        assert_eq!(rolled[0].current_value, 0);
        assert!(rolled[0].completed_at.is_none());
    }

    #[test]
    fn custom_goals_take_manual_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let user = store.profile().expect("profile").user_id;
        let now = Utc
            .with_ymd_and_hms(2026, 10, 15, 9, 0, 0)
            .single()
            .expect("valid now");
        let goal = NewGoal {
            title: "Read books".to_string(),
            target_type: TargetType::Custom,
            target_value: 12,
            period: GoalPeriod::Custom,
            range: None,
        };
        assert!(create_goal(&store, user, goal.clone(), WeekStart::Monday, now).is_err());

        let goal = NewGoal {
            range: Some((date(2026, 1, 1), date(2026, 12, 31))),
            ..goal
        };
        create_goal(&store, user, goal, WeekStart::Monday, now).expect("goal");
        let updated = record_goal_progress(&store, user, "read books", 12, now).expect("progress");
        assert_eq!(updated.progress_percent(), 100);
        assert_eq!(updated.completed_at, Some(now));

        let refreshed = refresh_goal_progress(&store, user, WeekStart::Monday, now).expect("refresh");
        assert_eq!(refreshed[0].current_value, 12);
    }
}
