use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::datastore::{DataStore, Record};
use crate::datetime::{parse_weekday_name, to_project_date};

/// Upper bound on how far back a streak is walked.
const MAX_STREAK_SCAN_DAYS: u32 = 3660;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly { days: Vec<Weekday> },
}

impl Frequency {
    pub fn is_scheduled(&self, day: NaiveDate) -> bool {
        match self {
            Frequency::Daily => true,
            Frequency::Weekly { days } => days.contains(&day.weekday()),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Daily => f.write_str("daily"),
            Frequency::Weekly { days } => {
                let names: Vec<String> = days.iter().map(|d| d.to_string().to_lowercase()).collect();
                f.write_str(&names.join(","))
            }
        }
    }
}

impl FromStr for Frequency {
    type Err = anyhow::Error;

    /// `daily`, or a comma separated weekday list such as `mon,wed,fri`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("daily") {
            return Ok(Frequency::Daily);
        }
        let mut days: Vec<Weekday> = Vec::new();
        for raw in trimmed.split(',') {
            let day = parse_weekday_name(raw.trim())
                .ok_or_else(|| anyhow!("unknown weekday in habit frequency: {raw}"))?;
            if !days.contains(&day) {
                days.push(day);
            }
        }
        if days.is_empty() {
            return Err(anyhow!("habit frequency needs at least one day"));
        }
        days.sort_by_key(|d| d.num_days_from_monday());
        Ok(Frequency::Weekly { days })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Habit {
    pub id: Uuid,

    pub user_id: Uuid,

    pub name: String,

    pub frequency: Frequency,

    #[serde(default = "default_target")]
    pub target_per_day: u32,

    #[serde(default)]
    pub current_streak: u32,

    #[serde(default)]
    pub best_streak: u32,

    #[serde(default)]
    pub archived: bool,

    pub created_at: DateTime<Utc>,
}

fn default_target() -> u32 {
    1
}

impl Record for Habit {
    const FILE: &'static str = "habits.data";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HabitLog {
    pub id: Uuid,

    pub habit_id: Uuid,

    pub user_id: Uuid,

    pub date: NaiveDate,

    pub count: u32,
}

impl Record for HabitLog {
    const FILE: &'static str = "habit_logs.data";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HabitProgress {
    pub habit: Habit,
    pub count: u32,
    /// True only on the log that reached the day's target.
    pub completed_now: bool,
}

/// Consecutive scheduled days meeting the target, ending today, or
/// yesterday's run when today is still open. Unscheduled days are skipped.
pub fn compute_streak(habit: &Habit, logs: &[HabitLog], today: NaiveDate) -> u32 {
    let met = |day: NaiveDate| {
        logs.iter()
            .filter(|log| log.habit_id == habit.id && log.date == day)
            .map(|log| log.count)
            .sum::<u32>()
            >= habit.target_per_day
    };
    let first_day = to_project_date(habit.created_at);

    let mut day = today;
    if habit.frequency.is_scheduled(today) && !met(today) {
        match day.checked_sub_days(Days::new(1)) {
            Some(prev) => day = prev,
            None => return 0,
        }
    }

    let mut streak = 0;
    for _ in 0..MAX_STREAK_SCAN_DAYS {
        if day < first_day {
            break;
        }
        if habit.frequency.is_scheduled(day) {
            if met(day) {
                streak += 1;
            } else {
                break;
            }
        }
        match day.checked_sub_days(Days::new(1)) {
            Some(prev) => day = prev,
            None => break,
        }
    }
    streak
}

#[instrument(skip(store, now))]
pub fn create_habit(
    store: &DataStore,
    user_id: Uuid,
    name: &str,
    frequency: Frequency,
    target_per_day: u32,
    now: DateTime<Utc>,
) -> anyhow::Result<Habit> {
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("habit name cannot be empty"));
    }
    if target_per_day == 0 {
        return Err(anyhow!("daily target must be at least 1"));
    }

    store.update(|habits: &mut Vec<Habit>| {
        if habits
            .iter()
            .any(|h| h.user_id == user_id && !h.archived && h.name.eq_ignore_ascii_case(name))
        {
            return Err(anyhow!("a habit named {name} already exists"));
        }
        let habit = Habit {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            frequency,
            target_per_day,
            current_streak: 0,
            best_streak: 0,
            archived: false,
            created_at: now,
        };
        habits.push(habit.clone());
        info!(habit = %habit.name, "created habit");
        Ok(habit)
    })
}

/// Adds one completion for `date` and refreshes the streaks.
#[instrument(skip(store, now))]
pub fn log_habit(
    store: &DataStore,
    user_id: Uuid,
    name: &str,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> anyhow::Result<HabitProgress> {
    let mut habits = store.load::<Habit>()?;
    let habit = habits
        .iter_mut()
        .find(|h| h.user_id == user_id && !h.archived && h.name.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| anyhow!("no habit named {name}"))?;

    let count = store.update(|logs: &mut Vec<HabitLog>| {
        let count = match logs
            .iter_mut()
            .find(|log| log.habit_id == habit.id && log.date == date)
        {
            Some(log) => {
                log.count += 1;
                log.count
            }
            None => {
                logs.push(HabitLog {
                    id: Uuid::new_v4(),
                    habit_id: habit.id,
                    user_id,
                    date,
                    count: 1,
                });
                1
            }
        };
        Ok(count)
    })?;

    let logs = store.load::<HabitLog>()?;
    habit.current_streak = compute_streak(habit, &logs, to_project_date(now));
    habit.best_streak = habit.best_streak.max(habit.current_streak);
    let completed_now = count == habit.target_per_day;
    let progress = HabitProgress {
        habit: habit.clone(),
        count,
        completed_now,
    };
    debug!(count, streak = habit.current_streak, "logged habit");

    store.save(&habits)?;
    Ok(progress)
}

pub fn habits_for_user(store: &DataStore, user_id: Uuid) -> anyhow::Result<Vec<Habit>> {
    Ok(store
        .load::<Habit>()?
        .into_iter()
        .filter(|h| h.user_id == user_id && !h.archived)
        .collect())
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc, Weekday};
    use uuid::Uuid;

    use super::{Frequency, Habit, HabitLog, compute_streak, create_habit, log_habit};
    use crate::datastore::DataStore;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, day).expect("valid date")
    }

    fn habit(frequency: Frequency, target: u32) -> Habit {
        Habit {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            name: "Read".to_string(),
            frequency,
            target_per_day: target,
            current_streak: 0,
            best_streak: 0,
            archived: false,
            created_at: Utc
                .with_ymd_and_hms(2026, 10, 1, 0, 0, 0)
                .single()
                .expect("valid date"),
        }
    }

    fn log(habit: &Habit, day: u32, count: u32) -> HabitLog {
        HabitLog {
            id: Uuid::new_v4(),
            habit_id: habit.id,
            user_id: habit.user_id,
            date: date(day),
            count,
        }
    }

    #[test]
    fn open_today_does_not_break_streak() {
        let h = habit(Frequency::Daily, 1);
        let mut logs = vec![log(&h, 15, 1), log(&h, 16, 1), log(&h, 17, 1)];
        assert_eq!(compute_streak(&h, &logs, date(18)), 3);
        logs.push(log(&h, 18, 1));
        assert_eq!(compute_streak(&h, &logs, date(18)), 4);
        logs.retain(|l| l.date != date(16));
        assert_eq!(compute_streak(&h, &logs, date(18)), 2);
    }

    #[test]
    fn weekly_habits_skip_unscheduled_days() {
        let frequency: Frequency = "fri, mon,wed".parse().expect("frequency");
        assert_eq!(
            frequency,
            Frequency::Weekly {
                days: vec![Weekday::Mon, Weekday::Wed, Weekday::Fri]
            }
        );
        let h = habit(frequency, 2);
        let logs = vec![log(&h, 12, 2), log(&h, 14, 2), log(&h, 16, 3), log(&h, 9, 1)];
        assert_eq!(compute_streak(&h, &logs, date(18)), 3);
        assert!("someday".parse::<Frequency>().is_err());
    }

    #[test]
    fn logging_reports_target_reached_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let user = store.profile().expect("profile").user_id;
        let now = Utc
            .with_ymd_and_hms(2026, 10, 18, 20, 0, 0)
            .single()
            .expect("valid now");
        create_habit(&store, user, "Water", Frequency::Daily, 2, now).expect("create");

        let first = log_habit(&store, user, "water", date(18), now).expect("log");
        assert!(!first.completed_now);
        let second = log_habit(&store, user, "water", date(18), now).expect("log");
        assert!(second.completed_now);
        assert_eq!(second.habit.current_streak, 1);
        let third = log_habit(&store, user, "water", date(18), now).expect("log");
        assert!(!third.completed_now);
        assert_eq!(third.habit.best_streak, 1);
    }
}
