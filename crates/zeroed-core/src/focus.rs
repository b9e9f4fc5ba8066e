use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::datastore::{DataStore, Record};
use crate::task::Task;
use crate::tasks::find_task_index;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusKind {
    Focus,
    ShortBreak,
    LongBreak,
}

impl FocusKind {
    pub fn default_minutes(self) -> u32 {
        match self {
            FocusKind::Focus => 25,
            FocusKind::ShortBreak => 5,
            FocusKind::LongBreak => 15,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FocusKind::Focus => "focus",
            FocusKind::ShortBreak => "short_break",
            FocusKind::LongBreak => "long_break",
        }
    }
}

impl FromStr for FocusKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "focus" | "pomodoro" => Ok(FocusKind::Focus),
            "short" | "short_break" | "break" => Ok(FocusKind::ShortBreak),
            "long" | "long_break" => Ok(FocusKind::LongBreak),
            other => Err(anyhow!("unknown session kind: {other}")),
        }
    }
}

impl fmt::Display for FocusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FocusSession {
    pub id: Uuid,

    pub user_id: Uuid,

    #[serde(default)]
    pub task_id: Option<Uuid>,

    pub kind: FocusKind,

    pub planned_minutes: u32,

    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,

    /// Whole minutes between start and stop, set when the session ends.
    #[serde(default)]
    pub actual_minutes: Option<u32>,
}

impl Record for FocusSession {
    const FILE: &'static str = "focus.data";
}

impl FocusSession {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn planned_end(&self) -> DateTime<Utc> {
        self.started_at + Duration::minutes(i64::from(self.planned_minutes))
    }

    /// Minutes left on the clock; negative once the session overruns.
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        (self.planned_end() - now).num_minutes()
    }
}

fn elapsed_minutes(started_at: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    u32::try_from((now - started_at).num_minutes().max(0)).unwrap_or(u32::MAX)
}

pub fn active_session(store: &DataStore, user_id: Uuid) -> anyhow::Result<Option<FocusSession>> {
    Ok(store
        .load::<FocusSession>()?
        .into_iter()
        .find(|s| s.user_id == user_id && s.is_active()))
}

#[instrument(skip(store, now))]
pub fn start_session(
    store: &DataStore,
    user_id: Uuid,
    kind: FocusKind,
    task_selector: Option<&str>,
    planned_minutes: Option<u32>,
    now: DateTime<Utc>,
) -> anyhow::Result<FocusSession> {
    let task_id = match task_selector {
        Some(selector) => {
            let tasks = store.load::<Task>()?;
            let idx = find_task_index(&tasks, user_id, selector)?;
            Some(tasks[idx].id)
        }
        None => None,
    };
    let planned_minutes = planned_minutes.unwrap_or_else(|| kind.default_minutes());
    if planned_minutes == 0 {
        return Err(anyhow!("a session needs at least one minute"));
    }

    store.update(|sessions: &mut Vec<FocusSession>| {
        if let Some(active) = sessions.iter().find(|s| s.user_id == user_id && s.is_active()) {
            return Err(anyhow!(
                "a {} session is already running since {}",
                active.kind,
                active.started_at.format("%H:%M")
            ));
        }
        let session = FocusSession {
            id: Uuid::new_v4(),
            user_id,
            task_id,
            kind,
            planned_minutes,
            started_at: now,
            ended_at: None,
            actual_minutes: None,
        };
        sessions.push(session.clone());
        info!(kind = %kind, planned_minutes, "started session");
        Ok(session)
    })
}

/// Ends the running session. Focus time is added to the linked task.
#[instrument(skip(store, now))]
pub fn stop_session(
    store: &DataStore,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> anyhow::Result<FocusSession> {
    let session = store.update(|sessions: &mut Vec<FocusSession>| {
        let session = sessions
            .iter_mut()
            .find(|s| s.user_id == user_id && s.is_active())
            .ok_or_else(|| anyhow!("no session is running"))?;
        session.ended_at = Some(now);
        session.actual_minutes = Some(elapsed_minutes(session.started_at, now));
        Ok(session.clone())
    })?;

    let minutes = session.actual_minutes.unwrap_or(0);
    if session.kind == FocusKind::Focus
        && let Some(task_id) = session.task_id
    {
        store.update(|tasks: &mut Vec<Task>| {
            match tasks.iter_mut().find(|t| t.id == task_id) {
                Some(task) => {
                    task.actual_minutes = task.actual_minutes.saturating_add(minutes);
                    task.updated_at = now;
                }
                None => warn!(task = %task_id, "focus session task no longer exists"),
            }
            Ok(())
        })?;
    }

    info!(kind = %session.kind, minutes, "stopped session");
    Ok(session)
}

/// Completed focus minutes with an end inside `[from, to)`.
pub fn focus_minutes_between(
    sessions: &[FocusSession],
    user_id: Uuid,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> u64 {
    sessions
        .iter()
        .filter(|s| s.user_id == user_id && s.kind == FocusKind::Focus)
        .filter(|s| s.ended_at.is_some_and(|end| end >= from && end < to))
        .map(|s| u64::from(s.actual_minutes.unwrap_or(0)))
        .sum()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{FocusKind, active_session, focus_minutes_between, start_session, stop_session};
    use crate::datastore::DataStore;
    use crate::task::Task;
    use crate::tasks::{TaskDraft, create_task};

    #[test]
    fn one_session_at_a_time_and_minutes_land_on_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let user = store.profile().expect("profile").user_id;
        let start = Utc
            .with_ymd_and_hms(2026, 10, 18, 9, 0, 0)
            .single()
            .expect("valid now");
        let draft = TaskDraft {
            title: "Write report".to_string(),
            ..TaskDraft::default()
        };
        let task = create_task(&store, user, draft, None, start).expect("task");

        let session = start_session(&store, user, FocusKind::Focus, Some("1"), None, start)
            .expect("start");
        assert_eq!(session.planned_minutes, 25);
        assert_eq!(session.task_id, Some(task.id));
        assert!(
            start_session(&store, user, FocusKind::ShortBreak, None, None, start).is_err()
        );
        assert!(active_session(&store, user).expect("active").is_some());

        let end = start + Duration::seconds(26 * 60 + 40);
        let stopped = stop_session(&store, user, end).expect("stop");
        assert_eq!(stopped.actual_minutes, Some(26));
        assert!(active_session(&store, user).expect("active").is_none());

        let tasks = store.load::<Task>().expect("tasks");
        assert_eq!(tasks[0].actual_minutes, 26);

        let sessions = store.load::<super::FocusSession>().expect("sessions");
        assert_eq!(
            focus_minutes_between(&sessions, user, start, end + Duration::minutes(1)),
            26
        );
    }

    #[test]
    fn breaks_do_not_count_as_task_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let user = store.profile().expect("profile").user_id;
        let start = Utc
            .with_ymd_and_hms(2026, 10, 18, 9, 0, 0)
            .single()
            .expect("valid now");

        let session = start_session(&store, user, "long".parse().expect("kind"), None, None, start)
            .expect("start");
        assert_eq!(session.planned_minutes, 15);
        assert_eq!(session.remaining_minutes(start + Duration::minutes(5)), 10);
        stop_session(&store, user, start + Duration::minutes(15)).expect("stop");
        assert!(stop_session(&store, user, start + Duration::minutes(16)).is_err());
        assert!("nap".parse::<FocusKind>().is_err());
    }
}
