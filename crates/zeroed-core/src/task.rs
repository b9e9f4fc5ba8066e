use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datastore::Record;
use crate::datetime::hhmm_serde;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "todo" => Ok(TaskStatus::Pending),
            "in_progress" | "in-progress" | "doing" => Ok(TaskStatus::InProgress),
            "completed" | "done" => Ok(TaskStatus::Completed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(anyhow!("unknown task status: {other}")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared low to high so the derived ordering follows rank.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 3,
            Priority::Urgent => 4,
        }
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "l" | "p4" => Ok(Priority::Low),
            "medium" | "med" | "m" | "p3" => Ok(Priority::Medium),
            "high" | "h" | "p2" => Ok(Priority::High),
            "urgent" | "u" | "p1" => Ok(Priority::Urgent),
            other => Err(anyhow!("unknown priority: {other}")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,

    pub number: u64,

    pub user_id: Uuid,

    #[serde(default)]
    pub team_id: Option<Uuid>,

    #[serde(default)]
    pub project_id: Option<Uuid>,

    #[serde(default)]
    pub assignee_id: Option<Uuid>,

    pub title: String,

    #[serde(default)]
    pub notes: Option<String>,

    pub status: TaskStatus,

    #[serde(default)]
    pub priority: Option<Priority>,

    #[serde(default)]
    pub due_date: Option<NaiveDate>,

    #[serde(default, with = "hhmm_serde")]
    pub due_time: Option<NaiveTime>,

    #[serde(default)]
    pub estimated_minutes: Option<u32>,

    #[serde(default)]
    pub actual_minutes: u32,

    #[serde(default)]
    pub list_id: Option<Uuid>,

    #[serde(default)]
    pub position: i64,

    #[serde(default)]
    pub parent_id: Option<Uuid>,

    #[serde(default)]
    pub tags: Vec<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub reminder_sent_at: Option<DateTime<Utc>>,
}

impl Record for Task {
    const FILE: &'static str = "tasks.data";
}

impl Task {
    pub fn new_pending(user_id: Uuid, title: String, now: DateTime<Utc>, number: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            user_id,
            team_id: None,
            project_id: None,
            assignee_id: None,
            title,
            notes: None,
            status: TaskStatus::Pending,
            priority: None,
            due_date: None,
            due_time: None,
            estimated_minutes: None,
            actual_minutes: 0,
            list_id: None,
            position: 0,
            parent_id: None,
            tags: vec![],
            created_at: now,
            updated_at: now,
            completed_at: None,
            reminder_sent_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.is_open() && self.due_date.map(|due| due < today).unwrap_or(false)
    }

    pub fn is_due_on(&self, day: NaiveDate) -> bool {
        self.due_date == Some(day)
    }

    /// Moves the task to `status`, keeping `completed_at` in step.
    pub fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        if status == TaskStatus::Completed {
            if self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
        } else {
            self.completed_at = None;
        }
        self.status = status;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskList {
    pub id: Uuid,

    pub user_id: Uuid,

    pub name: String,

    #[serde(default)]
    pub color: Option<String>,

    #[serde(default)]
    pub icon: Option<String>,

    #[serde(default)]
    pub is_archived: bool,

    #[serde(default)]
    pub position: i64,

    pub created_at: DateTime<Utc>,
}

impl Record for TaskList {
    const FILE: &'static str = "lists.data";
}

impl TaskList {
    pub fn new(user_id: Uuid, name: String, position: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name,
            color: None,
            icon: None,
            is_archived: false,
            position,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    use super::{Priority, Task, TaskStatus};

    #[test]
    fn priority_orders_by_rank() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!("p1".parse::<Priority>().expect("parse"), Priority::Urgent);
    }

    #[test]
    fn completion_stamps_and_clears_completed_at() {
        let now = Utc
            .with_ymd_and_hms(2026, 10, 18, 9, 0, 0)
            .single()
            .expect("valid now");
        let mut task = Task::new_pending(Uuid::new_v4(), "Ship it".to_string(), now, 1);

        task.set_status(TaskStatus::Completed, now);
        assert_eq!(task.completed_at, Some(now));
        assert!(!task.is_open());

        task.set_status(TaskStatus::Pending, now);
        assert_eq!(task.completed_at, None);
    }

    #[test]
    fn due_time_serializes_as_hour_minute() {
        let now = Utc
            .with_ymd_and_hms(2026, 10, 18, 9, 0, 0)
            .single()
            .expect("valid now");
        let mut task = Task::new_pending(Uuid::new_v4(), "Dentist".to_string(), now, 1);
        task.due_date = NaiveDate::from_ymd_opt(2026, 10, 19);
        task.due_time = chrono::NaiveTime::from_hms_opt(15, 0, 0);

        let json = serde_json::to_value(&task).expect("serialize");
        assert_eq!(json["due_time"], "15:00");
        assert_eq!(json["due_date"], "2026-10-19");
        assert_eq!(json["status"], "pending");

        let back: Task = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, task);
    }
}
