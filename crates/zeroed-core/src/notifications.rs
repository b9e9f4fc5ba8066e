use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::api::ApiError;
use crate::datastore::DataStore;
use crate::datetime::{project_local_to_utc, to_project_date};
use crate::integrations::{Integration, Provider};
use crate::slack::task_line;
use crate::task::Task;
use crate::tasks::due_or_overdue;
use crate::webhook::constant_time_eq;

/// Cron endpoints accept only `Bearer <cron.secret>`.
pub fn authorize_cron(authorization: Option<&str>, secret: Option<&str>) -> Result<(), ApiError> {
    let Some(secret) = secret.filter(|s| !s.trim().is_empty()) else {
        warn!("cron secret is not configured; refusing cron request");
        return Err(ApiError::Unauthorized("cron secret is not configured".to_string()));
    };
    let presented = authorization
        .and_then(|h| h.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();
    if constant_time_eq(presented, secret) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("invalid cron credentials".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub text: String,
    pub blocks: Vec<Value>,
}

/// Delivers a message through one of the user's integrations.
pub trait Notifier {
    fn send(&self, integration: &Integration, message: &Notification) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct SlackNotifier {
    http: reqwest::blocking::Client,
}

impl SlackNotifier {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed building HTTP client for slack notifications")?;
        Ok(Self { http })
    }
}

impl Notifier for SlackNotifier {
    fn send(&self, integration: &Integration, message: &Notification) -> anyhow::Result<()> {
        let url = integration
            .setting_str("webhook_url")
            .ok_or_else(|| anyhow!("slack integration has no webhook_url"))?;
        let response = self
            .http
            .post(url)
            .json(message)
            .send()
            .context("slack webhook request failed")?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("slack webhook answered {status}"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CronFailure {
    pub user_id: Uuid,
    pub subject: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CronReport {
    pub processed: usize,
    pub sent: usize,
    pub skipped: usize,
    pub errors: Vec<CronFailure>,
}

fn digest_message(tasks: &[&Task], now: DateTime<Utc>) -> Notification {
    let today = to_project_date(now);
    let overdue = tasks.iter().filter(|t| t.due_date.is_some_and(|d| d < today)).count();
    let header = format!(
        "*Good morning!* {} task(s) on your plate today{}.",
        tasks.len(),
        if overdue > 0 {
            format!(", {overdue} overdue")
        } else {
            String::new()
        }
    );
    let lines: Vec<String> = tasks.iter().map(|t| task_line(t, today)).collect();
    Notification {
        text: format!("Your Zeroed digest for {}", today.format("%A, %b %-d")),
        blocks: vec![
            json!({ "type": "section", "text": { "type": "mrkdwn", "text": header } }),
            json!({ "type": "section", "text": { "type": "mrkdwn", "text": lines.join("\n") } }),
        ],
    }
}

fn slack_integrations(rows: &mut [Integration]) -> impl Iterator<Item = &mut Integration> {
    rows.iter_mut()
        .filter(|row| row.provider == Provider::Slack && row.enabled)
}

/// Sends each opted-in Slack user their open tasks due today or earlier.
/// A failing user is recorded and the run moves on.
#[instrument(skip(store, notifier, now))]
pub fn run_daily_digest(
    store: &DataStore,
    notifier: &dyn Notifier,
    now: DateTime<Utc>,
) -> anyhow::Result<CronReport> {
    let today = to_project_date(now);
    let tasks = store.load::<Task>()?;
    let mut rows = store.load::<Integration>()?;
    let mut report = CronReport::default();

    for integration in slack_integrations(&mut rows) {
        if integration.setting_bool("daily_digest") == Some(false) {
            continue;
        }
        report.processed += 1;

        let owned: Vec<Task> = tasks
            .iter()
            .filter(|t| t.user_id == integration.user_id)
            .cloned()
            .collect();
        let due = due_or_overdue(&owned, today);
        if due.is_empty() {
            debug!(user = %integration.user_id, "nothing due; skipping digest");
            report.skipped += 1;
            continue;
        }

        match notifier.send(integration, &digest_message(&due, now)) {
            Ok(()) => {
                report.sent += 1;
                integration.last_synced_at = Some(now);
                integration.last_error = None;
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(user = %integration.user_id, error = %error, "digest delivery failed");
                integration.last_error = Some(error.clone());
                report.errors.push(CronFailure {
                    user_id: integration.user_id,
                    subject: integration.id.to_string(),
                    error,
                });
            }
        }
    }

    store.save(&rows)?;
    info!(
        processed = report.processed,
        sent = report.sent,
        errors = report.errors.len(),
        "daily digest finished"
    );
    Ok(report)
}

/// Reminds once about timed tasks falling due within `lead_minutes`.
#[instrument(skip(store, notifier, now))]
pub fn run_due_reminders(
    store: &DataStore,
    notifier: &dyn Notifier,
    lead_minutes: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<CronReport> {
    let horizon = chrono::TimeDelta::try_minutes(lead_minutes)
        .and_then(|lead| now.checked_add_signed(lead))
        .ok_or_else(|| anyhow!("reminders.lead_minutes is out of range: {lead_minutes}"))?;
    let today = to_project_date(now);
    let mut tasks = store.load::<Task>()?;
    let mut rows = store.load::<Integration>()?;
    let mut report = CronReport::default();
    let mut stamped = 0_usize;

    for task in tasks.iter_mut() {
        if !task.is_open() || task.reminder_sent_at.is_some() {
            continue;
        }
        let (Some(date), Some(time)) = (task.due_date, task.due_time) else {
            continue;
        };
        let due_at = match project_local_to_utc(date.and_time(time)) {
            Ok(at) => at,
            Err(err) => {
                warn!(task = %task.id, error = %err, "cannot place due time; skipping");
                continue;
            }
        };
        if due_at < now || due_at > horizon {
            continue;
        }
        report.processed += 1;

        let Some(integration) =
            slack_integrations(&mut rows).find(|row| row.user_id == task.user_id)
        else {
            report.skipped += 1;
            continue;
        };

        let line = task_line(task, today);
        let message = Notification {
            text: format!("Reminder: {} is due at {}", task.title, time.format("%H:%M")),
            blocks: vec![json!({
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!(":alarm_clock: Coming up\n{line}") }
            })],
        };
        match notifier.send(integration, &message) {
            Ok(()) => {
                task.reminder_sent_at = Some(now);
                stamped += 1;
                report.sent += 1;
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(task = %task.id, error = %error, "reminder delivery failed");
                integration.last_error = Some(error.clone());
                report.errors.push(CronFailure {
                    user_id: task.user_id,
                    subject: task.id.to_string(),
                    error,
                });
            }
        }
    }

    if stamped > 0 {
        store.save(&tasks)?;
    }
    if !report.errors.is_empty() {
        store.save(&rows)?;
    }
    info!(sent = report.sent, errors = report.errors.len(), "due reminders finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
    use parking_lot::Mutex;
    use serde_json::{Map, Value};
    use uuid::Uuid;

    use super::{
        Notification, Notifier, authorize_cron, run_daily_digest, run_due_reminders,
    };
    use crate::datastore::DataStore;
    use crate::integrations::{Integration, Provider, TokenGrant, connect};
    use crate::task::Task;

    struct Recorder {
        fail_for: Option<Uuid>,
        sent: Mutex<Vec<(Uuid, String)>>,
    }

    impl Notifier for Recorder {
        fn send(&self, integration: &Integration, message: &Notification) -> anyhow::Result<()> {
            if self.fail_for == Some(integration.user_id) {
                return Err(anyhow::anyhow!("channel_not_found"));
            }
            self.sent.lock().push((integration.user_id, message.text.clone()));
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0)
            .single()
            .expect("valid now")
    }

    fn link_slack(store: &DataStore, user: Uuid, digest: bool) {
        let mut settings = Map::new();
        settings.insert("daily_digest".to_string(), Value::Bool(digest));
        connect(
            store,
            user,
            Provider::Slack,
            TokenGrant {
                access_token: "xoxb".to_string(),
                settings,
                ..TokenGrant::default()
            },
            now(),
        )
        .expect("connect");
    }

    fn due_task(user: Uuid, number: u64, date: NaiveDate, time: Option<NaiveTime>) -> Task {
        let mut task = Task::new_pending(user, format!("task {number}"), now(), number);
        task.due_date = Some(date);
        task.due_time = time;
        task
    }

    #[test]
    fn cron_requires_matching_bearer_secret() {
        assert!(authorize_cron(Some("Bearer s3cret"), Some("s3cret")).is_ok());
        assert!(authorize_cron(Some("Bearer nope"), Some("s3cret")).is_err());
        assert!(authorize_cron(Some("s3cret"), Some("s3cret")).is_err());
        assert!(authorize_cron(Some("Bearer "), None).is_err());
    }

    #[test]
    fn digest_continues_past_failing_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        link_slack(&store, alice, true);
        link_slack(&store, bob, true);
        link_slack(&store, carol, false);

        let today = NaiveDate::from_ymd_opt(2026, 10, 18).expect("date");
        let yesterday = NaiveDate::from_ymd_opt(2026, 10, 17).expect("date");
        store
            .save(&[
                due_task(alice, 1, today, None),
                due_task(bob, 2, yesterday, None),
                due_task(carol, 3, today, None),
            ])
            .expect("seed");

        let notifier = Recorder {
            fail_for: Some(alice),
            sent: Mutex::new(vec![]),
        };
        let report = run_daily_digest(&store, &notifier, now()).expect("digest");
        assert_eq!(report.processed, 2);
        assert_eq!(report.sent, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].user_id, alice);
        assert_eq!(notifier.sent.lock()[0].0, bob);

        let rows = store.load::<Integration>().expect("rows");
        let alice_row = rows.iter().find(|r| r.user_id == alice).expect("alice");
        assert_eq!(alice_row.last_error.as_deref(), Some("channel_not_found"));
    }

    #[test]
    fn reminders_fire_once_inside_the_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let user = Uuid::new_v4();
        link_slack(&store, user, true);

        let today = NaiveDate::from_ymd_opt(2026, 10, 18).expect("date");
        store
            .save(&[
                due_task(user, 1, today, NaiveTime::from_hms_opt(8, 10, 0)),
                due_task(user, 2, today, NaiveTime::from_hms_opt(9, 30, 0)),
                due_task(user, 3, today, None),
            ])
            .expect("seed");

        let notifier = Recorder {
            fail_for: None,
            sent: Mutex::new(vec![]),
        };
        let first = run_due_reminders(&store, &notifier, 15, now()).expect("run");
        assert_eq!(first.sent, 1);
        let second = run_due_reminders(&store, &notifier, 15, now()).expect("rerun");
        assert_eq!(second.sent, 0);

        let tasks = store.load::<Task>().expect("tasks");
        assert!(tasks[0].reminder_sent_at.is_some());
        assert!(tasks[1].reminder_sent_at.is_none());
    }

    #[test]
    fn oversized_lead_time_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let notifier = Recorder {
            fail_for: None,
            sent: Mutex::new(vec![]),
        };
        for lead in [i64::MAX, i64::MIN] {
            let err = run_due_reminders(&store, &notifier, lead, now()).expect_err("range");
            assert!(err.to_string().contains("lead_minutes"), "{err}");
        }
    }
}
