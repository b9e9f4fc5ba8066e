use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::api::ApiError;
use crate::datastore::DataStore;
use crate::datetime::to_project_date;
use crate::integrations::{Integration, Provider};
use crate::quick_add::parse_quick_add;
use crate::task::Task;
use crate::tasks::{TaskDraft, complete_task, create_task, due_or_overdue, tasks_for_user};
use crate::webhook::{
    DEFAULT_TOLERANCE_SECS, SignatureError, constant_time_eq, hmac_sha256_hex, within_tolerance,
};

/// Checks Slack's `v0=` request signature over `v0:{timestamp}:{body}`.
pub fn verify_slack_request(
    signing_secret: &str,
    timestamp: &str,
    body: &str,
    signature: &str,
    now: i64,
) -> Result<(), SignatureError> {
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::Malformed(format!("bad slack timestamp {timestamp:?}")))?;
    if !within_tolerance(now, ts, DEFAULT_TOLERANCE_SECS) {
        return Err(SignatureError::TimestampOutOfTolerance {
            timestamp: ts,
            tolerance: DEFAULT_TOLERANCE_SECS,
        });
    }
    if !signature.starts_with("v0=") {
        return Err(SignatureError::Malformed("slack signature lacks v0= prefix".to_string()));
    }

    let expected = format!(
        "v0={}",
        hmac_sha256_hex(signing_secret.as_bytes(), format!("v0:{ts}:{body}").as_bytes())?
    );
    if constant_time_eq(signature.trim(), &expected) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlashCommand {
    pub command: String,
    pub text: String,
    pub user_id: String,
    pub team_id: String,
    pub channel_id: String,
    pub response_url: Option<String>,
}

impl SlashCommand {
    pub fn from_form(body: &str) -> Self {
        let mut cmd = SlashCommand::default();
        for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
            match key.as_ref() {
                "command" => cmd.command = value.into_owned(),
                "text" => cmd.text = value.into_owned(),
                "user_id" => cmd.user_id = value.into_owned(),
                "team_id" => cmd.team_id = value.into_owned(),
                "channel_id" => cmd.channel_id = value.into_owned(),
                "response_url" => cmd.response_url = Some(value.into_owned()),
                _ => {}
            }
        }
        cmd
    }
}

/// Ephemeral Block Kit reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlackResponse {
    pub response_type: &'static str,
    pub text: String,
    pub blocks: Vec<Value>,
}

impl SlackResponse {
    fn ephemeral(text: impl Into<String>, blocks: Vec<Value>) -> Self {
        Self {
            response_type: "ephemeral",
            text: text.into(),
            blocks,
        }
    }

    fn plain(text: impl Into<String>) -> Self {
        let text = text.into();
        let blocks = vec![section(&text)];
        Self::ephemeral(text, blocks)
    }
}

fn section(markdown: &str) -> Value {
    json!({ "type": "section", "text": { "type": "mrkdwn", "text": markdown } })
}

fn context(markdown: &str) -> Value {
    json!({ "type": "context", "elements": [ { "type": "mrkdwn", "text": markdown } ] })
}

pub(crate) fn task_line(task: &Task, today: chrono::NaiveDate) -> String {
    let mut line = format!("• *#{}* {}", task.number, task.title);
    if let Some(due) = task.due_date {
        if due < today {
            line.push_str(&format!(" _(overdue since {})_", due.format("%b %-d")));
        } else if let Some(time) = task.due_time {
            line.push_str(&format!(" _at {}_", time.format("%H:%M")));
        }
    }
    if let Some(priority) = task.priority {
        line.push_str(&format!(" `{priority}`"));
    }
    line
}

fn help_response() -> SlackResponse {
    SlackResponse::ephemeral(
        "Zeroed commands",
        vec![
            section(
                "*Zeroed commands*\n\
                 `/bruh today` shows what is due today or overdue\n\
                 `/bruh add <task>` adds a task, e.g. `/bruh add Call mom tomorrow at 5pm !high`\n\
                 `/bruh done <number or title>` completes a task\n\
                 `/bruh help` shows this message",
            ),
            context("Dates, times, #tags, @lists, !priority and ~estimates are understood."),
        ],
    )
}

fn linked_user(store: &DataStore, slack_user_id: &str) -> anyhow::Result<Option<Uuid>> {
    Ok(store
        .load::<Integration>()?
        .into_iter()
        .find(|row| {
            row.provider == Provider::Slack
                && row.enabled
                && row.setting_str("slack_user_id") == Some(slack_user_id)
        })
        .map(|row| row.user_id))
}

/// Runs `/bruh <sub-command>` for the linked local user.
#[instrument(skip(store, cmd, now), fields(slack_user = %cmd.user_id))]
pub fn handle_slash_command(
    store: &DataStore,
    cmd: &SlashCommand,
    default_list: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<SlackResponse> {
    let text = cmd.text.trim();
    let (sub, rest) = match text.split_once(char::is_whitespace) {
        Some((sub, rest)) => (sub.to_ascii_lowercase(), rest.trim()),
        None => (text.to_ascii_lowercase(), ""),
    };
    debug!(sub = %sub, "slash command");

    if sub.is_empty() || sub == "help" {
        return Ok(help_response());
    }

    let Some(user_id) = linked_user(store, &cmd.user_id)? else {
        warn!("slash command from unlinked slack user");
        return Ok(SlackResponse::plain(
            "Your Slack account is not linked to Zeroed yet. Connect Slack from the \
             integrations page first.",
        ));
    };
    let today = to_project_date(now);

    match sub.as_str() {
        "today" => {
            let tasks = tasks_for_user(store, user_id)?;
            let due = due_or_overdue(&tasks, today);
            if due.is_empty() {
                return Ok(SlackResponse::plain("Nothing due today. Zeroed out. :tada:"));
            }
            let lines: Vec<String> = due.iter().map(|t| task_line(t, today)).collect();
            let header = format!("*{} task(s) for today*", due.len());
            Ok(SlackResponse::ephemeral(
                header.clone(),
                vec![section(&header), section(&lines.join("\n"))],
            ))
        }
        "add" => {
            if rest.is_empty() {
                return Ok(SlackResponse::plain("Usage: `/bruh add <task>`"));
            }
            let parsed = parse_quick_add(rest, now);
            if parsed.title.is_empty() {
                return Ok(SlackResponse::plain("That task needs a title."));
            }
            let task = create_task(store, user_id, TaskDraft::from(parsed), default_list, now)?;
            info!(number = task.number, "task added from slack");
            Ok(SlackResponse::ephemeral(
                format!("Added #{}: {}", task.number, task.title),
                vec![
                    section(&format!(":white_check_mark: Added {}", task_line(&task, today))),
                    context("Use `/bruh done` with the number to complete it."),
                ],
            ))
        }
        "done" => {
            if rest.is_empty() {
                return Ok(SlackResponse::plain("Usage: `/bruh done <number or title>`"));
            }
            let tasks = tasks_for_user(store, user_id)?;
            let selector = rest.trim_start_matches('#');
            let targets: Vec<&Task> = match selector.parse::<u64>() {
                Ok(number) => tasks.iter().filter(|t| t.number == number).collect(),
                Err(_) => {
                    let needle = selector.to_lowercase();
                    tasks
                        .iter()
                        .filter(|t| t.is_open() && t.title.to_lowercase().contains(&needle))
                        .collect()
                }
            };
            match targets.as_slice() {
                [] => Ok(SlackResponse::plain(format!("No open task matches `{rest}`."))),
                [task] => {
                    let done = complete_task(store, user_id, &task.number.to_string(), now)?;
                    Ok(SlackResponse::plain(format!(
                        ":tada: Completed #{}: {}",
                        done.number, done.title
                    )))
                }
                many => {
                    let lines: Vec<String> =
                        many.iter().take(5).map(|t| task_line(t, today)).collect();
                    Ok(SlackResponse::ephemeral(
                        "More than one task matches",
                        vec![
                            section("*More than one task matches.* Use the number:"),
                            section(&lines.join("\n")),
                        ],
                    ))
                }
            }
        }
        _ => Ok(help_response()),
    }
}

/// Full inbound request: verify, parse the form, run the command.
#[instrument(skip_all)]
pub fn handle_slack_request(
    store: &DataStore,
    signing_secret: Option<&str>,
    timestamp: &str,
    signature: &str,
    body: &str,
    default_list: Option<&str>,
    now: DateTime<Utc>,
) -> Result<SlackResponse, ApiError> {
    let secret = signing_secret
        .ok_or_else(|| ApiError::Unavailable("slack signing secret is not configured".to_string()))?;
    verify_slack_request(secret, timestamp, body, signature, now.timestamp())?;
    let cmd = SlashCommand::from_form(body);
    Ok(handle_slash_command(store, &cmd, default_list, now)?)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::{Map, Value};

    use super::{SlashCommand, handle_slash_command, verify_slack_request};
    use crate::datastore::DataStore;
    use crate::integrations::{Provider, TokenGrant, connect};
    use crate::task::TaskStatus;
    use crate::tasks::tasks_for_user;
    use crate::webhook::{SignatureError, hmac_sha256_hex};

    #[test]
    fn verifies_slack_signature_scheme() {
        let body = "command=%2Fbruh&text=today";
        let sig = format!(
            "v0={}",
            hmac_sha256_hex(b"slack-secret", format!("v0:1000:{body}").as_bytes()).expect("mac")
        );
        assert_eq!(verify_slack_request("slack-secret", "1000", body, &sig, 1_100), Ok(()));
        assert_eq!(
            verify_slack_request("slack-secret", "1000", "text=done", &sig, 1_100),
            Err(SignatureError::Mismatch)
        );
        assert!(matches!(
            verify_slack_request("slack-secret", "1000", body, &sig, 2_000),
            Err(SignatureError::TimestampOutOfTolerance { .. })
        ));
        for extreme in [i64::MIN, i64::MAX] {
            assert!(matches!(
                verify_slack_request("slack-secret", &extreme.to_string(), body, &sig, 1_100),
                Err(SignatureError::TimestampOutOfTolerance { .. })
            ));
        }
    }

    #[test]
    fn parses_url_encoded_form() {
        let cmd = SlashCommand::from_form(
            "command=%2Fbruh&text=add+Call+mom+%23family&user_id=U1&team_id=T1",
        );
        assert_eq!(cmd.command, "/bruh");
        assert_eq!(cmd.text, "add Call mom #family");
        assert_eq!(cmd.user_id, "U1");
    }

    #[test]
    fn add_today_done_flow_for_linked_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let user = store.profile().expect("profile").user_id;
        let now = Utc
            .with_ymd_and_hms(2026, 10, 18, 12, 0, 0)
            .single()
            .expect("valid now");

        let mut settings = Map::new();
        settings.insert("slack_user_id".to_string(), Value::from("U1"));
        connect(
            &store,
            user,
            Provider::Slack,
            TokenGrant {
                access_token: "xoxb".to_string(),
                settings,
                ..TokenGrant::default()
            },
            now,
        )
        .expect("connect");

        let run = |text: &str| {
            let cmd = SlashCommand {
                text: text.to_string(),
                user_id: "U1".to_string(),
                ..SlashCommand::default()
            };
            handle_slash_command(&store, &cmd, Some("Inbox"), now).expect("handled")
        };

        let added = run("add Water plants today !high");
        assert_eq!(added.response_type, "ephemeral");
        assert!(added.text.contains("Water plants"));

        let today = run("today");
        assert!(today.text.contains("1 task(s)"));

        run("done water");
        let tasks = tasks_for_user(&store, user).expect("tasks");
        assert_eq!(tasks[0].status, TaskStatus::Completed);

        let unlinked = handle_slash_command(
            &store,
            &SlashCommand {
                text: "today".to_string(),
                user_id: "U2".to_string(),
                ..SlashCommand::default()
            },
            None,
            now,
        )
        .expect("handled");
        assert!(unlinked.text.contains("not linked"));

        assert!(run("").text.contains("commands"));
    }
}
