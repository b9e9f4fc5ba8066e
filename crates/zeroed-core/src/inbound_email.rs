use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::api::ApiError;
use crate::datastore::DataStore;
use crate::pattern::cached_regex;
use crate::quick_add::parse_quick_add;
use crate::task::Task;
use crate::tasks::{TaskDraft, create_task};

pub const MAX_NOTES_CHARS: usize = 5000;
const NO_SUBJECT: &str = "(no subject)";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
}

impl InboundEmail {
    fn from_fields(fields: &HashMap<String, String>) -> anyhow::Result<Self> {
        let pick = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| fields.get(*k).filter(|v| !v.trim().is_empty()))
                .cloned()
                .unwrap_or_default()
        };
        let email = Self {
            from: pick(&["From", "from", "sender"]),
            to: pick(&["OriginalRecipient", "To", "to", "recipient"]),
            subject: pick(&["Subject", "subject"]),
            text: pick(&["TextBody", "stripped-text", "body-plain", "text", "body"]),
        };
        if email.to.trim().is_empty() {
            return Err(anyhow!("inbound email has no recipient"));
        }
        Ok(email)
    }
}

/// Reads Postmark/generic JSON, Mailgun form posts and SendGrid multipart.
pub fn parse_inbound_email(content_type: &str, body: &str) -> anyhow::Result<InboundEmail> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    debug!(mime = %mime, bytes = body.len(), "parsing inbound email");

    let fields: HashMap<String, String> = match mime.as_str() {
        "application/json" => {
            let value: Value =
                serde_json::from_str(body).context("inbound email body is not valid json")?;
            let Value::Object(map) = value else {
                return Err(anyhow!("inbound email json must be an object"));
            };
            map.into_iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k, s)),
                    _ => None,
                })
                .collect()
        }
        "application/x-www-form-urlencoded" => url::form_urlencoded::parse(body.as_bytes())
            .into_owned()
            .collect(),
        "multipart/form-data" => {
            let boundary = multipart_boundary(content_type)
                .ok_or_else(|| anyhow!("multipart body without boundary"))?;
            parse_multipart(body, &boundary)
        }
        other => return Err(anyhow!("unsupported inbound email content type: {other}")),
    };

    InboundEmail::from_fields(&fields)
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Text fields only; file parts are skipped.
fn parse_multipart(body: &str, boundary: &str) -> HashMap<String, String> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let mut fields = HashMap::new();
    let Ok(name_re) = cached_regex(&NAME_RE, r#"(?i)content-disposition:[^\r\n]*\bname="([^"]*)""#)
    else {
        return fields;
    };

    let delimiter = format!("--{boundary}");
    for part in body.split(delimiter.as_str()) {
        let part = part.strip_prefix("\r\n").or_else(|| part.strip_prefix('\n')).unwrap_or(part);
        if part.starts_with("--") || part.trim().is_empty() {
            continue;
        }
        let Some((headers, value)) = part
            .split_once("\r\n\r\n")
            .or_else(|| part.split_once("\n\n"))
        else {
            continue;
        };
        if headers.to_ascii_lowercase().contains("filename=") {
            continue;
        }
        if let Some(caps) = name_re.captures(headers) {
            let value = value
                .strip_suffix("\r\n")
                .or_else(|| value.strip_suffix('\n'))
                .unwrap_or(value);
            fields.insert(caps[1].to_string(), value.to_string());
        }
    }
    fields
}

/// `tasks+abc123@in.example.com` yields `abc123`.
pub fn recipient_token(to: &str) -> Option<String> {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    let re = cached_regex(&TOKEN_RE, r"[A-Za-z0-9._%-]+\+([A-Za-z0-9_-]+)@").ok()?;
    re.captures(to).map(|caps| caps[1].to_ascii_lowercase())
}

/// Creates a task for the account the recipient token belongs to.
#[instrument(skip(store, email, now), fields(to = %email.to))]
pub fn email_to_task(
    store: &DataStore,
    email: &InboundEmail,
    default_list: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Task, ApiError> {
    let token = recipient_token(&email.to)
        .ok_or_else(|| ApiError::BadRequest("recipient has no routing token".to_string()))?;
    let profile = store
        .profile_by_token(&token)?
        .ok_or_else(|| ApiError::NotFound("no account for this address".to_string()))?;

    let subject = email.subject.trim();
    let mut parsed = parse_quick_add(if subject.is_empty() { NO_SUBJECT } else { subject }, now);
    if parsed.title.is_empty() {
        warn!("subject held only task fields; using placeholder title");
        parsed.title = NO_SUBJECT.to_string();
    }

    let notes: String = email.text.trim().chars().take(MAX_NOTES_CHARS).collect();
    let mut draft = TaskDraft::from(parsed);
    draft.notes = Some(notes).filter(|n| !n.is_empty());

    let task = create_task(store, profile.user_id, draft, default_list, now)?;
    info!(number = task.number, from = %email.from, "created task from email");
    Ok(task)
}

/// Whole request: parse, route, create; responds `{ok, taskId, number}`.
pub fn handle_inbound_email(
    store: &DataStore,
    content_type: &str,
    body: &str,
    default_list: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Value, ApiError> {
    let email = parse_inbound_email(content_type, body)
        .map_err(|err| ApiError::BadRequest(format!("{err:#}")))?;
    let task = email_to_task(store, &email, default_list, now)?;
    Ok(json!({ "ok": true, "taskId": task.id, "number": task.number }))
}
