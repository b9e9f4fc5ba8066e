use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::datastore::{DataStore, Record, random_hex};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOLERANCE_SECS: i64 = 300;
pub const DEFAULT_MAX_FAILURES: u32 = 10;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

pub const EVENT_HEADER: &str = "X-Zeroed-Event";
pub const SIGNATURE_HEADER: &str = "X-Zeroed-Signature";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature header: {0}")]
    Malformed(String),

    #[error("signature timestamp {timestamp} is outside the {tolerance}s tolerance")]
    TimestampOutOfTolerance { timestamp: i64, tolerance: i64 },

    #[error("signature does not match payload")]
    Mismatch,

    #[error("signing secret is empty")]
    InvalidSecret,
}

pub(crate) fn hmac_sha256_hex(secret: &[u8], message: &[u8]) -> Result<String, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub(crate) fn constant_time_eq(left: &str, right: &str) -> bool {
    left.as_bytes().ct_eq(right.as_bytes()).into()
}

/// Signs with the current time. See [`sign_webhook_payload_at`].
pub fn sign_webhook_payload(payload: &str, secret: &str) -> Result<String, SignatureError> {
    sign_webhook_payload_at(payload, secret, Utc::now().timestamp())
}

/// Produces `t=<unix>,v1=<hex hmac-sha256 of "{t}.{payload}">`.
pub fn sign_webhook_payload_at(
    payload: &str,
    secret: &str,
    timestamp: i64,
) -> Result<String, SignatureError> {
    let digest = hmac_sha256_hex(
        secret.as_bytes(),
        format!("{timestamp}.{payload}").as_bytes(),
    )?;
    Ok(format!("t={timestamp},v1={digest}"))
}

pub fn verify_webhook_signature(
    payload: &str,
    header: &str,
    secret: &str,
) -> Result<(), SignatureError> {
    verify_webhook_signature_at(
        payload,
        header,
        secret,
        DEFAULT_TOLERANCE_SECS,
        Utc::now().timestamp(),
    )
}

/// Unsigned distance, so extreme timestamps cannot overflow.
pub(crate) fn within_tolerance(now: i64, timestamp: i64, tolerance_secs: i64) -> bool {
    let tolerance = u64::try_from(tolerance_secs).unwrap_or(0);
    now.abs_diff(timestamp) <= tolerance
}

/// Accepts `k=v` parts in any order; any one matching `v1` passes.
pub fn verify_webhook_signature_at(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            return Err(SignatureError::Malformed(format!("bad segment {part:?}")));
        };
        match key.trim() {
            "t" => {
                let parsed = value.trim().parse::<i64>().map_err(|_| {
                    SignatureError::Malformed(format!("timestamp is not a number: {value}"))
                })?;
                timestamp = Some(parsed);
            }
            "v1" => candidates.push(value.trim()),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| SignatureError::Malformed("missing timestamp".to_string()))?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed("missing v1 signature".to_string()));
    }
    if !within_tolerance(now, timestamp, tolerance_secs) {
        return Err(SignatureError::TimestampOutOfTolerance {
            timestamp,
            tolerance: tolerance_secs,
        });
    }

    let expected = hmac_sha256_hex(
        secret.as_bytes(),
        format!("{timestamp}.{payload}").as_bytes(),
    )?;
    if candidates
        .iter()
        .any(|candidate| constant_time_eq(candidate, &expected))
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.updated")]
    TaskUpdated,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.deleted")]
    TaskDeleted,
    #[serde(rename = "list.created")]
    ListCreated,
    #[serde(rename = "habit.completed")]
    HabitCompleted,
    #[serde(rename = "goal.completed")]
    GoalCompleted,
}

impl WebhookEvent {
    pub const ALL: [WebhookEvent; 7] = [
        WebhookEvent::TaskCreated,
        WebhookEvent::TaskUpdated,
        WebhookEvent::TaskCompleted,
        WebhookEvent::TaskDeleted,
        WebhookEvent::ListCreated,
        WebhookEvent::HabitCompleted,
        WebhookEvent::GoalCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WebhookEvent::TaskCreated => "task.created",
            WebhookEvent::TaskUpdated => "task.updated",
            WebhookEvent::TaskCompleted => "task.completed",
            WebhookEvent::TaskDeleted => "task.deleted",
            WebhookEvent::ListCreated => "list.created",
            WebhookEvent::HabitCompleted => "habit.completed",
            WebhookEvent::GoalCompleted => "goal.completed",
        }
    }
}

impl FromStr for WebhookEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        WebhookEvent::ALL
            .into_iter()
            .find(|event| event.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| anyhow!("unsupported webhook event: {wanted}"))
    }
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutgoingWebhook {
    pub id: Uuid,

    pub user_id: Uuid,

    pub url: String,

    pub secret: String,

    pub events: Vec<WebhookEvent>,

    #[serde(default = "default_active")]
    pub is_active: bool,

    #[serde(default)]
    pub consecutive_failures: u32,

    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_status: Option<u16>,

    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Record for OutgoingWebhook {
    const FILE: &'static str = "webhooks.data";
}

impl OutgoingWebhook {
    pub fn wants(&self, event: WebhookEvent) -> bool {
        self.is_active && self.events.contains(&event)
    }
}

/// Body of every delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

pub fn generate_webhook_secret() -> String {
    format!("whsec_{}", random_hex(32))
}

#[instrument(skip(store, secret, now))]
pub fn register_webhook(
    store: &DataStore,
    user_id: Uuid,
    url: &str,
    events: &[String],
    secret: Option<String>,
    now: DateTime<Utc>,
) -> anyhow::Result<OutgoingWebhook> {
    let parsed = url::Url::parse(url.trim()).with_context(|| format!("invalid webhook url {url}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(anyhow!("webhook url must be http or https: {url}"));
    }

    let mut wanted: Vec<WebhookEvent> = Vec::new();
    for name in events {
        let event: WebhookEvent = name.parse()?;
        if !wanted.contains(&event) {
            wanted.push(event);
        }
    }
    if wanted.is_empty() {
        return Err(anyhow!("a webhook needs at least one event"));
    }

    let hook = OutgoingWebhook {
        id: Uuid::new_v4(),
        user_id,
        url: parsed.to_string(),
        secret: secret
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(generate_webhook_secret),
        events: wanted,
        is_active: true,
        consecutive_failures: 0,
        last_triggered_at: None,
        last_status: None,
        created_at: now,
    };

    store.update(|hooks: &mut Vec<OutgoingWebhook>| {
        hooks.push(hook.clone());
        Ok(())
    })?;
    info!(id = %hook.id, url = %hook.url, "registered webhook");
    Ok(hook)
}

pub fn webhooks_for_user(store: &DataStore, user_id: Uuid) -> anyhow::Result<Vec<OutgoingWebhook>> {
    Ok(store
        .load::<OutgoingWebhook>()?
        .into_iter()
        .filter(|h| h.user_id == user_id)
        .collect())
}

/// Removes by full id or id prefix.
#[instrument(skip(store))]
pub fn remove_webhook(store: &DataStore, user_id: Uuid, selector: &str) -> anyhow::Result<OutgoingWebhook> {
    store.update(|hooks: &mut Vec<OutgoingWebhook>| {
        let needle = selector.trim().to_ascii_lowercase();
        let idx = hooks
            .iter()
            .position(|h| h.user_id == user_id && h.id.to_string().starts_with(&needle))
            .ok_or_else(|| anyhow!("no webhook matches {selector}"))?;
        let removed = hooks.remove(idx);
        info!(id = %removed.id, "removed webhook");
        Ok(removed)
    })
}

/// Delivers a signed JSON body and reports the HTTP status.
pub trait WebhookTransport {
    fn post(&self, url: &str, headers: &[(&str, String)], body: &str) -> anyhow::Result<u16>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed building HTTP client for webhooks")?;
        Ok(Self { client })
    }
}

impl WebhookTransport for HttpTransport {
    fn post(&self, url: &str, headers: &[(&str, String)], body: &str) -> anyhow::Result<u16> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let response = request
            .body(body.to_string())
            .send()
            .with_context(|| format!("POST {url} failed"))?;
        Ok(response.status().as_u16())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub disabled: Vec<Uuid>,
}

pub struct WebhookDispatcher<T: WebhookTransport> {
    transport: T,
    max_failures: u32,
}

impl<T: WebhookTransport> WebhookDispatcher<T> {
    pub fn new(transport: T, max_failures: u32) -> Self {
        Self {
            transport,
            max_failures: max_failures.max(1),
        }
    }

    /// Sends `event` to every active hook subscribed to it, updating
    /// each hook's failure bookkeeping in place.
    #[instrument(skip(self, hooks, data, now), fields(event = %event))]
    pub fn dispatch<'a, I>(
        &self,
        hooks: I,
        event: WebhookEvent,
        data: &Value,
        now: DateTime<Utc>,
    ) -> anyhow::Result<DispatchReport>
    where
        I: IntoIterator<Item = &'a mut OutgoingWebhook>,
    {
        let payload = WebhookPayload {
            event,
            timestamp: now,
            data: data.clone(),
        };
        let body = serde_json::to_string(&payload)?;
        let mut report = DispatchReport::default();

        for hook in hooks.into_iter().filter(|h| h.wants(event)) {
            let signature = sign_webhook_payload_at(&body, &hook.secret, now.timestamp())
                .with_context(|| format!("cannot sign for webhook {}", hook.id))?;
            let headers = [
                (EVENT_HEADER, event.as_str().to_string()),
                (SIGNATURE_HEADER, signature),
            ];

            let outcome = self.transport.post(&hook.url, &headers, &body);
            hook.last_triggered_at = Some(now);
            match outcome {
                Ok(status) if (200..300).contains(&status) => {
                    debug!(hook = %hook.id, status, "webhook delivered");
                    hook.consecutive_failures = 0;
                    hook.last_status = Some(status);
                    report.delivered += 1;
                    continue;
                }
                Ok(status) => {
                    warn!(hook = %hook.id, status, "webhook rejected delivery");
                    hook.last_status = Some(status);
                }
                Err(err) => {
                    warn!(hook = %hook.id, error = %err, "webhook delivery failed");
                    hook.last_status = None;
                }
            }

            report.failed += 1;
            hook.consecutive_failures += 1;
            if hook.consecutive_failures >= self.max_failures {
                hook.is_active = false;
                report.disabled.push(hook.id);
                warn!(
                    hook = %hook.id,
                    failures = hook.consecutive_failures,
                    "webhook disabled after repeated failures"
                );
            }
        }

        Ok(report)
    }

    /// Dispatches to the user's stored hooks and persists their new state.
    pub fn dispatch_for_user(
        &self,
        store: &DataStore,
        user_id: Uuid,
        event: WebhookEvent,
        data: &Value,
        now: DateTime<Utc>,
    ) -> anyhow::Result<DispatchReport> {
        let mut hooks = store.load::<OutgoingWebhook>()?;
        if !hooks.iter().any(|h| h.user_id == user_id && h.wants(event)) {
            return Ok(DispatchReport::default());
        }
        let report = self.dispatch(
            hooks.iter_mut().filter(|h| h.user_id == user_id),
            event,
            data,
            now,
        )?;
        store.save(&hooks)?;
        Ok(report)
    }
}
