use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::api::ApiError;
use crate::datastore::{DataStore, Record};
use crate::webhook::{DEFAULT_TOLERANCE_SECS, verify_webhook_signature_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }

    /// Maps Stripe's wider status vocabulary onto ours.
    fn from_stripe(raw: &str) -> Option<Self> {
        match raw {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
            "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            "incomplete" | "paused" => Some(SubscriptionStatus::Incomplete),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Free,
    Pro,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub user_id: Uuid,

    #[serde(default)]
    pub stripe_customer_id: Option<String>,

    #[serde(default)]
    pub stripe_subscription_id: Option<String>,

    pub status: SubscriptionStatus,

    #[serde(default)]
    pub plan: Plan,

    #[serde(default)]
    pub trial_started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub trial_ends_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub current_period_end: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}

impl Record for Subscription {
    const FILE: &'static str = "subscriptions.data";
}

impl Subscription {
    pub fn is_pro(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SubscriptionStatus::Active => true,
            SubscriptionStatus::Trialing => self.trial_ends_at.is_some_and(|end| now < end),
            _ => false,
        }
    }

    /// Whole days left in the trial, rounded up; zero outside a trial.
    pub fn trial_days_remaining(&self, now: DateTime<Utc>) -> i64 {
        if self.status != SubscriptionStatus::Trialing {
            return 0;
        }
        let Some(end) = self.trial_ends_at else {
            return 0;
        };
        let secs = (end - now).num_seconds();
        if secs <= 0 { 0 } else { (secs + 86_399) / 86_400 }
    }
}

pub fn subscription_for_user(
    store: &DataStore,
    user_id: Uuid,
) -> anyhow::Result<Option<Subscription>> {
    Ok(store
        .load::<Subscription>()?
        .into_iter()
        .find(|s| s.user_id == user_id))
}

/// Starts the one trial a user gets.
#[instrument(skip(store, now))]
pub fn start_trial(
    store: &DataStore,
    user_id: Uuid,
    days: u32,
    now: DateTime<Utc>,
) -> anyhow::Result<Subscription> {
    store.update(|rows: &mut Vec<Subscription>| {
        if let Some(existing) = rows.iter().find(|s| s.user_id == user_id) {
            let reason = if existing.trial_started_at.is_some() {
                "trial already used"
            } else {
                "account already has a subscription"
            };
            return Err(ApiError::Conflict(reason.to_string()).into());
        }
        let subscription = Subscription {
            user_id,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            status: SubscriptionStatus::Trialing,
            plan: Plan::Pro,
            trial_started_at: Some(now),
            trial_ends_at: Some(now + Duration::days(i64::from(days))),
            current_period_end: None,
            updated_at: now,
        };
        rows.push(subscription.clone());
        info!(days, "started trial");
        Ok(subscription)
    })
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn unix_at(value: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    let secs = value.pointer(pointer).and_then(Value::as_i64)?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Row matching the event's subscription id, customer id, or referenced user.
fn find_row(rows: &[Subscription], object: &Value) -> Option<usize> {
    let subscription_id = str_at(object, "/subscription").or_else(|| {
        str_at(object, "/object")
            .filter(|kind| *kind == "subscription")
            .and_then(|_| str_at(object, "/id"))
    });
    let customer = str_at(object, "/customer");
    let user = str_at(object, "/client_reference_id")
        .or_else(|| str_at(object, "/metadata/user_id"))
        .and_then(|raw| Uuid::parse_str(raw).ok());

    rows.iter().position(|row| {
        (subscription_id.is_some() && row.stripe_subscription_id.as_deref() == subscription_id)
            || (customer.is_some() && row.stripe_customer_id.as_deref() == customer)
            || user == Some(row.user_id)
    })
}

/// Verifies a Stripe webhook and applies it to the stored subscriptions.
#[instrument(skip(store, payload, signature, secret, now))]
pub fn handle_stripe_event(
    store: &DataStore,
    payload: &str,
    signature: &str,
    secret: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Value, ApiError> {
    let secret = secret
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Unavailable("billing webhooks are not configured".to_string()))?;
    verify_webhook_signature_at(payload, signature, secret, DEFAULT_TOLERANCE_SECS, now.timestamp())?;

    let event: Value = serde_json::from_str(payload)
        .map_err(|err| ApiError::BadRequest(format!("event is not valid json: {err}")))?;
    let kind = str_at(&event, "/type")
        .ok_or_else(|| ApiError::BadRequest("event has no type".to_string()))?
        .to_string();
    let object = event.pointer("/data/object").cloned().unwrap_or(Value::Null);
    debug!(kind = %kind, "received billing event");

    let handled = store.update(|rows: &mut Vec<Subscription>| {
        match kind.as_str() {
            "checkout.session.completed" => {
                let user_id = str_at(&object, "/client_reference_id")
                    .or_else(|| str_at(&object, "/metadata/user_id"))
                    .and_then(|raw| Uuid::parse_str(raw).ok());
                let idx = match find_row(rows, &object) {
                    Some(idx) => idx,
                    None => {
                        let Some(user_id) = user_id else {
                            return Err(ApiError::BadRequest(
                                "checkout session names no user".to_string(),
                            )
                            .into());
                        };
                        rows.push(Subscription {
                            user_id,
                            stripe_customer_id: None,
                            stripe_subscription_id: None,
                            status: SubscriptionStatus::Incomplete,
                            plan: Plan::Free,
                            trial_started_at: None,
                            trial_ends_at: None,
                            current_period_end: None,
                            updated_at: now,
                        });
                        rows.len() - 1
                    }
                };
                let row = &mut rows[idx];
                row.stripe_customer_id = str_at(&object, "/customer")
                    .map(str::to_string)
                    .or(row.stripe_customer_id.take());
                row.stripe_subscription_id = str_at(&object, "/subscription")
                    .map(str::to_string)
                    .or(row.stripe_subscription_id.take());
                row.status = SubscriptionStatus::Active;
                row.plan = Plan::Pro;
                row.updated_at = now;
                info!(user = %row.user_id, "checkout completed");
                Ok(true)
            }
            "customer.subscription.updated" | "customer.subscription.deleted" => {
                let Some(idx) = find_row(rows, &object) else {
                    warn!(kind = %kind, "billing event for unknown subscription");
                    return Ok(false);
                };
                let row = &mut rows[idx];
                let status = if kind.ends_with("deleted") {
                    Some(SubscriptionStatus::Canceled)
                } else {
                    str_at(&object, "/status").and_then(SubscriptionStatus::from_stripe)
                };
                if let Some(status) = status {
                    row.status = status;
                }
                if let Some(id) = str_at(&object, "/id") {
                    row.stripe_subscription_id = Some(id.to_string());
                }
                if let Some(end) = unix_at(&object, "/current_period_end") {
                    row.current_period_end = Some(end);
                }
                if let Some(end) = unix_at(&object, "/trial_end") {
                    row.trial_ends_at = Some(end);
                }
                row.plan = if row.status == SubscriptionStatus::Canceled {
                    Plan::Free
                } else {
                    Plan::Pro
                };
                row.updated_at = now;
                info!(user = %row.user_id, status = %row.status, "subscription changed");
                Ok(true)
            }
            "invoice.payment_failed" => {
                let Some(idx) = find_row(rows, &object) else {
                    warn!("payment failure for unknown subscription");
                    return Ok(false);
                };
                let row = &mut rows[idx];
                row.status = SubscriptionStatus::PastDue;
                row.updated_at = now;
                warn!(user = %row.user_id, "invoice payment failed");
                Ok(true)
            }
            _ => Ok(false),
        }
    })?;

    Ok(json!({ "received": true, "handled": handled }))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use super::{SubscriptionStatus, handle_stripe_event, start_trial, subscription_for_user};
    use crate::datastore::DataStore;
    use crate::webhook::sign_webhook_payload_at;

    const SECRET: &str = "whsec_test";

    fn signed(event: &serde_json::Value, at: i64) -> (String, String) {
        let payload = event.to_string();
        let header = sign_webhook_payload_at(&payload, SECRET, at).expect("sign");
        (payload, header)
    }

    #[test]
    fn trial_is_once_per_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let user = Uuid::new_v4();
        let now = Utc
            .with_ymd_and_hms(2026, 10, 18, 12, 0, 0)
            .single()
            .expect("valid now");

        let trial = start_trial(&store, user, 14, now).expect("trial");
        assert!(trial.is_pro(now));
        assert_eq!(trial.trial_days_remaining(now), 14);
        assert_eq!(trial.trial_days_remaining(now + Duration::hours(25)), 13);
        assert!(!trial.is_pro(now + Duration::days(15)));
        assert_eq!(trial.trial_days_remaining(now + Duration::days(15)), 0);

        let err = start_trial(&store, user, 14, now).expect_err("second trial");
        assert_eq!(err.downcast_ref::<crate::api::ApiError>().map(|e| e.status()), Some(409));
    }

    #[test]
    fn stripe_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let user = Uuid::new_v4();
        let now = Utc
            .with_ymd_and_hms(2026, 10, 18, 12, 0, 0)
            .single()
            .expect("valid now");
        let at = now.timestamp();

        let checkout = json!({
            "type": "checkout.session.completed",
            "data": {"object": {
                "client_reference_id": user.to_string(),
                "customer": "cus_1",
                "subscription": "sub_1"
            }}
        });
        let (payload, header) = signed(&checkout, at);
        let reply = handle_stripe_event(&store, &payload, &header, Some(SECRET), now)
            .expect("checkout");
        assert_eq!(reply["handled"], true);
        let sub = subscription_for_user(&store, user).expect("load").expect("row");
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.is_pro(now));

        let failed = json!({
            "type": "invoice.payment_failed",
            "data": {"object": {"customer": "cus_1", "subscription": "sub_1"}}
        });
        let (payload, header) = signed(&failed, at);
        handle_stripe_event(&store, &payload, &header, Some(SECRET), now).expect("failed");
        let sub = subscription_for_user(&store, user).expect("load").expect("row");
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert!(!sub.is_pro(now));

        let updated = json!({
            "type": "customer.subscription.updated",
            "data": {"object": {
                "object": "subscription", "id": "sub_1", "customer": "cus_1",
                "status": "active", "current_period_end": at + 86_400 * 30
            }}
        });
        let (payload, header) = signed(&updated, at);
        handle_stripe_event(&store, &payload, &header, Some(SECRET), now).expect("updated");
        let sub = subscription_for_user(&store, user).expect("load").expect("row");
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_end, Some(now + Duration::days(30)));

        let deleted = json!({
            "type": "customer.subscription.deleted",
            "data": {"object": {"object": "subscription", "id": "sub_1"}}
        });
        let (payload, header) = signed(&deleted, at);
        handle_stripe_event(&store, &payload, &header, Some(SECRET), now).expect("deleted");
        let sub = subscription_for_user(&store, user).expect("load").expect("row");
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
    }

    #[test]
    fn rejects_bad_signatures_and_missing_secret() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let now = Utc::now();
        let (payload, header) = signed(&json!({"type": "invoice.paid"}), now.timestamp());

        let err = handle_stripe_event(&store, &payload, &header, Some("whsec_other"), now)
            .expect_err("wrong secret");
        assert_eq!(err.status(), 401);
        let err = handle_stripe_event(&store, &payload, &header, None, now).expect_err("no secret");
        assert_eq!(err.status(), 503);

        let stale = now + Duration::seconds(301);
        let err = handle_stripe_event(&store, &payload, &header, Some(SECRET), stale)
            .expect_err("stale");
        assert_eq!(err.status(), 401);

        let ok = handle_stripe_event(&store, &payload, &header, Some(SECRET), now).expect("ok");
        assert_eq!(ok["handled"], false);
    }
}
