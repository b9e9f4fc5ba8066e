use std::fmt;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::datastore::{DataStore, Record};
use crate::webhook::{constant_time_eq, hmac_sha256_hex};

/// OAuth `state` values expire after this many seconds.
pub const STATE_MAX_AGE_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Slack,
    Notion,
    GoogleCalendar,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Slack => "slack",
            Provider::Notion => "notion",
            Provider::GoogleCalendar => "google_calendar",
        }
    }

    fn authorize_endpoint(self) -> &'static str {
        match self {
            Provider::Slack => "https://slack.com/oauth/v2/authorize",
            Provider::Notion => "https://api.notion.com/v1/oauth/authorize",
            Provider::GoogleCalendar => "https://accounts.google.com/o/oauth2/v2/auth",
        }
    }

    fn token_endpoint(self) -> &'static str {
        match self {
            Provider::Slack => "https://slack.com/api/oauth.v2.access",
            Provider::Notion => "https://api.notion.com/v1/oauth/token",
            Provider::GoogleCalendar => "https://oauth2.googleapis.com/token",
        }
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slack" => Ok(Provider::Slack),
            "notion" => Ok(Provider::Notion),
            "google_calendar" | "google-calendar" | "google" => Ok(Provider::GoogleCalendar),
            other => Err(anyhow!("unknown integration provider: {other}")),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Integration {
    pub id: Uuid,

    pub user_id: Uuid,

    pub provider: Provider,

    pub access_token: String,

    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Provider specific values such as `webhook_url` or `slack_user_id`.
    #[serde(default)]
    pub settings: Map<String, Value>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Record for Integration {
    const FILE: &'static str = "integrations.data";
}

impl Integration {
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn setting_bool(&self, key: &str) -> Option<bool> {
        match self.settings.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => Some(crate::config::parse_bool(s)),
            _ => None,
        }
    }
}

/// Client registration for one provider.
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Tokens plus whatever settings the provider handed back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub settings: Map<String, Value>,
}

pub fn authorize_url(
    provider: Provider,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
) -> anyhow::Result<String> {
    let mut params: Vec<(&str, &str)> = vec![
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
        ("state", state),
    ];
    match provider {
        Provider::Slack => params.push(("scope", "commands,chat:write,incoming-webhook")),
        Provider::Notion => {
            params.push(("response_type", "code"));
            params.push(("owner", "user"));
        }
        Provider::GoogleCalendar => {
            params.push(("response_type", "code"));
            params.push(("scope", "https://www.googleapis.com/auth/calendar.events"));
            params.push(("access_type", "offline"));
            params.push(("prompt", "consent"));
        }
    }
    let url = url::Url::parse_with_params(provider.authorize_endpoint(), &params)
        .context("failed building authorize url")?;
    Ok(url.to_string())
}

/// `<user>.<provider>.<unix>.<hex hmac>`; binds the callback to a user.
pub fn sign_oauth_state(
    user_id: Uuid,
    provider: Provider,
    secret: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    let payload = format!("{user_id}.{}.{}", provider.as_str(), now.timestamp());
    let signature = hmac_sha256_hex(secret.as_bytes(), payload.as_bytes())?;
    Ok(format!("{payload}.{signature}"))
}

pub fn verify_oauth_state(
    state: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<(Uuid, Provider)> {
    let parts: Vec<&str> = state.trim().split('.').collect();
    let [user, provider, issued, signature] = parts.as_slice() else {
        return Err(anyhow!("malformed oauth state"));
    };

    let payload = format!("{user}.{provider}.{issued}");
    let expected = hmac_sha256_hex(secret.as_bytes(), payload.as_bytes())?;
    if !constant_time_eq(signature, &expected) {
        return Err(anyhow!("oauth state signature mismatch"));
    }

    let issued: i64 = issued.parse().context("oauth state timestamp is not a number")?;
    let age = now.timestamp() - issued;
    if !(0..=STATE_MAX_AGE_SECS).contains(&age) {
        return Err(anyhow!("oauth state expired"));
    }

    let user_id = Uuid::parse_str(user).context("oauth state carries an invalid user id")?;
    Ok((user_id, provider.parse()?))
}

/// Reads a provider's token endpoint response.
pub fn parse_token_response(provider: Provider, body: &Value) -> anyhow::Result<TokenGrant> {
    if provider == Provider::Slack && body.get("ok").and_then(Value::as_bool) == Some(false) {
        let reason = body.get("error").and_then(Value::as_str).unwrap_or("unknown error");
        return Err(anyhow!("slack rejected the code: {reason}"));
    }
    if let Some(reason) = body.get("error").and_then(Value::as_str) {
        return Err(anyhow!("{provider} rejected the code: {reason}"));
    }

    let access_token = body
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("{provider} token response has no access_token"))?
        .to_string();

    let mut settings = Map::new();
    match provider {
        Provider::Slack => {
            if let Some(url) = body.pointer("/incoming_webhook/url").and_then(Value::as_str) {
                settings.insert("webhook_url".to_string(), Value::from(url));
            }
            if let Some(user) = body.pointer("/authed_user/id").and_then(Value::as_str) {
                settings.insert("slack_user_id".to_string(), Value::from(user));
            }
            if let Some(team) = body.pointer("/team/id").and_then(Value::as_str) {
                settings.insert("slack_team_id".to_string(), Value::from(team));
            }
        }
        Provider::Notion => {
            if let Some(workspace) = body.get("workspace_id").and_then(Value::as_str) {
                settings.insert("workspace_id".to_string(), Value::from(workspace));
            }
        }
        Provider::GoogleCalendar => {
            settings.insert("calendar_id".to_string(), Value::from("primary"));
        }
    }

    Ok(TokenGrant {
        access_token,
        refresh_token: body
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string),
        expires_in: body.get("expires_in").and_then(Value::as_i64),
        settings,
    })
}

/// Trades an authorization code for tokens at the provider.
#[instrument(skip(client, app, code))]
pub fn exchange_code(
    client: &reqwest::blocking::Client,
    provider: Provider,
    app: &OAuthApp,
    code: &str,
) -> anyhow::Result<TokenGrant> {
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", app.redirect_uri.as_str()),
        ("client_id", app.client_id.as_str()),
        ("client_secret", app.client_secret.as_str()),
    ];
    let request = client.post(provider.token_endpoint());
    let request = match provider {
        Provider::Notion => request
            .basic_auth(&app.client_id, Some(&app.client_secret))
            .json(&serde_json::json!({
                "grant_type": "authorization_code",
                "code": code,
                "redirect_uri": app.redirect_uri,
            })),
        Provider::Slack | Provider::GoogleCalendar => request.form(&form),
    };

    let body: Value = request
        .send()
        .with_context(|| format!("token exchange with {provider} failed"))?
        .json()
        .with_context(|| format!("{provider} token response is not json"))?;
    debug!(%provider, "received token response");
    parse_token_response(provider, &body)
}

/// Stores the grant, replacing an earlier connection to the same provider.
#[instrument(skip(store, grant, now))]
pub fn connect(
    store: &DataStore,
    user_id: Uuid,
    provider: Provider,
    grant: TokenGrant,
    now: DateTime<Utc>,
) -> anyhow::Result<Integration> {
    store.update(|rows: &mut Vec<Integration>| {
        rows.retain(|row| !(row.user_id == user_id && row.provider == provider));
        let integration = Integration {
            id: Uuid::new_v4(),
            user_id,
            provider,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_in.map(|secs| now + Duration::seconds(secs)),
            settings: grant.settings,
            enabled: true,
            last_synced_at: None,
            last_error: None,
            created_at: now,
        };
        rows.push(integration.clone());
        info!(%provider, user = %user_id, "connected integration");
        Ok(integration)
    })
}

#[instrument(skip(store))]
pub fn disconnect(store: &DataStore, user_id: Uuid, provider: Provider) -> anyhow::Result<()> {
    store.update(|rows: &mut Vec<Integration>| {
        let before = rows.len();
        rows.retain(|row| !(row.user_id == user_id && row.provider == provider));
        if rows.len() == before {
            return Err(anyhow!("{provider} is not connected"));
        }
        info!(%provider, user = %user_id, "disconnected integration");
        Ok(())
    })
}

pub fn integrations_for_user(store: &DataStore, user_id: Uuid) -> anyhow::Result<Vec<Integration>> {
    Ok(store
        .load::<Integration>()?
        .into_iter()
        .filter(|row| row.user_id == user_id)
        .collect())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use super::{
        Provider, TokenGrant, authorize_url, connect, disconnect, integrations_for_user,
        parse_token_response, sign_oauth_state, verify_oauth_state,
    };
    use crate::datastore::DataStore;

    #[test]
    fn oauth_state_round_trips_and_expires() {
        let now = Utc
            .with_ymd_and_hms(2026, 10, 18, 9, 0, 0)
            .single()
            .expect("valid now");
        let user = Uuid::new_v4();
        let state = sign_oauth_state(user, Provider::GoogleCalendar, "s3cret", now).expect("sign");

        assert_eq!(
            verify_oauth_state(&state, "s3cret", now + Duration::minutes(9)).expect("verify"),
            (user, Provider::GoogleCalendar)
        );
        assert!(verify_oauth_state(&state, "s3cret", now + Duration::minutes(11)).is_err());
        assert!(verify_oauth_state(&state, "other", now).is_err());
        assert!(verify_oauth_state("not-a-state", "s3cret", now).is_err());
    }

    #[test]
    fn authorize_url_encodes_parameters() {
        let url = authorize_url(
            Provider::Slack,
            "123.456",
            "https://app.test/callback?x=1",
            "abc",
        )
        .expect("url");
        assert!(url.starts_with("https://slack.com/oauth/v2/authorize?"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fapp.test%2Fcallback%3Fx%3D1"));
        assert!(url.contains("state=abc"));
    }

    #[test]
    fn slack_token_response_fills_settings() {
        let grant = parse_token_response(
            Provider::Slack,
            &json!({
                "ok": true,
                "access_token": "xoxb-1",
                "authed_user": {"id": "U123"},
                "incoming_webhook": {"url": "https://hooks.slack.test/T/B/x"}
            }),
        )
        .expect("grant");
        assert_eq!(grant.access_token, "xoxb-1");
        assert_eq!(grant.settings["slack_user_id"], "U123");

        assert!(
            parse_token_response(Provider::Slack, &json!({"ok": false, "error": "bad_code"}))
                .is_err()
        );
    }

    #[test]
    fn connecting_twice_replaces_the_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let user = store.profile().expect("profile").user_id;
        let now = Utc::now();

        for token in ["a", "b"] {
            connect(
                &store,
                user,
                Provider::Notion,
                TokenGrant {
                    access_token: token.to_string(),
                    ..TokenGrant::default()
                },
                now,
            )
            .expect("connect");
        }
        let rows = integrations_for_user(&store, user).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].access_token, "b");

        disconnect(&store, user, Provider::Notion).expect("disconnect");
        assert!(disconnect(&store, user, Provider::Notion).is_err());
    }
}
