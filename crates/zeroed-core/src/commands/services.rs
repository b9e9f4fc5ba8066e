use std::time::Duration;

use anyhow::{Context, anyhow};
use tracing::{info, instrument, warn};

use super::{Ctx, read_stdin};
use crate::api::{ApiError, ApiResponse};
use crate::api_keys::{api_keys_for_user, create_api_key, revoke_api_key};
use crate::billing::{handle_stripe_event, start_trial, subscription_for_user};
use crate::cli::{
    ApiKeyCommand, BillingCommand, CronCommand, IntegrationCommand, SettingsCommand,
    WebhookCommand,
};
use crate::inbound_email::handle_inbound_email;
use crate::integrations::{
    OAuthApp, Provider, authorize_url, connect, disconnect, exchange_code, integrations_for_user,
    sign_oauth_state, verify_oauth_state,
};
use crate::notifications::{SlackNotifier, authorize_cron, run_daily_digest, run_due_reminders};
use crate::settings::SettingKey;
use crate::slack::handle_slack_request;
use crate::webhook::{
    DEFAULT_TIMEOUT_SECS, register_webhook, remove_webhook, sign_webhook_payload,
    verify_webhook_signature_at, webhooks_for_user,
};

fn http_timeout(ctx: &Ctx<'_>) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(ctx.cfg.u64_or("webhook.timeout", DEFAULT_TIMEOUT_SECS)?))
}

/// Prints the request-style reply and fails the command on an error status.
fn finish(ctx: &mut Ctx<'_>, response: ApiResponse) -> anyhow::Result<()> {
    ctx.renderer.print_json(&serde_json::to_value(&response)?)?;
    if response.status >= 400 {
        return Err(anyhow!("request rejected with status {}", response.status));
    }
    Ok(())
}

fn format_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

#[instrument(skip(ctx, sub))]
pub(super) fn cmd_webhook(ctx: &mut Ctx<'_>, sub: WebhookCommand) -> anyhow::Result<()> {
    match sub {
        WebhookCommand::Add {
            url,
            events,
            secret,
        } => {
            info!("command webhook add");
            let hook = register_webhook(ctx.store, ctx.user_id(), &url, &events, secret, ctx.now)?;
            println!("Registered webhook {} for {}.", hook.id, hook.url);
            println!("Signing secret: {}", hook.secret);
        }
        WebhookCommand::List => {
            let rows = webhooks_for_user(ctx.store, ctx.user_id())?
                .into_iter()
                .map(|hook| {
                    vec![
                        hook.id.simple().to_string()[..8].to_string(),
                        hook.url,
                        hook.events
                            .iter()
                            .map(|e| e.as_str())
                            .collect::<Vec<_>>()
                            .join(","),
                        if hook.is_active { "active" } else { "disabled" }.to_string(),
                        hook.consecutive_failures.to_string(),
                        format_time(hook.last_triggered_at),
                    ]
                })
                .collect();
            ctx.renderer
                .print_table(&["Id", "Url", "Events", "State", "Failures", "Last"], rows)?;
        }
        WebhookCommand::Remove { id } => {
            let hook = remove_webhook(ctx.store, ctx.user_id(), &id)?;
            println!("Removed webhook for {}.", hook.url);
        }
        WebhookCommand::Sign { secret } => {
            let payload = read_stdin()?;
            println!("{}", sign_webhook_payload(&payload, &secret)?);
        }
        WebhookCommand::Verify { secret, signature } => {
            let payload = read_stdin()?;
            let tolerance = i64::try_from(ctx.cfg.u64_or("webhook.tolerance", 300)?)
                .context("webhook.tolerance is too large")?;
            verify_webhook_signature_at(
                &payload,
                &signature,
                &secret,
                tolerance,
                ctx.now.timestamp(),
            )?;
            println!("Signature valid.");
        }
    }
    Ok(())
}

#[instrument(skip(ctx, sub))]
pub(super) fn cmd_api_key(ctx: &mut Ctx<'_>, sub: ApiKeyCommand) -> anyhow::Result<()> {
    match sub {
        ApiKeyCommand::Create { name } => {
            info!("command apikey create");
            let (key, raw) = create_api_key(ctx.store, ctx.user_id(), &name, ctx.now)?;
            println!("Created API key '{}'. It is shown only once:", key.name);
            println!("{raw}");
        }
        ApiKeyCommand::List => {
            let rows = api_keys_for_user(ctx.store, ctx.user_id())?
                .into_iter()
                .map(|key| {
                    vec![
                        key.name,
                        key.prefix,
                        key.created_at.format("%Y-%m-%d").to_string(),
                        format_time(key.last_used_at),
                        if key.revoked_at.is_some() { "revoked" } else { "" }.to_string(),
                    ]
                })
                .collect();
            ctx.renderer
                .print_table(&["Name", "Prefix", "Created", "Last used", "State"], rows)?;
        }
        ApiKeyCommand::Revoke { key } => {
            let revoked = revoke_api_key(ctx.store, ctx.user_id(), &key, ctx.now)?;
            println!("Revoked API key '{}'.", revoked.name);
        }
    }
    Ok(())
}

#[instrument(skip(ctx, sub))]
pub(super) fn cmd_settings(ctx: &mut Ctx<'_>, sub: SettingsCommand) -> anyhow::Result<()> {
    match sub {
        SettingsCommand::List => {
            let rows = ctx
                .settings
                .all(ctx.store)?
                .into_iter()
                .map(|(key, value)| vec![key.to_string(), if value { "on" } else { "off" }.to_string()])
                .collect();
            ctx.renderer.print_table(&["Setting", "Value"], rows)?;
        }
        SettingsCommand::Set { key, value } => {
            info!("command settings set");
            let value = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "y" | "yes" | "on" | "true" => true,
                "0" | "n" | "no" | "off" | "false" => false,
                other => return Err(anyhow!("expected on or off for {key}, got: {other}")),
            };
            ctx.settings.set(ctx.store, key, value, ctx.now)?;
            println!("{key} = {}", if value { "on" } else { "off" });
        }
    }
    Ok(())
}

#[instrument(skip(ctx, sub))]
pub(super) fn cmd_cron(ctx: &mut Ctx<'_>, sub: CronCommand) -> anyhow::Result<()> {
    let secret = ctx.cfg.get("cron.secret");
    let authorization = match &sub {
        CronCommand::Digest { authorization } | CronCommand::Reminders { authorization } => {
            authorization.as_deref()
        }
    };
    authorize_cron(authorization, secret.as_deref())?;
    ctx.require_enabled(SettingKey::IntegrationsEnabled)?;

    let notifier = SlackNotifier::new(http_timeout(ctx)?)?;
    let report = match sub {
        CronCommand::Digest { .. } => {
            info!("command cron digest");
            run_daily_digest(ctx.store, &notifier, ctx.now)?
        }
        CronCommand::Reminders { .. } => {
            info!("command cron reminders");
            let lead = i64::try_from(ctx.cfg.u64_or("reminders.lead_minutes", 15)?)
                .context("reminders.lead_minutes is too large")?;
            run_due_reminders(ctx.store, &notifier, lead, ctx.now)?
        }
    };
    if !report.errors.is_empty() {
        warn!(failed = report.errors.len(), "cron run finished with failures");
    }
    ctx.renderer.print_json(&serde_json::to_value(&report)?)
}

#[instrument(skip(ctx))]
pub(super) fn cmd_slack(ctx: &mut Ctx<'_>, timestamp: &str, signature: &str) -> anyhow::Result<()> {
    info!("command slack");
    let result = match ctx.require_enabled(SettingKey::IntegrationsEnabled) {
        Ok(()) => {
            let body = read_stdin()?;
            let default_list = ctx.default_list();
            handle_slack_request(
                ctx.store,
                ctx.cfg.get("slack.signing_secret").as_deref(),
                timestamp,
                signature,
                &body,
                default_list.as_deref(),
                ctx.now,
            )
        }
        Err(err) => Err(ApiError::Unavailable(err.to_string())),
    };
    finish(ctx, ApiResponse::from_result(result))
}

#[instrument(skip(ctx))]
pub(super) fn cmd_email(ctx: &mut Ctx<'_>, content_type: &str) -> anyhow::Result<()> {
    info!("command email");
    let body = read_stdin()?;
    let default_list = ctx.default_list();
    let result = handle_inbound_email(ctx.store, content_type, &body, default_list.as_deref(), ctx.now);
    finish(ctx, ApiResponse::from_result(result))
}

#[instrument(skip(ctx, sub))]
pub(super) fn cmd_billing(ctx: &mut Ctx<'_>, sub: BillingCommand) -> anyhow::Result<()> {
    match sub {
        BillingCommand::Trial => {
            info!("command billing trial");
            let days = u32::try_from(ctx.cfg.u64_or("trial.days", 14)?)
                .context("trial.days is too large")?;
            let sub = start_trial(ctx.store, ctx.user_id(), days, ctx.now)?;
            println!(
                "Pro trial started; {} days remaining.",
                sub.trial_days_remaining(ctx.now)
            );
        }
        BillingCommand::Status => match subscription_for_user(ctx.store, ctx.user_id())? {
            Some(sub) => {
                let plan = if sub.is_pro(ctx.now) { "pro" } else { "free" };
                println!("plan       {plan}");
                println!("status     {}", sub.status);
                if sub.trial_ends_at.is_some() {
                    println!("trial      {} days left", sub.trial_days_remaining(ctx.now).max(0));
                }
                if let Some(end) = sub.current_period_end {
                    println!("renews     {}", end.format("%Y-%m-%d"));
                }
            }
            None => println!("plan       free"),
        },
        BillingCommand::StripeEvent { signature } => {
            info!("command billing stripe-event");
            let payload = read_stdin()?;
            let secret = ctx.cfg.get("stripe.webhook_secret");
            let result = handle_stripe_event(ctx.store, &payload, &signature, secret.as_deref(), ctx.now);
            return finish(ctx, ApiResponse::from_result(result));
        }
    }
    Ok(())
}

/// `<provider>.client_id`, `<provider>.client_secret`, `<provider>.redirect_uri`.
fn oauth_app(ctx: &Ctx<'_>, provider: Provider) -> anyhow::Result<OAuthApp> {
    let key = |field: &str| format!("{}.{field}", provider.as_str());
    Ok(OAuthApp {
        client_id: ctx.cfg.require(&key("client_id"))?,
        client_secret: ctx.cfg.require(&key("client_secret"))?,
        redirect_uri: ctx.cfg.require(&key("redirect_uri"))?,
    })
}

#[instrument(skip(ctx, sub))]
pub(super) fn cmd_integration(ctx: &mut Ctx<'_>, sub: IntegrationCommand) -> anyhow::Result<()> {
    ctx.require_enabled(SettingKey::IntegrationsEnabled)?;
    match sub {
        IntegrationCommand::AuthorizeUrl { provider } => {
            let app = oauth_app(ctx, provider)?;
            let secret = ctx.cfg.require("oauth.state_secret")?;
            let state = sign_oauth_state(ctx.user_id(), provider, &secret, ctx.now)?;
            println!("{}", authorize_url(provider, &app.client_id, &app.redirect_uri, &state)?);
        }
        IntegrationCommand::Connect {
            provider,
            code,
            state,
        } => {
            info!("command integration connect");
            let secret = ctx.cfg.require("oauth.state_secret")?;
            let (user_id, signed_provider) = verify_oauth_state(&state, &secret, ctx.now)?;
            if user_id != ctx.user_id() || signed_provider != provider {
                return Err(ApiError::Forbidden("oauth state belongs to another flow".to_string()).into());
            }
            let app = oauth_app(ctx, provider)?;
            let http = reqwest::blocking::Client::builder()
                .timeout(http_timeout(ctx)?)
                .build()
                .context("failed building HTTP client for oauth")?;
            let grant = exchange_code(&http, provider, &app, &code)?;
            let integration = connect(ctx.store, ctx.user_id(), provider, grant, ctx.now)?;
            println!("Connected {}.", integration.provider);
        }
        IntegrationCommand::List => {
            let rows = integrations_for_user(ctx.store, ctx.user_id())?
                .into_iter()
                .map(|row| {
                    vec![
                        row.provider.to_string(),
                        if row.enabled { "on" } else { "off" }.to_string(),
                        format_time(row.last_synced_at),
                        row.last_error.unwrap_or_default(),
                    ]
                })
                .collect();
            ctx.renderer
                .print_table(&["Provider", "Enabled", "Synced", "Last error"], rows)?;
        }
        IntegrationCommand::Disconnect { provider } => {
            disconnect(ctx.store, ctx.user_id(), provider)?;
            println!("Disconnected {provider}.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::format_time;

    #[test]
    fn missing_times_render_blank() {
        assert_eq!(format_time(None), "");
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 0).single();
        assert_eq!(format_time(at), "2026-10-18 09:05");
    }
}
