mod planning;
mod services;
mod task_ops;
mod team_ops;

use std::io::{self, Read};
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::ai::AnthropicClient;
use crate::cli::{Command, ListArgs};
use crate::config::Config;
use crate::datastore::{DataStore, Profile};
use crate::datetime::{WeekStart, resolve_relative_date, to_project_date};
use crate::render::Renderer;
use crate::settings::{PlatformSettings, SettingKey};
use crate::webhook::{
    DEFAULT_MAX_FAILURES, DEFAULT_TIMEOUT_SECS, HttpTransport, WebhookDispatcher, WebhookEvent,
    webhooks_for_user,
};

/// Everything a command needs, resolved once per invocation.
pub(crate) struct Ctx<'a> {
    pub store: &'a DataStore,
    pub cfg: &'a Config,
    pub renderer: &'a mut Renderer,
    pub profile: Profile,
    pub settings: PlatformSettings,
    pub now: DateTime<Utc>,
    pub week_start: WeekStart,
}

impl Ctx<'_> {
    pub fn user_id(&self) -> Uuid {
        self.profile.user_id
    }

    pub fn today(&self) -> NaiveDate {
        to_project_date(self.now)
    }

    pub fn default_list(&self) -> Option<String> {
        self.cfg.get("default.list")
    }

    /// Relative tokens first, then `YYYY-MM-DD`.
    pub fn parse_date(&self, token: &str) -> anyhow::Result<NaiveDate> {
        if let Some(date) = resolve_relative_date(token, self.today(), self.week_start) {
            return Ok(date);
        }
        NaiveDate::parse_from_str(token.trim(), "%Y-%m-%d")
            .with_context(|| format!("invalid date: {token}"))
    }

    pub fn require_enabled(&self, key: SettingKey) -> anyhow::Result<()> {
        if self.settings.get(self.store, key)? {
            Ok(())
        } else {
            Err(anyhow!("{key} is turned off for this installation"))
        }
    }

    /// `None` falls back to keyword parsing.
    pub fn completion_client(&self) -> anyhow::Result<Option<AnthropicClient>> {
        if !self.settings.get(self.store, SettingKey::AiFeaturesEnabled)? {
            debug!("ai features disabled; using keyword fallback");
            return Ok(None);
        }
        AnthropicClient::from_config(self.cfg)
    }

    /// Delivery problems are logged, never surfaced to the command.
    pub fn emit<T: Serialize>(&self, event: WebhookEvent, data: &T) {
        if let Err(err) = self.try_emit(event, data) {
            warn!(%event, error = %format!("{err:#}"), "webhook dispatch failed");
        }
    }

    fn try_emit<T: Serialize>(&self, event: WebhookEvent, data: &T) -> anyhow::Result<()> {
        let hooks = webhooks_for_user(self.store, self.user_id())?;
        if !hooks.iter().any(|hook| hook.wants(event)) {
            return Ok(());
        }

        let timeout =
            Duration::from_secs(self.cfg.u64_or("webhook.timeout", DEFAULT_TIMEOUT_SECS)?);
        let max_failures = self
            .cfg
            .u64_or("webhook.max_failures", u64::from(DEFAULT_MAX_FAILURES))?;
        let max_failures =
            u32::try_from(max_failures).context("webhook.max_failures is too large")?;
        let dispatcher = WebhookDispatcher::new(HttpTransport::new(timeout)?, max_failures);
        let report = dispatcher.dispatch_for_user(
            self.store,
            self.user_id(),
            event,
            &serde_json::to_value(data)?,
            self.now,
        )?;
        debug!(
            %event,
            delivered = report.delivered,
            failed = report.failed,
            disabled = report.disabled.len(),
            "webhooks dispatched"
        );
        Ok(())
    }
}

pub(crate) fn read_stdin() -> anyhow::Result<String> {
    let mut body = String::new();
    io::stdin()
        .read_to_string(&mut body)
        .context("failed reading stdin")?;
    Ok(body)
}

#[instrument(skip(store, cfg, renderer, command))]
pub fn dispatch(
    store: &DataStore,
    cfg: &Config,
    renderer: &mut Renderer,
    command: Option<Command>,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let week_start: WeekStart = cfg.require("week.start")?.parse()?;
    let settings = PlatformSettings::from_config(cfg)?;
    let profile = store.profile()?;
    let command = command.unwrap_or_else(|| Command::List(ListArgs::default()));

    if !matches!(command, Command::Settings(_))
        && settings.get(store, SettingKey::MaintenanceMode)?
    {
        return Err(anyhow!(
            "zeroed is in maintenance mode; only `settings` commands are available"
        ));
    }

    debug!(?command, user = %profile.user_id, "dispatching command");

    let mut ctx = Ctx {
        store,
        cfg,
        renderer,
        profile,
        settings,
        now,
        week_start,
    };

    match command {
        Command::Add { text, list, notes } => task_ops::cmd_add(&mut ctx, &text, list, notes),
        Command::List(args) => task_ops::cmd_list(&mut ctx, args),
        Command::Info { task } => task_ops::cmd_info(&mut ctx, &task),
        Command::Modify(args) => task_ops::cmd_modify(&mut ctx, args),
        Command::Done { tasks } => task_ops::cmd_done(&mut ctx, &tasks),
        Command::Start { task } => task_ops::cmd_start(&mut ctx, &task),
        Command::Cancel { task } => task_ops::cmd_cancel(&mut ctx, &task),
        Command::Reopen { task } => task_ops::cmd_reopen(&mut ctx, &task),
        Command::Delete { task } => task_ops::cmd_delete(&mut ctx, &task),
        Command::Move { task, position } => task_ops::cmd_move(&mut ctx, &task, position),
        Command::Subtask { parent, text } => task_ops::cmd_subtask(&mut ctx, &parent, &text),
        Command::Lists(sub) => task_ops::cmd_lists(&mut ctx, sub),
        Command::Dump { text, dry_run } => task_ops::cmd_dump(&mut ctx, &text, dry_run),
        Command::Breakdown { task, apply } => task_ops::cmd_breakdown(&mut ctx, &task, apply),
        Command::Filter(sub) => planning::cmd_filter(&mut ctx, sub),
        Command::Habit(sub) => planning::cmd_habit(&mut ctx, sub),
        Command::Goal(sub) => planning::cmd_goal(&mut ctx, sub),
        Command::Focus(sub) => planning::cmd_focus(&mut ctx, sub),
        Command::Team(sub) => team_ops::cmd_team(&mut ctx, sub),
        Command::Webhook(sub) => services::cmd_webhook(&mut ctx, sub),
        Command::ApiKey(sub) => services::cmd_api_key(&mut ctx, sub),
        Command::Settings(sub) => services::cmd_settings(&mut ctx, sub),
        Command::Cron(sub) => services::cmd_cron(&mut ctx, sub),
        Command::Slack {
            timestamp,
            signature,
        } => services::cmd_slack(&mut ctx, &timestamp, &signature),
        Command::Email { content_type } => services::cmd_email(&mut ctx, &content_type),
        Command::Billing(sub) => services::cmd_billing(&mut ctx, sub),
        Command::Integration(sub) => services::cmd_integration(&mut ctx, sub),
    }
}
