use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::filter::{FilterCondition, SortSpec};
use crate::focus::FocusKind;
use crate::goals::{GoalPeriod, TargetType};
use crate::habits::Frequency;
use crate::integrations::Provider;
use crate::settings::SettingKey;
use crate::task::Priority;
use crate::teams::TeamRole;

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "zeroed",
    version,
    about = "Zeroed: tasks, habits, goals and focus from the terminal",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append,
        global = true
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "zeroedrc", global = true)]
    pub zeroedrc: Option<PathBuf>,

    #[arg(long = "data", global = true)]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

fn parse_with<T>(s: &str) -> Result<T, String>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    s.parse::<T>().map_err(|err| format!("{err:#}"))
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Add a task from natural language, e.g. `Call mom tomorrow 5pm !high #family`.
    Add {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
        #[arg(long)]
        list: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Open tasks, or a condition-filtered view.
    List(ListArgs),
    Info {
        task: String,
    },
    Modify(ModifyArgs),
    Done {
        #[arg(required = true, num_args = 1..)]
        tasks: Vec<String>,
    },
    Start {
        task: String,
    },
    Cancel {
        task: String,
    },
    Reopen {
        task: String,
    },
    /// Delete a task and its subtasks.
    Delete {
        task: String,
    },
    /// Move a task to a zero-based position among its siblings.
    Move {
        task: String,
        position: usize,
    },
    Subtask {
        parent: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    #[command(subcommand)]
    Lists(ListsCommand),
    #[command(subcommand)]
    Filter(FilterCommand),
    #[command(subcommand)]
    Habit(HabitCommand),
    #[command(subcommand)]
    Goal(GoalCommand),
    #[command(subcommand)]
    Focus(FocusCommand),
    /// Turn free text (arguments or stdin) into tasks.
    Dump {
        text: Vec<String>,
        /// Show the parsed tasks without creating them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Suggest subtasks for a task.
    Breakdown {
        task: String,
        /// Create the suggestions as subtasks.
        #[arg(long)]
        apply: bool,
    },
    #[command(subcommand)]
    Webhook(WebhookCommand),
    #[command(subcommand, name = "apikey")]
    ApiKey(ApiKeyCommand),
    #[command(subcommand)]
    Team(TeamCommand),
    #[command(subcommand)]
    Settings(SettingsCommand),
    #[command(subcommand)]
    Cron(CronCommand),
    /// Handle a Slack slash-command request body read from stdin.
    Slack {
        #[arg(long)]
        timestamp: String,
        #[arg(long)]
        signature: String,
    },
    /// Handle an inbound e-mail request body read from stdin.
    Email {
        #[arg(long, default_value = "application/json")]
        content_type: String,
    },
    #[command(subcommand)]
    Billing(BillingCommand),
    #[command(subcommand)]
    Integration(IntegrationCommand),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ListArgs {
    #[arg(long)]
    pub list: Option<String>,
    /// Include completed and cancelled tasks.
    #[arg(long)]
    pub all: bool,
    /// Only tasks due today or overdue.
    #[arg(long)]
    pub today: bool,
    /// `field:operator[:value]`, repeatable; all must match.
    #[arg(long = "where", value_parser = parse_with::<FilterCondition>)]
    pub conditions: Vec<FilterCondition>,
    /// `field[:asc|desc]`
    #[arg(long, value_parser = parse_with::<SortSpec>)]
    pub sort: Option<SortSpec>,
}

#[derive(Args, Debug, Clone)]
pub struct ModifyArgs {
    pub task: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub notes: Option<String>,
    #[arg(long, value_parser = parse_with::<Priority>)]
    pub priority: Option<Priority>,
    /// A date, or a relative token such as `tomorrow` or `+3d`.
    #[arg(long)]
    pub due: Option<String>,
    /// `HH:MM` or `3pm`.
    #[arg(long)]
    pub at: Option<String>,
    #[arg(long, conflicts_with_all = ["due", "at"])]
    pub clear_due: bool,
    #[arg(long)]
    pub estimate: Option<u32>,
    #[arg(long = "tag")]
    pub add_tags: Vec<String>,
    #[arg(long = "untag")]
    pub remove_tags: Vec<String>,
    #[arg(long)]
    pub list: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ListsCommand {
    Add { name: String },
    Archive { name: String },
    Show,
}

#[derive(Subcommand, Debug, Clone)]
pub enum FilterCommand {
    Save {
        name: String,
        #[arg(long = "where", required = true, value_parser = parse_with::<FilterCondition>)]
        conditions: Vec<FilterCondition>,
        #[arg(long, value_parser = parse_with::<SortSpec>)]
        sort: Option<SortSpec>,
    },
    Run { name: String },
    List,
    /// Print the saved conditions and their query form.
    Show { name: String },
    Delete { name: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum HabitCommand {
    Add {
        name: String,
        /// `daily` or weekdays such as `mon,wed,fri`.
        #[arg(long, default_value = "daily", value_parser = parse_with::<Frequency>)]
        frequency: Frequency,
        #[arg(long, default_value_t = 1)]
        target: u32,
    },
    Log {
        name: String,
        /// Defaults to today.
        #[arg(long)]
        date: Option<String>,
    },
    List,
}

#[derive(Subcommand, Debug, Clone)]
pub enum GoalCommand {
    Add {
        title: String,
        #[arg(long = "type", value_parser = parse_with::<TargetType>)]
        target_type: TargetType,
        #[arg(long)]
        target: u64,
        #[arg(long, default_value = "weekly", value_parser = parse_with::<GoalPeriod>)]
        period: GoalPeriod,
        #[arg(long, requires = "end")]
        start: Option<String>,
        #[arg(long, requires = "start")]
        end: Option<String>,
    },
    List,
    Refresh,
    /// Record progress on a custom goal.
    Progress { title: String, value: u64 },
}

#[derive(Subcommand, Debug, Clone)]
pub enum FocusCommand {
    Start {
        #[arg(long, default_value = "focus", value_parser = parse_with::<FocusKind>)]
        kind: FocusKind,
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        minutes: Option<u32>,
    },
    Stop,
    Status,
}

#[derive(Subcommand, Debug, Clone)]
pub enum WebhookCommand {
    Add {
        url: String,
        #[arg(long = "event", required = true)]
        events: Vec<String>,
        #[arg(long)]
        secret: Option<String>,
    },
    List,
    Remove { id: String },
    /// Sign a payload read from stdin.
    Sign {
        #[arg(long)]
        secret: String,
    },
    /// Verify a payload read from stdin against a signature header.
    Verify {
        #[arg(long)]
        secret: String,
        #[arg(long)]
        signature: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ApiKeyCommand {
    Create { name: String },
    List,
    /// Revoke by name or display prefix.
    Revoke { key: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum TeamCommand {
    Create { name: String },
    Invite {
        team: String,
        email: String,
        #[arg(long, default_value = "member", value_parser = parse_with::<TeamRole>)]
        role: TeamRole,
    },
    Accept {
        token: String,
        /// Defaults to the profile e-mail.
        #[arg(long)]
        email: Option<String>,
    },
    List,
    Members { team: String },
    /// Remove a member, by e-mail or user id.
    Remove { team: String, member: String },
    Role {
        team: String,
        member: String,
        #[arg(value_parser = parse_with::<TeamRole>)]
        role: TeamRole,
    },
    Delete { team: String },
    Project {
        team: String,
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Add a shared task from natural language.
    Task {
        team: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
        /// Member e-mail or user id.
        #[arg(long)]
        assign: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum SettingsCommand {
    List,
    Set {
        #[arg(value_parser = parse_with::<SettingKey>)]
        key: SettingKey,
        value: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum CronCommand {
    Digest {
        /// Value of the Authorization header.
        #[arg(long)]
        authorization: Option<String>,
    },
    Reminders {
        #[arg(long)]
        authorization: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum BillingCommand {
    Trial,
    Status,
    /// Apply a Stripe event read from stdin.
    StripeEvent {
        #[arg(long)]
        signature: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum IntegrationCommand {
    /// Finish an OAuth flow with the code and state from the callback.
    Connect {
        #[arg(value_parser = parse_with::<Provider>)]
        provider: Provider,
        #[arg(long)]
        code: String,
        #[arg(long)]
        state: String,
    },
    List,
    Disconnect {
        #[arg(value_parser = parse_with::<Provider>)]
        provider: Provider,
    },
    AuthorizeUrl {
        #[arg(value_parser = parse_with::<Provider>)]
        provider: Provider,
    },
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

/// Pulls positional `rc.key=value` / `rc.key:value` overrides out of argv.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> anyhow::Result<PreprocessedArgs> {
    let mut cleaned = Vec::with_capacity(raw.len());
    let mut overrides: Vec<(String, String)> = Vec::new();

    let mut iter = raw.iter().cloned();
    if let Some(bin) = iter.next() {
        cleaned.push(bin);
    }

    for arg in iter {
        let s = arg.to_string_lossy();
        if let Some(rest) = s.strip_prefix("rc.") {
            let parsed = rest
                .split_once('=')
                .or_else(|| rest.split_once(':'))
                .map(|(k, v)| (format!("rc.{k}"), v.to_string()));

            if let Some((k, v)) = parsed {
                debug!(key = %k, value = %v, "captured positional rc override");
                overrides.push((k, v));
                continue;
            }
        }

        cleaned.push(arg);
    }

    Ok(PreprocessedArgs {
        cleaned_args: cleaned,
        rc_overrides: overrides,
    })
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use clap::Parser;

    use super::{Command, GlobalCli, HabitCommand, preprocess_args};

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn rc_overrides_are_lifted_out() {
        let pre = preprocess_args(&args(&["zeroed", "rc.color=off", "list", "rc.week.start:sunday"]))
            .expect("preprocess");
        assert_eq!(pre.cleaned_args, args(&["zeroed", "list"]));
        assert_eq!(
            pre.rc_overrides,
            vec![
                ("rc.color".to_string(), "off".to_string()),
                ("rc.week.start".to_string(), "sunday".to_string())
            ]
        );
    }

    #[test]
    fn parses_nested_subcommands_and_typed_values() {
        let cli = GlobalCli::parse_from(args(&[
            "zeroed", "-vv", "habit", "add", "Stretch", "--frequency", "mon,thu",
        ]));
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Command::Habit(HabitCommand::Add { name, target, .. })) => {
                assert_eq!(name, "Stretch");
                assert_eq!(target, 1);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let bad = GlobalCli::try_parse_from(args(&["zeroed", "list", "--where", "colour:eq:red"]));
        assert!(bad.is_err());
    }
}
