use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::datetime::{parse_clock_time, to_project_date};
use crate::pattern::{cached_regex, cached_regex_set};
use crate::quick_add::{ParsedTask, parse_quick_add};
use crate::task::Priority;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

/// Single-turn text completion.
pub trait CompletionClient {
    fn complete(&self, system: &str, prompt: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::blocking::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl AnthropicClient {
    pub fn new(
        api_key: String,
        model: String,
        endpoint: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed building HTTP client for completions")?;
        Ok(Self {
            http,
            api_key,
            model,
            endpoint,
        })
    }

    /// `None` when no API key is configured.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Option<Self>> {
        let Some(api_key) = cfg.get("ai.api_key") else {
            debug!("no ai.api_key configured; AI features use keyword fallback");
            return Ok(None);
        };
        let client = Self::new(
            api_key,
            cfg.require("ai.model")?,
            cfg.require("ai.endpoint")?,
            Duration::from_secs(cfg.u64_or("webhook.timeout", 10)? * 3),
        )?;
        Ok(Some(client))
    }
}

impl CompletionClient for AnthropicClient {
    #[instrument(skip(self, system, prompt), fields(model = %self.model))]
    fn complete(&self, system: &str, prompt: &str) -> anyhow::Result<String> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": self.model,
                "max_tokens": MAX_TOKENS,
                "system": system,
                "messages": [{ "role": "user", "content": prompt }],
            }))
            .send()
            .context("completion request failed")?;

        let status = response.status();
        let body: Value = response.json().context("completion response is not json")?;
        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(anyhow!("completion endpoint returned {status}: {message}"));
        }

        body.pointer("/content/0/text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("completion response has no text content"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskSuggestion {
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
}

/// Pulls the JSON out of a reply that may be wrapped in a code fence.
pub fn extract_json(reply: &str) -> anyhow::Result<Value> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = cached_regex(&FENCE, r"(?s)```(?:json|JSON)?\s*(.*?)\s*```")?;
    let inner = fence
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(reply)
        .trim();
    let start = inner
        .find(['[', '{'])
        .ok_or_else(|| anyhow!("reply contains no json"))?;
    serde_json::from_str(&inner[start..]).context("reply json does not parse")
}

fn json_items(value: Value, key: &str) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => items,
            _ => vec![],
        },
        _ => vec![],
    }
}

fn str_field<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| item.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn minutes_field(item: &Value) -> Option<u32> {
    ["estimatedMinutes", "estimated_minutes"]
        .iter()
        .find_map(|k| item.get(*k).and_then(Value::as_f64))
        .filter(|m| *m > 0.0)
        .map(|m| m.round() as u32)
}

fn task_from_json(item: &Value) -> Option<ParsedTask> {
    let title = str_field(item, &["title"])?.to_string();
    Some(ParsedTask {
        title,
        due_date: str_field(item, &["dueDate", "due_date"])
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
        due_time: str_field(item, &["dueTime", "due_time"]).and_then(parse_clock_time),
        priority: str_field(item, &["priority"]).and_then(|p| p.parse().ok()),
        tags: item
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(|t| t.trim_start_matches('#').to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        estimated_minutes: minutes_field(item),
        list_name: str_field(item, &["listName", "list_name", "list"]).map(str::to_string),
    })
}

const BRAIN_DUMP_SYSTEM: &str = "You turn a messy brain dump into a list of concrete tasks. \
Reply with JSON only: an array of objects with keys title (string), dueDate (YYYY-MM-DD or null), \
dueTime (HH:MM or null), priority (low, medium, high, urgent or null), tags (array of strings), \
estimatedMinutes (number or null). Keep titles short and actionable.";

const BREAKDOWN_SYSTEM: &str = "You split a task into 3 to 7 small, concrete subtasks. \
Reply with JSON only: an array of objects with keys title (string) and estimatedMinutes (number).";

/// Splits free text into tasks, via the completion client when one is
/// available and by line-wise quick-add parsing otherwise.
#[instrument(skip(client, text, now), fields(chars = text.len()))]
pub fn brain_dump(
    client: Option<&dyn CompletionClient>,
    text: &str,
    now: DateTime<Utc>,
) -> Vec<ParsedTask> {
    if text.trim().is_empty() {
        return vec![];
    }

    if let Some(client) = client {
        let prompt = format!(
            "Today is {}.\n\nBrain dump:\n{}",
            to_project_date(now).format("%A %Y-%m-%d"),
            text.trim()
        );
        match client
            .complete(BRAIN_DUMP_SYSTEM, &prompt)
            .and_then(|reply| extract_json(&reply))
        {
            Ok(value) => {
                let tasks: Vec<ParsedTask> = json_items(value, "tasks")
                    .iter()
                    .filter_map(task_from_json)
                    .collect();
                if !tasks.is_empty() {
                    info!(count = tasks.len(), "brain dump parsed by model");
                    return tasks;
                }
                warn!("model reply held no tasks; using fallback");
            }
            Err(err) => warn!(error = %format!("{err:#}"), "brain dump via model failed; using fallback"),
        }
    }

    fallback_brain_dump(text, now)
}

fn fallback_brain_dump(text: &str, now: DateTime<Utc>) -> Vec<ParsedTask> {
    static BULLET: OnceLock<Regex> = OnceLock::new();
    let bullet = cached_regex(&BULLET, r"^\s*(?:(?:[-*•+]|\d{1,3}[.)]|\[[ xX]?\])\s*)+").ok();

    let tasks: Vec<ParsedTask> = text
        .split(['\n', ';'])
        .map(|chunk| match bullet {
            Some(re) => re.replace(chunk, "").into_owned(),
            None => chunk.to_string(),
        })
        .filter(|chunk| !chunk.trim().is_empty())
        .filter_map(|chunk| {
            let mut parsed = parse_quick_add(&chunk, now);
            if parsed.title.is_empty() {
                return None;
            }
            if parsed.priority.is_none() {
                parsed.priority = keyword_priority(&chunk);
            }
            Some(parsed)
        })
        .collect();

    debug!(count = tasks.len(), "brain dump parsed by fallback");
    tasks
}

fn keyword_priority(text: &str) -> Option<Priority> {
    static RULES: OnceLock<Vec<Regex>> = OnceLock::new();
    let rules = cached_regex_set(
        &RULES,
        &[r"(?i)\b(?:urgent|asap|critical)\b", r"(?i)\bimportant\b"],
    )
    .ok()?;
    if rules[0].is_match(text) {
        Some(Priority::Urgent)
    } else if rules[1].is_match(text) {
        Some(Priority::High)
    } else {
        None
    }
}

/// Suggests subtasks for a task; keyword templates stand in for the model.
#[instrument(skip(client, notes))]
pub fn break_down_task(
    client: Option<&dyn CompletionClient>,
    title: &str,
    notes: Option<&str>,
) -> Vec<SubtaskSuggestion> {
    if let Some(client) = client {
        let mut prompt = format!("Task: {}", title.trim());
        if let Some(notes) = notes.filter(|n| !n.trim().is_empty()) {
            prompt.push_str(&format!("\nNotes: {}", notes.trim()));
        }
        match client
            .complete(BREAKDOWN_SYSTEM, &prompt)
            .and_then(|reply| extract_json(&reply))
        {
            Ok(value) => {
                let steps: Vec<SubtaskSuggestion> = json_items(value, "subtasks")
                    .iter()
                    .filter_map(|item| {
                        Some(SubtaskSuggestion {
                            title: str_field(item, &["title"])?.to_string(),
                            estimated_minutes: minutes_field(item),
                        })
                    })
                    .collect();
                if !steps.is_empty() {
                    return steps;
                }
                warn!("model reply held no subtasks; using templates");
            }
            Err(err) => warn!(error = %format!("{err:#}"), "breakdown via model failed; using templates"),
        }
    }

    template_breakdown(title)
}

const TEMPLATES: &[(&str, &[(&str, u32)])] = &[
    (
        r"(?i)\b(?:write|draft|blog|article|essay|report|post|doc|docs|newsletter)\b",
        &[
            ("Outline the key points", 15),
            ("Write the first draft", 45),
            ("Review and edit", 20),
            ("Finalize and publish", 10),
        ],
    ),
    (
        r"(?i)\b(?:meeting|meet|call|sync|standup|presentation|present|interview)\b",
        &[
            ("Prepare the agenda", 15),
            ("Gather materials", 15),
            ("Run the meeting", 30),
            ("Send follow-up notes", 10),
        ],
    ),
    (
        r"(?i)\b(?:bug|fix|debug|error|issue|crash|broken)\b",
        &[
            ("Reproduce the problem", 20),
            ("Find the root cause", 30),
            ("Implement the fix", 30),
            ("Test and verify", 15),
        ],
    ),
    (
        r"(?i)\b(?:research|learn|study|investigate|explore|read|course)\b",
        &[
            ("Define the questions to answer", 10),
            ("Gather sources", 30),
            ("Take notes", 30),
            ("Summarize findings", 15),
        ],
    ),
];

const DEFAULT_TEMPLATE: &[(&str, u32)] = &[
    ("Plan the approach", 10),
    ("Do the main work", 45),
    ("Review the result", 15),
];

fn template_breakdown(title: &str) -> Vec<SubtaskSuggestion> {
    static RULES: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns: Vec<&str> = TEMPLATES.iter().map(|(p, _)| *p).collect();
    let steps = cached_regex_set(&RULES, &patterns)
        .ok()
        .and_then(|rules| {
            rules
                .iter()
                .zip(TEMPLATES)
                .find(|(re, _)| re.is_match(title))
                .map(|(_, (_, steps))| *steps)
        })
        .unwrap_or(DEFAULT_TEMPLATE);

    steps
        .iter()
        .map(|(step, minutes)| SubtaskSuggestion {
            title: step.to_string(),
            estimated_minutes: Some(*minutes),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{CompletionClient, brain_dump, break_down_task, extract_json};
    use crate::task::Priority;

    struct Canned(&'static str);

    impl CompletionClient for Canned {
        fn complete(&self, _system: &str, _prompt: &str) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Down;

    impl CompletionClient for Down {
        fn complete(&self, _system: &str, _prompt: &str) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("503"))
        }
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0)
            .single()
            .expect("valid now")
    }

    #[test]
    fn strips_code_fences() {
        let value = extract_json("Sure!\n```json\n[{\"title\":\"A\"}]\n```\nDone.").expect("json");
        assert_eq!(value[0]["title"], "A");
        assert!(extract_json("no json here").is_err());
    }

    #[test]
    fn model_reply_is_mapped() {
        let client = Canned(
            "```\n[{\"title\":\"Book flights\",\"dueDate\":\"2026-10-20\",\"priority\":\"high\",\
             \"tags\":[\"#travel\"],\"estimatedMinutes\":30},{\"nope\":1}]\n```",
        );
        let tasks = brain_dump(Some(&client), "flights, hotel", now());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].due_date, NaiveDate::from_ymd_opt(2026, 10, 20));
        assert_eq!(tasks[0].priority, Some(Priority::High));
        assert_eq!(tasks[0].tags, vec!["travel"]);
    }

    #[test]
    fn fallback_splits_lines_bullets_and_semicolons() {
        let text = "- buy milk tomorrow\n2. call bank asap; renew passport (important)\n\n* [ ] ";
        let tasks = brain_dump(Some(&Down), text, now());
        let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["buy milk", "call bank asap", "renew passport (important)"]);
        assert_eq!(tasks[0].due_date, NaiveDate::from_ymd_opt(2026, 10, 19));
        assert_eq!(tasks[1].priority, Some(Priority::Urgent));
        assert_eq!(tasks[2].priority, Some(Priority::High));
        assert!(brain_dump(None, "   ", now()).is_empty());
    }

    #[test]
    fn breakdown_templates_by_keyword() {
        let bug = break_down_task(None, "Fix login crash", None);
        assert_eq!(bug[0].title, "Reproduce the problem");
        let other = break_down_task(Some(&Down), "Clean garage", None);
        assert_eq!(other.len(), 3);
        assert_eq!(other[1].estimated_minutes, Some(45));

        let client = Canned("{\"subtasks\":[{\"title\":\"Step one\",\"estimatedMinutes\":5}]}");
        let steps = break_down_task(Some(&client), "Anything", Some("notes"));
        assert_eq!(steps[0].title, "Step one");
    }
}
