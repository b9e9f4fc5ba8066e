//! Quick-entry parser: turns free text such as
//! `Call dentist tomorrow at 3pm !urgent ~30m #health @Inbox`
//! into structured task fields.
//!
//! Extraction runs per category in a fixed order (tags and list, priority,
//! estimate, time, date). Every match of a category is cut out of the
//! working text, but only the first one supplies the value. Passes repeat
//! over the cleaned remainder until nothing more is cut, and that remainder
//! becomes the title. Parsing never fails; fields that were not found are
//! simply absent.

use std::sync::OnceLock;

use chrono::{
  DateTime,
  Datelike,
  NaiveDate,
  NaiveTime,
  Utc,
  Weekday
};
use regex::{
  Captures,
  Regex
};
use serde::{
  Deserialize,
  Serialize
};
use tracing::{
  debug,
  warn
};

use crate::datetime::{
  add_days,
  add_months,
  clock_time,
  hhmm_serde,
  next_weekday_date,
  parse_month_name,
  parse_weekday_name,
  start_of_month,
  to_project_date
};
use crate::pattern::{
  cached_regex_set,
  collapse_whitespace
};
use crate::task::Priority;

#[derive(
  Debug,
  Clone,
  Default,
  PartialEq,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTask {
  pub title: String,

  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub due_date: Option<NaiveDate>,

  #[serde(
    default,
    with = "hhmm_serde",
    skip_serializing_if = "Option::is_none"
  )]
  pub due_time: Option<NaiveTime>,

  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub priority: Option<Priority>,

  #[serde(
    default,
    skip_serializing_if = "Vec::is_empty"
  )]
  pub tags: Vec<String>,

  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub estimated_minutes: Option<u32>,

  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub list_name: Option<String>
}

impl ParsedTask {
  /// True when anything besides the title was recognised.
  pub fn has_fields(&self) -> bool {
    self.due_date.is_some()
      || self.due_time.is_some()
      || self.priority.is_some()
      || !self.tags.is_empty()
      || self.estimated_minutes.is_some()
      || self.list_name.is_some()
  }

  /// Keeps values already found and
  /// appends new tags case-insensitively.
  /// Returns whether `found` held
  /// anything.
  fn absorb(
    &mut self,
    found: ParsedTask
  ) -> bool {
    let progressed = found.has_fields();
    self.due_date =
      self.due_date.or(found.due_date);
    self.due_time =
      self.due_time.or(found.due_time);
    self.priority =
      self.priority.or(found.priority);
    self.estimated_minutes = self
      .estimated_minutes
      .or(found.estimated_minutes);
    if self.list_name.is_none() {
      self.list_name = found.list_name;
    }
    for tag in found.tags {
      if !self
        .tags
        .iter()
        .any(|t| t.eq_ignore_ascii_case(&tag))
      {
        self.tags.push(tag);
      }
    }
    progressed
  }
}

type Extract<T> =
  fn(&Captures<'_>, NaiveDate) -> Option<T>;

struct Rule<T: 'static> {
  pattern: &'static str,
  extract: Extract<T>
}

const TAG_RULES: [Rule<String>; 1] = [
  Rule {
    pattern: r"(?:^|\s)#([\w-]+)",
    extract: |caps, _| {
      Some(caps[1].to_string())
    }
  }
];

const LIST_RULES: [Rule<String>; 1] = [
  Rule {
    pattern: r"(?:^|\s)@([\w-]+)",
    extract: |caps, _| {
      Some(caps[1].to_string())
    }
  }
];

const PRIORITY_RULES: [Rule<Priority>;
  3] = [
  Rule {
    pattern: r"(?i)(?:^|\s)!(urgent|high|medium|med|low)\b",
    extract: |caps, _| {
      caps[1].parse().ok()
    }
  },
  Rule {
    pattern: r"(?:^|\s)!!!(?:\s|$)",
    extract: |_, _| {
      Some(Priority::Urgent)
    }
  },
  Rule {
    pattern: r"(?i)(?:^|\s)p([1-4])\b",
    extract: |caps, _| {
      match &caps[1] {
        | "1" => Some(Priority::Urgent),
        | "2" => Some(Priority::High),
        | "3" => Some(Priority::Medium),
        | "4" => Some(Priority::Low),
        | _ => None
      }
    }
  }
];

const ESTIMATE_RULES: [Rule<u32>; 2] = [
  Rule {
    pattern: r"(?i)(?:^|\s)~(\d+(?:\.\d+)?)\s*(minutes|minute|mins|min|m|hours|hour|hrs|hr|h)\b",
    extract: |caps, _| {
      duration_minutes(
        &caps[1], &caps[2]
      )
    }
  },
  Rule {
    pattern: r"(?i)(?:^|\s)(\d+(?:\.\d+)?)\s*(minutes|minute|mins|min|hours|hour|hrs|hr)\b",
    extract: |caps, _| {
      duration_minutes(
        &caps[1], &caps[2]
      )
    }
  }
];

const TIME_RULES: [Rule<NaiveTime>; 3] = [
  Rule {
    pattern: r"(?i)(?:^|\s)at\s+(\d{1,2})(?::(\d{2}))?\s*([ap]m)?\b",
    extract: |caps, _| {
      let hour: u32 =
        caps[1].parse().ok()?;
      let minute = caps.get(2);
      let meridiem = caps
        .get(3)
        .map(|m| m.as_str());
      // a bare "at 3" reads as afternoon
      let hour = if minute.is_none()
        && meridiem.is_none()
        && (1..=7).contains(&hour)
      {
        hour + 12
      } else {
        hour
      };
      let minute = match minute {
        | Some(m) => {
          m.as_str().parse().ok()?
        }
        | None => 0
      };
      clock_time(hour, minute, meridiem)
    }
  },
  Rule {
    pattern: r"(?i)(?:^|\s)(\d{1,2}):(\d{2})\s*([ap]m)?\b",
    extract: |caps, _| {
      clock_time(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps.get(3).map(|m| m.as_str())
      )
    }
  },
  Rule {
    pattern: r"(?i)(?:^|\s)(\d{1,2})\s*([ap]m)\b",
    extract: |caps, _| {
      clock_time(
        caps[1].parse().ok()?,
        0,
        Some(&caps[2])
      )
    }
  }
];

const DATE_PREFIX: &str =
  r"(?i)(?:^|\s)(?:(?:on|by|due)\s+)?";

const DATE_RULES: [Rule<NaiveDate>; 8] = [
  Rule {
    pattern: r"(today|tonight|tomorrow|tmrw|tmr)\b",
    extract: |caps, today| {
      match caps[1]
        .to_ascii_lowercase()
        .as_str()
      {
        | "today" | "tonight" => {
          Some(today)
        }
        | _ => add_days(today, 1)
      }
    }
  },
  Rule {
    pattern: r"next\s+(week|month|year)\b",
    extract: |caps, today| {
      match caps[1]
        .to_ascii_lowercase()
        .as_str()
      {
        | "week" => {
          Some(next_weekday_date(
            today,
            Weekday::Mon
          ))
        }
        | "month" => {
          add_months(today, 1)
            .map(start_of_month)
        }
        | _ => {
          NaiveDate::from_ymd_opt(
            today.year() + 1,
            1,
            1
          )
        }
      }
    }
  },
  Rule {
    pattern: r"(?:this\s+)?weekend\b",
    extract: |_, today| {
      match today.weekday() {
        | Weekday::Sat | Weekday::Sun => {
          Some(today)
        }
        | _ => {
          Some(next_weekday_date(
            today,
            Weekday::Sat
          ))
        }
      }
    }
  },
  Rule {
    pattern: r"in\s+(\d{1,3})\s+(days?|weeks?|months?)\b",
    extract: |caps, today| {
      let amount: i64 =
        caps[1].parse().ok()?;
      let unit =
        caps[2].to_ascii_lowercase();
      if unit.starts_with("day") {
        add_days(today, amount)
      } else if unit.starts_with("week")
      {
        add_days(today, amount * 7)
      } else {
        add_months(today, amount)
      }
    }
  },
  Rule {
    pattern: r"(?:(?:next|this)\s+)?(monday|tuesday|wednesday|thursday|friday|saturday|sunday|mon|tues|tue|wed|thurs|thur|thu|fri)\b",
    extract: |caps, today| {
      parse_weekday_name(&caps[1]).map(
        |weekday| {
          next_weekday_date(
            today, weekday
          )
        }
      )
    }
  },
  Rule {
    pattern: r"(\d{4})-(\d{2})-(\d{2})\b",
    extract: |caps, _| {
      NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?
      )
    }
  },
  Rule {
    pattern: r"(\d{1,2})/(\d{1,2})(?:/(\d{4}|\d{2}))?\b",
    extract: |caps, today| {
      let month: u32 =
        caps[1].parse().ok()?;
      let day: u32 =
        caps[2].parse().ok()?;
      match caps.get(3) {
        | Some(year) => {
          let raw: i32 =
            year.as_str().parse().ok()?;
          let year = if raw < 100 {
            2000 + raw
          } else {
            raw
          };
          NaiveDate::from_ymd_opt(
            year, month, day
          )
        }
        | None => {
          upcoming_month_day(
            today, month, day
          )
        }
      }
    }
  },
  Rule {
    pattern: r"(january|february|march|april|may|june|july|august|september|sept|october|november|december|jan|feb|mar|apr|jun|jul|aug|sep|oct|nov|dec)\.?\s+(\d{1,2})(?:st|nd|rd|th)?\b",
    extract: |caps, today| {
      upcoming_month_day(
        today,
        parse_month_name(&caps[1])?,
        caps[2].parse().ok()?
      )
    }
  }
];

/// Parses against the project-local date of `now`.
pub fn parse_quick_add(
  input: &str,
  now: DateTime<Utc>
) -> ParsedTask {
  parse_quick_add_on(
    input,
    to_project_date(now)
  )
}

#[tracing::instrument(skip(input), fields(len = input.len()))]
pub fn parse_quick_add_on(
  input: &str,
  today: NaiveDate
) -> ParsedTask {
  let mut parsed = ParsedTask::default();
  let mut text = input.to_string();

  // Cutting a token or trimming edge
  // punctuation can expose another one,
  // so passes repeat until the title is
  // a fixed point.
  loop {
    let (rest, found) =
      extract_pass(text.clone(), today);
    let title = clean_title(&rest);
    let progressed = parsed.absorb(found);
    if !progressed && title == text {
      parsed.title = title;
      break;
    }
    text = title;
  }

  debug!(?parsed, "parsed quick-add input");
  parsed
}

/// One run of every category in order.
/// The returned title is left empty.
fn extract_pass(
  text: String,
  today: NaiveDate
) -> (String, ParsedTask) {
  static TAG_RES: OnceLock<Vec<Regex>> =
    OnceLock::new();
  static LIST_RES: OnceLock<Vec<Regex>> =
    OnceLock::new();
  static PRIORITY_RES: OnceLock<
    Vec<Regex>
  > = OnceLock::new();
  static ESTIMATE_RES: OnceLock<
    Vec<Regex>
  > = OnceLock::new();
  static TIME_RES: OnceLock<Vec<Regex>> =
    OnceLock::new();
  static DATE_RES: OnceLock<Vec<Regex>> =
    OnceLock::new();

  let (text, tags) = extract_all(
    text,
    &TAG_RES,
    &TAG_RULES,
    today,
    ""
  );
  let (text, lists) = extract_all(
    text,
    &LIST_RES,
    &LIST_RULES,
    today,
    ""
  );
  let (text, priorities) = extract_all(
    text,
    &PRIORITY_RES,
    &PRIORITY_RULES,
    today,
    ""
  );
  let (text, estimates) = extract_all(
    text,
    &ESTIMATE_RES,
    &ESTIMATE_RULES,
    today,
    ""
  );
  let (text, times) = extract_all(
    text,
    &TIME_RES,
    &TIME_RULES,
    today,
    ""
  );
  let (text, dates) = extract_all(
    text,
    &DATE_RES,
    &DATE_RULES,
    today,
    DATE_PREFIX
  );

  let found = ParsedTask {
    title: String::new(),
    due_date: dates.into_iter().next(),
    due_time: times.into_iter().next(),
    priority: priorities
      .into_iter()
      .next(),
    tags,
    estimated_minutes: estimates
      .into_iter()
      .next(),
    list_name: lists.into_iter().next()
  };
  (text, found)
}

/// Runs every rule of a category over `text`, cutting out each match whose
/// extractor accepts it. Values come back in rule order, then text order.
fn extract_all<T>(
  text: String,
  cell: &'static OnceLock<Vec<Regex>>,
  rules: &[Rule<T>],
  today: NaiveDate,
  prefix: &str
) -> (String, Vec<T>) {
  let patterns: Vec<String> = rules
    .iter()
    .map(|rule| {
      format!("{prefix}{}", rule.pattern)
    })
    .collect();
  let pattern_refs: Vec<&str> = patterns
    .iter()
    .map(String::as_str)
    .collect();

  let compiled = match cached_regex_set(
    cell,
    &pattern_refs
  ) {
    | Ok(compiled) => compiled,
    | Err(err) => {
      warn!(error = %err, "quick-add rule set unavailable; skipping");
      return (text, Vec::new());
    }
  };

  let mut values = Vec::new();
  let mut current = text;
  for (re, rule) in
    compiled.iter().zip(rules)
  {
    let mut out =
      String::with_capacity(current.len());
    let mut last = 0;
    for caps in re.captures_iter(&current)
    {
      let Some(whole) = caps.get(0) else {
        continue;
      };
      if let Some(value) =
        (rule.extract)(&caps, today)
      {
        out.push_str(
          &current[last..whole.start()]
        );
        out.push(' ');
        last = whole.end();
        values.push(value);
      }
    }
    out.push_str(&current[last..]);
    current = out;
  }

  (current, values)
}

fn duration_minutes(
  amount: &str,
  unit: &str
) -> Option<u32> {
  let amount: f64 = amount.parse().ok()?;
  let minutes = if unit
    .to_ascii_lowercase()
    .starts_with('h')
  {
    amount * 60.0
  } else {
    amount
  };
  let rounded = minutes.round();
  if rounded < 1.0
    || rounded > f64::from(u32::MAX)
  {
    return None;
  }
  Some(rounded as u32)
}

/// A month/day without a year means its next occurrence, today included.
fn upcoming_month_day(
  today: NaiveDate,
  month: u32,
  day: u32
) -> Option<NaiveDate> {
  let this_year = NaiveDate::from_ymd_opt(
    today.year(),
    month,
    day
  );
  match this_year {
    | Some(date) if date >= today => {
      Some(date)
    }
    | _ => {
      NaiveDate::from_ymd_opt(
        today.year() + 1,
        month,
        day
      )
    }
  }
}

fn clean_title(text: &str) -> String {
  collapse_whitespace(text)
    .trim_matches(|c: char| {
      c.is_whitespace()
        || matches!(
          c,
          ',' | ';' | ':' | '-' | '.'
        )
    })
    .to_string()
}

#[cfg(test)]
mod tests {
  use chrono::{
    NaiveDate,
    NaiveTime
  };

  use super::{
    ParsedTask,
    parse_quick_add_on
  };
  use crate::task::Priority;

  fn today() -> NaiveDate {
    // a Sunday
    NaiveDate::from_ymd_opt(2026, 10, 18)
      .expect("valid date")
  }

  fn date(
    y: i32,
    m: u32,
    d: u32
  ) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d)
      .expect("valid date")
  }

  #[test]
  fn parses_the_canonical_example() {
    let parsed = parse_quick_add_on(
      "Call dentist tomorrow at 3pm \
       !urgent ~30m",
      today()
    );
    assert_eq!(parsed, ParsedTask {
      title: "Call dentist".to_string(),
      due_date: Some(date(2026, 10, 19)),
      due_time: NaiveTime::from_hms_opt(
        15, 0, 0
      ),
      priority: Some(Priority::Urgent),
      tags: vec![],
      estimated_minutes: Some(30),
      list_name: None
    });
  }

  #[test]
  fn p1_prefix_marks_urgent() {
    let parsed = parse_quick_add_on(
      "p1 Fix bug",
      today()
    );
    assert_eq!(
      parsed.priority,
      Some(Priority::Urgent)
    );
    assert_eq!(parsed.title, "Fix bug");
  }

  #[test]
  fn extracts_tags_and_list() {
    let parsed = parse_quick_add_on(
      "Renew passport #admin #travel \
       @Errands #admin",
      today()
    );
    assert_eq!(parsed.tags, vec![
      "admin".to_string(),
      "travel".to_string()
    ]);
    assert_eq!(
      parsed.list_name.as_deref(),
      Some("Errands")
    );
    assert_eq!(
      parsed.title,
      "Renew passport"
    );
  }

  #[test]
  fn tag_is_always_removed_from_title() {
    for input in [
      "#solo",
      "a #b c",
      "trailing #tag",
      "#lead then words",
      "mixed #with-dash and more",
      "Read docs #a#b",
      "foo today#bar",
      ".#dot-led item",
      "#x#y#z"
    ] {
      let parsed =
        parse_quick_add_on(input, today());
      assert!(
        !parsed.tags.is_empty(),
        "{input}"
      );
      for tag in &parsed.tags {
        assert!(
          !parsed
            .title
            .contains(&format!("#{tag}")),
          "{input} -> {}",
          parsed.title
        );
      }
    }
  }

  #[test]
  fn punctuation_and_adjacent_tokens_are_extracted() {
    let cases = [
      (
        ".p1 Fix bug",
        "Fix bug",
        ParsedTask {
          priority: Some(Priority::Urgent),
          ..ParsedTask::default()
        }
      ),
      (
        "-tomorrow buy milk",
        "buy milk",
        ParsedTask {
          due_date: Some(date(2026, 10, 19)),
          ..ParsedTask::default()
        }
      ),
      (
        "Read docs #a#b",
        "Read docs",
        ParsedTask {
          tags: vec![
            "a".to_string(),
            "b".to_string()
          ],
          ..ParsedTask::default()
        }
      ),
      (
        "foo today#bar",
        "foo",
        ParsedTask {
          due_date: Some(today()),
          tags: vec!["bar".to_string()],
          ..ParsedTask::default()
        }
      )
    ];
    for (input, title, expected) in cases {
      let parsed =
        parse_quick_add_on(input, today());
      assert_eq!(
        parsed,
        ParsedTask {
          title: title.to_string(),
          ..expected
        },
        "{input}"
      );
    }
  }

  #[test]
  fn email_addresses_are_not_lists() {
    let parsed = parse_quick_add_on(
      "Reply to ana@example.com",
      today()
    );
    assert_eq!(parsed.list_name, None);
    assert_eq!(
      parsed.title,
      "Reply to ana@example.com"
    );
  }

  #[test]
  fn parses_duration_forms() {
    let cases = [
      ("Write report 2 hours", 120),
      ("Stretch ~15 min", 15),
      ("Deep work ~1.5h", 90),
      ("Review 90 minutes", 90)
    ];
    for (input, minutes) in cases {
      let parsed =
        parse_quick_add_on(input, today());
      assert_eq!(
        parsed.estimated_minutes,
        Some(minutes),
        "{input}"
      );
    }
  }

  #[test]
  fn parses_time_forms() {
    let cases = [
      ("Standup at 9:30am", (9, 30)),
      ("Gym 18:15", (18, 15)),
      ("Lunch 12pm", (12, 0)),
      ("Call mom at 5", (17, 0)),
      ("Train at 21", (21, 0))
    ];
    for (input, (h, m)) in cases {
      let parsed =
        parse_quick_add_on(input, today());
      assert_eq!(
        parsed.due_time,
        NaiveTime::from_hms_opt(h, m, 0),
        "{input}"
      );
    }
  }

  #[test]
  fn invalid_clock_values_stay_in_title() {
    let parsed = parse_quick_add_on(
      "Room 25:99 cleanup",
      today()
    );
    assert_eq!(parsed.due_time, None);
    assert_eq!(
      parsed.title,
      "Room 25:99 cleanup"
    );
  }

  #[test]
  fn parses_date_forms() {
    let cases = [
      ("Pay rent today", date(2026, 10, 18)),
      ("Plan sprint next week", date(2026, 10, 19)),
      ("Budget next month", date(2026, 11, 1)),
      ("Hike this weekend", date(2026, 10, 18)),
      ("Follow up in 3 days", date(2026, 10, 21)),
      ("Retro in 2 weeks", date(2026, 11, 1)),
      ("Submit report by friday", date(2026, 10, 23)),
      ("Dinner next wed", date(2026, 10, 21)),
      ("Taxes 2027-04-15", date(2027, 4, 15)),
      ("Party 12/25", date(2026, 12, 25)),
      ("Trip 3/4", date(2027, 3, 4)),
      ("Exam 1/9/27", date(2027, 1, 9)),
      ("Launch on March 3rd", date(2027, 3, 3)),
      ("Dentist oct 18", date(2026, 10, 18))
    ];
    for (input, expected) in cases {
      let parsed =
        parse_quick_add_on(input, today());
      assert_eq!(
        parsed.due_date,
        Some(expected),
        "{input}"
      );
    }

    let parsed = parse_quick_add_on(
      "Submit report by friday",
      today()
    );
    assert_eq!(parsed.title, "Submit report");
  }

  #[test]
  fn first_date_wins_and_others_are_stripped() {
    let parsed = parse_quick_add_on(
      "Meet Sam today or tomorrow",
      today()
    );
    assert_eq!(parsed.due_date, Some(today()));
    assert_eq!(parsed.title, "Meet Sam or");
  }

  #[test]
  fn reparsing_a_clean_title_extracts_nothing() {
    for input in [
      "Call dentist tomorrow at 3pm !urgent ~30m #health @Inbox",
      "p2 Draft roadmap next week ~2h #planning",
      "Water plants every monday at 7:00am",
      "Meet Sam today or tomorrow",
      "Buy milk, eggs; bread.",
      ".p1 Fix bug",
      "-tomorrow buy milk",
      "Read docs #a#b",
      "foo today#bar",
      "Ship it;!high now",
      "notes: ~20m -- @Home"
    ] {
      let first =
        parse_quick_add_on(input, today());
      let second = parse_quick_add_on(
        &first.title,
        today()
      );
      assert!(
        !second.has_fields(),
        "{input} -> {:?}",
        second
      );
      assert_eq!(second.title, first.title);
    }
  }

  #[test]
  fn fully_consumed_input_leaves_empty_title() {
    let parsed = parse_quick_add_on(
      "#inbox tomorrow",
      today()
    );
    assert_eq!(parsed.title, "");
    assert!(parsed.has_fields());
  }

  #[test]
  fn serializes_with_camel_case_and_omits_missing() {
    let parsed = parse_quick_add_on(
      "Call dentist tomorrow at 3pm",
      today()
    );
    let json = serde_json::to_value(&parsed)
      .expect("serialize");
    assert_eq!(json["dueDate"], "2026-10-19");
    assert_eq!(json["dueTime"], "15:00");
    assert!(json.get("priority").is_none());
    assert!(json.get("tags").is_none());
  }
}
