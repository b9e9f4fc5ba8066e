use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::anyhow;
use chrono::{
  DateTime,
  Datelike,
  Days,
  LocalResult,
  Months,
  NaiveDate,
  NaiveDateTime,
  NaiveTime,
  TimeZone,
  Utc,
  Weekday
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

use crate::pattern::cached_regex;

const TIMEZONE_CONFIG_FILE: &str =
  "zeroed-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "ZEROED_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "ZEROED_TIME_CONFIG";
const DEFAULT_PROJECT_TIMEZONE: &str =
  "UTC";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

pub fn project_timezone() -> &'static Tz
{
  static PROJECT_TZ: OnceLock<Tz> =
    OnceLock::new();
  PROJECT_TZ.get_or_init(
    resolve_project_timezone
  )
}

#[must_use]
pub fn to_project_date(
  dt: DateTime<Utc>
) -> NaiveDate {
  dt.with_timezone(project_timezone())
    .date_naive()
}

fn resolve_project_timezone() -> Tz {
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) =
      parse_timezone(&raw, TIMEZONE_ENV_VAR)
  {
    return tz;
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return tz;
  }

  parse_timezone(
    DEFAULT_PROJECT_TIMEZONE,
    "DEFAULT_PROJECT_TIMEZONE"
  )
  .unwrap_or(chrono_tz::UTC)
}

fn timezone_config_path()
-> Option<PathBuf> {
  if let Ok(raw) = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
      return Some(PathBuf::from(
        trimmed
      ));
    }
  }

  std::env::current_dir().ok().map(
    |dir| {
      dir.join(TIMEZONE_CONFIG_FILE)
    }
  )
}

fn load_timezone_from_file(
  path: &PathBuf
) -> Option<Tz> {
  if !path.exists() {
    tracing::debug!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let parsed = match toml::from_str::<
    TimezoneConfig
  >(&raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let timezone =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    });
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::debug!(
        source,
        timezone = %trimmed,
        "configured project timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

/// Interprets a wall-clock date/time in the project timezone.
pub fn project_local_to_utc(
  local_naive: NaiveDateTime
) -> anyhow::Result<DateTime<Utc>> {
  match project_timezone()
    .from_local_datetime(&local_naive)
  {
    | LocalResult::Single(local_dt) => {
      Ok(local_dt.with_timezone(&Utc))
    }
    | LocalResult::Ambiguous(
      first,
      second
    ) => {
      tracing::warn!(
        first = %first,
        second = %second,
        "ambiguous local datetime; using earliest"
      );
      let chosen = if first <= second {
        first
      } else {
        second
      };
      Ok(chosen.with_timezone(&Utc))
    }
    | LocalResult::None => {
      Err(anyhow!(
        "local datetime does not \
         exist in configured \
         timezone: {local_naive}"
      ))
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
)]
pub enum WeekStart {
  #[default]
  Monday,
  Sunday
}

impl FromStr for WeekStart {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "monday" | "mon" => {
        Ok(Self::Monday)
      }
      | "sunday" | "sun" => {
        Ok(Self::Sunday)
      }
      | other => {
        Err(anyhow!(
          "invalid week start: \
           {other}"
        ))
      }
    }
  }
}

impl WeekStart {
  fn first_day(self) -> Weekday {
    match self {
      | Self::Monday => Weekday::Mon,
      | Self::Sunday => Weekday::Sun
    }
  }
}

#[must_use]
pub fn start_of_week(
  date: NaiveDate,
  week_start: WeekStart
) -> NaiveDate {
  date
    .week(week_start.first_day())
    .first_day()
}

#[must_use]
pub fn end_of_week(
  date: NaiveDate,
  week_start: WeekStart
) -> NaiveDate {
  date
    .week(week_start.first_day())
    .last_day()
}

#[must_use]
pub fn start_of_month(
  date: NaiveDate
) -> NaiveDate {
  date.with_day(1).unwrap_or(date)
}

#[must_use]
pub fn end_of_month(
  date: NaiveDate
) -> NaiveDate {
  start_of_month(date)
    .checked_add_months(Months::new(1))
    .and_then(|next| {
      next.pred_opt()
    })
    .unwrap_or(date)
}

#[must_use]
pub fn start_of_year(
  date: NaiveDate
) -> NaiveDate {
  NaiveDate::from_ymd_opt(
    date.year(),
    1,
    1
  )
  .unwrap_or(date)
}

#[must_use]
pub fn end_of_year(
  date: NaiveDate
) -> NaiveDate {
  NaiveDate::from_ymd_opt(
    date.year(),
    12,
    31
  )
  .unwrap_or(date)
}

/// Shifts by whole months, clamping the day to the target month's length.
#[must_use]
pub fn add_months(
  date: NaiveDate,
  months: i64
) -> Option<NaiveDate> {
  let magnitude =
    u32::try_from(months.unsigned_abs())
      .ok()?;
  if months >= 0 {
    date.checked_add_months(
      Months::new(magnitude)
    )
  } else {
    date.checked_sub_months(
      Months::new(magnitude)
    )
  }
}

#[must_use]
pub fn add_days(
  date: NaiveDate,
  days: i64
) -> Option<NaiveDate> {
  let magnitude = days.unsigned_abs();
  if days >= 0 {
    date.checked_add_days(Days::new(
      magnitude
    ))
  } else {
    date.checked_sub_days(Days::new(
      magnitude
    ))
  }
}

/// Resolves tokens such as `today`, `start_of_week` or `+3d` against
/// `today`. Returns `None` for anything that is not a relative token.
pub fn resolve_relative_date(
  token: &str,
  today: NaiveDate,
  week_start: WeekStart
) -> Option<NaiveDate> {
  let lower = token
    .trim()
    .to_ascii_lowercase();

  match lower.as_str() {
    | "today" => return Some(today),
    | "tomorrow" => {
      return add_days(today, 1);
    }
    | "yesterday" => {
      return add_days(today, -1);
    }
    | "start_of_week" => {
      return Some(start_of_week(
        today, week_start
      ));
    }
    | "end_of_week" => {
      return Some(end_of_week(
        today, week_start
      ));
    }
    | "start_of_month" => {
      return Some(start_of_month(
        today
      ));
    }
    | "end_of_month" => {
      return Some(end_of_month(today));
    }
    | "start_of_year" => {
      return Some(start_of_year(today));
    }
    | "end_of_year" => {
      return Some(end_of_year(today));
    }
    | "next_week" => {
      return add_days(today, 7);
    }
    | "last_week" => {
      return add_days(today, -7);
    }
    | _ => {}
  }

  static OFFSET_RE: OnceLock<Regex> =
    OnceLock::new();
  let offset_re = cached_regex(
    &OFFSET_RE,
    r"^(?P<sign>[+-])(?P<num>\d{1,4})(?P<unit>[dwmy])$"
  )
  .ok()?;
  let caps = offset_re.captures(&lower)?;
  let num: i64 =
    caps.name("num")?.as_str().parse().ok()?;
  let signed = if &caps["sign"] == "-" {
    -num
  } else {
    num
  };

  match &caps["unit"] {
    | "d" => add_days(today, signed),
    | "w" => {
      add_days(today, signed * 7)
    }
    | "m" => add_months(today, signed),
    | "y" => {
      add_months(today, signed * 12)
    }
    | _ => None
  }
}

pub fn parse_weekday_name(
  token: &str
) -> Option<Weekday> {
  match token
    .trim()
    .to_ascii_lowercase()
    .as_str()
  {
    | "monday" | "mon" => {
      Some(Weekday::Mon)
    }
    | "tuesday" | "tue" | "tues" => {
      Some(Weekday::Tue)
    }
    | "wednesday" | "wed" => {
      Some(Weekday::Wed)
    }
    | "thursday" | "thu" | "thur"
    | "thurs" => Some(Weekday::Thu),
    | "friday" | "fri" => {
      Some(Weekday::Fri)
    }
    | "saturday" | "sat" => {
      Some(Weekday::Sat)
    }
    | "sunday" | "sun" => {
      Some(Weekday::Sun)
    }
    | _ => None
  }
}

/// Next date strictly after `from` falling on `target`.
#[must_use]
pub fn next_weekday_date(
  from: NaiveDate,
  target: Weekday
) -> NaiveDate {
  let from_idx = i64::from(
    from
      .weekday()
      .num_days_from_monday()
  );
  let target_idx = i64::from(
    target.num_days_from_monday()
  );
  let mut delta =
    (7 + target_idx - from_idx) % 7;
  if delta == 0 {
    delta = 7;
  }
  add_days(from, delta).unwrap_or(from)
}

pub fn parse_month_name(
  token: &str
) -> Option<u32> {
  match token
    .trim()
    .to_ascii_lowercase()
    .as_str()
  {
    | "january" | "jan" => Some(1),
    | "february" | "feb" => Some(2),
    | "march" | "mar" => Some(3),
    | "april" | "apr" => Some(4),
    | "may" => Some(5),
    | "june" | "jun" => Some(6),
    | "july" | "jul" => Some(7),
    | "august" | "aug" => Some(8),
    | "september" | "sep" | "sept" => {
      Some(9)
    }
    | "october" | "oct" => Some(10),
    | "november" | "nov" => Some(11),
    | "december" | "dec" => Some(12),
    | _ => None
  }
}

/// Builds a time of day from a raw hour, minute and optional am/pm marker.
pub fn clock_time(
  raw_hour: u32,
  minute: u32,
  meridiem: Option<&str>
) -> Option<NaiveTime> {
  if minute > 59 {
    return None;
  }

  let hour = match meridiem.map(|m| {
    m.to_ascii_lowercase()
  }) {
    | Some(ampm) => {
      if raw_hour == 0 || raw_hour > 12
      {
        return None;
      }
      match ampm.as_str() {
        | "am" | "a" => {
          if raw_hour == 12 {
            0
          } else {
            raw_hour
          }
        }
        | "pm" | "p" => {
          if raw_hour == 12 {
            12
          } else {
            raw_hour + 12
          }
        }
        | _ => return None
      }
    }
    | None => {
      if raw_hour > 23 {
        return None;
      }
      raw_hour
    }
  };

  NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Parses `15:30`, `3:30pm` or `3pm`.
pub fn parse_clock_time(
  token: &str
) -> Option<NaiveTime> {
  static CLOCK_RE: OnceLock<Regex> =
    OnceLock::new();
  let clock_re = cached_regex(
    &CLOCK_RE,
    r"(?i)^(?P<hour>\d{1,2})(?::(?P<minute>\d{2}))?\s*(?P<ampm>[ap]m)?$",
  )
  .ok()?;
  let captures =
    clock_re.captures(token.trim())?;

  let raw_hour = captures
    .name("hour")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  let minute = match captures
    .name("minute")
  {
    | Some(m) => {
      m.as_str().parse::<u32>().ok()?
    }
    | None => 0
  };
  let ampm = captures
    .name("ampm")
    .map(|m| m.as_str());

  if ampm.is_none()
    && captures.name("minute").is_none()
  {
    return None;
  }

  clock_time(raw_hour, minute, ampm)
}

/// `Option<NaiveTime>` stored as `HH:MM`.
pub mod hhmm_serde {
  use chrono::NaiveTime;
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };

  pub fn serialize<S>(
    time: &Option<NaiveTime>,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    match time {
      | Some(value) => {
        serializer.serialize_str(
          &value
            .format("%H:%M")
            .to_string()
        )
      }
      | None => {
        serializer.serialize_none()
      }
    }
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<
    Option<NaiveTime>,
    D::Error
  >
  where
    D: Deserializer<'de>
  {
    let opt =
      Option::<String>::deserialize(
        deserializer
      )?;
    match opt {
      | Some(raw) => {
        NaiveTime::parse_from_str(
          &raw, "%H:%M"
        )
        .or_else(|_| {
          NaiveTime::parse_from_str(
            &raw, "%H:%M:%S"
          )
        })
        .map(Some)
        .map_err(
          serde::de::Error::custom
        )
      }
      | None => Ok(None)
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::{
    NaiveDate,
    NaiveTime,
    Weekday
  };

  use super::{
    WeekStart,
    clock_time,
    end_of_month,
    next_weekday_date,
    parse_clock_time,
    resolve_relative_date,
    start_of_week
  };

  fn date(
    y: i32,
    m: u32,
    d: u32
  ) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d)
      .expect("valid date")
  }

  #[test]
  fn resolves_week_and_month_tokens() {
    // Sunday
    let today = date(2026, 10, 18);
    assert_eq!(
      resolve_relative_date(
        "start_of_week",
        today,
        WeekStart::Monday
      ),
      Some(date(2026, 10, 12))
    );
    assert_eq!(
      resolve_relative_date(
        "start_of_week",
        today,
        WeekStart::Sunday
      ),
      Some(today)
    );
    assert_eq!(
      resolve_relative_date(
        "end_of_month",
        today,
        WeekStart::Monday
      ),
      Some(date(2026, 10, 31))
    );
  }

  #[test]
  fn resolves_signed_offsets() {
    let today = date(2026, 1, 31);
    assert_eq!(
      resolve_relative_date(
        "+1m",
        today,
        WeekStart::Monday
      ),
      Some(date(2026, 2, 28))
    );
    assert_eq!(
      resolve_relative_date(
        "-2w",
        today,
        WeekStart::Monday
      ),
      Some(date(2026, 1, 17))
    );
    assert_eq!(
      resolve_relative_date(
        "someday",
        today,
        WeekStart::Monday
      ),
      None
    );
  }

  #[test]
  fn end_of_month_handles_leap_years() {
    assert_eq!(
      end_of_month(date(2028, 2, 3)),
      date(2028, 2, 29)
    );
  }

  #[test]
  fn next_weekday_is_strictly_after() {
    let friday = date(2026, 10, 16);
    assert_eq!(
      next_weekday_date(
        friday,
        Weekday::Fri
      ),
      date(2026, 10, 23)
    );
    assert_eq!(
      start_of_week(
        friday,
        WeekStart::Monday
      ),
      date(2026, 10, 12)
    );
  }

  #[test]
  fn parses_clock_forms() {
    assert_eq!(
      parse_clock_time("3:23pm"),
      NaiveTime::from_hms_opt(15, 23, 0)
    );
    assert_eq!(
      parse_clock_time("12am"),
      NaiveTime::from_hms_opt(0, 0, 0)
    );
    assert_eq!(
      parse_clock_time("15:30"),
      NaiveTime::from_hms_opt(15, 30, 0)
    );
    assert_eq!(
      parse_clock_time("15"),
      None
    );
    assert_eq!(
      clock_time(13, 0, Some("pm")),
      None
    );
  }
}
