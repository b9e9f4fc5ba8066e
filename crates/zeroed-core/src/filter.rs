use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{
  Context,
  anyhow
};
use chrono::{
  DateTime,
  NaiveDate,
  Utc
};
use serde::{
  Deserialize,
  Serialize
};
use serde_json::Value;
use tracing::{
  debug,
  info,
  trace
};
use uuid::Uuid;

use crate::datastore::{
  DataStore,
  Record
};
use crate::datetime::{
  WeekStart,
  resolve_relative_date,
  to_project_date
};
use crate::task::{
  Priority,
  Task
};

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
  Title,
  Notes,
  Status,
  Priority,
  DueDate,
  DueTime,
  EstimatedMinutes,
  ActualMinutes,
  ListId,
  ParentId,
  ProjectId,
  AssigneeId,
  Tags,
  CreatedAt,
  CompletedAt,
  Position
}

impl FilterField {
  pub fn column(self) -> &'static str {
    match self {
      | Self::Title => "title",
      | Self::Notes => "notes",
      | Self::Status => "status",
      | Self::Priority => "priority",
      | Self::DueDate => "due_date",
      | Self::DueTime => "due_time",
      | Self::EstimatedMinutes => {
        "estimated_minutes"
      }
      | Self::ActualMinutes => {
        "actual_minutes"
      }
      | Self::ListId => "list_id",
      | Self::ParentId => "parent_id",
      | Self::ProjectId => "project_id",
      | Self::AssigneeId => "assignee_id",
      | Self::Tags => "tags",
      | Self::CreatedAt => "created_at",
      | Self::CompletedAt => "completed_at",
      | Self::Position => "position"
    }
  }

  fn is_date(self) -> bool {
    matches!(
      self,
      Self::DueDate
        | Self::CreatedAt
        | Self::CompletedAt
    )
  }

  fn is_numeric(self) -> bool {
    matches!(
      self,
      Self::EstimatedMinutes
        | Self::ActualMinutes
        | Self::Position
    )
  }
}

impl FromStr for FilterField {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    serde_json::from_value(Value::String(
      s.trim().to_string()
    ))
    .map_err(|_| {
      anyhow!("unknown filter field: {s}")
    })
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
  Eq,
  Neq,
  Gt,
  Gte,
  Lt,
  Lte,
  In,
  NotIn,
  IsNull,
  IsNotNull,
  Contains
}

impl FromStr for Operator {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    serde_json::from_value(Value::String(
      s.trim().to_string()
    ))
    .map_err(|_| {
      anyhow!(
        "unknown filter operator: {s}"
      )
    })
  }
}

#[derive(
  Debug,
  Clone,
  PartialEq,
  Serialize,
  Deserialize,
)]
pub struct FilterCondition {
  pub field:    FilterField,
  pub operator: Operator,
  #[serde(default)]
  pub value:    Value
}

impl FromStr for FilterCondition {
  type Err = anyhow::Error;

  /// `field:operator[:value]`; list values are comma separated.
  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    let mut parts = s.splitn(3, ':');
    let field: FilterField = parts
      .next()
      .unwrap_or_default()
      .parse()?;
    let operator: Operator = parts
      .next()
      .ok_or_else(|| {
        anyhow!(
          "condition needs \
           field:operator[:value], \
           got: {s}"
        )
      })?
      .parse()?;
    let raw = parts.next();

    let value = match (operator, raw) {
      | (
        Operator::IsNull
        | Operator::IsNotNull,
        _
      ) => Value::Null,
      | (
        Operator::In | Operator::NotIn,
        Some(raw)
      ) => {
        Value::Array(
          raw
            .split(',')
            .map(|item| {
              Value::String(
                item.trim().to_string()
              )
            })
            .collect()
        )
      }
      | (_, Some(raw)) => {
        Value::String(raw.to_string())
      }
      | (_, None) => {
        return Err(anyhow!(
          "operator {operator:?} needs \
           a value: {s}"
        ));
      }
    };

    Ok(Self {
      field,
      operator,
      value
    })
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
pub struct SortSpec {
  pub field:     FilterField,
  #[serde(default = "default_ascending")]
  pub ascending: bool
}

fn default_ascending() -> bool {
  true
}

impl FromStr for SortSpec {
  type Err = anyhow::Error;

  /// `field` or `field:asc` / `field:desc`.
  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    let (field, direction) =
      match s.split_once(':') {
        | Some((f, d)) => (f, d),
        | None => (s, "asc")
      };
    let ascending = match direction
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "asc" => true,
      | "desc" => false,
      | other => {
        return Err(anyhow!(
          "invalid sort direction: \
           {other}"
        ));
      }
    };
    Ok(Self {
      field: field.parse()?,
      ascending
    })
  }
}

/// A saved, named set of conditions producing a dynamic task view.
#[derive(
  Debug,
  Clone,
  PartialEq,
  Serialize,
  Deserialize,
)]
pub struct SmartFilter {
  pub id:         Uuid,
  pub user_id:    Uuid,
  pub name:       String,
  #[serde(default)]
  pub icon:       Option<String>,
  #[serde(default)]
  pub color:      Option<String>,
  pub conditions: Vec<FilterCondition>,
  #[serde(default)]
  pub sort:       Option<SortSpec>,
  pub created_at: DateTime<Utc>
}

impl Record for SmartFilter {
  const FILE: &'static str =
    "filters.data";
}

/// A task attribute or condition operand, normalised for comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
  Null,
  Text(String),
  Number(f64),
  Rank(Priority),
  List(Vec<String>)
}

impl fmt::Display for FieldValue {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    match self {
      | Self::Null => f.write_str("null"),
      | Self::Text(text) => {
        f.write_str(text)
      }
      | Self::Number(n) => write!(f, "{n}"),
      | Self::Rank(p) => {
        f.write_str(p.as_str())
      }
      | Self::List(items) => {
        write!(f, "{{{}}}", items.join(","))
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
  Absent,
  One(FieldValue),
  Many(Vec<FieldValue>)
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
  field:    FilterField,
  operator: Operator,
  operand:  Operand
}

/// Accumulates clauses (all ANDed) plus an optional ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQuery {
  clauses: Vec<Clause>,
  order:   Option<SortSpec>
}

impl TaskQuery {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn eq(
    self,
    field: FilterField,
    value: FieldValue
  ) -> Self {
    self.push(
      field,
      Operator::Eq,
      Operand::One(value)
    )
  }

  pub fn is_null(
    self,
    field: FilterField
  ) -> Self {
    self.push(
      field,
      Operator::IsNull,
      Operand::Absent
    )
  }

  pub fn order(
    mut self,
    sort: Option<SortSpec>
  ) -> Self {
    self.order = sort;
    self
  }

  fn push(
    mut self,
    field: FilterField,
    operator: Operator,
    operand: Operand
  ) -> Self {
    self.clauses.push(Clause {
      field,
      operator,
      operand
    });
    self
  }

  /// Resolves the condition's value for its field and appends the clause.
  pub fn apply_condition(
    self,
    condition: &FilterCondition,
    today: NaiveDate,
    week_start: WeekStart
  ) -> anyhow::Result<Self> {
    let field = condition.field;
    let operand = match condition.operator
    {
      | Operator::IsNull
      | Operator::IsNotNull => {
        Operand::Absent
      }
      | Operator::In
      | Operator::NotIn => {
        let items = match &condition.value
        {
          | Value::Array(items) => {
            items.clone()
          }
          | Value::Null => {
            return Err(anyhow!(
              "{} needs a list value",
              field.column()
            ));
          }
          | other => vec![other.clone()]
        };
        Operand::Many(
          items
            .iter()
            .map(|item| {
              resolve_operand(
                field, item, today,
                week_start
              )
            })
            .collect::<anyhow::Result<_>>(
            )?
        )
      }
      | _ => {
        Operand::One(resolve_operand(
          field,
          &condition.value,
          today,
          week_start
        )?)
      }
    };

    trace!(
      field = field.column(),
      operator = ?condition.operator,
      ?operand,
      "folded filter condition"
    );
    Ok(self.push(
      field,
      condition.operator,
      operand
    ))
  }

  pub fn matches(
    &self,
    task: &Task
  ) -> bool {
    self.clauses.iter().all(|clause| {
      eval_clause(clause, task)
    })
  }

  /// Filters then sorts; nulls always sort last.
  pub fn run<'a>(
    &self,
    tasks: &'a [Task]
  ) -> Vec<&'a Task> {
    let mut out: Vec<&Task> = tasks
      .iter()
      .filter(|task| self.matches(task))
      .collect();

    if let Some(sort) = self.order {
      out.sort_by(|a, b| {
        let left =
          field_value(a, sort.field);
        let right =
          field_value(b, sort.field);
        match (&left, &right) {
          | (FieldValue::Null, FieldValue::Null) => {
            Ordering::Equal
          }
          | (FieldValue::Null, _) => {
            Ordering::Greater
          }
          | (_, FieldValue::Null) => {
            Ordering::Less
          }
          | _ => {
            let ord = compare(&left, &right)
              .unwrap_or(Ordering::Equal);
            if sort.ascending {
              ord
            } else {
              ord.reverse()
            }
          }
        }
      });
    }

    out
  }

  /// PostgREST-style rendering, e.g. `due_date=eq.2026-10-18&order=...`.
  pub fn to_query_string(&self) -> String {
    let mut parts: Vec<String> = self
      .clauses
      .iter()
      .map(render_clause)
      .collect();
    if let Some(sort) = self.order {
      parts.push(format!(
        "order={}.{}.nullslast",
        sort.field.column(),
        if sort.ascending {
          "asc"
        } else {
          "desc"
        }
      ));
    }
    parts.join("&")
  }
}

/// Folds conditions onto a fresh query in order.
#[tracing::instrument(skip(conditions))]
pub fn build_query(
  conditions: &[FilterCondition],
  sort: Option<SortSpec>,
  today: NaiveDate,
  week_start: WeekStart
) -> anyhow::Result<TaskQuery> {
  let query = conditions.iter().try_fold(
    TaskQuery::new(),
    |query, condition| {
      query.apply_condition(
        condition, today, week_start
      )
    }
  )?;
  debug!(
    clauses = conditions.len(),
    "built task query"
  );
  Ok(query.order(sort))
}

fn resolve_operand(
  field: FilterField,
  raw: &Value,
  today: NaiveDate,
  week_start: WeekStart
) -> anyhow::Result<FieldValue> {
  let value = match raw {
    | Value::Null => FieldValue::Null,
    | Value::Bool(b) => {
      FieldValue::Text(b.to_string())
    }
    | Value::Number(n) => {
      FieldValue::Number(
        n.as_f64().unwrap_or_default()
      )
    }
    | Value::String(text) => {
      if field.is_date() {
        let resolved =
          resolve_relative_date(
            text, today, week_start
          )
          .map(|date| {
            date
              .format("%Y-%m-%d")
              .to_string()
          })
          .unwrap_or_else(|| {
            text.clone()
          });
        FieldValue::Text(resolved)
      } else if field
        == FilterField::Priority
      {
        FieldValue::Rank(
          text.parse().with_context(
            || {
              format!(
                "invalid priority in \
                 filter: {text}"
              )
            }
          )?
        )
      } else if field.is_numeric() {
        FieldValue::Number(
          text.trim().parse().with_context(
            || {
              format!(
                "{} expects a number, \
                 got: {text}",
                field.column()
              )
            }
          )?
        )
      } else {
        FieldValue::Text(text.clone())
      }
    }
    | Value::Array(_)
    | Value::Object(_) => {
      return Err(anyhow!(
        "unsupported value for {}: \
         {raw}",
        field.column()
      ));
    }
  };
  Ok(value)
}

pub fn field_value(
  task: &Task,
  field: FilterField
) -> FieldValue {
  fn opt_text<T: ToString>(
    value: Option<T>
  ) -> FieldValue {
    value
      .map(|v| {
        FieldValue::Text(v.to_string())
      })
      .unwrap_or(FieldValue::Null)
  }

  match field {
    | FilterField::Title => {
      FieldValue::Text(task.title.clone())
    }
    | FilterField::Notes => {
      opt_text(task.notes.as_ref())
    }
    | FilterField::Status => {
      FieldValue::Text(
        task.status.as_str().to_string()
      )
    }
    | FilterField::Priority => {
      task
        .priority
        .map(FieldValue::Rank)
        .unwrap_or(FieldValue::Null)
    }
    | FilterField::DueDate => {
      opt_text(task.due_date.map(|d| {
        d.format("%Y-%m-%d")
      }))
    }
    | FilterField::DueTime => {
      opt_text(task.due_time.map(|t| {
        t.format("%H:%M")
      }))
    }
    | FilterField::EstimatedMinutes => {
      task
        .estimated_minutes
        .map(|m| {
          FieldValue::Number(f64::from(m))
        })
        .unwrap_or(FieldValue::Null)
    }
    | FilterField::ActualMinutes => {
      FieldValue::Number(f64::from(
        task.actual_minutes
      ))
    }
    | FilterField::ListId => {
      opt_text(task.list_id)
    }
    | FilterField::ParentId => {
      opt_text(task.parent_id)
    }
    | FilterField::ProjectId => {
      opt_text(task.project_id)
    }
    | FilterField::AssigneeId => {
      opt_text(task.assignee_id)
    }
    | FilterField::Tags => {
      FieldValue::List(task.tags.clone())
    }
    | FilterField::CreatedAt => {
      FieldValue::Text(
        to_project_date(task.created_at)
          .format("%Y-%m-%d")
          .to_string()
      )
    }
    | FilterField::CompletedAt => {
      opt_text(task.completed_at.map(
        |at| {
          to_project_date(at)
            .format("%Y-%m-%d")
        }
      ))
    }
    | FilterField::Position => {
      FieldValue::Number(
        task.position as f64
      )
    }
  }
}

fn compare(
  left: &FieldValue,
  right: &FieldValue
) -> Option<Ordering> {
  match (left, right) {
    | (
      FieldValue::Text(a),
      FieldValue::Text(b)
    ) => Some(a.cmp(b)),
    | (
      FieldValue::Number(a),
      FieldValue::Number(b)
    ) => a.partial_cmp(b),
    | (
      FieldValue::Rank(a),
      FieldValue::Rank(b)
    ) => Some(a.cmp(b)),
    | _ => None
  }
}

fn values_equal(
  actual: &FieldValue,
  expected: &FieldValue
) -> bool {
  match (actual, expected) {
    | (FieldValue::Null, FieldValue::Null) => {
      true
    }
    | (FieldValue::List(items), other) => {
      let needle = other.to_string();
      items.iter().any(|item| {
        item.eq_ignore_ascii_case(&needle)
      })
    }
    | _ => {
      compare(actual, expected)
        == Some(Ordering::Equal)
    }
  }
}

fn is_null(value: &FieldValue) -> bool {
  match value {
    | FieldValue::Null => true,
    | FieldValue::List(items) => {
      items.is_empty()
    }
    | _ => false
  }
}

fn eval_clause(
  clause: &Clause,
  task: &Task
) -> bool {
  let actual =
    field_value(task, clause.field);

  let ok = match (
    clause.operator,
    &clause.operand
  ) {
    | (Operator::IsNull, _) => {
      is_null(&actual)
    }
    | (Operator::IsNotNull, _) => {
      !is_null(&actual)
    }
    | (Operator::Eq, Operand::One(expected)) => {
      values_equal(&actual, expected)
    }
    | (Operator::Neq, Operand::One(expected)) => {
      !values_equal(&actual, expected)
    }
    | (Operator::In, Operand::Many(options)) => {
      options.iter().any(|option| {
        values_equal(&actual, option)
      })
    }
    | (
      Operator::NotIn,
      Operand::Many(options)
    ) => {
      !options.iter().any(|option| {
        values_equal(&actual, option)
      })
    }
    | (
      Operator::Contains,
      Operand::One(expected)
    ) => {
      let needle = expected
        .to_string()
        .to_lowercase();
      match &actual {
        | FieldValue::Text(text) => {
          text
            .to_lowercase()
            .contains(&needle)
        }
        | FieldValue::List(items) => {
          items.iter().any(|item| {
            item.to_lowercase() == needle
          })
        }
        | _ => false
      }
    }
    | (op, Operand::One(expected)) => {
      match compare(&actual, expected) {
        | Some(ord) => {
          match op {
            | Operator::Gt => {
              ord == Ordering::Greater
            }
            | Operator::Gte => {
              ord != Ordering::Less
            }
            | Operator::Lt => {
              ord == Ordering::Less
            }
            | Operator::Lte => {
              ord != Ordering::Greater
            }
            | _ => false
          }
        }
        | None => false
      }
    }
    | _ => false
  };

  trace!(
    field = clause.field.column(),
    operator = ?clause.operator,
    task = %task.id,
    ok,
    "filter clause evaluation"
  );
  ok
}

/// Percent-encodes a scalar operand.
fn encode_value(value: &FieldValue) -> String {
  url::form_urlencoded::byte_serialize(
    value.to_string().as_bytes()
  )
  .collect()
}

/// List and array items are double-quoted
/// when they hold a PostgREST delimiter,
/// then percent-encoded.
fn encode_item(value: &FieldValue) -> String {
  let raw = value.to_string();
  let reserved = raw.chars().any(|c| {
    c.is_whitespace()
      || matches!(
        c,
        ',' | '.'
          | ':'
          | '('
          | ')'
          | '{'
          | '}'
          | '"'
          | '\\'
      )
  });
  let item = if reserved {
    format!(
      "\"{}\"",
      raw
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
    )
  } else {
    raw
  };
  url::form_urlencoded::byte_serialize(
    item.as_bytes()
  )
  .collect()
}

fn render_clause(clause: &Clause) -> String {
  let column = clause.field.column();
  let one = |operand: &Operand| match operand
  {
    | Operand::One(value) => {
      encode_value(value)
    }
    | _ => String::new()
  };
  let item = |operand: &Operand| match operand
  {
    | Operand::One(value) => {
      encode_item(value)
    }
    | _ => String::new()
  };
  let many = |operand: &Operand| match operand
  {
    | Operand::Many(values) => {
      values
        .iter()
        .map(encode_item)
        .collect::<Vec<_>>()
        .join(",")
    }
    | _ => String::new()
  };

  let expr = match clause.operator {
    | Operator::Eq
      if clause.field
        == FilterField::Tags =>
    {
      format!("cs.{{{}}}", item(&clause.operand))
    }
    | Operator::Eq => {
      format!("eq.{}", one(&clause.operand))
    }
    | Operator::Neq => {
      format!("neq.{}", one(&clause.operand))
    }
    | Operator::Gt => {
      format!("gt.{}", one(&clause.operand))
    }
    | Operator::Gte => {
      format!("gte.{}", one(&clause.operand))
    }
    | Operator::Lt => {
      format!("lt.{}", one(&clause.operand))
    }
    | Operator::Lte => {
      format!("lte.{}", one(&clause.operand))
    }
    | Operator::In => {
      format!("in.({})", many(&clause.operand))
    }
    | Operator::NotIn => {
      format!(
        "not.in.({})",
        many(&clause.operand)
      )
    }
    | Operator::IsNull => {
      "is.null".to_string()
    }
    | Operator::IsNotNull => {
      "not.is.null".to_string()
    }
    | Operator::Contains
      if clause.field
        == FilterField::Tags =>
    {
      format!("cs.{{{}}}", item(&clause.operand))
    }
    | Operator::Contains => {
      format!(
        "ilike.*{}*",
        one(&clause.operand)
      )
    }
  };

  format!("{column}={expr}")
}

#[tracing::instrument(skip(store, conditions, now))]
pub fn save_smart_filter(
  store: &DataStore,
  user_id: Uuid,
  name: &str,
  conditions: Vec<FilterCondition>,
  sort: Option<SortSpec>,
  now: DateTime<Utc>
) -> anyhow::Result<SmartFilter> {
  let name = name.trim();
  if name.is_empty() {
    return Err(anyhow!(
      "smart filter name is required"
    ));
  }
  if conditions.is_empty() {
    return Err(anyhow!(
      "smart filter needs at least \
       one condition"
    ));
  }

  store.update(
    |filters: &mut Vec<SmartFilter>| {
      let existing =
        filters.iter_mut().find(|f| {
          f.user_id == user_id
            && f.name
              .eq_ignore_ascii_case(name)
        });
      let saved = match existing {
        | Some(filter) => {
          filter.conditions = conditions;
          filter.sort = sort;
          filter.clone()
        }
        | None => {
          let filter = SmartFilter {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            icon: None,
            color: None,
            conditions,
            sort,
            created_at: now
          };
          filters.push(filter.clone());
          filter
        }
      };
      info!(filter = %saved.name, "saved smart filter");
      Ok(saved)
    }
  )
}

pub fn smart_filters_for_user(
  store: &DataStore,
  user_id: Uuid
) -> anyhow::Result<Vec<SmartFilter>> {
  let mut filters: Vec<SmartFilter> = store
    .load::<SmartFilter>()?
    .into_iter()
    .filter(|f| f.user_id == user_id)
    .collect();
  filters.sort_by(|a, b| {
    a.name
      .to_lowercase()
      .cmp(&b.name.to_lowercase())
  });
  Ok(filters)
}

pub fn find_smart_filter(
  store: &DataStore,
  user_id: Uuid,
  name: &str
) -> anyhow::Result<SmartFilter> {
  store
    .load::<SmartFilter>()?
    .into_iter()
    .find(|f| {
      f.user_id == user_id
        && f.name
          .eq_ignore_ascii_case(name.trim())
    })
    .ok_or_else(|| {
      anyhow!(
        "no smart filter named {name}"
      )
    })
}

pub fn delete_smart_filter(
  store: &DataStore,
  user_id: Uuid,
  name: &str
) -> anyhow::Result<()> {
  store.update(
    |filters: &mut Vec<SmartFilter>| {
      let before = filters.len();
      filters.retain(|f| {
        !(f.user_id == user_id
          && f.name.eq_ignore_ascii_case(
            name.trim()
          ))
      });
      if filters.len() == before {
        return Err(anyhow!(
          "no smart filter named {name}"
        ));
      }
      Ok(())
    }
  )
}

/// Loads a saved filter and runs it over the user's tasks.
#[tracing::instrument(skip(store, now))]
pub fn run_smart_filter(
  store: &DataStore,
  user_id: Uuid,
  name: &str,
  now: DateTime<Utc>,
  week_start: WeekStart
) -> anyhow::Result<Vec<Task>> {
  let filter =
    find_smart_filter(store, user_id, name)?;
  let query = build_query(
    &filter.conditions,
    filter.sort,
    to_project_date(now),
    week_start
  )?;
  let tasks: Vec<Task> = store
    .load::<Task>()?
    .into_iter()
    .filter(|task| task.user_id == user_id)
    .collect();

  let matched: Vec<Task> = query
    .run(&tasks)
    .into_iter()
    .cloned()
    .collect();
  debug!(
    filter = %filter.name,
    matched = matched.len(),
    "ran smart filter"
  );
  Ok(matched)
}

#[cfg(test)]
mod tests {
  use chrono::{
    NaiveDate,
    TimeZone,
    Utc
  };
  use serde_json::json;
  use uuid::Uuid;

  use super::{
    FieldValue,
    FilterCondition,
    FilterField,
    Operator,
    SortSpec,
    TaskQuery,
    build_query
  };
  use crate::datetime::{
    WeekStart,
    resolve_relative_date
  };
  use crate::task::{
    Priority,
    Task,
    TaskStatus
  };

  fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 18)
      .expect("valid date")
  }

  fn task(
    number: u64,
    title: &str
  ) -> Task {
    let now = Utc
      .with_ymd_and_hms(
        2026, 10, 18, 9, 0, 0
      )
      .single()
      .expect("valid now");
    Task::new_pending(
      Uuid::nil(),
      title.to_string(),
      now,
      number
    )
  }

  fn cond(
    field: FilterField,
    operator: Operator,
    value: serde_json::Value
  ) -> FilterCondition {
    FilterCondition {
      field,
      operator,
      value
    }
  }

  #[test]
  fn today_token_matches_direct_resolution()
  {
    let query = build_query(
      &[cond(
        FilterField::DueDate,
        Operator::Eq,
        json!("today")
      )],
      None,
      today(),
      WeekStart::Monday
    )
    .expect("build");

    let direct = resolve_relative_date(
      "today",
      today(),
      WeekStart::Monday
    )
    .expect("resolves")
    .format("%Y-%m-%d")
    .to_string();

    assert_eq!(
      query,
      TaskQuery::new().eq(
        FilterField::DueDate,
        FieldValue::Text(direct.clone())
      )
    );
    assert_eq!(
      query.to_query_string(),
      format!("due_date=eq.{direct}")
    );
  }

  #[test]
  fn conditions_are_anded_in_order() {
    let mut a = task(1, "Write report");
    a.priority = Some(Priority::Urgent);
    a.due_date = Some(today());
    let mut b = task(2, "Write tests");
    b.priority = Some(Priority::Low);
    b.due_date = Some(today());
    let mut c = task(3, "Call bank");
    c.priority = Some(Priority::High);

    let query = build_query(
      &[
        cond(
          FilterField::Priority,
          Operator::Gte,
          json!("high")
        ),
        cond(
          FilterField::DueDate,
          Operator::Lte,
          json!("end_of_week")
        )
      ],
      None,
      today(),
      WeekStart::Monday
    )
    .expect("build");

    let tasks = vec![a, b, c];
    let matched: Vec<u64> = query
      .run(&tasks)
      .iter()
      .map(|t| t.number)
      .collect();
    assert_eq!(matched, vec![1]);
  }

  #[test]
  fn null_handling_per_operator() {
    let mut dated = task(1, "dated");
    dated.due_date = Some(today());
    let undated = task(2, "undated");
    let tasks = vec![dated, undated];

    let run = |c: FilterCondition| {
      build_query(
        &[c],
        None,
        today(),
        WeekStart::Monday
      )
      .expect("build")
      .run(&tasks)
      .iter()
      .map(|t| t.number)
      .collect::<Vec<_>>()
    };

    assert_eq!(
      run(cond(
        FilterField::DueDate,
        Operator::IsNull,
        json!(null)
      )),
      vec![2]
    );
    assert_eq!(
      run(cond(
        FilterField::DueDate,
        Operator::Neq,
        json!("today")
      )),
      vec![2]
    );
    assert_eq!(
      run(cond(
        FilterField::DueDate,
        Operator::Lt,
        json!("tomorrow")
      )),
      vec![1]
    );
  }

  #[test]
  fn tags_and_text_contains() {
    let mut a = task(1, "Plan Offsite");
    a.tags = vec!["Work".to_string()];
    let b = task(2, "groceries");
    let tasks = vec![a, b];

    let by_tag = build_query(
      &[cond(
        FilterField::Tags,
        Operator::Contains,
        json!("work")
      )],
      None,
      today(),
      WeekStart::Monday
    )
    .expect("build");
    assert_eq!(by_tag.run(&tasks).len(), 1);
    assert_eq!(
      by_tag.to_query_string(),
      "tags=cs.{work}"
    );

    let by_title = build_query(
      &[cond(
        FilterField::Title,
        Operator::Contains,
        json!("offsite")
      )],
      None,
      today(),
      WeekStart::Monday
    )
    .expect("build");
    assert_eq!(
      by_title.run(&tasks)[0].number,
      1
    );
  }

  #[test]
  fn in_and_not_in_on_status() {
    let a = task(1, "a");
    let mut b = task(2, "b");
    b.status = TaskStatus::Completed;
    let mut c = task(3, "c");
    c.status = TaskStatus::Cancelled;
    let tasks = vec![a, b, c];

    let query = build_query(
      &[cond(
        FilterField::Status,
        Operator::NotIn,
        json!(["completed", "cancelled"])
      )],
      None,
      today(),
      WeekStart::Monday
    )
    .expect("build");
    assert_eq!(query.run(&tasks).len(), 1);
    assert_eq!(
      query.to_query_string(),
      "status=not.in.(completed,cancelled)"
    );
  }

  #[test]
  fn query_string_escapes_reserved_characters()
  {
    let contains = build_query(
      &[cond(
        FilterField::Title,
        Operator::Contains,
        json!("R&D plan")
      )],
      None,
      today(),
      WeekStart::Monday
    )
    .expect("build");
    assert_eq!(
      contains.to_query_string(),
      "title=ilike.*R%26D+plan*"
    );

    let listed = build_query(
      &[cond(
        FilterField::Title,
        Operator::In,
        json!(["a,b", "c)", "plain"])
      )],
      None,
      today(),
      WeekStart::Monday
    )
    .expect("build");
    assert_eq!(
      listed.to_query_string(),
      "title=in.(%22a%2Cb%22,%22c%29%22,plain)"
    );
  }

  #[test]
  fn sorts_with_nulls_last() {
    let mut a = task(1, "a");
    a.estimated_minutes = Some(30);
    let b = task(2, "b");
    let mut c = task(3, "c");
    c.estimated_minutes = Some(90);
    let tasks = vec![a, b, c];

    let query = build_query(
      &[],
      Some(SortSpec {
        field:     FilterField::EstimatedMinutes,
        ascending: false
      }),
      today(),
      WeekStart::Monday
    )
    .expect("build");
    let order: Vec<u64> = query
      .run(&tasks)
      .iter()
      .map(|t| t.number)
      .collect();
    assert_eq!(order, vec![3, 1, 2]);
  }

  #[test]
  fn rejects_bad_values_and_parses_cli_form() {
    let bad = build_query(
      &[cond(
        FilterField::Priority,
        Operator::Eq,
        json!("someday")
      )],
      None,
      today(),
      WeekStart::Monday
    );
    assert!(bad.is_err());

    let parsed: FilterCondition =
      "priority:in:high,urgent"
        .parse()
        .expect("parse");
    assert_eq!(
      parsed,
      cond(
        FilterField::Priority,
        Operator::In,
        json!(["high", "urgent"])
      )
    );
    assert!(
      "due_date:gt"
        .parse::<FilterCondition>()
        .is_err()
    );
    assert!(
      "nope:eq:1"
        .parse::<FilterCondition>()
        .is_err()
    );
  }
}
