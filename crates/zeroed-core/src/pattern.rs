use std::sync::OnceLock;

use anyhow::anyhow;
use regex::Regex;

/// Compiles `pattern` once and hands out the cached instance afterwards.
pub(crate) fn cached_regex(
  cell: &'static OnceLock<Regex>,
  pattern: &str
) -> anyhow::Result<&'static Regex> {
  if let Some(re) = cell.get() {
    return Ok(re);
  }

  let re =
    Regex::new(pattern).map_err(|e| {
      anyhow!(
        "internal regex compile \
         failure: {e}"
      )
    })?;
  Ok(cell.get_or_init(|| re))
}

/// Compiles a fixed set of patterns once, in order.
pub(crate) fn cached_regex_set(
  cell: &'static OnceLock<Vec<Regex>>,
  patterns: &[&str]
) -> anyhow::Result<&'static [Regex]> {
  if let Some(set) = cell.get() {
    return Ok(set.as_slice());
  }

  let mut compiled =
    Vec::with_capacity(patterns.len());
  for pattern in patterns {
    compiled.push(
      Regex::new(pattern).map_err(
        |e| {
          anyhow!(
            "internal regex compile \
             failure for {pattern}: {e}"
          )
        }
      )?
    );
  }
  Ok(
    cell
      .get_or_init(|| compiled)
      .as_slice()
  )
}

/// Collapses runs of whitespace into single spaces and trims the result.
pub(crate) fn collapse_whitespace(
  text: &str
) -> String {
  text
    .split_whitespace()
    .collect::<Vec<_>>()
    .join(" ")
}

#[cfg(test)]
mod tests {
  use std::sync::OnceLock;

  use regex::Regex;

  use super::{
    cached_regex,
    collapse_whitespace
  };

  #[test]
  fn caches_compiled_pattern() {
    static RE: OnceLock<Regex> =
      OnceLock::new();
    let first =
      cached_regex(&RE, r"^\d+$")
        .expect("compile");
    let second =
      cached_regex(&RE, r"ignored")
        .expect("cached");
    assert!(std::ptr::eq(first, second));
    assert!(second.is_match("42"));
  }

  #[test]
  fn collapses_inner_whitespace() {
    assert_eq!(
      collapse_whitespace(
        "  Call   dentist \t now "
      ),
      "Call dentist now"
    );
  }
}
