use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use chrono::NaiveDate;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::task::{Priority, Task, TaskList, TaskStatus};

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self { color })
    }

    #[tracing::instrument(skip(self, tasks, lists, today))]
    pub fn print_task_table(
        &mut self,
        tasks: &[Task],
        lists: &[TaskList],
        today: NaiveDate,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        if tasks.is_empty() {
            writeln!(out, "No tasks.")?;
            return Ok(());
        }

        let headers = ["#", "Due", "Pri", "List", "Title", "Tags"];
        let mut rows = Vec::with_capacity(tasks.len());

        for task in tasks {
            let mut due = task
                .due_date
                .map(|date| date.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            if let Some(time) = task.due_time {
                due.push_str(&time.format(" %H:%M").to_string());
            }
            let due = if task.is_overdue(today) {
                self.paint(&due, "31")
            } else if task.is_due_on(today) {
                self.paint(&due, "33")
            } else {
                due
            };

            let priority = match task.priority {
                Some(Priority::Urgent) => self.paint("urgent", "1;31"),
                Some(p) => p.as_str().to_string(),
                None => String::new(),
            };

            let mut title = if task.parent_id.is_some() {
                format!("  - {}", task.title)
            } else {
                task.title.clone()
            };
            if task.status == TaskStatus::InProgress {
                title = self.paint(&title, "36");
            } else if !task.is_open() {
                title = self.paint(&title, "2");
            }

            let tags = task
                .tags
                .iter()
                .map(|tag| format!("#{tag}"))
                .collect::<Vec<_>>()
                .join(" ");

            rows.push(vec![
                self.paint(&task.number.to_string(), "33"),
                due,
                priority,
                list_name(lists, task),
                title,
                tags,
            ]);
        }

        write_table(&mut out, &headers, rows)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, task, lists, subtasks))]
    pub fn print_task_info(
        &mut self,
        task: &Task,
        lists: &[TaskList],
        subtasks: &[Task],
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        writeln!(out, "number     {}", task.number)?;
        writeln!(out, "id         {}", task.id)?;
        writeln!(out, "title      {}", task.title)?;
        writeln!(out, "status     {}", task.status)?;
        writeln!(
            out,
            "priority   {}",
            task.priority.map(Priority::as_str).unwrap_or("-")
        )?;
        writeln!(out, "list       {}", list_name(lists, task))?;
        if let Some(due) = task.due_date {
            match task.due_time {
                Some(time) => writeln!(out, "due        {} {}", due, time.format("%H:%M"))?,
                None => writeln!(out, "due        {due}")?,
            }
        }
        if let Some(estimate) = task.estimated_minutes {
            writeln!(out, "estimate   {estimate}m")?;
        }
        if task.actual_minutes > 0 {
            writeln!(out, "focused    {}m", task.actual_minutes)?;
        }
        if !task.tags.is_empty() {
            writeln!(out, "tags       {}", task.tags.join(", "))?;
        }
        writeln!(out, "created    {}", task.created_at.format("%Y-%m-%dT%H:%M:%SZ"))?;
        writeln!(out, "updated    {}", task.updated_at.format("%Y-%m-%dT%H:%M:%SZ"))?;
        if let Some(done) = task.completed_at {
            writeln!(out, "completed  {}", done.format("%Y-%m-%dT%H:%M:%SZ"))?;
        }
        if let Some(notes) = task.notes.as_deref() {
            writeln!(out)?;
            for line in notes.lines() {
                writeln!(out, "  {line}")?;
            }
        }
        if !subtasks.is_empty() {
            writeln!(out)?;
            writeln!(out, "subtasks")?;
            for sub in subtasks {
                let mark = if sub.is_open() { " " } else { "x" };
                writeln!(out, "  [{mark}] {} {}", sub.number, sub.title)?;
            }
        }

        Ok(())
    }

    /// Any other listing: habits, goals, keys, members.
    pub fn print_table(&mut self, headers: &[&str], rows: Vec<Vec<String>>) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        if rows.is_empty() {
            writeln!(out, "Nothing to show.")?;
            return Ok(());
        }
        write_table(&mut out, headers, rows)
    }

    pub fn print_json(&mut self, value: &serde_json::Value) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    pub fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || text.is_empty() || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn list_name(lists: &[TaskList], task: &Task) -> String {
    task.list_id
        .and_then(|id| lists.iter().find(|l| l.id == id))
        .map(|l| l.name.clone())
        .unwrap_or_default()
}

fn write_table<W: Write>(
    mut writer: W,
    headers: &[&str],
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(*header));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for width in &widths {
        write!(writer, "{:-<width$} ", "", width = *width)?;
    }
    writeln!(writer)?;

    for row in rows {
        for (idx, width) in widths.iter().enumerate() {
            let cell = row.get(idx).map(String::as_str).unwrap_or_default();
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = width.saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::{strip_ansi, write_table};

    #[test]
    fn columns_align_on_visible_width() {
        let mut buf = Vec::new();
        write_table(
            &mut buf,
            &["#", "Title"],
            vec![
                vec!["\x1b[33m1\x1b[0m".to_string(), "Café".to_string()],
                vec!["12".to_string(), "x".to_string()],
            ],
        )
        .expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "#  Title ");
        assert_eq!(lines[1], "-- ----- ");
        assert_eq!(strip_ansi(lines[2]), "1  Café  ");
        assert_eq!(lines[3], "12 x     ");
    }
}
