use std::io::{self, IsTerminal, Write};

use chrono::NaiveDate;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::normalize::StaffDirectory;
use crate::notice::{Notice, NoticeLevel};
use crate::store::TaskStore;
use crate::task::{Bucket, OpenMode, Task};

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> Self {
        Self {
            color: cfg.color() && io::stdout().is_terminal(),
        }
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    /// Prints each bucket as its own table, highest priority first.
    #[tracing::instrument(skip_all)]
    pub fn print_buckets<'a, F>(
        &self,
        store: &'a TaskStore,
        staff: &StaffDirectory,
        today: NaiveDate,
        keep: F,
    ) -> anyhow::Result<()>
    where
        F: Fn(&'a Task) -> bool,
    {
        let mut out = io::stdout().lock();
        for bucket in Bucket::ALL {
            let tasks: Vec<&Task> = store
                .sorted_bucket(bucket)
                .into_iter()
                .filter(|task| keep(task))
                .collect();
            self.write_bucket(&mut out, bucket, &tasks, staff, today)?;
        }
        Ok(())
    }

    fn write_bucket<W: Write>(
        &self,
        mut out: W,
        bucket: Bucket,
        tasks: &[&Task],
        staff: &StaffDirectory,
        today: NaiveDate,
    ) -> anyhow::Result<()> {
        writeln!(out, "{} ({})", self.paint(bucket.label(), "1"), tasks.len())?;
        if tasks.is_empty() {
            writeln!(out)?;
            return Ok(());
        }

        let headers = ["ID", "Priority", "Due", "Assignee", "Title", "Note"]
            .map(String::from)
            .to_vec();

        let rows = tasks
            .iter()
            .map(|task| {
                let due = task.due_date.clone().unwrap_or_default();
                let due = match task.due_on() {
                    Some(date) if date < today => self.paint(&due, "31"),
                    _ => due,
                };
                let assignee = match &task.assignee {
                    Some(id) => staff.display_name(id).unwrap_or(id.as_str()).to_string(),
                    None => self.paint("unclaimed", "36"),
                };
                let note = task
                    .flagged_reason
                    .clone()
                    .or_else(|| task.group_key.as_ref().map(|group| format!("group {group}")))
                    .unwrap_or_default();
                vec![
                    self.paint(task.id.as_str(), "33"),
                    task.priority.label().to_string(),
                    due,
                    assignee,
                    task.title.clone(),
                    note,
                ]
            })
            .collect();

        write_table(&mut out, headers, rows)?;
        writeln!(out)?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(task = %task.id))]
    pub fn print_task(&self, task: &Task, staff: &StaffDirectory) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        writeln!(out, "id        {}", task.id)?;
        writeln!(out, "title     {}", task.title)?;
        writeln!(out, "status    {}", task.status)?;
        writeln!(out, "priority  {}", task.priority)?;
        let assignee = task
            .assignee
            .as_ref()
            .map(|id| staff.display_name(id).unwrap_or(id.as_str()).to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(out, "assignee  {assignee}")?;
        if let Some(due) = &task.due_date {
            writeln!(out, "due       {due}")?;
        }
        if !task.description.is_empty() {
            writeln!(out, "desc      {}", task.description)?;
        }
        if let Some(reason) = &task.flagged_reason {
            writeln!(out, "flagged   {reason}")?;
        }
        if let Some(note) = &task.resolution_note {
            writeln!(out, "resolved  {note}")?;
        }
        let opens = match task.open_mode() {
            OpenMode::Detail => "detail view",
            OpenMode::MonthlyReview => "monthly review roster",
            OpenMode::Appraisal => "appraisal scheduler",
        };
        writeln!(out, "opens in  {opens}")?;
        Ok(())
    }

    pub fn print_notices(&self, notices: &[Notice]) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        for notice in notices {
            let line = notice.to_string();
            let line = match notice.level() {
                NoticeLevel::Error => self.paint(&line, "31"),
                NoticeLevel::Warning => self.paint(&line, "33"),
                _ => line,
            };
            writeln!(out, "{line}")?;
        }
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.width()).collect();

    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(strip_ansi(cell).width());
        }
    }

    let pad = |writer: &mut W, cell: &str, width: usize| -> io::Result<()> {
        let padding = width.saturating_sub(strip_ansi(cell).width());
        write!(writer, "{}{} ", cell, " ".repeat(padding))
    };

    for (header, width) in headers.iter().zip(&widths) {
        pad(&mut writer, header, *width)?;
    }
    writeln!(writer)?;

    for width in &widths {
        write!(writer, "{:-<width$} ", "", width = *width)?;
    }
    writeln!(writer)?;

    for row in rows {
        for (cell, width) in row.iter().zip(&widths) {
            pad(&mut writer, cell, *width)?;
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
    use super::*;
    use crate::task::{StaffId, StaffMember, TaskStatus};

    #[test]
    fn table_pads_by_display_width() {
        let mut buf = Vec::new();
        write_table(
            &mut buf,
            vec!["ID".into(), "Title".into()],
            vec![
                vec!["T1".into(), "Café visit".into()],
                vec!["\x1b[33mT22\x1b[0m".into(), "面接".into()],
            ],
        )
        .expect("write table");
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ID  Title      ");
        assert_eq!(lines[1], "--- ---------- ");
        assert_eq!(strip_ansi(lines[3]), "T22 面接       ");
    }

    #[test]
    fn bucket_table_names_assignees_and_overdue_dates() {
        let staff = StaffDirectory::new(vec![StaffMember {
            id: StaffId::new("s-1"),
            name: "Ana".into(),
        }]);
        let mut task = Task::new("T1", "Call applicant", TaskStatus::Overdue);
        task.assignee = Some(StaffId::new("s-1"));
        task.due_date = Some("2024-06-01".into());
        let today = NaiveDate::from_ymd_opt(2024, 6, 10).expect("date");

        let mut buf = Vec::new();
        Renderer::plain()
            .write_bucket(&mut buf, Bucket::Overdue, &[&task], &staff, today)
            .expect("write bucket");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.starts_with("overdue (1)"));
        assert!(text.contains("Ana"));
        assert!(text.contains("2024-06-01"));
    }
}
