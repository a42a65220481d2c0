//! Best-effort normalization of task fields for comparison.
//!
//! Every function here is total: input that cannot be interpreted is handed
//! back unchanged rather than rejected, so a save can never silently drop
//! what the user typed.

use serde::Serialize;
use tracing::debug;

use crate::datetime::parse_input_date;
use crate::task::{Priority, StaffId, StaffMember, Task, TaskDraft, TaskStatus};

/// Lookup table of staff used to resolve assignees typed by display name.
#[derive(Debug, Clone, Default)]
pub struct StaffDirectory {
    members: Vec<StaffMember>,
}

impl StaffDirectory {
    pub fn new(members: Vec<StaffMember>) -> Self {
        Self { members }
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.members.iter().any(|m| m.id.as_str() == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&StaffMember> {
        let wanted = name.trim();
        self.members
            .iter()
            .find(|m| m.name.trim().eq_ignore_ascii_case(wanted))
    }

    pub fn display_name(&self, id: &StaffId) -> Option<&str> {
        self.members
            .iter()
            .find(|m| &m.id == id)
            .map(|m| m.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

fn squash(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

pub(crate) fn lookup_status(raw: &str) -> Option<TaskStatus> {
    match squash(raw).as_str() {
        "today" | "todo" | "open" | "unclaimed" | "pending" => Some(TaskStatus::Today),
        "inprogress" | "progress" | "started" | "claimed" => Some(TaskStatus::InProgress),
        "overdue" | "late" | "pastdue" => Some(TaskStatus::Overdue),
        "flagged" | "flag" => Some(TaskStatus::Flagged),
        "completed" | "complete" | "done" => Some(TaskStatus::Completed),
        _ => None,
    }
}

pub(crate) fn lookup_priority(raw: &str) -> Option<Priority> {
    match squash(raw).as_str() {
        "veryhigh" | "urgent" | "critical" => Some(Priority::VeryHigh),
        "high" => Some(Priority::High),
        "medium" | "normal" => Some(Priority::Medium),
        "low" => Some(Priority::Low),
        "verylow" => Some(Priority::VeryLow),
        _ => None,
    }
}

/// Canonical status label, or `raw` trimmed when it maps to no status.
pub fn normalize_status(raw: &str) -> String {
    match lookup_status(raw) {
        Some(status) => status.label().to_string(),
        None => raw.trim().to_string(),
    }
}

pub fn normalize_priority(raw: &str) -> String {
    match lookup_priority(raw) {
        Some(priority) => priority.label().to_string(),
        None => raw.trim().to_string(),
    }
}

/// Stable staff id for an assignee typed as either an id or a display name.
/// Anything the directory does not know is kept as an external identifier.
pub fn normalize_assignee(raw: &str, staff: &StaffDirectory) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || staff.contains_id(trimmed) {
        return trimmed.to_string();
    }
    match staff.find_by_name(trimmed) {
        Some(member) => member.id.as_str().to_string(),
        None => raw.to_string(),
    }
}

/// `YYYY-MM-DD` for any supported date input, `""` for blank input, and the
/// original text when it cannot be parsed.
pub fn normalize_due_date(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    match parse_input_date(trimmed) {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => {
            debug!(input = %raw, "unparsable due date; keeping input as-is");
            raw.to_string()
        }
    }
}

/// The field set a dirty-check compares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedFields {
    pub title: String,
    pub description: String,
    pub flagged_reason: String,
    pub priority: String,
    pub status: String,
    pub due_date: String,
    pub assignee: String,
}

impl TrackedFields {
    pub fn normalized(&self, staff: &StaffDirectory) -> Self {
        Self {
            title: self.title.trim().to_string(),
            description: self.description.trim().to_string(),
            flagged_reason: self.flagged_reason.trim().to_string(),
            priority: normalize_priority(&self.priority).trim().to_string(),
            status: normalize_status(&self.status).trim().to_string(),
            due_date: normalize_due_date(&self.due_date).trim().to_string(),
            assignee: normalize_assignee(&self.assignee, staff).trim().to_string(),
        }
    }

    /// Names of the fields that differ, compared as-is.
    pub fn diff(&self, other: &Self) -> Vec<&'static str> {
        let pairs = [
            ("title", &self.title, &other.title),
            ("description", &self.description, &other.description),
            ("flaggedReason", &self.flagged_reason, &other.flagged_reason),
            ("priority", &self.priority, &other.priority),
            ("status", &self.status, &other.status),
            ("dueDate", &self.due_date, &other.due_date),
            ("assignee", &self.assignee, &other.assignee),
        ];
        pairs
            .into_iter()
            .filter(|(_, a, b)| a != b)
            .map(|(name, _, _)| name)
            .collect()
    }
}

/// Either shape of a task that can take part in a dirty-check.
pub trait Tracked {
    fn tracked_fields(&self) -> TrackedFields;
}

impl Tracked for Task {
    fn tracked_fields(&self) -> TrackedFields {
        TrackedFields {
            title: self.title.clone(),
            description: self.description.clone(),
            flagged_reason: self.flagged_reason.clone().unwrap_or_default(),
            priority: self.priority.label().to_string(),
            status: self.status.label().to_string(),
            due_date: self.due_date.clone().unwrap_or_default(),
            assignee: self
                .assignee
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default(),
        }
    }
}

impl Tracked for TaskDraft {
    fn tracked_fields(&self) -> TrackedFields {
        TrackedFields {
            title: self.title.clone(),
            description: self.description.clone(),
            flagged_reason: self.flagged_reason.clone(),
            priority: self.priority.clone(),
            status: self.status.clone(),
            due_date: self.due_date.clone(),
            assignee: self.assignee.clone(),
        }
    }
}

/// Tracked fields that differ once both sides are normalized.
pub fn changed_fields<A, B>(a: &A, b: &B, staff: &StaffDirectory) -> Vec<&'static str>
where
    A: Tracked + ?Sized,
    B: Tracked + ?Sized,
{
    let left = a.tracked_fields().normalized(staff);
    let right = b.tracked_fields().normalized(staff);
    left.diff(&right)
}

/// `true` when no tracked field differs. Gates the save action; it is not a
/// deep equality check.
pub fn tasks_equal<A, B>(a: &A, b: &B, staff: &StaffDirectory) -> bool
where
    A: Tracked + ?Sized,
    B: Tracked + ?Sized,
{
    changed_fields(a, b, staff).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaffDirectory {
        StaffDirectory::new(vec![
            StaffMember {
                id: StaffId::new("s-1"),
                name: "Ada Byron".to_string(),
            },
            StaffMember {
                id: StaffId::new("s-2"),
                name: "Grace Hopper".to_string(),
            },
        ])
    }

    #[test]
    fn status_variants_share_one_label() {
        for raw in ["today", " Today ", "TODAY"] {
            assert_eq!(normalize_status(raw), "Today");
        }
        for raw in ["in-progress", "In Progress", "in_progress", "INPROGRESS"] {
            assert_eq!(normalize_status(raw), "In Progress");
        }
        assert_eq!(normalize_status(" Overdue"), "Overdue");
        assert_eq!(normalize_status("On Hold"), "On Hold");
    }

    #[test]
    fn assignee_resolves_ids_names_and_unknowns() {
        let staff = directory();
        assert_eq!(normalize_assignee("s-2", &staff), "s-2");
        assert_eq!(normalize_assignee("grace hopper", &staff), "s-2");
        assert_eq!(normalize_assignee("ext-991", &staff), "ext-991");
        assert_eq!(normalize_assignee("  ", &staff), "");
    }

    #[test]
    fn due_dates_are_canonicalized_or_passed_through() {
        assert_eq!(normalize_due_date("2024-06-10"), "2024-06-10");
        assert_eq!(normalize_due_date("06/10/2024"), "2024-06-10");
        assert_eq!(normalize_due_date("2024-06-10T09:30:00Z"), "2024-06-10");
        assert_eq!(normalize_due_date(""), "");
        assert_eq!(normalize_due_date("next sprint"), "next sprint");
    }

    #[test]
    fn tasks_equal_is_reflexive() {
        let staff = directory();
        let mut task = Task::new("7", "Order laptop", TaskStatus::InProgress);
        task.assignee = Some(StaffId::new("s-1"));
        task.due_date = Some("2024-06-10".to_string());
        assert!(tasks_equal(&task, &task, &staff));
    }

    #[test]
    fn single_priority_change_is_detected() {
        let staff = directory();
        let task = Task::new("7", "Order laptop", TaskStatus::Today);
        let mut draft = TaskDraft::from_task(&task);
        assert!(tasks_equal(&task, &draft, &staff));

        draft.priority = "High".to_string();
        assert!(!tasks_equal(&task, &draft, &staff));
        assert_eq!(changed_fields(&task, &draft, &staff), vec!["priority"]);
    }

    #[test]
    fn form_spellings_of_the_same_values_are_not_dirty() {
        let staff = directory();
        let mut task = Task::new("7", "Order laptop", TaskStatus::InProgress);
        task.assignee = Some(StaffId::new("s-1"));
        task.due_date = Some("2024-06-10".to_string());

        let draft = TaskDraft {
            title: "Order laptop  ".to_string(),
            description: String::new(),
            flagged_reason: String::new(),
            priority: "medium".to_string(),
            status: "in-progress".to_string(),
            due_date: "06/10/2024".to_string(),
            assignee: "Ada Byron".to_string(),
        };
        assert!(tasks_equal(&task, &draft, &staff));
    }
}
