use std::collections::HashSet;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::normalize;

/// Reason recorded for a flagged task that arrived without one.
pub const UNSPECIFIED_FLAG_REASON: &str = "No reason recorded";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaffId(String);

impl StaffId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StaffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StaffId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: StaffId,
    pub name: String,
}

/// Lifecycle status. Whether a task is claimed is read from its assignee,
/// never from this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Today,
    InProgress,
    Overdue,
    Flagged,
    Completed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Today,
        TaskStatus::InProgress,
        TaskStatus::Overdue,
        TaskStatus::Flagged,
        TaskStatus::Completed,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Today => "Today",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Overdue => "Overdue",
            TaskStatus::Flagged => "Flagged",
            TaskStatus::Completed => "Completed",
        }
    }

    /// Lenient parse through the status normalizer.
    pub fn parse(raw: &str) -> Option<Self> {
        normalize::lookup_status(raw)
    }

    /// Bucket a task with this status is filed under. Completed tasks are
    /// not held by the store.
    pub fn bucket(self) -> Option<Bucket> {
        match self {
            TaskStatus::Today | TaskStatus::InProgress => Some(Bucket::Upcoming),
            TaskStatus::Overdue => Some(Bucket::Overdue),
            TaskStatus::Flagged => Some(Bucket::Flagged),
            TaskStatus::Completed => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Declared lowest to highest so that `Ord` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

impl Priority {
    pub fn label(self) -> &'static str {
        match self {
            Priority::VeryLow => "Very Low",
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
            Priority::VeryHigh => "Very High",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        normalize::lookup_priority(raw)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    Upcoming,
    Overdue,
    Flagged,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Upcoming, Bucket::Overdue, Bucket::Flagged];

    pub fn label(self) -> &'static str {
        match self {
            Bucket::Upcoming => "upcoming",
            Bucket::Overdue => "overdue",
            Bucket::Flagged => "flagged",
        }
    }

    /// Status assumed for a task the server filed here with a status label
    /// nothing recognizes.
    fn fallback_status(self) -> TaskStatus {
        match self {
            Bucket::Upcoming => TaskStatus::Today,
            Bucket::Overdue => TaskStatus::Overdue,
            Bucket::Flagged => TaskStatus::Flagged,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How the dashboard opens a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Detail,
    MonthlyReview,
    Appraisal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assignee: Option<StaffId>,
    pub priority: Priority,
    pub flagged_reason: Option<String>,
    pub resolution_note: Option<String>,
    pub applicant_id: Option<String>,
    pub group_key: Option<String>,
    /// Canonical `YYYY-MM-DD`, or the raw text when it could not be parsed.
    pub due_date: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: TaskId::new(id),
            title: title.into(),
            description: String::new(),
            status,
            assignee: None,
            priority: Priority::default(),
            flagged_reason: None,
            resolution_note: None,
            applicant_id: None,
            group_key: None,
            due_date: None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.assignee.is_some()
    }

    pub fn is_global(&self) -> bool {
        !self.is_claimed()
    }

    pub fn is_assigned_to(&self, staff: &StaffId) -> bool {
        self.assignee.as_ref() == Some(staff)
    }

    pub fn bucket(&self) -> Option<Bucket> {
        self.status.bucket()
    }

    pub fn due_on(&self) -> Option<NaiveDate> {
        self.due_date
            .as_deref()
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
    }

    pub fn open_mode(&self) -> OpenMode {
        if self.applicant_id.is_none() {
            return OpenMode::Detail;
        }
        if self.title.to_ascii_lowercase().contains("appraisal") {
            OpenMode::Appraisal
        } else {
            OpenMode::MonthlyReview
        }
    }
}

/// Form-bound shape of a task: every field is the text the user typed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDraft {
    pub title: String,
    pub description: String,
    pub flagged_reason: String,
    pub priority: String,
    pub status: String,
    pub due_date: String,
    pub assignee: String,
}

impl TaskDraft {
    pub fn from_task(task: &Task) -> Self {
        Self {
            title: task.title.clone(),
            description: task.description.clone(),
            flagged_reason: task.flagged_reason.clone().unwrap_or_default(),
            priority: task.priority.label().to_string(),
            status: task.status.label().to_string(),
            due_date: task.due_date.clone().unwrap_or_default(),
            assignee: task
                .assignee
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default(),
        }
    }
}

/// The three collections a task listing is grouped into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskBuckets {
    pub upcoming: Vec<Task>,
    pub overdue: Vec<Task>,
    pub flagged: Vec<Task>,
}

impl TaskBuckets {
    pub fn get(&self, bucket: Bucket) -> &[Task] {
        match bucket {
            Bucket::Upcoming => &self.upcoming,
            Bucket::Overdue => &self.overdue,
            Bucket::Flagged => &self.flagged,
        }
    }

    pub fn get_mut(&mut self, bucket: Bucket) -> &mut Vec<Task> {
        match bucket {
            Bucket::Upcoming => &mut self.upcoming,
            Bucket::Overdue => &mut self.overdue,
            Bucket::Flagged => &mut self.flagged,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Bucket, &Task)> {
        Bucket::ALL
            .into_iter()
            .flat_map(move |bucket| self.get(bucket).iter().map(move |task| (bucket, task)))
    }

    pub fn len(&self) -> usize {
        self.upcoming.len() + self.overdue.len() + self.flagged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Task as it arrives from the fetch collaborator, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTask {
    #[serde(deserialize_with = "opaque_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub flagged_reason: Option<String>,
    #[serde(default)]
    pub resolution_note: Option<String>,
    #[serde(default, deserialize_with = "opaque_optional_id")]
    pub applicant_id: Option<String>,
    #[serde(default)]
    pub group_key: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
}

impl RawTask {
    /// Validates the wire shape once, using the bucket the server filed the
    /// task under when its status label is not recognized.
    pub fn into_task(self, filed_under: Bucket) -> Task {
        let status = match self.status.as_deref().map(TaskStatus::parse) {
            Some(Some(status)) => status,
            other => {
                if other.is_some() {
                    warn!(
                        task = %self.id,
                        status = ?self.status,
                        bucket = %filed_under,
                        "unrecognized task status; using bucket default"
                    );
                }
                filed_under.fallback_status()
            }
        };

        let priority = self
            .priority
            .as_deref()
            .and_then(Priority::parse)
            .unwrap_or_default();

        let mut flagged_reason = non_empty(self.flagged_reason);
        if status == TaskStatus::Flagged && flagged_reason.is_none() {
            warn!(task = %self.id, "flagged task arrived without a reason");
            flagged_reason = Some(UNSPECIFIED_FLAG_REASON.to_string());
        }

        let due_date = non_empty(self.due_date.map(|raw| normalize::normalize_due_date(&raw)));

        Task {
            id: TaskId::new(self.id.trim()),
            title: self.title.trim().to_string(),
            description: self.description.unwrap_or_default(),
            status,
            assignee: non_empty(self.assignee).map(StaffId::new),
            priority,
            flagged_reason,
            resolution_note: non_empty(self.resolution_note),
            applicant_id: non_empty(self.applicant_id),
            group_key: non_empty(self.group_key),
            due_date,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBuckets {
    #[serde(default)]
    pub upcoming: Vec<RawTask>,
    #[serde(default)]
    pub overdue: Vec<RawTask>,
    #[serde(default)]
    pub flagged: Vec<RawTask>,
}

impl RawBuckets {
    /// Files each task by its own status. The server's grouping only
    /// decides the status of tasks with an unrecognized label; completed
    /// tasks are dropped and a repeated id keeps its first occurrence.
    pub fn into_buckets(self) -> TaskBuckets {
        let mut buckets = TaskBuckets::default();
        let mut seen = HashSet::new();
        let listed = [
            (Bucket::Upcoming, self.upcoming),
            (Bucket::Overdue, self.overdue),
            (Bucket::Flagged, self.flagged),
        ];
        for (filed_under, tasks) in listed {
            for raw in tasks {
                let task = raw.into_task(filed_under);
                if !seen.insert(task.id.clone()) {
                    warn!(task = %task.id, bucket = %filed_under, "task listed twice; keeping first");
                    continue;
                }
                let Some(bucket) = task.bucket() else {
                    debug!(task = %task.id, "dropping completed task from fetch");
                    continue;
                };
                if bucket != filed_under {
                    debug!(task = %task.id, from = %filed_under, to = %bucket, "refiling task by status");
                }
                buckets.get_mut(bucket).push(task);
            }
        }
        buckets
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn opaque_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

fn opaque_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applicant_tasks_open_in_specialized_modes() {
        let mut task = Task::new("1", "Send welcome pack", TaskStatus::Today);
        assert_eq!(task.open_mode(), OpenMode::Detail);

        task.applicant_id = Some("42".to_string());
        assert_eq!(task.open_mode(), OpenMode::MonthlyReview);

        task.title = "Schedule 3-month Appraisal".to_string();
        assert_eq!(task.open_mode(), OpenMode::Appraisal);
    }

    #[test]
    fn raw_task_accepts_numeric_ids_and_normalizes_fields() {
        let raw: RawTask = serde_json::from_str(
            r#"{"id": 17, "title": " Badge photo ", "status": "in-progress",
                "assignee": "", "priority": "very high", "applicantId": 42,
                "dueDate": "06/10/2024"}"#,
        )
        .expect("parse raw task");

        let task = raw.into_task(Bucket::Upcoming);
        assert_eq!(task.id.as_str(), "17");
        assert_eq!(task.title, "Badge photo");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assignee, None);
        assert_eq!(task.priority, Priority::VeryHigh);
        assert_eq!(task.applicant_id.as_deref(), Some("42"));
        assert_eq!(task.due_date.as_deref(), Some("2024-06-10"));
    }

    #[test]
    fn unknown_status_falls_back_to_bucket_and_flags_get_a_reason() {
        let raw = RawTask {
            id: "9".to_string(),
            status: Some("escalated".to_string()),
            ..RawTask::default()
        };
        let task = raw.into_task(Bucket::Flagged);
        assert_eq!(task.status, TaskStatus::Flagged);
        assert_eq!(task.flagged_reason.as_deref(), Some(UNSPECIFIED_FLAG_REASON));
    }

    #[test]
    fn fetched_tasks_are_filed_by_status_once() {
        let raw: RawBuckets = serde_json::from_str(
            r#"{"upcoming": [{"id": 1, "status": "Overdue"}, {"id": 2, "status": "Completed"},
                             {"id": 3, "status": "Today"}],
                "overdue": [{"id": 1, "status": "Overdue"}, {"id": 4, "status": "escalated"}]}"#,
        )
        .expect("parse raw buckets");

        let buckets = raw.into_buckets();
        let ids = |bucket: Bucket| -> Vec<&str> {
            buckets.get(bucket).iter().map(|task| task.id.as_str()).collect()
        };
        assert_eq!(ids(Bucket::Upcoming), vec!["3"]);
        assert_eq!(ids(Bucket::Overdue), vec!["1", "4"]);
        assert!(ids(Bucket::Flagged).is_empty());
        assert_eq!(buckets.len(), 3);
        for (bucket, task) in buckets.iter() {
            assert_eq!(task.bucket(), Some(bucket));
        }
    }

    #[test]
    fn priority_orders_very_high_first_when_sorted_descending() {
        let mut priorities = vec![Priority::Low, Priority::VeryHigh, Priority::Medium];
        priorities.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            priorities,
            vec![Priority::VeryHigh, Priority::Medium, Priority::Low]
        );
    }
}
