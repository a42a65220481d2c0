//! User-visible outcomes, queued for whatever surface is showing them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::deferred::DeferredKey;
use crate::task::{StaffId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    UndoAvailable { key: DeferredKey, window: Duration },
    Undone { key: DeferredKey },
    Committed { key: DeferredKey },
    Claimed { task: TaskId },
    ClaimConflict { task: TaskId, claimant: Option<StaffId> },
    ClaimedGroup { group: String, claimed: usize, already_claimed: usize },
    Flagged { task: TaskId },
    Saved { task: TaskId },
    AppointmentBooked { task: TaskId },
    Failed { action: String, message: String },
}

impl Notice {
    pub fn failed(action: impl Into<String>, message: impl fmt::Display) -> Self {
        Notice::Failed {
            action: action.into(),
            message: message.to_string(),
        }
    }

    pub fn level(&self) -> NoticeLevel {
        match self {
            Notice::ClaimConflict { .. } => NoticeLevel::Warning,
            Notice::Failed { .. } => NoticeLevel::Error,
            _ => NoticeLevel::Info,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::UndoAvailable { key, window } => write!(
                f,
                "{} {} in {}s (undo available)",
                key.kind.verb(),
                key.task,
                window.as_secs()
            ),
            Notice::Undone { key } => write!(f, "undid {} for task {}", key.kind.noun(), key.task),
            Notice::Committed { key } => write!(f, "{} saved for task {}", key.kind.noun(), key.task),
            Notice::Claimed { task } => write!(f, "claimed task {task}"),
            Notice::ClaimConflict { task, claimant } => match claimant {
                Some(who) => write!(f, "task {task} was already claimed by {who}"),
                None => write!(f, "task {task} was already claimed by someone else"),
            },
            Notice::ClaimedGroup {
                group,
                claimed,
                already_claimed,
            } => write!(
                f,
                "{group}: claimed {claimed}, {already_claimed} already claimed by others"
            ),
            Notice::Flagged { task } => write!(f, "flagged task {task}"),
            Notice::Saved { task } => write!(f, "saved task {task}"),
            Notice::AppointmentBooked { task } => write!(f, "booked appraisal for task {task}"),
            Notice::Failed { action, message } => write!(f, "{action} failed: {message}"),
        }
    }
}

/// Shared notice queue.
#[derive(Debug, Clone, Default)]
pub struct Notices {
    queue: Arc<Mutex<Vec<Notice>>>,
}

impl Notices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notice: Notice) {
        self.queue.lock().push(notice);
    }

    pub fn drain(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn snapshot(&self) -> Vec<Notice> {
        self.queue.lock().clone()
    }
}
