//! Task lifecycle: the one place UI intents turn into store mutations and
//! backend calls.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::api::{ApiError, PatchAction, PatchPayload, StaffApi, TaskBackend};
use crate::claim::{ClaimAllOutcome, ClaimCoordinator, ClaimOutcome};
use crate::deferred::{ActionKind, DeferredKey, DeferredScheduler, Scheduled};
use crate::normalize::{StaffDirectory, Tracked, changed_fields};
use crate::notice::{Notice, Notices};
use crate::store::{SharedStore, TaskStore, resync};
use crate::task::{Task, TaskDraft, TaskId, TaskStatus};

/// Undo windows per deferred action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredDelays {
    pub complete: Duration,
    pub unclaim: Duration,
    pub resolve: Duration,
    pub resolve_and_complete: Duration,
}

impl Default for DeferredDelays {
    fn default() -> Self {
        Self {
            complete: Duration::from_millis(5000),
            unclaim: Duration::from_millis(4000),
            resolve: Duration::from_millis(5000),
            resolve_and_complete: Duration::from_millis(5000),
        }
    }
}

impl DeferredDelays {
    pub fn for_kind(&self, kind: ActionKind) -> Duration {
        match kind {
            ActionKind::Complete => self.complete,
            ActionKind::Unclaim => self.unclaim,
            ActionKind::ResolveFlag => self.resolve,
            ActionKind::ResolveAndComplete => self.resolve_and_complete,
        }
    }
}

/// Rejections raised before anything is sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("task {0} is not loaded")]
    UnknownTask(TaskId),

    #[error("task {0} is not claimed")]
    NotClaimed(TaskId),

    #[error("task {0} is not flagged")]
    NotFlagged(TaskId),

    #[error("a flag needs a reason")]
    EmptyFlagReason,

    #[error("title cannot be empty")]
    EmptyTitle,

    #[error("unrecognized status {0:?}")]
    UnknownStatus(String),

    #[error("appointment needs a date, a start time and an end time")]
    IncompleteAppointment,

    #[error("appointment overlaps another event or does not end after it starts")]
    AppointmentConflict,

    #[error("appointment time does not exist locally: {0}")]
    NonexistentLocalTime(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Unchanged,
    Saved,
    Failed(String),
}

/// What the store shows while a deferred action waits.
#[derive(Debug, Clone, Copy)]
enum Optimistic {
    RemoveFromList,
    ClearAssignee,
    Nothing,
}

pub struct TaskController<B> {
    backend: Arc<B>,
    store: SharedStore,
    scheduler: DeferredScheduler,
    claims: ClaimCoordinator<B>,
    notices: Notices,
    delays: DeferredDelays,
    staff: Mutex<StaffDirectory>,
}

impl<B> TaskController<B>
where
    B: TaskBackend,
{
    pub fn new(backend: Arc<B>, delays: DeferredDelays) -> Self {
        let notices = Notices::new();
        let store = TaskStore::new().into_shared();
        let claims = ClaimCoordinator::new(Arc::clone(&backend), store.clone(), notices.clone());
        Self {
            scheduler: DeferredScheduler::new(notices.clone()),
            backend,
            store,
            claims,
            notices,
            delays,
            staff: Mutex::new(StaffDirectory::default()),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn notices(&self) -> &Notices {
        &self.notices
    }

    pub fn scheduler(&self) -> &DeferredScheduler {
        &self.scheduler
    }

    pub fn claims(&self) -> &ClaimCoordinator<B> {
        &self.claims
    }

    pub fn delays(&self) -> DeferredDelays {
        self.delays
    }

    pub fn staff(&self) -> StaffDirectory {
        self.staff.lock().clone()
    }

    pub fn set_staff(&self, staff: StaffDirectory) {
        *self.staff.lock() = staff;
    }

    #[instrument(skip_all)]
    pub async fn load_staff<S>(&self, api: &S) -> Result<usize, ApiError>
    where
        S: StaffApi + ?Sized,
    {
        let members = api.fetch_staff().await?;
        let count = members.len();
        self.set_staff(StaffDirectory::new(members));
        info!(count, "loaded staff directory");
        Ok(count)
    }

    /// Pulls the authoritative task list. Returns whether anything changed.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<bool, ApiError> {
        resync(self.backend.as_ref(), &self.store).await
    }

    pub async fn claim(&self, id: &TaskId) -> ClaimOutcome {
        self.claims.claim(id).await
    }

    pub async fn claim_all(&self, group: &str) -> ClaimAllOutcome {
        self.claims.claim_all(group).await
    }

    pub async fn undo(&self, key: &DeferredKey) -> bool {
        self.scheduler.undo(key).await
    }

    #[instrument(skip(self), fields(task = %id))]
    pub fn complete(&self, id: &TaskId) -> Result<Scheduled, ValidationError> {
        self.defer(
            ActionKind::Complete,
            id,
            |_| Ok(()),
            PatchPayload::default(),
            Optimistic::RemoveFromList,
        )
    }

    #[instrument(skip(self), fields(task = %id))]
    pub fn unclaim(&self, id: &TaskId) -> Result<Scheduled, ValidationError> {
        self.defer(
            ActionKind::Unclaim,
            id,
            |task| {
                if task.is_claimed() {
                    Ok(())
                } else {
                    Err(ValidationError::NotClaimed(task.id.clone()))
                }
            },
            PatchPayload::default(),
            Optimistic::ClearAssignee,
        )
    }

    #[instrument(skip(self, note), fields(task = %id))]
    pub fn resolve_flag(&self, id: &TaskId, note: &str) -> Result<Scheduled, ValidationError> {
        self.defer(
            ActionKind::ResolveFlag,
            id,
            require_flagged,
            PatchPayload::note(note.trim()),
            Optimistic::Nothing,
        )
    }

    #[instrument(skip(self, note), fields(task = %id))]
    pub fn resolve_and_complete(
        &self,
        id: &TaskId,
        note: &str,
    ) -> Result<Scheduled, ValidationError> {
        self.defer(
            ActionKind::ResolveAndComplete,
            id,
            require_flagged,
            PatchPayload::note(note.trim()),
            Optimistic::RemoveFromList,
        )
    }

    /// Flags a task right away. Network failures end in a resync, not an
    /// error.
    #[instrument(skip(self, reason), fields(task = %id))]
    pub async fn flag(&self, id: &TaskId, reason: &str) -> Result<CommitOutcome, ValidationError> {
        let reason = reason.trim().to_string();
        if reason.is_empty() {
            return Err(ValidationError::EmptyFlagReason);
        }
        self.require(id, |_| Ok(()))?;

        self.store.lock().update(id, |task| {
            task.status = TaskStatus::Flagged;
            task.flagged_reason = Some(reason.clone());
        });

        let result = self
            .backend
            .patch(id, PatchAction::Flag, PatchPayload::reason(reason))
            .await;
        self.resync_quietly().await;

        Ok(match result {
            Ok(()) => {
                self.notices.push(Notice::Flagged { task: id.clone() });
                CommitOutcome::Committed
            }
            Err(err) => {
                warn!(error = %err, "flag failed");
                self.notices.push(Notice::failed("flag", &err));
                CommitOutcome::Failed(err.to_string())
            }
        })
    }

    /// Saves form edits when they differ from the fetched task.
    #[instrument(skip(self, original, draft), fields(task = %original.id))]
    pub async fn save_edit(
        &self,
        original: &Task,
        draft: &TaskDraft,
    ) -> Result<EditOutcome, ValidationError> {
        if draft.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        let status = TaskStatus::parse(&draft.status)
            .ok_or_else(|| ValidationError::UnknownStatus(draft.status.clone()))?;
        if status == TaskStatus::Flagged && draft.flagged_reason.trim().is_empty() {
            return Err(ValidationError::EmptyFlagReason);
        }

        let staff = self.staff();
        let changed = changed_fields(original, draft, &staff);
        if changed.is_empty() {
            info!("no tracked field changed; nothing to save");
            return Ok(EditOutcome::Unchanged);
        }
        info!(?changed, "saving task edits");

        let fields = draft.tracked_fields().normalized(&staff);
        let result = self
            .backend
            .patch(&original.id, PatchAction::Edit, PatchPayload::edit(fields))
            .await;
        self.resync_quietly().await;

        Ok(match result {
            Ok(()) => {
                self.notices.push(Notice::Saved {
                    task: original.id.clone(),
                });
                EditOutcome::Saved
            }
            Err(err) => {
                warn!(error = %err, "edit failed");
                self.notices.push(Notice::failed("save", &err));
                EditOutcome::Failed(err.to_string())
            }
        })
    }

    fn require<F>(&self, id: &TaskId, check: F) -> Result<(), ValidationError>
    where
        F: FnOnce(&Task) -> Result<(), ValidationError>,
    {
        let store = self.store.lock();
        let task = store
            .get(id)
            .ok_or_else(|| ValidationError::UnknownTask(id.clone()))?;
        check(task)
    }

    /// Validates and schedules a deferred action. A request for a key that
    /// is already pending is reported as such before validation, since the
    /// optimistic apply may have taken the task out of the store.
    fn defer<F>(
        &self,
        kind: ActionKind,
        id: &TaskId,
        check: F,
        payload: PatchPayload,
        optimistic: Optimistic,
    ) -> Result<Scheduled, ValidationError>
    where
        F: FnOnce(&Task) -> Result<(), ValidationError>,
    {
        let key = DeferredKey::new(kind, id.clone());
        if self.scheduler.is_pending(&key) {
            return Ok(Scheduled::AlreadyPending);
        }
        self.require(id, check)?;
        let action = kind.patch_action();

        let apply = {
            let store = self.store.clone();
            let id = id.clone();
            move || {
                let mut store = store.lock();
                match optimistic {
                    Optimistic::RemoveFromList => {
                        store.remove_optimistically(&id);
                    }
                    Optimistic::ClearAssignee => {
                        store.update(&id, |task| task.assignee = None);
                    }
                    Optimistic::Nothing => {}
                }
            }
        };

        let commit = {
            let backend = Arc::clone(&self.backend);
            let store = self.store.clone();
            let id = id.clone();
            move || async move {
                backend
                    .patch(&id, action, payload)
                    .await
                    .with_context(|| format!("{action} request for task {id}"))?;
                if let Err(err) = resync(backend.as_ref(), &store).await {
                    warn!(task = %id, error = %err, "refresh after commit failed");
                }
                Ok::<(), anyhow::Error>(())
            }
        };

        let rollback = {
            let backend = Arc::clone(&self.backend);
            let store = self.store.clone();
            let notices = self.notices.clone();
            move || async move {
                if let Err(err) = resync(backend.as_ref(), &store).await {
                    warn!(error = %err, "rollback refresh failed");
                    notices.push(Notice::failed("refresh", &err));
                }
            }
        };

        Ok(self
            .scheduler
            .schedule(key, self.delays.for_kind(kind), apply, commit, rollback))
    }

    async fn resync_quietly(&self) {
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "refresh failed");
            self.notices.push(Notice::failed("refresh", &err));
        }
    }
}

fn require_flagged(task: &Task) -> Result<(), ValidationError> {
    if task.status == TaskStatus::Flagged {
        Ok(())
    } else {
        Err(ValidationError::NotFlagged(task.id.clone()))
    }
}
