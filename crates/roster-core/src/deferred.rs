//! Delayed commits that can be undone until their timer fires.
//!
//! A deferred action applies its optimistic change immediately, waits out
//! its window, then commits. Undo inside the window cancels the timer and
//! runs the rollback instead. Each key has at most one pending action.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::api::PatchAction;
use crate::notice::{Notice, Notices};
use crate::task::TaskId;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type Rollback = Box<dyn FnOnce() -> BoxFuture<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Complete,
    Unclaim,
    ResolveFlag,
    ResolveAndComplete,
}

impl ActionKind {
    pub fn slug(self) -> &'static str {
        match self {
            ActionKind::Complete => "complete",
            ActionKind::Unclaim => "unclaim",
            ActionKind::ResolveFlag => "resolve",
            ActionKind::ResolveAndComplete => "resolve-complete",
        }
    }

    pub fn verb(self) -> &'static str {
        match self {
            ActionKind::Complete => "completing",
            ActionKind::Unclaim => "unclaiming",
            ActionKind::ResolveFlag => "resolving",
            ActionKind::ResolveAndComplete => "resolving and completing",
        }
    }

    pub fn noun(self) -> &'static str {
        match self {
            ActionKind::Complete => "completion",
            ActionKind::Unclaim => "unclaim",
            ActionKind::ResolveFlag => "flag resolution",
            ActionKind::ResolveAndComplete => "resolution and completion",
        }
    }

    pub fn patch_action(self) -> PatchAction {
        match self {
            ActionKind::Complete => PatchAction::Complete,
            ActionKind::Unclaim => PatchAction::Unclaim,
            ActionKind::ResolveFlag => PatchAction::ResolveFlag,
            ActionKind::ResolveAndComplete => PatchAction::ResolveAndComplete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeferredKey {
    pub kind: ActionKind,
    pub task: TaskId,
}

impl DeferredKey {
    pub fn new(kind: ActionKind, task: TaskId) -> Self {
        Self { kind, task }
    }
}

impl fmt::Display for DeferredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.slug(), self.task)
    }
}

/// How a scheduled action ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredOutcome {
    Committed,
    Cancelled,
    Failed(String),
}

/// Handle to a scheduled action.
#[derive(Debug)]
pub struct DeferredTicket {
    pub key: DeferredKey,
    pub deadline: Instant,
    outcome: oneshot::Receiver<DeferredOutcome>,
}

impl DeferredTicket {
    /// Resolves once the action commits, fails, or is undone.
    pub async fn wait(self) -> DeferredOutcome {
        self.outcome.await.unwrap_or(DeferredOutcome::Cancelled)
    }
}

#[derive(Debug)]
pub enum Scheduled {
    Pending(DeferredTicket),
    AlreadyPending,
}

impl Scheduled {
    pub fn is_pending(&self) -> bool {
        matches!(self, Scheduled::Pending(_))
    }
}

struct PendingEntry {
    generation: u64,
    deadline: Instant,
    timer: JoinHandle<()>,
    rollback: Rollback,
}

type PendingMap = Arc<Mutex<HashMap<DeferredKey, PendingEntry>>>;

/// Generic delayed-commit engine. Must be used from inside a tokio runtime.
#[derive(Clone)]
pub struct DeferredScheduler {
    pending: PendingMap,
    generation: Arc<AtomicU64>,
    notices: Notices,
}

impl DeferredScheduler {
    pub fn new(notices: Notices) -> Self {
        Self {
            pending: Arc::default(),
            generation: Arc::new(AtomicU64::new(0)),
            notices,
        }
    }

    /// Schedules `commit` to run after `delay`. `apply` runs right away;
    /// `rollback` runs on undo or when `commit` fails. A key that is already
    /// pending is left alone and none of the callbacks run.
    #[instrument(
        skip(self, apply, commit, rollback),
        fields(key = %key, delay_ms = delay.as_millis() as u64)
    )]
    pub fn schedule<A, C, CF, R, RF>(
        &self,
        key: DeferredKey,
        delay: Duration,
        apply: A,
        commit: C,
        rollback: R,
    ) -> Scheduled
    where
        A: FnOnce(),
        C: FnOnce() -> CF + Send + 'static,
        CF: Future<Output = anyhow::Result<()>> + Send + 'static,
        R: FnOnce() -> RF + Send + 'static,
        RF: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if pending.contains_key(&key) {
            debug!("action already pending; ignoring duplicate");
            return Scheduled::AlreadyPending;
        }

        apply();

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let (tx, rx) = oneshot::channel();
        let rollback: Rollback = Box::new(move || Box::pin(rollback()));

        // The entry is inserted before the lock drops, so the timer task
        // always finds it.
        let timer = tokio::spawn(run_timer(
            Arc::clone(&self.pending),
            self.notices.clone(),
            key.clone(),
            generation,
            deadline,
            commit,
            tx,
        ));
        pending.insert(
            key.clone(),
            PendingEntry {
                generation,
                deadline,
                timer,
                rollback,
            },
        );
        drop(pending);

        info!("deferred action scheduled");
        self.notices.push(Notice::UndoAvailable {
            key: key.clone(),
            window: delay,
        });

        Scheduled::Pending(DeferredTicket {
            key,
            deadline,
            outcome: rx,
        })
    }

    /// Cancels a pending action and runs its rollback. Returns `false` when
    /// nothing is pending under `key`, including after the timer fired.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn undo(&self, key: &DeferredKey) -> bool {
        let entry = self.pending.lock().remove(key);
        let Some(entry) = entry else {
            debug!("nothing pending to undo");
            return false;
        };

        entry.timer.abort();
        info!("deferred action undone");
        self.notices.push(Notice::Undone { key: key.clone() });
        (entry.rollback)().await;
        true
    }

    pub fn is_pending(&self, key: &DeferredKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    pub fn pending_keys(&self) -> Vec<DeferredKey> {
        self.pending.lock().keys().cloned().collect()
    }

    pub fn remaining(&self, key: &DeferredKey) -> Option<Duration> {
        self.pending
            .lock()
            .get(key)
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }
}

impl fmt::Debug for DeferredScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredScheduler")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

async fn run_timer<C, CF>(
    pending: PendingMap,
    notices: Notices,
    key: DeferredKey,
    generation: u64,
    deadline: Instant,
    commit: C,
    outcome: oneshot::Sender<DeferredOutcome>,
) where
    C: FnOnce() -> CF + Send + 'static,
    CF: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::time::sleep_until(deadline).await;

    let entry = {
        let mut map = pending.lock();
        match map.get(&key) {
            Some(entry) if entry.generation == generation => map.remove(&key),
            _ => None,
        }
    };
    let Some(entry) = entry else {
        debug!(key = %key, "timer fired for a cleared entry");
        return;
    };

    info!(key = %key, "committing deferred action");
    let result = match commit().await {
        Ok(()) => {
            notices.push(Notice::Committed { key: key.clone() });
            DeferredOutcome::Committed
        }
        Err(err) => {
            warn!(key = %key, error = %err, "deferred commit failed; rolling back");
            notices.push(Notice::failed(key.kind.noun(), format!("{err:#}")));
            (entry.rollback)().await;
            DeferredOutcome::Failed(format!("{err:#}"))
        }
    };
    let _ = outcome.send(result);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use anyhow::anyhow;
    use tokio::time::sleep;

    use super::*;

    #[derive(Clone, Default)]
    struct Counters {
        applied: Arc<AtomicUsize>,
        committed: Arc<AtomicUsize>,
        rolled_back: Arc<AtomicUsize>,
    }

    impl Counters {
        fn schedule(
            &self,
            scheduler: &DeferredScheduler,
            key: DeferredKey,
            delay_ms: u64,
            fail: bool,
        ) -> Scheduled {
            let applied = Arc::clone(&self.applied);
            let committed = Arc::clone(&self.committed);
            let rolled_back = Arc::clone(&self.rolled_back);
            scheduler.schedule(
                key,
                Duration::from_millis(delay_ms),
                move || {
                    applied.fetch_add(1, Ordering::SeqCst);
                },
                move || async move {
                    committed.fetch_add(1, Ordering::SeqCst);
                    if fail { Err(anyhow!("server unavailable")) } else { Ok(()) }
                },
                move || async move {
                    rolled_back.fetch_add(1, Ordering::SeqCst);
                },
            )
        }

        fn get(&self) -> (usize, usize, usize) {
            (
                self.applied.load(Ordering::SeqCst),
                self.committed.load(Ordering::SeqCst),
                self.rolled_back.load(Ordering::SeqCst),
            )
        }
    }

    fn key(kind: ActionKind, id: &str) -> DeferredKey {
        DeferredKey::new(kind, TaskId::new(id))
    }

    #[test]
    fn keys_render_kind_and_task() {
        assert_eq!(key(ActionKind::Complete, "T1").to_string(), "complete-T1");
        assert_eq!(
            key(ActionKind::ResolveAndComplete, "9").to_string(),
            "resolve-complete-9"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn commits_after_the_delay() {
        let scheduler = DeferredScheduler::new(Notices::new());
        let counters = Counters::default();
        let scheduled = counters.schedule(&scheduler, key(ActionKind::Complete, "T1"), 5000, false);
        let Scheduled::Pending(ticket) = scheduled else {
            panic!("expected a pending ticket");
        };

        sleep(Duration::from_millis(4999)).await;
        assert_eq!(counters.get(), (1, 0, 0));

        assert_eq!(ticket.wait().await, DeferredOutcome::Committed);
        assert_eq!(counters.get(), (1, 1, 0));
        assert!(!scheduler.is_pending(&key(ActionKind::Complete, "T1")));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_schedule_is_a_no_op() {
        let scheduler = DeferredScheduler::new(Notices::new());
        let counters = Counters::default();
        let k = key(ActionKind::Complete, "T1");

        assert!(counters.schedule(&scheduler, k.clone(), 5000, false).is_pending());
        sleep(Duration::from_millis(1000)).await;
        assert!(!counters.schedule(&scheduler, k.clone(), 5000, false).is_pending());
        assert_eq!(scheduler.pending_keys(), vec![k]);

        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(counters.get(), (1, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn undo_before_expiry_prevents_commit() {
        let notices = Notices::new();
        let scheduler = DeferredScheduler::new(notices.clone());
        let counters = Counters::default();
        let k = key(ActionKind::Complete, "T1");
        let Scheduled::Pending(ticket) = counters.schedule(&scheduler, k.clone(), 5000, false)
        else {
            panic!("expected a pending ticket");
        };

        sleep(Duration::from_millis(3000)).await;
        assert!(scheduler.remaining(&k).is_some());
        assert!(scheduler.undo(&k).await);
        assert_eq!(ticket.wait().await, DeferredOutcome::Cancelled);

        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(counters.get(), (1, 0, 1));
        assert!(notices.drain().contains(&Notice::Undone { key: k }));
    }

    #[tokio::test(start_paused = true)]
    async fn undo_after_expiry_has_no_effect() {
        let scheduler = DeferredScheduler::new(Notices::new());
        let counters = Counters::default();
        let k = key(ActionKind::Unclaim, "T2");
        counters.schedule(&scheduler, k.clone(), 4000, false);

        sleep(Duration::from_millis(4500)).await;
        assert!(!scheduler.undo(&k).await);
        assert_eq!(counters.get(), (1, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commit_rolls_back() {
        let notices = Notices::new();
        let scheduler = DeferredScheduler::new(notices.clone());
        let counters = Counters::default();
        let Scheduled::Pending(ticket) =
            counters.schedule(&scheduler, key(ActionKind::ResolveFlag, "T3"), 5000, true)
        else {
            panic!("expected a pending ticket");
        };

        assert!(matches!(ticket.wait().await, DeferredOutcome::Failed(_)));
        assert_eq!(counters.get(), (1, 1, 1));
        assert!(notices
            .drain()
            .iter()
            .any(|n| matches!(n, Notice::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn different_kinds_on_one_task_are_independent() {
        let scheduler = DeferredScheduler::new(Notices::new());
        let counters = Counters::default();
        counters.schedule(&scheduler, key(ActionKind::Unclaim, "T1"), 4000, false);
        counters.schedule(&scheduler, key(ActionKind::Complete, "T1"), 5000, false);
        assert_eq!(scheduler.pending_keys().len(), 2);

        assert!(scheduler.undo(&key(ActionKind::Complete, "T1")).await);
        sleep(Duration::from_millis(6000)).await;
        assert_eq!(counters.get(), (2, 1, 1));
    }
}
