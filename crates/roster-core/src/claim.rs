//! Claiming global tasks. The backend decides who wins a claim race; the
//! in-flight set here only stops one client from sending the same claim
//! twice.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::api::{ApiError, ClaimApi, TaskSource};
use crate::notice::{Notice, Notices};
use crate::store::{SharedStore, resync};
use crate::task::{StaffId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Someone else holds the task; `claimant` is read from the refreshed
    /// store when available.
    Conflict { claimant: Option<StaffId> },
    Failed(String),
    /// A claim for this task is still outstanding; nothing was sent.
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAllOutcome {
    Completed {
        claimed: Vec<TaskId>,
        already_claimed: Vec<TaskId>,
    },
    Failed(String),
}

type InFlightSet = Arc<Mutex<HashSet<TaskId>>>;

/// Marks task ids as having a claim outstanding until dropped.
struct InFlightGuard {
    set: InFlightSet,
    ids: Vec<TaskId>,
}

impl InFlightGuard {
    fn acquire(set: &InFlightSet, ids: Vec<TaskId>) -> Option<Self> {
        let mut held = set.lock();
        if ids.iter().any(|id| held.contains(id)) {
            return None;
        }
        held.extend(ids.iter().cloned());
        drop(held);
        Some(Self {
            set: Arc::clone(set),
            ids,
        })
    }

    /// Marks whichever of `ids` are not already held. Only those are
    /// released on drop.
    fn acquire_free(set: &InFlightSet, ids: Vec<TaskId>) -> Self {
        let mut held = set.lock();
        let ids: Vec<TaskId> = ids.into_iter().filter(|id| held.insert(id.clone())).collect();
        drop(held);
        Self {
            set: Arc::clone(set),
            ids,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut held = self.set.lock();
        for id in &self.ids {
            held.remove(id);
        }
    }
}

pub struct ClaimCoordinator<B> {
    backend: Arc<B>,
    store: SharedStore,
    in_flight: InFlightSet,
    notices: Notices,
}

impl<B> ClaimCoordinator<B>
where
    B: ClaimApi + TaskSource + Send + Sync,
{
    pub fn new(backend: Arc<B>, store: SharedStore, notices: Notices) -> Self {
        Self {
            backend,
            store,
            in_flight: Arc::default(),
            notices,
        }
    }

    pub fn is_in_flight(&self, id: &TaskId) -> bool {
        self.in_flight.lock().contains(id)
    }

    /// Whether the claim control for `id` should be offered.
    pub fn can_claim(&self, id: &TaskId) -> bool {
        let global = self
            .store
            .lock()
            .get(id)
            .is_some_and(|task| task.is_global());
        global && !self.is_in_flight(id)
    }

    #[instrument(skip(self), fields(task = %id))]
    pub async fn claim(&self, id: &TaskId) -> ClaimOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, vec![id.clone()]) else {
            info!("claim already in flight; not sending another");
            return ClaimOutcome::InFlight;
        };

        match self.backend.claim(id).await {
            Ok(()) => {
                info!("claim accepted");
                self.refresh().await;
                self.notices.push(Notice::Claimed { task: id.clone() });
                ClaimOutcome::Claimed
            }
            Err(ApiError::Conflict { message }) => {
                info!(%message, "claim lost to another staff member");
                self.refresh().await;
                let claimant = self
                    .store
                    .lock()
                    .get(id)
                    .and_then(|task| task.assignee.clone());
                self.notices.push(Notice::ClaimConflict {
                    task: id.clone(),
                    claimant: claimant.clone(),
                });
                ClaimOutcome::Conflict { claimant }
            }
            Err(err) => {
                warn!(error = %err, "claim failed");
                self.notices.push(Notice::failed("claim", &err));
                ClaimOutcome::Failed(err.to_string())
            }
        }
    }

    /// Claims every task in `group` in one request. Tasks someone else
    /// already held are reported, not treated as an error.
    #[instrument(skip(self))]
    pub async fn claim_all(&self, group: &str) -> ClaimAllOutcome {
        let members: Vec<TaskId> = self
            .store
            .lock()
            .group_members(group)
            .into_iter()
            .filter(|task| task.is_global())
            .map(|task| task.id.clone())
            .collect();
        // An overlapping single claim keeps its own marker; the group
        // request goes out regardless and the server sorts out the race.
        let _guard = InFlightGuard::acquire_free(&self.in_flight, members);

        match self.backend.claim_all(group).await {
            Ok(response) => {
                info!(
                    claimed = response.claimed.len(),
                    already_claimed = response.already_claimed.len(),
                    "claim-all finished"
                );
                self.refresh().await;
                self.notices.push(Notice::ClaimedGroup {
                    group: group.to_string(),
                    claimed: response.claimed.len(),
                    already_claimed: response.already_claimed.len(),
                });
                ClaimAllOutcome::Completed {
                    claimed: response.claimed,
                    already_claimed: response.already_claimed,
                }
            }
            Err(err) => {
                warn!(error = %err, "claim-all failed");
                self.notices.push(Notice::failed("claim all", &err));
                ClaimAllOutcome::Failed(err.to_string())
            }
        }
    }

    async fn refresh(&self) {
        if let Err(err) = resync(self.backend.as_ref(), &self.store).await {
            warn!(error = %err, "refresh after claim failed");
            self.notices.push(Notice::failed("refresh", &err));
        }
    }
}
