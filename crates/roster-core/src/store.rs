use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::api::{ApiError, TaskSource};
use crate::task::{Bucket, StaffId, Task, TaskBuckets, TaskId};

/// Store handle shared by the coordinators. The lock is never held across
/// an await.
pub type SharedStore = Arc<Mutex<TaskStore>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketCounts {
    pub upcoming: usize,
    pub overdue: usize,
    pub flagged: usize,
}

impl BucketCounts {
    pub fn total(&self) -> usize {
        self.upcoming + self.overdue + self.flagged
    }
}

/// Session-owned task collection, grouped by status bucket.
#[derive(Debug, Default)]
pub struct TaskStore {
    buckets: TaskBuckets,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_buckets(buckets: TaskBuckets) -> Self {
        Self { buckets }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn buckets(&self) -> &TaskBuckets {
        &self.buckets
    }

    pub fn bucket(&self, bucket: Bucket) -> &[Task] {
        self.buckets.get(bucket)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.buckets
            .iter()
            .map(|(_, task)| task)
            .find(|task| &task.id == id)
    }

    pub fn locate(&self, id: &TaskId) -> Option<Bucket> {
        self.buckets
            .iter()
            .find(|(_, task)| &task.id == id)
            .map(|(bucket, _)| bucket)
    }

    fn take(&mut self, id: &TaskId, guess: Option<Bucket>) -> Option<(Task, Bucket)> {
        let order = guess
            .into_iter()
            .chain(Bucket::ALL.into_iter().filter(move |b| Some(*b) != guess));
        for bucket in order {
            let list = self.buckets.get_mut(bucket);
            if let Some(idx) = list.iter().position(|task| &task.id == id) {
                return Some((list.remove(idx), bucket));
            }
        }
        None
    }

    /// Moves a task into `to`, wherever it currently lives. `from_guess` is
    /// only where the scan starts.
    #[instrument(skip(self), fields(task = %id))]
    pub fn move_to_bucket(&mut self, id: &TaskId, from_guess: Option<Bucket>, to: Bucket) -> bool {
        let Some((task, from)) = self.take(id, from_guess) else {
            warn!("move requested for a task the store does not hold");
            return false;
        };
        debug!(%from, %to, "moving task between buckets");
        self.buckets.get_mut(to).push(task);
        true
    }

    /// Removes a task and hands it back so a rollback can restore it as-is.
    #[instrument(skip(self), fields(task = %id))]
    pub fn remove_optimistically(&mut self, id: &TaskId) -> Option<(Task, Bucket)> {
        let removed = self.take(id, None);
        match &removed {
            Some((_, bucket)) => debug!(%bucket, "optimistically removed task"),
            None => debug!("nothing to remove"),
        }
        removed
    }

    /// Files a task under the bucket its status maps to, replacing any copy
    /// with the same id. Completed tasks are dropped from view.
    #[instrument(skip(self, task), fields(task = %task.id, status = %task.status))]
    pub fn reinsert(&mut self, task: Task) -> Option<Bucket> {
        self.take(&task.id, None);
        let bucket = task.bucket()?;
        self.buckets.get_mut(bucket).push(task);
        Some(bucket)
    }

    /// Mutates a task in place and re-files it if its status moved buckets.
    #[instrument(skip(self, mutate), fields(task = %id))]
    pub fn update<F>(&mut self, id: &TaskId, mutate: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        let Some(current) = self.locate(id) else {
            return false;
        };
        let list = self.buckets.get_mut(current);
        let Some(task) = list.iter_mut().find(|task| &task.id == id) else {
            return false;
        };
        mutate(task);

        if task.bucket() != Some(current) {
            if let Some((task, _)) = self.take(id, Some(current)) {
                debug!(from = %current, status = %task.status, "re-filing updated task");
                self.reinsert(task);
            }
        }
        true
    }

    /// Swaps in a freshly fetched snapshot. Returns `false` and leaves the
    /// store untouched when the snapshot equals what is already held.
    #[instrument(skip(self, fresh), fields(count = fresh.len()))]
    pub fn replace_all(&mut self, fresh: TaskBuckets) -> bool {
        if self.buckets == fresh {
            debug!("fetched snapshot unchanged; skipping replace");
            return false;
        }
        info!(
            upcoming = fresh.upcoming.len(),
            overdue = fresh.overdue.len(),
            flagged = fresh.flagged.len(),
            "replaced task snapshot"
        );
        self.buckets = fresh;
        true
    }

    pub fn global_tasks(&self) -> Vec<&Task> {
        self.buckets
            .iter()
            .map(|(_, task)| task)
            .filter(|task| task.is_global())
            .collect()
    }

    pub fn claimed_tasks(&self) -> Vec<&Task> {
        self.buckets
            .iter()
            .map(|(_, task)| task)
            .filter(|task| task.is_claimed())
            .collect()
    }

    pub fn assigned_to(&self, staff: &StaffId) -> Vec<&Task> {
        self.buckets
            .iter()
            .map(|(_, task)| task)
            .filter(|task| task.is_assigned_to(staff))
            .collect()
    }

    pub fn group_members(&self, group: &str) -> Vec<&Task> {
        self.buckets
            .iter()
            .map(|(_, task)| task)
            .filter(|task| task.group_key.as_deref() == Some(group))
            .collect()
    }

    pub fn counts(&self) -> BucketCounts {
        BucketCounts {
            upcoming: self.buckets.upcoming.len(),
            overdue: self.buckets.overdue.len(),
            flagged: self.buckets.flagged.len(),
        }
    }

    /// Bucket contents by descending priority, then earliest due date.
    pub fn sorted_bucket(&self, bucket: Bucket) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.buckets.get(bucket).iter().collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| match (a.due_on(), b.due_on()) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
        });
        tasks
    }

    /// Every task is held once, in the bucket its status maps to.
    pub fn verify(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for (bucket, task) in self.buckets.iter() {
            if !seen.insert(&task.id) {
                return Err(anyhow!("task {} is held more than once", task.id));
            }
            if task.bucket() != Some(bucket) {
                return Err(anyhow!(
                    "task {} with status {} is filed under {}",
                    task.id,
                    task.status,
                    bucket
                ));
            }
        }
        Ok(())
    }
}

/// Re-fetches the authoritative snapshot into the store.
#[instrument(skip_all)]
pub async fn resync<S>(source: &S, store: &SharedStore) -> Result<bool, ApiError>
where
    S: TaskSource + ?Sized,
{
    let fresh = source.fetch_tasks().await?;
    Ok(store.lock().replace_all(fresh))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, TaskStatus};

    fn sample() -> TaskStore {
        let mut overdue = Task::new("2", "Collect ID", TaskStatus::Overdue);
        overdue.assignee = Some(StaffId::new("s-1"));
        let mut flagged = Task::new("3", "Sign contract", TaskStatus::Flagged);
        flagged.flagged_reason = Some("missing page".to_string());
        TaskStore::from_buckets(TaskBuckets {
            upcoming: vec![Task::new("1", "Book desk", TaskStatus::Today)],
            overdue: vec![overdue],
            flagged: vec![flagged],
        })
    }

    #[test]
    fn move_scans_past_a_wrong_guess() {
        let mut store = sample();
        let id = TaskId::new("2");
        assert!(store.move_to_bucket(&id, Some(Bucket::Flagged), Bucket::Upcoming));
        assert_eq!(store.locate(&id), Some(Bucket::Upcoming));
        assert_eq!(store.counts().total(), 3);
        assert!(!store.move_to_bucket(&TaskId::new("nope"), None, Bucket::Upcoming));
    }

    #[test]
    fn removed_task_reinserts_by_status() {
        let mut store = sample();
        let (task, bucket) = store
            .remove_optimistically(&TaskId::new("3"))
            .expect("task present");
        assert_eq!(bucket, Bucket::Flagged);
        assert_eq!(store.counts().flagged, 0);

        assert_eq!(store.reinsert(task.clone()), Some(Bucket::Flagged));
        assert_eq!(store.reinsert(task), Some(Bucket::Flagged));
        assert_eq!(store.counts().flagged, 1);
        store.verify().expect("consistent");
    }

    #[test]
    fn update_refiles_when_status_changes_bucket() {
        let mut store = sample();
        let id = TaskId::new("1");
        assert!(store.update(&id, |task| {
            task.status = TaskStatus::Flagged;
            task.flagged_reason = Some("laptop backordered".to_string());
        }));
        assert_eq!(store.locate(&id), Some(Bucket::Flagged));

        assert!(store.update(&id, |task| task.status = TaskStatus::Completed));
        assert_eq!(store.locate(&id), None);
        store.verify().expect("consistent");
    }

    #[test]
    fn replace_all_skips_identical_snapshots() {
        let mut store = sample();
        let same = store.buckets().clone();
        assert!(!store.replace_all(same));

        let mut changed = store.buckets().clone();
        changed.upcoming.clear();
        assert!(store.replace_all(changed));
        assert_eq!(store.counts().upcoming, 0);
    }

    #[test]
    fn derived_views_split_on_assignee() {
        let store = sample();
        let global: Vec<&str> = store.global_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(global, vec!["1", "3"]);
        assert_eq!(store.claimed_tasks().len(), 1);
        assert_eq!(store.assigned_to(&StaffId::new("s-1")).len(), 1);
    }

    #[test]
    fn sorted_bucket_puts_higher_priority_first() {
        let mut low = Task::new("a", "low", TaskStatus::Today);
        low.priority = Priority::Low;
        let mut urgent = Task::new("b", "urgent", TaskStatus::Today);
        urgent.priority = Priority::VeryHigh;
        let mut medium_due = Task::new("c", "due", TaskStatus::InProgress);
        medium_due.due_date = Some("2024-06-01".to_string());
        let medium = Task::new("d", "undated", TaskStatus::Today);

        let store = TaskStore::from_buckets(TaskBuckets {
            upcoming: vec![low, medium, urgent, medium_due],
            ..TaskBuckets::default()
        });
        let order: Vec<&str> = store
            .sorted_bucket(Bucket::Upcoming)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(order, vec!["b", "c", "d", "a"]);
    }
}
