//! Session facts: small values the dashboard remembers between visits, such
//! as a snoozed banner or which checklist items were ticked.
//!
//! Entries carry the schema version and time they were written. A read
//! ignores anything older than the TTL or written under another version.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::task::TaskId;

pub const FACT_SCHEMA_VERSION: u32 = 1;

const BANNER_SNOOZE_KEY: &str = "banner.snoozed_until";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactPolicy {
    pub ttl: Duration,
    pub version: u32,
}

impl Default for FactPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::days(30),
            version: FACT_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FactEntry {
    value: serde_json::Value,
    version: u32,
    written_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct FactStore {
    policy: FactPolicy,
    path: Option<PathBuf>,
    entries: BTreeMap<String, FactEntry>,
}

impl FactStore {
    pub fn in_memory(policy: FactPolicy) -> Self {
        Self {
            policy,
            path: None,
            entries: BTreeMap::new(),
        }
    }

    /// Opens a file-backed store, creating the parent directory if needed.
    #[instrument(skip(policy))]
    pub fn open(path: &Path, policy: FactPolicy) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let entries = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed parsing {}", path.display()))?
            }
        } else {
            BTreeMap::new()
        };

        info!(file = %path.display(), count = entries.len(), "opened fact store");
        Ok(Self {
            policy,
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_live(&self, entry: &FactEntry, now: DateTime<Utc>) -> bool {
        entry.version == self.policy.version && now - entry.written_at < self.policy.ttl
    }

    pub fn get<T>(&self, key: &str, now: DateTime<Utc>) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let entry = self.entries.get(key)?;
        if !self.is_live(entry, now) {
            debug!(key, "ignoring stale fact");
            return None;
        }
        match serde_json::from_value(entry.value.clone()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "fact has an unexpected shape; ignoring");
                None
            }
        }
    }

    #[instrument(skip(self, value))]
    pub fn put<T>(&mut self, key: &str, value: &T, now: DateTime<Utc>) -> anyhow::Result<()>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value)
            .with_context(|| format!("failed to serialize fact {key}"))?;
        self.entries.insert(
            key.to_string(),
            FactEntry {
                value,
                version: self.policy.version,
                written_at: now,
            },
        );
        self.persist()
    }

    pub fn remove(&mut self, key: &str) -> anyhow::Result<bool> {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Drops expired or outdated entries. Returns how many were removed.
    #[instrument(skip(self))]
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let before = self.entries.len();
        let live: BTreeMap<String, FactEntry> = std::mem::take(&mut self.entries)
            .into_iter()
            .filter(|(_, entry)| self.is_live(entry, now))
            .collect();
        self.entries = live;
        let purged = before - self.entries.len();
        if purged > 0 {
            info!(before, after = self.entries.len(), "purged stale facts");
            self.persist()?;
        }
        Ok(purged)
    }

    pub fn snooze_banner(
        &mut self,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.put(BANNER_SNOOZE_KEY, &until, now)
    }

    pub fn banner_snoozed(&self, now: DateTime<Utc>) -> bool {
        self.get::<DateTime<Utc>>(BANNER_SNOOZE_KEY, now)
            .is_some_and(|until| until > now)
    }

    /// When the task was first shown, recording `now` on first sight.
    pub fn first_seen(
        &mut self,
        task: &TaskId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<DateTime<Utc>> {
        let key = format!("task.{task}.first_seen");
        if let Some(seen) = self.get::<DateTime<Utc>>(&key, now) {
            return Ok(seen);
        }
        self.put(&key, &now, now)?;
        Ok(now)
    }

    pub fn checklist(&self, task: &TaskId, now: DateTime<Utc>) -> BTreeSet<String> {
        self.get(&format!("task.{task}.checklist"), now)
            .unwrap_or_default()
    }

    pub fn set_checklist(
        &mut self,
        task: &TaskId,
        items: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.put(&format!("task.{task}.checklist"), items, now)
    }

    fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        debug!(file = %path.display(), count = self.entries.len(), "saving facts atomically");

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut temp, &self.entries)?;
        writeln!(temp)?;
        temp.flush()?;
        temp.persist(path)
            .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, hour, 0, 0)
            .single()
            .expect("valid instant")
    }

    #[test]
    fn banner_snooze_expires_with_its_deadline() {
        let mut facts = FactStore::in_memory(FactPolicy::default());
        facts.snooze_banner(at(12), at(9)).expect("snooze");
        assert!(facts.banner_snoozed(at(10)));
        assert!(!facts.banner_snoozed(at(13)));
    }

    #[test]
    fn entries_older_than_ttl_are_ignored_and_purged() {
        let policy = FactPolicy {
            ttl: Duration::hours(2),
            version: FACT_SCHEMA_VERSION,
        };
        let mut facts = FactStore::in_memory(policy);
        let task = TaskId::new("T1");
        assert_eq!(facts.first_seen(&task, at(8)).expect("record"), at(8));
        assert_eq!(facts.first_seen(&task, at(9)).expect("read"), at(8));

        assert_eq!(facts.first_seen(&task, at(11)).expect("re-record"), at(11));
        facts.put("old", &1, at(1)).expect("put");
        assert_eq!(facts.purge_expired(at(11)).expect("purge"), 1);
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn version_bump_invalidates_entries() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("facts.json");
        let task = TaskId::new("T7");
        let items: BTreeSet<String> = ["badge".to_string(), "laptop".to_string()].into();

        {
            let mut facts = FactStore::open(&path, FactPolicy::default()).expect("open");
            facts.set_checklist(&task, &items, at(9)).expect("save");
        }

        let reopened = FactStore::open(&path, FactPolicy::default()).expect("reopen");
        assert_eq!(reopened.checklist(&task, at(10)), items);

        let bumped = FactStore::open(
            &path,
            FactPolicy {
                version: FACT_SCHEMA_VERSION + 1,
                ..FactPolicy::default()
            },
        )
        .expect("reopen with new version");
        assert!(bumped.checklist(&task, at(10)).is_empty());
    }
}
