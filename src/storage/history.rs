//! Capped, deduplicated, newest-first history lists.
//!
//! The list transform is a pure function ([`upsert_front`], [`remove_key`]) so it
//! can be tested without a database; [`BoundedHistory`] layers it over one
//! [`KvStore`] slot and does a read-modify-write on every call.

use std::marker::PhantomData;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{KvStore, Pool};

pub const JOB_HISTORY_KEY: &str = "history.jobs";
pub const JOB_HISTORY_CAPACITY: usize = 50;
pub const SCENARIO_HISTORY_KEY: &str = "history.scenarios";
pub const SCENARIO_HISTORY_CAPACITY: usize = 20;

/// A record identified by a single key field.
pub trait HistoryRecord: Serialize + DeserializeOwned + Clone {
    fn key(&self) -> &str;
}

/// A job the user submitted or opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistoryRecord {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
}

impl HistoryRecord for JobHistoryRecord {
    fn key(&self) -> &str {
        &self.job_id
    }
}

/// How a scenario reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioOrigin {
    /// Uploaded from a local file.
    Upload,
    /// Built from a free-text task description.
    Generated,
}

/// A scenario file the user uploaded, keyed by its upload token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioHistoryRecord {
    pub token: String,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    pub origin: ScenarioOrigin,
}

impl HistoryRecord for ScenarioHistoryRecord {
    fn key(&self) -> &str {
        &self.token
    }
}

/// Remove any record sharing `record`'s key, prepend it, truncate to `capacity`.
pub fn upsert_front<R: HistoryRecord>(mut list: Vec<R>, record: R, capacity: usize) -> Vec<R> {
    list.retain(|existing| existing.key() != record.key());
    list.insert(0, record);
    list.truncate(capacity);
    list
}

/// Drop the record with `key`, keeping the order of the rest.
pub fn remove_key<R: HistoryRecord>(mut list: Vec<R>, key: &str) -> Vec<R> {
    list.retain(|existing| existing.key() != key);
    list
}

/// Decode a stored list, skipping elements that no longer match the record shape.
/// Anything that is not a JSON array reads as empty.
fn decode_list<R: HistoryRecord>(slot: &str, raw: &str) -> Vec<R> {
    let items = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(_) => {
            warn!(%slot, "history slot does not hold a list, treating as empty");
            return Vec::new();
        }
        Err(e) => {
            warn!(%slot, error = %e, "history slot is corrupted, treating as empty");
            return Vec::new();
        }
    };

    let total = items.len();
    let records: Vec<R> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    if records.len() != total {
        warn!(%slot, skipped = total - records.len(), "dropped malformed history records");
    }
    records
}

/// A persisted history list with a fixed slot key and capacity.
pub struct BoundedHistory<R> {
    store: KvStore,
    slot: &'static str,
    capacity: usize,
    _record: PhantomData<R>,
}

impl<R: HistoryRecord> BoundedHistory<R> {
    pub fn new(store: KvStore, slot: &'static str, capacity: usize) -> Self {
        Self {
            store,
            slot,
            capacity,
            _record: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Newest first. Corrupted storage reads as an empty list.
    pub fn read_all(&self) -> Result<Vec<R>> {
        let raw = self.store.get(self.slot)?;
        Ok(raw
            .map(|raw| decode_list(self.slot, &raw))
            .unwrap_or_default())
    }

    pub fn upsert_front(&self, record: R) -> Result<Vec<R>> {
        let list = upsert_front(self.read_all()?, record, self.capacity);
        self.write(&list)?;
        Ok(list)
    }

    pub fn remove_by_key(&self, key: &str) -> Result<Vec<R>> {
        let list = remove_key(self.read_all()?, key);
        self.write(&list)?;
        Ok(list)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.delete(self.slot)
    }

    fn write(&self, list: &[R]) -> Result<()> {
        let raw = serde_json::to_string(list)
            .with_context(|| format!("failed to encode history slot '{}'", self.slot))?;
        self.store.put(self.slot, &raw)
    }
}

impl BoundedHistory<JobHistoryRecord> {
    /// Move `job_id` to the front. The creation time is the backend's when
    /// known, otherwise the one already remembered, otherwise now.
    pub fn remember_job(
        &self,
        job_id: &str,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<JobHistoryRecord>> {
        let list = self.read_all()?;
        let created_at = created_at
            .or_else(|| {
                list.iter()
                    .find(|r| r.job_id == job_id)
                    .map(|r| r.created_at)
            })
            .unwrap_or_else(Utc::now);
        let record = JobHistoryRecord {
            job_id: job_id.to_string(),
            created_at,
        };
        let list = upsert_front(list, record, self.capacity);
        self.write(&list)?;
        Ok(list)
    }
}

/// Jobs the user has interacted with (cap 50).
pub fn job_history(pool: Pool) -> BoundedHistory<JobHistoryRecord> {
    BoundedHistory::new(KvStore::new(pool), JOB_HISTORY_KEY, JOB_HISTORY_CAPACITY)
}

/// Scenarios the user has uploaded (cap 20).
pub fn scenario_history(pool: Pool) -> BoundedHistory<ScenarioHistoryRecord> {
    BoundedHistory::new(
        KvStore::new(pool),
        SCENARIO_HISTORY_KEY,
        SCENARIO_HISTORY_CAPACITY,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(n: i64) -> JobHistoryRecord {
        JobHistoryRecord {
            job_id: format!("job-{n}"),
            created_at: Utc.timestamp_opt(1_700_000_000 + n, 0).unwrap(),
        }
    }

    fn keys(list: &[JobHistoryRecord]) -> Vec<&str> {
        list.iter().map(|r| r.key()).collect()
    }

    #[test]
    fn test_cap_keeps_most_recent_newest_first() {
        let mut list = Vec::new();
        for n in 0..51 {
            list = upsert_front(list, job(n), JOB_HISTORY_CAPACITY);
        }
        assert_eq!(list.len(), 50);
        assert_eq!(list[0].job_id, "job-50");
        assert_eq!(list[49].job_id, "job-1");
        assert!(!list.iter().any(|r| r.job_id == "job-0"));
    }

    #[test]
    fn test_reinsert_moves_to_front_without_growth() {
        let mut list = Vec::new();
        for n in 0..5 {
            list = upsert_front(list, job(n), JOB_HISTORY_CAPACITY);
        }
        let list = upsert_front(list, job(2), JOB_HISTORY_CAPACITY);
        assert_eq!(keys(&list), vec!["job-2", "job-4", "job-3", "job-1", "job-0"]);
    }

    #[test]
    fn test_reinsert_at_capacity_keeps_length() {
        let mut list = Vec::new();
        for n in 0..50 {
            list = upsert_front(list, job(n), JOB_HISTORY_CAPACITY);
        }
        let list = upsert_front(list, job(0), JOB_HISTORY_CAPACITY);
        assert_eq!(list.len(), 50);
        assert_eq!(list[0].job_id, "job-0");
        assert_eq!(list[49].job_id, "job-1");
    }

    #[test]
    fn test_remove_key_preserves_order() {
        let list = vec![job(3), job(2), job(1)];
        let list = remove_key(list, "job-2");
        assert_eq!(keys(&list), vec!["job-3", "job-1"]);
        let list = remove_key(list, "missing");
        assert_eq!(list.len(), 2);
    }

    fn open_store() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::storage::open_pool(dir.path().join("h.db").to_str().unwrap()).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_persisted_history_roundtrip() {
        let (_dir, pool) = open_store();
        let history = job_history(pool.clone());

        history.upsert_front(job(1)).unwrap();
        history.upsert_front(job(2)).unwrap();
        history.upsert_front(job(1)).unwrap();

        // A fresh handle over the same pool sees the same list.
        let reread = job_history(pool).read_all().unwrap();
        assert_eq!(keys(&reread), vec!["job-1", "job-2"]);

        history.remove_by_key("job-2").unwrap();
        assert_eq!(keys(&history.read_all().unwrap()), vec!["job-1"]);

        history.clear().unwrap();
        assert!(history.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_slot_reads_empty() {
        let (_dir, pool) = open_store();
        let kv = KvStore::new(pool.clone());
        let history = job_history(pool);

        kv.put(JOB_HISTORY_KEY, "{not json").unwrap();
        assert!(history.read_all().unwrap().is_empty());

        kv.put(JOB_HISTORY_KEY, r#"{"job_id":"x"}"#).unwrap();
        assert!(history.read_all().unwrap().is_empty());

        // Writing after corruption starts a fresh list.
        history.upsert_front(job(7)).unwrap();
        assert_eq!(history.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_element_skipped_rest_kept() {
        let (_dir, pool) = open_store();
        let kv = KvStore::new(pool.clone());
        kv.put(
            JOB_HISTORY_KEY,
            r#"[{"job_id":"good","created_at":"2024-04-05T10:00:00Z"},{"oops":true},42]"#,
        )
        .unwrap();

        let list = job_history(pool).read_all().unwrap();
        assert_eq!(keys(&list), vec!["good"]);
    }

    #[test]
    fn test_remember_job_keeps_backend_creation_time() {
        let (_dir, pool) = open_store();
        let history = job_history(pool);
        let created = Utc.timestamp_opt(1_712_300_100, 0).unwrap();

        history.remember_job("job-2", Some(created)).unwrap();
        history.remember_job("job-1", None).unwrap();
        // Re-opening without a backend time keeps the remembered one.
        let list = history.remember_job("job-2", None).unwrap();

        assert_eq!(keys(&list), vec!["job-2", "job-1"]);
        assert_eq!(list[0].created_at, created);

        let later = Utc.timestamp_opt(1_712_300_200, 0).unwrap();
        let list = history.remember_job("job-2", Some(later)).unwrap();
        assert_eq!(list[0].created_at, later);
    }

    #[test]
    fn test_stores_do_not_share_slots() {
        let (_dir, pool) = open_store();
        let jobs = job_history(pool.clone());
        let scenarios = scenario_history(pool);

        jobs.upsert_front(job(1)).unwrap();
        scenarios
            .upsert_front(ScenarioHistoryRecord {
                token: "tok".into(),
                filename: "login.json".into(),
                uploaded_at: Utc::now(),
                origin: ScenarioOrigin::Upload,
            })
            .unwrap();

        assert_eq!(jobs.read_all().unwrap().len(), 1);
        assert_eq!(scenarios.read_all().unwrap().len(), 1);
        assert_eq!(scenarios.capacity(), 20);
        jobs.clear().unwrap();
        assert_eq!(scenarios.read_all().unwrap().len(), 1);
    }
}
