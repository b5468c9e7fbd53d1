//! JobStore — redb-backed job record persistence for Gridway.
//!
//! Provides typed CRUD over job records, a full-queue walk, and a
//! closure-based update that brackets a read-modify-write in one write
//! transaction. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::JOBS;
use crate::types::{JobId, JobRecord};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe job record store backed by redb.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<Database>,
}

impl JobStore {
    /// Open (or create) a persistent job store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "job store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory job store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory job store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or overwrite a job record.
    pub fn put_job(&self, job: &JobRecord) -> StateResult<()> {
        let key = job.table_key();
        let value = serde_json::to_vec(job).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job = %job.id, "job stored");
        Ok(())
    }

    /// Get a job record by id.
    pub fn get_job(&self, id: JobId) -> StateResult<Option<JobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(id.table_key().as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let job: JobRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Read-modify-write one record inside a single write transaction.
    ///
    /// The closure sees the current record and mutates it in place; the
    /// whole update commits atomically, so a crash mid-update never leaves
    /// a half-written record. Returns `NotFound` if the job is gone.
    pub fn update_job<F>(&self, id: JobId, f: F) -> StateResult<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        let key = id.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut job: JobRecord = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(id.to_string())),
            };
            f(&mut job);
            let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            updated = job;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Delete a job record. Returns true if it existed.
    pub fn delete_job(&self, id: JobId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            existed = table
                .remove(id.table_key().as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job = %id, existed, "job deleted");
        Ok(existed)
    }

    /// Walk every job record in id order.
    pub fn walk_jobs(&self) -> StateResult<Vec<JobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job: JobRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(job);
        }
        Ok(results)
    }

    /// All jobs in one cluster, in proc order.
    pub fn jobs_in_cluster(&self, cluster: u32) -> StateResult<Vec<JobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let prefix = format!("{cluster:010}.");
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let job: JobRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(job);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobStatus, Universe};

    fn test_store() -> JobStore {
        JobStore::open_in_memory().unwrap()
    }

    fn test_job(cluster: u32, proc: i32) -> JobRecord {
        JobRecord::new(JobId::new(cluster, proc), "alice", Universe::Vanilla)
    }

    #[test]
    fn put_get_roundtrip() {
        let store = test_store();
        let job = test_job(1, 0);
        store.put_job(&job).unwrap();

        let loaded = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(loaded, job);
    }

    #[test]
    fn get_missing_is_none() {
        let store = test_store();
        assert!(store.get_job(JobId::new(42, 0)).unwrap().is_none());
    }

    #[test]
    fn update_is_atomic_read_modify_write() {
        let store = test_store();
        store.put_job(&test_job(1, 0)).unwrap();

        let updated = store
            .update_job(JobId::new(1, 0), |job| {
                job.status = JobStatus::Running;
                job.current_hosts = 1;
            })
            .unwrap();
        assert_eq!(updated.status, JobStatus::Running);
        assert_eq!(updated.current_hosts, 1);

        let loaded = store.get_job(JobId::new(1, 0)).unwrap().unwrap();
        assert_eq!(loaded, updated);
    }

    #[test]
    fn update_missing_is_not_found() {
        let store = test_store();
        let result = store.update_job(JobId::new(7, 7), |_| {});
        assert!(matches!(result, Err(StateError::NotFound(_))));
    }

    #[test]
    fn delete_reports_existence() {
        let store = test_store();
        store.put_job(&test_job(1, 0)).unwrap();
        assert!(store.delete_job(JobId::new(1, 0)).unwrap());
        assert!(!store.delete_job(JobId::new(1, 0)).unwrap());
    }

    #[test]
    fn walk_returns_all_in_id_order() {
        let store = test_store();
        store.put_job(&test_job(10, 1)).unwrap();
        store.put_job(&test_job(2, 0)).unwrap();
        store.put_job(&test_job(10, 0)).unwrap();

        let jobs = store.walk_jobs().unwrap();
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(
            ids,
            vec![JobId::new(2, 0), JobId::new(10, 0), JobId::new(10, 1)]
        );
    }

    #[test]
    fn cluster_scan_filters_other_clusters() {
        let store = test_store();
        store.put_job(&test_job(1, 0)).unwrap();
        store.put_job(&test_job(1, 1)).unwrap();
        store.put_job(&test_job(2, 0)).unwrap();

        let jobs = store.jobs_in_cluster(1).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.id.cluster == 1));
    }

    #[test]
    fn on_disk_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.redb");
        {
            let store = JobStore::open(&path).unwrap();
            store.put_job(&test_job(5, 0)).unwrap();
        }
        let store = JobStore::open(&path).unwrap();
        assert!(store.get_job(JobId::new(5, 0)).unwrap().is_some());
    }
}
