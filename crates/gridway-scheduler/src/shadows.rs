//! Shadow table — one record per live proxy process.
//!
//! A shadow represents a submitted job's execution session. The record
//! holds the child-process handle; exits are collected by a deferred
//! reap pass (`collect_exited`) rather than in a signal context, so exit
//! handling always runs inside the scheduler's single-threaded loop.

use std::collections::HashMap;

use tokio::process::Child;
use tracing::{debug, warn};

use gridway_state::JobId;

/// One live shadow process.
#[derive(Debug)]
pub struct ShadowRecord {
    pub pid: u32,
    pub job: JobId,
    /// Claim this shadow runs under; `None` for local-universe jobs.
    pub claim_id: Option<String>,
    /// Address of the claimed host, for logging and vacates.
    pub peer: Option<String>,
    /// Set before the scheduler signals the process, so the reaper can
    /// tell a deliberate preemption from a natural death.
    pub preempted: bool,
    /// Set when the job was removed while the shadow was running.
    pub removed: bool,
    /// The child handle; `None` only in tests that never spawned.
    pub child: Option<Child>,
}

/// Pid- and job-indexed map of shadow records.
#[derive(Default)]
pub struct ShadowTable {
    by_pid: HashMap<u32, ShadowRecord>,
    by_job: HashMap<JobId, u32>,
}

impl ShadowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record. Refuses a second shadow for the same job: one
    /// JobId binds to at most one shadow (legacy multi-proc clusters
    /// key theirs at proc 0, which this check then covers).
    pub fn insert(&mut self, rec: ShadowRecord) -> bool {
        if self.by_job.contains_key(&rec.job) {
            warn!(job = %rec.job, "refusing second shadow for job");
            return false;
        }
        debug!(pid = rec.pid, job = %rec.job, "shadow record added");
        self.by_job.insert(rec.job, rec.pid);
        self.by_pid.insert(rec.pid, rec);
        true
    }

    pub fn get(&self, pid: u32) -> Option<&ShadowRecord> {
        self.by_pid.get(&pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut ShadowRecord> {
        self.by_pid.get_mut(&pid)
    }

    pub fn find_by_job(&self, job: JobId) -> Option<&ShadowRecord> {
        self.by_job.get(&job).and_then(|pid| self.by_pid.get(pid))
    }

    pub fn find_by_job_mut(&mut self, job: JobId) -> Option<&mut ShadowRecord> {
        let pid = *self.by_job.get(&job)?;
        self.by_pid.get_mut(&pid)
    }

    /// Remove a record, keeping the job index straight.
    pub fn remove(&mut self, pid: u32) -> Option<ShadowRecord> {
        let rec = self.by_pid.remove(&pid)?;
        if self.by_job.get(&rec.job) == Some(&pid) {
            self.by_job.remove(&rec.job);
        }
        debug!(pid, job = %rec.job, "shadow record removed");
        Some(rec)
    }

    /// Live shadow count — the quantity the running-process ceiling
    /// bounds.
    pub fn count(&self) -> usize {
        self.by_pid.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShadowRecord> {
        self.by_pid.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ShadowRecord> {
        self.by_pid.values_mut()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.by_pid.keys().copied().collect()
    }

    /// Non-blocking sweep for exited children.
    ///
    /// Returns `(pid, exit_code)` pairs; `None` as the code means the
    /// process died to a signal. Records are left in place so the caller
    /// can consult flags (preempted/removed) before removing them.
    pub fn collect_exited(&mut self) -> Vec<(u32, Option<i32>)> {
        let mut exited = Vec::new();
        for rec in self.by_pid.values_mut() {
            let Some(child) = rec.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => exited.push((rec.pid, status.code())),
                Ok(None) => {}
                Err(e) => {
                    warn!(pid = rec.pid, error = %e, "wait on shadow failed");
                    exited.push((rec.pid, None));
                }
            }
        }
        exited
    }
}

#[cfg(test)]
pub(crate) fn test_shadow(pid: u32, cluster: u32, proc: i32, claim: Option<&str>) -> ShadowRecord {
    ShadowRecord {
        pid,
        job: JobId::new(cluster, proc),
        claim_id: claim.map(|c| c.to_string()),
        peer: claim.map(|_| "10.0.0.7:9618".to_string()),
        preempted: false,
        removed: false,
        child: None,
    }
}
