//! Domain types for the Gridway job store.
//!
//! These types represent the persisted state of queued jobs. All types
//! are serializable to/from JSON for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Job identity ──────────────────────────────────────────────────

/// Stable identity of a queued job: submission cluster plus proc index.
///
/// A `proc` of `-1` never appears on a stored record; it is used by match
/// records to mean "any job in this cluster".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub cluster: u32,
    pub proc: i32,
}

impl JobId {
    pub fn new(cluster: u32, proc: i32) -> Self {
        Self { cluster, proc }
    }

    /// Table key for this job. Zero-padded so redb iterates in id order.
    pub fn table_key(&self) -> String {
        format!("{:010}.{:06}", self.cluster, self.proc)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cluster, self.proc)
    }
}

// ── Status / universe ─────────────────────────────────────────────

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Never ran; no checkpoint exists yet.
    Unexpanded,
    /// Runnable; may carry a checkpoint from a previous eviction.
    Idle,
    Running,
    Removed,
    Completed,
    Held,
}

impl JobStatus {
    /// Whether a job in this state can be offered to the authority.
    pub fn is_runnable(self) -> bool {
        matches!(self, JobStatus::Unexpanded | JobStatus::Idle)
    }
}

/// Execution model a job requires. Controls which counting and dispatch
/// path applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Universe {
    /// Ordinary single-host job.
    Vanilla,
    /// Checkpointable single-host job.
    Standard,
    /// Legacy multi-proc: all procs of a cluster share one shadow keyed
    /// at proc 0, and each proc is negotiated individually.
    Parallel,
    /// Runs on the scheduler host itself; shadow with no match.
    Local,
    /// Owned by the dedicated subsystem; excluded from ordinary counting.
    Dedicated,
}

impl Universe {
    /// Universes counted in the ordinary per-owner aggregates.
    pub fn ordinary_counting(self) -> bool {
        matches!(self, Universe::Vanilla | Universe::Standard)
    }

    /// Whether a rejection of one proc blocks the rest of the cluster.
    pub fn negotiates_per_proc(self) -> bool {
        matches!(self, Universe::Parallel)
    }
}

// ── Job record ────────────────────────────────────────────────────

/// One queued job. Created on submission, mutated by negotiation,
/// dispatch, and the reaper, destroyed on completion-flush or removal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub owner: String,
    pub status: JobStatus,
    pub universe: Universe,
    /// Submitter-assigned priority; higher runs first.
    pub priority: i32,
    /// Unix timestamp (seconds) of submission.
    pub qdate: u64,
    /// Hosts currently running this job.
    pub current_hosts: u32,
    /// Hosts this job wants.
    pub max_hosts: u32,
    /// True once an eviction left a usable checkpoint behind.
    pub has_checkpoint: bool,
    /// Most recent negotiation rejection, if any.
    pub reject_reason: Option<String>,
    /// Unix timestamp (seconds) of the most recent rejection.
    pub reject_time: Option<u64>,
    /// Where completion notices go; defaults to the owner.
    pub notify_user: Option<String>,
}

impl JobRecord {
    /// A fresh record as the submission tooling would write it.
    pub fn new(id: JobId, owner: &str, universe: Universe) -> Self {
        Self {
            id,
            owner: owner.to_string(),
            status: JobStatus::Unexpanded,
            universe,
            priority: 0,
            qdate: 0,
            current_hosts: 0,
            max_hosts: 1,
            has_checkpoint: false,
            reject_reason: None,
            reject_time: None,
            notify_user: None,
        }
    }

    pub fn table_key(&self) -> String {
        self.id.table_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_key_orders_by_id() {
        let a = JobId::new(9, 5).table_key();
        let b = JobId::new(10, 0).table_key();
        let c = JobId::new(10, 1).table_key();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn runnable_states() {
        assert!(JobStatus::Idle.is_runnable());
        assert!(JobStatus::Unexpanded.is_runnable());
        assert!(!JobStatus::Running.is_runnable());
        assert!(!JobStatus::Held.is_runnable());
        assert!(!JobStatus::Removed.is_runnable());
        assert!(!JobStatus::Completed.is_runnable());
    }

    #[test]
    fn counting_classification() {
        assert!(Universe::Vanilla.ordinary_counting());
        assert!(Universe::Standard.ordinary_counting());
        assert!(!Universe::Parallel.ordinary_counting());
        assert!(!Universe::Local.ordinary_counting());
        assert!(!Universe::Dedicated.ordinary_counting());
    }

    #[test]
    fn display_is_cluster_dot_proc() {
        assert_eq!(JobId::new(10, 0).to_string(), "10.0");
    }
}
