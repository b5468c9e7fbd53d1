//! Match table — one record per currently held resource claim.
//!
//! A match is born when the authority grants permission, limps through
//! activation, and dies on relinquish, activation failure, or too many
//! shadow exceptions. The link to a running shadow is a nullable pid
//! resolved through the shadow table, never an owning reference; either
//! side may outlive the other.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use gridway_state::JobId;

/// Lifecycle of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    /// Granted, not yet handed to the contact queue.
    Unclaimed,
    /// Activation request in flight; awaiting the host's reply.
    ContactLimbo,
    /// Host accepted the activation; claim is live.
    Claimed,
    /// A shadow is running a job under this claim.
    Active,
}

/// One claim against a remote execution host.
#[derive(Debug, Clone)]
pub struct MatchRecord {
    /// Unique capability key (token prefix before `#`).
    pub claim_id: String,
    /// Full capability token, passed through verbatim.
    pub token: String,
    /// Address of the claimed host.
    pub peer: String,
    pub owner: String,
    /// Cluster the granting offer came from.
    pub orig_cluster: u32,
    /// Bound job; `proc == -1` means any job in `orig_cluster`.
    pub job: JobId,
    /// Granting pool; `None` is the local pool.
    pub pool: Option<String>,
    pub status: MatchStatus,
    /// Unix timestamp (seconds) the current status was entered.
    pub entered_status: u64,
    /// Consecutive abnormal shadow exits under this claim.
    pub num_exceptions: u32,
    /// Pid of the shadow currently running under this claim, if any.
    pub shadow_pid: Option<u32>,
    /// Matched resource's attribute record, when the grant carried one.
    pub ad: Option<Value>,
    pub is_dedicated: bool,
}

impl MatchRecord {
    pub fn set_status(&mut self, status: MatchStatus, now: u64) {
        self.status = status;
        self.entered_status = now;
    }

    /// Whether this claim is bound to one proc or floats over a cluster.
    pub fn is_cluster_scoped(&self) -> bool {
        self.job.proc < 0
    }
}

/// Claim-id → MatchRecord, with a job-id index for `AlreadyMatched`
/// style lookups.
#[derive(Default)]
pub struct MatchTable {
    by_claim: HashMap<String, MatchRecord>,
    by_job: HashMap<JobId, String>,
}

impl MatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new match. Refuses a duplicate claim-id: claim-ids are
    /// unique across the table by invariant.
    pub fn insert(&mut self, rec: MatchRecord) -> bool {
        if self.by_claim.contains_key(&rec.claim_id) {
            return false;
        }
        if rec.job.proc >= 0 {
            self.by_job.insert(rec.job, rec.claim_id.clone());
        }
        debug!(claim = %rec.claim_id, peer = %rec.peer, job = %rec.job, "match added");
        self.by_claim.insert(rec.claim_id.clone(), rec);
        true
    }

    pub fn get(&self, claim_id: &str) -> Option<&MatchRecord> {
        self.by_claim.get(claim_id)
    }

    pub fn get_mut(&mut self, claim_id: &str) -> Option<&mut MatchRecord> {
        self.by_claim.get_mut(claim_id)
    }

    /// The claim a job is bound to, if any.
    pub fn find_by_job(&self, job: JobId) -> Option<&MatchRecord> {
        self.by_job.get(&job).and_then(|id| self.by_claim.get(id))
    }

    /// Rebind a match to a concrete job, keeping the job index straight.
    pub fn set_job(&mut self, claim_id: &str, job: JobId) {
        if let Some(rec) = self.by_claim.get_mut(claim_id) {
            if rec.job.proc >= 0 {
                self.by_job.remove(&rec.job);
            }
            rec.job = job;
            if job.proc >= 0 {
                self.by_job.insert(job, claim_id.to_string());
            }
        }
    }

    /// Remove a match. All deletions go through here so the job index
    /// never dangles; the caller owns clearing the shadow side.
    pub fn remove(&mut self, claim_id: &str) -> Option<MatchRecord> {
        let rec = self.by_claim.remove(claim_id)?;
        if self.by_job.get(&rec.job).map(String::as_str) == Some(claim_id) {
            self.by_job.remove(&rec.job);
        }
        debug!(claim = %claim_id, job = %rec.job, "match removed");
        Some(rec)
    }

    pub fn len(&self) -> usize {
        self.by_claim.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_claim.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatchRecord> {
        self.by_claim.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MatchRecord> {
        self.by_claim.values_mut()
    }

    /// Claim-ids currently in the table (for two-phase mutation passes).
    pub fn claim_ids(&self) -> Vec<String> {
        self.by_claim.keys().cloned().collect()
    }
}

#[cfg(test)]
pub(crate) fn test_match(claim_id: &str, cluster: u32, proc: i32) -> MatchRecord {
    MatchRecord {
        claim_id: claim_id.to_string(),
        token: format!("{claim_id}#nonce"),
        peer: "10.0.0.7:9618".to_string(),
        owner: "alice".to_string(),
        orig_cluster: cluster,
        job: JobId::new(cluster, proc),
        pool: None,
        status: MatchStatus::Unclaimed,
        entered_status: 0,
        num_exceptions: 0,
        shadow_pid: None,
        ad: None,
        is_dedicated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_claim_id_is_refused() {
        let mut table = MatchTable::new();
        assert!(table.insert(test_match("T", 1, 0)));
        assert!(!table.insert(test_match("T", 2, 0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn job_index_tracks_bound_procs_only() {
        let mut table = MatchTable::new();
        table.insert(test_match("A", 1, 0));
        table.insert(test_match("B", 2, -1));

        assert!(table.find_by_job(JobId::new(1, 0)).is_some());
        assert!(table.find_by_job(JobId::new(2, -1)).is_none());
    }

    #[test]
    fn rebinding_moves_the_index() {
        let mut table = MatchTable::new();
        table.insert(test_match("A", 5, -1));
        table.set_job("A", JobId::new(5, 3));

        assert_eq!(
            table.find_by_job(JobId::new(5, 3)).unwrap().claim_id,
            "A"
        );
        assert!(!table.get("A").unwrap().is_cluster_scoped());
    }

    #[test]
    fn remove_clears_the_index() {
        let mut table = MatchTable::new();
        table.insert(test_match("A", 1, 0));
        let rec = table.remove("A").unwrap();
        assert_eq!(rec.claim_id, "A");
        assert!(table.find_by_job(JobId::new(1, 0)).is_none());
        assert!(table.remove("A").is_none());
    }

    #[test]
    fn set_status_stamps_the_transition() {
        let mut rec = test_match("A", 1, 0);
        rec.set_status(MatchStatus::Claimed, 1234);
        assert_eq!(rec.status, MatchStatus::Claimed);
        assert_eq!(rec.entered_status, 1234);
    }
}
