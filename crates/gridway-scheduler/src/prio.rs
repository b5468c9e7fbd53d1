//! Priority list — the offer order for one negotiation round.
//!
//! Rebuilt from a queue snapshot at the start of every round and
//! discarded at round end; it only ever decides the order in which jobs
//! are offered to the authority.

use gridway_state::{JobId, JobRecord, JobStatus, Universe};

/// Snapshot of one runnable job, taken at round start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityRecord {
    pub id: JobId,
    pub owner: String,
    pub priority: i32,
    pub qdate: u64,
    pub has_checkpoint: bool,
    pub status: JobStatus,
    pub universe: Universe,
}

impl PriorityRecord {
    fn from_job(job: &JobRecord) -> Self {
        Self {
            id: job.id,
            owner: job.owner.clone(),
            priority: job.priority,
            qdate: job.qdate,
            has_checkpoint: job.has_checkpoint,
            status: job.status,
            universe: job.universe,
        }
    }
}

/// Build the sorted offer list for one owner from a queue snapshot.
///
/// Only runnable jobs in universes the ordinary negotiation path handles
/// are included; Local jobs never need a claim and Dedicated jobs belong
/// to the dedicated subsystem.
pub fn build_priority_list(jobs: &[JobRecord], owner: &str) -> Vec<PriorityRecord> {
    let mut list: Vec<PriorityRecord> = jobs
        .iter()
        .filter(|job| job.owner == owner)
        .filter(|job| job.status.is_runnable() && job.current_hosts < job.max_hosts)
        .filter(|job| !matches!(job.universe, Universe::Local | Universe::Dedicated))
        .map(PriorityRecord::from_job)
        .collect();
    sort_priority_list(&mut list);
    list
}

/// Offer order: priority descending, checkpointed before not, earliest
/// submission first, then ascending job id as the deterministic tie-break.
pub fn sort_priority_list(list: &mut [PriorityRecord]) {
    list.sort_by_key(|rec| {
        (
            std::cmp::Reverse(rec.priority),
            !rec.has_checkpoint,
            rec.qdate,
            rec.id,
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(cluster: u32, proc: i32, priority: i32, qdate: u64, ckpt: bool) -> JobRecord {
        let mut job = JobRecord::new(JobId::new(cluster, proc), "alice", Universe::Standard);
        job.status = JobStatus::Idle;
        job.priority = priority;
        job.qdate = qdate;
        job.has_checkpoint = ckpt;
        job
    }

    #[test]
    fn priority_descends_first() {
        let jobs = vec![job(1, 0, 1, 10, false), job(2, 0, 5, 99, false)];
        let list = build_priority_list(&jobs, "alice");
        assert_eq!(list[0].id, JobId::new(2, 0));
    }

    #[test]
    fn checkpoint_beats_submit_time() {
        let jobs = vec![job(1, 0, 0, 10, false), job(2, 0, 0, 99, true)];
        let list = build_priority_list(&jobs, "alice");
        assert_eq!(list[0].id, JobId::new(2, 0));
    }

    #[test]
    fn earlier_submission_wins_within_checkpoint_class() {
        let jobs = vec![job(1, 0, 0, 99, true), job(2, 0, 0, 10, true)];
        let list = build_priority_list(&jobs, "alice");
        assert_eq!(list[0].id, JobId::new(2, 0));
    }

    #[test]
    fn job_id_tie_break_is_stable_across_rebuilds() {
        // Equal priority, checkpoint state, and qdate: ascending id, and
        // reproducibly so from any input permutation.
        let a = job(10, 1, 3, 50, false);
        let b = job(10, 0, 3, 50, false);
        let c = job(9, 7, 3, 50, false);

        for perm in [
            vec![a.clone(), b.clone(), c.clone()],
            vec![c.clone(), a.clone(), b.clone()],
            vec![b.clone(), c.clone(), a.clone()],
        ] {
            let list = build_priority_list(&perm, "alice");
            let ids: Vec<JobId> = list.iter().map(|r| r.id).collect();
            assert_eq!(
                ids,
                vec![JobId::new(9, 7), JobId::new(10, 0), JobId::new(10, 1)]
            );
        }
    }

    #[test]
    fn non_runnable_and_foreign_jobs_excluded() {
        let mut held = job(1, 0, 0, 0, false);
        held.status = JobStatus::Held;
        let mut running = job(2, 0, 0, 0, false);
        running.status = JobStatus::Running;
        running.current_hosts = 1;
        let mut local = job(3, 0, 0, 0, false);
        local.universe = Universe::Local;
        let mut bobs = job(4, 0, 0, 0, false);
        bobs.owner = "bob".to_string();

        let jobs = vec![held, running, local, bobs, job(5, 0, 0, 0, false)];
        let list = build_priority_list(&jobs, "alice");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, JobId::new(5, 0));
    }
}
