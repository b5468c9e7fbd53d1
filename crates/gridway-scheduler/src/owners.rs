//! Owner table and queue scan.
//!
//! Once per cycle the scheduler walks every job record, rebuilds the
//! per-submitter aggregates, and attributes running-vs-flocked by
//! checking each live match's origin pool. Counts are rebuilt from
//! scratch; flock levels and negotiation timestamps carry forward.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, info};

use gridway_state::{JobRecord, JobStatus, Universe};

use crate::config::SchedulerConfig;
use crate::matches::MatchTable;

/// Per-submitter aggregate, rebuilt every scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRecord {
    pub name: String,
    pub jobs_idle: u32,
    pub jobs_running: u32,
    pub jobs_held: u32,
    /// Jobs running under claims granted by an alternate pool.
    pub jobs_flocked: u32,
    /// How many alternate pools this owner currently solicits.
    pub flock_level: u32,
    pub old_flock_level: u32,
    /// Unix time of the most recent flock-level change or completed
    /// negotiation at the owner's current level.
    pub negotiation_timestamp: u64,
}

impl OwnerRecord {
    fn new(name: &str, now: u64) -> Self {
        Self {
            name: name.to_string(),
            jobs_idle: 0,
            jobs_running: 0,
            jobs_held: 0,
            jobs_flocked: 0,
            flock_level: 0,
            old_flock_level: 0,
            negotiation_timestamp: now,
        }
    }
}

/// Scheduler-level aggregates produced by one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanTotals {
    pub jobs_total: u32,
    pub jobs_idle: u32,
    pub jobs_running: u32,
    pub jobs_held: u32,
    pub jobs_removed: u32,
    pub jobs_flocked: u32,
    pub local_universe_idle: u32,
    pub local_universe_running: u32,
    /// Jobs outside ordinary counting (dedicated + legacy multi-proc).
    pub excluded_jobs: u32,
}

/// Per-submitter aggregates plus flock state, keyed by owner name.
pub struct OwnerTable {
    owners: HashMap<String, OwnerRecord>,
}

impl OwnerTable {
    pub fn new() -> Self {
        Self {
            owners: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&OwnerRecord> {
        self.owners.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OwnerRecord> {
        self.owners.values()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Rebuild all counts from a queue snapshot and the match table.
    ///
    /// Dedicated and legacy multi-proc universes are kept out of the
    /// ordinary per-owner aggregates; local-universe jobs get their own
    /// pair of scheduler-level counters. A match whose origin pool is not
    /// the local one moves its running job from `jobs_running` to
    /// `jobs_flocked`. Owners with no jobs left drop out of the table;
    /// survivors keep their flock state.
    pub fn scan(&mut self, jobs: &[JobRecord], matches: &MatchTable, now: u64) -> ScanTotals {
        let mut totals = ScanTotals::default();
        let mut fresh: HashMap<String, OwnerRecord> = HashMap::new();

        for job in jobs {
            totals.jobs_total += 1;

            match job.universe {
                Universe::Local => {
                    totals.local_universe_running += job.current_hosts;
                    totals.local_universe_idle +=
                        job.max_hosts.saturating_sub(job.current_hosts);
                    continue;
                }
                Universe::Dedicated | Universe::Parallel => {
                    totals.excluded_jobs += 1;
                    continue;
                }
                Universe::Vanilla | Universe::Standard => {}
            }

            let owner = fresh.entry(job.owner.clone()).or_insert_with(|| {
                self.owners
                    .get(&job.owner)
                    .map(|prev| OwnerRecord {
                        jobs_idle: 0,
                        jobs_running: 0,
                        jobs_held: 0,
                        jobs_flocked: 0,
                        ..prev.clone()
                    })
                    .unwrap_or_else(|| OwnerRecord::new(&job.owner, now))
            });

            match job.status {
                JobStatus::Held => {
                    owner.jobs_held += 1;
                    totals.jobs_held += 1;
                }
                JobStatus::Removed => totals.jobs_removed += 1,
                JobStatus::Completed => {}
                JobStatus::Idle | JobStatus::Unexpanded | JobStatus::Running => {
                    let idle = job.max_hosts.saturating_sub(job.current_hosts);
                    owner.jobs_running += job.current_hosts;
                    owner.jobs_idle += idle;
                    totals.jobs_running += job.current_hosts;
                    totals.jobs_idle += idle;
                }
            }
        }

        // Attribute running-vs-flocked: a shadow under a claim from an
        // alternate pool counts against that pool, not ours.
        for rec in matches.iter() {
            if rec.pool.is_some() && rec.shadow_pid.is_some() {
                if let Some(owner) = fresh.get_mut(&rec.owner) {
                    owner.jobs_running = owner.jobs_running.saturating_sub(1);
                    owner.jobs_flocked += 1;
                }
                totals.jobs_running = totals.jobs_running.saturating_sub(1);
                totals.jobs_flocked += 1;
            }
        }

        self.owners = fresh;
        debug!(
            owners = self.owners.len(),
            idle = totals.jobs_idle,
            running = totals.jobs_running,
            flocked = totals.jobs_flocked,
            "queue scan complete"
        );
        totals
    }

    /// Advance flock levels for owners the authority has left waiting.
    ///
    /// An owner with idle jobs whose negotiation timestamp is older than
    /// the escalation threshold climbs one level, bounded by the
    /// configured maximum. Returns the owners that escalated.
    pub fn evolve_flock_levels(
        &mut self,
        threshold_secs: u64,
        max_level: u32,
        now: u64,
    ) -> Vec<String> {
        let mut escalated = Vec::new();
        for owner in self.owners.values_mut() {
            if owner.jobs_idle == 0 || owner.flock_level >= max_level {
                continue;
            }
            if now.saturating_sub(owner.negotiation_timestamp) >= threshold_secs {
                owner.old_flock_level = owner.flock_level;
                owner.flock_level += 1;
                owner.negotiation_timestamp = now;
                info!(
                    owner = %owner.name,
                    level = owner.flock_level,
                    "flock level raised: no fresh negotiation"
                );
                escalated.push(owner.name.clone());
            }
        }
        escalated
    }

    /// Record the end of a negotiation round for one owner.
    ///
    /// A satisfied round settles the owner back down to the negotiating
    /// pool's level; an unsatisfied one climbs a level (bounded). Returns
    /// true when the level went up, which warrants an immediate re-scan.
    pub fn negotiation_finished(
        &mut self,
        name: &str,
        pool_level: u32,
        satisfied: bool,
        max_level: u32,
        now: u64,
    ) -> bool {
        let Some(owner) = self.owners.get_mut(name) else {
            return false;
        };
        owner.negotiation_timestamp = now;
        owner.old_flock_level = owner.flock_level;

        if satisfied {
            if pool_level < owner.flock_level {
                owner.flock_level = pool_level;
                info!(owner = %name, level = pool_level, "flock level settled");
            }
            false
        } else if owner.flock_level < max_level {
            owner.flock_level += 1;
            info!(
                owner = %name,
                level = owner.flock_level,
                "flock level raised: round left jobs unmatched"
            );
            true
        } else {
            false
        }
    }
}

impl Default for OwnerTable {
    fn default() -> Self {
        Self::new()
    }
}

// ── Ad construction ───────────────────────────────────────────────

/// The scheduler-level aggregate ad pushed to each pool's authority.
pub fn schedd_ad(config: &SchedulerConfig, totals: &ScanTotals) -> Value {
    json!({
        "name": config.name,
        "address": config.authority_addr,
        "total_jobs": totals.jobs_total,
        "idle_jobs": totals.jobs_idle,
        "running_jobs": totals.jobs_running,
        "held_jobs": totals.jobs_held,
        "flocked_jobs": totals.jobs_flocked,
        "max_jobs_running": config.max_jobs_running,
    })
}

/// One submitter's ad, replicated to every pool the owner flocks with.
pub fn submitter_ad(config: &SchedulerConfig, owner: &OwnerRecord) -> Value {
    json!({
        "name": format!("{}@{}", owner.name, config.uid_domain),
        "schedd": config.name,
        "idle_jobs": owner.jobs_idle,
        "running_jobs": owner.jobs_running,
        "held_jobs": owner.jobs_held,
        "flocked_jobs": owner.jobs_flocked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matches::test_match;
    use gridway_state::{JobId, JobRecord};

    fn job(cluster: u32, owner: &str, status: JobStatus, universe: Universe) -> JobRecord {
        let mut job = JobRecord::new(JobId::new(cluster, 0), owner, universe);
        job.status = status;
        if status == JobStatus::Running {
            job.current_hosts = 1;
        }
        job
    }

    fn idle(cluster: u32, owner: &str) -> JobRecord {
        job(cluster, owner, JobStatus::Idle, Universe::Vanilla)
    }

    #[test]
    fn scan_counts_by_owner_and_status() {
        let mut table = OwnerTable::new();
        let jobs = vec![
            idle(1, "alice"),
            idle(2, "alice"),
            job(3, "alice", JobStatus::Running, Universe::Vanilla),
            job(4, "alice", JobStatus::Held, Universe::Vanilla),
            idle(5, "bob"),
        ];
        let totals = table.scan(&jobs, &MatchTable::new(), 1000);

        let alice = table.get("alice").unwrap();
        assert_eq!(alice.jobs_idle, 2);
        assert_eq!(alice.jobs_running, 1);
        assert_eq!(alice.jobs_held, 1);
        assert_eq!(table.get("bob").unwrap().jobs_idle, 1);
        assert_eq!(totals.jobs_idle, 3);
        assert_eq!(totals.jobs_running, 1);
        assert_eq!(totals.jobs_total, 5);
    }

    #[test]
    fn scan_is_idempotent_without_queue_mutation() {
        let mut table = OwnerTable::new();
        let jobs = vec![
            idle(1, "alice"),
            job(2, "alice", JobStatus::Running, Universe::Standard),
            idle(3, "bob"),
        ];
        let matches = MatchTable::new();

        let first = table.scan(&jobs, &matches, 1000);
        let alice_first = table.get("alice").unwrap().clone();
        let second = table.scan(&jobs, &matches, 1000);
        let alice_second = table.get("alice").unwrap().clone();

        assert_eq!(first, second);
        assert_eq!(alice_first, alice_second);
    }

    #[test]
    fn excluded_universes_stay_out_of_owner_counts() {
        let mut table = OwnerTable::new();
        let jobs = vec![
            job(1, "alice", JobStatus::Idle, Universe::Dedicated),
            job(2, "alice", JobStatus::Idle, Universe::Parallel),
            job(3, "alice", JobStatus::Idle, Universe::Local),
        ];
        let totals = table.scan(&jobs, &MatchTable::new(), 1000);

        assert!(table.get("alice").is_none());
        assert_eq!(totals.excluded_jobs, 2);
        assert_eq!(totals.local_universe_idle, 1);
    }

    #[test]
    fn flocked_match_moves_running_to_flocked() {
        let mut table = OwnerTable::new();
        let mut matches = MatchTable::new();
        let mut rec = test_match("T", 3, 0);
        rec.pool = Some("east".to_string());
        rec.shadow_pid = Some(4242);
        matches.insert(rec);

        let jobs = vec![
            idle(1, "alice"),
            job(3, "alice", JobStatus::Running, Universe::Vanilla),
        ];
        let totals = table.scan(&jobs, &matches, 1000);

        let alice = table.get("alice").unwrap();
        assert_eq!(alice.jobs_running, 0);
        assert_eq!(alice.jobs_flocked, 1);
        assert_eq!(totals.jobs_flocked, 1);
    }

    #[test]
    fn flock_state_survives_rescan() {
        let mut table = OwnerTable::new();
        let jobs = vec![idle(1, "alice")];
        table.scan(&jobs, &MatchTable::new(), 1000);
        table.negotiation_finished("alice", 1, false, 3, 1000);
        assert_eq!(table.get("alice").unwrap().flock_level, 1);

        table.scan(&jobs, &MatchTable::new(), 2000);
        assert_eq!(table.get("alice").unwrap().flock_level, 1);
    }

    #[test]
    fn stale_owner_with_idle_jobs_escalates() {
        let mut table = OwnerTable::new();
        table.scan(&[idle(1, "alice")], &MatchTable::new(), 1000);

        // Not stale yet.
        assert!(table.evolve_flock_levels(600, 3, 1100).is_empty());
        // Two scan intervals later.
        let escalated = table.evolve_flock_levels(600, 3, 1700);
        assert_eq!(escalated, vec!["alice".to_string()]);
        assert_eq!(table.get("alice").unwrap().flock_level, 1);
        // Timestamp was refreshed; no immediate double escalation.
        assert!(table.evolve_flock_levels(600, 3, 1800).is_empty());
    }

    #[test]
    fn flock_level_stays_within_bounds() {
        let mut table = OwnerTable::new();
        table.scan(&[idle(1, "alice")], &MatchTable::new(), 0);

        for round in 0..10 {
            table.negotiation_finished("alice", 0, false, 2, round);
            let level = table.get("alice").unwrap().flock_level;
            assert!(level <= 2, "level {level} exceeds the configured maximum");
        }
        assert_eq!(table.get("alice").unwrap().flock_level, 2);
    }

    #[test]
    fn satisfied_round_settles_to_pool_level() {
        let mut table = OwnerTable::new();
        table.scan(&[idle(1, "alice")], &MatchTable::new(), 0);
        table.negotiation_finished("alice", 0, false, 3, 1);
        table.negotiation_finished("alice", 1, false, 3, 2);
        assert_eq!(table.get("alice").unwrap().flock_level, 2);

        // Satisfied at the local pool: settle all the way back down.
        let escalated = table.negotiation_finished("alice", 0, true, 3, 3);
        assert!(!escalated);
        assert_eq!(table.get("alice").unwrap().flock_level, 0);
    }

    #[test]
    fn unsatisfied_round_reports_escalation() {
        let mut table = OwnerTable::new();
        table.scan(&[idle(1, "alice")], &MatchTable::new(), 0);
        assert!(table.negotiation_finished("alice", 0, false, 3, 1));
        assert!(!table.negotiation_finished("unknown", 0, false, 3, 1));
    }

    #[test]
    fn ads_carry_the_aggregates() {
        let config = SchedulerConfig::default();
        let mut table = OwnerTable::new();
        let totals = table.scan(&[idle(1, "alice")], &MatchTable::new(), 1000);

        let ad = schedd_ad(&config, &totals);
        assert_eq!(ad["idle_jobs"], 1);
        assert_eq!(ad["name"], "gridway");

        let sub = submitter_ad(&config, table.get("alice").unwrap());
        assert_eq!(sub["name"], "alice@localdomain");
        assert_eq!(sub["idle_jobs"], 1);
    }
}
