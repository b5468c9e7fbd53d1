//! Scheduler configuration.
//!
//! Loaded from TOML by the daemon; every field has a default so a config
//! file only needs to name what it changes. The scheduler itself treats
//! the config as read-only; reconfiguration replaces it and resets (not
//! destroys) the in-memory tables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One alternate pool the scheduler may flock to, in declared order.
/// Level k targets the (k-1)-th entry; level 0 is the local pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlockPool {
    pub name: String,
    /// Authority address of the pool, `host:port`.
    pub addr: String,
}

/// All tunables of the scheduler core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Name this scheduler publishes in its ads.
    pub name: String,
    /// Domain appended to owner names in submitter ads.
    pub uid_domain: String,
    /// Authority address of the local pool, `host:port`.
    pub authority_addr: String,
    /// Alternate pools for flocking, in declared order.
    pub flock_pools: Vec<FlockPool>,
    /// Path to the shadow executable.
    pub shadow_path: PathBuf,
    /// Owner identity reserved for the dedicated subsystem.
    pub dedicated_owner: String,
    /// Where operator notifications go.
    pub admin_mailbox: String,

    /// Global ceiling on live shadow processes.
    pub max_jobs_running: u32,
    /// Optional per-round start budget; `None` = unbounded.
    pub max_starts_per_round: Option<u32>,
    /// Consecutive abnormal exits before a claim is relinquished.
    pub max_exceptions: u32,
    /// Offer every proc of a cluster even after one was rejected.
    pub negotiate_all_jobs_in_cluster: bool,

    /// Queue scan / publication interval, seconds.
    pub scan_interval_secs: u64,
    /// Periodic dispatcher interval, seconds.
    pub job_start_interval_secs: u64,
    /// Fixed delay between consecutive shadow spawns, milliseconds.
    pub job_start_delay_ms: u64,
    /// Once-per-burst delay before dispatch after an activation, ms.
    pub dispatch_debounce_ms: u64,
    /// Keep-alive interval for held claims, seconds.
    pub alive_interval_secs: u64,
    /// Reap / cleanup pass interval, seconds.
    pub reap_interval_secs: u64,
    /// How long a match may sit awaiting activation before it is voided,
    /// seconds.
    pub request_claim_timeout_secs: u64,
    /// Guard timeout for frame reads and one-shot sends, seconds.
    pub io_timeout_secs: u64,

    /// Descriptor budget the activation pipeline may draw from.
    pub max_descriptors: u32,
    /// Descriptors reserved for everything that is not claim activation.
    pub reserved_descriptors: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "gridway".to_string(),
            uid_domain: "localdomain".to_string(),
            authority_addr: "127.0.0.1:9618".to_string(),
            flock_pools: Vec::new(),
            shadow_path: PathBuf::from("/usr/libexec/gridway/gridway-shadow"),
            dedicated_owner: "DedicatedScheduler".to_string(),
            admin_mailbox: "root@localhost".to_string(),
            max_jobs_running: 200,
            max_starts_per_round: None,
            max_exceptions: 5,
            negotiate_all_jobs_in_cluster: false,
            scan_interval_secs: 300,
            job_start_interval_secs: 60,
            job_start_delay_ms: 2000,
            dispatch_debounce_ms: 250,
            alive_interval_secs: 300,
            reap_interval_secs: 2,
            request_claim_timeout_secs: 1800,
            io_timeout_secs: 30,
            max_descriptors: 1024,
            reserved_descriptors: 64,
        }
    }
}

impl SchedulerConfig {
    /// Highest flock level an owner may reach.
    pub fn max_flock_level(&self) -> u32 {
        self.flock_pools.len() as u32
    }

    /// Level of a negotiating pool; `None` is the local pool (level 0).
    /// An unknown pool name negotiates at the owner's current level's
    /// worth of trust: it maps to the maximum, so a satisfied round there
    /// never lowers the owner below a configured pool.
    pub fn pool_level(&self, pool: Option<&str>) -> u32 {
        match pool {
            None => 0,
            Some(name) => self
                .flock_pools
                .iter()
                .position(|p| p.name == name)
                .map(|i| i as u32 + 1)
                .unwrap_or_else(|| self.max_flock_level()),
        }
    }

    /// Authority addresses for levels 0..=level, local pool first.
    pub fn pools_through_level(&self, level: u32) -> Vec<&str> {
        let mut addrs = vec![self.authority_addr.as_str()];
        for pool in self.flock_pools.iter().take(level as usize) {
            addrs.push(pool.addr.as_str());
        }
        addrs
    }

    /// Ceiling on concurrently open activation connections, derived from
    /// the descriptor headroom left after the reserve.
    pub fn max_pending_contacts(&self) -> usize {
        let headroom = self.max_descriptors.saturating_sub(self.reserved_descriptors);
        ((headroom / 2).max(1)) as usize
    }

    /// Elapsed time without fresh negotiation that escalates an owner's
    /// flock level: two scan intervals.
    pub fn flock_escalation_after(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs * 2)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn job_start_interval(&self) -> Duration {
        Duration::from_secs(self.job_start_interval_secs)
    }

    pub fn job_start_delay(&self) -> Duration {
        Duration::from_millis(self.job_start_delay_ms)
    }

    pub fn dispatch_debounce(&self) -> Duration {
        Duration::from_millis(self.dispatch_debounce_ms)
    }

    pub fn alive_interval(&self) -> Duration {
        Duration::from_secs(self.alive_interval_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}
