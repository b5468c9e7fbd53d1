//! Negotiation session — the authority-driven protocol.
//!
//! The authority opens one connection and drives rounds over it: an
//! `Owner` frame names the submitter, then the offer loop runs op by op
//! (`SendJobInfo`, `Permission[AndAd]`, `Rejected[WithReason]`,
//! `EndNegotiate`). Offers follow the priority list's total order.
//! Accepted grants are queued for asynchronous activation, never
//! activated inside the round. Any read or write failure aborts the
//! round with no mid-round retry; requests already queued stay queued.

use std::collections::HashSet;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use gridway_state::JobStore;
use gridway_wire::{ClaimToken, FrameStream, Message};

use crate::contact::ContactRequest;
use crate::error::{SchedulerError, SchedulerResult};
use crate::matches::{MatchRecord, MatchStatus};
use crate::prio::{build_priority_list, PriorityRecord};
use crate::scheduler::{epoch_secs, Scheduler, SchedulerEvent};

/// Seam for the dedicated subsystem.
///
/// A round whose owner matches the reserved dedicated identity is handed
/// here before any queue scan happens. The default implementation has no
/// jobs to offer, so the round is declined politely.
pub trait DedicatedHook: Send {
    /// Jobs the dedicated subsystem wants offered this round.
    fn runnable_jobs(&mut self, store: &JobStore) -> Vec<PriorityRecord>;
}

/// Default hook: the dedicated subsystem is not wired in.
pub struct NoDedicated;

impl DedicatedHook for NoDedicated {
    fn runnable_jobs(&mut self, _store: &JobStore) -> Vec<PriorityRecord> {
        Vec::new()
    }
}

/// Why the offer loop stopped.
enum RoundEnd {
    /// We ran out of jobs and said so.
    Exhausted,
    /// A capacity guard declined; the connection stays usable.
    Declined,
    /// The authority ended the round.
    Ended,
}

/// Drive one connection's worth of negotiation.
///
/// The first `Owner` frame was already read by the command dispatcher;
/// subsequent rounds on the same connection arrive as further `Owner`
/// frames until the authority closes.
pub(crate) async fn run_session<S>(
    sched: &mut Scheduler,
    stream: &mut FrameStream<S>,
    owner: String,
    pool: Option<String>,
) -> SchedulerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_round(sched, stream, &owner, &pool).await?;
    loop {
        match stream.recv().await? {
            None => return Ok(()),
            Some(Message::Owner { name, pool }) => {
                negotiate_round(sched, stream, &name, &pool).await?;
            }
            // A stray round terminator after our own NoMoreJobs.
            Some(Message::EndNegotiate) => continue,
            Some(other) => {
                return Err(SchedulerError::Protocol(format!(
                    "unexpected {other:?} between rounds"
                )));
            }
        }
    }
}

/// One round for one submitter.
async fn negotiate_round<S>(
    sched: &mut Scheduler,
    stream: &mut FrameStream<S>,
    owner: &str,
    pool: &Option<String>,
) -> SchedulerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let now = epoch_secs();
    let pool_level = sched.config.pool_level(pool.as_deref());
    let is_dedicated = owner == sched.config.dedicated_owner;
    info!(%owner, ?pool, is_dedicated, "negotiation round started");

    // A new round gets a fresh look at the resource budget.
    sched.budget_exhausted = false;

    let list = if is_dedicated {
        sched.dedicated.runnable_jobs(&sched.store)
    } else {
        let jobs = sched.store.walk_jobs()?;
        build_priority_list(&jobs, owner)
    };

    let mut jobs_offered: u32 = 0;
    let mut jobs_started: u32 = 0;
    let mut any_rejection = false;
    let mut rejected_clusters: HashSet<u32> = HashSet::new();
    let mut end = RoundEnd::Exhausted;

    'records: for rec in &list {
        if sched.matches.find_by_job(rec.id).is_some() {
            debug!(job = %rec.id, "already matched, skipping");
            continue;
        }
        if rejected_clusters.contains(&rec.id.cluster)
            && !rec.universe.negotiates_per_proc()
            && !sched.config.negotiate_all_jobs_in_cluster
        {
            continue;
        }
        // Re-read the record: the snapshot may have gone stale mid-round.
        let Some(job) = sched.store.get_job(rec.id)? else {
            continue;
        };
        if !job.status.is_runnable() || job.current_hosts >= job.max_hosts {
            continue;
        }

        let mut hosts = job.current_hosts;
        let mut offered_this_job = false;
        while hosts < job.max_hosts {
            match stream.expect().await? {
                Message::SendJobInfo => {
                    let budget_spent = sched
                        .config
                        .max_starts_per_round
                        .is_some_and(|budget| jobs_started >= budget);
                    if !sched.can_spawn_shadow() || sched.budget_exhausted || budget_spent {
                        info!(
                            jobs_started,
                            "capacity reached, declining further offers"
                        );
                        stream.send(&Message::NoMoreJobs).await?;
                        end = RoundEnd::Declined;
                        break 'records;
                    }
                    let ad = serde_json::to_value(&job)
                        .map_err(|e| SchedulerError::Protocol(e.to_string()))?;
                    stream.send(&Message::JobInfo { ad }).await?;
                    if !offered_this_job {
                        jobs_offered += 1;
                        offered_this_job = true;
                    }
                    debug!(job = %rec.id, "offered");
                }
                Message::Permission { grant } => {
                    if accept_grant(sched, &grant, None, rec, pool, is_dedicated)? {
                        jobs_started += 1;
                    }
                    hosts += 1;
                }
                Message::PermissionAndAd { grant, ad } => {
                    if accept_grant(sched, &grant, Some(ad), rec, pool, is_dedicated)? {
                        jobs_started += 1;
                    }
                    hosts += 1;
                }
                Message::Rejected => {
                    record_rejection(sched, rec, None, now);
                    any_rejection = true;
                    if !rec.universe.negotiates_per_proc()
                        && !sched.config.negotiate_all_jobs_in_cluster
                    {
                        rejected_clusters.insert(rec.id.cluster);
                    }
                    continue 'records;
                }
                Message::RejectedWithReason { reason } => {
                    record_rejection(sched, rec, Some(reason), now);
                    any_rejection = true;
                    if !rec.universe.negotiates_per_proc()
                        && !sched.config.negotiate_all_jobs_in_cluster
                    {
                        rejected_clusters.insert(rec.id.cluster);
                    }
                    continue 'records;
                }
                Message::EndNegotiate => {
                    end = RoundEnd::Ended;
                    break 'records;
                }
                other => {
                    return Err(SchedulerError::Protocol(format!(
                        "unexpected {other:?} in offer loop"
                    )));
                }
            }
        }
    }

    if matches!(end, RoundEnd::Exhausted) {
        stream.send(&Message::NoMoreJobs).await?;
    }

    info!(
        %owner,
        offered = jobs_offered,
        started = jobs_started,
        rejected = any_rejection,
        "negotiation round finished"
    );

    if !is_dedicated {
        let satisfied = !any_rejection && jobs_started >= jobs_offered;
        let escalated = sched.owners.negotiation_finished(
            owner,
            pool_level,
            satisfied,
            sched.config.max_flock_level(),
            now,
        );
        if escalated {
            let _ = sched.events_tx.send(SchedulerEvent::RescanDue);
        }
    }

    // Activation happens outside the round, through the rate-limited
    // queue; kick the drain now that the round is over.
    sched.drain_contacts();
    Ok(())
}

/// Turn a permission grant into a match record and a contact request.
///
/// Accepting counts as "started" no matter how activation later goes; a
/// grant whose claim-id collides with a live match is dropped instead.
fn accept_grant(
    sched: &mut Scheduler,
    grant: &str,
    ad: Option<Value>,
    rec: &PriorityRecord,
    pool: &Option<String>,
    is_dedicated: bool,
) -> SchedulerResult<bool> {
    let claim = ClaimToken::parse(grant)?;
    debug!(claim = %claim.claim_id, peer = %claim.peer, job = %rec.id, "grant received");

    let mrec = MatchRecord {
        claim_id: claim.claim_id.clone(),
        token: claim.token.clone(),
        peer: claim.peer.clone(),
        owner: rec.owner.clone(),
        orig_cluster: rec.id.cluster,
        job: rec.id,
        pool: pool.clone(),
        status: MatchStatus::Unclaimed,
        entered_status: epoch_secs(),
        num_exceptions: 0,
        shadow_pid: None,
        ad: ad.clone(),
        is_dedicated,
    };
    if !sched.matches.insert(mrec) {
        warn!(claim = %claim.claim_id, "duplicate claim id in grant, dropping");
        return Ok(false);
    }

    sched.contacts.enqueue(ContactRequest {
        claim,
        owner: rec.owner.clone(),
        job: rec.id,
        ad,
        pool: pool.clone(),
        is_dedicated,
    });
    Ok(true)
}

/// Stamp the rejection on the job record; failures here are not worth
/// aborting the round over.
fn record_rejection(sched: &Scheduler, rec: &PriorityRecord, reason: Option<String>, now: u64) {
    let reason = reason.unwrap_or_else(|| "rejected by authority".to_string());
    info!(job = %rec.id, %reason, "offer rejected");
    sched.with_job(rec.id, |job| {
        job.reject_reason = Some(reason);
        job.reject_time = Some(now);
    });
}
