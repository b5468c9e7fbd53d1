//! Dispatcher — turns live claims into running shadows, and reaps them.
//!
//! One algorithm covers both claim scopes: a match bound to a proc runs
//! that proc; a match whose bound job is gone (or was never pinned,
//! `proc == -1`) scans its cluster for the highest-priority runnable
//! proc. A claim with no work left is released immediately — idle claims
//! are never held.
//!
//! Spawns go through a rate-limited start queue with a fixed inter-start
//! delay so a burst of activations cannot fork a storm of shadows at
//! once. Exits are collected by the deferred reap pass and mapped
//! through the exit-code taxonomy onto job-record transitions.

use std::cmp::Reverse;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use gridway_state::{JobId, JobRecord, JobStatus, StateError, Universe};
use gridway_wire::{exit::shadow_args, ShadowExitCode};

use crate::error::SchedulerResult;
use crate::matches::MatchStatus;
use crate::scheduler::{epoch_secs, Scheduler};
use crate::shadows::ShadowRecord;

/// One pending shadow spawn, waiting in the rate-limited start queue.
#[derive(Debug, Clone)]
pub(crate) struct StartRequest {
    pub job: JobId,
    pub universe: Universe,
    /// `None` for local-universe jobs.
    pub claim_id: Option<String>,
    pub peer: Option<String>,
    pub token: Option<String>,
}

/// Whether this job could start right now.
fn is_dispatchable(job: &JobRecord) -> bool {
    job.status.is_runnable()
        && job.current_hosts < job.max_hosts
        && !matches!(job.universe, Universe::Dedicated)
}

/// Shadow-table key for a job: legacy multi-proc clusters share one
/// shadow keyed at proc 0.
fn shadow_key(job: JobId, universe: Universe) -> JobId {
    if universe == Universe::Parallel {
        JobId::new(job.cluster, 0)
    } else {
        job
    }
}

impl Scheduler {
    /// Room left under the running-process ceiling, counting spawns
    /// already committed to the start queue.
    pub(crate) fn can_spawn_shadow(&self) -> bool {
        self.shadows.count() + self.start_queue.len()
            < self.config.max_jobs_running as usize
    }

    /// Find work for every claim that has none, release the rest.
    pub(crate) fn start_jobs(&mut self) -> SchedulerResult<()> {
        for claim_id in self.matches.claim_ids() {
            let Some(rec) = self.matches.get(&claim_id) else {
                continue;
            };
            if rec.is_dedicated
                || rec.shadow_pid.is_some()
                || rec.status != MatchStatus::Claimed
            {
                continue;
            }
            if self
                .start_queue
                .iter()
                .any(|req| req.claim_id.as_deref() == Some(claim_id.as_str()))
            {
                continue;
            }

            let Some(job) = self.find_runnable_job_for_claim(&claim_id)? else {
                debug!(claim = %claim_id, "claim out of jobs, relinquishing");
                self.relinquish_match(&claim_id);
                continue;
            };

            // Legacy multi-proc: procs after the first share the running
            // shadow instead of spawning another.
            if job.universe == Universe::Parallel
                && let Some(existing) =
                    self.shadows.find_by_job(shadow_key(job.id, job.universe))
            {
                let pid = existing.pid;
                self.matches.set_job(&claim_id, job.id);
                if let Some(mrec) = self.matches.get_mut(&claim_id) {
                    mrec.shadow_pid = Some(pid);
                    mrec.set_status(MatchStatus::Active, epoch_secs());
                }
                self.mark_job_running(job.id);
                continue;
            }

            if !self.can_spawn_shadow() {
                debug!("running-process ceiling reached, deferring dispatch");
                break;
            }

            self.matches.set_job(&claim_id, job.id);
            self.mark_job_running(job.id);
            let (peer, token) = match self.matches.get(&claim_id) {
                Some(mrec) => (Some(mrec.peer.clone()), Some(mrec.token.clone())),
                None => (None, None),
            };
            self.start_queue.push_back(StartRequest {
                job: job.id,
                universe: job.universe,
                claim_id: Some(claim_id),
                peer,
                token,
            });
            self.arm_start_timer();
        }

        self.start_local_jobs()?;
        Ok(())
    }

    /// The job this claim should run next, if any.
    ///
    /// Bound proc first; otherwise the highest-priority runnable proc in
    /// the claim's origin cluster (priority desc, submit time asc,
    /// proc asc), skipping jobs already matched elsewhere or shadowed.
    pub(crate) fn find_runnable_job_for_claim(
        &self,
        claim_id: &str,
    ) -> SchedulerResult<Option<JobRecord>> {
        let Some(rec) = self.matches.get(claim_id) else {
            return Ok(None);
        };

        if rec.job.proc >= 0
            && let Some(job) = self.store.get_job(rec.job)?
            && is_dispatchable(&job)
        {
            return Ok(Some(job));
        }

        let mut candidates: Vec<JobRecord> = self
            .store
            .jobs_in_cluster(rec.orig_cluster)?
            .into_iter()
            .filter(is_dispatchable)
            .filter(|job| !matches!(job.universe, Universe::Local))
            .filter(|job| match self.matches.find_by_job(job.id) {
                Some(other) => other.claim_id == claim_id,
                None => true,
            })
            .filter(|job| {
                job.universe == Universe::Parallel
                    || self.shadows.find_by_job(job.id).is_none()
            })
            .collect();
        candidates.sort_by_key(|job| (Reverse(job.priority), job.qdate, job.id));
        Ok(candidates.into_iter().next())
    }

    /// Queue starts for idle local-universe jobs (no claim involved).
    pub(crate) fn start_local_jobs(&mut self) -> SchedulerResult<()> {
        let jobs = self.store.walk_jobs()?;
        for job in jobs {
            if job.universe != Universe::Local || !is_dispatchable(&job) {
                continue;
            }
            if self.shadows.find_by_job(job.id).is_some()
                || self.start_queue.iter().any(|req| req.job == job.id)
            {
                continue;
            }
            if !self.can_spawn_shadow() {
                break;
            }
            self.mark_job_running(job.id);
            self.start_queue.push_back(StartRequest {
                job: job.id,
                universe: Universe::Local,
                claim_id: None,
                peer: None,
                token: None,
            });
            self.arm_start_timer();
        }
        Ok(())
    }

    fn arm_start_timer(&mut self) {
        if self.next_start_at.is_none() {
            self.next_start_at = Some(tokio::time::Instant::now());
        }
    }

    /// Spawn the next queued shadow, then re-arm the inter-start delay.
    pub(crate) fn start_next_shadow(&mut self) {
        let Some(req) = self.start_queue.pop_front() else {
            self.next_start_at = None;
            return;
        };

        match self.spawn_shadow(&req) {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                let srec = ShadowRecord {
                    pid,
                    job: shadow_key(req.job, req.universe),
                    claim_id: req.claim_id.clone(),
                    peer: req.peer.clone(),
                    preempted: false,
                    removed: false,
                    child: Some(child),
                };
                if self.shadows.insert(srec) {
                    if let Some(claim_id) = &req.claim_id
                        && let Some(mrec) = self.matches.get_mut(claim_id)
                    {
                        mrec.shadow_pid = Some(pid);
                        mrec.set_status(MatchStatus::Active, epoch_secs());
                    }
                    info!(job = %req.job, pid, "shadow spawned");
                }
            }
            Err(e) => {
                warn!(job = %req.job, error = %e, "shadow spawn failed");
                self.with_job(req.job, |job| {
                    job.current_hosts = 0;
                    job.status = if job.has_checkpoint {
                        JobStatus::Idle
                    } else {
                        JobStatus::Unexpanded
                    };
                });
                if let Some(claim_id) = &req.claim_id {
                    self.relinquish_match(claim_id);
                }
                self.notify_shadow_failure(&e.to_string());
            }
        }

        self.next_start_at = if self.start_queue.is_empty() {
            None
        } else {
            Some(tokio::time::Instant::now() + self.config.job_start_delay())
        };
    }

    fn spawn_shadow(&self, req: &StartRequest) -> std::io::Result<Child> {
        let peer = req.peer.as_deref().unwrap_or("<local>");
        let token = req.token.as_deref().unwrap_or("-");
        let args = shadow_args(
            &self.keepalive_addr,
            peer,
            token,
            req.job.cluster,
            req.job.proc,
        );
        Command::new(&self.config.shadow_path).args(args).spawn()
    }

    // ── Reaping ─────────────────────────────────────────────────────

    /// Collect every exited shadow and apply its transition.
    pub(crate) fn reap_exited(&mut self) {
        for (pid, code) in self.shadows.collect_exited() {
            self.handle_shadow_exit(pid, code);
        }
    }

    /// Map one shadow exit onto the job record and the owning claim.
    pub(crate) fn handle_shadow_exit(&mut self, pid: u32, code: Option<i32>) {
        let Some(srec) = self.shadows.remove(pid) else {
            return;
        };
        let universe = self
            .store
            .get_job(srec.job)
            .ok()
            .flatten()
            .map(|job| job.universe)
            .unwrap_or(Universe::Vanilla);

        let exit = if srec.preempted {
            // We asked for this exit; success path regardless of how the
            // process actually died.
            if universe == Universe::Standard {
                ShadowExitCode::Checkpointed
            } else {
                ShadowExitCode::NotCheckpointed
            }
        } else {
            ShadowExitCode::from_status(code)
        };
        info!(pid, job = %srec.job, ?exit, preempted = srec.preempted, "shadow exited");

        match exit {
            ShadowExitCode::Success | ShadowExitCode::Exited => {
                self.flush_job(srec.job, JobStatus::Completed);
            }
            ShadowExitCode::Checkpointed => {
                self.with_job(srec.job, |job| {
                    job.has_checkpoint = true;
                    job.current_hosts = 0;
                    job.status = JobStatus::Idle;
                });
            }
            ShadowExitCode::NotCheckpointed | ShadowExitCode::Killed => {
                self.with_job(srec.job, |job| {
                    job.has_checkpoint = false;
                    job.current_hosts = 0;
                    job.status = JobStatus::Unexpanded;
                });
            }
            ShadowExitCode::NoMemory => {
                self.budget_exhausted = true;
                self.stop_job_in_place(srec.job);
            }
            ShadowExitCode::ExecFailed | ShadowExitCode::Exception => {
                self.stop_job_in_place(srec.job);
            }
            ShadowExitCode::Held => {
                self.with_job(srec.job, |job| {
                    job.current_hosts = 0;
                    job.status = JobStatus::Held;
                });
            }
            ShadowExitCode::Removed => {
                self.flush_job(srec.job, JobStatus::Removed);
            }
        }

        if let Some(claim_id) = srec.claim_id {
            self.settle_claim_after_exit(&claim_id, exit);
        }
        self.schedule_dispatch();
    }

    /// Claim bookkeeping after its shadow exited.
    ///
    /// An exception bumps the counter and releases the claim at the
    /// threshold; an exec failure releases outright; anything else keeps
    /// the claim and floats it back over the whole cluster for reuse.
    fn settle_claim_after_exit(&mut self, claim_id: &str, exit: ShadowExitCode) {
        let now = epoch_secs();
        let mut release = false;
        let mut refloat: Option<u32> = None;

        if let Some(rec) = self.matches.get_mut(claim_id) {
            rec.shadow_pid = None;
            if exit.is_exception() {
                rec.num_exceptions += 1;
                warn!(
                    claim = %claim_id,
                    exceptions = rec.num_exceptions,
                    "shadow exception under claim"
                );
                if rec.num_exceptions >= self.config.max_exceptions {
                    release = true;
                } else {
                    rec.set_status(MatchStatus::Claimed, now);
                }
            } else if exit == ShadowExitCode::ExecFailed {
                release = true;
            } else {
                rec.num_exceptions = 0;
                rec.set_status(MatchStatus::Claimed, now);
                refloat = Some(rec.orig_cluster);
            }
        }

        if release {
            self.relinquish_match(claim_id);
        } else if let Some(cluster) = refloat {
            self.matches.set_job(claim_id, JobId::new(cluster, -1));
        }
    }

    /// Return a job to the queue without touching its checkpoint state.
    fn stop_job_in_place(&self, id: JobId) {
        self.with_job(id, |job| {
            job.current_hosts = 0;
            job.status = if job.has_checkpoint {
                JobStatus::Idle
            } else {
                JobStatus::Unexpanded
            };
        });
    }

    /// Terminal transition: stamp the final status, then flush the
    /// record from the store.
    fn flush_job(&self, id: JobId, status: JobStatus) {
        self.with_job(id, |job| job.status = status);
        match self.store.delete_job(id) {
            Ok(_) => debug!(job = %id, ?status, "job record flushed"),
            Err(e) => warn!(job = %id, error = %e, "flush failed"),
        }
    }

    pub(crate) fn mark_job_running(&self, id: JobId) {
        self.with_job(id, |job| {
            job.status = JobStatus::Running;
            job.current_hosts = (job.current_hosts + 1).min(job.max_hosts);
        });
    }

    /// Apply an update, tolerating a record that was removed meanwhile.
    pub(crate) fn with_job<F: FnOnce(&mut JobRecord)>(&self, id: JobId, f: F) {
        match self.store.update_job(id, f) {
            Ok(_) | Err(StateError::NotFound(_)) => {}
            Err(e) => warn!(job = %id, error = %e, "job update failed"),
        }
    }
}
