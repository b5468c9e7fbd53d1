//! The Scheduler aggregate — owns every table and drives the loop.
//!
//! All mutable state (owner, match, shadow tables, the contact and start
//! queues) lives in this one struct and is touched only from `run()`'s
//! single task: one callback finishes before the next starts. Spawned
//! tasks do network I/O or sleep, then report back through the event
//! channel.
//!
//! # Control flow
//!
//! ```text
//! authority connects ─ Owner frame ─► negotiation round ─► ContactRequests
//! contact queue ─► activation tasks ─► ContactFinished events ─► Claimed
//! dispatch (debounced) ─► start queue ─► shadow spawn ─► ShadowRecord
//! reap tick ─► exit taxonomy ─► job transition, claim reuse or release
//! scan tick ─► owner aggregates ─► ad publication, flock evolution
//! ```

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};

use gridway_state::JobStore;
use gridway_wire::{send_oneshot, FrameStream, Message};

use crate::config::SchedulerConfig;
use crate::contact::{activate_claim, alive_interval_for, ActivationOutcome, ContactQueue};
use crate::dispatch::StartRequest;
use crate::error::SchedulerResult;
use crate::matches::{MatchStatus, MatchTable};
use crate::negotiate::{run_session, DedicatedHook, NoDedicated};
use crate::owners::{schedd_ad, submitter_ad, OwnerTable, ScanTotals};
use crate::shadows::ShadowTable;

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Everything spawned tasks report back to the scheduler loop.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// A claim activation finished.
    ContactFinished {
        claim_id: String,
        outcome: ActivationOutcome,
    },
    /// The dispatch debounce delay elapsed.
    DispatchDue,
    /// A negotiation round asked for an immediate re-scan.
    RescanDue,
}

/// The scheduler. See the module docs for the control flow.
pub struct Scheduler {
    pub(crate) config: SchedulerConfig,
    pub(crate) store: JobStore,
    pub(crate) owners: OwnerTable,
    pub(crate) matches: MatchTable,
    pub(crate) shadows: ShadowTable,
    pub(crate) contacts: ContactQueue,
    /// Rate-limited shadow start queue.
    pub(crate) start_queue: VecDeque<StartRequest>,
    /// When the next queued start may fire; `None` while the queue is idle.
    pub(crate) next_start_at: Option<Instant>,
    /// Aggregates from the most recent scan.
    pub(crate) totals: ScanTotals,
    pub(crate) dedicated: Box<dyn DedicatedHook>,
    /// Our keep-alive address, handed to every shadow.
    pub(crate) keepalive_addr: String,
    pub(crate) events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    pub(crate) events_rx: Option<mpsc::UnboundedReceiver<SchedulerEvent>>,
    /// True while a dispatch debounce timer is pending.
    pub(crate) dispatch_pending: bool,
    /// True while a reschedule request is outstanding at the authority.
    pub(crate) reschedule_outstanding: bool,
    /// Latched by a NoMemory shadow exit; declines offers until the next
    /// round begins.
    pub(crate) budget_exhausted: bool,
    /// One operator notification per scheduler lifetime.
    pub(crate) shadow_failure_notified: bool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: JobStore, keepalive_addr: String) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let contacts = ContactQueue::new(config.max_pending_contacts());
        Self {
            config,
            store,
            owners: OwnerTable::new(),
            matches: MatchTable::new(),
            shadows: ShadowTable::new(),
            contacts,
            start_queue: VecDeque::new(),
            next_start_at: None,
            totals: ScanTotals::default(),
            dedicated: Box::new(NoDedicated),
            keepalive_addr,
            events_tx,
            events_rx: Some(events_rx),
            dispatch_pending: false,
            reschedule_outstanding: false,
            budget_exhausted: false,
            shadow_failure_notified: false,
        }
    }

    /// Install a dedicated-subsystem hook.
    pub fn with_dedicated(mut self, hook: Box<dyn DedicatedHook>) -> Self {
        self.dedicated = hook;
        self
    }

    // ── Scan and publication ────────────────────────────────────────

    /// Walk the queue, rebuild owner aggregates, evolve flock levels.
    pub fn count_jobs(&mut self) -> SchedulerResult<ScanTotals> {
        let now = epoch_secs();
        let jobs = self.store.walk_jobs()?;
        let totals = self.owners.scan(&jobs, &self.matches, now);
        self.owners.evolve_flock_levels(
            self.config.flock_escalation_after().as_secs(),
            self.config.max_flock_level(),
            now,
        );
        self.totals = totals;
        Ok(totals)
    }

    /// Push the scheduler ad and every submitter ad, best-effort.
    ///
    /// The scheduler ad goes to every pool any owner currently flocks
    /// with; each submitter ad goes to pools 0..=that owner's level.
    pub fn publish_ads(&self) {
        let io_timeout = self.config.io_timeout();
        let max_level = self
            .owners
            .iter()
            .map(|o| o.flock_level)
            .max()
            .unwrap_or(0);

        let sched_ad = schedd_ad(&self.config, &self.totals);
        for addr in self.config.pools_through_level(max_level) {
            let addr = addr.to_string();
            let ad = sched_ad.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    send_oneshot(&addr, &Message::UpdateScheddAd { ad }, io_timeout).await
                {
                    warn!(%addr, error = %e, "schedd ad publication failed");
                }
            });
        }

        for owner in self.owners.iter() {
            let ad = submitter_ad(&self.config, owner);
            for addr in self.config.pools_through_level(owner.flock_level) {
                let addr = addr.to_string();
                let ad = ad.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        send_oneshot(&addr, &Message::UpdateSubmitterAd { ad }, io_timeout).await
                    {
                        warn!(%addr, error = %e, "submitter ad publication failed");
                    }
                });
            }
        }
    }

    fn scan_and_publish(&mut self) {
        match self.count_jobs() {
            Ok(totals) => {
                self.publish_ads();
                debug!(
                    idle = totals.jobs_idle,
                    running = totals.jobs_running,
                    "scan published"
                );
            }
            Err(e) => error!(error = %e, "queue scan failed"),
        }
    }

    /// Invalidate our ads at every pool we ever advertised to.
    fn publish_invalidations(&self) {
        let io_timeout = self.config.io_timeout();
        let name = self.config.name.clone();
        for addr in self.config.pools_through_level(self.config.max_flock_level()) {
            let addr = addr.to_string();
            let name = name.clone();
            tokio::spawn(async move {
                let msg = Message::InvalidateScheddAd { name: name.clone() };
                let _ = send_oneshot(&addr, &msg, io_timeout).await;
            });
        }
        for owner in self.owners.iter() {
            let name = format!("{}@{}", owner.name, self.config.uid_domain);
            for addr in self.config.pools_through_level(owner.flock_level) {
                let addr = addr.to_string();
                let name = name.clone();
                tokio::spawn(async move {
                    let msg = Message::InvalidateSubmitterAd { name };
                    let _ = send_oneshot(&addr, &msg, io_timeout).await;
                });
            }
        }
    }

    // ── Contact queue ───────────────────────────────────────────────

    /// Drain the contact queue up to the connection ceiling.
    pub(crate) fn drain_contacts(&mut self) {
        let now = epoch_secs();
        while let Some(req) = self.contacts.pop_ready() {
            let Some(rec) = self.matches.get_mut(&req.claim.claim_id) else {
                // Match died while queued (timeout, vacate); slot is free.
                self.contacts.finished();
                continue;
            };
            rec.set_status(MatchStatus::ContactLimbo, now);

            let job_ad = self
                .store
                .get_job(req.job)
                .ok()
                .flatten()
                .and_then(|job| serde_json::to_value(&job).ok())
                .unwrap_or(serde_json::Value::Null);
            let alive =
                alive_interval_for(req.ad.as_ref(), self.config.alive_interval_secs);

            let claim_id = req.claim.claim_id.clone();
            let peer = req.claim.peer.clone();
            let token = req.claim.token.clone();
            let io_timeout = self.config.io_timeout();
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let outcome = activate_claim(peer, token, job_ad, alive, io_timeout).await;
                let _ = tx.send(SchedulerEvent::ContactFinished { claim_id, outcome });
            });
        }
    }

    /// An activation task reported back.
    pub(crate) fn on_contact_finished(&mut self, claim_id: &str, outcome: ActivationOutcome) {
        self.contacts.finished();
        match outcome {
            ActivationOutcome::Activated => {
                if let Some(rec) = self.matches.get_mut(claim_id) {
                    rec.set_status(MatchStatus::Claimed, epoch_secs());
                    info!(claim = %claim_id, peer = %rec.peer, "claim activated");
                }
                self.schedule_dispatch();
            }
            ActivationOutcome::Refused | ActivationOutcome::Unreachable => {
                // The token is void; a fresh grant arrives on a later
                // round if the owner still has demand.
                info!(claim = %claim_id, ?outcome, "activation failed, dropping match");
                self.matches.remove(claim_id);
            }
        }
        // A slot opened up; keep draining.
        self.drain_contacts();
    }

    /// Arm the once-per-burst dispatch debounce.
    pub(crate) fn schedule_dispatch(&mut self) {
        if self.dispatch_pending {
            return;
        }
        self.dispatch_pending = true;
        let delay = self.config.dispatch_debounce();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(SchedulerEvent::DispatchDue);
        });
    }

    // ── Claim lifecycle helpers ─────────────────────────────────────

    /// Give a claim back to its host and drop the record.
    pub(crate) fn relinquish_match(&mut self, claim_id: &str) {
        let Some(rec) = self.matches.remove(claim_id) else {
            return;
        };
        info!(claim = %claim_id, peer = %rec.peer, "relinquishing claim");
        let io_timeout = self.config.io_timeout();
        tokio::spawn(async move {
            let msg = Message::ReleaseClaim { token: rec.token };
            if let Err(e) = send_oneshot(&rec.peer, &msg, io_timeout).await {
                debug!(peer = %rec.peer, error = %e, "release send failed");
            }
        });
    }

    /// Send keep-alives for every live claim.
    pub(crate) fn send_alives(&self) {
        let io_timeout = self.config.io_timeout();
        for rec in self.matches.iter() {
            if !matches!(rec.status, MatchStatus::Claimed | MatchStatus::Active) {
                continue;
            }
            let peer = rec.peer.clone();
            let token = rec.token.clone();
            tokio::spawn(async move {
                let msg = Message::Alive { token };
                if let Err(e) = send_oneshot(&peer, &msg, io_timeout).await {
                    debug!(%peer, error = %e, "alive send failed");
                }
            });
        }
    }

    /// Void matches stuck awaiting activation past the claim timeout.
    pub(crate) fn check_claim_timeouts(&mut self) {
        let now = epoch_secs();
        let deadline = self.config.request_claim_timeout_secs;
        let stale: Vec<String> = self
            .matches
            .iter()
            .filter(|rec| {
                matches!(
                    rec.status,
                    MatchStatus::Unclaimed | MatchStatus::ContactLimbo
                ) && now.saturating_sub(rec.entered_status) > deadline
            })
            .map(|rec| rec.claim_id.clone())
            .collect();
        for claim_id in stale {
            warn!(claim = %claim_id, "activation never completed, voiding match");
            self.matches.remove(&claim_id);
        }
    }

    /// Repair cross-table references: a match pointing at a shadow that
    /// no longer exists loses the link rather than aborting the process.
    pub(crate) fn clean_tables(&mut self) {
        let live_pids: std::collections::HashSet<u32> =
            self.shadows.pids().into_iter().collect();
        for rec in self.matches.iter_mut() {
            if let Some(pid) = rec.shadow_pid
                && !live_pids.contains(&pid)
            {
                warn!(claim = %rec.claim_id, pid, "clearing dangling shadow link");
                rec.shadow_pid = None;
                rec.set_status(MatchStatus::Claimed, epoch_secs());
            }
        }
    }

    /// Ask the authority for a round, at most one request outstanding.
    pub(crate) fn send_reschedule(&mut self) {
        if self.reschedule_outstanding {
            return;
        }
        self.reschedule_outstanding = true;
        let addr = self.config.authority_addr.clone();
        let io_timeout = self.config.io_timeout();
        tokio::spawn(async move {
            if let Err(e) = send_oneshot(&addr, &Message::Reschedule, io_timeout).await {
                debug!(%addr, error = %e, "reschedule send failed");
            }
        });
    }

    /// One operator notification per scheduler lifetime.
    pub(crate) fn notify_shadow_failure(&mut self, detail: &str) {
        if self.shadow_failure_notified {
            return;
        }
        self.shadow_failure_notified = true;
        error!(
            mailbox = %self.config.admin_mailbox,
            detail,
            "shadow spawn failing; notifying operator"
        );
    }

    // ── Preemption ──────────────────────────────────────────────────

    /// Push the live shadow count back under the ceiling.
    ///
    /// First pass per shadow sends a graceful vacate and flags the
    /// record as preempted — the flag goes up before any signal so the
    /// reaper treats the exit as deliberate. A shadow still alive on a
    /// later pass is killed outright.
    pub(crate) fn preempt(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        info!(n, "preempting shadows over the ceiling");
        let io_timeout = self.config.io_timeout();
        let mut pids = self.shadows.pids();
        pids.sort_unstable_by(|a, b| b.cmp(a)); // newest first

        for pid in pids.into_iter().take(n) {
            let Some(rec) = self.shadows.get_mut(pid) else {
                continue;
            };
            if !rec.preempted {
                rec.preempted = true;
                let claim = rec.claim_id.clone();
                if let Some(claim_id) = claim
                    && let Some(mrec) = self.matches.get(&claim_id)
                {
                    let peer = mrec.peer.clone();
                    let token = mrec.token.clone();
                    tokio::spawn(async move {
                        let msg = Message::VacateClaim { token };
                        if let Err(e) = send_oneshot(&peer, &msg, io_timeout).await {
                            debug!(%peer, error = %e, "vacate send failed");
                        }
                    });
                } else if let Some(child) = rec.child.as_mut() {
                    // Local shadow: nothing to vacate remotely.
                    let _ = child.start_kill();
                }
            } else if let Some(child) = rec.child.as_mut() {
                warn!(pid, "shadow ignored vacate, killing");
                let _ = child.start_kill();
            }
        }
    }

    // ── Inbound commands ────────────────────────────────────────────

    async fn handle_connection(&mut self, stream: TcpStream) {
        let mut stream = FrameStream::new(stream).with_read_timeout(self.config.io_timeout());
        let first = match stream.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "dropping bad connection");
                return;
            }
        };

        match first {
            Message::Owner { name, pool } => {
                self.reschedule_outstanding = false;
                if let Err(e) = run_session(self, &mut stream, name, pool).await {
                    warn!(error = %e, "negotiation session aborted");
                }
            }
            Message::ReleaseClaim { token } => {
                // A host (or the authority) telling us the claim is gone.
                let claim_id = token.split('#').next().unwrap_or(&token).to_string();
                if self.matches.remove(&claim_id).is_some() {
                    info!(claim = %claim_id, "claim released by peer");
                }
            }
            Message::Alive { token } => {
                let claim_id = token.split('#').next().unwrap_or(&token).to_string();
                if let Some(rec) = self.matches.get_mut(&claim_id) {
                    rec.entered_status = epoch_secs();
                }
            }
            Message::Reschedule => {
                self.scan_and_publish();
                self.send_reschedule();
            }
            other => {
                debug!(?other, "refusing unexpected command");
            }
        }
    }

    pub(crate) fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::ContactFinished { claim_id, outcome } => {
                self.on_contact_finished(&claim_id, outcome);
            }
            SchedulerEvent::DispatchDue => {
                self.dispatch_pending = false;
                if let Err(e) = self.start_jobs() {
                    error!(error = %e, "dispatch pass failed");
                }
            }
            SchedulerEvent::RescanDue => {
                self.scan_and_publish();
                self.send_reschedule();
            }
        }
    }

    // ── Main loop ───────────────────────────────────────────────────

    /// Drive the scheduler until shutdown.
    pub async fn run(
        mut self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> SchedulerResult<()> {
        info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "scheduler running"
        );

        let Some(mut events_rx) = self.events_rx.take() else {
            return Err(crate::error::SchedulerError::Protocol(
                "event channel already taken".to_string(),
            ));
        };

        let mut scan_tick = interval(self.config.scan_interval());
        let mut start_tick = interval(self.config.job_start_interval());
        let mut alive_tick = interval(self.config.alive_interval());
        let mut reap_tick = interval(self.config.reap_interval());

        loop {
            let next_start = self.next_start_at;
            tokio::select! {
                _ = scan_tick.tick() => {
                    self.scan_and_publish();
                    let over = self
                        .shadows
                        .count()
                        .saturating_sub(self.config.max_jobs_running as usize);
                    self.preempt(over);
                    self.check_claim_timeouts();
                    self.clean_tables();
                }
                _ = start_tick.tick() => {
                    if let Err(e) = self.start_jobs() {
                        error!(error = %e, "periodic dispatch failed");
                    }
                }
                _ = alive_tick.tick() => self.send_alives(),
                _ = reap_tick.tick() => self.reap_exited(),
                _ = async move {
                    match next_start {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.start_next_shadow();
                }
                Some(event) = events_rx.recv() => self.handle_event(event),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => self.handle_connection(stream).await,
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.shutdown_graceful().await;
        Ok(())
    }

    /// Preempt everything, invalidate our ads, and drain.
    async fn shutdown_graceful(&mut self) {
        info!(shadows = self.shadows.count(), "graceful shutdown");
        self.publish_invalidations();
        let all = self.shadows.count();
        self.preempt(all);

        let deadline = Instant::now() + Duration::from_secs(30);
        while self.shadows.count() > 0 && Instant::now() < deadline {
            sleep(self.config.reap_interval()).await;
            self.reap_exited();
            // Anything that ignored the vacate gets the hard kill.
            let remaining = self.shadows.count();
            self.preempt(remaining);
        }
        if self.shadows.count() > 0 {
            warn!(remaining = self.shadows.count(), "shutdown with shadows still live");
        }
    }
}
