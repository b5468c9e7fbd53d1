//! Startd contact queue — asynchronous claim activation.
//!
//! Accepted offers are queued here instead of activated inside the
//! negotiation round; the queue drains one request at a time while the
//! number of open activation connections stays below a ceiling derived
//! from descriptor headroom. Each drained request becomes a spawned
//! network task whose result comes back to the scheduler loop as an
//! event; draining is re-triggered by those events, never polled.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use gridway_state::JobId;
use gridway_wire::{connect, ActivationReply, ClaimToken, Message};

/// Peers at or above this protocol version understand the keep-alive
/// interval field of an activation.
pub const MIN_ALIVE_PROTOCOL: u64 = 2;

/// A pending claim activation, created by an accepted offer and consumed
/// by queue drain.
#[derive(Debug, Clone)]
pub struct ContactRequest {
    pub claim: ClaimToken,
    pub owner: String,
    pub job: JobId,
    /// Matched resource description, when the grant carried one.
    pub ad: Option<Value>,
    /// Granting pool; `None` is the local pool.
    pub pool: Option<String>,
    pub is_dedicated: bool,
}

/// How a claim activation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// The host accepted; the claim is live.
    Activated,
    /// The host answered no (or try-again). The token is void either
    /// way: a fresh grant arrives on a later round if demand remains.
    Refused,
    /// Connect, send, or reply failed or timed out.
    Unreachable,
}

/// FIFO of pending activations, rate-limited by live connection count.
pub struct ContactQueue {
    queue: VecDeque<ContactRequest>,
    in_flight: usize,
    max_in_flight: usize,
}

impl ContactQueue {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: 0,
            max_in_flight,
        }
    }

    pub fn enqueue(&mut self, req: ContactRequest) {
        debug!(claim = %req.claim.claim_id, job = %req.job, "contact request queued");
        self.queue.push_back(req);
    }

    /// Take the next request if a connection slot is free.
    pub fn pop_ready(&mut self) -> Option<ContactRequest> {
        if self.in_flight >= self.max_in_flight {
            return None;
        }
        let req = self.queue.pop_front()?;
        self.in_flight += 1;
        Some(req)
    }

    /// An activation finished; its connection slot is free again.
    pub fn finished(&mut self) {
        if self.in_flight == 0 {
            warn!("contact finished with none in flight");
            return;
        }
        self.in_flight -= 1;
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

/// Keep-alive interval to advertise, gated on the peer's declared
/// protocol version in the match ad.
pub fn alive_interval_for(ad: Option<&Value>, interval_secs: u64) -> Option<u64> {
    let version = ad?.get("protocol_version")?.as_u64()?;
    (version >= MIN_ALIVE_PROTOCOL).then_some(interval_secs)
}

/// Drive one claim activation against the claimed host.
///
/// Runs in a spawned task; the scheduler loop learns the outcome through
/// an event. Both the reply read and the connect are bounded by
/// `io_timeout` so a dead host cannot pin a connection slot.
pub async fn activate_claim(
    peer: String,
    token: String,
    job_ad: Value,
    alive_interval: Option<u64>,
    io_timeout: Duration,
) -> ActivationOutcome {
    let mut stream = match connect(&peer, io_timeout).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, error = %e, "activation connect failed");
            return ActivationOutcome::Unreachable;
        }
    };

    let request = Message::ActivateClaim {
        token,
        job: job_ad,
        alive_interval,
    };
    if let Err(e) = stream.send(&request).await {
        warn!(%peer, error = %e, "activation send failed");
        return ActivationOutcome::Unreachable;
    }

    match stream.recv().await {
        Ok(Some(Message::Activation {
            reply: ActivationReply::Ok,
        })) => ActivationOutcome::Activated,
        Ok(Some(Message::Activation { reply })) => {
            debug!(%peer, ?reply, "activation refused");
            ActivationOutcome::Refused
        }
        Ok(other) => {
            warn!(%peer, ?other, "unexpected activation reply");
            ActivationOutcome::Unreachable
        }
        Err(e) => {
            warn!(%peer, error = %e, "activation reply failed");
            ActivationOutcome::Unreachable
        }
    }
}
