//! Protocol messages.
//!
//! One closed enum covers every frame the scheduler sends or receives:
//! the authority-driven negotiation round, claim activation against an
//! execution host, relinquish/vacate and keep-alive one-shots, and
//! best-effort ad publication. Consumption sites match exhaustively; an
//! unexpected opcode in a given state is a protocol error, not a panic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reply to an activate-claim request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReply {
    Ok,
    NotOk,
    TryAgain,
}

/// Every frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Message {
    // ── Negotiation (authority → scheduler) ─────────────────────────
    /// Begin (or continue with) a round for one submitter. `pool` names
    /// the negotiating pool; `None` is the local pool.
    Owner {
        name: String,
        pool: Option<String>,
    },
    /// The authority wants the next job offer.
    SendJobInfo,
    /// Permission to claim a host. The grant embeds the peer address and
    /// the capability token: `"<host:port> id#seq"`.
    Permission {
        grant: String,
    },
    /// Permission plus the matched resource's attribute record.
    PermissionAndAd {
        grant: String,
        ad: Value,
    },
    /// The last offer was rejected.
    Rejected,
    /// The last offer was rejected, with a diagnostic.
    RejectedWithReason {
        reason: String,
    },
    /// The round is over for this submitter.
    EndNegotiate,

    // ── Negotiation (scheduler → authority) ─────────────────────────
    /// One job offer: the job's attribute record.
    JobInfo {
        ad: Value,
    },
    /// Nothing (more) to offer, or capacity reached.
    NoMoreJobs,

    // ── Claim activation (scheduler → execution host) ───────────────
    /// Activate a claim. `alive_interval` is included only when the peer
    /// declared a protocol version that understands it.
    ActivateClaim {
        token: String,
        job: Value,
        alive_interval: Option<u64>,
    },
    /// The host's answer to an activation.
    Activation {
        reply: ActivationReply,
    },

    // ── Claim lifecycle one-shots (either direction, no reply) ──────
    /// Give a claim back / notify that a claim is gone.
    ReleaseClaim {
        token: String,
    },
    /// Ask the host to evict the running job gracefully (checkpoint
    /// first if the job supports it). Preemption sends this before
    /// resorting to a hard kill.
    VacateClaim {
        token: String,
    },
    /// Keep-alive for a held claim.
    Alive {
        token: String,
    },
    /// Ask for a negotiation round as soon as possible.
    Reschedule,

    // ── Ad publication (scheduler → authority, best-effort) ─────────
    UpdateScheddAd {
        ad: Value,
    },
    UpdateSubmitterAd {
        ad: Value,
    },
    InvalidateScheddAd {
        name: String,
    },
    InvalidateSubmitterAd {
        name: String,
    },
}
