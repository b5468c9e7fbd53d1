//! gridway-wire — external interfaces of the Gridway scheduler.
//!
//! Everything that crosses a process boundary lives here:
//!
//! - [`frame`] — the framed codec: 4-byte big-endian length prefix, then
//!   one JSON-encoded [`Message`]. Reads are bounded by a timeout so a
//!   misbehaving peer cannot stall the scheduler mid-frame.
//! - [`messages`] — the negotiation, claim-activation, relinquish,
//!   keep-alive, and ad-publication opcodes as one closed tagged enum.
//! - [`claim`] — capability-token parsing (the token embeds the claimed
//!   host's address).
//! - [`exit`] — the shadow invocation contract: argument order and the
//!   closed exit-code taxonomy.

pub mod claim;
pub mod error;
pub mod exit;
pub mod frame;
pub mod messages;

pub use claim::ClaimToken;
pub use error::{WireError, WireResult};
pub use exit::ShadowExitCode;
pub use frame::{connect, send_oneshot, FrameStream};
pub use messages::{ActivationReply, Message};
