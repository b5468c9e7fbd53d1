//! gridway-scheduler — negotiation, claim lifecycle, and job dispatch.
//!
//! The core of the Gridway daemon: it scans the job queue, negotiates
//! with the matchmaking authority for permission to run jobs on remote
//! hosts, activates granted claims, and spawns/monitors one shadow per
//! running job.
//!
//! # Architecture
//!
//! ```text
//! Scheduler (one task owns all state)
//!   ├── OwnerTable      per-submitter aggregates + flock levels
//!   ├── MatchTable      claim-id → live claim
//!   ├── ShadowTable     pid → running shadow process
//!   ├── ContactQueue    pending claim activations (rate-limited)
//!   ├── NegotiationSession   authority-driven offer protocol
//!   └── Dispatcher      claims → shadows, reaper, start queue
//! ```
//!
//! Spawned tasks only touch the network or sleep; every table mutation
//! happens on the scheduler task, between events.

pub mod config;
pub mod contact;
mod dispatch;
pub mod error;
pub mod matches;
pub mod negotiate;
pub mod owners;
pub mod prio;
pub mod scheduler;
pub mod shadows;

pub use config::{FlockPool, SchedulerConfig};
pub use contact::{ActivationOutcome, ContactRequest};
pub use error::{SchedulerError, SchedulerResult};
pub use matches::{MatchRecord, MatchStatus, MatchTable};
pub use negotiate::{DedicatedHook, NoDedicated};
pub use owners::{OwnerRecord, OwnerTable, ScanTotals};
pub use prio::{build_priority_list, sort_priority_list, PriorityRecord};
pub use scheduler::{Scheduler, SchedulerEvent};
pub use shadows::{ShadowRecord, ShadowTable};
