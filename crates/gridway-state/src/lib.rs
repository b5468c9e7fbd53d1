//! gridway-state — embedded job record store for Gridway.
//!
//! Backed by [redb](https://docs.rs/redb), holds the persistent queue of
//! job records the scheduler negotiates and dispatches from.
//!
//! # Architecture
//!
//! Job records are JSON-serialized into redb's `&[u8]` value column, keyed
//! by `"{cluster}.{proc}"`. The store exposes typed CRUD, a full-queue
//! walk, and a closure-based `update_job` that brackets a read-modify-write
//! of one record in a single write transaction, so a multi-attribute
//! update either lands whole or not at all.
//!
//! The `JobStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::JobStore;
pub use types::*;
