//! redb table definitions for the Gridway job store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Job records are keyed `"{cluster}.{proc}"`; the zero-padded
//! cluster component keeps iteration in JobId order.

use redb::TableDefinition;

/// Job records keyed by `{cluster:010}.{proc:06}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");
