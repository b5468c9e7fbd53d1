//! Shadow invocation contract.
//!
//! The scheduler launches one shadow per running job:
//!
//! ```text
//! <shadow> <keep-alive address> <claimed peer address> <claim token> <cluster> <proc>
//! ```
//!
//! The shadow always terminates with one of the exit codes below, never a
//! raw signal number. The reaper maps codes to job-record transitions;
//! anything outside the taxonomy (including death by signal) is treated
//! as [`ShadowExitCode::Exception`].

use serde::{Deserialize, Serialize};

/// Closed exit-code taxonomy for shadow processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowExitCode {
    /// Job ran to completion.
    Success,
    /// Job was evicted and left a usable checkpoint.
    Checkpointed,
    /// Job was evicted without a checkpoint.
    NotCheckpointed,
    /// Job exited on its own terms (non-zero application exit).
    Exited,
    /// Job was killed outright (hard vacate).
    Killed,
    /// Shadow hit an internal error.
    Exception,
    /// Shadow could not allocate memory.
    NoMemory,
    /// Shadow could not exec the job or itself.
    ExecFailed,
    /// Job must be put on hold.
    Held,
    /// Job must leave the queue.
    Removed,
}

impl ShadowExitCode {
    pub const SUCCESS: i32 = 0;
    pub const EXITED: i32 = 100;
    pub const CHECKPOINTED: i32 = 101;
    pub const NOT_CHECKPOINTED: i32 = 102;
    pub const KILLED: i32 = 103;
    pub const EXCEPTION: i32 = 104;
    pub const NO_MEMORY: i32 = 105;
    pub const EXEC_FAILED: i32 = 106;
    pub const HELD: i32 = 107;
    pub const REMOVED: i32 = 108;

    /// Map a raw process exit to the taxonomy.
    ///
    /// `None` means the process died to a signal, which a conforming
    /// shadow never does voluntarily.
    pub fn from_status(code: Option<i32>) -> Self {
        match code {
            Some(Self::SUCCESS) => ShadowExitCode::Success,
            Some(Self::EXITED) => ShadowExitCode::Exited,
            Some(Self::CHECKPOINTED) => ShadowExitCode::Checkpointed,
            Some(Self::NOT_CHECKPOINTED) => ShadowExitCode::NotCheckpointed,
            Some(Self::KILLED) => ShadowExitCode::Killed,
            Some(Self::EXCEPTION) => ShadowExitCode::Exception,
            Some(Self::NO_MEMORY) => ShadowExitCode::NoMemory,
            Some(Self::EXEC_FAILED) => ShadowExitCode::ExecFailed,
            Some(Self::HELD) => ShadowExitCode::Held,
            Some(Self::REMOVED) => ShadowExitCode::Removed,
            _ => ShadowExitCode::Exception,
        }
    }

    /// Whether this exit increments the owning match's exception counter.
    pub fn is_exception(self) -> bool {
        matches!(self, ShadowExitCode::Exception)
    }
}

/// Build the shadow argv tail: everything after the program path.
pub fn shadow_args(
    keepalive_addr: &str,
    peer_addr: &str,
    token: &str,
    cluster: u32,
    proc: i32,
) -> Vec<String> {
    vec![
        keepalive_addr.to_string(),
        peer_addr.to_string(),
        token.to_string(),
        cluster.to_string(),
        proc.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map() {
        assert_eq!(ShadowExitCode::from_status(Some(0)), ShadowExitCode::Success);
        assert_eq!(
            ShadowExitCode::from_status(Some(101)),
            ShadowExitCode::Checkpointed
        );
        assert_eq!(ShadowExitCode::from_status(Some(107)), ShadowExitCode::Held);
    }

    #[test]
    fn signal_death_and_stray_codes_are_exceptions() {
        assert_eq!(ShadowExitCode::from_status(None), ShadowExitCode::Exception);
        assert_eq!(ShadowExitCode::from_status(Some(1)), ShadowExitCode::Exception);
        assert_eq!(ShadowExitCode::from_status(Some(42)), ShadowExitCode::Exception);
    }

    #[test]
    fn argv_order_is_fixed() {
        let args = shadow_args("<s:1>", "<h:2>", "T#cap", 10, 0);
        assert_eq!(args, vec!["<s:1>", "<h:2>", "T#cap", "10", "0"]);
    }
}
