//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to spawn shadow: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("job store error: {0}")]
    State(#[from] gridway_state::StateError),

    #[error("wire error: {0}")]
    Wire(#[from] gridway_wire::WireError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
