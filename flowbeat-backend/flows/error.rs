use std::io;

use super::history::RunStatus;

/// Errors from the flow store.
///
/// `Db`, `Io` and `Task` are infrastructure failures. `InvalidTransition`
/// means a caller tried to move a run record backwards or out of a terminal
/// state, which is a bug in the caller.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid flow: {0}")]
    Validation(String),

    #[error("invalid run transition for {run_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
}
