use thiserror::Error;

/// Errors surfaced by the worker API. Each variant is terminal for the
/// operation that raised it; nothing is retried internally.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("no job with handle {0} found")]
    NotFound(String),

    #[error("failed to spawn job process: {0}")]
    SpawnFailed(String),

    #[error("output file error: {0}")]
    Filesystem(String),

    #[error("cgroup operation failed: {0}")]
    Cgroup(String),

    #[error("error reading process stat: {0}")]
    ProcRead(String),

    #[error("failed to signal process: {0}")]
    Signal(String),

    #[error("file watcher error: {0}")]
    Watcher(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
