//! Crate-wide error taxonomy (§7, §9).
//!
//! A `thiserror`-derived enum at every library boundary, with the binary
//! entry point converting into `anyhow::Error` at the very top.

use thiserror::Error;

pub type JoshuaResult<T> = Result<T, JoshuaError>;

#[derive(Debug, Error, Clone)]
pub enum JoshuaError {
    #[error("store error: {0}")]
    Store(String),

    #[error("ensemble {0} not found")]
    EnsembleNotFound(String),

    #[error("claim lost: another agent or stealer now owns this seed")]
    ClaimLost,

    #[error("run timed out after {0}s")]
    Timeout(u64),

    #[error("sanity ensemble failed: {0}")]
    SanityFailure(String),

    #[error("failed to clean up child process tree: {0}")]
    FatalChildCleanup(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("tarball error: {0}")]
    Tarball(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for JoshuaError {
    fn from(e: std::io::Error) -> Self {
        JoshuaError::Io(e.to_string())
    }
}

impl From<sled::Error> for JoshuaError {
    fn from(e: sled::Error) -> Self {
        JoshuaError::Store(e.to_string())
    }
}

/// `true` for errors the run loop folds into a structured `JoshuaError`
/// XML payload instead of propagating (§7 propagation policy).
pub fn crosses_run_boundary(err: &JoshuaError) -> bool {
    matches!(
        err,
        JoshuaError::Store(_) | JoshuaError::ClaimLost | JoshuaError::Timeout(_)
    )
}

/// `true` for errors that are agent-fatal: the agent logs an
/// agent-failure entry (§3 `/failures/...`) and exits so the pool manager
/// can replace it.
pub fn is_agent_fatal(err: &JoshuaError) -> bool {
    matches!(
        err,
        JoshuaError::SanityFailure(_) | JoshuaError::FatalChildCleanup(_)
    )
}
