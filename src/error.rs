use std::io;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, GbpError>;

/// Error taxonomy for the tree engine.
///
/// `Corruption` and `FormatMismatch` are fatal for a tree instance: once observed,
/// the tree transitions to a refusing state and surfaces the same error to every
/// subsequent caller (see [`crate::tree::Tree::poison`]).
#[derive(Debug, Error)]
pub enum GbpError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("page {0} out of bounds")]
    OutOfBounds(u64),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("a writer is already active for this tree")]
    Conflict,
    #[error("tree is open read-only")]
    ReadOnly,
    #[error("on-disk format version {found} is older than the engine's minimum supported version {minimum}; run migration first")]
    FormatMismatch { found: u16, minimum: u16 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("unable to open tree: {0}")]
    UnableToOpen(String),
}

impl GbpError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        GbpError::Corruption(msg.into())
    }

    /// `Cancelled` is never logged as an error; `Corruption`/`FormatMismatch` are fatal
    /// and worth a loud log line the moment they're constructed.
    pub fn log_if_fatal(self) -> Self {
        match &self {
            GbpError::Corruption(msg) => error!(%msg, "tree corruption detected"),
            GbpError::FormatMismatch { found, minimum } => {
                error!(found, minimum, "on-disk format too old, migration required")
            }
            _ => {}
        }
        self
    }
}

pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("tree lock poisoned - fatal error");
        GbpError::Corruption("tree lock poisoned - fatal error".into())
    })
}
