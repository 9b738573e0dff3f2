//! Store errors.

use std::path::PathBuf;

/// Errors produced by the persistent stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store file corrupt (and no usable backup): {path}")]
    Corrupt { path: PathBuf },

    #[error("Unknown thread: {0}")]
    UnknownThread(String),
}

impl StoreError {
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }
}
