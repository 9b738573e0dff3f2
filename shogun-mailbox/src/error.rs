//! Mailbox errors.

use std::path::PathBuf;

/// Errors produced by the mailbox layer.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] shogun_store::StoreError),

    #[error("Filesystem watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Path is outside the mailbox grammar: {0}")]
    BadPath(PathBuf),

    #[error("Handler failed: {0}")]
    Handler(String),
}
