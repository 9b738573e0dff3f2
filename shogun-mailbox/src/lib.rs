// shogun-mailbox
//! File-based mailbox for the shogun coordinator.
//!
//! The mailbox is the only cross-process shared mutable resource:
//! external producers drop files into `message_to/`, the watcher
//! claims them into `message_processing/` with an atomic rename, and
//! a monotonic ledger makes every side effect idempotent across
//! crashes.

pub mod error;
pub mod paths;
pub mod restart;
pub mod stem;
pub mod watcher;
pub mod writer;

pub use error::MailboxError;
pub use paths::{ledger_key, parse_tier_path, MailboxAddress, Tier};
pub use restart::{RestartHandler, RestartRequest, RestartWatcher, RestartWatcherConfig};
pub use stem::{format_stem, parse_stem, slugify, ParsedStem};
pub use watcher::{MailboxHandler, MailboxWatcher, MailboxWatcherConfig};
pub use writer::MessageWriter;
