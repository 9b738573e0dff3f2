// shogun
//! Coordinator facade.
//!
//! [`Coordinator`] assembles the full system (stores, mailbox
//! watcher, restart watcher, agent fleet, event hub) and exposes the
//! boundary operations an external transport needs: thread CRUD,
//! king-message injection, fleet snapshots, stop-all, config fetch,
//! and event subscription.

pub mod coordinator;

pub use coordinator::{Coordinator, CoordinatorError, WatchMode, RESTART_EXIT_CODE};
