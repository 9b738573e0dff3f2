// shogun-store
//! Persistent stores for the shogun coordinator.
//!
//! Every store owns its own single-writer serialization: callers
//! `await` a save to observe durability, and each file is written via
//! temp-and-rename (ledger and state keep a `.bak` of the previous
//! version) so a crash mid-write loses at most the in-flight update.

pub mod atomic;
pub mod error;
pub mod history;
pub mod ledger;
pub mod state;
pub mod wait;

pub use error::StoreError;
pub use history::HistoryStore;
pub use ledger::{Ledger, LedgerEntry, LedgerStatus};
pub use state::StateStore;
pub use wait::{WaitOrigin, WaitRecord, WaitStatus, WaitStore};
