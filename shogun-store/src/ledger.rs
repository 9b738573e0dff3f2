//! Idempotency ledger for the file queues.
//!
//! One ledger per queue family (mailbox, restart). Keys are the
//! pending-relative path of the original file; values carry a
//! rank-monotonic status. The watcher consults the ledger before every
//! side-effecting step, so re-processing a file after a crash repeats
//! no completed work.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::atomic::{read_with_backup, write_atomic};
use crate::error::StoreError;

/// Processing progress for one queue file. Rank never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Message appended to the history log.
    History,
    /// Application handler ran to completion.
    JobDone,
    /// File archived out of the processing tier.
    Done,
}

impl LedgerStatus {
    pub fn rank(&self) -> u8 {
        match self {
            Self::History => 0,
            Self::JobDone => 1,
            Self::Done => 2,
        }
    }
}

/// One persisted ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub status: LedgerStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    entries: BTreeMap<String, LedgerEntry>,
}

/// Append-only monotonic status map, persisted as JSON.
pub struct Ledger {
    path: PathBuf,
    inner: Mutex<LedgerFile>,
}

impl Ledger {
    /// Open a ledger at `path`, loading existing entries. A corrupt
    /// primary falls back to `.bak`; neither existing starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = read_with_backup(&path, |raw| {
            serde_json::from_str::<LedgerFile>(raw).map_err(StoreError::serialization)
        })
        .await?
        .unwrap_or_default();
        Ok(Self {
            path,
            inner: Mutex::new(file),
        })
    }

    /// Raise the status for `key` to `status`.
    ///
    /// Returns `true` when the entry changed. An update that does not
    /// raise the rank is a no-op, so callers may mark unconditionally.
    pub async fn mark(&self, key: &str, status: LedgerStatus) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.entries.get(key) {
            if existing.status.rank() >= status.rank() {
                return Ok(false);
            }
        }
        inner.entries.insert(
            key.to_string(),
            LedgerEntry {
                status,
                updated_at: Utc::now(),
            },
        );
        self.persist(&inner).await?;
        Ok(true)
    }

    /// Current status for `key`, if any.
    pub async fn status(&self, key: &str) -> Option<LedgerStatus> {
        self.inner.lock().await.entries.get(key).map(|e| e.status)
    }

    /// Whether `key` has reached at least `status`.
    pub async fn reached(&self, key: &str, status: LedgerStatus) -> bool {
        self.status(key)
            .await
            .map(|s| s.rank() >= status.rank())
            .unwrap_or(false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, file: &LedgerFile) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(file).map_err(StoreError::serialization)?;
        write_atomic(&self.path, &json, true).await
    }
}
