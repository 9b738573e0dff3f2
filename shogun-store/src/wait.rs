//! Durable wait records for suspended `waitForMessage` turns.
//!
//! One JSON file per (thread, agent) pair under `waits/pending/`. The
//! in-memory rendezvous in the runtime is a shortcut; the record here
//! is what makes a suspended turn survive a crash. A record exists
//! exactly while a suspended turn has not been resumed and cleared.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shogun_core::types::{AgentId, Message};
use tokio::fs;
use tokio::sync::Mutex;

use crate::atomic::write_atomic;
use crate::error::StoreError;

/// Lifecycle of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStatus {
    Pending,
    Received,
    Timeout,
}

/// Metadata of the message whose turn suspended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitOrigin {
    pub message_id: String,
    pub from: AgentId,
    pub to: AgentId,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Persistent suspension state for one (thread, agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitRecord {
    pub status: WaitStatus,
    pub thread_id: String,
    pub agent_id: AgentId,
    pub provider_thread_id: String,
    pub timeout_ms: u64,
    pub origin: WaitOrigin,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_message: Option<Message>,
}

impl WaitRecord {
    /// A fresh pending record.
    pub fn pending(
        thread_id: impl Into<String>,
        agent_id: AgentId,
        provider_thread_id: impl Into<String>,
        timeout_ms: u64,
        origin: WaitOrigin,
    ) -> Self {
        let now = Utc::now();
        Self {
            status: WaitStatus::Pending,
            thread_id: thread_id.into(),
            agent_id,
            provider_thread_id: provider_thread_id.into(),
            timeout_ms,
            origin,
            created_at: now,
            updated_at: now,
            received_at: None,
            received_message: None,
        }
    }
}

/// File-backed store of wait records.
pub struct WaitStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl WaitStore {
    /// `dir` is the pending-records directory, conventionally
    /// `{baseDir}/waits/pending`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, thread_id: &str, agent: &AgentId) -> PathBuf {
        self.dir.join(format!("{thread_id}__{agent}.json"))
    }

    /// Persist (create or replace) a record.
    pub async fn put(&self, record: &WaitRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.record_path(&record.thread_id, &record.agent_id);
        let json = serde_json::to_vec_pretty(record).map_err(StoreError::serialization)?;
        write_atomic(&path, &json, false).await
    }

    /// Load the record for (thread, agent), if present.
    pub async fn get(
        &self,
        thread_id: &str,
        agent: &AgentId,
    ) -> Result<Option<WaitRecord>, StoreError> {
        let path = self.record_path(thread_id, agent);
        match fs::read_to_string(&path).await {
            Ok(raw) => {
                let record = serde_json::from_str(&raw).map_err(StoreError::serialization)?;
                Ok(Some(record))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Transition a pending record to `received`, attaching the
    /// message. Returns the updated record, or `None` when no pending
    /// record exists.
    pub async fn mark_received(
        &self,
        thread_id: &str,
        agent: &AgentId,
        message: Message,
    ) -> Result<Option<WaitRecord>, StoreError> {
        let Some(mut record) = self.get(thread_id, agent).await? else {
            return Ok(None);
        };
        if record.status != WaitStatus::Pending {
            return Ok(None);
        }
        let now = Utc::now();
        record.status = WaitStatus::Received;
        record.updated_at = now;
        record.received_at = Some(now);
        record.received_message = Some(message);
        self.put(&record).await?;
        Ok(Some(record))
    }

    /// Transition a pending record to `timeout`. Returns the updated
    /// record, or `None` when no pending record exists.
    pub async fn mark_timeout(
        &self,
        thread_id: &str,
        agent: &AgentId,
    ) -> Result<Option<WaitRecord>, StoreError> {
        let Some(mut record) = self.get(thread_id, agent).await? else {
            return Ok(None);
        };
        if record.status != WaitStatus::Pending {
            return Ok(None);
        }
        record.status = WaitStatus::Timeout;
        record.updated_at = Utc::now();
        self.put(&record).await?;
        Ok(Some(record))
    }

    /// Delete the record for (thread, agent). Missing is not an error.
    pub async fn clear(&self, thread_id: &str, agent: &AgentId) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.record_path(thread_id, agent);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Every record on disk. Unparseable files are skipped with a
    /// warning.
    pub async fn load_all(&self) -> Result<Vec<WaitRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(raw) => match serde_json::from_str::<WaitRecord>(&raw) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping unparseable wait record");
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to read wait record");
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_origin(message_id: &str) -> WaitOrigin {
        WaitOrigin {
            message_id: message_id.to_string(),
            from: AgentId::Shogun,
            to: AgentId::Karou,
            title: "task".to_string(),
            created_at: Utc::now(),
        }
    }

    fn make_message(id: &str, thread: &str) -> Message {
        Message {
            id: id.to_string(),
            thread_id: thread.to_string(),
            from: AgentId::Ashigaru(1),
            to: AgentId::Karou,
            title: "reply".to_string(),
            body: "done".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_get_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = WaitStore::new(dir.path().join("waits/pending"));

        let record = WaitRecord::pending("t1", AgentId::Karou, "pt-1", 60_000, make_origin("m1"));
        store.put(&record).await.unwrap();

        let loaded = store.get("t1", &AgentId::Karou).await.unwrap().unwrap();
        assert_eq!(loaded.status, WaitStatus::Pending);
        assert_eq!(loaded.timeout_ms, 60_000);
        assert_eq!(loaded.origin.message_id, "m1");

        store.clear("t1", &AgentId::Karou).await.unwrap();
        assert!(store.get("t1", &AgentId::Karou).await.unwrap().is_none());
        // Clearing twice is fine.
        store.clear("t1", &AgentId::Karou).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_received_attaches_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = WaitStore::new(dir.path());

        let record = WaitRecord::pending("t1", AgentId::Karou, "pt-1", 5_000, make_origin("m1"));
        store.put(&record).await.unwrap();

        let updated = store
            .mark_received("t1", &AgentId::Karou, make_message("m2", "t1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, WaitStatus::Received);
        assert_eq!(updated.received_message.as_ref().unwrap().body, "done");
        assert!(updated.received_at.is_some());

        // Already-received records do not transition again.
        assert!(store
            .mark_received("t1", &AgentId::Karou, make_message("m3", "t1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_mark_timeout_only_from_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = WaitStore::new(dir.path());

        assert!(store
            .mark_timeout("t1", &AgentId::Shogun)
            .await
            .unwrap()
            .is_none());

        let record = WaitRecord::pending("t1", AgentId::Shogun, "pt", 1_000, make_origin("m"));
        store.put(&record).await.unwrap();

        let updated = store
            .mark_timeout("t1", &AgentId::Shogun)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, WaitStatus::Timeout);

        assert!(store
            .mark_timeout("t1", &AgentId::Shogun)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_load_all_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = WaitStore::new(dir.path());

        store
            .put(&WaitRecord::pending(
                "t1",
                AgentId::Karou,
                "pt",
                1_000,
                make_origin("m1"),
            ))
            .await
            .unwrap();
        store
            .put(&WaitRecord::pending(
                "t2",
                AgentId::Ashigaru(1),
                "pt",
                1_000,
                make_origin("m2"),
            ))
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("junk.json"), "not json")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("README.txt"), "ignored")
            .await
            .unwrap();

        let records = store.load_all().await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_load_all_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = WaitStore::new(dir.path().join("never-created"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_keyed_per_thread_and_agent() {
        let dir = tempfile::tempdir().unwrap();
        let store = WaitStore::new(dir.path());

        store
            .put(&WaitRecord::pending(
                "t1",
                AgentId::Karou,
                "pt-a",
                1_000,
                make_origin("m1"),
            ))
            .await
            .unwrap();
        store
            .put(&WaitRecord::pending(
                "t1",
                AgentId::Shogun,
                "pt-b",
                1_000,
                make_origin("m2"),
            ))
            .await
            .unwrap();

        let karou = store.get("t1", &AgentId::Karou).await.unwrap().unwrap();
        let shogun = store.get("t1", &AgentId::Shogun).await.unwrap().unwrap();
        assert_eq!(karou.provider_thread_id, "pt-a");
        assert_eq!(shogun.provider_thread_id, "pt-b");
    }
}
