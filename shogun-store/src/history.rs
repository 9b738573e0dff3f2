//! Per-thread delivery history.
//!
//! Each thread owns an append-only `messages.jsonl` under
//! `history/{threadId}/`. The single writer appends one JSON object
//! per line; reads tolerate (and deduplicate) repeated ids, first
//! entry wins.

use std::path::{Path, PathBuf};

use shogun_core::types::Message;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::StoreError;

/// Append-only JSONL log of delivered messages, one file per thread.
pub struct HistoryStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_path(&self, thread_id: &str) -> PathBuf {
        self.root.join(thread_id).join("messages.jsonl")
    }

    /// Append one delivered message to the thread's log.
    pub async fn append(&self, message: &Message) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.log_path(&message.thread_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(message).map_err(StoreError::serialization)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// All delivered messages for a thread, in append order.
    ///
    /// Unparseable lines are skipped with a warning; duplicate ids are
    /// collapsed to their first occurrence.
    pub async fn list(&self, thread_id: &str) -> Result<Vec<Message>, StoreError> {
        let path = self.log_path(thread_id);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut seen = std::collections::HashSet::new();
        let mut messages = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => {
                    if seen.insert(message.id.clone()) {
                        messages.push(message);
                    }
                }
                Err(err) => {
                    tracing::warn!(thread_id, error = %err, "skipping unparseable history line");
                }
            }
        }
        Ok(messages)
    }

    /// Find one message by id within a thread.
    pub async fn find(
        &self,
        thread_id: &str,
        message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let messages = self.list(thread_id).await?;
        Ok(messages.into_iter().find(|m| m.id == message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shogun_core::types::AgentId;

    fn make_message(id: &str, thread: &str) -> Message {
        Message {
            id: id.to_string(),
            thread_id: thread.to_string(),
            from: AgentId::King,
            to: AgentId::Shogun,
            title: "task".to_string(),
            body: "body".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());

        store.append(&make_message("m1", "t1")).await.unwrap();
        store.append(&make_message("m2", "t1")).await.unwrap();
        store.append(&make_message("m3", "t2")).await.unwrap();

        let t1 = store.list("t1").await.unwrap();
        assert_eq!(t1.len(), 2);
        assert_eq!(t1[0].id, "m1");
        assert_eq!(t1[1].id, "m2");

        let t2 = store.list("t2").await.unwrap();
        assert_eq!(t2.len(), 1);
    }

    #[tokio::test]
    async fn test_list_missing_thread_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        assert!(store.list("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ids_collapse_to_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());

        let mut first = make_message("dup", "t1");
        first.body = "original".to_string();
        let mut second = make_message("dup", "t1");
        second.body = "replay".to_string();

        store.append(&first).await.unwrap();
        store.append(&second).await.unwrap();

        let listed = store.list("t1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].body, "original");
    }

    #[tokio::test]
    async fn test_unparseable_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        store.append(&make_message("ok", "t1")).await.unwrap();

        let path = dir.path().join("t1").join("messages.jsonl");
        let mut raw = tokio::fs::read_to_string(&path).await.unwrap();
        raw.push_str("{broken\n");
        tokio::fs::write(&path, raw).await.unwrap();

        let listed = store.list("t1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "ok");
    }

    #[tokio::test]
    async fn test_find_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        store.append(&make_message("m1", "t1")).await.unwrap();
        store.append(&make_message("m2", "t1")).await.unwrap();

        let found = store.find("t1", "m2").await.unwrap().unwrap();
        assert_eq!(found.id, "m2");
        assert!(store.find("t1", "m9").await.unwrap().is_none());
    }
}
