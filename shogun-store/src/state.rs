//! Coordinator state: threads and provider-session bindings.
//!
//! A single JSON snapshot (`state.json` + `.bak`) holds every thread
//! and the last-active thread id. All mutation goes through one lock,
//! and every mutation persists before returning, so a caller that
//! observed `Ok` observed durability.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shogun_core::types::{AgentId, SessionBinding, Thread};
use tokio::sync::Mutex;

use crate::atomic::{read_with_backup, write_atomic};
use crate::error::StoreError;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    #[serde(default)]
    threads: BTreeMap<String, Thread>,
    #[serde(default)]
    last_active_thread_id: Option<String>,
}

/// Thread and session persistence.
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<StateFile>,
}

impl StateStore {
    /// Open the store at `path`, loading the current snapshot (or its
    /// backup) when present.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = read_with_backup(&path, |raw| {
            serde_json::from_str::<StateFile>(raw).map_err(StoreError::serialization)
        })
        .await?
        .unwrap_or_default();
        Ok(Self {
            path,
            inner: Mutex::new(file),
        })
    }

    /// Create a thread and select it as last-active.
    pub async fn create_thread(&self, title: impl Into<String>) -> Result<Thread, StoreError> {
        let thread = Thread::new(title);
        let mut inner = self.inner.lock().await;
        inner.threads.insert(thread.id.clone(), thread.clone());
        inner.last_active_thread_id = Some(thread.id.clone());
        self.persist(&inner).await?;
        Ok(thread)
    }

    /// Fetch a thread, registering a record for externally-minted ids
    /// (mailbox producers may reference threads this process has
    /// never seen).
    pub async fn ensure_thread(
        &self,
        id: &str,
        title: &str,
    ) -> Result<Thread, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(thread) = inner.threads.get(id) {
            return Ok(thread.clone());
        }
        let now = Utc::now();
        let thread = Thread {
            id: id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            sessions: BTreeMap::new(),
        };
        inner.threads.insert(id.to_string(), thread.clone());
        if inner.last_active_thread_id.is_none() {
            inner.last_active_thread_id = Some(id.to_string());
        }
        self.persist(&inner).await?;
        Ok(thread)
    }

    /// Remove a thread. Returns `false` when the id was unknown.
    pub async fn delete_thread(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let removed = inner.threads.remove(id).is_some();
        if removed {
            if inner.last_active_thread_id.as_deref() == Some(id) {
                inner.last_active_thread_id = None;
            }
            self.persist(&inner).await?;
        }
        Ok(removed)
    }

    /// All threads, most recently updated first.
    pub async fn list_threads(&self) -> Vec<Thread> {
        let inner = self.inner.lock().await;
        let mut threads: Vec<Thread> = inner.threads.values().cloned().collect();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        threads
    }

    pub async fn get_thread(&self, id: &str) -> Option<Thread> {
        self.inner.lock().await.threads.get(id).cloned()
    }

    /// Mark a thread as last-active. Returns `false` for unknown ids.
    pub async fn select_thread(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.threads.contains_key(id) {
            return Ok(false);
        }
        inner.last_active_thread_id = Some(id.to_string());
        self.persist(&inner).await?;
        Ok(true)
    }

    /// The last-active thread id, used when a mailbox filename omits
    /// the thread segment.
    pub async fn last_active_thread(&self) -> Option<String> {
        self.inner.lock().await.last_active_thread_id.clone()
    }

    /// Refresh `updated_at` on message delivery.
    pub async fn touch_thread(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(thread) = inner.threads.get_mut(id) else {
            return Ok(());
        };
        thread.updated_at = Utc::now();
        self.persist(&inner).await
    }

    /// The session binding for (thread, agent), if one exists.
    pub async fn session(&self, thread_id: &str, agent: &AgentId) -> Option<SessionBinding> {
        let inner = self.inner.lock().await;
        inner
            .threads
            .get(thread_id)
            .and_then(|t| t.sessions.get(&agent.to_string()))
            .cloned()
    }

    /// Install or replace the session binding for (thread, agent).
    pub async fn upsert_session(
        &self,
        thread_id: &str,
        agent: &AgentId,
        binding: SessionBinding,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let thread = inner
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::UnknownThread(thread_id.to_string()))?;
        thread.sessions.insert(agent.to_string(), binding);
        thread.updated_at = Utc::now();
        self.persist(&inner).await
    }

    async fn persist(&self, file: &StateFile) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(file).map_err(StoreError::serialization)?;
        write_atomic(&self.path, &json, true).await
    }
}
