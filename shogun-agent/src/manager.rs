//! Fleet construction and inbound routing.
//!
//! The manager builds one runtime for the shogun, one for the karou,
//! and one per ashigaru. Runtimes never hold a pointer back to the
//! manager: the two fleet capabilities they need (ashigaru status,
//! interrupt dispatch) are closures over a shared directory.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use shogun_core::types::{AgentId, AgentSnapshot, AgentState, Message, Role};
use shogun_mailbox::MessageWriter;
use shogun_store::{HistoryStore, StateStore, WaitStore};

use crate::error::AgentError;
use crate::provider::ThreadProvider;
use crate::runtime::{
    AgentRuntime, AgentRuntimeConfig, AshigaruStatus, FleetOps, InterruptReason, StatusCallback,
};

/// One provider instance per role, sharing provider-level
/// configuration.
#[derive(Clone)]
pub struct RoleProviders {
    pub shogun: Arc<dyn ThreadProvider>,
    pub karou: Arc<dyn ThreadProvider>,
    pub ashigaru: Arc<dyn ThreadProvider>,
}

impl RoleProviders {
    /// Use the same provider instance for every role.
    pub fn single(provider: Arc<dyn ThreadProvider>) -> Self {
        Self {
            shogun: provider.clone(),
            karou: provider.clone(),
            ashigaru: provider,
        }
    }

    fn for_role(&self, role: Role) -> Arc<dyn ThreadProvider> {
        match role {
            Role::Karou => self.karou.clone(),
            Role::Ashigaru => self.ashigaru.clone(),
            _ => self.shogun.clone(),
        }
    }
}

/// Fleet-level configuration.
#[derive(Clone)]
pub struct AgentManagerConfig {
    pub base_dir: PathBuf,
    pub history_dir: PathBuf,
    pub working_directory: PathBuf,
    pub ashigaru_count: u8,
    pub ashigaru_profiles: BTreeMap<String, String>,
}

/// Owns the fleet of agent runtimes.
pub struct AgentManager {
    runtimes: HashMap<AgentId, AgentRuntime>,
}

impl AgentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentManagerConfig,
        providers: RoleProviders,
        state: Arc<StateStore>,
        history: Arc<HistoryStore>,
        waits: Arc<WaitStore>,
        writer: MessageWriter,
        on_status: StatusCallback,
    ) -> Self {
        let directory: Arc<StdMutex<HashMap<AgentId, AgentRuntime>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        let ops = FleetOps {
            ashigaru_status: {
                let directory = directory.clone();
                Arc::new(move || {
                    let dir = directory.lock().expect("fleet directory lock poisoned");
                    let mut status = AshigaruStatus::default();
                    for (id, runtime) in dir.iter() {
                        if id.role() != Role::Ashigaru {
                            continue;
                        }
                        if runtime.snapshot().status == AgentState::Busy {
                            status.busy.push(id.to_string());
                        } else {
                            status.idle.push(id.to_string());
                        }
                    }
                    status.idle.sort();
                    status.busy.sort();
                    status
                })
            },
            interrupt: {
                let directory = directory.clone();
                Arc::new(move |id: &AgentId, reason: InterruptReason| {
                    let runtime = directory
                        .lock()
                        .expect("fleet directory lock poisoned")
                        .get(id)
                        .cloned();
                    match runtime {
                        Some(runtime) => match reason {
                            InterruptReason::Stop => runtime.stop(),
                            InterruptReason::Interrupt => {
                                runtime.interrupt(InterruptReason::Interrupt)
                            }
                        },
                        None => {
                            tracing::warn!(target_id = %id, "interrupt for unknown runtime");
                        }
                    }
                })
            },
        };

        let mut ids = vec![AgentId::Shogun, AgentId::Karou];
        ids.extend(AgentId::ashigaru_fleet(config.ashigaru_count));

        let mut runtimes = HashMap::new();
        for id in ids {
            let mut runtime_config = AgentRuntimeConfig::new(
                id,
                &config.base_dir,
                &config.history_dir,
                &config.working_directory,
                config.ashigaru_count,
            );
            runtime_config.ashigaru_profiles = config.ashigaru_profiles.clone();
            let runtime = AgentRuntime::new(
                runtime_config,
                providers.for_role(id.role()),
                state.clone(),
                history.clone(),
                waits.clone(),
                writer.clone(),
                ops.clone(),
                on_status.clone(),
            );
            runtimes.insert(id, runtime);
        }

        *directory.lock().expect("fleet directory lock poisoned") = runtimes.clone();

        Self { runtimes }
    }

    /// Route an inbound message to its recipient's runtime. Messages
    /// for identities without a runtime (the king, an ashigaru beyond
    /// the fleet width) are dropped with a warning.
    pub async fn enqueue(&self, message: Message) -> Result<(), AgentError> {
        let Some(runtime) = self.runtimes.get(&message.to) else {
            tracing::warn!(
                to = %message.to,
                message_id = %message.id,
                "no runtime for recipient; dropping message"
            );
            return Ok(());
        };
        runtime.enqueue(message).await
    }

    pub fn runtime(&self, id: &AgentId) -> Option<&AgentRuntime> {
        self.runtimes.get(id)
    }

    /// Stop every runtime.
    pub fn stop_all(&self) {
        for runtime in self.runtimes.values() {
            runtime.stop();
        }
    }

    /// Snapshot of the whole fleet, in stable id order.
    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        let mut ids: Vec<&AgentId> = self.runtimes.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| self.runtimes[id].snapshot())
            .collect()
    }

    /// Resume suspended turns for the whole fleet. Returns how many
    /// turns were re-enqueued.
    pub async fn resume_pending_waits(&self) -> usize {
        let mut resumed = 0;
        for runtime in self.runtimes.values() {
            match runtime.resume_pending_waits().await {
                Ok(count) => resumed += count,
                Err(err) => {
                    tracing::warn!(
                        agent_id = %runtime.id(),
                        error = %err,
                        "failed to scan wait records"
                    );
                }
            }
        }
        resumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;

    async fn make_manager(dir: &tempfile::TempDir, count: u8) -> AgentManager {
        let base = dir.path().join(".shogun");
        let state = Arc::new(
            StateStore::open(base.join("state.json")).await.unwrap(),
        );
        let history = Arc::new(HistoryStore::new(base.join("history")));
        let waits = Arc::new(WaitStore::new(base.join("waits/pending")));
        let writer = MessageWriter::new(&base);
        AgentManager::new(
            AgentManagerConfig {
                base_dir: base.clone(),
                history_dir: base.join("history"),
                working_directory: dir.path().to_path_buf(),
                ashigaru_count: count,
                ashigaru_profiles: BTreeMap::new(),
            },
            RoleProviders::single(Arc::new(ScriptedProvider::with_texts(&[]))),
            state,
            history,
            waits,
            writer,
            Arc::new(|_| {}),
        )
    }

    #[tokio::test]
    async fn test_fleet_width() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(&dir, 3).await;
        let snapshots = manager.snapshots();
        assert_eq!(snapshots.len(), 5); // shogun + karou + 3 ashigaru
        assert_eq!(snapshots[0].id, AgentId::Shogun);
        assert_eq!(snapshots[1].id, AgentId::Karou);
        assert_eq!(snapshots[4].id, AgentId::Ashigaru(3));
    }

    #[tokio::test]
    async fn test_all_runtimes_start_idle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(&dir, 2).await;
        for snapshot in manager.snapshots() {
            assert_eq!(snapshot.status, AgentState::Idle);
            assert_eq!(snapshot.queue_size, 0);
        }
    }

    #[tokio::test]
    async fn test_message_for_king_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(&dir, 2).await;
        let message = Message {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
            from: AgentId::Shogun,
            to: AgentId::King,
            title: "report".to_string(),
            body: "done".to_string(),
            created_at: chrono::Utc::now(),
        };
        // Dropped, not an error.
        manager.enqueue(message).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_ashigaru_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(&dir, 2).await;
        let message = Message {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
            from: AgentId::Karou,
            to: AgentId::Ashigaru(9),
            title: "work".to_string(),
            body: "x".to_string(),
            created_at: chrono::Utc::now(),
        };
        manager.enqueue(message).await.unwrap();
    }
}
