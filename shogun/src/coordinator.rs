//! Coordinator assembly and boundary adapters.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use shogun_agent::{AgentManager, AgentManagerConfig, RoleProviders};
use shogun_core::config::Config;
use shogun_core::event::{CoordinatorEvent, EventHub, EventSink, StopPhase, ThreadInfo};
use shogun_core::types::{AgentId, AgentSnapshot, Message, Thread};
use shogun_mailbox::{
    MailboxHandler, MailboxWatcher, MailboxWatcherConfig, MessageWriter, RestartHandler,
    RestartRequest, RestartWatcher, RestartWatcherConfig,
};
use shogun_store::{HistoryStore, Ledger, StateStore, WaitStore};
use tokio::sync::broadcast;
use tokio::sync::mpsc;

/// Exit code a supervising launcher interprets as "respawn".
pub const RESTART_EXIT_CODE: i32 = 75;

/// Filesystem-watch tuning for the two queue watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// Native events with the production write-finish gate (polling
    /// when `SHOGUN_FORCE_POLL=1`).
    Auto,
    /// Tight polling with no stability gate, for tests.
    TestPolling,
}

/// Errors surfaced by the coordinator facade.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Store error: {0}")]
    Store(#[from] shogun_store::StoreError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] shogun_mailbox::MailboxError),

    #[error("Agent error: {0}")]
    Agent(#[from] shogun_agent::AgentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Routes every delivered mailbox file: thread bookkeeping, the
/// `message` event, then the agent fleet.
struct RouteHandler {
    state: Arc<StateStore>,
    manager: Arc<AgentManager>,
    events: Arc<EventHub>,
}

#[async_trait]
impl MailboxHandler for RouteHandler {
    async fn handle(
        &self,
        message: Message,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let existed = self.state.get_thread(&message.thread_id).await.is_some();
        self.state
            .ensure_thread(&message.thread_id, &message.title)
            .await?;
        self.state.touch_thread(&message.thread_id).await?;
        if !existed {
            self.events.emit(CoordinatorEvent::Threads {
                threads: self
                    .state
                    .list_threads()
                    .await
                    .iter()
                    .map(ThreadInfo::from)
                    .collect(),
            });
        }

        self.events.emit(CoordinatorEvent::Message {
            message: message.clone(),
        });

        self.manager.enqueue(message).await?;
        Ok(())
    }
}

/// Drives orderly shutdown when a restart request lands.
struct RestartSignal {
    manager: Arc<AgentManager>,
    events: Arc<EventHub>,
    tx: mpsc::Sender<RestartRequest>,
}

#[async_trait]
impl RestartHandler for RestartSignal {
    async fn handle(
        &self,
        request: RestartRequest,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!(
            request_id = %request.id,
            reason = request.reason.as_deref().unwrap_or("-"),
            "restart requested; stopping fleet"
        );
        self.events.emit(CoordinatorEvent::Stop {
            status: StopPhase::Requested,
        });
        self.manager.stop_all();
        self.events.emit(CoordinatorEvent::Stop {
            status: StopPhase::Completed,
        });
        let _ = self.tx.send(request).await;
        Ok(())
    }
}

/// The assembled system.
pub struct Coordinator {
    config: Config,
    state: Arc<StateStore>,
    history: Arc<HistoryStore>,
    manager: Arc<AgentManager>,
    events: Arc<EventHub>,
    writer: MessageWriter,
    mailbox_watcher: Option<MailboxWatcher>,
    restart_watcher: Option<RestartWatcher>,
    restart_rx: mpsc::Receiver<RestartRequest>,
}

impl Coordinator {
    /// Build and start everything: directory skeleton, stores,
    /// watchers, the fleet, and the resume-on-boot pass.
    pub async fn start(
        config: Config,
        working_directory: PathBuf,
        providers: RoleProviders,
        watch: WatchMode,
    ) -> Result<Self, CoordinatorError> {
        let base_dir = config.base_dir.clone();
        let history_dir = config.history_dir.clone();

        for dir in [
            base_dir.clone(),
            history_dir.clone(),
            base_dir.join("waits/pending"),
            base_dir.join("logs"),
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Scratch space for every LLM agent's bodyFile payloads.
        let mut scratch_ids = vec![AgentId::Shogun, AgentId::Karou];
        scratch_ids.extend(AgentId::ashigaru_fleet(config.ashigaru_count));
        for id in scratch_ids {
            tokio::fs::create_dir_all(base_dir.join("tmp").join(id.to_string())).await?;
        }

        let state = Arc::new(StateStore::open(base_dir.join("state.json")).await?);
        let history = Arc::new(HistoryStore::new(&history_dir));
        let waits = Arc::new(WaitStore::new(base_dir.join("waits/pending")));
        let writer = MessageWriter::new(&base_dir);
        let events = Arc::new(EventHub::new());

        // Status callback needs the manager for full-fleet snapshots;
        // the slot breaks the construction cycle.
        let manager_slot: Arc<OnceLock<Arc<AgentManager>>> = Arc::new(OnceLock::new());
        let on_status = {
            let manager_slot = manager_slot.clone();
            let events = events.clone();
            Arc::new(move |_snapshot: AgentSnapshot| {
                if let Some(manager) = manager_slot.get() {
                    events.emit(CoordinatorEvent::AgentStatus {
                        agents: manager.snapshots(),
                    });
                }
            })
        };

        let manager = Arc::new(AgentManager::new(
            AgentManagerConfig {
                base_dir: base_dir.clone(),
                history_dir: history_dir.clone(),
                working_directory,
                ashigaru_count: config.ashigaru_count,
                ashigaru_profiles: config.ashigaru_profiles.clone(),
            },
            providers,
            state.clone(),
            history.clone(),
            waits.clone(),
            writer.clone(),
            on_status,
        ));
        let _ = manager_slot.set(manager.clone());

        let mailbox_config = match watch {
            WatchMode::Auto => MailboxWatcherConfig::new(&base_dir, &history_dir),
            WatchMode::TestPolling => MailboxWatcherConfig::for_tests(&base_dir, &history_dir),
        };
        let message_ledger = Arc::new(Ledger::open(base_dir.join("message_ledger.json")).await?);
        let mailbox_watcher = MailboxWatcher::spawn(
            mailbox_config,
            message_ledger,
            history.clone(),
            state.clone(),
            Arc::new(RouteHandler {
                state: state.clone(),
                manager: manager.clone(),
                events: events.clone(),
            }),
        )
        .await?;

        let restart_dir = base_dir.join("tmp/restart");
        let restart_config = match watch {
            WatchMode::Auto => RestartWatcherConfig::new(&restart_dir),
            WatchMode::TestPolling => RestartWatcherConfig::for_tests(&restart_dir),
        };
        let restart_ledger = Arc::new(Ledger::open(restart_dir.join("restart_ledger.json")).await?);
        let (restart_tx, restart_rx) = mpsc::channel(4);
        let restart_watcher = RestartWatcher::spawn(
            restart_config,
            restart_ledger,
            Arc::new(RestartSignal {
                manager: manager.clone(),
                events: events.clone(),
                tx: restart_tx,
            }),
        )
        .await?;

        let resumed = manager.resume_pending_waits().await;
        if resumed > 0 {
            tracing::info!(resumed, "resumed suspended turns from wait records");
        }

        Ok(Self {
            config,
            state,
            history,
            manager,
            events,
            writer,
            mailbox_watcher: Some(mailbox_watcher),
            restart_watcher: Some(restart_watcher),
            restart_rx,
        })
    }

    /// Subscribe to the transport event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub async fn list_threads(&self) -> Vec<ThreadInfo> {
        self.state
            .list_threads()
            .await
            .iter()
            .map(ThreadInfo::from)
            .collect()
    }

    pub async fn create_thread(
        &self,
        title: impl Into<String>,
    ) -> Result<Thread, CoordinatorError> {
        let thread = self.state.create_thread(title).await?;
        self.emit_threads().await;
        Ok(thread)
    }

    /// Select the last-active thread (the fallback for mailbox files
    /// without a thread segment).
    pub async fn select_thread(&self, id: &str) -> Result<bool, CoordinatorError> {
        Ok(self.state.select_thread(id).await?)
    }

    pub async fn delete_thread(&self, id: &str) -> Result<bool, CoordinatorError> {
        let removed = self.state.delete_thread(id).await?;
        if removed {
            self.emit_threads().await;
        }
        Ok(removed)
    }

    /// Delivered messages of a thread, in delivery order.
    pub async fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>, CoordinatorError> {
        Ok(self.history.list(thread_id).await?)
    }

    /// Inject a king instruction: lands in `message_to/shogun/from/
    /// king/` and flows through the watcher like any external write.
    pub async fn submit_king_message(
        &self,
        thread_id: &str,
        body: &str,
        title: Option<&str>,
    ) -> Result<PathBuf, CoordinatorError> {
        let title = title.unwrap_or("message");
        let path = self
            .writer
            .write(thread_id, &AgentId::King, &AgentId::Shogun, title, body)
            .await?;
        self.state.select_thread(thread_id).await?;
        Ok(path)
    }

    /// Live fleet snapshot.
    pub fn fleet_snapshot(&self) -> Vec<AgentSnapshot> {
        self.manager.snapshots()
    }

    /// Stop every agent, bracketed by stop events.
    pub fn stop_all(&self) {
        self.events.emit(CoordinatorEvent::Stop {
            status: StopPhase::Requested,
        });
        self.manager.stop_all();
        self.events.emit(CoordinatorEvent::Stop {
            status: StopPhase::Completed,
        });
    }

    /// Configuration surface for the UI.
    pub fn ui_config(&self) -> &Config {
        &self.config
    }

    /// Resolves when an external restart request has been processed;
    /// the caller should exit with [`RESTART_EXIT_CODE`].
    pub async fn wait_for_restart(&mut self) -> Option<RestartRequest> {
        self.restart_rx.recv().await
    }

    /// Tear everything down (fleet first, then the watchers).
    pub async fn shutdown(mut self) {
        self.manager.stop_all();
        if let Some(watcher) = self.mailbox_watcher.take() {
            watcher.shutdown().await;
        }
        if let Some(watcher) = self.restart_watcher.take() {
            watcher.shutdown().await;
        }
    }

    async fn emit_threads(&self) {
        self.events.emit(CoordinatorEvent::Threads {
            threads: self.list_threads().await,
        });
    }
}
