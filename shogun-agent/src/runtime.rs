//! Per-agent runtime: FIFO queue, single-turn execution, tool
//! dispatch, batching, suspension, cancellation.
//!
//! Concurrency model: parallel across agents, single-threaded within
//! an agent. Each runtime executes at most one provider turn at a
//! time; everything mutable sits behind one short-lived lock that is
//! never held across an await point.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use shogun_core::authz::{allowed_recipients, can_interrupt, default_superior};
use shogun_core::prompt::compose_system_prompt;
use shogun_core::types::{
    ActivityEntry, AgentId, AgentSnapshot, AgentState, Message, Role, SessionBinding,
    ACTIVITY_LOG_CAP,
};
use shogun_mailbox::MessageWriter;
use shogun_store::{HistoryStore, StateStore, WaitOrigin, WaitRecord, WaitStatus, WaitStore};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::provider::{
    CreateThreadRequest, ProgressFn, ProviderError, SendMessageRequest, ThreadProvider,
};
use crate::tools::{parse_tool_lines, ToolLine, ToolRequest};

/// Initial tool-loop allowance per turn; waits extend it.
pub const DEFAULT_MAX_LOOPS: u32 = 3;

/// Per-turn `waitForMessage` allowance.
pub const DEFAULT_WAIT_BUDGET: i64 = 10;

/// Default `waitForMessage` timeout.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 60_000;

/// Upper bound for `bodyFile` payloads.
pub const BODY_FILE_MAX_BYTES: u64 = 10 * 1024;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Why a turn is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// Shut the runtime down; no further turns run until restart.
    Stop,
    /// Abandon the current turn; future work is accepted.
    Interrupt,
}

impl std::fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// Live idle/busy split of the ashigaru fleet.
#[derive(Debug, Clone, Default)]
pub struct AshigaruStatus {
    pub idle: Vec<String>,
    pub busy: Vec<String>,
}

/// Capability record handed to each runtime at construction, instead
/// of a back-pointer to the manager.
#[derive(Clone)]
pub struct FleetOps {
    pub ashigaru_status: Arc<dyn Fn() -> AshigaruStatus + Send + Sync>,
    pub interrupt: Arc<dyn Fn(&AgentId, InterruptReason) + Send + Sync>,
}

impl FleetOps {
    /// Inert capabilities, for tests of a lone runtime.
    pub fn noop() -> Self {
        Self {
            ashigaru_status: Arc::new(AshigaruStatus::default),
            interrupt: Arc::new(|_, _| {}),
        }
    }
}

/// Invoked with a fresh snapshot on every status change.
pub type StatusCallback = Arc<dyn Fn(AgentSnapshot) + Send + Sync>;

/// Static configuration of one runtime.
#[derive(Clone)]
pub struct AgentRuntimeConfig {
    pub id: AgentId,
    pub base_dir: PathBuf,
    pub history_dir: PathBuf,
    pub working_directory: PathBuf,
    pub allowed_recipients: BTreeSet<AgentId>,
    pub ashigaru_profiles: BTreeMap<String, String>,
    pub max_loops: u32,
    pub wait_budget: i64,
    pub default_wait_timeout_ms: u64,
}

impl AgentRuntimeConfig {
    pub fn new(
        id: AgentId,
        base_dir: impl Into<PathBuf>,
        history_dir: impl Into<PathBuf>,
        working_directory: impl Into<PathBuf>,
        ashigaru_count: u8,
    ) -> Self {
        Self {
            allowed_recipients: allowed_recipients(&id, ashigaru_count),
            id,
            base_dir: base_dir.into(),
            history_dir: history_dir.into(),
            working_directory: working_directory.into(),
            ashigaru_profiles: BTreeMap::new(),
            max_loops: DEFAULT_MAX_LOOPS,
            wait_budget: DEFAULT_WAIT_BUDGET,
            default_wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }
}

struct Waiter {
    thread_id: String,
    tx: oneshot::Sender<Option<Message>>,
}

struct MutableState {
    queue: VecDeque<Message>,
    busy: bool,
    halted: bool,
    active_thread_id: Option<String>,
    cancel: Option<CancellationToken>,
    cancel_reason: Option<InterruptReason>,
    waiter: Option<Waiter>,
    completions: HashMap<String, oneshot::Sender<Result<(), String>>>,
    activity: Option<String>,
    activity_log: VecDeque<ActivityEntry>,
    updated_at: DateTime<Utc>,
}

struct RuntimeInner {
    config: AgentRuntimeConfig,
    provider: Arc<dyn ThreadProvider>,
    state: Arc<StateStore>,
    history: Arc<HistoryStore>,
    waits: Arc<WaitStore>,
    writer: MessageWriter,
    ops: FleetOps,
    on_status: StatusCallback,
    mu: StdMutex<MutableState>,
}

enum WaitOutcome {
    Message(Message),
    Timeout,
    Cancelled,
}

enum WaitExec {
    Payload(serde_json::Value),
    Cancelled,
}

/// One agent's execution engine. Cloning shares the runtime.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentRuntimeConfig,
        provider: Arc<dyn ThreadProvider>,
        state: Arc<StateStore>,
        history: Arc<HistoryStore>,
        waits: Arc<WaitStore>,
        writer: MessageWriter,
        ops: FleetOps,
        on_status: StatusCallback,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                provider,
                state,
                history,
                waits,
                writer,
                ops,
                on_status,
                mu: StdMutex::new(MutableState {
                    queue: VecDeque::new(),
                    busy: false,
                    halted: false,
                    active_thread_id: None,
                    cancel: None,
                    cancel_reason: None,
                    waiter: None,
                    completions: HashMap::new(),
                    activity: None,
                    activity_log: VecDeque::new(),
                    updated_at: Utc::now(),
                }),
            }),
        }
    }

    pub fn id(&self) -> AgentId {
        self.inner.config.id
    }

    /// Derived view of this runtime.
    pub fn snapshot(&self) -> AgentSnapshot {
        self.inner.snapshot()
    }

    /// Deliver a message to this agent. Resolves when the message's
    /// turn terminates (or immediately, when the message satisfies a
    /// suspended wait).
    pub async fn enqueue(&self, message: Message) -> Result<(), AgentError> {
        let inner = &self.inner;

        // A suspended turn waiting on this thread consumes the message
        // directly; the durable record is updated first so a crash
        // between the two steps still resumes correctly.
        if let Some(record) = inner.waits.get(&message.thread_id, &inner.config.id).await? {
            if record.status == WaitStatus::Pending && record.origin.message_id != message.id {
                inner
                    .waits
                    .mark_received(&message.thread_id, &inner.config.id, message.clone())
                    .await?;
                if let Some(waiter) = inner.take_waiter(&message.thread_id) {
                    let _ = waiter.tx.send(Some(message));
                }
                return Ok(());
            }
        }

        if let Some(waiter) = inner.take_waiter(&message.thread_id) {
            let _ = waiter.tx.send(Some(message));
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut st = inner.mu.lock().expect("runtime lock poisoned");
            if st.halted {
                return Err(AgentError::Stopped);
            }
            inner.log_activity(&mut st, format!("queued: {}", message.title));
            st.completions.insert(message.id.clone(), tx);
            st.queue.push_back(message);
        }
        inner.emit_status();
        inner.clone().schedule();

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if err == "agent stopped" => Err(AgentError::Stopped),
            Ok(Err(err)) => Err(AgentError::Provider(err)),
            Err(_) => Err(AgentError::Stopped),
        }
    }

    /// Shut the runtime down: drain the queue, resolve any waiter,
    /// abort the in-flight provider call. No further turns run.
    pub fn stop(&self) {
        self.inner.cancel_turn(InterruptReason::Stop);
    }

    /// Abandon the current turn and queued work; future enqueues are
    /// accepted.
    pub fn interrupt(&self, reason: InterruptReason) {
        self.inner.cancel_turn(reason);
    }

    /// Re-enqueue the originating message of every non-cleared wait
    /// record owned by this agent, so suspended turns resume where
    /// the provider last left them.
    pub async fn resume_pending_waits(&self) -> Result<usize, AgentError> {
        let records = self.inner.waits.load_all().await?;
        let mut resumed = 0;
        for record in records
            .into_iter()
            .filter(|r| r.agent_id == self.inner.config.id)
        {
            match self
                .inner
                .history
                .find(&record.thread_id, &record.origin.message_id)
                .await?
            {
                Some(message) => {
                    resumed += 1;
                    let runtime = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = runtime.enqueue(message).await {
                            tracing::warn!(
                                agent_id = %runtime.inner.config.id,
                                error = %err,
                                "failed to resume suspended turn"
                            );
                        }
                    });
                }
                None => {
                    tracing::warn!(
                        agent_id = %self.inner.config.id,
                        thread_id = %record.thread_id,
                        message_id = %record.origin.message_id,
                        "wait record has no matching history entry"
                    );
                }
            }
        }
        Ok(resumed)
    }
}

impl RuntimeInner {
    fn schedule(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.process_queue().await;
        });
    }

    async fn process_queue(self: Arc<Self>) {
        loop {
            let (batch, cancel) = {
                let mut st = self.mu.lock().expect("runtime lock poisoned");
                if st.busy || st.halted || st.queue.is_empty() {
                    return;
                }
                let head = st.queue.pop_front().expect("queue is non-empty");
                let thread_id = head.thread_id.clone();
                let mut batch = vec![head];
                let mut rest = VecDeque::new();
                while let Some(m) = st.queue.pop_front() {
                    if m.thread_id == thread_id {
                        batch.push(m);
                    } else {
                        rest.push_back(m);
                    }
                }
                st.queue = rest;
                st.busy = true;
                st.active_thread_id = Some(thread_id);
                let cancel = CancellationToken::new();
                st.cancel = Some(cancel.clone());
                st.cancel_reason = None;
                self.log_activity(&mut st, format!("turn started ({} message(s))", batch.len()));
                (batch, cancel)
            };
            self.emit_status();

            let result = self.run_with_tools(&batch, &cancel).await;

            {
                let mut st = self.mu.lock().expect("runtime lock poisoned");
                for m in &batch {
                    if let Some(tx) = st.completions.remove(&m.id) {
                        let _ = tx.send(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
                    }
                }
                st.busy = false;
                st.active_thread_id = None;
                st.cancel = None;
                match &result {
                    Ok(()) => self.log_activity(&mut st, "turn completed".to_string()),
                    Err(err) => self.log_activity(&mut st, format!("error: {err}")),
                }
            }
            self.emit_status();

            if let Err(err) = &result {
                tracing::error!(
                    agent_id = %self.config.id,
                    thread_id = %batch[0].thread_id,
                    message_id = %batch[0].id,
                    error = %err,
                    "turn failed; leaving originating files un-acked"
                );
            }

            if self.mu.lock().expect("runtime lock poisoned").halted {
                return;
            }
        }
    }

    async fn run_with_tools(
        self: &Arc<Self>,
        batch: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let head = &batch[0];
        let thread_id = head.thread_id.clone();
        let agent = self.config.id;

        let provider_thread = self.ensure_session(&thread_id, cancel).await?;
        let mut input = compose_input(batch);
        let mut max_loops = self.config.max_loops;
        let mut remaining_waits = self.config.wait_budget;

        // A durable wait record matching the head message means this
        // turn suspended before: resume with a synthetic tool result
        // instead of replaying the instruction.
        if let Some(record) = self.waits.get(&thread_id, &agent).await? {
            if record.origin.message_id == head.id {
                let payload = match record.status {
                    WaitStatus::Received => {
                        json!({"status": "message", "message": record.received_message})
                    }
                    WaitStatus::Timeout => {
                        json!({"status": "timeout", "timeoutMs": record.timeout_ms})
                    }
                    WaitStatus::Pending => {
                        // Crashed before any outcome: wait again now.
                        match self.await_message(&thread_id, record.timeout_ms, cancel).await {
                            WaitOutcome::Message(m) => {
                                json!({"status": "message", "message": m})
                            }
                            WaitOutcome::Timeout => {
                                json!({"status": "timeout", "timeoutMs": record.timeout_ms})
                            }
                            WaitOutcome::Cancelled => return Ok(()),
                        }
                    }
                };
                input = format!("TOOL_RESULT waitForMessage: {payload}\n\n{input}");
                // The wait that suspended this turn grants the same
                // extra loop a live wait outcome would.
                max_loops += 1;
            }
        }

        let mut loops = 0;

        while loops < max_loops {
            loops += 1;

            let response = {
                let _heartbeat = Heartbeat::start(self.clone(), "provider call");
                self.provider
                    .send_message(
                        SendMessageRequest {
                            thread_id: provider_thread.clone(),
                            input: std::mem::take(&mut input),
                        },
                        cancel.clone(),
                        Some(self.progress_fn()),
                    )
                    .await
            };

            let output = match response {
                Ok(response) => response.output_text,
                Err(ProviderError::Cancelled) if self.cancel_reason().is_some() => {
                    // Explicit stop/interrupt: swallow and exit.
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            let lines = parse_tool_lines(&output);
            if lines.is_empty() {
                let trimmed = output.trim();
                if !trimmed.is_empty() {
                    self.auto_reply(&thread_id, head, trimmed).await?;
                }
                break;
            }

            let mut results: Vec<(String, serde_json::Value)> = Vec::new();
            let mut wait_seen = false;
            for line in lines {
                if wait_seen {
                    tracing::warn!(
                        agent_id = %agent,
                        tool = line.name(),
                        "ignoring tool line after waitForMessage in the same batch"
                    );
                    continue;
                }
                match line {
                    ToolLine::Error { name, error } => {
                        tracing::warn!(agent_id = %agent, tool = %name, error = %error, "malformed tool line");
                        results.push((name, json!({"status": "error", "error": error})));
                    }
                    ToolLine::Request(ToolRequest::GetAshigaruStatus) => {
                        results.push(("getAshigaruStatus".to_string(), self.exec_status()));
                    }
                    ToolLine::Request(ToolRequest::SendMessage {
                        to,
                        title,
                        body,
                        body_file,
                    }) => {
                        let value = self
                            .exec_send(&thread_id, to, title, body, body_file)
                            .await;
                        results.push(("sendMessage".to_string(), value));
                    }
                    ToolLine::Request(ToolRequest::InterruptAgent { to, title, body }) => {
                        let value = self.exec_interrupt(&thread_id, to, title, body).await;
                        results.push(("interruptAgent".to_string(), value));
                    }
                    ToolLine::Request(ToolRequest::WaitForMessage { timeout_ms }) => {
                        wait_seen = true;
                        let exec = self
                            .exec_wait(
                                &thread_id,
                                &provider_thread,
                                head,
                                timeout_ms,
                                &mut remaining_waits,
                                cancel,
                            )
                            .await?;
                        match exec {
                            WaitExec::Payload(value) => {
                                // Every wait outcome (message, timeout,
                                // limit hit) grants the model one more
                                // loop to react; a role denial does not.
                                if value.get("status").and_then(|s| s.as_str()) != Some("error") {
                                    max_loops += 1;
                                }
                                results.push(("waitForMessage".to_string(), value));
                            }
                            WaitExec::Cancelled => return Ok(()),
                        }
                    }
                }
            }

            input = if results.len() == 1 {
                format!("TOOL_RESULT {}: {}", results[0].0, results[0].1)
            } else {
                let items: Vec<serde_json::Value> = results
                    .into_iter()
                    .map(|(name, value)| json!({"tool": name, "result": value}))
                    .collect();
                format!("TOOL_RESULT batch: {}", serde_json::Value::Array(items))
            };
        }

        self.waits.clear(&thread_id, &agent).await?;
        Ok(())
    }

    /// Idempotent provider-session binding for (thread, agent).
    async fn ensure_session(
        &self,
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let agent = self.config.id;

        if let Some(binding) = self.state.session(thread_id, &agent).await {
            if binding.initialized {
                return Ok(binding.provider_thread_id);
            }
            self.provider.resume_thread(&binding.provider_thread_id).await?;
            self.provider
                .send_message(
                    SendMessageRequest {
                        thread_id: binding.provider_thread_id.clone(),
                        input: self.system_prompt_with_ack(),
                    },
                    cancel.clone(),
                    None,
                )
                .await?;
            self.state
                .upsert_session(
                    thread_id,
                    &agent,
                    SessionBinding {
                        initialized: true,
                        ..binding.clone()
                    },
                )
                .await?;
            return Ok(binding.provider_thread_id);
        }

        let thread = self
            .provider
            .create_thread(CreateThreadRequest {
                working_directory: self.config.working_directory.clone(),
                initial_input: Some(self.system_prompt_with_ack()),
            })
            .await?;
        self.state
            .upsert_session(
                thread_id,
                &agent,
                SessionBinding {
                    provider: self.provider.name().to_string(),
                    provider_thread_id: thread.id.clone(),
                    initialized: true,
                },
            )
            .await?;
        Ok(thread.id)
    }

    fn system_prompt_with_ack(&self) -> String {
        let prompt = compose_system_prompt(
            &self.config.id,
            &self.config.base_dir,
            &self.config.history_dir,
            &self.config.ashigaru_profiles,
        );
        format!("{prompt}\nReply with ACK once you have read this.")
    }

    fn exec_status(&self) -> serde_json::Value {
        if self.config.id.role() != Role::Karou {
            return json!({
                "status": "error",
                "error": "getAshigaruStatus is only available to the karou",
            });
        }
        let status = (self.ops.ashigaru_status)();
        json!({"idle": status.idle, "busy": status.busy})
    }

    async fn exec_send(
        &self,
        thread_id: &str,
        to: Vec<String>,
        title: Option<String>,
        body: Option<String>,
        body_file: Option<String>,
    ) -> serde_json::Value {
        let Some(title) = title else {
            return json!({"status": "error", "error": "sendMessage requires title"});
        };
        let body = match (body, body_file) {
            (Some(body), _) => body,
            (None, Some(rel)) => match self.read_body_file(&rel).await {
                Ok(body) => body,
                Err(error) => return json!({"status": "error", "error": error}),
            },
            (None, None) => {
                return json!({"status": "error", "error": "sendMessage requires body or bodyFile"});
            }
        };

        let mut sent = Vec::new();
        let mut denied = Vec::new();
        for raw in to {
            let target = match raw.parse::<AgentId>() {
                Ok(target) if self.config.allowed_recipients.contains(&target) => target,
                _ => {
                    denied.push(raw);
                    continue;
                }
            };
            match self
                .writer
                .write(thread_id, &self.config.id, &target, &title, &body)
                .await
            {
                Ok(_) => sent.push(raw),
                Err(err) => {
                    tracing::warn!(
                        agent_id = %self.config.id,
                        to = %target,
                        error = %err,
                        "sendMessage write failed"
                    );
                    return json!({"status": "error", "error": err.to_string(), "to": sent});
                }
            }
        }

        if sent.is_empty() && !denied.is_empty() {
            json!({"status": "denied", "to": denied})
        } else {
            json!({"status": "ok", "to": sent, "denied": denied})
        }
    }

    async fn exec_interrupt(
        &self,
        thread_id: &str,
        to: Vec<String>,
        title: Option<String>,
        body: Option<String>,
    ) -> serde_json::Value {
        let mut interrupted = Vec::new();
        let mut denied = Vec::new();
        for raw in to {
            let target = match raw.parse::<AgentId>() {
                Ok(target) if can_interrupt(&self.config.id, &target) => target,
                _ => {
                    denied.push(raw);
                    continue;
                }
            };
            let reason = if let Some(body) = &body {
                let title = title.clone().unwrap_or_else(|| "interrupt".to_string());
                if let Err(err) = self
                    .writer
                    .write(thread_id, &self.config.id, &target, &title, body)
                    .await
                {
                    tracing::warn!(
                        agent_id = %self.config.id,
                        to = %target,
                        error = %err,
                        "interrupt message write failed"
                    );
                }
                InterruptReason::Interrupt
            } else {
                InterruptReason::Stop
            };
            (self.ops.interrupt)(&target, reason);
            interrupted.push(raw);
        }

        if interrupted.is_empty() && !denied.is_empty() {
            json!({"status": "denied", "to": denied})
        } else {
            json!({"status": "ok", "interrupted": interrupted, "denied": denied})
        }
    }

    async fn exec_wait(
        self: &Arc<Self>,
        thread_id: &str,
        provider_thread: &str,
        head: &Message,
        timeout_ms: Option<u64>,
        remaining_waits: &mut i64,
        cancel: &CancellationToken,
    ) -> Result<WaitExec, AgentError> {
        let agent = self.config.id;
        if !matches!(agent.role(), Role::Shogun | Role::Karou) {
            return Ok(WaitExec::Payload(json!({
                "status": "error",
                "error": "waitForMessage is only available to shogun and karou",
            })));
        }

        let timeout_ms = timeout_ms.unwrap_or(self.config.default_wait_timeout_ms);
        *remaining_waits -= 1;
        if *remaining_waits <= 0 {
            return Ok(WaitExec::Payload(json!({
                "status": "timeout",
                "timeoutMs": timeout_ms,
                "remainingWaits": 0,
                "limitReached": true,
            })));
        }

        let record = WaitRecord::pending(
            thread_id,
            agent,
            provider_thread,
            timeout_ms,
            WaitOrigin {
                message_id: head.id.clone(),
                from: head.from,
                to: head.to,
                title: head.title.clone(),
                created_at: head.created_at,
            },
        );
        self.waits.put(&record).await?;

        // A message already queued for this thread answers the wait
        // without suspending.
        if let Some(queued) = self.pop_queued_for_thread(thread_id) {
            self.resolve_completion(&queued.id, Ok(()));
            self.waits
                .mark_received(thread_id, &agent, queued.clone())
                .await?;
            return Ok(WaitExec::Payload(json!({
                "status": "message",
                "message": queued,
                "remainingWaits": *remaining_waits,
            })));
        }

        match self.await_message(thread_id, timeout_ms, cancel).await {
            WaitOutcome::Message(message) => Ok(WaitExec::Payload(json!({
                "status": "message",
                "message": message,
                "remainingWaits": *remaining_waits,
            }))),
            WaitOutcome::Timeout => Ok(WaitExec::Payload(json!({
                "status": "timeout",
                "timeoutMs": timeout_ms,
                "remainingWaits": *remaining_waits,
            }))),
            WaitOutcome::Cancelled => Ok(WaitExec::Cancelled),
        }
    }

    /// Install the in-memory rendezvous and wait for a message, the
    /// timeout, or cancellation.
    async fn await_message(
        self: &Arc<Self>,
        thread_id: &str,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let (tx, mut rx) = oneshot::channel();
        {
            let mut st = self.mu.lock().expect("runtime lock poisoned");
            st.waiter = Some(Waiter {
                thread_id: thread_id.to_string(),
                tx,
            });
            self.log_activity(&mut st, "waiting for message".to_string());
        }
        self.emit_status();

        // Close the race with an enqueue that marked the record
        // received before the waiter existed.
        if let Ok(Some(record)) = self.waits.get(thread_id, &self.config.id).await {
            if record.status == WaitStatus::Received && self.take_waiter(thread_id).is_some() {
                if let Some(message) = record.received_message {
                    return WaitOutcome::Message(message);
                }
                return WaitOutcome::Timeout;
            }
        }

        let _heartbeat = Heartbeat::start(self.clone(), "waiting for message");

        enum Raced {
            Channel(Result<Option<Message>, oneshot::error::RecvError>),
            TimedOut,
            Cancelled,
        }

        let raced = tokio::select! {
            _ = cancel.cancelled() => Raced::Cancelled,
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => Raced::TimedOut,
            outcome = &mut rx => Raced::Channel(outcome),
        };

        match raced {
            Raced::Channel(Ok(Some(message))) => WaitOutcome::Message(message),
            Raced::Channel(Ok(None)) => WaitOutcome::Cancelled,
            Raced::Channel(Err(_)) => WaitOutcome::Timeout,
            Raced::Cancelled => {
                let _ = self.take_waiter(thread_id);
                WaitOutcome::Cancelled
            }
            Raced::TimedOut => {
                if self.take_waiter(thread_id).is_some() {
                    let _ = self.waits.mark_timeout(thread_id, &self.config.id).await;
                    return WaitOutcome::Timeout;
                }
                // The waiter was consumed between expiry and now; the
                // message is already in the channel.
                match rx.await {
                    Ok(Some(message)) => WaitOutcome::Message(message),
                    _ => WaitOutcome::Timeout,
                }
            }
        }
    }

    async fn auto_reply(
        &self,
        thread_id: &str,
        head: &Message,
        text: &str,
    ) -> Result<(), AgentError> {
        let Some(superior) = default_superior(&self.config.id) else {
            return Ok(());
        };
        if !self.config.allowed_recipients.contains(&superior) {
            return Ok(());
        }
        self.writer
            .write(
                thread_id,
                &self.config.id,
                &superior,
                &format!("auto_reply: {}", head.title),
                text,
            )
            .await?;
        Ok(())
    }

    /// Resolve a `bodyFile` argument under the agent's scratch
    /// directory, rejecting traversal and oversized payloads.
    async fn read_body_file(&self, rel: &str) -> Result<String, String> {
        let scratch = self
            .config
            .base_dir
            .join("tmp")
            .join(self.config.id.to_string());
        let canon_scratch = tokio::fs::canonicalize(&scratch)
            .await
            .map_err(|_| "agent scratch directory does not exist".to_string())?;
        let canon = tokio::fs::canonicalize(scratch.join(rel))
            .await
            .map_err(|_| format!("bodyFile not found: {rel}"))?;
        if !canon.starts_with(&canon_scratch) {
            return Err("bodyFile must resolve under the agent scratch directory".to_string());
        }
        let meta = tokio::fs::metadata(&canon)
            .await
            .map_err(|err| err.to_string())?;
        if meta.len() > BODY_FILE_MAX_BYTES {
            return Err(format!(
                "bodyFile exceeds {BODY_FILE_MAX_BYTES} bytes: {}",
                meta.len()
            ));
        }
        tokio::fs::read_to_string(&canon)
            .await
            .map_err(|err| err.to_string())
    }

    fn cancel_turn(self: &Arc<Self>, reason: InterruptReason) {
        let (waiter, rejected, cancel) = {
            let mut st = self.mu.lock().expect("runtime lock poisoned");
            if reason == InterruptReason::Stop {
                st.halted = true;
            }
            st.cancel_reason = Some(reason);
            let waiter = st.waiter.take();
            let drained: Vec<Message> = st.queue.drain(..).collect();
            let mut rejected = Vec::new();
            for m in &drained {
                if let Some(tx) = st.completions.remove(&m.id) {
                    rejected.push(tx);
                }
            }
            let cancel = st.cancel.clone();
            self.log_activity(&mut st, format!("{reason} requested"));
            (waiter, rejected, cancel)
        };

        if let Some(waiter) = waiter {
            let _ = waiter.tx.send(None);
        }
        for tx in rejected {
            let _ = tx.send(Err("agent stopped".to_string()));
        }
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.emit_status();
    }

    fn take_waiter(&self, thread_id: &str) -> Option<Waiter> {
        let mut st = self.mu.lock().expect("runtime lock poisoned");
        if st
            .waiter
            .as_ref()
            .map(|w| w.thread_id == thread_id)
            .unwrap_or(false)
        {
            st.waiter.take()
        } else {
            None
        }
    }

    fn pop_queued_for_thread(&self, thread_id: &str) -> Option<Message> {
        let mut st = self.mu.lock().expect("runtime lock poisoned");
        let idx = st.queue.iter().position(|m| m.thread_id == thread_id)?;
        st.queue.remove(idx)
    }

    fn resolve_completion(&self, message_id: &str, result: Result<(), String>) {
        let tx = {
            let mut st = self.mu.lock().expect("runtime lock poisoned");
            st.completions.remove(message_id)
        };
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }

    fn cancel_reason(&self) -> Option<InterruptReason> {
        self.mu.lock().expect("runtime lock poisoned").cancel_reason
    }

    fn progress_fn(self: &Arc<Self>) -> ProgressFn {
        let inner = Arc::clone(self);
        Arc::new(move |note: &str| {
            inner.touch_activity(note.to_string());
        })
    }

    fn snapshot(&self) -> AgentSnapshot {
        let st = self.mu.lock().expect("runtime lock poisoned");
        AgentSnapshot {
            id: self.config.id,
            role: self.config.id.role(),
            status: if st.busy {
                AgentState::Busy
            } else {
                AgentState::Idle
            },
            queue_size: st.queue.len(),
            active_thread_id: st.active_thread_id.clone(),
            updated_at: st.updated_at,
            activity: st.activity.clone(),
            activity_log: st.activity_log.iter().cloned().collect(),
        }
    }

    fn emit_status(&self) {
        (self.on_status)(self.snapshot());
    }

    fn log_activity(&self, st: &mut MutableState, activity: String) {
        st.activity = Some(activity.clone());
        st.updated_at = Utc::now();
        if st.activity_log.len() >= ACTIVITY_LOG_CAP {
            st.activity_log.pop_front();
        }
        st.activity_log.push_back(ActivityEntry {
            at: st.updated_at,
            activity,
        });
    }

    fn touch_activity(&self, activity: String) {
        let mut st = self.mu.lock().expect("runtime lock poisoned");
        st.activity = Some(activity);
        st.updated_at = Utc::now();
    }
}

/// Scoped heartbeat: refreshes the activity line while a provider
/// call or wait is outstanding, torn down on every exit path by Drop.
struct Heartbeat {
    handle: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    fn start(inner: Arc<RuntimeInner>, label: &'static str) -> Self {
        let handle = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                inner.touch_activity(format!("{label} ({}s)", started.elapsed().as_secs()));
            }
        });
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn format_message_block(message: &Message) -> String {
    format!(
        "FROM: {}\nDATE: {}\nTITLE: {}\n\n{}",
        message.from,
        message
            .created_at
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        message.title,
        message.body
    )
}

/// One message renders as a plain header block; a coalesced batch is
/// framed so the model sees every member.
fn compose_input(batch: &[Message]) -> String {
    if batch.len() == 1 {
        return format_message_block(&batch[0]);
    }
    let n = batch.len();
    let mut out = format!("BATCH_START count={n}\n");
    for (i, message) in batch.iter().enumerate() {
        out.push_str(&format!(
            "--- MESSAGE {}/{} START ---\n{}\n--- MESSAGE {}/{} END ---\n",
            i + 1,
            n,
            format_message_block(message),
            i + 1,
            n
        ));
    }
    out.push_str("BATCH_END");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message(id: &str, title: &str) -> Message {
        Message {
            id: id.to_string(),
            thread_id: "t1".to_string(),
            from: AgentId::King,
            to: AgentId::Shogun,
            title: title.to_string(),
            body: format!("body of {id}"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_single_message_input() {
        let input = compose_input(&[make_message("m1", "task")]);
        assert!(input.starts_with("FROM: king\n"));
        assert!(input.contains("TITLE: task\n"));
        assert!(input.ends_with("body of m1"));
        assert!(!input.contains("BATCH_START"));
    }

    #[test]
    fn test_batch_input_framing() {
        let input = compose_input(&[make_message("m1", "a"), make_message("m2", "b")]);
        assert!(input.starts_with("BATCH_START count=2\n"));
        assert!(input.contains("--- MESSAGE 1/2 START ---"));
        assert!(input.contains("--- MESSAGE 2/2 END ---"));
        assert!(input.ends_with("BATCH_END"));
        assert!(input.contains("body of m1"));
        assert!(input.contains("body of m2"));
    }

    #[test]
    fn test_interrupt_reason_display() {
        assert_eq!(InterruptReason::Stop.to_string(), "stop");
        assert_eq!(InterruptReason::Interrupt.to_string(), "interrupt");
    }

    #[test]
    fn test_runtime_config_allowed_set() {
        let config = AgentRuntimeConfig::new(
            AgentId::Karou,
            "/b",
            "/b/history",
            "/ws",
            3,
        );
        assert!(config.allowed_recipients.contains(&AgentId::Shogun));
        assert!(config.allowed_recipients.contains(&AgentId::Ashigaru(3)));
        assert!(!config.allowed_recipients.contains(&AgentId::King));
    }
}
