//! Thread-oriented LLM provider interface.
//!
//! The runtime drives every agent through this capability set and
//! treats `output_text` as the sole response surface; `raw` is passed
//! through for diagnostics and never interpreted. The concrete
//! provider (and its SDK) lives outside this crate; tests and smoke
//! runs use [`ScriptedProvider`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Best-effort progress telemetry for an in-flight call.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Provider failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider call was cancelled")]
    Cancelled,

    #[error("Provider failure: {0}")]
    Failed(String),
}

/// Request to open a fresh provider-side thread.
#[derive(Debug, Clone)]
pub struct CreateThreadRequest {
    pub working_directory: PathBuf,
    /// System prompt (plus ACK request) seeding the thread.
    pub initial_input: Option<String>,
}

/// A provider-side thread handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderThread {
    pub id: String,
}

/// One turn's input.
#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub thread_id: String,
    pub input: String,
}

/// One turn's output.
#[derive(Debug, Clone)]
pub struct SendMessageResponse {
    pub output_text: String,
    pub raw: Option<serde_json::Value>,
}

/// Capability set the runtime consumes.
#[async_trait]
pub trait ThreadProvider: Send + Sync {
    /// Open a provider-side thread, seeding it with `initial_input`.
    async fn create_thread(
        &self,
        request: CreateThreadRequest,
    ) -> Result<ProviderThread, ProviderError>;

    /// Attach to an existing provider-side thread.
    async fn resume_thread(&self, id: &str) -> Result<ProviderThread, ProviderError>;

    /// Feed `input` and await the provider's next response. `cancel`
    /// MUST abort an in-flight call.
    async fn send_message(
        &self,
        request: SendMessageRequest,
        cancel: CancellationToken,
        on_progress: Option<ProgressFn>,
    ) -> Result<SendMessageResponse, ProviderError>;

    /// Optional explicit cancel hook.
    async fn cancel(&self, _thread_id: &str) {}

    fn name(&self) -> &'static str;
}

/// One scripted reaction of the [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Return this text as `output_text`.
    Text(String),
    /// Block until the call is cancelled.
    Hang,
    /// Fail the call.
    Fail(String),
}

/// Deterministic provider for tests and smoke runs.
///
/// Responses are consumed front-to-front across all threads; an
/// exhausted script answers with an empty turn. Every input is
/// recorded for assertions.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    inputs: Mutex<Vec<(String, String)>>,
    next_thread: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            inputs: Mutex::new(Vec::new()),
            next_thread: AtomicU32::new(1),
        }
    }

    /// Script of plain-text turns.
    pub fn with_texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| ScriptedResponse::Text(t.to_string())).collect())
    }

    /// Append another scripted response.
    pub fn push(&self, response: ScriptedResponse) {
        self.responses
            .lock()
            .expect("responses lock poisoned")
            .push_back(response);
    }

    /// Every `(thread_id, input)` pair seen so far, in call order.
    pub fn inputs(&self) -> Vec<(String, String)> {
        self.inputs.lock().expect("inputs lock poisoned").clone()
    }

    fn record(&self, thread_id: &str, input: &str) {
        self.inputs
            .lock()
            .expect("inputs lock poisoned")
            .push((thread_id.to_string(), input.to_string()));
    }
}

#[async_trait]
impl ThreadProvider for ScriptedProvider {
    async fn create_thread(
        &self,
        request: CreateThreadRequest,
    ) -> Result<ProviderThread, ProviderError> {
        let n = self.next_thread.fetch_add(1, Ordering::SeqCst);
        let id = format!("scripted-{n}");
        if let Some(initial) = request.initial_input {
            self.record(&id, &initial);
        }
        Ok(ProviderThread { id })
    }

    async fn resume_thread(&self, id: &str) -> Result<ProviderThread, ProviderError> {
        Ok(ProviderThread { id: id.to_string() })
    }

    async fn send_message(
        &self,
        request: SendMessageRequest,
        cancel: CancellationToken,
        _on_progress: Option<ProgressFn>,
    ) -> Result<SendMessageResponse, ProviderError> {
        self.record(&request.thread_id, &request.input);

        let next = self
            .responses
            .lock()
            .expect("responses lock poisoned")
            .pop_front();
        match next {
            Some(ScriptedResponse::Text(text)) => Ok(SendMessageResponse {
                output_text: text,
                raw: None,
            }),
            Some(ScriptedResponse::Hang) => {
                cancel.cancelled().await;
                Err(ProviderError::Cancelled)
            }
            Some(ScriptedResponse::Fail(message)) => Err(ProviderError::Failed(message)),
            None => Ok(SendMessageResponse {
                output_text: String::new(),
                raw: None,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_returns_in_order() {
        let provider = ScriptedProvider::with_texts(&["first", "second"]);
        let cancel = CancellationToken::new();

        let a = provider
            .send_message(
                SendMessageRequest {
                    thread_id: "t".to_string(),
                    input: "hi".to_string(),
                },
                cancel.clone(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(a.output_text, "first");

        let b = provider
            .send_message(
                SendMessageRequest {
                    thread_id: "t".to_string(),
                    input: "next".to_string(),
                },
                cancel.clone(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(b.output_text, "second");

        // Exhausted script answers empty.
        let c = provider
            .send_message(
                SendMessageRequest {
                    thread_id: "t".to_string(),
                    input: "again".to_string(),
                },
                cancel,
                None,
            )
            .await
            .unwrap();
        assert_eq!(c.output_text, "");
    }

    #[tokio::test]
    async fn test_create_thread_records_initial_input() {
        let provider = ScriptedProvider::with_texts(&[]);
        let thread = provider
            .create_thread(CreateThreadRequest {
                working_directory: PathBuf::from("."),
                initial_input: Some("system prompt".to_string()),
            })
            .await
            .unwrap();

        let inputs = provider.inputs();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].0, thread.id);
        assert_eq!(inputs[0].1, "system prompt");
    }

    #[tokio::test]
    async fn test_hang_aborts_on_cancel() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedResponse::Hang]));
        let cancel = CancellationToken::new();

        let call = {
            let provider = provider.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                provider
                    .send_message(
                        SendMessageRequest {
                            thread_id: "t".to_string(),
                            input: "x".to_string(),
                        },
                        cancel,
                        None,
                    )
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }
}
