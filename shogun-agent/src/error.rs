//! Agent errors.

/// Errors that can occur during agent execution.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Store error: {0}")]
    Store(#[from] shogun_store::StoreError),

    #[error("Mailbox error: {0}")]
    Mailbox(String),

    #[error("Agent stopped")]
    Stopped,

    #[error("Turn was cancelled")]
    Cancelled,

    #[error("Unknown runtime: {0}")]
    UnknownRuntime(String),
}

impl From<crate::provider::ProviderError> for AgentError {
    fn from(err: crate::provider::ProviderError) -> Self {
        match err {
            crate::provider::ProviderError::Cancelled => Self::Cancelled,
            other => Self::Provider(other.to_string()),
        }
    }
}

impl From<shogun_mailbox::MailboxError> for AgentError {
    fn from(err: shogun_mailbox::MailboxError) -> Self {
        Self::Mailbox(err.to_string())
    }
}
