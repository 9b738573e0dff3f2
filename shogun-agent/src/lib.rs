// shogun-agent
//! Per-agent execution for the shogun coordinator.
//!
//! One [`AgentRuntime`] per LLM-driven agent: a FIFO inbox, a single
//! in-flight turn, tool-call interpretation over the provider's text
//! output, durable `waitForMessage` suspension, and cancellation. The
//! [`AgentManager`] constructs the fleet and routes inbound messages.

pub mod error;
pub mod manager;
pub mod provider;
pub mod runtime;
pub mod tools;

pub use error::AgentError;
pub use manager::{AgentManager, AgentManagerConfig, RoleProviders};
pub use provider::{
    CreateThreadRequest, ProgressFn, ProviderError, ProviderThread, ScriptedProvider,
    ScriptedResponse, SendMessageRequest, SendMessageResponse, ThreadProvider,
};
pub use runtime::{
    AgentRuntime, AgentRuntimeConfig, AshigaruStatus, FleetOps, InterruptReason, StatusCallback,
    DEFAULT_MAX_LOOPS, DEFAULT_WAIT_BUDGET, DEFAULT_WAIT_TIMEOUT_MS,
};
pub use tools::{parse_tool_lines, ToolLine, ToolRequest};
