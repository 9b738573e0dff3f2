// shogun-core
//! Core types and pure logic for the shogun coordinator.
//!
//! This crate is free of filesystem and provider concerns: agent
//! identity, message and thread models, the authorization matrix,
//! the transport event contract, configuration, and system prompt
//! composition all live here.

pub mod authz;
pub mod config;
pub mod event;
pub mod prompt;
pub mod types;

pub use authz::{allowed_recipients, can_interrupt, default_superior};
pub use config::{Config, ModelsConfig, ProviderSpecificConfig, ServerConfig};
pub use event::{CoordinatorEvent, EventHub, EventSink, NullSink, StopPhase, ThreadInfo};
pub use prompt::compose_system_prompt;
pub use types::{
    ActivityEntry, AgentId, AgentSnapshot, AgentState, IdentityError, Message, Role,
    SessionBinding, Thread, ACTIVITY_LOG_CAP,
};
