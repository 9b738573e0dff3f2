//! Core types for the shogun coordinator.
//!
//! These types form the representation boundary for mailbox files,
//! persisted state, and the transport event contract.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Maximum number of entries retained in an agent's activity log.
pub const ACTIVITY_LOG_CAP: usize = 40;

/// Errors produced when parsing agent identities.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    #[error("Unknown agent id: {0}")]
    UnknownAgent(String),

    #[error("Ashigaru index must be >= 1: {0}")]
    ZeroIndex(String),
}

/// The tier an agent occupies in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    King,
    Shogun,
    Karou,
    Ashigaru,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::King => write!(f, "king"),
            Self::Shogun => write!(f, "shogun"),
            Self::Karou => write!(f, "karou"),
            Self::Ashigaru => write!(f, "ashigaru"),
        }
    }
}

/// An addressable endpoint in the hierarchy.
///
/// `King` is a human endpoint: the coordinator never dispatches a
/// runtime for it, and messages addressed to it are only surfaced
/// externally. All other identities are LLM-driven agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AgentId {
    King,
    Shogun,
    Karou,
    Ashigaru(u8),
}

impl AgentId {
    /// The role this identity belongs to.
    pub fn role(&self) -> Role {
        match self {
            Self::King => Role::King,
            Self::Shogun => Role::Shogun,
            Self::Karou => Role::Karou,
            Self::Ashigaru(_) => Role::Ashigaru,
        }
    }

    /// Whether this identity is driven by an LLM provider.
    pub fn is_llm_agent(&self) -> bool {
        !matches!(self, Self::King)
    }

    /// All ashigaru identities for a fleet of the given width.
    pub fn ashigaru_fleet(count: u8) -> Vec<AgentId> {
        (1..=count).map(AgentId::Ashigaru).collect()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::King => write!(f, "king"),
            Self::Shogun => write!(f, "shogun"),
            Self::Karou => write!(f, "karou"),
            Self::Ashigaru(n) => write!(f, "ashigaru{n}"),
        }
    }
}

impl FromStr for AgentId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "king" => Ok(Self::King),
            "shogun" => Ok(Self::Shogun),
            "karou" => Ok(Self::Karou),
            other => {
                let Some(digits) = other.strip_prefix("ashigaru") else {
                    return Err(IdentityError::UnknownAgent(other.to_string()));
                };
                let n: u8 = digits
                    .parse()
                    .map_err(|_| IdentityError::UnknownAgent(other.to_string()))?;
                if n == 0 {
                    return Err(IdentityError::ZeroIndex(other.to_string()));
                }
                Ok(Self::Ashigaru(n))
            }
        }
    }
}

impl Serialize for AgentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A message delivered through the mailbox.
///
/// The id is the mailbox filename stem and fully determines identity:
/// two observations of the same stem are the same message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub from: AgentId,
    pub to: AgentId,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Per-(thread, agent) binding to a provider-side conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBinding {
    pub provider: String,
    pub provider_thread_id: String,
    #[serde(default)]
    pub initialized: bool,
}

/// A king-level conversation.
///
/// `sessions` is populated lazily by each agent runtime on first use;
/// `updated_at` is refreshed whenever a message in the thread is
/// delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionBinding>,
}

impl Thread {
    /// Create a new thread with a fresh UUID id.
    ///
    /// Thread ids never contain `__` (the mailbox stem delimiter);
    /// UUIDs satisfy this by construction.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            sessions: BTreeMap::new(),
        }
    }

    /// Look up the session binding for an agent, if one exists.
    pub fn session(&self, agent: &AgentId) -> Option<&SessionBinding> {
        self.sessions.get(&agent.to_string())
    }
}

/// Whether an agent runtime is currently executing a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Busy,
}

/// One entry in an agent's bounded activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub activity: String,
}

/// Derived view of a single agent runtime, emitted on status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub role: Role,
    pub status: AgentState,
    pub queue_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_thread_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default)]
    pub activity_log: Vec<ActivityEntry>,
}
