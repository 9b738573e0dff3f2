//! Authorization matrix for outbound messages.
//!
//! Pure functions from agent identity to the set of recipients that
//! identity may address. Enforcement happens in the agent runtime when
//! a tool call names recipients; denied recipients are reported back
//! to the model, never treated as fatal.

use std::collections::BTreeSet;

use crate::types::AgentId;

/// The recipients an agent may address with `sendMessage`.
///
/// - shogun → king and karou
/// - karou → shogun and every ashigaru
/// - ashigaruN → karou and every other ashigaru
/// - king is a human endpoint and has no runtime; its writes are
///   injected externally and not filtered here.
pub fn allowed_recipients(agent: &AgentId, ashigaru_count: u8) -> BTreeSet<AgentId> {
    let mut set = BTreeSet::new();
    match agent {
        AgentId::King => {
            set.insert(AgentId::Shogun);
        }
        AgentId::Shogun => {
            set.insert(AgentId::King);
            set.insert(AgentId::Karou);
        }
        AgentId::Karou => {
            set.insert(AgentId::Shogun);
            set.extend(AgentId::ashigaru_fleet(ashigaru_count));
        }
        AgentId::Ashigaru(n) => {
            set.insert(AgentId::Karou);
            set.extend(
                AgentId::ashigaru_fleet(ashigaru_count)
                    .into_iter()
                    .filter(|peer| peer != &AgentId::Ashigaru(*n)),
            );
        }
    }
    set
}

/// The default superior an agent auto-replies to when a turn produces
/// plain text with no tool calls.
pub fn default_superior(agent: &AgentId) -> Option<AgentId> {
    match agent {
        AgentId::King => None,
        AgentId::Shogun => Some(AgentId::King),
        AgentId::Karou => Some(AgentId::Shogun),
        AgentId::Ashigaru(_) => Some(AgentId::Karou),
    }
}

/// Interrupt authorization is stricter than send authorization: only a
/// direct superior may interrupt (shogun → karou, karou → ashigaruN).
pub fn can_interrupt(caller: &AgentId, target: &AgentId) -> bool {
    match (caller, target) {
        (AgentId::Shogun, AgentId::Karou) => true,
        (AgentId::Karou, AgentId::Ashigaru(_)) => true,
        _ => false,
    }
}
