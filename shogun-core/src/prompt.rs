//! System prompt composition.
//!
//! The runtime treats the composed prompt as opaque text; everything
//! here is a pure function of role, agent id, and the two directory
//! paths, plus the optional per-ashigaru persona profiles.

use std::collections::BTreeMap;
use std::path::Path;

use crate::types::{AgentId, Role};

const SHARED_PREAMBLE: &str = r#"You are one agent in a hierarchical chain of command: king -> shogun -> karou -> ashigaru. You never talk to a human directly; every instruction reaches you as a mailbox message and every reply you give leaves as one.

# Tool lines
Emit tool calls as single lines in your output, one call per line:
- TOOL:sendMessage to=<agent>[,<agent>] title="..." body="..."
- TOOL:sendMessage to=<agent> title="..." bodyFile=<path under your tmp dir>
- TOOL:waitForMessage timeoutMs=<n>
- TOOL:interruptAgent to=<agent> [title="..." body="..."]
- TOOL:getAshigaruStatus
A JSON form is also accepted: TOOL sendMessage {"to":"karou","title":"...","body":"..."}
Values may be bare, "double-quoted", or 'single-quoted'; use \n for newlines inside quotes.

If you produce plain text with no tool line, it is forwarded to your superior as an auto-reply. Prefer explicit sendMessage calls."#;

const SHOGUN_DUTIES: &str = r#"# Your post: shogun
You receive orders from the king and delegate to the karou. Break the king's instruction into work the karou can distribute, send it with sendMessage to=karou, then waitForMessage for the karou's report. Report outcomes back to the king yourself; never fabricate subordinate results."#;

const KAROU_DUTIES: &str = r#"# Your post: karou
You receive work from the shogun and distribute it across the ashigaru. Use getAshigaruStatus to find idle soldiers, assign with sendMessage (one clear task per message), and waitForMessage to collect results. Aggregate before reporting to the shogun. You may interrupt a stuck ashigaru with interruptAgent."#;

const ASHIGARU_DUTIES: &str = r#"# Your post: ashigaru
You execute the task the karou assigned, completely and without delegating further. Report the result to the karou with sendMessage. If the task is ambiguous, state your assumption in the report rather than stalling."#;

/// Compose the full system prompt for an agent.
pub fn compose_system_prompt(
    agent: &AgentId,
    base_dir: &Path,
    history_dir: &Path,
    ashigaru_profiles: &BTreeMap<String, String>,
) -> String {
    let duties = match agent.role() {
        Role::Shogun => SHOGUN_DUTIES,
        Role::Karou => KAROU_DUTIES,
        Role::Ashigaru | Role::King => ASHIGARU_DUTIES,
    };

    let mut prompt = format!(
        "{SHARED_PREAMBLE}\n\n{duties}\n\n# Identity\nYou are `{agent}`.\n\
         Mailbox root: {}\nHistory root: {}\n\
         Scratch space for bodyFile payloads: {}\n",
        base_dir.display(),
        history_dir.display(),
        base_dir.join("tmp").join(agent.to_string()).display(),
    );

    if let Some(profile) = ashigaru_profiles.get(&agent.to_string()) {
        prompt.push_str("\n# Profile\n");
        prompt.push_str(profile);
        prompt.push('\n');
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn compose(agent: AgentId) -> String {
        compose_system_prompt(
            &agent,
            &PathBuf::from("/ws/.shogun"),
            &PathBuf::from("/ws/.shogun/history"),
            &BTreeMap::new(),
        )
    }

    #[test]
    fn test_prompt_names_the_agent() {
        let prompt = compose(AgentId::Ashigaru(2));
        assert!(prompt.contains("`ashigaru2`"));
        assert!(prompt.contains("/ws/.shogun/tmp/ashigaru2"));
    }

    #[test]
    fn test_role_sections_differ() {
        let shogun = compose(AgentId::Shogun);
        let karou = compose(AgentId::Karou);
        assert!(shogun.contains("Your post: shogun"));
        assert!(karou.contains("Your post: karou"));
        assert_ne!(shogun, karou);
    }

    #[test]
    fn test_profile_injected_for_matching_agent() {
        let mut profiles = BTreeMap::new();
        profiles.insert("ashigaru1".to_string(), "Fast scout.".to_string());
        let prompt = compose_system_prompt(
            &AgentId::Ashigaru(1),
            &PathBuf::from(".shogun"),
            &PathBuf::from(".shogun/history"),
            &profiles,
        );
        assert!(prompt.contains("Fast scout."));

        let other = compose_system_prompt(
            &AgentId::Ashigaru(2),
            &PathBuf::from(".shogun"),
            &PathBuf::from(".shogun/history"),
            &profiles,
        );
        assert!(!other.contains("Fast scout."));
    }

    #[test]
    fn test_prompt_documents_tool_grammar() {
        let prompt = compose(AgentId::Karou);
        assert!(prompt.contains("TOOL:sendMessage"));
        assert!(prompt.contains("TOOL:waitForMessage"));
        assert!(prompt.contains("TOOL:getAshigaruStatus"));
    }
}
