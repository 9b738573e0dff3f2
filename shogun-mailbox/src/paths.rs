//! Mailbox directory grammar.
//!
//! Under the base root, message files live at
//! `{tier}/{to}/from/{from}/{stem}.md` where tier is `message_to`
//! (pending) or `message_processing` (claimed). Anything with the
//! wrong depth, extension, or segment labels is outside the grammar.

use std::path::{Component, Path, PathBuf};

use shogun_core::types::AgentId;

/// Pending vs claimed tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Pending,
    Processing,
}

impl Tier {
    pub fn segment(&self) -> &'static str {
        match self {
            Self::Pending => "message_to",
            Self::Processing => "message_processing",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "message_to" => Some(Self::Pending),
            "message_processing" => Some(Self::Processing),
            _ => None,
        }
    }
}

/// A message file's position in the mailbox tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxAddress {
    pub tier: Tier,
    pub to: AgentId,
    pub from: AgentId,
    pub stem: String,
}

impl MailboxAddress {
    /// The path of this address under `root`, in its current tier.
    pub fn path_under(&self, root: &Path) -> PathBuf {
        self.tier_path_under(root, self.tier)
    }

    /// The path of this address under `root` in the given tier.
    pub fn tier_path_under(&self, root: &Path, tier: Tier) -> PathBuf {
        root.join(tier.segment())
            .join(self.to.to_string())
            .join("from")
            .join(self.from.to_string())
            .join(format!("{}.md", self.stem))
    }

    /// The archive path under the history root for `thread_id`.
    pub fn archive_path(&self, history_root: &Path, thread_id: &str) -> PathBuf {
        history_root
            .join(thread_id)
            .join(Tier::Pending.segment())
            .join(self.to.to_string())
            .join("from")
            .join(self.from.to_string())
            .join(format!("{}.md", self.stem))
    }

    /// The idempotency-ledger key: the pending-relative path,
    /// regardless of which tier the file currently sits in.
    pub fn ledger_key(&self) -> String {
        format!(
            "{}/{}/from/{}/{}.md",
            Tier::Pending.segment(),
            self.to,
            self.from,
            self.stem
        )
    }
}

/// Parse a path relative to the mailbox root.
///
/// Returns `None` for anything outside the grammar: wrong depth, not
/// a `.md` file, unknown tier, unknown agent names, or a missing
/// `from` label.
pub fn parse_tier_path(root: &Path, path: &Path) -> Option<MailboxAddress> {
    let rel = path.strip_prefix(root).ok()?;
    let segments: Vec<&str> = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;

    let &[tier, to, from_label, from, file] = segments.as_slice() else {
        return None;
    };
    if from_label != "from" {
        return None;
    }
    let tier = Tier::from_segment(tier)?;
    let stem = file.strip_suffix(".md")?;
    if stem.is_empty() {
        return None;
    }
    let to: AgentId = to.parse().ok()?;
    let from: AgentId = from.parse().ok()?;
    Some(MailboxAddress {
        tier,
        to,
        from,
        stem: stem.to_string(),
    })
}

/// Ledger key for an observed path, when it parses.
pub fn ledger_key(root: &Path, path: &Path) -> Option<String> {
    parse_tier_path(root, path).map(|addr| addr.ledger_key())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/ws/.shogun")
    }

    #[test]
    fn test_parse_pending_path() {
        let path = root().join("message_to/shogun/from/king/t1__x__task.md");
        let addr = parse_tier_path(&root(), &path).unwrap();
        assert_eq!(addr.tier, Tier::Pending);
        assert_eq!(addr.to, AgentId::Shogun);
        assert_eq!(addr.from, AgentId::King);
        assert_eq!(addr.stem, "t1__x__task");
    }

    #[test]
    fn test_parse_processing_path() {
        let path = root().join("message_processing/karou/from/ashigaru2/t__x__r.md");
        let addr = parse_tier_path(&root(), &path).unwrap();
        assert_eq!(addr.tier, Tier::Processing);
        assert_eq!(addr.from, AgentId::Ashigaru(2));
    }

    #[test]
    fn test_rejects_outside_grammar() {
        let r = root();
        // Wrong depth
        assert!(parse_tier_path(&r, &r.join("message_to/shogun/t.md")).is_none());
        // Wrong extension
        assert!(parse_tier_path(&r, &r.join("message_to/shogun/from/king/t.txt")).is_none());
        // Wrong label
        assert!(parse_tier_path(&r, &r.join("message_to/shogun/by/king/t.md")).is_none());
        // Unknown tier
        assert!(parse_tier_path(&r, &r.join("message_done/shogun/from/king/t.md")).is_none());
        // Unknown agent
        assert!(parse_tier_path(&r, &r.join("message_to/wizard/from/king/t.md")).is_none());
        // Outside the root entirely
        assert!(parse_tier_path(&r, Path::new("/elsewhere/t.md")).is_none());
    }

    #[test]
    fn test_ledger_key_is_tier_independent() {
        let r = root();
        let pending = r.join("message_to/shogun/from/king/t1__x__task.md");
        let processing = r.join("message_processing/shogun/from/king/t1__x__task.md");
        assert_eq!(
            ledger_key(&r, &pending).unwrap(),
            ledger_key(&r, &processing).unwrap()
        );
        assert_eq!(
            ledger_key(&r, &pending).unwrap(),
            "message_to/shogun/from/king/t1__x__task.md"
        );
    }

    #[test]
    fn test_tier_mirror_paths() {
        let addr = MailboxAddress {
            tier: Tier::Pending,
            to: AgentId::Karou,
            from: AgentId::Shogun,
            stem: "t__x__sub".to_string(),
        };
        let r = root();
        assert_eq!(
            addr.tier_path_under(&r, Tier::Processing),
            r.join("message_processing/karou/from/shogun/t__x__sub.md")
        );
        assert_eq!(
            addr.archive_path(Path::new("/ws/.shogun/history"), "t"),
            Path::new("/ws/.shogun/history/t/message_to/karou/from/shogun/t__x__sub.md")
        );
    }
}
