//! Atomic mailbox-file writer.
//!
//! Producers write a uniquely-named temp sibling and rename it into
//! `message_to/{to}/from/{from}/`. The rename is the linearization
//! point: the watcher never observes a partially-written `.md` file.

use std::path::{Path, PathBuf};

use shogun_core::types::AgentId;
use shogun_store::atomic::write_atomic;

use crate::error::MailboxError;
use crate::paths::{MailboxAddress, Tier};
use crate::stem::format_stem;

/// Writes outbound messages into the pending mailbox tier.
#[derive(Clone)]
pub struct MessageWriter {
    root: PathBuf,
}

impl MessageWriter {
    /// `root` is the mailbox base directory (conventionally
    /// `.shogun/`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write one message. Returns the pending path; its stem is the
    /// message id.
    pub async fn write(
        &self,
        thread_id: &str,
        from: &AgentId,
        to: &AgentId,
        title: &str,
        body: &str,
    ) -> Result<PathBuf, MailboxError> {
        let addr = MailboxAddress {
            tier: Tier::Pending,
            to: *to,
            from: *from,
            stem: format_stem(thread_id, title),
        };
        let path = addr.path_under(&self.root);
        write_atomic(&path, body.as_bytes(), false).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::parse_tier_path;
    use crate::stem::parse_stem;

    #[tokio::test]
    async fn test_write_lands_in_pending_tier() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MessageWriter::new(dir.path());

        let path = writer
            .write("t1", &AgentId::King, &AgentId::Shogun, "task", "調査して")
            .await
            .unwrap();

        assert!(path.starts_with(dir.path().join("message_to/shogun/from/king")));
        let body = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(body, "調査して");
    }

    #[tokio::test]
    async fn test_written_path_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MessageWriter::new(dir.path());

        let path = writer
            .write("t1", &AgentId::Shogun, &AgentId::Karou, "sub task", "A")
            .await
            .unwrap();

        let addr = parse_tier_path(dir.path(), &path).unwrap();
        assert_eq!(addr.to, AgentId::Karou);
        assert_eq!(addr.from, AgentId::Shogun);

        let parsed = parse_stem(&addr.stem);
        assert_eq!(parsed.thread_id.as_deref(), Some("t1"));
        assert_eq!(parsed.title, "sub-task");
    }

    #[tokio::test]
    async fn test_repeated_writes_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MessageWriter::new(dir.path());

        let a = writer
            .write("t1", &AgentId::King, &AgentId::Shogun, "task", "1")
            .await
            .unwrap();
        let b = writer
            .write("t1", &AgentId::King, &AgentId::Shogun, "task", "2")
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_no_temp_files_visible_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MessageWriter::new(dir.path());
        writer
            .write("t1", &AgentId::King, &AgentId::Shogun, "task", "x")
            .await
            .unwrap();

        let pending = dir.path().join("message_to/shogun/from/king");
        let mut entries = tokio::fs::read_dir(&pending).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().to_string();
            assert!(name.ends_with(".md"), "unexpected file: {name}");
        }
    }
}
