//! Mailbox filename grammar.
//!
//! A stem is `{threadId}__{timestamp}-{rand6}__{slug}`:
//! - `threadId` is a UUID and never contains `__`
//! - `timestamp` is sortable ISO-8601 UTC with `:` and `.` replaced
//!   by `-`
//! - `rand6` is a 6-character opaque token
//! - `slug` is `[a-z0-9-]{1..60}`, falling back to `message`
//!
//! The stem fully determines the message id: parsing a stem back
//! yields the same thread id, and a title matching the original
//! modulo slug normalization.

use chrono::{DateTime, SecondsFormat, Utc};

/// Maximum slug length.
pub const SLUG_MAX: usize = 60;

/// Fallback slug when a title normalizes to nothing.
pub const SLUG_FALLBACK: &str = "message";

/// Thread id and title recovered from a stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStem {
    pub thread_id: Option<String>,
    pub title: String,
}

/// Normalize a title into a slug.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in title.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= SLUG_MAX {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        SLUG_FALLBACK.to_string()
    } else {
        slug
    }
}

fn timestamp_token(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

fn rand_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

/// Build a fresh stem for a message in `thread_id` titled `title`.
///
/// Callers get a unique stem per call; uniqueness comes from the
/// random token, sortability from the timestamp.
pub fn format_stem(thread_id: &str, title: &str) -> String {
    format!(
        "{thread_id}__{}-{}__{}",
        timestamp_token(Utc::now()),
        rand_token(),
        slugify(title)
    )
}

/// Recover thread id and title from a stem.
///
/// Three or more `__`-separated tokens is the canonical form; two
/// tokens is `{threadId}__{title}`; a single token is a bare title
/// with no thread id.
pub fn parse_stem(stem: &str) -> ParsedStem {
    let tokens: Vec<&str> = stem.split("__").collect();
    match tokens.len() {
        0 | 1 => ParsedStem {
            thread_id: None,
            title: stem.to_string(),
        },
        2 => ParsedStem {
            thread_id: Some(tokens[0].to_string()),
            title: tokens[1].to_string(),
        },
        _ => ParsedStem {
            thread_id: Some(tokens[0].to_string()),
            title: tokens[2..].join("__"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("task"), "task");
        assert_eq!(slugify("Deploy v2 NOW"), "deploy-v2-now");
        assert_eq!(slugify("auto_reply: rollcall"), "auto-reply-rollcall");
    }

    #[test]
    fn test_slugify_non_ascii_falls_back() {
        assert_eq!(slugify("調査して"), "message");
        assert_eq!(slugify(""), "message");
        assert_eq!(slugify("---"), "message");
    }

    #[test]
    fn test_slugify_truncates() {
        let long = "a".repeat(200);
        assert!(slugify(&long).len() <= SLUG_MAX);
    }

    #[test]
    fn test_stem_roundtrip() {
        let stem = format_stem("0f8fad5b-d9cb-469f-a165-70867728950e", "Investigate build");
        let parsed = parse_stem(&stem);
        assert_eq!(
            parsed.thread_id.as_deref(),
            Some("0f8fad5b-d9cb-469f-a165-70867728950e")
        );
        assert_eq!(parsed.title, "investigate-build");
    }

    #[test]
    fn test_stem_has_no_colons_or_dots() {
        let stem = format_stem("t1", "task");
        assert!(!stem.contains(':'));
        assert!(!stem.contains('.'));
    }

    #[test]
    fn test_stems_are_unique() {
        let a = format_stem("t1", "task");
        let b = format_stem("t1", "task");
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_two_token_form() {
        let parsed = parse_stem("t1__quick-note");
        assert_eq!(parsed.thread_id.as_deref(), Some("t1"));
        assert_eq!(parsed.title, "quick-note");
    }

    #[test]
    fn test_parse_single_token_form() {
        let parsed = parse_stem("orphan-note");
        assert_eq!(parsed.thread_id, None);
        assert_eq!(parsed.title, "orphan-note");
    }

    #[test]
    fn test_parse_title_containing_delimiter() {
        let parsed = parse_stem("t1__2025-01-01T00-00-00-000Z-abc123__a__b");
        assert_eq!(parsed.thread_id.as_deref(), Some("t1"));
        assert_eq!(parsed.title, "a__b");
    }

    #[test]
    fn test_stems_sort_by_time() {
        let early = format!("t__{}-{}__x", timestamp_token(Utc::now()), "aaaaaa");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let late = format!("t__{}-{}__x", timestamp_token(Utc::now()), "aaaaaa");
        assert!(early < late);
    }
}
