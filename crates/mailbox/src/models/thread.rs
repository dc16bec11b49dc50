//! Thread model: the derived aggregate of a conversation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TenantId, ThreadId, UserId};

/// Subject used when nothing remains after prefix stripping
pub const EMPTY_SUBJECT: &str = "(no subject)";

const REPLY_PREFIXES: [&str; 5] = ["re", "fwd", "fw", "aw", "sv"];

/// A conversation in one user's mailbox
///
/// Every aggregate field is recomputed from the member emails whenever a
/// member is inserted or changes; nothing here is updated incrementally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    /// Subject with reply/forward prefixes stripped
    pub subject: String,
    /// Snippet of the most recent message
    pub snippet: String,
    /// Lowercased addresses from every member's from/to/cc
    pub participants: Vec<String>,
    pub message_count: u32,
    pub unread_count: u32,
    pub is_starred: bool,
    pub is_important: bool,
    pub has_attachments: bool,
    pub labels: Vec<String>,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn is_unread(&self) -> bool {
        self.unread_count > 0
    }
}

/// Strip any run of leading reply/forward prefixes from a subject
///
/// Handles `Re:`, `Fwd:`, `Fw:`, `Aw:`, `Sv:` in any case, with optional
/// bracketed counters such as `Re[2]:`.
pub fn normalize_subject(subject: &str) -> String {
    let mut rest = subject.trim();

    while let Some(stripped) = strip_one_prefix(rest) {
        rest = stripped.trim_start();
    }

    let rest = rest.trim();
    if rest.is_empty() {
        EMPTY_SUBJECT.to_string()
    } else {
        rest.to_string()
    }
}

fn strip_one_prefix(s: &str) -> Option<&str> {
    let lower = s.to_ascii_lowercase();

    for prefix in REPLY_PREFIXES {
        if !lower.starts_with(prefix) {
            continue;
        }
        let mut tail = &s[prefix.len()..];

        // Optional counter: "Re[2]:"
        if let Some(after_bracket) = tail.strip_prefix('[') {
            let Some(close) = after_bracket.find(']') else {
                continue;
            };
            if !after_bracket[..close].chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            tail = &after_bracket[close + 1..];
        }

        if let Some(after_colon) = tail.trim_start().strip_prefix(':') {
            return Some(after_colon);
        }
    }

    None
}
