//! Email model: one stored message in a user's mailbox

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EmailId, MailboxScope, TenantId, ThreadId, UserId};

/// Maximum snippet length in characters
const SNIPPET_MAX_CHARS: usize = 200;

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an email address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        Self {
            name: None,
            email: s.to_string(),
        }
    }

    /// Loose syntactic check: one `@` with non-empty local part and domain
    pub fn is_valid(&self) -> bool {
        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.is_empty()
                    && !domain.contains('@')
                    && !email.contains(char::is_whitespace)
            }
            None => false,
        }
    }

    /// Lowercased address, used for participant sets
    pub fn normalized(&self) -> String {
        self.email.trim().to_lowercase()
    }

    /// Format the email address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Coarse lifecycle bucket of a stored email
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Archive,
}

impl Folder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Sent => "sent",
            Folder::Drafts => "drafts",
            Folder::Trash => "trash",
            Folder::Archive => "archive",
        }
    }

    /// Drafts live in their own table and are never a move target
    pub fn accepts_moves(&self) -> bool {
        !matches!(self, Folder::Drafts)
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Folder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbox" => Ok(Folder::Inbox),
            "sent" => Ok(Folder::Sent),
            "drafts" | "draft" => Ok(Folder::Drafts),
            "trash" => Ok(Folder::Trash),
            "archive" | "archived" => Ok(Folder::Archive),
            other => Err(format!("unknown folder '{}'", other)),
        }
    }
}

/// A message stored in one user's mailbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub id: EmailId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub thread_id: ThreadId,
    /// Protocol `Message-ID`, always in `<...>` form
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub folder: Folder,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub snippet: String,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
    pub has_attachments: bool,
    pub labels: Vec<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Email {
    /// Timestamp used to order messages within a thread
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.received_at.or(self.sent_at).unwrap_or(self.created_at)
    }

    pub fn scope(&self) -> MailboxScope {
        MailboxScope::new(self.tenant_id, self.user_id)
    }
}

/// Everything needed to create an Email; the thread is resolved on insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEmail {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Explicit thread to join when it exists in the caller's mailbox
    pub thread_hint: Option<ThreadId>,
    pub folder: Folder,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
    pub labels: Vec<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl NewEmail {
    /// Create a new email builder
    pub fn builder(message_id: impl Into<String>, from: EmailAddress) -> NewEmailBuilder {
        NewEmailBuilder::new(message_id.into(), from)
    }

    pub fn snippet(&self) -> String {
        make_snippet(self.body_text.as_deref(), self.body_html.as_deref())
    }

    /// Timestamp used to order messages within a thread
    pub fn activity_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.received_at.or(self.sent_at).unwrap_or(now)
    }

    /// Every address on the message, sender first
    pub fn participants(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for addr in std::iter::once(&self.from).chain(&self.to).chain(&self.cc) {
            let normalized = addr.normalized();
            if !normalized.is_empty() && !out.contains(&normalized) {
                out.push(normalized);
            }
        }
        out
    }
}

/// Builder for creating NewEmail instances
pub struct NewEmailBuilder {
    inner: NewEmail,
}

impl NewEmailBuilder {
    fn new(message_id: String, from: EmailAddress) -> Self {
        Self {
            inner: NewEmail {
                message_id,
                in_reply_to: None,
                references: Vec::new(),
                thread_hint: None,
                folder: Folder::Inbox,
                from,
                to: Vec::new(),
                cc: Vec::new(),
                bcc: Vec::new(),
                subject: String::new(),
                body_html: None,
                body_text: None,
                is_read: false,
                is_starred: false,
                is_important: false,
                labels: Vec::new(),
                received_at: None,
                sent_at: None,
            },
        }
    }

    pub fn in_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.inner.in_reply_to = Some(message_id.into());
        self
    }

    pub fn references(mut self, references: Vec<String>) -> Self {
        self.inner.references = references;
        self
    }

    pub fn thread_hint(mut self, thread_id: Option<ThreadId>) -> Self {
        self.inner.thread_hint = thread_id;
        self
    }

    pub fn folder(mut self, folder: Folder) -> Self {
        self.inner.folder = folder;
        self
    }

    pub fn to(mut self, to: Vec<EmailAddress>) -> Self {
        self.inner.to = to;
        self
    }

    pub fn cc(mut self, cc: Vec<EmailAddress>) -> Self {
        self.inner.cc = cc;
        self
    }

    pub fn bcc(mut self, bcc: Vec<EmailAddress>) -> Self {
        self.inner.bcc = bcc;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.inner.subject = subject.into();
        self
    }

    pub fn body_text(mut self, body: Option<String>) -> Self {
        self.inner.body_text = body;
        self
    }

    pub fn body_html(mut self, body: Option<String>) -> Self {
        self.inner.body_html = body;
        self
    }

    pub fn read(mut self, is_read: bool) -> Self {
        self.inner.is_read = is_read;
        self
    }

    pub fn starred(mut self, is_starred: bool) -> Self {
        self.inner.is_starred = is_starred;
        self
    }

    pub fn important(mut self, is_important: bool) -> Self {
        self.inner.is_important = is_important;
        self
    }

    pub fn labels(mut self, labels: Vec<String>) -> Self {
        self.inner.labels = labels;
        self
    }

    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.inner.received_at = Some(at);
        self
    }

    pub fn sent_at(mut self, at: DateTime<Utc>) -> Self {
        self.inner.sent_at = Some(at);
        self
    }

    pub fn build(self) -> NewEmail {
        let mut email = self.inner;
        email.message_id = normalize_message_id(&email.message_id);
        email.in_reply_to = email
            .in_reply_to
            .as_deref()
            .map(normalize_message_id)
            .filter(|id| id.len() > 2);
        email.references = split_references(&email.references);
        email
    }
}

/// Canonical `<id@host>` form of a Message-ID header value
pub fn normalize_message_id(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
    format!("<{}>", trimmed)
}

/// Flatten a References header that may arrive as one whitespace-separated value
pub fn split_references(raw: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for entry in raw {
        for part in entry.split(|c: char| c.is_whitespace() || c == ',') {
            if part.trim().is_empty() {
                continue;
            }
            let id = normalize_message_id(part);
            if id.len() > 2 && !out.contains(&id) {
                out.push(id);
            }
        }
    }
    out
}

/// Build a preview from the plain body, falling back to tag-stripped HTML
pub fn make_snippet(body_text: Option<&str>, body_html: Option<&str>) -> String {
    let source = match body_text.filter(|t| !t.trim().is_empty()) {
        Some(text) => text.to_string(),
        None => body_html.map(strip_tags).unwrap_or_default(),
    };

    let collapsed = source.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SNIPPET_MAX_CHARS {
        return collapsed;
    }
    let mut truncated: String = collapsed.chars().take(SNIPPET_MAX_CHARS).collect();
    truncated.push_str("...");
    truncated
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_email_with_name() {
        let addr = EmailAddress::parse("John Doe <john@example.com>");
        assert_eq!(addr.name, Some("John Doe".to_string()));
        assert_eq!(addr.email, "john@example.com");
    }

    #[test]
    fn test_parse_email_with_quoted_name() {
        let addr = EmailAddress::parse("\"Doe, John\" <john@example.com>");
        assert_eq!(addr.name, Some("Doe, John".to_string()));
    }

    #[test]
    fn test_parse_email_without_name() {
        let addr = EmailAddress::parse("john@example.com");
        assert_eq!(addr.name, None);
        assert_eq!(addr.email, "john@example.com");
    }

    #[test]
    fn test_display_with_name() {
        let addr = EmailAddress::with_name("John Doe", "john@example.com");
        assert_eq!(addr.display(), "John Doe <john@example.com>");
    }

    #[test]
    fn test_is_valid() {
        assert!(EmailAddress::new("a@b.com").is_valid());
        assert!(!EmailAddress::new("a.b.com").is_valid());
        assert!(!EmailAddress::new("@b.com").is_valid());
        assert!(!EmailAddress::new("a@").is_valid());
        assert!(!EmailAddress::new("a b@c.com").is_valid());
    }

    #[test]
    fn test_folder_parse() {
        assert_eq!("Inbox".parse::<Folder>().unwrap(), Folder::Inbox);
        assert_eq!("archived".parse::<Folder>().unwrap(), Folder::Archive);
        assert!("spam".parse::<Folder>().is_err());
        assert!(!Folder::Drafts.accepts_moves());
        assert!(Folder::Trash.accepts_moves());
    }

    #[test]
    fn test_normalize_message_id() {
        assert_eq!(normalize_message_id("abc@host"), "<abc@host>");
        assert_eq!(normalize_message_id("  <abc@host> "), "<abc@host>");
    }

    #[test]
    fn test_split_references() {
        let refs = split_references(&["<a@x> <b@x>".to_string(), "c@x".to_string(), "<a@x>".to_string()]);
        assert_eq!(refs, vec!["<a@x>", "<b@x>", "<c@x>"]);
    }

    #[test]
    fn test_snippet_prefers_text_and_collapses_whitespace() {
        let snippet = make_snippet(Some("Hello\n\n   world"), Some("<p>ignored</p>"));
        assert_eq!(snippet, "Hello world");
    }

    #[test]
    fn test_snippet_falls_back_to_html() {
        let snippet = make_snippet(None, Some("<p>Hi&nbsp;<b>there</b></p>"));
        assert_eq!(snippet, "Hi there");
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let body = "é".repeat(500);
        let snippet = make_snippet(Some(&body), None);
        assert_eq!(snippet.chars().count(), SNIPPET_MAX_CHARS + 3);
        assert!(snippet.ends_with("..."));
    }

    #[test]
    fn test_builder_normalizes_headers() {
        let email = NewEmail::builder("m1@host", EmailAddress::new("a@x.com"))
            .in_reply_to("m0@host")
            .references(vec!["<r1@host> r2@host".to_string()])
            .build();
        assert_eq!(email.message_id, "<m1@host>");
        assert_eq!(email.in_reply_to.as_deref(), Some("<m0@host>"));
        assert_eq!(email.references, vec!["<r1@host>", "<r2@host>"]);
    }

    #[test]
    fn test_participants_are_deduplicated() {
        let email = NewEmail::builder("m1@host", EmailAddress::new("A@x.com"))
            .to(vec![EmailAddress::new("b@x.com"), EmailAddress::new("a@x.com")])
            .cc(vec![EmailAddress::new("c@x.com")])
            .build();
        assert_eq!(email.participants(), vec!["a@x.com", "b@x.com", "c@x.com"]);
    }
}
