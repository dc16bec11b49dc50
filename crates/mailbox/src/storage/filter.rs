//! Dynamic list filters compiled to parameterized SQL
//!
//! Every fragment is a static string; user input only ever travels as a
//! bound value.

use rusqlite::types::Value;

use crate::models::{Folder, MailboxScope, ThreadId};

pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmailSortField {
    #[default]
    ReceivedAt,
    SentAt,
    Subject,
    From,
}

impl std::str::FromStr for EmailSortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received_at" | "date" => Ok(Self::ReceivedAt),
            "sent_at" => Ok(Self::SentAt),
            "subject" => Ok(Self::Subject),
            "from" | "from_email" => Ok(Self::From),
            other => Err(format!("unknown sort field '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown sort order '{}'", other)),
        }
    }
}

/// A WHERE clause plus its bound values and an ORDER BY
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub where_clause: String,
    pub params: Vec<Value>,
    pub order_by: String,
}

/// Clamp a requested page size to `1..=MAX_LIMIT`
pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmailFilter {
    pub folder: Option<Folder>,
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub is_important: Option<bool>,
    pub has_attachments: Option<bool>,
    /// Substring of sender address or display name
    pub from: Option<String>,
    pub subject: Option<String>,
    /// Substring over subject, snippet, plain body and sender
    pub q: Option<String>,
    /// Every listed label must be present
    pub labels: Vec<String>,
    pub thread_id: Option<ThreadId>,
    pub sort_by: EmailSortField,
    pub sort_order: SortOrder,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl EmailFilter {
    pub fn folder(folder: Folder) -> Self {
        Self {
            folder: Some(folder),
            ..Default::default()
        }
    }

    pub fn limit(&self) -> u32 {
        clamp_limit(self.limit)
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    /// Compile against the `emails` table aliased as `e`
    pub fn compile(&self, scope: MailboxScope) -> CompiledQuery {
        let mut b = ClauseBuilder::scoped(["e.tenant_id = ?", "e.user_id = ?"], scope);

        if let Some(folder) = self.folder {
            b.push("e.folder = ?", [text(folder.as_str())]);
        }
        b.push_flag("e.is_read = ?", self.is_read);
        b.push_flag("e.is_starred = ?", self.is_starred);
        b.push_flag("e.is_important = ?", self.is_important);
        b.push_flag("e.has_attachments = ?", self.has_attachments);

        if let Some(from) = non_empty(&self.from) {
            let pattern = like_pattern(from);
            b.push(
                "(e.from_email LIKE ? ESCAPE '\\' OR e.from_name LIKE ? ESCAPE '\\')",
                [text(&pattern), text(&pattern)],
            );
        }
        if let Some(subject) = non_empty(&self.subject) {
            b.push("e.subject LIKE ? ESCAPE '\\'", [text(&like_pattern(subject))]);
        }
        if let Some(q) = non_empty(&self.q) {
            let pattern = like_pattern(q);
            b.push(
                "(e.subject LIKE ? ESCAPE '\\' OR e.snippet LIKE ? ESCAPE '\\' \
                 OR e.body_text LIKE ? ESCAPE '\\' OR e.from_email LIKE ? ESCAPE '\\')",
                [text(&pattern), text(&pattern), text(&pattern), text(&pattern)],
            );
        }
        for label in self.labels.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
            b.push(
                "EXISTS (SELECT 1 FROM json_each(e.labels) WHERE lower(json_each.value) = lower(?))",
                [text(label)],
            );
        }
        if let Some(thread_id) = self.thread_id {
            b.push("e.thread_id = ?", [text(&thread_id.to_string())]);
        }

        let column = match self.sort_by {
            EmailSortField::ReceivedAt => "e.activity_at",
            EmailSortField::SentAt => "COALESCE(e.sent_at, e.activity_at)",
            EmailSortField::Subject => "e.subject COLLATE NOCASE",
            EmailSortField::From => "e.from_email COLLATE NOCASE",
        };
        let dir = self.sort_order.sql();

        b.finish(format!("{} {}, e.created_at {}, e.id {}", column, dir, dir, dir))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadFilter {
    /// Threads with at least one member in this folder
    pub folder: Option<Folder>,
    pub is_unread: Option<bool>,
    pub is_starred: Option<bool>,
    pub label: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ThreadFilter {
    pub fn limit(&self) -> u32 {
        clamp_limit(self.limit)
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    /// Compile against the `email_threads` table aliased as `t`
    pub fn compile(&self, scope: MailboxScope) -> CompiledQuery {
        let mut b = ClauseBuilder::scoped(["t.tenant_id = ?", "t.user_id = ?"], scope);

        if let Some(folder) = self.folder {
            b.push(
                "EXISTS (SELECT 1 FROM emails m WHERE m.thread_id = t.id AND m.folder = ?)",
                [text(folder.as_str())],
            );
        }
        match self.is_unread {
            Some(true) => b.push("t.unread_count > 0", []),
            Some(false) => b.push("t.unread_count = 0", []),
            None => {}
        }
        b.push_flag("t.is_starred = ?", self.is_starred);
        if let Some(label) = non_empty(&self.label) {
            b.push(
                "EXISTS (SELECT 1 FROM json_each(t.labels) WHERE lower(json_each.value) = lower(?))",
                [text(label)],
            );
        }

        b.finish("t.last_message_at DESC, t.id DESC".to_string())
    }
}

struct ClauseBuilder {
    clauses: Vec<&'static str>,
    params: Vec<Value>,
}

impl ClauseBuilder {
    fn scoped(scope_clauses: [&'static str; 2], scope: MailboxScope) -> Self {
        Self {
            clauses: scope_clauses.to_vec(),
            params: vec![
                text(&scope.tenant_id.to_string()),
                text(&scope.user_id.to_string()),
            ],
        }
    }

    fn push<const N: usize>(&mut self, clause: &'static str, params: [Value; N]) {
        self.clauses.push(clause);
        self.params.extend(params);
    }

    fn push_flag(&mut self, clause: &'static str, value: Option<bool>) {
        if let Some(value) = value {
            self.push(clause, [Value::Integer(value as i64)]);
        }
    }

    fn finish(self, order_by: String) -> CompiledQuery {
        CompiledQuery {
            where_clause: self.clauses.join(" AND "),
            params: self.params,
            order_by,
        }
    }
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// `%needle%` with LIKE metacharacters escaped by `\`
fn like_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}
