//! SQLite-based mailbox storage

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::{debug, info, warn};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, Value, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use rusqlite_migration::{M, Migrations};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::filter::{EmailFilter, ThreadFilter, clamp_limit};
use super::traits::{InsertOutcome, MailboxStore, MutationOutcome, PurgeOutcome};
use crate::error::{MailboxError, Result};
use crate::models::{
    Attachment, AttachmentId, AttachmentParent, Draft, DraftFields, DraftId, Email, EmailAddress,
    EmailId, EmailMutation, EmailState, Folder, Label, LabelFields, LabelId, MailboxScope,
    NewEmail, Page, SentFiling, Signature, SignatureFields, SignatureId, TenantId, Thread,
    ThreadId, UnfiledSend, UnfiledSendId, UserId,
};
use crate::threading::{self, Resolution, ThreadLookup};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Conversation aggregates, recomputed from member emails
            CREATE TABLE email_threads (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                snippet TEXT NOT NULL DEFAULT '',
                participants TEXT NOT NULL DEFAULT '[]',
                message_count INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                is_starred INTEGER NOT NULL DEFAULT 0,
                is_important INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                labels TEXT NOT NULL DEFAULT '[]',
                last_message_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX idx_threads_scope
                ON email_threads(tenant_id, user_id, last_message_at DESC);

            CREATE TABLE emails (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                thread_id TEXT NOT NULL REFERENCES email_threads(id),
                message_id TEXT NOT NULL,
                in_reply_to TEXT,
                reference_ids TEXT NOT NULL DEFAULT '[]',
                folder TEXT NOT NULL
                    CHECK (folder IN ('inbox', 'sent', 'drafts', 'trash', 'archive')),
                from_name TEXT,
                from_email TEXT NOT NULL,
                to_addrs TEXT NOT NULL DEFAULT '[]',
                cc_addrs TEXT NOT NULL DEFAULT '[]',
                bcc_addrs TEXT NOT NULL DEFAULT '[]',
                subject TEXT NOT NULL,
                body_html TEXT,
                body_text TEXT,
                snippet TEXT NOT NULL DEFAULT '',
                is_read INTEGER NOT NULL DEFAULT 0,
                is_starred INTEGER NOT NULL DEFAULT 0,
                is_important INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                labels TEXT NOT NULL DEFAULT '[]',
                received_at TEXT,
                sent_at TEXT,
                activity_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, user_id, message_id)
            );

            CREATE INDEX idx_emails_folder
                ON emails(tenant_id, user_id, folder, activity_at DESC);
            CREATE INDEX idx_emails_thread ON emails(thread_id, activity_at);

            CREATE TABLE email_drafts (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                from_addr TEXT,
                to_addrs TEXT NOT NULL DEFAULT '[]',
                cc_addrs TEXT NOT NULL DEFAULT '[]',
                bcc_addrs TEXT NOT NULL DEFAULT '[]',
                subject TEXT NOT NULL DEFAULT '',
                body_html TEXT,
                body_text TEXT,
                thread_id TEXT,
                in_reply_to TEXT,
                reference_ids TEXT NOT NULL DEFAULT '[]',
                scheduled_for TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX idx_drafts_scope ON email_drafts(tenant_id, user_id, updated_at DESC);

            -- An attachment belongs to an email, a draft, or nothing yet
            CREATE TABLE email_attachments (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                email_id TEXT REFERENCES emails(id) ON DELETE CASCADE,
                draft_id TEXT REFERENCES email_drafts(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                blob_key TEXT NOT NULL,
                blob_bucket TEXT NOT NULL,
                created_at TEXT NOT NULL,
                CHECK (email_id IS NULL OR draft_id IS NULL)
            );

            CREATE INDEX idx_attachments_email ON email_attachments(email_id);
            CREATE INDEX idx_attachments_draft ON email_attachments(draft_id);
            CREATE INDEX idx_attachments_orphans
                ON email_attachments(tenant_id, created_at)
                WHERE email_id IS NULL AND draft_id IS NULL;

            CREATE TABLE email_labels (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL COLLATE NOCASE,
                color TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, user_id, name)
            );

            CREATE TABLE email_signatures (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                body_html TEXT NOT NULL DEFAULT '',
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX idx_signatures_scope ON email_signatures(tenant_id, user_id);
            CREATE UNIQUE INDEX idx_signatures_one_default
                ON email_signatures(tenant_id, user_id) WHERE is_default = 1;
            "#,
        ),
        // Migration 2: Sends that went out but could not be filed
        M::up(
            r#"
            CREATE TABLE unfiled_sends (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                draft_id TEXT,
                filing TEXT NOT NULL,
                error TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                resolved_email_id TEXT
            );

            CREATE INDEX idx_unfiled_scope ON unfiled_sends(tenant_id, user_id, created_at DESC);
            CREATE INDEX idx_unfiled_draft ON unfiled_sends(draft_id) WHERE resolved_at IS NULL;
            "#,
        ),
        // Migration 3: Claim held by an in-flight send
        M::up("ALTER TABLE email_drafts ADD COLUMN sending_since TEXT;"),
    ])
}

const EMAIL_COLUMNS: &str = "e.id, e.tenant_id, e.user_id, e.thread_id, e.message_id, \
     e.in_reply_to, e.reference_ids, e.folder, e.from_name, e.from_email, e.to_addrs, \
     e.cc_addrs, e.bcc_addrs, e.subject, e.body_html, e.body_text, e.snippet, e.is_read, \
     e.is_starred, e.is_important, e.has_attachments, e.labels, e.received_at, e.sent_at, \
     e.created_at, e.updated_at";

const THREAD_COLUMNS: &str = "t.id, t.tenant_id, t.user_id, t.subject, t.snippet, \
     t.participants, t.message_count, t.unread_count, t.is_starred, t.is_important, \
     t.has_attachments, t.labels, t.last_message_at, t.created_at, t.updated_at";

const DRAFT_COLUMNS: &str = "id, tenant_id, user_id, from_addr, to_addrs, cc_addrs, bcc_addrs, \
     subject, body_html, body_text, thread_id, in_reply_to, reference_ids, scheduled_for, \
     created_at, updated_at";

const ATTACHMENT_COLUMNS: &str = "id, tenant_id, user_id, email_id, draft_id, filename, \
     content_type, size_bytes, blob_key, blob_bucket, created_at";

const LABEL_COLUMNS: &str = "id, tenant_id, user_id, name, color, created_at, updated_at";

const SIGNATURE_COLUMNS: &str =
    "id, tenant_id, user_id, name, body_html, is_default, created_at, updated_at";

const UNFILED_COLUMNS: &str = "id, tenant_id, user_id, message_id, draft_id, filing, error, \
     created_at, resolved_at, resolved_email_id";

/// Aggregate recomputation for one thread, executed inside the caller's transaction.
/// `?1` is the thread id, `?2` the update timestamp.
/// A send claim older than this is considered abandoned and can be taken over
const SEND_CLAIM_TIMEOUT_MINUTES: i64 = 15;

const RECOMPUTE_THREAD_SQL: &str = r#"
    UPDATE email_threads SET
        message_count = (SELECT COUNT(*) FROM emails WHERE thread_id = ?1),
        unread_count = (SELECT COUNT(*) FROM emails WHERE thread_id = ?1 AND is_read = 0),
        is_starred = EXISTS (SELECT 1 FROM emails WHERE thread_id = ?1 AND is_starred = 1),
        is_important = EXISTS (SELECT 1 FROM emails WHERE thread_id = ?1 AND is_important = 1),
        has_attachments = EXISTS (
            SELECT 1 FROM emails WHERE thread_id = ?1 AND has_attachments = 1
        ),
        snippet = COALESCE((
            SELECT snippet FROM emails WHERE thread_id = ?1
            ORDER BY activity_at DESC, created_at DESC LIMIT 1
        ), ''),
        last_message_at = COALESCE(
            (SELECT MAX(activity_at) FROM emails WHERE thread_id = ?1),
            last_message_at
        ),
        participants = (
            SELECT json_group_array(addr) FROM (
                SELECT lower(from_email) AS addr FROM emails WHERE thread_id = ?1
                UNION
                SELECT lower(json_extract(r.value, '$.email'))
                FROM emails, json_each(emails.to_addrs) AS r
                WHERE emails.thread_id = ?1
                UNION
                SELECT lower(json_extract(r.value, '$.email'))
                FROM emails, json_each(emails.cc_addrs) AS r
                WHERE emails.thread_id = ?1
                ORDER BY 1
            )
        ),
        labels = (
            SELECT json_group_array(name) FROM (
                SELECT DISTINCT l.value AS name
                FROM emails, json_each(emails.labels) AS l
                WHERE emails.thread_id = ?1
                ORDER BY 1
            )
        ),
        updated_at = ?2
    WHERE id = ?1
"#;

// ============================================================================
// Column conversions
// ============================================================================

macro_rules! sql_uuid_id {
    ($($name:ty),* $(,)?) => {
        $(
            impl ToSql for $name {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.0.to_string()))
                }
            }

            impl FromSql for $name {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    let raw = value.as_str()?;
                    Uuid::parse_str(raw)
                        .map(Self)
                        .map_err(|e| FromSqlError::Other(Box::new(e)))
                }
            }
        )*
    };
}

sql_uuid_id!(
    TenantId,
    UserId,
    EmailId,
    ThreadId,
    DraftId,
    AttachmentId,
    LabelId,
    SignatureId,
    UnfiledSendId,
);

impl ToSql for Folder {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Folder {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn col_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn col_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn col_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn col_opt_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn email_from_row(row: &Row<'_>) -> rusqlite::Result<Email> {
    Ok(Email {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        thread_id: row.get(3)?,
        message_id: row.get(4)?,
        in_reply_to: row.get(5)?,
        references: col_json(row, 6)?,
        folder: row.get(7)?,
        from: EmailAddress {
            name: row.get(8)?,
            email: row.get(9)?,
        },
        to: col_json(row, 10)?,
        cc: col_json(row, 11)?,
        bcc: col_json(row, 12)?,
        subject: row.get(13)?,
        body_html: row.get(14)?,
        body_text: row.get(15)?,
        snippet: row.get(16)?,
        is_read: row.get(17)?,
        is_starred: row.get(18)?,
        is_important: row.get(19)?,
        has_attachments: row.get(20)?,
        labels: col_json(row, 21)?,
        received_at: col_opt_ts(row, 22)?,
        sent_at: col_opt_ts(row, 23)?,
        created_at: col_ts(row, 24)?,
        updated_at: col_ts(row, 25)?,
    })
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        subject: row.get(3)?,
        snippet: row.get(4)?,
        participants: col_json(row, 5)?,
        message_count: row.get(6)?,
        unread_count: row.get(7)?,
        is_starred: row.get(8)?,
        is_important: row.get(9)?,
        has_attachments: row.get(10)?,
        labels: col_json(row, 11)?,
        last_message_at: col_ts(row, 12)?,
        created_at: col_ts(row, 13)?,
        updated_at: col_ts(row, 14)?,
    })
}

/// Draft row without its attachment list, which lives on the attachment rows
fn draft_from_row(row: &Row<'_>) -> rusqlite::Result<Draft> {
    Ok(Draft {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        fields: DraftFields {
            from: col_opt_json(row, 3)?,
            to: col_json(row, 4)?,
            cc: col_json(row, 5)?,
            bcc: col_json(row, 6)?,
            subject: row.get(7)?,
            body_html: row.get(8)?,
            body_text: row.get(9)?,
            thread_id: row.get(10)?,
            in_reply_to: row.get(11)?,
            references: col_json(row, 12)?,
            attachment_ids: Vec::new(),
            scheduled_for: col_opt_ts(row, 13)?,
        },
        created_at: col_ts(row, 14)?,
        updated_at: col_ts(row, 15)?,
    })
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    let size: i64 = row.get(7)?;
    Ok(Attachment {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        parent: AttachmentParent::from_columns(row.get(3)?, row.get(4)?),
        filename: row.get(5)?,
        content_type: row.get(6)?,
        size_bytes: size.max(0) as u64,
        blob_key: row.get(8)?,
        blob_bucket: row.get(9)?,
        created_at: col_ts(row, 10)?,
    })
}

fn label_from_row(row: &Row<'_>) -> rusqlite::Result<Label> {
    Ok(Label {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        name: row.get(3)?,
        color: row.get(4)?,
        created_at: col_ts(row, 5)?,
        updated_at: col_ts(row, 6)?,
    })
}

fn signature_from_row(row: &Row<'_>) -> rusqlite::Result<Signature> {
    Ok(Signature {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        name: row.get(3)?,
        body_html: row.get(4)?,
        is_default: row.get(5)?,
        created_at: col_ts(row, 6)?,
        updated_at: col_ts(row, 7)?,
    })
}

fn unfiled_from_row(row: &Row<'_>) -> rusqlite::Result<UnfiledSend> {
    Ok(UnfiledSend {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        message_id: row.get(3)?,
        draft_id: row.get(4)?,
        filing: col_json(row, 5)?,
        error: row.get(6)?,
        created_at: col_ts(row, 7)?,
        resolved_at: col_opt_ts(row, 8)?,
        resolved_email_id: row.get(9)?,
    })
}

// ============================================================================
// Transaction-scoped helpers
// ============================================================================

/// Header lookups for thread reconciliation, confined to the open transaction
struct SqliteLookup<'a> {
    conn: &'a Connection,
}

impl ThreadLookup for SqliteLookup<'_> {
    fn thread_exists(&self, scope: MailboxScope, thread_id: ThreadId) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM email_threads WHERE id = ? AND tenant_id = ? AND user_id = ?
             )",
            params![thread_id, scope.tenant_id, scope.user_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn thread_for_message_id(
        &self,
        scope: MailboxScope,
        message_id: &str,
    ) -> Result<Option<ThreadId>> {
        let thread_id = self
            .conn
            .query_row(
                "SELECT thread_id FROM emails
                 WHERE tenant_id = ? AND user_id = ? AND message_id = ?",
                params![scope.tenant_id, scope.user_id, message_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(thread_id)
    }
}

fn select_email(conn: &Connection, scope: MailboxScope, id: EmailId) -> Result<Option<Email>> {
    let sql = format!(
        "SELECT {} FROM emails e WHERE e.id = ? AND e.tenant_id = ? AND e.user_id = ?",
        EMAIL_COLUMNS
    );
    let email = conn
        .query_row(&sql, params![id, scope.tenant_id, scope.user_id], email_from_row)
        .optional()?;
    Ok(email)
}

fn select_email_by_message_id(
    conn: &Connection,
    scope: MailboxScope,
    message_id: &str,
) -> Result<Option<Email>> {
    let sql = format!(
        "SELECT {} FROM emails e WHERE e.tenant_id = ? AND e.user_id = ? AND e.message_id = ?",
        EMAIL_COLUMNS
    );
    let email = conn
        .query_row(
            &sql,
            params![scope.tenant_id, scope.user_id, message_id],
            email_from_row,
        )
        .optional()?;
    Ok(email)
}

/// Insert the email row, creating its thread when reconciliation finds none.
/// The caller recomputes the thread once its other writes are done.
fn insert_email_row(
    conn: &Connection,
    scope: MailboxScope,
    email: &NewEmail,
    now: DateTime<Utc>,
) -> Result<(EmailId, ThreadId)> {
    let lookup = SqliteLookup { conn };
    let resolution = threading::resolve_thread(&lookup, scope, email)?;
    let activity_at = email.activity_at(now);

    if let Resolution::New(thread) = &resolution {
        conn.execute(
            "INSERT INTO email_threads
             (id, tenant_id, user_id, subject, participants, last_message_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                thread.id,
                scope.tenant_id,
                scope.user_id,
                thread.subject,
                to_json(&thread.participants)?,
                ts(&activity_at),
                ts(&now),
                ts(&now),
            ],
        )?;
    }

    let thread_id = resolution.thread_id();
    let id = EmailId::new();

    conn.execute(
        "INSERT INTO emails
         (id, tenant_id, user_id, thread_id, message_id, in_reply_to, reference_ids, folder,
          from_name, from_email, to_addrs, cc_addrs, bcc_addrs, subject, body_html, body_text,
          snippet, is_read, is_starred, is_important, has_attachments, labels,
          received_at, sent_at, activity_at, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            scope.tenant_id,
            scope.user_id,
            thread_id,
            email.message_id,
            email.in_reply_to,
            to_json(&email.references)?,
            email.folder,
            email.from.name,
            email.from.email,
            to_json(&email.to)?,
            to_json(&email.cc)?,
            to_json(&email.bcc)?,
            email.subject,
            email.body_html,
            email.body_text,
            email.snippet(),
            email.is_read,
            email.is_starred,
            email.is_important,
            to_json(&email.labels)?,
            email.received_at.as_ref().map(ts),
            email.sent_at.as_ref().map(ts),
            ts(&activity_at),
            ts(&now),
            ts(&now),
        ],
    )?;

    debug!(
        "[STORE] Inserted email {} into thread {} ({:?}) for {}",
        id,
        thread_id,
        resolution_kind(&resolution),
        scope
    );
    Ok((id, thread_id))
}

fn resolution_kind(resolution: &Resolution) -> &'static str {
    match resolution {
        Resolution::Existing { matched, .. } => match matched {
            threading::MatchedBy::Hint => "hint",
            threading::MatchedBy::InReplyTo => "in-reply-to",
            threading::MatchedBy::References => "references",
        },
        Resolution::New(_) => "new",
    }
}

/// Recompute a thread's aggregates from its members.
/// Returns false when the thread had no members left and was removed.
fn recompute_thread(conn: &Connection, thread_id: ThreadId, now: DateTime<Utc>) -> Result<bool> {
    let members: i64 = conn.query_row(
        "SELECT COUNT(*) FROM emails WHERE thread_id = ?",
        [thread_id],
        |row| row.get(0),
    )?;

    if members == 0 {
        conn.execute("DELETE FROM email_threads WHERE id = ?", [thread_id])?;
        return Ok(false);
    }

    conn.execute(RECOMPUTE_THREAD_SQL, params![thread_id, ts(&now)])?;
    Ok(true)
}

fn draft_scope(conn: &Connection, id: DraftId) -> Result<Option<MailboxScope>> {
    let scope = conn
        .query_row(
            "SELECT tenant_id, user_id FROM email_drafts WHERE id = ?",
            [id],
            |row| Ok(MailboxScope::new(row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(scope)
}

fn select_draft(conn: &Connection, scope: MailboxScope, id: DraftId) -> Result<Option<Draft>> {
    let sql = format!(
        "SELECT {} FROM email_drafts WHERE id = ? AND tenant_id = ? AND user_id = ?",
        DRAFT_COLUMNS
    );
    let draft = conn
        .query_row(&sql, params![id, scope.tenant_id, scope.user_id], draft_from_row)
        .optional()?;

    match draft {
        Some(mut draft) => {
            draft.fields.attachment_ids = draft_attachment_ids(conn, id)?;
            Ok(Some(draft))
        }
        None => Ok(None),
    }
}

fn unresolved_send_exists(conn: &Connection, scope: MailboxScope, draft_id: DraftId) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS (
            SELECT 1 FROM unfiled_sends
            WHERE draft_id = ? AND tenant_id = ? AND user_id = ? AND resolved_at IS NULL
         )",
        params![draft_id, scope.tenant_id, scope.user_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn claim_cutoff(now: DateTime<Utc>) -> String {
    ts(&(now - Duration::minutes(SEND_CLAIM_TIMEOUT_MINUTES)))
}

/// A draft that is being sent, or whose send awaits refiling, is frozen
fn ensure_draft_unlocked(
    conn: &Connection,
    scope: MailboxScope,
    id: DraftId,
    now: DateTime<Utc>,
) -> Result<()> {
    if unresolved_send_exists(conn, scope, id)? {
        return Err(MailboxError::constraint(format!(
            "draft {} was already sent and is waiting to be refiled",
            id
        )));
    }

    let sending_since: Option<String> = conn
        .query_row(
            "SELECT sending_since FROM email_drafts
             WHERE id = ? AND tenant_id = ? AND user_id = ?",
            params![id, scope.tenant_id, scope.user_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    match sending_since {
        Some(since) if since > claim_cutoff(now) => Err(MailboxError::constraint(format!(
            "draft {} is being sent",
            id
        ))),
        _ => Ok(()),
    }
}

fn draft_attachment_ids(conn: &Connection, id: DraftId) -> Result<Vec<AttachmentId>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM email_attachments WHERE draft_id = ? ORDER BY created_at, id",
    )?;
    let ids = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

fn write_draft(
    conn: &Connection,
    scope: MailboxScope,
    id: DraftId,
    fields: &DraftFields,
    exists: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    let from = fields.from.as_ref().map(to_json).transpose()?;
    let scheduled_for = fields.scheduled_for.as_ref().map(ts);

    if exists {
        conn.execute(
            "UPDATE email_drafts SET
                from_addr = ?, to_addrs = ?, cc_addrs = ?, bcc_addrs = ?, subject = ?,
                body_html = ?, body_text = ?, thread_id = ?, in_reply_to = ?,
                reference_ids = ?, scheduled_for = ?, updated_at = ?
             WHERE id = ? AND tenant_id = ? AND user_id = ?",
            params![
                from,
                to_json(&fields.to)?,
                to_json(&fields.cc)?,
                to_json(&fields.bcc)?,
                fields.subject,
                fields.body_html,
                fields.body_text,
                fields.thread_id,
                fields.in_reply_to,
                to_json(&fields.references)?,
                scheduled_for,
                ts(&now),
                id,
                scope.tenant_id,
                scope.user_id,
            ],
        )?;
    } else {
        conn.execute(
            "INSERT INTO email_drafts
             (id, tenant_id, user_id, from_addr, to_addrs, cc_addrs, bcc_addrs, subject,
              body_html, body_text, thread_id, in_reply_to, reference_ids, scheduled_for,
              created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                scope.tenant_id,
                scope.user_id,
                from,
                to_json(&fields.to)?,
                to_json(&fields.cc)?,
                to_json(&fields.bcc)?,
                fields.subject,
                fields.body_html,
                fields.body_text,
                fields.thread_id,
                fields.in_reply_to,
                to_json(&fields.references)?,
                scheduled_for,
                ts(&now),
                ts(&now),
            ],
        )?;
    }

    replace_draft_attachments(conn, scope, id, &fields.attachment_ids)
}

/// Make the draft's attachment set exactly `wanted`: listed orphans are
/// adopted, previously attached rows that are no longer listed become orphans
fn replace_draft_attachments(
    conn: &Connection,
    scope: MailboxScope,
    draft_id: DraftId,
    wanted: &[AttachmentId],
) -> Result<()> {
    for current in draft_attachment_ids(conn, draft_id)? {
        if !wanted.contains(&current) {
            conn.execute(
                "UPDATE email_attachments SET draft_id = NULL WHERE id = ?",
                [current],
            )?;
        }
    }

    for id in wanted {
        let parent = conn
            .query_row(
                "SELECT email_id, draft_id FROM email_attachments
                 WHERE id = ? AND tenant_id = ? AND user_id = ?",
                params![id, scope.tenant_id, scope.user_id],
                |row| {
                    Ok(AttachmentParent::from_columns(
                        row.get::<_, Option<EmailId>>(0)?,
                        row.get::<_, Option<DraftId>>(1)?,
                    ))
                },
            )
            .optional()?;

        match parent {
            None => return Err(MailboxError::not_found(format!("attachment {}", id))),
            Some(AttachmentParent::Draft(d)) if d == draft_id => {}
            Some(AttachmentParent::Orphaned) => {
                conn.execute(
                    "UPDATE email_attachments SET draft_id = ? WHERE id = ?",
                    params![draft_id, id],
                )?;
            }
            Some(_) => {
                return Err(MailboxError::constraint(format!(
                    "attachment {} already belongs to another message",
                    id
                )));
            }
        }
    }

    Ok(())
}

/// Persistence half of a send; runs entirely inside the caller's transaction
fn file_sent_email_tx(
    conn: &Connection,
    scope: MailboxScope,
    filing: &SentFiling,
    now: DateTime<Utc>,
) -> Result<Email> {
    if let Some(draft_id) = filing.draft_id
        && draft_scope(conn, draft_id)? != Some(scope)
    {
        return Err(MailboxError::not_found(format!("draft {}", draft_id)));
    }

    let (email_id, thread_id) = insert_email_row(conn, scope, &filing.email, now)?;

    if let Some(draft_id) = filing.draft_id {
        conn.execute(
            "UPDATE email_attachments SET email_id = ?, draft_id = NULL
             WHERE draft_id = ? AND tenant_id = ? AND user_id = ?",
            params![email_id, draft_id, scope.tenant_id, scope.user_id],
        )?;
    }

    for attachment_id in &filing.attachment_ids {
        let adopted = conn.execute(
            "UPDATE email_attachments SET email_id = ?, draft_id = NULL
             WHERE id = ? AND tenant_id = ? AND user_id = ?
               AND email_id IS NULL AND draft_id IS NULL",
            params![email_id, attachment_id, scope.tenant_id, scope.user_id],
        )?;
        if adopted == 0 {
            return Err(MailboxError::not_found(format!(
                "orphaned attachment {}",
                attachment_id
            )));
        }
    }

    conn.execute(
        "UPDATE emails SET has_attachments =
            EXISTS (SELECT 1 FROM email_attachments WHERE email_id = ?1)
         WHERE id = ?1",
        [email_id],
    )?;

    if let Some(draft_id) = filing.draft_id {
        conn.execute("DELETE FROM email_drafts WHERE id = ?", [draft_id])?;
    }

    recompute_thread(conn, thread_id, now)?;

    select_email(conn, scope, email_id)?
        .ok_or_else(|| MailboxError::not_found(format!("email {}", email_id)))
}

/// Rewrite the label set of every email carrying `name`, recomputing touched threads
fn rewrite_email_labels(
    conn: &Connection,
    scope: MailboxScope,
    name: &str,
    replacement: Option<&str>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let rows: Vec<(EmailId, ThreadId, String)> = {
        let mut stmt = conn.prepare(
            "SELECT e.id, e.thread_id, e.labels FROM emails e
             WHERE e.tenant_id = ? AND e.user_id = ?
               AND EXISTS (
                   SELECT 1 FROM json_each(e.labels) WHERE lower(json_each.value) = lower(?)
               )",
        )?;
        stmt.query_map(params![scope.tenant_id, scope.user_id, name], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut threads: Vec<ThreadId> = Vec::new();
    for (id, thread_id, raw) in &rows {
        let labels: Vec<String> = serde_json::from_str(raw)?;
        let mut next: Vec<String> = Vec::with_capacity(labels.len());
        for label in labels {
            let label = if label.eq_ignore_ascii_case(name) {
                match replacement {
                    Some(new_name) => new_name.to_string(),
                    None => continue,
                }
            } else {
                label
            };
            if !next.iter().any(|l| l.eq_ignore_ascii_case(&label)) {
                next.push(label);
            }
        }
        conn.execute(
            "UPDATE emails SET labels = ?, updated_at = ? WHERE id = ?",
            params![to_json(&next)?, ts(&now), id],
        )?;
        if !threads.contains(thread_id) {
            threads.push(*thread_id);
        }
    }

    for thread_id in threads {
        recompute_thread(conn, thread_id, now)?;
    }
    Ok(rows.len())
}

fn clear_default_signature(conn: &Connection, scope: MailboxScope) -> Result<()> {
    conn.execute(
        "UPDATE email_signatures SET is_default = 0
         WHERE tenant_id = ? AND user_id = ? AND is_default = 1",
        params![scope.tenant_id, scope.user_id],
    )?;
    Ok(())
}

fn select_signature(
    conn: &Connection,
    scope: MailboxScope,
    id: SignatureId,
) -> Result<Option<Signature>> {
    let sql = format!(
        "SELECT {} FROM email_signatures WHERE id = ? AND tenant_id = ? AND user_id = ?",
        SIGNATURE_COLUMNS
    );
    let signature = conn
        .query_row(&sql, params![id, scope.tenant_id, scope.user_id], signature_from_row)
        .optional()?;
    Ok(signature)
}

fn select_label(conn: &Connection, scope: MailboxScope, id: LabelId) -> Result<Option<Label>> {
    let sql = format!(
        "SELECT {} FROM email_labels WHERE id = ? AND tenant_id = ? AND user_id = ?",
        LABEL_COLUMNS
    );
    let label = conn
        .query_row(&sql, params![id, scope.tenant_id, scope.user_id], label_from_row)
        .optional()?;
    Ok(label)
}

fn select_attachment(
    conn: &Connection,
    scope: MailboxScope,
    id: AttachmentId,
) -> Result<Option<Attachment>> {
    let sql = format!(
        "SELECT {} FROM email_attachments WHERE id = ? AND tenant_id = ? AND user_id = ?",
        ATTACHMENT_COLUMNS
    );
    let attachment = conn
        .query_row(&sql, params![id, scope.tenant_id, scope.user_id], attachment_from_row)
        .optional()?;
    Ok(attachment)
}

fn select_unfiled(
    conn: &Connection,
    scope: MailboxScope,
    id: UnfiledSendId,
) -> Result<Option<UnfiledSend>> {
    let sql = format!(
        "SELECT {} FROM unfiled_sends WHERE id = ? AND tenant_id = ? AND user_id = ?",
        UNFILED_COLUMNS
    );
    let unfiled = conn
        .query_row(&sql, params![id, scope.tenant_id, scope.user_id], unfiled_from_row)
        .optional()?;
    Ok(unfiled)
}

fn label_conflict(err: MailboxError, name: &str) -> MailboxError {
    match err {
        MailboxError::Constraint { .. } => {
            MailboxError::constraint(format!("label '{}' already exists", name))
        }
        other => other,
    }
}

// ============================================================================
// Store
// ============================================================================

/// SQLite-based mailbox storage
///
/// One connection behind a mutex; every multi-statement write runs in a
/// transaction, including the thread recomputation it triggers.
pub struct SqliteMailboxStore {
    conn: Mutex<Connection>,
}

impl SqliteMailboxStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn open(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {:?}", db_path))?;

        // WAL lets readers proceed during writes; NORMAL sync is safe with WAL.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        info!("[STORE] Opened mailbox database at {:?}", db_path);
        Self::init(conn)
    }

    /// Private in-memory database, used by tests and the in-memory config
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> anyhow::Result<Self> {
        // Required for ON DELETE CASCADE on attachment rows
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| MailboxError::Database {
            message: "database connection lock poisoned".to_string(),
        })
    }
}

impl MailboxStore for SqliteMailboxStore {
    fn insert_email(&self, scope: MailboxScope, email: &NewEmail) -> Result<InsertOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let Some(existing) = select_email_by_message_id(&tx, scope, &email.message_id)? {
            debug!(
                "[STORE] Email {} already present as {} for {}",
                email.message_id, existing.id, scope
            );
            return Ok(InsertOutcome {
                email: existing,
                created: false,
            });
        }

        let now = Utc::now();
        let (email_id, thread_id) = insert_email_row(&tx, scope, email, now)?;
        recompute_thread(&tx, thread_id, now)?;
        let stored = select_email(&tx, scope, email_id)?
            .ok_or_else(|| MailboxError::not_found(format!("email {}", email_id)))?;

        tx.commit()?;
        Ok(InsertOutcome {
            email: stored,
            created: true,
        })
    }

    fn get_email(&self, scope: MailboxScope, id: EmailId) -> Result<Option<Email>> {
        let conn = self.conn()?;
        select_email(&conn, scope, id)
    }

    fn get_emails(&self, scope: MailboxScope, ids: &[EmailId]) -> Result<Vec<Email>> {
        let conn = self.conn()?;
        let mut emails = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(email) = select_email(&conn, scope, *id)? {
                emails.push(email);
            }
        }
        Ok(emails)
    }

    fn find_email_by_message_id(
        &self,
        scope: MailboxScope,
        message_id: &str,
    ) -> Result<Option<Email>> {
        let conn = self.conn()?;
        select_email_by_message_id(&conn, scope, message_id)
    }

    fn list_emails(&self, scope: MailboxScope, filter: &EmailFilter) -> Result<Page<Email>> {
        let conn = self.conn()?;
        let query = filter.compile(scope);
        let (limit, offset) = (filter.limit(), filter.offset());

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM emails e WHERE {}", query.where_clause),
            params_from_iter(query.params.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM emails e WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            EMAIL_COLUMNS, query.where_clause, query.order_by
        );
        let mut values = query.params;
        values.push(Value::Integer(limit as i64));
        values.push(Value::Integer(offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let emails = stmt
            .query_map(params_from_iter(values.iter()), email_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page::new(emails, total as u64, limit, offset))
    }

    fn all_emails(&self) -> Result<Vec<Email>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM emails e ORDER BY e.created_at", EMAIL_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let emails = stmt
            .query_map([], email_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(emails)
    }

    fn apply_mutation(
        &self,
        scope: MailboxScope,
        ids: &[EmailId],
        mutation: &EmailMutation,
    ) -> Result<MutationOutcome> {
        if let EmailMutation::Move(folder) = mutation
            && !folder.accepts_moves()
        {
            return Err(MailboxError::validation(
                "folder",
                format!("'{}' is not a valid move target", folder),
            ));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let mut outcome = MutationOutcome::default();
        let mut seen = HashSet::new();

        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            let Some(email) = select_email(&tx, scope, *id)? else {
                continue;
            };

            if !outcome.threads_recomputed.contains(&email.thread_id) {
                outcome.threads_recomputed.push(email.thread_id);
            }

            let Some(next) = mutation.apply(&EmailState::from(&email)) else {
                continue;
            };

            tx.execute(
                "UPDATE emails SET folder = ?, is_read = ?, is_starred = ?, is_important = ?,
                    labels = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    next.folder,
                    next.is_read,
                    next.is_starred,
                    next.is_important,
                    to_json(&next.labels)?,
                    ts(&now),
                    id,
                ],
            )?;
            outcome.updated += 1;
        }

        for thread_id in &outcome.threads_recomputed {
            recompute_thread(&tx, *thread_id, now)?;
        }

        tx.commit()?;
        Ok(outcome)
    }

    fn delete_permanent(&self, scope: MailboxScope, ids: &[EmailId]) -> Result<PurgeOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let mut outcome = PurgeOutcome::default();
        let mut threads: Vec<ThreadId> = Vec::new();

        for id in ids {
            if outcome.deleted.contains(id) {
                continue;
            }
            let row: Option<(ThreadId, Folder)> = tx
                .query_row(
                    "SELECT thread_id, folder FROM emails
                     WHERE id = ? AND tenant_id = ? AND user_id = ?",
                    params![id, scope.tenant_id, scope.user_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((thread_id, Folder::Trash)) = row else {
                outcome.skipped += 1;
                continue;
            };

            let mut stmt =
                tx.prepare("SELECT blob_key FROM email_attachments WHERE email_id = ?")?;
            let keys = stmt
                .query_map([id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);
            outcome.blob_keys.extend(keys);

            tx.execute("DELETE FROM email_attachments WHERE email_id = ?", [id])?;
            tx.execute("DELETE FROM emails WHERE id = ?", [id])?;
            outcome.deleted.push(*id);

            if !threads.contains(&thread_id) {
                threads.push(thread_id);
            }
        }

        for thread_id in threads {
            if recompute_thread(&tx, thread_id, now)? {
                outcome.threads_recomputed.push(thread_id);
            } else {
                outcome.threads_removed.push(thread_id);
            }
        }

        tx.commit()?;
        info!(
            "[STORE] Permanently deleted {} emails ({} skipped) for {}",
            outcome.deleted.len(),
            outcome.skipped,
            scope
        );
        Ok(outcome)
    }

    fn get_thread(&self, scope: MailboxScope, id: ThreadId) -> Result<Option<Thread>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM email_threads t WHERE t.id = ? AND t.tenant_id = ? AND t.user_id = ?",
            THREAD_COLUMNS
        );
        let thread = conn
            .query_row(&sql, params![id, scope.tenant_id, scope.user_id], thread_from_row)
            .optional()?;
        Ok(thread)
    }

    fn list_threads(&self, scope: MailboxScope, filter: &ThreadFilter) -> Result<Page<Thread>> {
        let conn = self.conn()?;
        let query = filter.compile(scope);
        let (limit, offset) = (filter.limit(), filter.offset());

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM email_threads t WHERE {}", query.where_clause),
            params_from_iter(query.params.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM email_threads t WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            THREAD_COLUMNS, query.where_clause, query.order_by
        );
        let mut values = query.params;
        values.push(Value::Integer(limit as i64));
        values.push(Value::Integer(offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let threads = stmt
            .query_map(params_from_iter(values.iter()), thread_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page::new(threads, total as u64, limit, offset))
    }

    fn list_thread_emails(&self, scope: MailboxScope, id: ThreadId) -> Result<Vec<Email>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM emails e
             WHERE e.thread_id = ? AND e.tenant_id = ? AND e.user_id = ?
             ORDER BY e.activity_at ASC, e.created_at ASC",
            EMAIL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let emails = stmt
            .query_map(params![id, scope.tenant_id, scope.user_id], email_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(emails)
    }

    fn create_draft(&self, scope: MailboxScope, fields: &DraftFields) -> Result<Draft> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id = DraftId::new();

        write_draft(&tx, scope, id, fields, false, Utc::now())?;
        let draft = select_draft(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("draft {}", id)))?;

        tx.commit()?;
        Ok(draft)
    }

    fn update_draft(
        &self,
        scope: MailboxScope,
        id: DraftId,
        fields: &DraftFields,
    ) -> Result<Draft> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let now = Utc::now();
        if draft_scope(&tx, id)? != Some(scope) {
            return Err(MailboxError::not_found(format!("draft {}", id)));
        }
        ensure_draft_unlocked(&tx, scope, id, now)?;
        write_draft(&tx, scope, id, fields, true, now)?;
        let draft = select_draft(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("draft {}", id)))?;

        tx.commit()?;
        Ok(draft)
    }

    fn save_draft(&self, scope: MailboxScope, id: DraftId, fields: &DraftFields) -> Result<Draft> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let now = Utc::now();
        let exists = match draft_scope(&tx, id)? {
            Some(owner) if owner == scope => true,
            // Another mailbox owns this id
            Some(_) => return Err(MailboxError::not_found(format!("draft {}", id))),
            None => false,
        };
        if exists {
            ensure_draft_unlocked(&tx, scope, id, now)?;
        }
        write_draft(&tx, scope, id, fields, exists, now)?;
        let draft = select_draft(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("draft {}", id)))?;

        tx.commit()?;
        Ok(draft)
    }

    fn get_draft(&self, scope: MailboxScope, id: DraftId) -> Result<Option<Draft>> {
        let conn = self.conn()?;
        select_draft(&conn, scope, id)
    }

    fn list_drafts(&self, scope: MailboxScope, limit: u32, offset: u32) -> Result<Page<Draft>> {
        let conn = self.conn()?;
        let limit = clamp_limit(Some(limit));

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM email_drafts WHERE tenant_id = ? AND user_id = ?",
            params![scope.tenant_id, scope.user_id],
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM email_drafts WHERE tenant_id = ? AND user_id = ?
             ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?",
            DRAFT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut drafts = stmt
            .query_map(
                params![scope.tenant_id, scope.user_id, limit as i64, offset as i64],
                draft_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for draft in &mut drafts {
            draft.fields.attachment_ids = draft_attachment_ids(&conn, draft.id)?;
        }

        Ok(Page::new(drafts, total as u64, limit, offset))
    }

    fn delete_draft(&self, scope: MailboxScope, id: DraftId) -> Result<Vec<Attachment>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if draft_scope(&tx, id)? != Some(scope) {
            return Err(MailboxError::not_found(format!("draft {}", id)));
        }
        ensure_draft_unlocked(&tx, scope, id, Utc::now())?;

        let sql = format!(
            "SELECT {} FROM email_attachments WHERE draft_id = ?",
            ATTACHMENT_COLUMNS
        );
        let mut stmt = tx.prepare(&sql)?;
        let attachments = stmt
            .query_map([id], attachment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        tx.execute("DELETE FROM email_attachments WHERE draft_id = ?", [id])?;
        tx.execute("DELETE FROM email_drafts WHERE id = ?", [id])?;

        tx.commit()?;
        Ok(attachments)
    }

    fn claim_draft_for_send(&self, scope: MailboxScope, id: DraftId) -> Result<Draft> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();

        if draft_scope(&tx, id)? != Some(scope) {
            return Err(MailboxError::not_found(format!("draft {}", id)));
        }
        if unresolved_send_exists(&tx, scope, id)? {
            return Err(MailboxError::constraint(format!(
                "draft {} was already sent and is waiting to be refiled",
                id
            )));
        }

        let claimed = tx.execute(
            "UPDATE email_drafts SET sending_since = ?
             WHERE id = ? AND tenant_id = ? AND user_id = ?
               AND (sending_since IS NULL OR sending_since <= ?)",
            params![ts(&now), id, scope.tenant_id, scope.user_id, claim_cutoff(now)],
        )?;
        if claimed == 0 {
            return Err(MailboxError::constraint(format!("draft {} is being sent", id)));
        }

        let draft = select_draft(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("draft {}", id)))?;
        tx.commit()?;
        debug!("[STORE] Claimed draft {} for sending for {}", id, scope);
        Ok(draft)
    }

    fn release_draft_claim(&self, scope: MailboxScope, id: DraftId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE email_drafts SET sending_since = NULL
             WHERE id = ? AND tenant_id = ? AND user_id = ?",
            params![id, scope.tenant_id, scope.user_id],
        )?;
        Ok(())
    }

    fn file_sent_email(&self, scope: MailboxScope, filing: &SentFiling) -> Result<Email> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let email = file_sent_email_tx(&tx, scope, filing, Utc::now())?;

        tx.commit()?;
        Ok(email)
    }

    fn insert_attachment(&self, attachment: &Attachment) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let scope = MailboxScope::new(attachment.tenant_id, attachment.user_id);

        match attachment.parent {
            AttachmentParent::Draft(draft_id) => {
                if draft_scope(&tx, draft_id)? != Some(scope) {
                    return Err(MailboxError::not_found(format!("draft {}", draft_id)));
                }
            }
            AttachmentParent::Email(email_id) => {
                if select_email(&tx, scope, email_id)?.is_none() {
                    return Err(MailboxError::not_found(format!("email {}", email_id)));
                }
            }
            AttachmentParent::Orphaned => {}
        }

        tx.execute(
            "INSERT INTO email_attachments
             (id, tenant_id, user_id, email_id, draft_id, filename, content_type, size_bytes,
              blob_key, blob_bucket, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                attachment.id,
                attachment.tenant_id,
                attachment.user_id,
                attachment.parent.email_id(),
                attachment.parent.draft_id(),
                attachment.filename,
                attachment.content_type,
                attachment.size_bytes as i64,
                attachment.blob_key,
                attachment.blob_bucket,
                ts(&attachment.created_at),
            ],
        )?;

        if let AttachmentParent::Email(email_id) = attachment.parent {
            let now = Utc::now();
            tx.execute(
                "UPDATE emails SET has_attachments = 1, updated_at = ? WHERE id = ?",
                params![ts(&now), email_id],
            )?;
            let thread_id: ThreadId =
                tx.query_row("SELECT thread_id FROM emails WHERE id = ?", [email_id], |row| {
                    row.get(0)
                })?;
            recompute_thread(&tx, thread_id, now)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get_attachment(&self, scope: MailboxScope, id: AttachmentId) -> Result<Option<Attachment>> {
        let conn = self.conn()?;
        select_attachment(&conn, scope, id)
    }

    fn list_email_attachments(&self, scope: MailboxScope, id: EmailId) -> Result<Vec<Attachment>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM email_attachments
             WHERE email_id = ? AND tenant_id = ? AND user_id = ?
             ORDER BY created_at, id",
            ATTACHMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let attachments = stmt
            .query_map(params![id, scope.tenant_id, scope.user_id], attachment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attachments)
    }

    fn list_draft_attachments(&self, scope: MailboxScope, id: DraftId) -> Result<Vec<Attachment>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM email_attachments
             WHERE draft_id = ? AND tenant_id = ? AND user_id = ?
             ORDER BY created_at, id",
            ATTACHMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let attachments = stmt
            .query_map(params![id, scope.tenant_id, scope.user_id], attachment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attachments)
    }

    fn delete_attachment(&self, scope: MailboxScope, id: AttachmentId) -> Result<Attachment> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let attachment = select_attachment(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("attachment {}", id)))?;

        tx.execute("DELETE FROM email_attachments WHERE id = ?", [id])?;

        if let AttachmentParent::Email(email_id) = attachment.parent {
            let now = Utc::now();
            tx.execute(
                "UPDATE emails SET has_attachments =
                    EXISTS (SELECT 1 FROM email_attachments WHERE email_id = ?1),
                    updated_at = ?2
                 WHERE id = ?1",
                params![email_id, ts(&now)],
            )?;
            let thread_id: ThreadId =
                tx.query_row("SELECT thread_id FROM emails WHERE id = ?", [email_id], |row| {
                    row.get(0)
                })?;
            recompute_thread(&tx, thread_id, now)?;
        }

        tx.commit()?;
        Ok(attachment)
    }

    fn list_orphaned_attachments(
        &self,
        tenant_id: TenantId,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Attachment>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM email_attachments
             WHERE tenant_id = ? AND email_id IS NULL AND draft_id IS NULL AND created_at < ?
             ORDER BY created_at",
            ATTACHMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let attachments = stmt
            .query_map(params![tenant_id, ts(&older_than)], attachment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attachments)
    }

    fn list_labels(&self, scope: MailboxScope) -> Result<Vec<Label>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM email_labels WHERE tenant_id = ? AND user_id = ? ORDER BY name",
            LABEL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let labels = stmt
            .query_map(params![scope.tenant_id, scope.user_id], label_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(labels)
    }

    fn create_label(&self, scope: MailboxScope, fields: &LabelFields) -> Result<Label> {
        let (name, color) = fields.normalized().map_err(MailboxError::Validation)?;
        let conn = self.conn()?;
        let id = LabelId::new();
        let now = ts(&Utc::now());

        conn.execute(
            "INSERT INTO email_labels (id, tenant_id, user_id, name, color, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![id, scope.tenant_id, scope.user_id, name, color, now, now],
        )
        .map_err(|e| label_conflict(e.into(), &name))?;

        select_label(&conn, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("label {}", id)))
    }

    fn update_label(
        &self,
        scope: MailboxScope,
        id: LabelId,
        fields: &LabelFields,
    ) -> Result<Label> {
        let (name, color) = fields.normalized().map_err(MailboxError::Validation)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let existing = select_label(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("label {}", id)))?;

        tx.execute(
            "UPDATE email_labels SET name = ?, color = ?, updated_at = ? WHERE id = ?",
            params![name, color, ts(&now), id],
        )
        .map_err(|e| label_conflict(e.into(), &name))?;

        if existing.name != name {
            let renamed = rewrite_email_labels(&tx, scope, &existing.name, Some(&name), now)?;
            debug!(
                "[STORE] Renamed label '{}' to '{}' on {} emails for {}",
                existing.name, name, renamed, scope
            );
        }

        let label = select_label(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("label {}", id)))?;
        tx.commit()?;
        Ok(label)
    }

    fn delete_label(&self, scope: MailboxScope, id: LabelId) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing = select_label(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("label {}", id)))?;

        tx.execute("DELETE FROM email_labels WHERE id = ?", [id])?;
        rewrite_email_labels(&tx, scope, &existing.name, None, Utc::now())?;

        tx.commit()?;
        Ok(())
    }

    fn list_signatures(&self, scope: MailboxScope) -> Result<Vec<Signature>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM email_signatures WHERE tenant_id = ? AND user_id = ?
             ORDER BY is_default DESC, name",
            SIGNATURE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let signatures = stmt
            .query_map(params![scope.tenant_id, scope.user_id], signature_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(signatures)
    }

    fn get_signature(&self, scope: MailboxScope, id: SignatureId) -> Result<Option<Signature>> {
        let conn = self.conn()?;
        select_signature(&conn, scope, id)
    }

    fn create_signature(
        &self,
        scope: MailboxScope,
        fields: &SignatureFields,
    ) -> Result<Signature> {
        fields.validate().map_err(MailboxError::Validation)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id = SignatureId::new();
        let now = ts(&Utc::now());

        if fields.is_default {
            clear_default_signature(&tx, scope)?;
        }
        tx.execute(
            "INSERT INTO email_signatures
             (id, tenant_id, user_id, name, body_html, is_default, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                scope.tenant_id,
                scope.user_id,
                fields.name.trim(),
                fields.body_html,
                fields.is_default,
                now,
                now,
            ],
        )?;

        let signature = select_signature(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("signature {}", id)))?;
        tx.commit()?;
        Ok(signature)
    }

    fn update_signature(
        &self,
        scope: MailboxScope,
        id: SignatureId,
        fields: &SignatureFields,
    ) -> Result<Signature> {
        fields.validate().map_err(MailboxError::Validation)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if select_signature(&tx, scope, id)?.is_none() {
            return Err(MailboxError::not_found(format!("signature {}", id)));
        }
        if fields.is_default {
            clear_default_signature(&tx, scope)?;
        }
        tx.execute(
            "UPDATE email_signatures SET name = ?, body_html = ?, is_default = ?, updated_at = ?
             WHERE id = ?",
            params![
                fields.name.trim(),
                fields.body_html,
                fields.is_default,
                ts(&Utc::now()),
                id,
            ],
        )?;

        let signature = select_signature(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("signature {}", id)))?;
        tx.commit()?;
        Ok(signature)
    }

    fn delete_signature(&self, scope: MailboxScope, id: SignatureId) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM email_signatures WHERE id = ? AND tenant_id = ? AND user_id = ?",
            params![id, scope.tenant_id, scope.user_id],
        )?;
        if deleted == 0 {
            return Err(MailboxError::not_found(format!("signature {}", id)));
        }
        Ok(())
    }

    fn set_default_signature(&self, scope: MailboxScope, id: SignatureId) -> Result<Signature> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if select_signature(&tx, scope, id)?.is_none() {
            return Err(MailboxError::not_found(format!("signature {}", id)));
        }
        clear_default_signature(&tx, scope)?;
        tx.execute(
            "UPDATE email_signatures SET is_default = 1, updated_at = ? WHERE id = ?",
            params![ts(&Utc::now()), id],
        )?;

        let signature = select_signature(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("signature {}", id)))?;
        tx.commit()?;
        Ok(signature)
    }

    fn record_unfiled_send(
        &self,
        scope: MailboxScope,
        filing: &SentFiling,
        error: &str,
    ) -> Result<UnfiledSend> {
        let conn = self.conn()?;
        let id = UnfiledSendId::new();

        conn.execute(
            "INSERT INTO unfiled_sends
             (id, tenant_id, user_id, message_id, draft_id, filing, error, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                scope.tenant_id,
                scope.user_id,
                filing.email.message_id,
                filing.draft_id,
                to_json(filing)?,
                error,
                ts(&Utc::now()),
            ],
        )?;

        select_unfiled(&conn, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("unfiled send {}", id)))
    }

    fn list_unfiled_sends(
        &self,
        scope: MailboxScope,
        include_resolved: bool,
    ) -> Result<Vec<UnfiledSend>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM unfiled_sends
             WHERE tenant_id = ? AND user_id = ? AND (? OR resolved_at IS NULL)
             ORDER BY created_at DESC",
            UNFILED_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let sends = stmt
            .query_map(
                params![scope.tenant_id, scope.user_id, include_resolved],
                unfiled_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sends)
    }

    fn get_unfiled_send(
        &self,
        scope: MailboxScope,
        id: UnfiledSendId,
    ) -> Result<Option<UnfiledSend>> {
        let conn = self.conn()?;
        select_unfiled(&conn, scope, id)
    }

    fn refile_unfiled_send(&self, scope: MailboxScope, id: UnfiledSendId) -> Result<Email> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let record = select_unfiled(&tx, scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("unfiled send {}", id)))?;
        if record.is_resolved() {
            return Err(MailboxError::constraint(format!(
                "unfiled send {} was already filed",
                id
            )));
        }

        let email = file_sent_email_tx(&tx, scope, &record.filing, now)?;
        tx.execute(
            "UPDATE unfiled_sends SET resolved_at = ?, resolved_email_id = ? WHERE id = ?",
            params![ts(&now), email.id, id],
        )?;

        tx.commit()?;
        warn!(
            "[STORE] Refiled unfiled send {} as email {} for {}",
            id, email.id, scope
        );
        Ok(email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmailAddress;

    fn create_test_store() -> SqliteMailboxStore {
        SqliteMailboxStore::open_in_memory().unwrap()
    }

    fn scope() -> MailboxScope {
        MailboxScope::new(TenantId::new(), UserId::new())
    }

    fn inbound(message_id: &str, subject: &str) -> crate::models::NewEmailBuilder {
        NewEmail::builder(message_id, EmailAddress::with_name("Buyer", "buyer@example.com"))
            .to(vec![EmailAddress::new("rep@dealer.com")])
            .subject(subject)
            .body_text(Some(format!("Body of {}", subject)))
            .received_at(Utc::now())
    }

    fn orphan(scope: MailboxScope, parent: AttachmentParent) -> Attachment {
        let id = AttachmentId::new();
        Attachment {
            id,
            tenant_id: scope.tenant_id,
            user_id: scope.user_id,
            parent,
            filename: "quote.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes: 1024,
            blob_key: format!("attachments/{}/{}.pdf", scope.tenant_id, id),
            blob_bucket: "attachments".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_reply_joins_thread_and_counts_are_exact() {
        let store = create_test_store();
        let scope = scope();

        let first = store
            .insert_email(scope, &inbound("m1@x", "Quote").build())
            .unwrap();
        assert!(first.created);

        let reply = store
            .insert_email(
                scope,
                &inbound("m2@x", "Re: Quote")
                    .in_reply_to("m1@x")
                    .received_at(Utc::now() + Duration::seconds(5))
                    .build(),
            )
            .unwrap();
        assert_eq!(reply.email.thread_id, first.email.thread_id);

        let thread = store.get_thread(scope, first.email.thread_id).unwrap().unwrap();
        assert_eq!(thread.subject, "Quote");
        assert_eq!(thread.message_count, 2);
        assert_eq!(thread.unread_count, 2);
        assert_eq!(thread.snippet, "Body of Re: Quote");
        assert_eq!(thread.participants, vec!["buyer@example.com", "rep@dealer.com"]);
    }

    #[test]
    fn test_same_message_id_in_other_tenant_gets_own_thread() {
        let store = create_test_store();
        let a = scope();
        let b = scope();

        let in_a = store.insert_email(a, &inbound("m1@x", "Quote").build()).unwrap();
        let in_b = store
            .insert_email(b, &inbound("m2@x", "Re: Quote").in_reply_to("m1@x").build())
            .unwrap();
        assert_ne!(in_a.email.thread_id, in_b.email.thread_id);
        assert!(store.get_thread(b, in_a.email.thread_id).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_message_id_is_deduplicated() {
        let store = create_test_store();
        let scope = scope();
        let first = store.insert_email(scope, &inbound("m1@x", "Quote").build()).unwrap();
        let again = store.insert_email(scope, &inbound("<m1@x>", "Quote").build()).unwrap();
        assert!(!again.created);
        assert_eq!(again.email.id, first.email.id);
    }

    #[test]
    fn test_mark_read_recomputes_each_thread_once() {
        let store = create_test_store();
        let scope = scope();

        let a1 = store.insert_email(scope, &inbound("a1@x", "A").build()).unwrap().email;
        let a2 = store
            .insert_email(scope, &inbound("a2@x", "Re: A").in_reply_to("a1@x").build())
            .unwrap()
            .email;
        let b1 = store.insert_email(scope, &inbound("b1@x", "B").build()).unwrap().email;

        let outcome = store
            .apply_mutation(scope, &[a1.id, a2.id, b1.id], &EmailMutation::SetRead(true))
            .unwrap();
        assert_eq!(outcome.updated, 3);
        assert_eq!(outcome.threads_recomputed.len(), 2);

        let thread = store.get_thread(scope, a1.thread_id).unwrap().unwrap();
        assert_eq!(thread.unread_count, 0);
        assert_eq!(thread.message_count, 2);

        let again = store
            .apply_mutation(scope, &[a1.id], &EmailMutation::SetRead(true))
            .unwrap();
        assert_eq!(again.updated, 0);
    }

    #[test]
    fn test_mutation_skips_foreign_ids_and_rejects_drafts_folder() {
        let store = create_test_store();
        let owner = scope();
        let email = store.insert_email(owner, &inbound("m1@x", "A").build()).unwrap().email;

        let outcome = store
            .apply_mutation(scope(), &[email.id], &EmailMutation::Move(Folder::Trash))
            .unwrap();
        assert_eq!(outcome, MutationOutcome::default());

        let err = store
            .apply_mutation(owner, &[email.id], &EmailMutation::Move(Folder::Drafts))
            .unwrap_err();
        assert!(matches!(err, MailboxError::Validation(_)));
    }

    #[test]
    fn test_delete_permanent_only_removes_trash() {
        let store = create_test_store();
        let scope = scope();
        let kept = store.insert_email(scope, &inbound("k@x", "Keep").build()).unwrap().email;
        let doomed = store.insert_email(scope, &inbound("d@x", "Drop").build()).unwrap().email;
        let attachment = orphan(scope, AttachmentParent::Email(doomed.id));
        store.insert_attachment(&attachment).unwrap();

        store
            .apply_mutation(scope, &[doomed.id], &EmailMutation::Move(Folder::Trash))
            .unwrap();
        let outcome = store.delete_permanent(scope, &[kept.id, doomed.id]).unwrap();

        assert_eq!(outcome.deleted, vec![doomed.id]);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.threads_removed, vec![doomed.thread_id]);
        assert_eq!(outcome.blob_keys, vec![attachment.blob_key]);
        assert!(store.get_email(scope, kept.id).unwrap().is_some());
        assert!(store.get_thread(scope, doomed.thread_id).unwrap().is_none());
    }

    #[test]
    fn test_list_emails_with_filters() {
        let store = create_test_store();
        let scope = scope();
        let a = store
            .insert_email(scope, &inbound("a@x", "Trade-in").labels(vec!["Leads".into()]).build())
            .unwrap()
            .email;
        store.insert_email(scope, &inbound("b@x", "Financing").build()).unwrap();
        store
            .apply_mutation(scope, &[a.id], &EmailMutation::SetStarred(true))
            .unwrap();

        let page = store
            .list_emails(
                scope,
                &EmailFilter {
                    is_starred: Some(true),
                    labels: vec!["leads".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, a.id);

        let page = store
            .list_emails(
                scope,
                &EmailFilter {
                    q: Some("financ".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.total, 1);

        let page = store
            .list_emails(
                scope,
                &EmailFilter {
                    limit: Some(1),
                    ..EmailFilter::folder(Folder::Inbox)
                },
            )
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.has_more);
    }

    #[test]
    fn test_file_sent_email_reparents_and_deletes_draft() {
        let store = create_test_store();
        let scope = scope();
        let draft = store
            .create_draft(
                scope,
                &DraftFields {
                    subject: "Quote".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        let first = orphan(scope, AttachmentParent::Draft(draft.id));
        let second = orphan(scope, AttachmentParent::Draft(draft.id));
        store.insert_attachment(&first).unwrap();
        store.insert_attachment(&second).unwrap();

        let filing = SentFiling {
            email: NewEmail::builder("s1@dealer", EmailAddress::new("rep@dealer.com"))
                .to(vec![EmailAddress::new("buyer@example.com")])
                .subject("Quote")
                .folder(Folder::Sent)
                .read(true)
                .sent_at(Utc::now())
                .build(),
            draft_id: Some(draft.id),
            attachment_ids: Vec::new(),
        };
        let email = store.file_sent_email(scope, &filing).unwrap();

        assert!(email.has_attachments);
        assert_eq!(email.folder, Folder::Sent);
        assert!(store.get_draft(scope, draft.id).unwrap().is_none());
        let attachments = store.list_email_attachments(scope, email.id).unwrap();
        assert_eq!(attachments.len(), 2);
        assert!(attachments.iter().all(|a| a.parent == AttachmentParent::Email(email.id)));

        let thread = store.get_thread(scope, email.thread_id).unwrap().unwrap();
        assert!(thread.has_attachments);
        assert_eq!(thread.unread_count, 0);
    }

    #[test]
    fn test_failed_filing_rolls_back() {
        let store = create_test_store();
        let scope = scope();
        let draft = store.create_draft(scope, &DraftFields::default()).unwrap();

        let filing = SentFiling {
            email: NewEmail::builder("s1@dealer", EmailAddress::new("rep@dealer.com")).build(),
            draft_id: Some(draft.id),
            attachment_ids: vec![AttachmentId::new()],
        };
        assert!(store.file_sent_email(scope, &filing).is_err());
        assert!(store.get_draft(scope, draft.id).unwrap().is_some());
        assert!(store.find_email_by_message_id(scope, "<s1@dealer>").unwrap().is_none());
    }

    #[test]
    fn test_draft_save_replaces_attachment_set() {
        let store = create_test_store();
        let scope = scope();
        let id = DraftId::new();

        let keep = orphan(scope, AttachmentParent::Orphaned);
        let drop = orphan(scope, AttachmentParent::Orphaned);
        store.insert_attachment(&keep).unwrap();
        store.insert_attachment(&drop).unwrap();

        let mut fields = DraftFields {
            attachment_ids: vec![keep.id, drop.id],
            ..Default::default()
        };
        let created = store.save_draft(scope, id, &fields).unwrap();
        assert_eq!(created.fields.attachment_ids.len(), 2);

        fields.attachment_ids = vec![keep.id];
        let updated = store.save_draft(scope, id, &fields).unwrap();
        assert_eq!(updated.fields.attachment_ids, vec![keep.id]);
        assert_eq!(
            store.get_attachment(scope, drop.id).unwrap().unwrap().parent,
            AttachmentParent::Orphaned
        );

        // Another user cannot claim the id
        let err = store.save_draft(self::scope(), id, &fields).unwrap_err();
        assert!(matches!(err, MailboxError::NotFound { .. }));
    }

    #[test]
    fn test_delete_draft_returns_attachments() {
        let store = create_test_store();
        let scope = scope();
        let draft = store.create_draft(scope, &DraftFields::default()).unwrap();
        let attachment = orphan(scope, AttachmentParent::Draft(draft.id));
        store.insert_attachment(&attachment).unwrap();

        let removed = store.delete_draft(scope, draft.id).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.get_attachment(scope, attachment.id).unwrap().is_none());
        assert!(matches!(
            store.delete_draft(scope, draft.id),
            Err(MailboxError::NotFound { .. })
        ));
    }

    #[test]
    fn test_attachment_xor_is_enforced_by_schema() {
        let store = create_test_store();
        let scope = scope();
        let email = store.insert_email(scope, &inbound("m@x", "A").build()).unwrap().email;
        let draft = store.create_draft(scope, &DraftFields::default()).unwrap();
        let attachment = orphan(scope, AttachmentParent::Draft(draft.id));
        store.insert_attachment(&attachment).unwrap();

        let conn = store.conn().unwrap();
        let err = conn
            .execute(
                "UPDATE email_attachments SET email_id = ? WHERE id = ?",
                params![email.id, attachment.id],
            )
            .unwrap_err();
        assert!(matches!(MailboxError::from(err), MailboxError::Constraint { .. }));
    }

    #[test]
    fn test_orphan_listing() {
        let store = create_test_store();
        let scope = scope();
        let mut old = orphan(scope, AttachmentParent::Orphaned);
        old.created_at = Utc::now() - Duration::hours(2);
        store.insert_attachment(&old).unwrap();
        store.insert_attachment(&orphan(scope, AttachmentParent::Orphaned)).unwrap();

        let stale = store
            .list_orphaned_attachments(scope.tenant_id, Utc::now() - Duration::hours(1))
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }

    #[test]
    fn test_label_rename_and_delete_rewrite_emails() {
        let store = create_test_store();
        let scope = scope();
        let label = store.create_label(scope, &LabelFields::new("Leads")).unwrap();
        let email = store
            .insert_email(scope, &inbound("m@x", "A").labels(vec!["leads".into()]).build())
            .unwrap()
            .email;

        assert!(matches!(
            store.create_label(scope, &LabelFields::new("LEADS")),
            Err(MailboxError::Constraint { .. })
        ));

        store
            .update_label(scope, label.id, &LabelFields::new("Hot leads"))
            .unwrap();
        let renamed = store.get_email(scope, email.id).unwrap().unwrap();
        assert_eq!(renamed.labels, vec!["Hot leads"]);
        let thread = store.get_thread(scope, email.thread_id).unwrap().unwrap();
        assert_eq!(thread.labels, vec!["Hot leads"]);

        store.delete_label(scope, label.id).unwrap();
        assert!(store.get_email(scope, email.id).unwrap().unwrap().labels.is_empty());
        assert!(store.list_labels(scope).unwrap().is_empty());
    }

    #[test]
    fn test_single_default_signature() {
        let store = create_test_store();
        let scope = scope();
        let fields = |name: &str, is_default| SignatureFields {
            name: name.to_string(),
            body_html: "<p>Regards</p>".to_string(),
            is_default,
        };

        let first = store.create_signature(scope, &fields("Formal", true)).unwrap();
        let second = store.create_signature(scope, &fields("Casual", true)).unwrap();
        assert!(second.is_default);
        assert!(!store.get_signature(scope, first.id).unwrap().unwrap().is_default);

        store.set_default_signature(scope, first.id).unwrap();
        let defaults: Vec<_> = store
            .list_signatures(scope)
            .unwrap()
            .into_iter()
            .filter(|s| s.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, first.id);
    }

    #[test]
    fn test_unfiled_send_refile() {
        let store = create_test_store();
        let scope = scope();
        let draft = store.create_draft(scope, &DraftFields::default()).unwrap();
        let filing = SentFiling {
            email: NewEmail::builder("s1@dealer", EmailAddress::new("rep@dealer.com"))
                .folder(Folder::Sent)
                .read(true)
                .build(),
            draft_id: Some(draft.id),
            attachment_ids: Vec::new(),
        };

        let record = store.record_unfiled_send(scope, &filing, "disk full").unwrap();
        assert_eq!(record.filing, filing);

        // The draft is frozen until the record is refiled
        for attempt in [
            store.delete_draft(scope, draft.id).map(|_| ()),
            store.update_draft(scope, draft.id, &DraftFields::default()).map(|_| ()),
            store.claim_draft_for_send(scope, draft.id).map(|_| ()),
        ] {
            assert!(matches!(attempt, Err(MailboxError::Constraint { .. })));
        }

        let email = store.refile_unfiled_send(scope, record.id).unwrap();
        assert_eq!(email.message_id, "<s1@dealer>");
        assert!(store.get_draft(scope, draft.id).unwrap().is_none());
        assert!(store.list_unfiled_sends(scope, false).unwrap().is_empty());
        assert_eq!(store.list_unfiled_sends(scope, true).unwrap().len(), 1);

        assert!(matches!(
            store.refile_unfiled_send(scope, record.id),
            Err(MailboxError::Constraint { .. })
        ));
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mailbox.test.sqlite");
        let scope = scope();
        {
            let store = SqliteMailboxStore::open(&path).unwrap();
            store.insert_email(scope, &inbound("m@x", "A").build()).unwrap();
        }
        let reopened = SqliteMailboxStore::open(&path).unwrap();
        let page = reopened.list_emails(scope, &EmailFilter::default()).unwrap();
        assert_eq!(page.total, 1);
    }
}
