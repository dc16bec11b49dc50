//! Mailbox crate - multi-tenant email storage and composition
//!
//! This crate provides the mailbox engine behind `mailboxd`:
//! - Domain models (Email, Thread, Draft, Attachment, Label, Signature)
//! - Thread reconciliation from hints and reply headers
//! - SQLite storage with tenant and user scoping on every query
//! - Blob storage for attachment payloads with signed URLs
//! - Full-text search with Tantivy
//! - Mailbox actions (read state, folders, labels, batch operations)
//! - Draft composition and sending over SMTP
//! - The HTTP API built on axum
//!
//! Every operation is scoped to a (tenant, user) pair; nothing here can
//! read or write another user's mailbox.

pub mod actions;
pub mod api;
pub mod attachments;
pub mod config;
pub mod drafts;
pub mod error;
pub mod models;
pub mod query;
pub mod search;
pub mod service;
pub mod storage;
pub mod threading;
pub mod transport;

pub use actions::{BatchAction, BatchOutcome, MailboxActions};
pub use attachments::{AttachmentService, Upload, UploadTicket};
pub use config::{BlobConfig, MailboxConfig, SmtpConfig};
pub use drafts::{DraftManager, MessageIdGenerator, reply_fields};
pub use error::{FieldError, MailboxError, Result};
pub use models::{
    Attachment, AttachmentId, AttachmentParent, Draft, DraftFields, DraftId, Email, EmailAddress,
    EmailId, Folder, Label, LabelFields, LabelId, MailboxScope, NewEmail, Page, Signature,
    SignatureFields, SignatureId, TenantId, Thread, ThreadId, UnfiledSend, UnfiledSendId, UserId,
};
pub use query::{EmailDetail, ThreadDetail, ThreadSummary};
pub use search::{SearchIndex, SearchResult, search_emails};
pub use service::MailboxService;
pub use storage::{
    BlobKey, BlobStore, EmailFilter, FileBlobStore, InMemoryBlobStore, MailboxStore,
    SqliteMailboxStore, ThreadFilter, UrlSigner,
};
pub use transport::{LoggingTransport, MailTransport, OutgoingMessage, SmtpMailTransport};
