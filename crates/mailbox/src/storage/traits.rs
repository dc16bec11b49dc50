//! Storage trait definitions

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::filter::{EmailFilter, ThreadFilter};
use crate::error::Result;
use crate::models::{
    Attachment, AttachmentId, Draft, DraftFields, DraftId, Email, EmailId, EmailMutation, Label,
    LabelFields, LabelId, MailboxScope, NewEmail, Page, SentFiling, Signature, SignatureFields,
    SignatureId, TenantId, Thread, ThreadId, UnfiledSend, UnfiledSendId,
};

/// Result of a state-machine transition over a batch of emails
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    /// Emails whose state actually changed
    pub updated: usize,
    /// Distinct threads recomputed, each exactly once
    pub threads_recomputed: Vec<ThreadId>,
}

/// Result of permanently deleting emails from trash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeOutcome {
    pub deleted: Vec<EmailId>,
    /// Ids that were not in trash or not in scope
    pub skipped: usize,
    pub threads_recomputed: Vec<ThreadId>,
    /// Threads left with no members and removed
    pub threads_removed: Vec<ThreadId>,
    /// Blob keys of attachments removed with the emails
    #[serde(skip)]
    pub blob_keys: Vec<String>,
}

/// Result of inserting an email that may already exist
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub email: Email,
    /// False when an email with the same Message-ID was already in the mailbox
    pub created: bool,
}

/// Trait for mailbox persistence
///
/// Every method takes the (tenant, user) scope it operates in. Rows outside
/// the scope behave exactly as if they did not exist. Every write that touches
/// an email's folder, flags or labels recomputes the aggregates of the
/// affected threads in the same transaction.
pub trait MailboxStore: Send + Sync {
    // === Emails ===

    /// Insert an email, reconciling it into a thread.
    ///
    /// When an email with the same Message-ID already exists in the mailbox
    /// it is returned unchanged with `created = false`.
    fn insert_email(&self, scope: MailboxScope, email: &NewEmail) -> Result<InsertOutcome>;

    fn get_email(&self, scope: MailboxScope, id: EmailId) -> Result<Option<Email>>;

    /// Fetch several emails, preserving the order of `ids` and skipping unknown ones
    fn get_emails(&self, scope: MailboxScope, ids: &[EmailId]) -> Result<Vec<Email>>;

    fn find_email_by_message_id(
        &self,
        scope: MailboxScope,
        message_id: &str,
    ) -> Result<Option<Email>>;

    fn list_emails(&self, scope: MailboxScope, filter: &EmailFilter) -> Result<Page<Email>>;

    /// Every email in every mailbox, for search index rebuilds
    fn all_emails(&self) -> Result<Vec<Email>>;

    /// Apply one transition to every in-scope email in `ids`
    fn apply_mutation(
        &self,
        scope: MailboxScope,
        ids: &[EmailId],
        mutation: &EmailMutation,
    ) -> Result<MutationOutcome>;

    /// Hard-delete the emails in `ids` that are currently in trash
    fn delete_permanent(&self, scope: MailboxScope, ids: &[EmailId]) -> Result<PurgeOutcome>;

    // === Threads ===

    fn get_thread(&self, scope: MailboxScope, id: ThreadId) -> Result<Option<Thread>>;

    fn list_threads(&self, scope: MailboxScope, filter: &ThreadFilter) -> Result<Page<Thread>>;

    /// Members of a thread ordered oldest first
    fn list_thread_emails(&self, scope: MailboxScope, id: ThreadId) -> Result<Vec<Email>>;

    // === Drafts ===

    fn create_draft(&self, scope: MailboxScope, fields: &DraftFields) -> Result<Draft>;

    /// Replace all fields of an existing draft; NotFound when absent or not owned
    fn update_draft(&self, scope: MailboxScope, id: DraftId, fields: &DraftFields)
    -> Result<Draft>;

    /// Replace or create the draft with this id
    fn save_draft(&self, scope: MailboxScope, id: DraftId, fields: &DraftFields) -> Result<Draft>;

    fn get_draft(&self, scope: MailboxScope, id: DraftId) -> Result<Option<Draft>>;

    fn list_drafts(&self, scope: MailboxScope, limit: u32, offset: u32) -> Result<Page<Draft>>;

    /// Delete a draft and its attachment rows, returning the removed attachments
    ///
    /// Constraint while the draft is being sent or awaits refiling.
    fn delete_draft(&self, scope: MailboxScope, id: DraftId) -> Result<Vec<Attachment>>;

    /// Mark a draft as being sent and return it
    ///
    /// Constraint when another send holds a live claim or an unresolved
    /// unfiled send references the draft. Abandoned claims are taken over.
    fn claim_draft_for_send(&self, scope: MailboxScope, id: DraftId) -> Result<Draft>;

    /// Drop the send claim after a send the transport never accepted
    fn release_draft_claim(&self, scope: MailboxScope, id: DraftId) -> Result<()>;

    /// Persist a sent message in one transaction: insert the email, reparent
    /// attachments, delete the consumed draft and recompute the thread
    fn file_sent_email(&self, scope: MailboxScope, filing: &SentFiling) -> Result<Email>;

    // === Attachments ===

    /// Record attachment metadata; a draft parent must exist in scope
    fn insert_attachment(&self, attachment: &Attachment) -> Result<()>;

    fn get_attachment(&self, scope: MailboxScope, id: AttachmentId) -> Result<Option<Attachment>>;

    fn list_email_attachments(&self, scope: MailboxScope, id: EmailId) -> Result<Vec<Attachment>>;

    fn list_draft_attachments(&self, scope: MailboxScope, id: DraftId) -> Result<Vec<Attachment>>;

    /// Delete attachment metadata, returning the removed row
    fn delete_attachment(&self, scope: MailboxScope, id: AttachmentId) -> Result<Attachment>;

    /// Orphaned uploads created before `older_than`, for external sweeping
    fn list_orphaned_attachments(
        &self,
        tenant_id: TenantId,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Attachment>>;

    // === Labels ===

    fn list_labels(&self, scope: MailboxScope) -> Result<Vec<Label>>;

    fn create_label(&self, scope: MailboxScope, fields: &LabelFields) -> Result<Label>;

    /// Update a label; a rename is carried over to every labelled email
    fn update_label(&self, scope: MailboxScope, id: LabelId, fields: &LabelFields)
    -> Result<Label>;

    /// Delete a label and strip it from every email in the mailbox
    fn delete_label(&self, scope: MailboxScope, id: LabelId) -> Result<()>;

    // === Signatures ===

    fn list_signatures(&self, scope: MailboxScope) -> Result<Vec<Signature>>;

    fn get_signature(&self, scope: MailboxScope, id: SignatureId) -> Result<Option<Signature>>;

    fn create_signature(&self, scope: MailboxScope, fields: &SignatureFields)
    -> Result<Signature>;

    fn update_signature(
        &self,
        scope: MailboxScope,
        id: SignatureId,
        fields: &SignatureFields,
    ) -> Result<Signature>;

    fn delete_signature(&self, scope: MailboxScope, id: SignatureId) -> Result<()>;

    /// Make one signature the default, clearing any other default atomically
    fn set_default_signature(&self, scope: MailboxScope, id: SignatureId) -> Result<Signature>;

    // === Unfiled sends ===

    fn record_unfiled_send(
        &self,
        scope: MailboxScope,
        filing: &SentFiling,
        error: &str,
    ) -> Result<UnfiledSend>;

    fn list_unfiled_sends(
        &self,
        scope: MailboxScope,
        include_resolved: bool,
    ) -> Result<Vec<UnfiledSend>>;

    fn get_unfiled_send(
        &self,
        scope: MailboxScope,
        id: UnfiledSendId,
    ) -> Result<Option<UnfiledSend>>;

    /// Re-run the persistence half of a send and mark the record resolved
    fn refile_unfiled_send(&self, scope: MailboxScope, id: UnfiledSendId) -> Result<Email>;
}
