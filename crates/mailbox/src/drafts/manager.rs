//! Draft manager: editing, deletion and draft-to-sent conversion

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use super::MessageIdGenerator;
use crate::error::{MailboxError, Result};
use crate::models::{
    Attachment, AttachmentParent, Draft, DraftFields, DraftId, Email, EmailAddress, Folder,
    MailboxScope, NewEmail, Page, SentFiling,
};
use crate::search::SearchIndex;
use crate::storage::filter::clamp_limit;
use crate::storage::{BlobStore, MailboxStore};
use crate::transport::{MailTransport, OutgoingAttachment, OutgoingMessage};

/// Owns the draft lifecycle for every mailbox
pub struct DraftManager {
    store: Arc<dyn MailboxStore>,
    blobs: Arc<dyn BlobStore>,
    transport: Arc<dyn MailTransport>,
    search: Arc<SearchIndex>,
    message_ids: MessageIdGenerator,
}

impl DraftManager {
    pub fn new(
        store: Arc<dyn MailboxStore>,
        blobs: Arc<dyn BlobStore>,
        transport: Arc<dyn MailTransport>,
        search: Arc<SearchIndex>,
        message_ids: MessageIdGenerator,
    ) -> Self {
        Self {
            store,
            blobs,
            transport,
            search,
            message_ids,
        }
    }

    pub fn create(&self, scope: MailboxScope, fields: &DraftFields) -> Result<Draft> {
        fields.validate().map_err(MailboxError::Validation)?;
        let draft = self.store.create_draft(scope, fields)?;
        debug!("[DRAFTS] Created draft {} for {}", draft.id, scope);
        Ok(draft)
    }

    /// Replace every field of an existing draft, including its attachment list
    pub fn update(&self, scope: MailboxScope, id: DraftId, fields: &DraftFields) -> Result<Draft> {
        fields.validate().map_err(MailboxError::Validation)?;
        self.store.update_draft(scope, id, fields)
    }

    /// Create or replace the draft with this id
    pub fn save(&self, scope: MailboxScope, id: DraftId, fields: &DraftFields) -> Result<Draft> {
        fields.validate().map_err(MailboxError::Validation)?;
        self.store.save_draft(scope, id, fields)
    }

    pub fn get(&self, scope: MailboxScope, id: DraftId) -> Result<Draft> {
        self.store
            .get_draft(scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("draft {}", id)))
    }

    pub fn list(
        &self,
        scope: MailboxScope,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Page<Draft>> {
        self.store
            .list_drafts(scope, clamp_limit(limit), offset.unwrap_or(0))
    }

    /// Delete a draft together with its attachments
    ///
    /// Attachment blobs are removed after the metadata. A blob that cannot
    /// be removed is logged and left for the orphan sweep.
    pub fn delete(&self, scope: MailboxScope, id: DraftId) -> Result<()> {
        let removed = self.store.delete_draft(scope, id)?;
        for attachment in &removed {
            if let Err(e) = self.blobs.delete(&attachment.blob_key) {
                error!(
                    "[BLOB] Failed to delete blob {} of draft {} for {}: {:#}",
                    attachment.blob_key, id, scope, e
                );
            }
        }
        info!(
            "[DRAFTS] Deleted draft {} with {} attachments for {}",
            id,
            removed.len(),
            scope
        );
        Ok(())
    }

    /// Send a draft and file it as a sent email
    ///
    /// The draft is claimed first, so a concurrent send of the same draft
    /// fails with `Constraint` instead of reaching the transport. On
    /// transport failure the claim is dropped and the draft is untouched.
    /// Once the transport has accepted the message it is never sent again:
    /// if filing fails, an unfiled send is recorded and `SentButNotFiled`
    /// is returned.
    pub fn send(&self, scope: MailboxScope, id: DraftId) -> Result<Email> {
        let draft = self.store.claim_draft_for_send(scope, id)?;

        let filing = match self.transmit_draft(scope, &draft) {
            Ok(filing) => filing,
            Err(e) => {
                if let Err(release) = self.store.release_draft_claim(scope, id) {
                    warn!(
                        "[DRAFTS] Failed to release send claim on draft {} for {}: {}",
                        id, scope, release
                    );
                }
                return Err(e);
            }
        };

        self.file(scope, filing)
    }

    fn transmit_draft(&self, scope: MailboxScope, draft: &Draft) -> Result<SentFiling> {
        let now = Utc::now();
        draft
            .fields
            .validate_for_send(now)
            .map_err(MailboxError::Validation)?;

        let attachments = self.store.list_draft_attachments(scope, draft.id)?;
        let filing = SentFiling {
            email: self.sent_email(&draft.fields, now)?,
            draft_id: Some(draft.id),
            attachment_ids: Vec::new(),
        };

        self.transmit(scope, &filing.email, &attachments)?;
        Ok(filing)
    }

    /// Send a message that was never saved as a draft
    ///
    /// `fields.attachment_ids` must name orphaned uploads of the caller;
    /// they are parented to the sent email.
    pub fn compose_and_send(&self, scope: MailboxScope, fields: &DraftFields) -> Result<Email> {
        let now = Utc::now();
        fields
            .validate_for_send(now)
            .map_err(MailboxError::Validation)?;

        let mut attachments = Vec::with_capacity(fields.attachment_ids.len());
        for id in &fields.attachment_ids {
            match self.store.get_attachment(scope, *id)? {
                Some(a) if a.parent == AttachmentParent::Orphaned => attachments.push(a),
                Some(_) => {
                    return Err(MailboxError::validation(
                        "attachment_ids",
                        format!("attachment {} already belongs to another message", id),
                    ));
                }
                None => return Err(MailboxError::not_found(format!("attachment {}", id))),
            }
        }

        let filing = SentFiling {
            email: self.sent_email(fields, now)?,
            draft_id: None,
            attachment_ids: fields.attachment_ids.clone(),
        };

        self.transmit(scope, &filing.email, &attachments)?;
        self.file(scope, filing)
    }

    /// Build the sent-folder email for a validated draft
    fn sent_email(&self, fields: &DraftFields, now: DateTime<Utc>) -> Result<NewEmail> {
        let from = fields
            .from
            .clone()
            .ok_or_else(|| MailboxError::validation("from", "sender is required"))?;

        let mut references = fields.references.clone();
        if let Some(parent) = &fields.in_reply_to
            && !references.contains(parent)
        {
            references.push(parent.clone());
        }

        let mut builder = NewEmail::builder(self.message_ids.generate(), from)
            .folder(Folder::Sent)
            .read(true)
            .thread_hint(fields.thread_id)
            .references(references)
            .to(fields.to.clone())
            .cc(fields.cc.clone())
            .bcc(fields.bcc.clone())
            .subject(fields.subject.trim())
            .body_text(fields.body_text.clone())
            .body_html(fields.body_html.clone())
            .sent_at(now);
        if let Some(parent) = &fields.in_reply_to {
            builder = builder.in_reply_to(parent.clone());
        }
        Ok(builder.build())
    }

    /// Hand the message to the transport
    fn transmit(
        &self,
        scope: MailboxScope,
        email: &NewEmail,
        attachments: &[Attachment],
    ) -> Result<()> {
        let outgoing = self.outgoing(email, attachments)?;

        self.transport.send(&outgoing).map_err(|e| {
            warn!(
                "[DRAFTS] Transport refused {} for {}: {}",
                outgoing.message_id, scope, e
            );
            MailboxError::Transport {
                message: e.to_string(),
            }
        })
    }

    /// Persist a message the transport has accepted
    fn file(&self, scope: MailboxScope, filing: SentFiling) -> Result<Email> {
        match self.store.file_sent_email(scope, &filing) {
            Ok(email) => {
                self.index(&email);
                info!(
                    "[DRAFTS] Sent {} as email {} in thread {} for {}",
                    email.message_id, email.id, email.thread_id, scope
                );
                Ok(email)
            }
            Err(filing_error) => Err(self.record_unfiled(scope, &filing, filing_error)),
        }
    }

    fn record_unfiled(
        &self,
        scope: MailboxScope,
        filing: &SentFiling,
        filing_error: MailboxError,
    ) -> MailboxError {
        let message_id = filing.email.message_id.clone();
        let reason = filing_error.to_string();
        error!(
            "[DRAFTS] {} was sent but could not be filed for {}: {}",
            message_id, scope, reason
        );

        match self.store.record_unfiled_send(scope, filing, &reason) {
            Ok(record) => MailboxError::SentButNotFiled {
                message_id,
                unfiled_id: record.id,
                reason,
            },
            Err(e) => {
                error!(
                    "[DRAFTS] Failed to record unfiled send {} for {}: {}",
                    message_id, scope, e
                );
                MailboxError::Internal(anyhow::anyhow!(
                    "message {} was sent but neither filed nor recorded: {}",
                    message_id,
                    reason
                ))
            }
        }
    }

    /// Load attachment payloads and assemble the transport message
    fn outgoing(&self, email: &NewEmail, attachments: &[Attachment]) -> Result<OutgoingMessage> {
        let mut files = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let blob = self
                .blobs
                .get(&attachment.blob_key)
                .map_err(MailboxError::storage_unavailable)?
                .ok_or_else(|| {
                    MailboxError::storage_unavailable(format!(
                        "payload of attachment {} is missing",
                        attachment.id
                    ))
                })?;
            files.push(OutgoingAttachment {
                filename: attachment.filename.clone(),
                content_type: attachment.content_type.clone(),
                data: blob.data,
            });
        }

        Ok(OutgoingMessage {
            message_id: email.message_id.clone(),
            in_reply_to: email.in_reply_to.clone(),
            references: email.references.clone(),
            from: email.from.clone(),
            to: email.to.clone(),
            cc: email.cc.clone(),
            bcc: email.bcc.clone(),
            subject: email.subject.clone(),
            body_text: email.body_text.clone(),
            body_html: email.body_html.clone(),
            attachments: files,
        })
    }

    fn index(&self, email: &Email) {
        if let Err(e) = self
            .search
            .index_email(email)
            .and_then(|_| self.search.commit())
        {
            error!(
                "[SEARCH] Failed to index sent email {} for {}: {:#}",
                email.id,
                email.scope(),
                e
            );
        }
    }
}

/// Reply fields for answering `email`: recipients, subject and headers
pub fn reply_fields(email: &Email, from: EmailAddress) -> DraftFields {
    let mut references = email.references.clone();
    if !references.contains(&email.message_id) {
        references.push(email.message_id.clone());
    }
    DraftFields {
        to: vec![email.from.clone()],
        subject: format!("Re: {}", crate::models::normalize_subject(&email.subject)),
        thread_id: Some(email.thread_id),
        in_reply_to: Some(email.message_id.clone()),
        references,
        from: Some(from),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttachmentId, TenantId, UserId};
    use crate::transport::TransportError;
    use crate::storage::{BlobKey, InMemoryBlobStore, SqliteMailboxStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, mpsc};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    impl MailTransport for RecordingTransport {
        fn send(&self, message: &OutgoingMessage) -> std::result::Result<(), TransportError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct RefusingTransport;

    impl MailTransport for RefusingTransport {
        fn send(&self, _: &OutgoingMessage) -> std::result::Result<(), TransportError> {
            Err(TransportError::Unavailable("connection refused".to_string()))
        }
    }

    /// Holds the first delivery inside the transport until released
    struct GatedTransport {
        entered: Mutex<mpsc::Sender<()>>,
        proceed: Mutex<mpsc::Receiver<()>>,
        deliveries: AtomicUsize,
    }

    impl MailTransport for GatedTransport {
        fn send(&self, _: &OutgoingMessage) -> std::result::Result<(), TransportError> {
            if self.deliveries.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.lock().unwrap().send(()).unwrap();
                self.proceed.lock().unwrap().recv().unwrap();
            }
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<SqliteMailboxStore>,
        blobs: Arc<InMemoryBlobStore>,
        search: Arc<SearchIndex>,
        scope: MailboxScope,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(SqliteMailboxStore::open_in_memory().unwrap()),
                blobs: Arc::new(InMemoryBlobStore::new("http://localhost")),
                search: Arc::new(SearchIndex::in_memory().unwrap()),
                scope: MailboxScope::new(TenantId::new(), UserId::new()),
            }
        }

        fn manager(&self, transport: Arc<dyn MailTransport>) -> DraftManager {
            DraftManager::new(
                self.store.clone(),
                self.blobs.clone(),
                transport,
                self.search.clone(),
                MessageIdGenerator::new("dealer.example"),
            )
        }

        fn upload(&self, parent: AttachmentParent, name: &str) -> Attachment {
            let id = AttachmentId::new();
            let key = BlobKey::attachment(self.scope.tenant_id, id, name).to_string();
            self.blobs.put(&key, "application/pdf", b"%PDF").unwrap();
            let attachment = Attachment {
                id,
                tenant_id: self.scope.tenant_id,
                user_id: self.scope.user_id,
                parent,
                filename: name.to_string(),
                content_type: "application/pdf".to_string(),
                size_bytes: 4,
                blob_key: key,
                blob_bucket: "memory".to_string(),
                created_at: Utc::now(),
            };
            self.store.insert_attachment(&attachment).unwrap();
            attachment
        }
    }

    fn sendable() -> DraftFields {
        DraftFields {
            from: Some(EmailAddress::new("rep@dealer.example")),
            to: vec![EmailAddress::new("buyer@example.com")],
            subject: "Your quote".to_string(),
            body_text: Some("Numbers attached".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_send_draft_with_two_attachments() {
        let f = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let drafts = f.manager(transport.clone());

        let draft = drafts.create(f.scope, &sendable()).unwrap();
        let a = f.upload(AttachmentParent::Draft(draft.id), "quote.pdf");
        let b = f.upload(AttachmentParent::Draft(draft.id), "terms.pdf");

        let email = drafts.send(f.scope, draft.id).unwrap();
        assert_eq!(email.folder, Folder::Sent);
        assert!(email.is_read);
        assert!(email.has_attachments);
        assert!(email.message_id.ends_with("@dealer.example>"));

        for id in [a.id, b.id] {
            let row = f.store.get_attachment(f.scope, id).unwrap().unwrap();
            assert_eq!(row.parent, AttachmentParent::Email(email.id));
        }
        assert!(f.store.get_draft(f.scope, draft.id).unwrap().is_none());

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].attachments.len(), 2);
        assert_eq!(sent[0].message_id, email.message_id);

        let thread = f.store.get_thread(f.scope, email.thread_id).unwrap().unwrap();
        assert!(thread.has_attachments);
        assert_eq!(thread.message_count, 1);
        assert_eq!(thread.unread_count, 0);
    }

    #[test]
    fn test_transport_failure_preserves_draft() {
        let f = Fixture::new();
        let drafts = f.manager(Arc::new(RefusingTransport));

        let draft = drafts.create(f.scope, &sendable()).unwrap();
        let a = f.upload(AttachmentParent::Draft(draft.id), "quote.pdf");

        let err = drafts.send(f.scope, draft.id).unwrap_err();
        assert!(matches!(err, MailboxError::Transport { .. }));

        // The claim was dropped, so the draft can be retried and edited
        let retry = drafts.send(f.scope, draft.id).unwrap_err();
        assert!(matches!(retry, MailboxError::Transport { .. }));

        let kept = drafts.get(f.scope, draft.id).unwrap();
        assert_eq!(kept.fields.subject, draft.fields.subject);
        assert_eq!(kept.fields.attachment_ids, vec![a.id]);
        let row = f.store.get_attachment(f.scope, a.id).unwrap().unwrap();
        assert_eq!(row.parent, AttachmentParent::Draft(draft.id));
        assert!(f.store.list_unfiled_sends(f.scope, true).unwrap().is_empty());
    }

    #[test]
    fn test_missing_blob_aborts_before_sending() {
        let f = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let drafts = f.manager(transport.clone());

        let draft = drafts.create(f.scope, &sendable()).unwrap();
        let a = f.upload(AttachmentParent::Draft(draft.id), "quote.pdf");
        f.blobs.delete(&a.blob_key).unwrap();

        let err = drafts.send(f.scope, draft.id).unwrap_err();
        assert!(matches!(err, MailboxError::StorageUnavailable { .. }));
        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(f.store.get_draft(f.scope, draft.id).unwrap().is_some());

        // Once the attachment is dropped the draft sends normally
        let mut fields = drafts.get(f.scope, draft.id).unwrap().fields;
        fields.attachment_ids.clear();
        drafts.update(f.scope, draft.id, &fields).unwrap();
        drafts.send(f.scope, draft.id).unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_send_delivers_once() {
        let f = Fixture::new();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let transport = Arc::new(GatedTransport {
            entered: Mutex::new(entered_tx),
            proceed: Mutex::new(proceed_rx),
            deliveries: AtomicUsize::new(0),
        });
        let drafts = f.manager(transport.clone());
        let draft = drafts.create(f.scope, &sendable()).unwrap();

        std::thread::scope(|s| {
            let first = s.spawn(|| drafts.send(f.scope, draft.id));
            entered_rx.recv().unwrap();

            // The first send is inside the transport
            let second = drafts.send(f.scope, draft.id);
            let delete = drafts.delete(f.scope, draft.id);
            proceed_tx.send(()).unwrap();

            assert!(matches!(second, Err(MailboxError::Constraint { .. })));
            assert!(matches!(delete, Err(MailboxError::Constraint { .. })));
            let email = first.join().unwrap().unwrap();
            assert_eq!(email.folder, Folder::Sent);
        });

        assert_eq!(transport.deliveries.load(Ordering::SeqCst), 1);
        assert!(f.store.list_unfiled_sends(f.scope, true).unwrap().is_empty());
        assert!(f.store.get_draft(f.scope, draft.id).unwrap().is_none());
    }

    #[test]
    fn test_send_validates_and_scopes() {
        let f = Fixture::new();
        let drafts = f.manager(Arc::new(RecordingTransport::default()));

        let empty = drafts.create(f.scope, &DraftFields::default()).unwrap();
        for _ in 0..2 {
            assert!(matches!(
                drafts.send(f.scope, empty.id),
                Err(MailboxError::Validation(_))
            ));
        }

        let stranger = MailboxScope::new(f.scope.tenant_id, UserId::new());
        assert!(matches!(
            drafts.send(stranger, empty.id),
            Err(MailboxError::NotFound { .. })
        ));
    }

    #[test]
    fn test_reply_joins_thread() {
        let f = Fixture::new();
        let drafts = f.manager(Arc::new(RecordingTransport::default()));

        let inbound = f
            .store
            .insert_email(
                f.scope,
                &NewEmail::builder("<lead@example.com>", EmailAddress::new("buyer@example.com"))
                    .subject("Trade-in value")
                    .received_at(Utc::now())
                    .build(),
            )
            .unwrap()
            .email;

        let fields = reply_fields(&inbound, EmailAddress::new("rep@dealer.example"));
        let sent = drafts.compose_and_send(f.scope, &fields).unwrap();

        assert_eq!(sent.thread_id, inbound.thread_id);
        assert_eq!(sent.in_reply_to.as_deref(), Some("<lead@example.com>"));
        assert_eq!(sent.subject, "Re: Trade-in value");
        let thread = f.store.get_thread(f.scope, inbound.thread_id).unwrap().unwrap();
        assert_eq!(thread.message_count, 2);
        assert_eq!(thread.unread_count, 1);
    }

    #[test]
    fn test_compose_adopts_orphans_only() {
        let f = Fixture::new();
        let drafts = f.manager(Arc::new(RecordingTransport::default()));

        let orphan = f.upload(AttachmentParent::Orphaned, "photo.jpg");
        let mut fields = sendable();
        fields.attachment_ids = vec![orphan.id];
        let email = drafts.compose_and_send(f.scope, &fields).unwrap();
        assert!(email.has_attachments);

        // Now parented; cannot be reused
        let err = drafts.compose_and_send(f.scope, &fields).unwrap_err();
        assert!(matches!(err, MailboxError::Validation(_)));
    }

    #[test]
    fn test_delete_removes_blobs() {
        let f = Fixture::new();
        let drafts = f.manager(Arc::new(RecordingTransport::default()));

        let draft = drafts.create(f.scope, &sendable()).unwrap();
        let a = f.upload(AttachmentParent::Draft(draft.id), "quote.pdf");
        drafts.delete(f.scope, draft.id).unwrap();

        assert!(f.blobs.is_empty());
        assert!(f.store.get_attachment(f.scope, a.id).unwrap().is_none());
        assert!(matches!(
            drafts.get(f.scope, draft.id),
            Err(MailboxError::NotFound { .. })
        ));
    }

    #[test]
    fn test_sent_email_is_searchable() {
        let f = Fixture::new();
        let drafts = f.manager(Arc::new(RecordingTransport::default()));

        let mut fields = sendable();
        fields.subject = "Financing options".to_string();
        let email = drafts.compose_and_send(f.scope, &fields).unwrap();

        let hits = f.search.search(f.scope, "financing", 10, 0).unwrap();
        assert_eq!(hits.hits.len(), 1);
        assert_eq!(hits.hits[0].email_id, email.id);
    }
}
