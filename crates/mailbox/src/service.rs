//! Mailbox service: the facade the HTTP surface talks to
//!
//! Composes the store, blob store, search index and transport into the
//! action handler, draft manager and attachment service. The blob and
//! transport strategies are picked once, in `from_config`.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use log::{error, info};

use crate::actions::MailboxActions;
use crate::attachments::AttachmentService;
use crate::config::{BlobConfig, MailboxConfig};
use crate::drafts::{DraftManager, MessageIdGenerator};
use crate::error::{MailboxError, Result};
use crate::models::{
    Email, EmailId, Folder, Label, LabelFields, LabelId, MailboxScope, NewEmail, Page, Signature,
    SignatureFields, SignatureId, ThreadId, UnfiledSend, UnfiledSendId,
};
use crate::query::{self, EmailDetail, ThreadDetail, ThreadSummary};
use crate::search::{self, SearchIndex, SearchResult};
use crate::storage::{
    BlobStore, EmailFilter, FileBlobStore, InMemoryBlobStore, InsertOutcome, MailboxStore,
    SqliteMailboxStore, ThreadFilter, UrlSigner,
};
use crate::transport::{LoggingTransport, MailTransport, SmtpMailTransport};

/// Everything the HTTP handlers need, shared behind an `Arc`
pub struct MailboxService {
    store: Arc<dyn MailboxStore>,
    search: Arc<SearchIndex>,
    actions: MailboxActions,
    drafts: DraftManager,
    attachments: AttachmentService,
}

impl MailboxService {
    /// Wire a service from already constructed collaborators
    pub fn new(
        store: Arc<dyn MailboxStore>,
        blobs: Arc<dyn BlobStore>,
        transport: Arc<dyn MailTransport>,
        search: Arc<SearchIndex>,
        config: &MailboxConfig,
    ) -> Self {
        Self {
            actions: MailboxActions::new(store.clone(), blobs.clone(), search.clone()),
            drafts: DraftManager::new(
                store.clone(),
                blobs.clone(),
                transport,
                search.clone(),
                MessageIdGenerator::new(&config.message_id_domain),
            ),
            attachments: AttachmentService::new(
                store.clone(),
                blobs,
                config.max_upload_bytes,
                config.presign_ttl(),
            ),
            store,
            search,
        }
    }

    /// Build every collaborator from configuration
    pub fn from_config(config: &MailboxConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn MailboxStore> = match &config.database_path {
            Some(path) => {
                info!("[STORE] Opening database at {}", path.display());
                Arc::new(SqliteMailboxStore::open(path)?)
            }
            None => {
                info!("[STORE] Using in-memory database");
                Arc::new(SqliteMailboxStore::open_in_memory()?)
            }
        };

        let search = Arc::new(match &config.search_index_path {
            Some(path) => SearchIndex::open(path)?,
            None => SearchIndex::in_memory()?,
        });
        if config.search_index_path.is_none() {
            let indexed = search
                .rebuild(store.as_ref())
                .context("Failed to build in-memory search index")?;
            info!("[SEARCH] Indexed {} emails into in-memory index", indexed);
        }

        let blobs: Arc<dyn BlobStore> = match &config.blob {
            BlobConfig::Production {
                root,
                public_base_url,
                signing_secret,
                bucket,
            } => {
                let signer = UrlSigner::new(signing_secret, public_base_url)?;
                info!(
                    "[BLOB] Production blob store at {} (bucket {})",
                    root.display(),
                    bucket
                );
                Arc::new(FileBlobStore::new(root, bucket.clone(), signer)?)
            }
            BlobConfig::Development { public_base_url } => {
                info!("[BLOB] Development blob store, URLs served from {}", public_base_url);
                Arc::new(InMemoryBlobStore::new(public_base_url.clone()))
            }
        };

        let transport: Arc<dyn MailTransport> = match &config.smtp {
            Some(smtp) => {
                info!("[TRANSPORT] Relaying through {}:{}", smtp.host, smtp.port);
                Arc::new(SmtpMailTransport::new(smtp)?)
            }
            None => {
                info!("[TRANSPORT] No SMTP relay configured, sends are only logged");
                Arc::new(LoggingTransport::new())
            }
        };

        Ok(Self::new(store, blobs, transport, search, config))
    }

    pub fn actions(&self) -> &MailboxActions {
        &self.actions
    }

    pub fn drafts(&self) -> &DraftManager {
        &self.drafts
    }

    pub fn attachments(&self) -> &AttachmentService {
        &self.attachments
    }

    pub fn store(&self) -> &dyn MailboxStore {
        self.store.as_ref()
    }

    // === Emails ===

    /// File an inbound message into the inbox, unread
    ///
    /// A message whose Message-ID is already in the mailbox is returned as is.
    pub fn ingest_email(&self, scope: MailboxScope, mut email: NewEmail) -> Result<InsertOutcome> {
        email.folder = Folder::Inbox;
        email.is_read = false;
        email.received_at.get_or_insert_with(Utc::now);

        let outcome = self.store.insert_email(scope, &email).inspect_err(|e| {
            error!("[STORE] insert_email failed for {}: {}", scope, e);
        })?;

        if outcome.created {
            if let Err(e) = self
                .search
                .index_email(&outcome.email)
                .and_then(|_| self.search.commit())
            {
                error!(
                    "[SEARCH] Failed to index email {} for {}: {:#}",
                    outcome.email.id, scope, e
                );
            }
            info!(
                "[STORE] Ingested {} as email {} in thread {} for {}",
                outcome.email.message_id, outcome.email.id, outcome.email.thread_id, scope
            );
        }
        Ok(outcome)
    }

    pub fn get_email(&self, scope: MailboxScope, id: EmailId) -> Result<EmailDetail> {
        query::get_email_detail(self.store.as_ref(), scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("email {}", id)))
    }

    pub fn list_emails(&self, scope: MailboxScope, filter: &EmailFilter) -> Result<Page<Email>> {
        self.store.list_emails(scope, filter)
    }

    pub fn search(
        &self,
        scope: MailboxScope,
        q: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Page<SearchResult>> {
        search::search_emails(&self.search, self.store.as_ref(), scope, q, limit, offset)
    }

    /// Rebuild the search index from the store
    pub fn rebuild_search_index(&self) -> Result<usize> {
        let count = self.search.rebuild(self.store.as_ref())?;
        info!("[SEARCH] Rebuilt index with {} emails", count);
        Ok(count)
    }

    // === Threads ===

    pub fn list_threads(
        &self,
        scope: MailboxScope,
        filter: &ThreadFilter,
    ) -> Result<Page<ThreadSummary>> {
        query::list_threads(self.store.as_ref(), scope, filter)
    }

    pub fn get_thread(&self, scope: MailboxScope, id: ThreadId) -> Result<ThreadDetail> {
        query::get_thread_detail(self.store.as_ref(), scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("thread {}", id)))
    }

    // === Labels ===

    pub fn list_labels(&self, scope: MailboxScope) -> Result<Vec<Label>> {
        self.store.list_labels(scope)
    }

    pub fn create_label(&self, scope: MailboxScope, fields: &LabelFields) -> Result<Label> {
        fields.normalized().map_err(MailboxError::Validation)?;
        self.store.create_label(scope, fields)
    }

    pub fn update_label(
        &self,
        scope: MailboxScope,
        id: LabelId,
        fields: &LabelFields,
    ) -> Result<Label> {
        fields.normalized().map_err(MailboxError::Validation)?;
        self.store.update_label(scope, id, fields)
    }

    pub fn delete_label(&self, scope: MailboxScope, id: LabelId) -> Result<()> {
        self.store.delete_label(scope, id)
    }

    // === Signatures ===

    pub fn list_signatures(&self, scope: MailboxScope) -> Result<Vec<Signature>> {
        self.store.list_signatures(scope)
    }

    pub fn get_signature(&self, scope: MailboxScope, id: SignatureId) -> Result<Signature> {
        self.store
            .get_signature(scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("signature {}", id)))
    }

    pub fn create_signature(
        &self,
        scope: MailboxScope,
        fields: &SignatureFields,
    ) -> Result<Signature> {
        fields.validate().map_err(MailboxError::Validation)?;
        self.store.create_signature(scope, fields)
    }

    pub fn update_signature(
        &self,
        scope: MailboxScope,
        id: SignatureId,
        fields: &SignatureFields,
    ) -> Result<Signature> {
        fields.validate().map_err(MailboxError::Validation)?;
        self.store.update_signature(scope, id, fields)
    }

    pub fn delete_signature(&self, scope: MailboxScope, id: SignatureId) -> Result<()> {
        self.store.delete_signature(scope, id)
    }

    pub fn set_default_signature(&self, scope: MailboxScope, id: SignatureId) -> Result<Signature> {
        self.store.set_default_signature(scope, id)
    }

    // === Unfiled sends ===

    pub fn list_unfiled_sends(
        &self,
        scope: MailboxScope,
        include_resolved: bool,
    ) -> Result<Vec<UnfiledSend>> {
        self.store.list_unfiled_sends(scope, include_resolved)
    }

    /// File a sent-but-unfiled message; the transport is not involved
    pub fn refile_unfiled_send(&self, scope: MailboxScope, id: UnfiledSendId) -> Result<Email> {
        let email = self.store.refile_unfiled_send(scope, id)?;
        if let Err(e) = self
            .search
            .index_email(&email)
            .and_then(|_| self.search.commit())
        {
            error!("[SEARCH] Failed to index refiled email {} for {}: {:#}", email.id, scope, e);
        }
        Ok(email)
    }
}
