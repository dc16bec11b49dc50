//! Action handler for mailbox state transitions
//!
//! Every transition goes through the store in one transaction, which also
//! recomputes the aggregates of each affected thread exactly once.

use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;

use crate::error::{MailboxError, Result};
use crate::models::{Email, EmailId, EmailMutation, Folder, MailboxScope, ThreadId};
use crate::search::SearchIndex;
use crate::storage::{BlobStore, MailboxStore, MutationOutcome, PurgeOutcome};

/// Upper bound on ids accepted by one batch request
pub const MAX_BATCH_SIZE: usize = 500;

/// Batch operations exposed over `POST /batch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAction {
    Read,
    Unread,
    Archive,
    Unarchive,
    Delete,
    DeletePermanent,
    Move(Folder),
    AddLabels(Vec<String>),
    RemoveLabels(Vec<String>),
}

impl BatchAction {
    /// Parse a wire action name with its optional arguments
    pub fn parse(action: &str, folder: Option<Folder>, labels: Vec<String>) -> Result<Self> {
        let labels = clean_labels(labels)?;
        match action {
            "read" | "mark_read" => Ok(Self::Read),
            "unread" | "mark_unread" => Ok(Self::Unread),
            "archive" => Ok(Self::Archive),
            "unarchive" => Ok(Self::Unarchive),
            "delete" | "trash" => Ok(Self::Delete),
            "delete_permanent" => Ok(Self::DeletePermanent),
            "move" => folder
                .map(Self::Move)
                .ok_or_else(|| MailboxError::validation("folder", "folder is required for move")),
            "add_labels" | "remove_labels" if labels.is_empty() => Err(MailboxError::validation(
                "labels",
                format!("labels are required for {}", action),
            )),
            "add_labels" => Ok(Self::AddLabels(labels)),
            "remove_labels" => Ok(Self::RemoveLabels(labels)),
            other => Err(MailboxError::validation(
                "action",
                format!("unknown action '{}'", other),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BatchAction::Read => "read",
            BatchAction::Unread => "unread",
            BatchAction::Archive => "archive",
            BatchAction::Unarchive => "unarchive",
            BatchAction::Delete => "delete",
            BatchAction::DeletePermanent => "delete_permanent",
            BatchAction::Move(_) => "move",
            BatchAction::AddLabels(_) => "add_labels",
            BatchAction::RemoveLabels(_) => "remove_labels",
        }
    }

    /// The per-email transition, or None for permanent deletion
    fn mutation(&self) -> Option<EmailMutation> {
        match self {
            BatchAction::Read => Some(EmailMutation::SetRead(true)),
            BatchAction::Unread => Some(EmailMutation::SetRead(false)),
            BatchAction::Archive => Some(EmailMutation::Move(Folder::Archive)),
            BatchAction::Unarchive => Some(EmailMutation::Move(Folder::Inbox)),
            BatchAction::Delete => Some(EmailMutation::Move(Folder::Trash)),
            BatchAction::Move(folder) => Some(EmailMutation::Move(*folder)),
            BatchAction::AddLabels(labels) => Some(EmailMutation::AddLabels(labels.clone())),
            BatchAction::RemoveLabels(labels) => Some(EmailMutation::RemoveLabels(labels.clone())),
            BatchAction::DeletePermanent => None,
        }
    }
}

fn clean_labels(labels: Vec<String>) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for label in labels {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        if label.chars().count() > 100 {
            return Err(MailboxError::validation(
                "labels",
                "label names must be at most 100 characters",
            ));
        }
        if !out.iter().any(|l| l.eq_ignore_ascii_case(label)) {
            out.push(label.to_string());
        }
    }
    Ok(out)
}

/// Uniform result of a batch request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub action: &'static str,
    pub requested: usize,
    /// Emails whose state changed (or were removed, for permanent deletion)
    pub updated: usize,
    pub skipped: usize,
    pub threads_recomputed: Vec<ThreadId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub threads_removed: Vec<ThreadId>,
}

/// Handler for mailbox state transitions over one or many emails
///
/// All operations are scoped to one mailbox and idempotent: ids outside the
/// mailbox are skipped and repeating a transition changes nothing.
pub struct MailboxActions {
    store: Arc<dyn MailboxStore>,
    blobs: Arc<dyn BlobStore>,
    search: Arc<SearchIndex>,
}

impl MailboxActions {
    /// Create a new action handler
    pub fn new(
        store: Arc<dyn MailboxStore>,
        blobs: Arc<dyn BlobStore>,
        search: Arc<SearchIndex>,
    ) -> Self {
        Self {
            store,
            blobs,
            search,
        }
    }

    fn apply(
        &self,
        scope: MailboxScope,
        ids: &[EmailId],
        mutation: EmailMutation,
    ) -> Result<MutationOutcome> {
        let outcome = self
            .store
            .apply_mutation(scope, ids, &mutation)
            .inspect_err(|e| {
                warn!("[ACTIONS] {} failed for {}: {}", mutation.name(), scope, e);
            })?;

        info!(
            "[ACTIONS] {} on {} emails for {}: {} updated, {} threads recomputed",
            mutation.name(),
            ids.len(),
            scope,
            outcome.updated,
            outcome.threads_recomputed.len()
        );
        Ok(outcome)
    }

    pub fn mark_read(&self, scope: MailboxScope, ids: &[EmailId]) -> Result<MutationOutcome> {
        self.apply(scope, ids, EmailMutation::SetRead(true))
    }

    pub fn mark_unread(&self, scope: MailboxScope, ids: &[EmailId]) -> Result<MutationOutcome> {
        self.apply(scope, ids, EmailMutation::SetRead(false))
    }

    /// Move emails to a folder; `drafts` is rejected
    pub fn move_to_folder(
        &self,
        scope: MailboxScope,
        ids: &[EmailId],
        folder: Folder,
    ) -> Result<MutationOutcome> {
        self.apply(scope, ids, EmailMutation::Move(folder))
    }

    pub fn archive(&self, scope: MailboxScope, ids: &[EmailId]) -> Result<MutationOutcome> {
        self.move_to_folder(scope, ids, Folder::Archive)
    }

    pub fn unarchive(&self, scope: MailboxScope, ids: &[EmailId]) -> Result<MutationOutcome> {
        self.move_to_folder(scope, ids, Folder::Inbox)
    }

    /// Move emails to trash
    pub fn delete(&self, scope: MailboxScope, ids: &[EmailId]) -> Result<MutationOutcome> {
        self.move_to_folder(scope, ids, Folder::Trash)
    }

    pub fn add_labels(
        &self,
        scope: MailboxScope,
        ids: &[EmailId],
        labels: Vec<String>,
    ) -> Result<MutationOutcome> {
        self.apply(scope, ids, EmailMutation::AddLabels(clean_labels(labels)?))
    }

    pub fn remove_labels(
        &self,
        scope: MailboxScope,
        ids: &[EmailId],
        labels: Vec<String>,
    ) -> Result<MutationOutcome> {
        self.apply(scope, ids, EmailMutation::RemoveLabels(clean_labels(labels)?))
    }

    /// Flip the starred flag of one email, returning it afterwards
    pub fn toggle_star(&self, scope: MailboxScope, id: EmailId) -> Result<Email> {
        self.toggle(scope, id, EmailMutation::ToggleStarred)
    }

    /// Flip the important flag of one email, returning it afterwards
    pub fn toggle_important(&self, scope: MailboxScope, id: EmailId) -> Result<Email> {
        self.toggle(scope, id, EmailMutation::ToggleImportant)
    }

    fn toggle(&self, scope: MailboxScope, id: EmailId, mutation: EmailMutation) -> Result<Email> {
        if self.store.get_email(scope, id)?.is_none() {
            return Err(MailboxError::not_found(format!("email {}", id)));
        }
        self.apply(scope, &[id], mutation)?;
        self.store
            .get_email(scope, id)?
            .ok_or_else(|| MailboxError::not_found(format!("email {}", id)))
    }

    /// Hard-delete emails that are in trash; anything else is skipped
    ///
    /// Attachment blobs and search documents are cleaned up after the
    /// transaction commits. Failures there are logged and do not fail the call.
    pub fn delete_permanent(&self, scope: MailboxScope, ids: &[EmailId]) -> Result<PurgeOutcome> {
        let outcome = self.store.delete_permanent(scope, ids).inspect_err(|e| {
            warn!("[ACTIONS] delete_permanent failed for {}: {}", scope, e);
        })?;

        for key in &outcome.blob_keys {
            if let Err(e) = self.blobs.delete(key) {
                error!("[BLOB] Failed to delete blob {} for {}: {:#}", key, scope, e);
            }
        }

        if !outcome.deleted.is_empty()
            && let Err(e) = self
                .search
                .remove_emails(&outcome.deleted)
                .and_then(|_| self.search.commit())
        {
            error!("[SEARCH] Failed to unindex deleted emails for {}: {:#}", scope, e);
        }

        Ok(outcome)
    }

    /// Run one batch action over `ids`
    pub fn batch(
        &self,
        scope: MailboxScope,
        ids: &[EmailId],
        action: &BatchAction,
    ) -> Result<BatchOutcome> {
        if ids.is_empty() {
            return Err(MailboxError::validation("email_ids", "at least one id is required"));
        }
        if ids.len() > MAX_BATCH_SIZE {
            return Err(MailboxError::validation(
                "email_ids",
                format!("at most {} ids per batch", MAX_BATCH_SIZE),
            ));
        }

        match action.mutation() {
            Some(mutation) => {
                let outcome = self.apply(scope, ids, mutation)?;
                Ok(BatchOutcome {
                    action: action.name(),
                    requested: ids.len(),
                    updated: outcome.updated,
                    skipped: ids.len().saturating_sub(outcome.updated),
                    threads_recomputed: outcome.threads_recomputed,
                    threads_removed: Vec::new(),
                })
            }
            None => {
                let outcome = self.delete_permanent(scope, ids)?;
                Ok(BatchOutcome {
                    action: action.name(),
                    requested: ids.len(),
                    updated: outcome.deleted.len(),
                    skipped: outcome.skipped,
                    threads_recomputed: outcome.threads_recomputed,
                    threads_removed: outcome.threads_removed,
                })
            }
        }
    }
}
