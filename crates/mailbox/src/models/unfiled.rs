//! Records of sends the transport accepted but the mailbox failed to file

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttachmentId, DraftId, EmailId, NewEmail, TenantId, UnfiledSendId, UserId};

/// Everything the persistence half of a send needs, replayable on its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentFiling {
    /// The sent email as it should be stored (folder sent, read)
    pub email: NewEmail,
    /// Draft to consume; its attachments move to the new email
    pub draft_id: Option<DraftId>,
    /// Orphaned uploads to attach when there is no draft
    #[serde(default)]
    pub attachment_ids: Vec<AttachmentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfiledSend {
    pub id: UnfiledSendId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub message_id: String,
    pub draft_id: Option<DraftId>,
    pub filing: SentFiling,
    /// Error that prevented filing
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_email_id: Option<EmailId>,
}

impl UnfiledSend {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}
