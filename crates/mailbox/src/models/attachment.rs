//! Attachment metadata; the payload itself lives in the blob store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttachmentId, DraftId, EmailId, TenantId, UserId};

/// Where an attachment currently belongs
///
/// An attachment hangs off exactly one email, exactly one draft, or nothing
/// at all (uploaded but not yet referenced).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "ParentRepr", into = "ParentRepr")]
pub enum AttachmentParent {
    Email(EmailId),
    Draft(DraftId),
    Orphaned,
}

impl AttachmentParent {
    pub fn from_columns(email_id: Option<EmailId>, draft_id: Option<DraftId>) -> Self {
        match (email_id, draft_id) {
            (Some(email_id), _) => AttachmentParent::Email(email_id),
            (None, Some(draft_id)) => AttachmentParent::Draft(draft_id),
            (None, None) => AttachmentParent::Orphaned,
        }
    }

    pub fn email_id(&self) -> Option<EmailId> {
        match self {
            AttachmentParent::Email(id) => Some(*id),
            _ => None,
        }
    }

    pub fn draft_id(&self) -> Option<DraftId> {
        match self {
            AttachmentParent::Draft(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_orphaned(&self) -> bool {
        matches!(self, AttachmentParent::Orphaned)
    }
}

/// Wire shape: two nullable ids, never both set
#[derive(Serialize, Deserialize)]
struct ParentRepr {
    email_id: Option<EmailId>,
    draft_id: Option<DraftId>,
}

impl From<ParentRepr> for AttachmentParent {
    fn from(repr: ParentRepr) -> Self {
        AttachmentParent::from_columns(repr.email_id, repr.draft_id)
    }
}

impl From<AttachmentParent> for ParentRepr {
    fn from(parent: AttachmentParent) -> Self {
        ParentRepr {
            email_id: parent.email_id(),
            draft_id: parent.draft_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    #[serde(flatten)]
    pub parent: AttachmentParent,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub blob_key: String,
    pub blob_bucket: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_columns_prefers_email() {
        let email_id = EmailId::new();
        let parent = AttachmentParent::from_columns(Some(email_id), Some(DraftId::new()));
        assert_eq!(parent, AttachmentParent::Email(email_id));
        assert_eq!(
            AttachmentParent::from_columns(None, None),
            AttachmentParent::Orphaned
        );
    }

    #[test]
    fn test_parent_serializes_as_two_columns() {
        let draft_id = DraftId::new();
        let json = serde_json::to_value(AttachmentParent::Draft(draft_id)).unwrap();
        assert_eq!(json["email_id"], serde_json::Value::Null);
        assert_eq!(json["draft_id"], draft_id.to_string());

        let orphan = serde_json::to_value(AttachmentParent::Orphaned).unwrap();
        assert_eq!(orphan["email_id"], serde_json::Value::Null);
        assert_eq!(orphan["draft_id"], serde_json::Value::Null);
    }
}
