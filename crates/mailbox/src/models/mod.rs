//! Domain models for mailbox entities

mod attachment;
mod draft;
mod email;
mod label;
mod page;
mod signature;
mod state;
mod thread;
mod unfiled;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use attachment::{Attachment, AttachmentParent};
pub use draft::{Draft, DraftFields};
pub use email::{
    EmailAddress, Email, Folder, NewEmail, NewEmailBuilder, make_snippet, normalize_message_id,
    split_references,
};
pub use label::{Label, LabelFields};
pub use page::Page;
pub use signature::{Signature, SignatureFields};
pub use state::{EmailMutation, EmailState};
pub use thread::{Thread, normalize_subject};
pub use unfiled::{SentFiling, UnfiledSend};

/// Declares a UUID-backed identifier newtype
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Tenant (dealership) that owns a set of mailboxes
    TenantId
);
uuid_id!(
    /// Mailbox owner within a tenant
    UserId
);
uuid_id!(EmailId);
uuid_id!(ThreadId);
uuid_id!(DraftId);
uuid_id!(AttachmentId);
uuid_id!(LabelId);
uuid_id!(SignatureId);
uuid_id!(UnfiledSendId);

/// The (tenant, user) pair every mailbox read and write is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailboxScope {
    pub tenant_id: TenantId,
    pub user_id: UserId,
}

impl MailboxScope {
    pub fn new(tenant_id: TenantId, user_id: UserId) -> Self {
        Self { tenant_id, user_id }
    }
}

impl fmt::Display for MailboxScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tenant={} user={}", self.tenant_id, self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_round_trip() {
        let id = EmailId::new();
        let parsed: EmailId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<ThreadId>().is_err());
        assert!("".parse::<ThreadId>().is_err());
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = DraftId(Uuid::nil());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
    }

    #[test]
    fn test_scope_display() {
        let scope = MailboxScope::new(TenantId(Uuid::nil()), UserId(Uuid::nil()));
        assert!(scope.to_string().starts_with("tenant=00000000"));
    }
}
