//! Draft model: an editable message that has not been sent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttachmentId, DraftId, EmailAddress, TenantId, ThreadId, UserId};
use crate::error::FieldError;

/// A not-yet-sent message owned by exactly one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub id: DraftId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    #[serde(flatten)]
    pub fields: DraftFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The user-editable part of a draft; saves replace it wholesale
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DraftFields {
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    /// Thread this draft replies into
    pub thread_id: Option<ThreadId>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Attachments parented to the draft, ordered by upload time
    pub attachment_ids: Vec<AttachmentId>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl DraftFields {
    /// Checks that hold for any saved draft
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        if let Some(from) = &self.from
            && !from.is_valid()
        {
            errors.push(FieldError::new("from", "invalid email address"));
        }

        for (field, list) in [("to", &self.to), ("cc", &self.cc), ("bcc", &self.bcc)] {
            for (i, addr) in list.iter().enumerate() {
                if !addr.is_valid() {
                    errors.push(FieldError::new(
                        format!("{}[{}]", field, i),
                        format!("invalid email address '{}'", addr.email),
                    ));
                }
            }
        }

        let mut seen = Vec::with_capacity(self.attachment_ids.len());
        for id in &self.attachment_ids {
            if seen.contains(id) {
                errors.push(FieldError::new(
                    "attachment_ids",
                    format!("attachment {} listed twice", id),
                ));
            }
            seen.push(*id);
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Checks that must additionally hold before handing the message to a transport
    pub fn validate_for_send(&self, now: DateTime<Utc>) -> Result<(), Vec<FieldError>> {
        let mut errors = self.validate().err().unwrap_or_default();

        if self.from.is_none() {
            errors.push(FieldError::new("from", "sender is required"));
        }
        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            errors.push(FieldError::new("to", "at least one recipient is required"));
        }
        if self.body_html.is_none() && self.body_text.is_none() && self.subject.trim().is_empty() {
            errors.push(FieldError::new("body", "message has no subject or body"));
        }
        if let Some(at) = self.scheduled_for
            && at > now
        {
            errors.push(FieldError::new(
                "scheduled_for",
                "scheduled sending is not supported",
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sendable() -> DraftFields {
        DraftFields {
            from: Some(EmailAddress::new("rep@dealer.com")),
            to: vec![EmailAddress::new("buyer@example.com")],
            subject: "Your quote".to_string(),
            body_text: Some("Attached.".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_draft_is_saveable() {
        assert!(DraftFields::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_recipient_is_reported_with_index() {
        let mut fields = sendable();
        fields.cc = vec![EmailAddress::new("ok@x.com"), EmailAddress::new("broken")];
        let errors = fields.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "cc[1]");
    }

    #[test]
    fn test_send_requires_sender_and_recipient() {
        let fields = DraftFields {
            body_text: Some("hi".to_string()),
            ..Default::default()
        };
        let errors = fields.validate_for_send(Utc::now()).unwrap_err();
        let names: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(names.contains(&"from"));
        assert!(names.contains(&"to"));
    }

    #[test]
    fn test_future_schedule_is_rejected() {
        let mut fields = sendable();
        fields.scheduled_for = Some(Utc::now() + chrono::Duration::hours(1));
        let errors = fields.validate_for_send(Utc::now()).unwrap_err();
        assert_eq!(errors[0].field, "scheduled_for");

        fields.scheduled_for = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(fields.validate_for_send(Utc::now()).is_ok());
    }

    #[test]
    fn test_duplicate_attachment_ids() {
        let id = AttachmentId::new();
        let mut fields = sendable();
        fields.attachment_ids = vec![id, id];
        assert!(fields.validate().is_err());
    }
}
