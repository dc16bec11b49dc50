//! Outbound mail transport
//!
//! The mailbox never speaks SMTP itself. Sending is delegated to a
//! `MailTransport`, chosen once at startup: the lettre-backed SMTP adapter
//! when a relay is configured, otherwise a transport that only logs.

mod smtp;

pub use smtp::SmtpMailTransport;

use std::sync::atomic::{AtomicUsize, Ordering};

use log::info;

use crate::models::EmailAddress;

/// Errors reported by a transport; the message was not accepted
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The message could not be built (bad address, bad content type)
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Relay rejected message: {0}")]
    Rejected(String),
    #[error("Relay unavailable: {0}")]
    Unavailable(String),
}

/// File attached to an outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A fully resolved message handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// `<id@domain>` form
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<OutgoingAttachment>,
}

impl OutgoingMessage {
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }
}

/// Trait for handing messages to an external mail system
///
/// `send` returns once the message was accepted for delivery. An error
/// means nothing was sent and the caller may keep its draft.
pub trait MailTransport: Send + Sync {
    fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError>;
}

/// Transport that accepts every message and only logs it
///
/// Used when no SMTP relay is configured, e.g. in development.
#[derive(Debug, Default)]
pub struct LoggingTransport {
    sent: AtomicUsize,
}

impl LoggingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages accepted so far
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

impl MailTransport for LoggingTransport {
    fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            "[TRANSPORT] Accepted {} from {} to {} recipients ({} attachments), not delivered",
            message.message_id,
            message.from.email,
            message.recipient_count(),
            message.attachments.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutgoingMessage {
        OutgoingMessage {
            message_id: "<1@mailbox.local>".to_string(),
            in_reply_to: None,
            references: Vec::new(),
            from: EmailAddress::new("rep@dealer.com"),
            to: vec![EmailAddress::new("buyer@example.com")],
            cc: vec![EmailAddress::new("manager@dealer.com")],
            bcc: Vec::new(),
            subject: "Quote".to_string(),
            body_text: Some("See attached".to_string()),
            body_html: None,
            attachments: Vec::new(),
        }
    }

    #[test]
    fn test_logging_transport_counts() {
        let transport = LoggingTransport::new();
        transport.send(&message()).unwrap();
        transport.send(&message()).unwrap();
        assert_eq!(transport.sent_count(), 2);
    }

    #[test]
    fn test_recipient_count() {
        assert_eq!(message().recipient_count(), 2);
    }
}
