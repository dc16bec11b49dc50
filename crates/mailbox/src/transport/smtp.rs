//! SMTP relay adapter built on lettre

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use log::{debug, warn};

use super::{MailTransport, OutgoingMessage, TransportError};
use crate::config::SmtpConfig;
use crate::models::EmailAddress;

/// Port on which the relay expects TLS from the first byte
const IMPLICIT_TLS_PORT: u16 = 465;

/// Sends messages through an SMTP relay
pub struct SmtpMailTransport {
    mailer: SmtpTransport,
    host: String,
}

impl SmtpMailTransport {
    /// Build a relay connection from config
    ///
    /// Port 465 uses implicit TLS, any other port STARTTLS. `insecure`
    /// connects in plain text and is meant for local relays only.
    pub fn new(config: &SmtpConfig) -> anyhow::Result<Self> {
        let mut builder = if config.insecure {
            SmtpTransport::builder_dangerous(&config.host)
        } else if config.port == IMPLICIT_TLS_PORT {
            let params = TlsParameters::new(config.host.clone())?;
            SmtpTransport::relay(&config.host)?.tls(Tls::Wrapper(params))
        } else {
            SmtpTransport::starttls_relay(&config.host)?
        };

        builder = builder.port(config.port);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            host: config.host.clone(),
        })
    }
}

impl MailTransport for SmtpMailTransport {
    fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let built = build_message(message)?;

        match self.mailer.send(&built) {
            Ok(response) => {
                debug!(
                    "[TRANSPORT] {} accepted by {} ({})",
                    message.message_id,
                    self.host,
                    response.code()
                );
                Ok(())
            }
            Err(e) if e.is_permanent() => {
                warn!("[TRANSPORT] {} rejected by {}: {}", message.message_id, self.host, e);
                Err(TransportError::Rejected(e.to_string()))
            }
            Err(e) => {
                warn!("[TRANSPORT] Failed to reach {}: {}", self.host, e);
                Err(TransportError::Unavailable(e.to_string()))
            }
        }
    }
}

fn mailbox(addr: &EmailAddress) -> Result<Mailbox, TransportError> {
    let address = addr
        .email
        .trim()
        .parse()
        .map_err(|_| TransportError::InvalidMessage(format!("invalid address '{}'", addr.email)))?;
    Ok(Mailbox::new(addr.name.clone(), address))
}

/// Convert an outgoing message into a MIME message
fn build_message(message: &OutgoingMessage) -> Result<Message, TransportError> {
    let mut builder = Message::builder()
        .message_id(Some(message.message_id.clone()))
        .from(mailbox(&message.from)?)
        .subject(message.subject.clone());

    if let Some(parent) = &message.in_reply_to {
        builder = builder.in_reply_to(parent.clone());
    }
    if !message.references.is_empty() {
        builder = builder.references(message.references.join(" "));
    }
    for addr in &message.to {
        builder = builder.to(mailbox(addr)?);
    }
    for addr in &message.cc {
        builder = builder.cc(mailbox(addr)?);
    }
    for addr in &message.bcc {
        builder = builder.bcc(mailbox(addr)?);
    }

    let text = message.body_text.clone();
    let html = message.body_html.clone();

    let built = if message.attachments.is_empty() {
        match (text, html) {
            (Some(text), Some(html)) => {
                builder.multipart(MultiPart::alternative_plain_html(text, html))
            }
            (None, Some(html)) => builder.singlepart(SinglePart::html(html)),
            (text, None) => builder.singlepart(SinglePart::plain(text.unwrap_or_default())),
        }
    } else {
        let mut mixed = match (text, html) {
            (Some(text), Some(html)) => {
                MultiPart::mixed().multipart(MultiPart::alternative_plain_html(text, html))
            }
            (None, Some(html)) => MultiPart::mixed().singlepart(SinglePart::html(html)),
            (text, None) => {
                MultiPart::mixed().singlepart(SinglePart::plain(text.unwrap_or_default()))
            }
        };
        for attachment in &message.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
            mixed = mixed.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.data.clone(), content_type),
            );
        }
        builder.multipart(mixed)
    };

    built.map_err(|e| TransportError::InvalidMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OutgoingAttachment;

    fn message() -> OutgoingMessage {
        OutgoingMessage {
            message_id: "<abc@dealer.example>".to_string(),
            in_reply_to: Some("<parent@example.com>".to_string()),
            references: vec![
                "<root@example.com>".to_string(),
                "<parent@example.com>".to_string(),
            ],
            from: EmailAddress::with_name("Sales Rep", "rep@dealer.example"),
            to: vec![EmailAddress::new("buyer@example.com")],
            cc: Vec::new(),
            bcc: vec![EmailAddress::new("archive@dealer.example")],
            subject: "Re: Your quote".to_string(),
            body_text: Some("Numbers attached.".to_string()),
            body_html: Some("<p>Numbers attached.</p>".to_string()),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn test_build_message_headers() {
        let built = build_message(&message()).unwrap();
        let raw = String::from_utf8(built.formatted()).unwrap();

        assert!(raw.contains("Message-ID: <abc@dealer.example>"));
        assert!(raw.contains("In-Reply-To: <parent@example.com>"));
        assert!(raw.contains("References: <root@example.com> <parent@example.com>"));
        assert!(raw.contains("Subject: Re: Your quote"));
        assert!(raw.contains("multipart/alternative"));
        // Bcc recipients are envelope-only
        assert!(!raw.contains("archive@dealer.example"));
        assert_eq!(built.envelope().to().len(), 2);
    }

    #[test]
    fn test_build_message_with_attachment() {
        let mut msg = message();
        msg.attachments.push(OutgoingAttachment {
            filename: "quote.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            data: b"%PDF-1.4".to_vec(),
        });
        let raw = String::from_utf8(build_message(&msg).unwrap().formatted()).unwrap();
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("quote.pdf"));
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let mut msg = message();
        msg.to = vec![EmailAddress::new("not an address")];
        assert!(matches!(
            build_message(&msg),
            Err(TransportError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_new_plain_relay() {
        let config = SmtpConfig {
            host: "localhost".to_string(),
            port: 2525,
            username: None,
            password: None,
            insecure: true,
        };
        assert!(SmtpMailTransport::new(&config).is_ok());
    }
}
