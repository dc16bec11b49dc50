//! Message-ID generation for outgoing mail

use uuid::Uuid;

/// Generates globally unique `<uuid@domain>` Message-IDs
#[derive(Debug, Clone)]
pub struct MessageIdGenerator {
    domain: String,
}

impl MessageIdGenerator {
    pub fn new(domain: impl Into<String>) -> Self {
        let domain = domain.into();
        let domain = domain.trim().trim_start_matches('@').to_ascii_lowercase();
        Self {
            domain: if domain.is_empty() {
                "localhost".to_string()
            } else {
                domain
            },
        }
    }

    pub fn generate(&self) -> String {
        format!("<{}@{}>", Uuid::new_v4().simple(), self.domain)
    }
}
