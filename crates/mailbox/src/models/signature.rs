//! Email signatures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SignatureId, TenantId, UserId};
use crate::error::FieldError;

/// A named HTML snippet; at most one per user is the default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub id: SignatureId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub name: String,
    pub body_html: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureFields {
    pub name: String,
    #[serde(default)]
    pub body_html: String,
    #[serde(default)]
    pub is_default: bool,
}

impl SignatureFields {
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        if self.name.trim().is_empty() {
            return Err(vec![FieldError::new("name", "name is required")]);
        }
        Ok(())
    }
}
