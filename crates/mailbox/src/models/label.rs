//! User-defined labels

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LabelId, TenantId, UserId};
use crate::error::FieldError;

const DEFAULT_COLOR: &str = "#9e9e9e";
const MAX_NAME_LEN: usize = 100;

/// A named, colored tag; names are unique per mailbox regardless of case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub name: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelFields {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

impl LabelFields {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: None,
        }
    }

    /// Trimmed name and a color, validated
    pub fn normalized(&self) -> Result<(String, String), Vec<FieldError>> {
        let mut errors = Vec::new();

        let name = self.name.trim();
        if name.is_empty() {
            errors.push(FieldError::new("name", "name is required"));
        } else if name.chars().count() > MAX_NAME_LEN {
            errors.push(FieldError::new(
                "name",
                format!("name must be at most {} characters", MAX_NAME_LEN),
            ));
        }

        let color = self
            .color
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_COLOR);
        if !is_hex_color(color) {
            errors.push(FieldError::new("color", "color must look like #rrggbb"));
        }

        if errors.is_empty() {
            Ok((name.to_string(), color.to_ascii_lowercase()))
        } else {
            Err(errors)
        }
    }
}

fn is_hex_color(s: &str) -> bool {
    match s.strip_prefix('#') {
        Some(hex) => (hex.len() == 6 || hex.len() == 3) && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_color() {
        let (name, color) = LabelFields::new("  Leads ").normalized().unwrap();
        assert_eq!(name, "Leads");
        assert_eq!(color, DEFAULT_COLOR);
    }

    #[test]
    fn test_rejects_bad_input() {
        let fields = LabelFields {
            name: " ".to_string(),
            color: Some("red".to_string()),
        };
        let errors = fields.normalized().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_short_hex_color() {
        let fields = LabelFields {
            name: "Hot".to_string(),
            color: Some("#F00".to_string()),
        };
        assert_eq!(fields.normalized().unwrap().1, "#f00");
    }
}
