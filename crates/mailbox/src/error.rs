//! Error types for mailbox operations

use serde::Serialize;

use crate::models::UnfiledSendId;

pub type Result<T, E = MailboxError> = std::result::Result<T, E>;

/// One invalid input field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by the mailbox service
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Validation failed: {}", summarize(.0))]
    Validation(Vec<FieldError>),

    /// Absent and out-of-scope resources are indistinguishable
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Constraint violation: {message}")]
    Constraint { message: String },

    /// The message was not sent; any draft is untouched
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// The message went out but could not be filed into the mailbox
    #[error("Message {message_id} was sent but not filed (unfiled send {unfiled_id}): {reason}")]
    SentButNotFiled {
        message_id: String,
        unfiled_id: UnfiledSendId,
        reason: String,
    },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MailboxError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        MailboxError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        MailboxError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        MailboxError::Constraint {
            message: message.into(),
        }
    }

    pub fn storage_unavailable(err: impl std::fmt::Display) -> Self {
        MailboxError::StorageUnavailable {
            message: err.to_string(),
        }
    }

    /// Stable machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            MailboxError::Validation(_) => "validation_error",
            MailboxError::NotFound { .. } => "not_found",
            MailboxError::Constraint { .. } => "conflict",
            MailboxError::Transport { .. } => "transport_error",
            MailboxError::StorageUnavailable { .. } => "storage_unavailable",
            MailboxError::SentButNotFiled { .. } => "sent_but_not_filed",
            MailboxError::Database { .. } => "database_error",
            MailboxError::Internal(_) => "internal_error",
        }
    }
}

impl From<rusqlite::Error> for MailboxError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                MailboxError::Constraint {
                    message: msg.clone().unwrap_or_else(|| e.to_string()),
                }
            }
            _ => MailboxError::Database {
                message: e.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for MailboxError {
    fn from(e: serde_json::Error) -> Self {
        MailboxError::Database {
            message: format!("Corrupt JSON column: {}", e),
        }
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_fields() {
        let err = MailboxError::Validation(vec![
            FieldError::new("to", "required"),
            FieldError::new("from", "invalid"),
        ]);
        assert_eq!(err.to_string(), "Validation failed: to: required; from: invalid");
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn test_constraint_violation_maps_to_constraint() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (name TEXT UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err: MailboxError = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, MailboxError::Constraint { .. }));
    }

    #[test]
    fn test_other_sqlite_errors_map_to_database() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: MailboxError = conn.execute("SELECT * FROM missing", []).unwrap_err().into();
        assert!(matches!(err, MailboxError::Database { .. }));
    }
}
