//! Request parameter parsing
//!
//! Query values arrive as strings and are parsed here so that every bad
//! value is reported as a field error instead of a bare rejection.

use std::str::FromStr;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::error::ApiError;
use crate::error::FieldError;
use crate::models::{Folder, MailboxScope, TenantId, UserId};
use crate::storage::{EmailFilter, EmailSortField, SortOrder, ThreadFilter};

/// The mailbox a request operates on, from `dealership_id` (or `tenant_id`) and `user_id`
#[derive(Debug, Clone, Copy)]
pub struct Scope(pub MailboxScope);

impl<S: Send + Sync> FromRequestParts<S> for Scope {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let query = parts.uri.query().unwrap_or_default();
        let mut tenant = None;
        let mut user = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "dealership_id" | "tenant_id" => tenant = Some(value.into_owned()),
                "user_id" => user = Some(value.into_owned()),
                _ => {}
            }
        }

        let mut errors = Vec::new();
        let tenant_id: Option<TenantId> = required(&mut errors, "dealership_id", tenant);
        let user_id: Option<UserId> = required(&mut errors, "user_id", user);
        match (tenant_id, user_id) {
            (Some(tenant_id), Some(user_id)) if errors.is_empty() => {
                Ok(Scope(MailboxScope::new(tenant_id, user_id)))
            }
            _ => Err(ApiError::invalid(errors)),
        }
    }
}

fn required<T: FromStr>(
    errors: &mut Vec<FieldError>,
    field: &str,
    raw: Option<String>,
) -> Option<T> {
    match raw.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        None => {
            errors.push(FieldError::new(field, "is required"));
            None
        }
        Some(value) => parse_into(errors, field, value, "must be a valid UUID"),
    }
}

fn parse_into<T: FromStr>(
    errors: &mut Vec<FieldError>,
    field: &str,
    value: &str,
    message: &str,
) -> Option<T> {
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(FieldError::new(field, message));
            None
        }
    }
}

/// Parse a path or body id, reporting a malformed value as a 400
/// Deserialize a body that was first read as a JSON value, naming the
/// offending field on failure
pub fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, ApiError> {
    Ok(serde_path_to_error::deserialize(value)?)
}

pub fn parse_id<T: FromStr>(field: &str, raw: &str) -> Result<T, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::invalid_field(field, "must be a valid UUID"))
}

/// Parse a list of ids, naming each bad entry by index
pub fn parse_ids<T: FromStr>(field: &str, raw: &[String]) -> Result<Vec<T>, ApiError> {
    let mut errors = Vec::new();
    let ids: Vec<T> = raw
        .iter()
        .enumerate()
        .filter_map(|(i, v)| {
            let name = format!("{}[{}]", field, i);
            parse_into(&mut errors, &name, v.trim(), "must be a valid UUID")
        })
        .collect();
    if errors.is_empty() {
        Ok(ids)
    } else {
        Err(ApiError::invalid(errors))
    }
}

fn opt<T: FromStr>(
    errors: &mut Vec<FieldError>,
    field: &str,
    raw: &Option<String>,
    message: &str,
) -> Option<T> {
    raw.as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| parse_into(errors, field, v, message))
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Query parameters of `GET /inbox`
#[derive(Debug, Default, Deserialize)]
pub struct InboxParams {
    pub folder: Option<String>,
    pub is_read: Option<String>,
    pub is_starred: Option<String>,
    pub is_important: Option<String>,
    pub has_attachments: Option<String>,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub q: Option<String>,
    /// Comma separated; every label must match
    pub labels: Option<String>,
    pub thread_id: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

impl InboxParams {
    pub fn into_filter(self) -> Result<EmailFilter, ApiError> {
        let mut errors = Vec::new();
        const BOOL: &str = "must be true or false";

        let filter = EmailFilter {
            folder: opt::<Folder>(&mut errors, "folder", &self.folder, "unknown folder"),
            is_read: opt(&mut errors, "is_read", &self.is_read, BOOL),
            is_starred: opt(&mut errors, "is_starred", &self.is_starred, BOOL),
            is_important: opt(&mut errors, "is_important", &self.is_important, BOOL),
            has_attachments: opt(&mut errors, "has_attachments", &self.has_attachments, BOOL),
            thread_id: opt(&mut errors, "thread_id", &self.thread_id, "must be a valid UUID"),
            sort_by: opt::<EmailSortField>(
                &mut errors,
                "sort_by",
                &self.sort_by,
                "must be one of received_at, sent_at, subject, from",
            )
            .unwrap_or_default(),
            sort_order: opt::<SortOrder>(
                &mut errors,
                "sort_order",
                &self.sort_order,
                "must be asc or desc",
            )
            .unwrap_or_default(),
            limit: opt(&mut errors, "limit", &self.limit, "must be a positive number"),
            offset: opt(&mut errors, "offset", &self.offset, "must be a positive number"),
            labels: self
                .labels
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            from: non_empty(self.from),
            subject: non_empty(self.subject),
            q: non_empty(self.q),
        };

        if errors.is_empty() {
            Ok(filter)
        } else {
            Err(ApiError::invalid(errors))
        }
    }
}

/// Query parameters of `GET /threads`
#[derive(Debug, Default, Deserialize)]
pub struct ThreadParams {
    pub folder: Option<String>,
    pub is_unread: Option<String>,
    pub is_starred: Option<String>,
    pub label: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

impl ThreadParams {
    pub fn into_filter(self) -> Result<ThreadFilter, ApiError> {
        let mut errors = Vec::new();
        let filter = ThreadFilter {
            folder: opt::<Folder>(&mut errors, "folder", &self.folder, "unknown folder"),
            is_unread: opt(&mut errors, "is_unread", &self.is_unread, "must be true or false"),
            is_starred: opt(&mut errors, "is_starred", &self.is_starred, "must be true or false"),
            limit: opt(&mut errors, "limit", &self.limit, "must be a positive number"),
            offset: opt(&mut errors, "offset", &self.offset, "must be a positive number"),
            label: non_empty(self.label),
        };
        if errors.is_empty() {
            Ok(filter)
        } else {
            Err(ApiError::invalid(errors))
        }
    }
}

/// `limit` / `offset` for simple paged lists
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<String>,
    pub offset: Option<String>,
}

impl PageParams {
    pub fn parse(&self) -> Result<(Option<u32>, Option<u32>), ApiError> {
        let mut errors = Vec::new();
        let limit = opt(&mut errors, "limit", &self.limit, "must be a positive number");
        let offset = opt(&mut errors, "offset", &self.offset, "must be a positive number");
        if errors.is_empty() {
            Ok((limit, offset))
        } else {
            Err(ApiError::invalid(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmailId;
    use axum::http::Request;

    async fn scope_from(uri: &str) -> Result<Scope, ApiError> {
        let (mut parts, _) = Request::builder().uri(uri).body(()).unwrap().into_parts();
        Scope::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_scope_accepts_both_tenant_names() {
        let t = TenantId::new();
        let u = UserId::new();
        let a = scope_from(&format!("/inbox?dealership_id={}&user_id={}", t, u)).await.unwrap();
        let b = scope_from(&format!("/inbox?tenant_id={}&user_id={}", t, u)).await.unwrap();
        assert_eq!(a.0, b.0);
        assert_eq!(a.0.tenant_id, t);
    }

    #[tokio::test]
    async fn test_scope_reports_each_bad_field() {
        let err = scope_from("/inbox?dealership_id=nope").await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_inbox_params() {
        let params = InboxParams {
            folder: Some("archive".into()),
            is_read: Some("false".into()),
            labels: Some("Hot, Leads,,".into()),
            sort_by: Some("subject".into()),
            sort_order: Some("asc".into()),
            limit: Some("20".into()),
            ..Default::default()
        };
        let filter = params.into_filter().unwrap();
        assert_eq!(filter.folder, Some(Folder::Archive));
        assert_eq!(filter.is_read, Some(false));
        assert_eq!(filter.labels, vec!["Hot", "Leads"]);
        assert_eq!(filter.sort_by, EmailSortField::Subject);
        assert_eq!(filter.sort_order, SortOrder::Asc);
        assert_eq!(filter.limit, Some(20));
    }

    #[test]
    fn test_inbox_params_collect_errors() {
        let params = InboxParams {
            folder: Some("spam".into()),
            is_starred: Some("maybe".into()),
            thread_id: Some("123".into()),
            ..Default::default()
        };
        assert!(params.into_filter().is_err());
    }

    #[test]
    fn test_parse_ids_names_index() {
        let raw = vec![EmailId::new().to_string(), "bad".to_string()];
        assert!(parse_ids::<EmailId>("email_ids", &raw).is_err());
        assert_eq!(parse_ids::<EmailId>("email_ids", &raw[..1]).unwrap().len(), 1);
    }
}
