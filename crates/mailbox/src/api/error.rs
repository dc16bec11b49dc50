//! HTTP error responses

use std::error::Error as _;

use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::{debug, error};
use serde::Serialize;

use crate::error::{FieldError, MailboxError};

/// Error returned by every handler, rendered as `{error, code, details}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Vec<FieldError>,
    unfiled_send_id: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: &'a str,
    details: &'a [FieldError],
    #[serde(skip_serializing_if = "Option::is_none")]
    unfiled_send_id: Option<&'a str>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Vec::new(),
            unfiled_send_id: None,
        }
    }

    /// 400 with details for each offending field
    pub fn invalid(details: Vec<FieldError>) -> Self {
        let mut err = Self::new(StatusCode::BAD_REQUEST, "validation_error", "Invalid request");
        err.details = details;
        err
    }

    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::invalid(vec![FieldError::new(field, message)])
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn payload_too_large(limit: u64) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("Upload exceeds the {} byte limit", limit),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<MailboxError> for ApiError {
    fn from(e: MailboxError) -> Self {
        let code = e.code();
        match e {
            MailboxError::Validation(details) => Self::invalid(details),
            MailboxError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, code, e.to_string()),
            MailboxError::Constraint { .. } => Self::new(StatusCode::CONFLICT, code, e.to_string()),
            MailboxError::Transport { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, code, e.to_string())
            }
            MailboxError::StorageUnavailable { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, code, e.to_string())
            }
            MailboxError::SentButNotFiled { unfiled_id, .. } => {
                let mut err = Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, e.to_string());
                err.unfiled_send_id = Some(unfiled_id.to_string());
                err
            }
            MailboxError::Database { .. } | MailboxError::Internal(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, e.to_string())
            }
        }
    }
}

/// Body deserialization error that knows where in the document it happened
pub type LocatedJsonError = serde_path_to_error::Error<serde_json::Error>;

fn located_field(err: &LocatedJsonError) -> FieldError {
    let path = err.path().to_string();
    // Root-level failures such as a missing field or a non-object body
    let field = if path == "." { "body".to_string() } else { path };
    FieldError::new(field, err.inner().to_string())
}

impl From<LocatedJsonError> for ApiError {
    fn from(e: LocatedJsonError) -> Self {
        Self::invalid(vec![located_field(&e)])
    }
}

/// Unparseable bodies are a plain 400; bodies of the wrong shape, such as a
/// bad UUID, name the offending field
impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        if let JsonRejection::JsonDataError(data) = &e {
            let located = std::iter::successors(data.source(), |err: &&(dyn std::error::Error + 'static)| (*err).source())
                .find_map(|err| err.downcast_ref::<LocatedJsonError>());
            if let Some(located) = located {
                return Self::invalid(vec![located_field(located)]);
            }
        }
        Self::bad_request(e.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        let mut err = Self::bad_request(e.body_text());
        err.status = e.status();
        err
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("[API] {} {}: {}", self.status.as_u16(), self.code, self.message);
        } else {
            debug!("[API] {} {}: {}", self.status.as_u16(), self.code, self.message);
        }

        let body = ErrorBody {
            error: &self.message,
            code: self.code,
            details: &self.details,
            unfiled_send_id: self.unfiled_send_id.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}
