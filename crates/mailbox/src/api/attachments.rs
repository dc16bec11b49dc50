//! Attachment endpoints and the signed `/blobs/{key}` object routes

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use log::debug;
use serde::Deserialize;

use super::params::{Scope, parse_id};
use super::{ApiError, AppState, MULTIPART_OVERHEAD};
use crate::attachments::{Upload, UploadTicket};
use crate::models::{Attachment, AttachmentId, DraftId};
use crate::storage::{PresignedUrl, StoredBlob};

/// `Content-Length` when the client declared one
fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `POST /attachments/upload`: multipart with a `file` part and an optional `draft_id` part
pub async fn upload(
    State(state): State<AppState>,
    Scope(scope): Scope,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Attachment>), ApiError> {
    let limit = state.service().attachments().max_upload_bytes();
    if declared_length(&headers).is_some_and(|len| len > limit + MULTIPART_OVERHEAD) {
        return Err(ApiError::payload_too_large(limit));
    }

    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;
    let mut draft_id: Option<DraftId> = None;

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let part_type = field.content_type().map(str::to_string);
                let mut data = Vec::new();
                while let Some(chunk) = field.chunk().await? {
                    if (data.len() + chunk.len()) as u64 > limit {
                        return Err(ApiError::payload_too_large(limit));
                    }
                    data.extend_from_slice(&chunk);
                }
                file = Some((filename, part_type, data));
            }
            Some("draft_id") => {
                let raw = field.text().await?;
                if !raw.trim().is_empty() {
                    draft_id = Some(parse_id("draft_id", &raw)?);
                }
            }
            other => debug!("[API] Ignoring multipart field {:?}", other),
        }
    }

    let Some((filename, content_type, data)) = file else {
        return Err(ApiError::invalid_field("file", "a file part is required"));
    };
    let upload = Upload {
        filename,
        content_type,
        data,
        draft_id,
    };
    let attachment = state
        .run(move |svc| svc.attachments().upload(scope, upload))
        .await?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

pub async fn get(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Json<Attachment>, ApiError> {
    let id: AttachmentId = parse_id("id", &id)?;
    Ok(Json(
        state.run(move |svc| svc.attachments().get(scope, id)).await?,
    ))
}

pub async fn delete(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id: AttachmentId = parse_id("id", &id)?;
    state
        .run(move |svc| svc.attachments().delete(scope, id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stream the payload back through the service
pub async fn download(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id: AttachmentId = parse_id("id", &id)?;
    let (attachment, blob) = state
        .run(move |svc| svc.attachments().download(scope, id))
        .await?;
    Ok(blob_response(blob, Some(&attachment.filename)))
}

pub async fn download_url(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Json<PresignedUrl>, ApiError> {
    let id: AttachmentId = parse_id("id", &id)?;
    Ok(Json(
        state
            .run(move |svc| svc.attachments().download_url(scope, id))
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadUrlParams {
    filename: Option<String>,
    content_type: Option<String>,
    size: Option<String>,
    draft_id: Option<String>,
}

pub async fn upload_url(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Query(params): Query<UploadUrlParams>,
) -> Result<Json<UploadTicket>, ApiError> {
    let filename = params
        .filename
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| ApiError::invalid_field("filename", "is required"))?;
    let size: u64 = match params.size.as_deref() {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ApiError::invalid_field("size", "must be a byte count"))?,
        None => return Err(ApiError::invalid_field("size", "is required")),
    };
    let limit = state.service().attachments().max_upload_bytes();
    if size > limit {
        return Err(ApiError::payload_too_large(limit));
    }
    let draft_id: Option<DraftId> = params
        .draft_id
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .map(|v| parse_id("draft_id", v))
        .transpose()?;

    let content_type = params.content_type;
    let ticket = state
        .run(move |svc| {
            svc.attachments().upload_url(
                scope,
                &filename,
                content_type.as_deref(),
                size,
                draft_id,
            )
        })
        .await?;
    Ok(Json(ticket))
}

// === Signed object routes ===

#[derive(Debug, Default, Deserialize)]
pub struct SignedParams {
    expires: Option<String>,
    signature: Option<String>,
}

/// Check a signed request; 404 when this deployment does not sign URLs
fn verify(state: &AppState, method: &str, key: &str, params: &SignedParams) -> Result<(), ApiError> {
    let Some(signer) = state.service().attachments().blob_signer() else {
        return Err(ApiError::not_found("No such endpoint"));
    };
    let expires: i64 = params
        .expires
        .as_deref()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError::forbidden("Missing or malformed expiry"))?;
    let signature = params
        .signature
        .as_deref()
        .ok_or_else(|| ApiError::forbidden("Missing signature"))?;
    signer
        .verify(method, key, expires, signature, Utc::now())
        .map_err(|e| ApiError::forbidden(e.to_string()))
}

pub async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<SignedParams>,
) -> Result<Response, ApiError> {
    verify(&state, "GET", &key, &params)?;
    let blob = state
        .run(move |svc| svc.attachments().read_blob(&key))
        .await?;
    Ok(blob_response(blob, None))
}

pub async fn put_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<SignedParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    verify(&state, "PUT", &key, &params)?;
    let limit = state.service().attachments().max_upload_bytes();
    if body.len() as u64 > limit {
        return Err(ApiError::payload_too_large(limit));
    }
    let content_type = content_type(&headers);
    state
        .run(move |svc| {
            svc.attachments()
                .write_blob(&key, content_type.as_deref(), &body)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn blob_response(blob: StoredBlob, filename: Option<&str>) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&blob.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(name) = filename {
        let escaped: String = name
            .chars()
            .filter(|c| !c.is_control())
            .map(|c| if c == '"' { '\'' } else { c })
            .collect();
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", escaped)) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    (headers, blob.data).into_response()
}
