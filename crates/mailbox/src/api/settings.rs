//! Label and signature endpoints

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;

use super::params::{Scope, parse_id};
use super::{ApiError, AppState};
use crate::models::{Label, LabelFields, LabelId, Signature, SignatureFields, SignatureId};

// === Labels ===

pub async fn list_labels(
    State(state): State<AppState>,
    Scope(scope): Scope,
) -> Result<Json<Vec<Label>>, ApiError> {
    Ok(Json(state.run(move |svc| svc.list_labels(scope)).await?))
}

pub async fn create_label(
    State(state): State<AppState>,
    Scope(scope): Scope,
    body: Result<Json<LabelFields>, JsonRejection>,
) -> Result<(StatusCode, Json<Label>), ApiError> {
    let Json(fields) = body?;
    let label = state
        .run(move |svc| svc.create_label(scope, &fields))
        .await?;
    Ok((StatusCode::CREATED, Json(label)))
}

pub async fn update_label(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
    body: Result<Json<LabelFields>, JsonRejection>,
) -> Result<Json<Label>, ApiError> {
    let id: LabelId = parse_id("id", &id)?;
    let Json(fields) = body?;
    Ok(Json(
        state
            .run(move |svc| svc.update_label(scope, id, &fields))
            .await?,
    ))
}

pub async fn delete_label(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id: LabelId = parse_id("id", &id)?;
    state.run(move |svc| svc.delete_label(scope, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Signatures ===

pub async fn list_signatures(
    State(state): State<AppState>,
    Scope(scope): Scope,
) -> Result<Json<Vec<Signature>>, ApiError> {
    Ok(Json(state.run(move |svc| svc.list_signatures(scope)).await?))
}

pub async fn get_signature(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Json<Signature>, ApiError> {
    let id: SignatureId = parse_id("id", &id)?;
    Ok(Json(state.run(move |svc| svc.get_signature(scope, id)).await?))
}

pub async fn create_signature(
    State(state): State<AppState>,
    Scope(scope): Scope,
    body: Result<Json<SignatureFields>, JsonRejection>,
) -> Result<(StatusCode, Json<Signature>), ApiError> {
    let Json(fields) = body?;
    let signature = state
        .run(move |svc| svc.create_signature(scope, &fields))
        .await?;
    Ok((StatusCode::CREATED, Json(signature)))
}

pub async fn update_signature(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
    body: Result<Json<SignatureFields>, JsonRejection>,
) -> Result<Json<Signature>, ApiError> {
    let id: SignatureId = parse_id("id", &id)?;
    let Json(fields) = body?;
    Ok(Json(
        state
            .run(move |svc| svc.update_signature(scope, id, &fields))
            .await?,
    ))
}

pub async fn delete_signature(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id: SignatureId = parse_id("id", &id)?;
    state.run(move |svc| svc.delete_signature(scope, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Make a signature the default, clearing every other default of the user
pub async fn set_default_signature(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Json<Signature>, ApiError> {
    let id: SignatureId = parse_id("id", &id)?;
    Ok(Json(
        state
            .run(move |svc| svc.set_default_signature(scope, id))
            .await?,
    ))
}
