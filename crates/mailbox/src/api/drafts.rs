//! Draft endpoints

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;

use super::params::{PageParams, Scope, parse_id};
use super::{ApiError, AppState};
use crate::models::{Draft, DraftFields, DraftId, Email, Page};

pub async fn list(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Query(params): Query<PageParams>,
) -> Result<Json<Page<Draft>>, ApiError> {
    let (limit, offset) = params.parse()?;
    Ok(Json(
        state
            .run(move |svc| svc.drafts().list(scope, limit, offset))
            .await?,
    ))
}

pub async fn create(
    State(state): State<AppState>,
    Scope(scope): Scope,
    body: Result<Json<DraftFields>, JsonRejection>,
) -> Result<(StatusCode, Json<Draft>), ApiError> {
    let Json(fields) = body?;
    let draft = state
        .run(move |svc| svc.drafts().create(scope, &fields))
        .await?;
    Ok((StatusCode::CREATED, Json(draft)))
}

pub async fn get(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Json<Draft>, ApiError> {
    let id: DraftId = parse_id("id", &id)?;
    Ok(Json(state.run(move |svc| svc.drafts().get(scope, id)).await?))
}

/// `PUT /drafts/{id}`: full replacement, creating the draft when absent
pub async fn save(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
    body: Result<Json<DraftFields>, JsonRejection>,
) -> Result<Json<Draft>, ApiError> {
    let id: DraftId = parse_id("id", &id)?;
    let Json(fields) = body?;
    Ok(Json(
        state
            .run(move |svc| svc.drafts().save(scope, id, &fields))
            .await?,
    ))
}

pub async fn delete(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id: DraftId = parse_id("id", &id)?;
    state.run(move |svc| svc.drafts().delete(scope, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn send(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Json<Email>, ApiError> {
    let id: DraftId = parse_id("id", &id)?;
    Ok(Json(state.run(move |svc| svc.drafts().send(scope, id)).await?))
}
