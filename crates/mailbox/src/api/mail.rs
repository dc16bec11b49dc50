//! Email, thread, search and batch endpoints

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::params::{
    InboxParams, PageParams, Scope, ThreadParams, from_json, parse_id, parse_ids,
};
use super::{ApiError, AppState};
use crate::actions::{BatchAction, BatchOutcome};
use crate::models::{
    Draft, DraftFields, Email, EmailId, Folder, Page, ThreadId, UnfiledSend, UnfiledSendId,
};
use crate::query::{EmailDetail, ThreadDetail, ThreadSummary};
use crate::search::SearchResult;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn not_found() -> ApiError {
    ApiError::not_found("No such endpoint")
}

pub async fn inbox(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Query(params): Query<InboxParams>,
) -> Result<Json<Page<Email>>, ApiError> {
    let filter = params.into_filter()?;
    let page = state.run(move |svc| svc.list_emails(scope, &filter)).await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(flatten)]
    page: PageParams,
}

pub async fn search(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Query(params): Query<SearchParams>,
) -> Result<Json<Page<SearchResult>>, ApiError> {
    let (limit, offset) = params.page.parse()?;
    let q = params.q;
    let page = state
        .run(move |svc| svc.search(scope, &q, limit, offset))
        .await?;
    Ok(Json(page))
}

pub async fn get_email(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Json<EmailDetail>, ApiError> {
    let id: EmailId = parse_id("id", &id)?;
    Ok(Json(state.run(move |svc| svc.get_email(scope, id)).await?))
}

pub async fn toggle_star(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Json<Email>, ApiError> {
    let id: EmailId = parse_id("id", &id)?;
    let email = state
        .run(move |svc| svc.actions().toggle_star(scope, id))
        .await?;
    Ok(Json(email))
}

pub async fn toggle_important(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Json<Email>, ApiError> {
    let id: EmailId = parse_id("id", &id)?;
    let email = state
        .run(move |svc| svc.actions().toggle_important(scope, id))
        .await?;
    Ok(Json(email))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ComposeResponse {
    Sent { email: Email },
    Draft { draft: Draft },
}

pub async fn compose(
    State(state): State<AppState>,
    Scope(scope): Scope,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ComposeResponse>), ApiError> {
    let Json(body) = body?;
    // Draft fields plus a `send` flag; send now instead of saving a draft
    let send = match body.get("send") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(send)) => *send,
        Some(_) => return Err(ApiError::invalid_field("send", "must be a boolean")),
    };
    // Read separately from `send` so type errors keep their field path
    let fields: DraftFields = from_json(body)?;

    let response = state
        .run(move |svc| {
            if send {
                svc.drafts()
                    .compose_and_send(scope, &fields)
                    .map(|email| ComposeResponse::Sent { email })
            } else {
                svc.drafts()
                    .create(scope, &fields)
                    .map(|draft| ComposeResponse::Draft { draft })
            }
        })
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Body of `POST /batch`
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    action: String,
    #[serde(default)]
    email_ids: Vec<String>,
    /// Target of `move`
    #[serde(default)]
    folder: Option<String>,
    /// Names for `add_labels` / `remove_labels`
    #[serde(default)]
    labels: Vec<String>,
}

pub async fn batch(
    State(state): State<AppState>,
    Scope(scope): Scope,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<BatchOutcome>, ApiError> {
    let Json(request) = body?;
    let ids: Vec<EmailId> = parse_ids("email_ids", &request.email_ids)?;
    let folder = request
        .folder
        .as_deref()
        .map(str::parse::<Folder>)
        .transpose()
        .map_err(|e| ApiError::invalid_field("folder", e))?;
    let action = BatchAction::parse(request.action.trim(), folder, request.labels)?;

    let outcome = state
        .run(move |svc| svc.actions().batch(scope, &ids, &action))
        .await?;
    Ok(Json(outcome))
}

pub async fn list_threads(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Query(params): Query<ThreadParams>,
) -> Result<Json<Page<ThreadSummary>>, ApiError> {
    let filter = params.into_filter()?;
    Ok(Json(
        state.run(move |svc| svc.list_threads(scope, &filter)).await?,
    ))
}

pub async fn get_thread(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Json<ThreadDetail>, ApiError> {
    let id: ThreadId = parse_id("id", &id)?;
    Ok(Json(state.run(move |svc| svc.get_thread(scope, id)).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct UnfiledParams {
    #[serde(default)]
    include_resolved: Option<String>,
}

pub async fn list_unfiled_sends(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Query(params): Query<UnfiledParams>,
) -> Result<Json<Vec<UnfiledSend>>, ApiError> {
    let include_resolved = params
        .include_resolved
        .as_deref()
        .is_some_and(|v| v == "true" || v == "1");
    Ok(Json(
        state
            .run(move |svc| svc.list_unfiled_sends(scope, include_resolved))
            .await?,
    ))
}

pub async fn refile_unfiled_send(
    State(state): State<AppState>,
    Scope(scope): Scope,
    Path(id): Path<String>,
) -> Result<Json<Email>, ApiError> {
    let id: UnfiledSendId = parse_id("id", &id)?;
    Ok(Json(
        state
            .run(move |svc| svc.refile_unfiled_send(scope, id))
            .await?,
    ))
}

