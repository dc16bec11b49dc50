//! HTTP surface of the mailbox service
//!
//! Handlers are thin: parse parameters, run the synchronous service on
//! tokio's blocking pool, serialize the result.

mod attachments;
mod drafts;
mod error;
mod mail;
mod params;
mod settings;

pub use error::ApiError;
pub use params::Scope;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use log::info;
use tokio::net::TcpListener;

use crate::service::MailboxService;

/// Room for multipart boundaries and part headers around the file itself
pub(crate) const MULTIPART_OVERHEAD: u64 = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    service: Arc<MailboxService>,
}

impl AppState {
    /// Run a service call on the blocking pool
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&MailboxService) -> crate::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || f(&service))
            .await
            .map_err(|e| ApiError::internal(format!("Worker task failed: {}", e)))?
            .map_err(ApiError::from)
    }

    pub(crate) fn service(&self) -> &MailboxService {
        &self.service
    }
}

/// Build the router with every route
pub fn router(service: Arc<MailboxService>) -> Router {
    let upload_limit = (service.attachments().max_upload_bytes() + MULTIPART_OVERHEAD) as usize;
    let state = AppState { service };

    let uploads = Router::new()
        .route("/attachments/upload", post(attachments::upload))
        .route(
            "/blobs/{*key}",
            get(attachments::get_blob).put(attachments::put_blob),
        )
        .layer(DefaultBodyLimit::max(upload_limit));

    Router::new()
        .route("/health", get(mail::health))
        .route("/inbox", get(mail::inbox))
        .route("/search", get(mail::search))
        .route("/emails/{id}", get(mail::get_email))
        .route("/emails/{id}/star", post(mail::toggle_star))
        .route("/emails/{id}/important", post(mail::toggle_important))
        .route("/compose", post(mail::compose))
        .route("/batch", post(mail::batch))
        .route("/threads", get(mail::list_threads))
        .route("/threads/{id}", get(mail::get_thread))
        .route("/unfiled-sends", get(mail::list_unfiled_sends))
        .route("/unfiled-sends/{id}/refile", post(mail::refile_unfiled_send))
        .route("/drafts", get(drafts::list).post(drafts::create))
        .route(
            "/drafts/{id}",
            get(drafts::get).put(drafts::save).delete(drafts::delete),
        )
        .route("/drafts/{id}/send", post(drafts::send))
        .route("/attachments/upload-url", get(attachments::upload_url))
        .route(
            "/attachments/{id}",
            get(attachments::get).delete(attachments::delete),
        )
        .route("/attachments/{id}/download", get(attachments::download))
        .route("/attachments/{id}/download-url", get(attachments::download_url))
        .route("/labels", get(settings::list_labels).post(settings::create_label))
        .route(
            "/labels/{id}",
            put(settings::update_label).delete(settings::delete_label),
        )
        .route(
            "/signatures",
            get(settings::list_signatures).post(settings::create_signature),
        )
        .route(
            "/signatures/{id}",
            get(settings::get_signature)
                .put(settings::update_signature)
                .delete(settings::delete_signature),
        )
        .route("/signatures/{id}/default", post(settings::set_default_signature))
        .merge(uploads)
        .fallback(mail::not_found)
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    service: Arc<MailboxService>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("[API] Listening on http://{}", addr);
    }
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("[API] Server stopped");
    Ok(())
}
