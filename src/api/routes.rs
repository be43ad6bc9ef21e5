use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::api::handlers;
use crate::AppState;

// Phone photos routinely exceed axum's 2MB default.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(vec![Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(vec![axum::http::header::CONTENT_TYPE, axum::http::header::ACCEPT]);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .route("/search", post(handlers::search).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)))
        .route("/library", get(handlers::library_status))
        .route("/library/reconcile", post(handlers::reconcile_library))
        .route("/library/records", delete(handlers::clear_records))
        .route("/library/records/:id", delete(handlers::invalidate_record))
        .layer(cors)
        .with_state(state)
}
