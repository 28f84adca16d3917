pub mod handlers;
pub mod publish;

use axum::Router;
use axum::routing::{delete, get, post};

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/provider", get(handlers::provider))
        .route("/sandbox", post(handlers::create_sandbox))
        .route("/sandbox/info", get(handlers::sandbox_info))
        .route("/sandbox/tracked", get(handlers::sandbox_tracked))
        .route("/sandbox/{id}", delete(handlers::delete_sandbox))
        .route("/sandbox/{id}/timeout", post(handlers::set_timeout))
}
