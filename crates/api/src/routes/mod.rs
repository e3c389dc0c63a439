//! HTTP routes

pub mod admin;
pub mod metering;
pub mod purchases;
pub mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metering/authorize", post(metering::authorize))
        .route("/purchases", post(purchases::start_purchase))
        .route("/webhooks/tkassa", post(webhooks::tkassa_webhook))
        .route("/admin/invariants", get(admin::run_invariant_checks))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
