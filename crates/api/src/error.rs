//! API error mapping
//!
//! Billing errors never reach the client verbatim: storage and gateway
//! details are logged, the response body carries a generic retry-later
//! message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kassabot_billing::BillingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Billing(err) = self;

        let (status, message) = match &err {
            BillingError::Transport(_)
            | BillingError::Gateway { .. }
            | BillingError::GatewayResponse(_) => (
                StatusCode::BAD_GATEWAY,
                "Payment could not be started. Please try again later.",
            ),
            BillingError::Database(_) | BillingError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong. Please try again later.",
            ),
        };

        tracing::error!(error = %err, status = %status, "Request failed");
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
