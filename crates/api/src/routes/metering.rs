//! Metered-action gate
//!
//! The bot front-end calls this before forwarding a user message to
//! the model proxy. An allowed verdict has already consumed its paired
//! resource (balance debit or free-counter increment) by the time the
//! response is sent; a denial is a normal outcome, not an error.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub chat_id: i64,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub allowed: bool,
    /// Which resource paid for the action: "balance", "subscription",
    /// or "free_quota". Absent when denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<&'static str>,
    pub balance_tokens: f64,
    pub free_requests_used: i32,
    pub free_requests_limit: i32,
    /// Instructive denial message for the end user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn authorize(
    State(state): State<AppState>,
    Json(req): Json<AuthorizeRequest>,
) -> Result<Json<AuthorizeResponse>, ApiError> {
    let now = OffsetDateTime::now_utc();
    let (account, verdict) = state
        .billing
        .quota
        .authorize_and_consume(req.chat_id, now)
        .await?;

    let response = match verdict {
        kassabot_billing::Verdict::Allowed { via } => AuthorizeResponse {
            allowed: true,
            via: Some(via.as_str()),
            balance_tokens: account.balance_tokens,
            free_requests_used: account.free_requests_used,
            free_requests_limit: account.free_requests_limit,
            message: None,
        },
        kassabot_billing::Verdict::Denied => AuthorizeResponse {
            allowed: false,
            via: None,
            balance_tokens: account.balance_tokens,
            free_requests_used: account.free_requests_used,
            free_requests_limit: account.free_requests_limit,
            message: Some(
                "Your free limit for this month is exhausted. Top up your balance to continue."
                    .to_string(),
            ),
        },
    };

    Ok(Json(response))
}
