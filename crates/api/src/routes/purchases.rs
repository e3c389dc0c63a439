//! Purchase initiation
//!
//! Creates a pending transaction and starts an external payment. On
//! gateway failure the client gets a generic retry-later message and
//! no duplicate transaction is created on retry — each attempt is its
//! own order.

use axum::extract::State;
use axum::Json;
use kassabot_billing::transactions::derive_order_id;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

fn default_method() -> String {
    "T-Kassa".to_string()
}

#[derive(Debug, Deserialize)]
pub struct StartPurchaseRequest {
    pub chat_id: i64,
    pub amount_rub: f64,
    #[serde(default = "default_method")]
    pub method: String,
}

#[derive(Debug, Serialize)]
pub struct StartPurchaseResponse {
    pub order_id: String,
    pub redirect_url: String,
    pub credit_tokens: f64,
}

pub async fn start_purchase(
    State(state): State<AppState>,
    Json(req): Json<StartPurchaseRequest>,
) -> Result<Json<StartPurchaseResponse>, ApiError> {
    let started = state
        .billing
        .purchases
        .start(req.chat_id, req.amount_rub, &req.method)
        .await?;

    Ok(Json(StartPurchaseResponse {
        order_id: derive_order_id(started.transaction.id),
        redirect_url: started.redirect_url,
        credit_tokens: started.transaction.credit_tokens,
    }))
}
