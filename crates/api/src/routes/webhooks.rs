//! Gateway reconciliation webhook
//!
//! Returns HTTP 200 with `{"ok": ...}` in every handled case —
//! including unknown order ids — so the gateway does not retry
//! indefinitely. Only malformed JSON is rejected outright (by the
//! extractor), and only storage failures become a 5xx, which the
//! gateway may safely retry because every transition is idempotent.

use axum::extract::State;
use axum::Json;
use kassabot_billing::{NotificationPayload, WebhookAck};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn tkassa_webhook(
    State(state): State<AppState>,
    Json(payload): Json<NotificationPayload>,
) -> Result<Json<WebhookAck>, ApiError> {
    tracing::info!(
        order_id = ?payload.order_id,
        status = ?payload.status,
        success = payload.success,
        "Gateway notification received"
    );

    let ack = state.billing.webhooks.handle_notification(payload).await?;
    Ok(Json(ack))
}
