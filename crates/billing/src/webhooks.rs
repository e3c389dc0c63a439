//! Gateway reconciliation
//!
//! The only code path that accepts unauthenticated external input and
//! mutates money state. Notifications may arrive out of order, more
//! than once, or for orders we never created; every case must end in
//! an acknowledgement so the gateway stops retrying, and repeated
//! delivery must be a no-op.

use serde::{Deserialize, Serialize};

use crate::error::BillingResult;
use crate::transactions::TransactionService;

/// Local transition a gateway status maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Complete,
    Cancel,
    /// Not yet terminal (or unrecognized): log and wait for the next
    /// notification.
    Ignore,
}

/// Map an external payment status to a local terminal transition.
/// Completion additionally requires the gateway's success flag;
/// cancellation does not.
pub fn map_gateway_status(status: &str, success: bool) -> StatusAction {
    match status {
        "AUTHORIZED" | "CONFIRMED" | "COMPLETED" if success => StatusAction::Complete,
        "CANCELED" | "REJECTED" => StatusAction::Cancel,
        _ => StatusAction::Ignore,
    }
}

/// Inbound notification body. Fields beyond these three are ignored;
/// all three are optional so that a sparse payload is still routed to
/// the right rejection path instead of failing deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "OrderId")]
    pub order_id: Option<String>,
    #[serde(rename = "Status")]
    pub status: Option<String>,
    #[serde(rename = "Success", default)]
    pub success: bool,
}

/// Acknowledgement returned to the gateway. Served with HTTP 200 in
/// every handled case so a permanently-unknown order id does not cause
/// a retry storm.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookAck {
    pub fn accepted() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Reconciliation entry point invoked by the inbound webhook route.
#[derive(Clone)]
pub struct WebhookHandler {
    transactions: TransactionService,
}

impl WebhookHandler {
    pub fn new(transactions: TransactionService) -> Self {
        Self { transactions }
    }

    /// Look up the transaction by order id and apply the mapped
    /// transition. Only storage failures escape as errors; everything
    /// else is an acknowledgement.
    pub async fn handle_notification(
        &self,
        payload: NotificationPayload,
    ) -> BillingResult<WebhookAck> {
        let Some(order_id) = payload.order_id.as_deref() else {
            tracing::warn!("Gateway notification without OrderId");
            return Ok(WebhookAck::rejected("No OrderId"));
        };

        let Some(txn) = self.transactions.find_by_order_id(order_id).await? else {
            tracing::warn!(order_id = order_id, "Notification for unknown order");
            return Ok(WebhookAck::rejected("Transaction not found"));
        };

        let status = payload.status.as_deref().unwrap_or("");
        match map_gateway_status(status, payload.success) {
            StatusAction::Complete => self.transactions.complete(txn.id).await?,
            StatusAction::Cancel => {
                self.transactions
                    .cancel(txn.id, &format!("gateway status {status}"))
                    .await?
            }
            StatusAction::Ignore => {
                tracing::info!(
                    txn_id = txn.id,
                    order_id = order_id,
                    status = status,
                    "Non-terminal gateway status, no action"
                );
            }
        }

        Ok(WebhookAck::accepted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_statuses_complete() {
        for status in ["AUTHORIZED", "CONFIRMED", "COMPLETED"] {
            assert_eq!(map_gateway_status(status, true), StatusAction::Complete);
        }
    }

    #[test]
    fn test_completion_requires_success_flag() {
        assert_eq!(map_gateway_status("CONFIRMED", false), StatusAction::Ignore);
    }

    #[test]
    fn test_cancel_statuses_ignore_success_flag() {
        assert_eq!(map_gateway_status("CANCELED", false), StatusAction::Cancel);
        assert_eq!(map_gateway_status("REJECTED", true), StatusAction::Cancel);
    }

    #[test]
    fn test_unknown_status_is_ignored() {
        assert_eq!(map_gateway_status("NEW", true), StatusAction::Ignore);
        assert_eq!(map_gateway_status("", false), StatusAction::Ignore);
    }

    #[test]
    fn test_payload_with_all_fields() {
        let payload: NotificationPayload = serde_json::from_str(
            r#"{"OrderId": "order-7", "Status": "CONFIRMED", "Success": true, "Amount": 10000}"#,
        )
        .unwrap();
        assert_eq!(payload.order_id.as_deref(), Some("order-7"));
        assert_eq!(payload.status.as_deref(), Some("CONFIRMED"));
        assert!(payload.success);
    }

    #[test]
    fn test_sparse_payload_still_parses() {
        let payload: NotificationPayload = serde_json::from_str(r#"{"Status": "NEW"}"#).unwrap();
        assert!(payload.order_id.is_none());
        assert!(!payload.success);
    }

    #[tokio::test]
    async fn test_duplicate_notification_credits_once() {
        use crate::ledger::LedgerService;
        use crate::store::MemoryStore;
        use crate::transactions::{derive_order_id, STATUS_COMPLETED};

        let store = MemoryStore::shared();
        let ledger = LedgerService::new_in_memory(store.clone(), 50);
        let txns = TransactionService::new_in_memory(store);
        let handler = WebhookHandler::new(txns.clone());

        let account = ledger.get_or_create(42).await.unwrap();
        let txn = txns.create(account.id, 100.0, 1000.0, "T-Kassa").await.unwrap();

        let payload = NotificationPayload {
            order_id: Some(derive_order_id(txn.id)),
            status: Some("CONFIRMED".to_string()),
            success: true,
        };
        let first = handler.handle_notification(payload.clone()).await.unwrap();
        let second = handler.handle_notification(payload).await.unwrap();
        assert!(first.ok);
        assert!(second.ok);

        let account = ledger.find_by_id(account.id).await.unwrap();
        assert_eq!(account.balance_tokens, 1000.0);
        let txn = txns
            .find_by_order_id(&derive_order_id(txn.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(txn.status, STATUS_COMPLETED);
    }

    #[tokio::test]
    async fn test_unknown_order_is_acknowledged_without_effect() {
        use crate::store::MemoryStore;

        let handler = WebhookHandler::new(TransactionService::new_in_memory(MemoryStore::shared()));

        let ack = handler
            .handle_notification(NotificationPayload {
                order_id: Some("order-999".to_string()),
                status: Some("CONFIRMED".to_string()),
                success: true,
            })
            .await
            .unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.error.as_deref(), Some("Transaction not found"));
    }

    #[test]
    fn test_ack_serialization_omits_empty_error() {
        let ok = serde_json::to_value(WebhookAck::accepted()).unwrap();
        assert_eq!(ok, serde_json::json!({"ok": true}));

        let rejected = serde_json::to_value(WebhookAck::rejected("No OrderId")).unwrap();
        assert_eq!(
            rejected,
            serde_json::json!({"ok": false, "error": "No OrderId"})
        );
    }
}
