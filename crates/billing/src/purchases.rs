//! Purchase initiation
//!
//! Orchestrates a top-up: lazily materialize the account, create a
//! `pending` transaction, and start an external payment. On gateway
//! failure the pending row is deliberately left in place — it is never
//! retried automatically (duplicate external charges) and never
//! canceled automatically (the gateway may still deliver a late
//! confirmation for it).

use crate::client::{PaymentInit, TKassaClient};
use crate::error::BillingResult;
use crate::ledger::LedgerService;
use crate::transactions::{derive_order_id, Transaction, TransactionService};

/// Tokens granted for a ruble amount at the fixed configured rate.
pub fn tokens_for_amount(amount_rub: f64, rub_to_tokens: f64) -> f64 {
    amount_rub * rub_to_tokens
}

/// Gateway amounts are in minor currency units (kopecks).
pub fn amount_to_kopecks(amount_rub: f64) -> i64 {
    (amount_rub * 100.0).round() as i64
}

/// A started purchase: the local pending record plus where to send the
/// paying user.
#[derive(Debug, Clone)]
pub struct PurchaseStart {
    pub transaction: Transaction,
    pub redirect_url: String,
    pub payment_id: Option<String>,
}

#[derive(Clone)]
pub struct PurchaseService {
    ledger: LedgerService,
    transactions: TransactionService,
    gateway: TKassaClient,
    rub_to_tokens: f64,
}

impl PurchaseService {
    pub fn new(
        ledger: LedgerService,
        transactions: TransactionService,
        gateway: TKassaClient,
        rub_to_tokens: f64,
    ) -> Self {
        Self {
            ledger,
            transactions,
            gateway,
            rub_to_tokens,
        }
    }

    /// Start a purchase for `chat_id`.
    pub async fn start(
        &self,
        chat_id: i64,
        amount_rub: f64,
        method: &str,
    ) -> BillingResult<PurchaseStart> {
        let account = self.ledger.get_or_create(chat_id).await?;
        let credit_tokens = tokens_for_amount(amount_rub, self.rub_to_tokens);

        let txn = self
            .transactions
            .create(account.id, amount_rub, credit_tokens, method)
            .await?;
        let order_id = derive_order_id(txn.id);
        let description = format!("Balance top-up #{}", txn.id);

        let init: PaymentInit = match self
            .gateway
            .init_payment(
                amount_to_kopecks(amount_rub),
                &order_id,
                &description,
                &chat_id.to_string(),
            )
            .await
        {
            Ok(init) => init,
            Err(e) => {
                // The row stays pending: a late gateway confirmation
                // can still complete it, and retrying Init here could
                // charge the user twice.
                tracing::warn!(
                    txn_id = txn.id,
                    order_id = %order_id,
                    error = %e,
                    "Payment initiation failed, transaction left pending"
                );
                return Err(e);
            }
        };

        Ok(PurchaseStart {
            transaction: txn,
            redirect_url: init.payment_url,
            payment_id: init.payment_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_for_amount_fixed_rate() {
        assert_eq!(tokens_for_amount(100.0, 10.0), 1000.0);
        assert_eq!(tokens_for_amount(0.0, 10.0), 0.0);
    }

    #[test]
    fn test_amount_to_kopecks() {
        assert_eq!(amount_to_kopecks(100.0), 10_000);
        assert_eq!(amount_to_kopecks(99.99), 9_999);
        // Rounds instead of truncating: 0.1 is not exactly representable.
        assert_eq!(amount_to_kopecks(0.1), 10);
    }
}
