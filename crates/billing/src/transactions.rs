//! Transaction store
//!
//! Lifecycle management for purchase records. A transaction starts
//! `pending` and transitions to exactly one terminal status
//! (`completed` or `canceled`); terminal states are sticky. Completion
//! credits the owning account exactly once, no matter how many times
//! the reconciliation signal is delivered.

use std::sync::{Arc, Mutex};

use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::store::{lock, Backend, MemoryStore};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_CANCELED: &str = "canceled";

/// One purchase attempt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    /// Purchase amount in currency units (rubles).
    pub amount_rub: f64,
    /// Tokens granted to the account on completion.
    pub credit_tokens: f64,
    pub payment_method: String,
    pub status: String,
    /// Externally visible lookup key, `order-<id>`. The only key an
    /// untrusted gateway callback may use.
    pub order_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Derive the external order identifier from the internal row id.
pub fn derive_order_id(txn_id: i64) -> String {
    format!("order-{txn_id}")
}

const TRANSACTION_COLUMNS: &str = r#"
    id, user_id, amount_rub, credit_tokens, payment_method, status,
    order_id, created_at
"#;

#[derive(Clone)]
pub struct TransactionService {
    backend: Backend,
}

impl TransactionService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
        }
    }

    /// In-memory backend. Completion credits accounts in the same
    /// `store`, so pair it with a ledger built over that store.
    pub fn new_in_memory(store: Arc<Mutex<MemoryStore>>) -> Self {
        Self {
            backend: Backend::Memory(store),
        }
    }

    /// Insert a `pending` transaction and persist its derived order id
    /// onto the same row, as one database transaction.
    ///
    /// Amount sign is the caller's responsibility; this only fails on
    /// storage errors.
    pub async fn create(
        &self,
        user_id: i64,
        amount_rub: f64,
        credit_tokens: f64,
        method: &str,
    ) -> BillingResult<Transaction> {
        let txn = match &self.backend {
            Backend::Postgres(pool) => {
                let mut tx = pool.begin().await?;

                let (txn_id,): (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO transactions (user_id, amount_rub, credit_tokens, payment_method, status)
                    VALUES ($1, $2, $3, $4, 'pending')
                    RETURNING id
                    "#,
                )
                .bind(user_id)
                .bind(amount_rub)
                .bind(credit_tokens)
                .bind(method)
                .fetch_one(&mut *tx)
                .await?;

                let txn = sqlx::query_as::<_, Transaction>(&format!(
                    r#"
                    UPDATE transactions
                    SET order_id = $2
                    WHERE id = $1
                    RETURNING {TRANSACTION_COLUMNS}
                    "#
                ))
                .bind(txn_id)
                .bind(derive_order_id(txn_id))
                .fetch_one(&mut *tx)
                .await?;

                tx.commit().await?;
                txn
            }
            Backend::Memory(store) => {
                let mut store = lock(store);
                store.next_txn_id += 1;
                let txn = Transaction {
                    id: store.next_txn_id,
                    user_id,
                    amount_rub,
                    credit_tokens,
                    payment_method: method.to_string(),
                    status: STATUS_PENDING.to_string(),
                    order_id: Some(derive_order_id(store.next_txn_id)),
                    created_at: OffsetDateTime::now_utc(),
                };
                store.transactions.insert(txn.id, txn.clone());
                txn
            }
        };

        tracing::info!(
            txn_id = txn.id,
            user_id = user_id,
            amount_rub = amount_rub,
            credit_tokens = credit_tokens,
            method = method,
            "Created pending transaction"
        );
        Ok(txn)
    }

    pub async fn find_by_order_id(&self, order_id: &str) -> BillingResult<Option<Transaction>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let txn = sqlx::query_as::<_, Transaction>(&format!(
                    r#"
                    SELECT {TRANSACTION_COLUMNS}
                    FROM transactions
                    WHERE order_id = $1
                    "#
                ))
                .bind(order_id)
                .fetch_optional(pool)
                .await?;

                Ok(txn)
            }
            Backend::Memory(store) => {
                let store = lock(store);
                Ok(store
                    .transactions
                    .values()
                    .find(|t| t.order_id.as_deref() == Some(order_id))
                    .cloned())
            }
        }
    }

    /// Mark a transaction completed and credit the owning account, as
    /// one atomic unit of work.
    ///
    /// The conditional `status = 'pending'` flip is a compare-and-set:
    /// of two concurrent reconciliation callbacks for the same order,
    /// only one sees the row flip and performs the credit. Unknown ids
    /// and already-terminal rows are a logged no-op, never an error —
    /// gateway retries must be safe.
    pub async fn complete(&self, txn_id: i64) -> BillingResult<()> {
        let flipped = match &self.backend {
            Backend::Postgres(pool) => {
                let mut tx = pool.begin().await?;

                let flipped: Option<(i64, f64)> = sqlx::query_as(
                    r#"
                    UPDATE transactions
                    SET status = 'completed'
                    WHERE id = $1 AND status = 'pending'
                    RETURNING user_id, credit_tokens
                    "#,
                )
                .bind(txn_id)
                .fetch_optional(&mut *tx)
                .await?;

                match flipped {
                    Some((user_id, credit_tokens)) => {
                        sqlx::query(
                            r#"
                            UPDATE users
                            SET balance_tokens = balance_tokens + $2
                            WHERE id = $1
                            "#,
                        )
                        .bind(user_id)
                        .bind(credit_tokens)
                        .execute(&mut *tx)
                        .await?;
                        tx.commit().await?;
                        Some((user_id, credit_tokens))
                    }
                    None => {
                        tx.rollback().await?;
                        None
                    }
                }
            }
            Backend::Memory(store) => {
                let mut store = lock(store);
                let flipped = match store.transactions.get_mut(&txn_id) {
                    Some(txn) if txn.status == STATUS_PENDING => {
                        txn.status = STATUS_COMPLETED.to_string();
                        Some((txn.user_id, txn.credit_tokens))
                    }
                    _ => None,
                };
                if let Some((user_id, credit_tokens)) = flipped {
                    if let Some(account) = store.accounts.get_mut(&user_id) {
                        account.balance_tokens += credit_tokens;
                    }
                }
                flipped
            }
        };

        match flipped {
            Some((user_id, credit_tokens)) => {
                tracing::info!(
                    txn_id = txn_id,
                    user_id = user_id,
                    credit_tokens = credit_tokens,
                    "Transaction completed, account credited"
                );
            }
            None => {
                tracing::info!(
                    txn_id = txn_id,
                    "Complete skipped: transaction unknown or already terminal"
                );
            }
        }

        Ok(())
    }

    /// Mark a transaction canceled. No ledger effect. No-op when the
    /// id is unknown or the row is already terminal.
    pub async fn cancel(&self, txn_id: i64, reason: &str) -> BillingResult<()> {
        let flipped = match &self.backend {
            Backend::Postgres(pool) => {
                let flipped: Option<(i64,)> = sqlx::query_as(
                    r#"
                    UPDATE transactions
                    SET status = 'canceled'
                    WHERE id = $1 AND status = 'pending'
                    RETURNING user_id
                    "#,
                )
                .bind(txn_id)
                .fetch_optional(pool)
                .await?;

                flipped.map(|(user_id,)| user_id)
            }
            Backend::Memory(store) => {
                let mut store = lock(store);
                match store.transactions.get_mut(&txn_id) {
                    Some(txn) if txn.status == STATUS_PENDING => {
                        txn.status = STATUS_CANCELED.to_string();
                        Some(txn.user_id)
                    }
                    _ => None,
                }
            }
        };

        match flipped {
            Some(user_id) => {
                tracing::info!(
                    txn_id = txn_id,
                    user_id = user_id,
                    reason = reason,
                    "Transaction canceled"
                );
            }
            None => {
                tracing::info!(
                    txn_id = txn_id,
                    reason = reason,
                    "Cancel skipped: transaction unknown or already terminal"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerService;

    fn services() -> (LedgerService, TransactionService) {
        let store = MemoryStore::shared();
        (
            LedgerService::new_in_memory(store.clone(), 50),
            TransactionService::new_in_memory(store),
        )
    }

    #[test]
    fn test_derive_order_id() {
        assert_eq!(derive_order_id(1), "order-1");
        assert_eq!(derive_order_id(98765), "order-98765");
    }

    #[test]
    fn test_status_set_is_closed() {
        // The reconciliation handler and invariant checks rely on this
        // exact status vocabulary.
        assert_eq!(STATUS_PENDING, "pending");
        assert_eq!(STATUS_COMPLETED, "completed");
        assert_eq!(STATUS_CANCELED, "canceled");
    }

    #[tokio::test]
    async fn test_create_persists_derived_order_id() {
        let (ledger, txns) = services();
        let account = ledger.get_or_create(42).await.unwrap();

        let txn = txns.create(account.id, 100.0, 1000.0, "T-Kassa").await.unwrap();
        assert_eq!(txn.status, STATUS_PENDING);
        assert_eq!(txn.order_id.as_deref(), Some(derive_order_id(txn.id).as_str()));

        let found = txns
            .find_by_order_id(&derive_order_id(txn.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, txn.id);
    }

    #[tokio::test]
    async fn test_complete_twice_credits_once() {
        let (ledger, txns) = services();
        let account = ledger.get_or_create(42).await.unwrap();
        let txn = txns.create(account.id, 100.0, 1000.0, "T-Kassa").await.unwrap();

        txns.complete(txn.id).await.unwrap();
        txns.complete(txn.id).await.unwrap();

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
    async fn test_complete_after_cancel_is_noop() {
        let (ledger, txns) = services();
        let account = ledger.get_or_create(42).await.unwrap();
        let txn = txns.create(account.id, 100.0, 1000.0, "T-Kassa").await.unwrap();

        txns.cancel(txn.id, "payment declined").await.unwrap();
        txns.complete(txn.id).await.unwrap();

        let account = ledger.find_by_id(account.id).await.unwrap();
        assert_eq!(account.balance_tokens, 0.0);
        let txn = txns
            .find_by_order_id(&derive_order_id(txn.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(txn.status, STATUS_CANCELED);
    }

    #[tokio::test]
    async fn test_cancel_after_complete_keeps_credit() {
        let (ledger, txns) = services();
        let account = ledger.get_or_create(42).await.unwrap();
        let txn = txns.create(account.id, 100.0, 1000.0, "T-Kassa").await.unwrap();

        txns.complete(txn.id).await.unwrap();
        txns.cancel(txn.id, "late cancellation").await.unwrap();

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
    async fn test_resolving_unknown_id_is_noop() {
        let (_, txns) = services();
        txns.complete(999).await.unwrap();
        txns.cancel(999, "gateway status CANCELED").await.unwrap();
    }
}
