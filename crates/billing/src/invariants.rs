//! Billing invariants
//!
//! Runnable consistency checks over accounts and transactions. They
//! can be run after any mutation or webhook burst to verify the system
//! is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Account(s) affected
    pub user_ids: Vec<i64>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - money state may be wrong
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    user_id: i64,
    chat_id: i64,
    balance_tokens: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct UnknownStatusRow {
    txn_id: i64,
    user_id: i64,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingOrderIdRow {
    txn_id: i64,
    user_id: i64,
    status: String,
    payment_method: String,
}

/// Telegram-method purchases settle in-app and never receive a gateway
/// order id; only gateway transactions must carry one.
fn requires_order_id(payment_method: &str) -> bool {
    payment_method != "Telegram"
}

#[derive(Debug, sqlx::FromRow)]
struct FreeOverLimitRow {
    user_id: i64,
    free_requests_used: i32,
    free_requests_limit: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePendingRow {
    txn_id: i64,
    user_id: i64,
    created_at: OffsetDateTime,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_non_negative_balance().await?);
        violations.extend(self.check_known_transaction_status().await?);
        violations.extend(self.check_resolved_has_order_id().await?);
        violations.extend(self.check_free_used_within_limit().await?);
        violations.extend(self.check_stale_pending_transactions().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: balances are never negative
    ///
    /// The debit operation clamps at zero and the schema carries a
    /// CHECK constraint; a violation here means a write bypassed the
    /// ledger.
    async fn check_non_negative_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            r#"
            SELECT id as user_id, chat_id, balance_tokens
            FROM users
            WHERE balance_tokens < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_balance".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Account for chat {} has negative balance {}",
                    row.chat_id, row.balance_tokens
                ),
                context: serde_json::json!({
                    "chat_id": row.chat_id,
                    "balance_tokens": row.balance_tokens,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: transaction statuses stay within the closed set
    ///
    /// Reconciliation only understands pending/completed/canceled; any
    /// other value means a write bypassed the transaction store.
    async fn check_known_transaction_status(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnknownStatusRow> = sqlx::query_as(
            r#"
            SELECT id as txn_id, user_id, status
            FROM transactions
            WHERE status NOT IN ('pending', 'completed', 'canceled')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "known_transaction_status".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Transaction {} has unknown status '{}'",
                    row.txn_id, row.status
                ),
                context: serde_json::json!({
                    "transaction_id": row.txn_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: resolved gateway transactions carry an order id
    ///
    /// A terminal gateway transaction without an order id could never
    /// have been matched by a reconciliation callback. Telegram-method
    /// rows are exempt.
    async fn check_resolved_has_order_id(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingOrderIdRow> = sqlx::query_as(
            r#"
            SELECT id as txn_id, user_id, status, payment_method
            FROM transactions
            WHERE status <> 'pending'
              AND order_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|row| requires_order_id(&row.payment_method))
            .map(|row| InvariantViolation {
                invariant: "resolved_has_order_id".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Transaction {} is '{}' but has no order id",
                    row.txn_id, row.status
                ),
                context: serde_json::json!({
                    "transaction_id": row.txn_id,
                    "status": row.status,
                    "payment_method": row.payment_method,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: free usage within the limit
    ///
    /// Not storage-enforced; the quota policy enforces it at decision
    /// time, so an overshoot is informational.
    async fn check_free_used_within_limit(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FreeOverLimitRow> = sqlx::query_as(
            r#"
            SELECT id as user_id, free_requests_used, free_requests_limit
            FROM users
            WHERE free_requests_used > free_requests_limit
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_used_within_limit".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Account has used {} of {} free requests",
                    row.free_requests_used, row.free_requests_limit
                ),
                context: serde_json::json!({
                    "free_requests_used": row.free_requests_used,
                    "free_requests_limit": row.free_requests_limit,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Invariant 5: stale pending transactions
    ///
    /// Orphaned pendings are accepted by design (a timed-out Init is
    /// never retried), so this is informational only.
    async fn check_stale_pending_transactions(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StalePendingRow> = sqlx::query_as(
            r#"
            SELECT id as txn_id, user_id, created_at
            FROM transactions
            WHERE status = 'pending'
              AND created_at < NOW() - INTERVAL '7 days'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_pending_transactions".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Transaction {} has been pending since {}",
                    row.txn_id, row.created_at
                ),
                context: serde_json::json!({
                    "transaction_id": row.txn_id,
                    "created_at": row.created_at.to_string(),
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "non_negative_balance" => self.check_non_negative_balance().await,
            "known_transaction_status" => self.check_known_transaction_status().await,
            "resolved_has_order_id" => self.check_resolved_has_order_id().await,
            "free_used_within_limit" => self.check_free_used_within_limit().await,
            "stale_pending_transactions" => self.check_stale_pending_transactions().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "non_negative_balance",
            "known_transaction_status",
            "resolved_has_order_id",
            "free_used_within_limit",
            "stale_pending_transactions",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_order_id_required_for_gateway_methods_only() {
        assert!(requires_order_id("T-Kassa"));
        assert!(!requires_order_id("Telegram"));
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"non_negative_balance"));
        assert!(checks.contains(&"stale_pending_transactions"));
    }
}
