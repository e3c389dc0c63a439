// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kassabot Billing Module
//!
//! Usage metering and billing reconciliation for the assistant bot.
//!
//! ## Features
//!
//! - **Account Ledger**: balance, free-quota counters, subscription state
//! - **Quota Policy**: balance > subscription > free quota, in that order
//! - **Transactions**: pending purchases with sticky terminal states
//! - **T-Kassa Gateway**: signed Init/GetState calls
//! - **Reconciliation**: idempotent handling of gateway notifications
//! - **Invariants**: runnable consistency checks over money state

pub mod client;
pub mod error;
pub mod invariants;
pub mod ledger;
pub mod purchases;
pub mod quota;
pub mod store;
pub mod transactions;
pub mod webhooks;

// Client
pub use client::{generate_token, PaymentInit, TKassaClient, TKassaConfig};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{Account, LedgerService};

// Purchases
pub use purchases::{PurchaseService, PurchaseStart};

// Quota
pub use quota::{AccessPath, QuotaConfig, QuotaService, Verdict};

// Storage
pub use store::MemoryStore;

// Transactions
pub use transactions::{Transaction, TransactionService};

// Webhooks
pub use webhooks::{NotificationPayload, StatusAction, WebhookAck, WebhookHandler};

use sqlx::PgPool;

/// Billing-wide configuration: gateway credentials plus policy
/// constants, passed in explicitly rather than read from globals at
/// use sites.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub gateway: TKassaConfig,
    pub quota: QuotaConfig,
    /// Fixed rubles-to-tokens conversion rate for purchases.
    pub rub_to_tokens: f64,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let gateway = TKassaConfig::from_env()?;

        let free_requests_limit = std::env::var("FREE_REQUESTS_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(QuotaConfig::default().free_requests_limit);
        let rub_to_tokens = std::env::var("RUB_TO_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10.0);

        Ok(Self {
            gateway,
            quota: QuotaConfig {
                free_requests_limit,
                ..QuotaConfig::default()
            },
            rub_to_tokens,
        })
    }
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub ledger: LedgerService,
    pub quota: QuotaService,
    pub transactions: TransactionService,
    pub purchases: PurchaseService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Self::new(config, pool)
    }

    /// Create a new billing service with explicit config
    pub fn new(config: BillingConfig, pool: PgPool) -> BillingResult<Self> {
        let gateway = TKassaClient::new(config.gateway)?;
        let ledger = LedgerService::new(pool.clone(), config.quota.free_requests_limit);
        let transactions = TransactionService::new(pool);

        Ok(Self {
            ledger: ledger.clone(),
            quota: QuotaService::new(ledger.clone(), config.quota),
            transactions: transactions.clone(),
            purchases: PurchaseService::new(
                ledger,
                transactions.clone(),
                gateway,
                config.rub_to_tokens,
            ),
            webhooks: WebhookHandler::new(transactions),
        })
    }
}
