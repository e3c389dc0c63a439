//! Account ledger
//!
//! Single source of truth for spendable balance, free-quota counters,
//! and subscription state. Accounts are created lazily on first contact
//! and never deleted. All balance and counter writes go through this
//! service; no other component touches the `users` table directly.

use std::sync::{Arc, Mutex};

use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::store::{lock, Backend, MemoryStore};

/// One billing account, keyed by the external chat identifier.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub chat_id: i64,
    /// Prepaid spendable amount in internal token units. Never negative.
    pub balance_tokens: f64,
    pub free_requests_used: i32,
    pub free_requests_limit: i32,
    /// Start of the current free-quota window (calendar month
    /// granularity). Unset until the first free-path evaluation.
    pub free_period_start: Option<OffsetDateTime>,
    pub subscription_status: bool,
    /// Absent means unlimited while the subscription is active.
    pub subscription_expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// True when the stored free-period start is unset or belongs to a
/// different (year, month) than `now`. This is the sole rollover
/// trigger; there is no scheduled job.
pub fn is_new_period(period_start: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    match period_start {
        None => true,
        Some(start) => (start.year(), start.month()) != (now.year(), now.month()),
    }
}

const ACCOUNT_COLUMNS: &str = r#"
    id, chat_id, balance_tokens, free_requests_used, free_requests_limit,
    free_period_start, subscription_status, subscription_expires_at, created_at
"#;

/// Ledger operations over the `users` table.
#[derive(Clone)]
pub struct LedgerService {
    backend: Backend,
    free_limit_default: i32,
}

impl LedgerService {
    pub fn new(pool: PgPool, free_limit_default: i32) -> Self {
        Self {
            backend: Backend::Postgres(pool),
            free_limit_default,
        }
    }

    /// In-memory backend. Services built over the same `store` see each
    /// other's writes.
    pub fn new_in_memory(store: Arc<Mutex<MemoryStore>>, free_limit_default: i32) -> Self {
        Self {
            backend: Backend::Memory(store),
            free_limit_default,
        }
    }

    /// Return the existing account for `chat_id` or create a fresh one
    /// with zero balance, zero free usage, and no subscription.
    ///
    /// The no-op `DO UPDATE` makes the statement return the row in both
    /// the insert and the conflict case.
    pub async fn get_or_create(&self, chat_id: i64) -> BillingResult<Account> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let account = sqlx::query_as::<_, Account>(&format!(
                    r#"
                    INSERT INTO users (chat_id, free_requests_limit)
                    VALUES ($1, $2)
                    ON CONFLICT (chat_id) DO UPDATE SET chat_id = EXCLUDED.chat_id
                    RETURNING {ACCOUNT_COLUMNS}
                    "#
                ))
                .bind(chat_id)
                .bind(self.free_limit_default)
                .fetch_one(pool)
                .await?;

                Ok(account)
            }
            Backend::Memory(store) => {
                let mut store = lock(store);
                if let Some(account) = store.accounts.values().find(|a| a.chat_id == chat_id) {
                    return Ok(account.clone());
                }

                store.next_account_id += 1;
                let account = Account {
                    id: store.next_account_id,
                    chat_id,
                    balance_tokens: 0.0,
                    free_requests_used: 0,
                    free_requests_limit: self.free_limit_default,
                    free_period_start: None,
                    subscription_status: false,
                    subscription_expires_at: None,
                    created_at: OffsetDateTime::now_utc(),
                };
                store.accounts.insert(account.id, account.clone());
                Ok(account)
            }
        }
    }

    pub async fn find_by_id(&self, user_id: i64) -> BillingResult<Account> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let account = sqlx::query_as::<_, Account>(&format!(
                    r#"
                    SELECT {ACCOUNT_COLUMNS}
                    FROM users
                    WHERE id = $1
                    "#
                ))
                .bind(user_id)
                .fetch_one(pool)
                .await?;

                Ok(account)
            }
            Backend::Memory(store) => {
                let store = lock(store);
                let account = store
                    .accounts
                    .get(&user_id)
                    .cloned()
                    .ok_or(sqlx::Error::RowNotFound)?;
                Ok(account)
            }
        }
    }

    /// Increase the balance by `tokens`.
    pub async fn credit(&self, user_id: i64, tokens: f64) -> BillingResult<Account> {
        let account = match &self.backend {
            Backend::Postgres(pool) => {
                sqlx::query_as::<_, Account>(&format!(
                    r#"
                    UPDATE users
                    SET balance_tokens = balance_tokens + $2
                    WHERE id = $1
                    RETURNING {ACCOUNT_COLUMNS}
                    "#
                ))
                .bind(user_id)
                .bind(tokens)
                .fetch_one(pool)
                .await?
            }
            Backend::Memory(store) => {
                let mut store = lock(store);
                let account = store
                    .accounts
                    .get_mut(&user_id)
                    .ok_or(sqlx::Error::RowNotFound)?;
                account.balance_tokens += tokens;
                account.clone()
            }
        };

        tracing::info!(user_id = user_id, tokens = tokens, "Credited account");
        Ok(account)
    }

    /// Reduce the balance by `cost`, floored at zero. Whether the
    /// action should have been allowed at all is the quota policy's
    /// call, not this operation's.
    pub async fn debit(&self, user_id: i64, cost: f64) -> BillingResult<Account> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let account = sqlx::query_as::<_, Account>(&format!(
                    r#"
                    UPDATE users
                    SET balance_tokens = GREATEST(balance_tokens - $2, 0)
                    WHERE id = $1
                    RETURNING {ACCOUNT_COLUMNS}
                    "#
                ))
                .bind(user_id)
                .bind(cost)
                .fetch_one(pool)
                .await?;

                Ok(account)
            }
            Backend::Memory(store) => {
                let mut store = lock(store);
                let account = store
                    .accounts
                    .get_mut(&user_id)
                    .ok_or(sqlx::Error::RowNotFound)?;
                account.balance_tokens = (account.balance_tokens - cost).max(0.0);
                Ok(account.clone())
            }
        }
    }

    /// Roll the free-quota window over when the calendar month changed
    /// since `free_period_start`. Returns the account unchanged when
    /// still inside the current window.
    ///
    /// The month check is repeated against the stored row, not just the
    /// caller's snapshot: a concurrent request may have already rolled
    /// the window over, and repeating the reset would wipe the free
    /// requests it has consumed since.
    pub async fn reset_if_new_period(
        &self,
        account: &Account,
        now: OffsetDateTime,
    ) -> BillingResult<Account> {
        if !is_new_period(account.free_period_start, now) {
            return Ok(account.clone());
        }

        match &self.backend {
            Backend::Postgres(pool) => {
                let rolled = sqlx::query_as::<_, Account>(&format!(
                    r#"
                    UPDATE users
                    SET free_period_start = $2, free_requests_used = 0
                    WHERE id = $1
                      AND (free_period_start IS NULL
                           OR date_trunc('month', free_period_start AT TIME ZONE 'utc')
                              <> date_trunc('month', $2 AT TIME ZONE 'utc'))
                    RETURNING {ACCOUNT_COLUMNS}
                    "#
                ))
                .bind(account.id)
                .bind(now)
                .fetch_optional(pool)
                .await?;

                match rolled {
                    Some(account) => {
                        tracing::info!(user_id = account.id, "Free quota window rolled over");
                        Ok(account)
                    }
                    // Another request won the rollover; its counters stand.
                    None => self.find_by_id(account.id).await,
                }
            }
            Backend::Memory(store) => {
                let mut store = lock(store);
                let stored = store
                    .accounts
                    .get_mut(&account.id)
                    .ok_or(sqlx::Error::RowNotFound)?;
                if is_new_period(stored.free_period_start, now) {
                    stored.free_period_start = Some(now);
                    stored.free_requests_used = 0;
                    tracing::info!(user_id = stored.id, "Free quota window rolled over");
                }
                Ok(stored.clone())
            }
        }
    }

    /// Consume one unit of free quota.
    pub async fn increment_free_used(&self, user_id: i64) -> BillingResult<Account> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let account = sqlx::query_as::<_, Account>(&format!(
                    r#"
                    UPDATE users
                    SET free_requests_used = free_requests_used + 1
                    WHERE id = $1
                    RETURNING {ACCOUNT_COLUMNS}
                    "#
                ))
                .bind(user_id)
                .fetch_one(pool)
                .await?;

                Ok(account)
            }
            Backend::Memory(store) => {
                let mut store = lock(store);
                let account = store
                    .accounts
                    .get_mut(&user_id)
                    .ok_or(sqlx::Error::RowNotFound)?;
                account.free_requests_used += 1;
                Ok(account.clone())
            }
        }
    }

    /// Manual subscription management (admin path).
    pub async fn set_subscription(
        &self,
        user_id: i64,
        active: bool,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<Account> {
        let account = match &self.backend {
            Backend::Postgres(pool) => {
                sqlx::query_as::<_, Account>(&format!(
                    r#"
                    UPDATE users
                    SET subscription_status = $2, subscription_expires_at = $3
                    WHERE id = $1
                    RETURNING {ACCOUNT_COLUMNS}
                    "#
                ))
                .bind(user_id)
                .bind(active)
                .bind(expires_at)
                .fetch_one(pool)
                .await?
            }
            Backend::Memory(store) => {
                let mut store = lock(store);
                let account = store
                    .accounts
                    .get_mut(&user_id)
                    .ok_or(sqlx::Error::RowNotFound)?;
                account.subscription_status = active;
                account.subscription_expires_at = expires_at;
                account.clone()
            }
        };

        tracing::info!(
            user_id = user_id,
            active = active,
            expires_at = ?expires_at,
            "Subscription updated"
        );
        Ok(account)
    }
}
