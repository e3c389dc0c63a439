//! Quota policy
//!
//! Decides whether an account may perform a metered action right now,
//! and which resource pays for it. Precedence is fixed: positive
//! balance first, then an active subscription, then the monthly free
//! quota. The order matters because it determines which resource is
//! consumed, so it must never be rearranged.

use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::ledger::{is_new_period, Account, LedgerService};

/// Which resource an allowed action draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPath {
    /// Paid balance; the caller must debit [`QuotaConfig::action_cost`].
    Balance,
    /// Active subscription; nothing is consumed.
    Subscription,
    /// Monthly free quota; the caller must increment the free counter.
    FreeQuota,
}

impl AccessPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessPath::Balance => "balance",
            AccessPath::Subscription => "subscription",
            AccessPath::FreeQuota => "free_quota",
        }
    }
}

/// Outcome of a quota evaluation. `Denied` is a normal decision, not
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed { via: AccessPath },
    Denied,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }

    /// True when the allowed action consumes one unit of free quota.
    pub fn consumes_free(&self) -> bool {
        matches!(
            self,
            Verdict::Allowed {
                via: AccessPath::FreeQuota
            }
        )
    }
}

/// Policy constants, passed in at construction rather than read from
/// process-global state.
#[derive(Debug, Clone, Copy)]
pub struct QuotaConfig {
    /// Free metered actions per calendar month for new accounts.
    pub free_requests_limit: i32,
    /// Tokens debited from the balance per metered action.
    pub action_cost: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_requests_limit: 50,
            action_cost: 1.0,
        }
    }
}

/// True when the subscription grants access at `now`. An absent expiry
/// means unlimited while active.
pub fn subscription_active(account: &Account, now: OffsetDateTime) -> bool {
    if !account.subscription_status {
        return false;
    }
    match account.subscription_expires_at {
        None => true,
        Some(expires_at) => now < expires_at,
    }
}

/// Pure decision over an account snapshot. A stale free period counts
/// as a fresh window even before the rollover write lands, so the
/// verdict never depends on whether the reset has been persisted yet.
pub fn evaluate(account: &Account, now: OffsetDateTime) -> Verdict {
    if account.balance_tokens > 0.0 {
        return Verdict::Allowed {
            via: AccessPath::Balance,
        };
    }
    if subscription_active(account, now) {
        return Verdict::Allowed {
            via: AccessPath::Subscription,
        };
    }
    if is_new_period(account.free_period_start, now)
        || account.free_requests_used < account.free_requests_limit
    {
        return Verdict::Allowed {
            via: AccessPath::FreeQuota,
        };
    }
    Verdict::Denied
}

/// Stateful wrapper that pairs the pure decision with its ledger side
/// effects.
#[derive(Clone)]
pub struct QuotaService {
    ledger: LedgerService,
    config: QuotaConfig,
}

impl QuotaService {
    pub fn new(ledger: LedgerService, config: QuotaConfig) -> Self {
        Self { ledger, config }
    }

    /// Evaluate the policy for `chat_id`.
    ///
    /// The balance and subscription branches only read state. The free
    /// branch rolls the quota window over as a side effect of being
    /// evaluated at all, even when the final verdict is `Denied` —
    /// rollover is lazy and this is its only trigger.
    pub async fn may_proceed(
        &self,
        chat_id: i64,
        now: OffsetDateTime,
    ) -> BillingResult<(Account, Verdict)> {
        let account = self.ledger.get_or_create(chat_id).await?;

        if account.balance_tokens > 0.0 {
            return Ok((
                account,
                Verdict::Allowed {
                    via: AccessPath::Balance,
                },
            ));
        }
        if subscription_active(&account, now) {
            return Ok((
                account,
                Verdict::Allowed {
                    via: AccessPath::Subscription,
                },
            ));
        }

        let account = self.ledger.reset_if_new_period(&account, now).await?;
        let verdict = if account.free_requests_used < account.free_requests_limit {
            Verdict::Allowed {
                via: AccessPath::FreeQuota,
            }
        } else {
            Verdict::Denied
        };
        Ok((account, verdict))
    }

    /// Apply the single ledger mutation paired with an `Allowed`
    /// verdict: a balance debit or a free-counter increment. Exactly
    /// one mutation per allowed action; subscriptions consume nothing.
    pub async fn consume(&self, account: &Account, verdict: Verdict) -> BillingResult<Account> {
        match verdict {
            Verdict::Allowed {
                via: AccessPath::Balance,
            } => self.ledger.debit(account.id, self.config.action_cost).await,
            Verdict::Allowed {
                via: AccessPath::FreeQuota,
            } => self.ledger.increment_free_used(account.id).await,
            Verdict::Allowed {
                via: AccessPath::Subscription,
            }
            | Verdict::Denied => Ok(account.clone()),
        }
    }

    /// Decision and paired mutation in one call, for the metered-action
    /// entry point.
    pub async fn authorize_and_consume(
        &self,
        chat_id: i64,
        now: OffsetDateTime,
    ) -> BillingResult<(Account, Verdict)> {
        let (account, verdict) = self.may_proceed(chat_id, now).await?;
        let account = self.consume(&account, verdict).await?;
        Ok((account, verdict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use time::macros::datetime;
    use time::Duration;

    fn account(balance: f64) -> Account {
        Account {
            id: 1,
            chat_id: 12345,
            balance_tokens: balance,
            free_requests_used: 0,
            free_requests_limit: 50,
            free_period_start: Some(datetime!(2025-06-10 00:00 UTC)),
            subscription_status: false,
            subscription_expires_at: None,
            created_at: datetime!(2025-01-01 00:00 UTC),
        }
    }

    const NOW: OffsetDateTime = datetime!(2025-06-20 12:00 UTC);

    #[test]
    fn test_balance_wins_over_everything() {
        // Expired subscription and exhausted free quota must not matter.
        let mut acct = account(5.0);
        acct.subscription_status = true;
        acct.subscription_expires_at = Some(NOW - Duration::days(1));
        acct.free_requests_used = 50;

        assert_eq!(
            evaluate(&acct, NOW),
            Verdict::Allowed {
                via: AccessPath::Balance
            }
        );
    }

    #[test]
    fn test_subscription_without_expiry_is_unlimited() {
        let mut acct = account(0.0);
        acct.subscription_status = true;
        acct.free_requests_used = 50;

        let verdict = evaluate(&acct, NOW);
        assert_eq!(
            verdict,
            Verdict::Allowed {
                via: AccessPath::Subscription
            }
        );
        assert!(!verdict.consumes_free());
    }

    #[test]
    fn test_expired_subscription_falls_through_to_free() {
        let mut acct = account(0.0);
        acct.subscription_status = true;
        acct.subscription_expires_at = Some(NOW - Duration::minutes(1));

        assert_eq!(
            evaluate(&acct, NOW),
            Verdict::Allowed {
                via: AccessPath::FreeQuota
            }
        );
    }

    #[test]
    fn test_free_quota_exhausted_is_denied() {
        let mut acct = account(0.0);
        acct.free_requests_used = 50;

        assert_eq!(evaluate(&acct, NOW), Verdict::Denied);
    }

    #[test]
    fn test_last_free_request_is_allowed() {
        let mut acct = account(0.0);
        acct.free_requests_used = 49;

        let verdict = evaluate(&acct, NOW);
        assert!(verdict.is_allowed());
        assert!(verdict.consumes_free());
    }

    #[test]
    fn test_exhausted_quota_resets_in_new_month() {
        let mut acct = account(0.0);
        acct.free_requests_used = 50;
        acct.free_period_start = Some(datetime!(2025-05-31 23:00 UTC));

        assert_eq!(
            evaluate(&acct, NOW),
            Verdict::Allowed {
                via: AccessPath::FreeQuota
            }
        );
    }

    #[test]
    fn test_subscription_expiring_in_future_is_active() {
        let mut acct = account(0.0);
        acct.subscription_status = true;
        acct.subscription_expires_at = Some(NOW + Duration::days(30));

        assert!(subscription_active(&acct, NOW));
    }

    #[test]
    fn test_inactive_subscription_flag_ignores_expiry() {
        let mut acct = account(0.0);
        acct.subscription_expires_at = Some(NOW + Duration::days(30));

        assert!(!subscription_active(&acct, NOW));
    }

    #[tokio::test]
    async fn test_allowed_balance_debits_action_cost() {
        let store = MemoryStore::shared();
        let ledger = LedgerService::new_in_memory(store, 50);
        let quota = QuotaService::new(ledger.clone(), QuotaConfig::default());

        let created = ledger.get_or_create(777).await.unwrap();
        ledger.credit(created.id, 2.0).await.unwrap();

        let (account, verdict) = quota.authorize_and_consume(777, NOW).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Allowed {
                via: AccessPath::Balance
            }
        );
        assert_eq!(account.balance_tokens, 1.0);
        assert_eq!(account.free_requests_used, 0);
    }

    #[tokio::test]
    async fn test_free_path_increments_counter() {
        let store = MemoryStore::shared();
        let ledger = LedgerService::new_in_memory(store, 50);
        let quota = QuotaService::new(ledger, QuotaConfig::default());

        let (account, verdict) = quota.authorize_and_consume(777, NOW).await.unwrap();
        assert!(verdict.consumes_free());
        assert_eq!(account.free_requests_used, 1);
        assert!(account.free_period_start.is_some());
    }

    #[tokio::test]
    async fn test_interleaved_rollover_does_not_lose_consumption() {
        let store = MemoryStore::shared();
        let ledger = LedgerService::new_in_memory(store.clone(), 50);
        let quota = QuotaService::new(ledger.clone(), QuotaConfig::default());

        let created = ledger.get_or_create(777).await.unwrap();
        {
            let mut store = store.lock().unwrap();
            let acct = store.accounts.get_mut(&created.id).unwrap();
            acct.free_period_start = Some(datetime!(2025-05-10 00:00 UTC));
            acct.free_requests_used = 50;
        }
        let stale = ledger.find_by_id(created.id).await.unwrap();

        // First request across the month boundary rolls the window
        // over and consumes one free request.
        let (account, verdict) = quota.authorize_and_consume(777, NOW).await.unwrap();
        assert!(verdict.consumes_free());
        assert_eq!(account.free_requests_used, 1);

        // A second request that read its snapshot before the rollover
        // must not repeat the reset and wipe that consumption.
        let account = ledger.reset_if_new_period(&stale, NOW).await.unwrap();
        assert_eq!(account.free_requests_used, 1);

        let (account, verdict) = quota.authorize_and_consume(777, NOW).await.unwrap();
        assert!(verdict.consumes_free());
        assert_eq!(account.free_requests_used, 2);
    }
}
