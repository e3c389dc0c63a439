//! Storage backends
//!
//! The ledger and transaction services run against Postgres in
//! production and against a shared in-memory store in tests, so the
//! money-idempotence and rollover semantics are executable without an
//! external database. Services built over the same store observe each
//! other's writes, matching the shared `users`/`transactions` tables.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sqlx::PgPool;

use crate::ledger::Account;
use crate::transactions::Transaction;

/// Backing state for the in-memory backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub accounts: HashMap<i64, Account>,
    pub transactions: HashMap<i64, Transaction>,
    pub(crate) next_account_id: i64,
    pub(crate) next_txn_id: i64,
}

impl MemoryStore {
    /// Fresh store, to be shared by every service in one scenario.
    pub fn shared() -> Arc<Mutex<MemoryStore>> {
        Arc::new(Mutex::new(MemoryStore::default()))
    }
}

#[derive(Clone)]
pub(crate) enum Backend {
    Postgres(PgPool),
    Memory(Arc<Mutex<MemoryStore>>),
}

/// Lock the store, recovering from poisoning so state stays
/// inspectable after a panicking assertion.
pub(crate) fn lock(store: &Mutex<MemoryStore>) -> MutexGuard<'_, MemoryStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}
