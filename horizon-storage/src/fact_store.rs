//! Fact store adapter: the narrow read interface over accounts and
//! transactions, plus an in-memory reference store that publishes
//! mutation events.
//!
//! The cache never owns facts. It asks the store two questions about an
//! entity at an instant: what has become effective (`sum_effective`) and
//! when the next pending fact lands (`min_pending`).

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use horizon_core::{
    Account, Amount, EntityKey, Expiration, FactId, HorizonError, HorizonResult, MutationEvent,
    StorageError, Timestamp, Transaction,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Read interface over the base collection of facts.
///
/// Implementations must answer from the durable fact set, never from any
/// cached intermediate, so a recompute always reflects the true state.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Sum of fact amounts with `effective_time <= as_of`.
    async fn sum_effective(&self, key: &EntityKey, as_of: Timestamp) -> HorizonResult<Amount>;

    /// Minimum `effective_time` strictly greater than `as_of`, or
    /// `PosInfinity` when nothing is pending.
    async fn min_pending(&self, key: &EntityKey, as_of: Timestamp) -> HorizonResult<Expiration>;

    /// Whether the entity currently exists.
    async fn entity_exists(&self, key: &EntityKey) -> HorizonResult<bool>;

    /// Both recompute inputs at one instant.
    ///
    /// The default issues two queries. Stores that can answer both from one
    /// consistent snapshot should override it.
    async fn aggregate_at(
        &self,
        key: &EntityKey,
        as_of: Timestamp,
    ) -> HorizonResult<(Amount, Expiration)> {
        let value = self.sum_effective(key, as_of).await?;
        let expiration = self.min_pending(key, as_of).await?;
        Ok((value, expiration))
    }
}

#[async_trait]
impl<T: FactStore + ?Sized> FactStore for Arc<T> {
    async fn sum_effective(&self, key: &EntityKey, as_of: Timestamp) -> HorizonResult<Amount> {
        (**self).sum_effective(key, as_of).await
    }

    async fn min_pending(&self, key: &EntityKey, as_of: Timestamp) -> HorizonResult<Expiration> {
        (**self).min_pending(key, as_of).await
    }

    async fn entity_exists(&self, key: &EntityKey) -> HorizonResult<bool> {
        (**self).entity_exists(key).await
    }

    async fn aggregate_at(
        &self,
        key: &EntityKey,
        as_of: Timestamp,
    ) -> HorizonResult<(Amount, Expiration)> {
        (**self).aggregate_at(key, as_of).await
    }
}

// ============================================================================
// UPDATE TYPES
// ============================================================================

/// Update payload for transactions.
#[derive(Debug, Clone, Default)]
pub struct TransactionUpdate {
    /// Move the transaction to another account
    pub account: Option<EntityKey>,
    /// New amount
    pub amount: Option<Amount>,
    /// New post time
    pub post_time: Option<Timestamp>,
    /// New memo
    pub memo: Option<String>,
}

// ============================================================================
// IN-MEMORY FACT STORE
// ============================================================================

/// Per-account facts ordered by post time, so both recompute queries are
/// range lookups.
type Ledger = BTreeMap<(Timestamp, FactId), Amount>;

#[derive(Debug, Default)]
struct FactTables {
    accounts: HashMap<EntityKey, Account>,
    transactions: HashMap<FactId, Transaction>,
    ledgers: HashMap<EntityKey, Ledger>,
}

impl FactTables {
    fn ledger(&self, key: &EntityKey) -> Option<&Ledger> {
        self.ledgers.get(key)
    }

    fn sum_effective(&self, key: &EntityKey, as_of: Timestamp) -> Result<Amount, StorageError> {
        let Some(ledger) = self.ledger(key) else {
            return Ok(0);
        };
        ledger
            .range(..=(as_of, Uuid::max()))
            .try_fold(0 as Amount, |total, (_, amount)| total.checked_add(*amount))
            .ok_or_else(|| StorageError::AggregateOverflow {
                key: key.clone(),
                as_of,
            })
    }

    fn min_pending(&self, key: &EntityKey, as_of: Timestamp) -> Expiration {
        let next = self.ledger(key).and_then(|ledger| {
            ledger
                .range((Bound::Excluded((as_of, Uuid::max())), Bound::Unbounded))
                .next()
                .map(|((post_time, _), _)| *post_time)
        });
        Expiration::from_next_pending(next)
    }

    fn index(&mut self, tx: &Transaction) {
        self.ledgers
            .entry(tx.account.clone())
            .or_default()
            .insert((tx.post_time, tx.transaction_id), tx.amount);
    }

    fn unindex(&mut self, tx: &Transaction) {
        if let Some(ledger) = self.ledgers.get_mut(&tx.account) {
            ledger.remove(&(tx.post_time, tx.transaction_id));
        }
    }
}

/// In-memory fact store for tests and embedding.
///
/// Enforces the referential integrity the cache relies on: transactions
/// need an existing account, and deleting an account cascades to its
/// transactions. Every successful mutation is published to all
/// subscribers after it has been applied.
#[derive(Debug, Default)]
pub struct InMemoryFactStore {
    tables: RwLock<FactTables>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<MutationEvent>>>,
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the mutation event feed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MutationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    fn publish(&self, event: &MutationEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Drop subscribers whose receiver has gone away.
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn read(&self) -> HorizonResult<std::sync::RwLockReadGuard<'_, FactTables>> {
        self.tables
            .read()
            .map_err(|_| HorizonError::Storage(StorageError::LockPoisoned))
    }

    fn write(&self) -> HorizonResult<std::sync::RwLockWriteGuard<'_, FactTables>> {
        self.tables
            .write()
            .map_err(|_| HorizonError::Storage(StorageError::LockPoisoned))
    }

    // === Account Operations ===

    /// Insert a new account.
    pub fn insert_account(&self, account: Account) -> HorizonResult<MutationEvent> {
        let event = {
            let mut tables = self.write()?;
            if tables.accounts.contains_key(&account.name) {
                return Err(StorageError::InsertFailed {
                    key: account.name.clone(),
                    reason: "account already exists".to_string(),
                }
                .into());
            }
            let key = account.name.clone();
            tables.accounts.insert(key.clone(), account);
            MutationEvent::EntityCreated { key }
        };
        self.publish(&event);
        Ok(event)
    }

    /// Delete an account and, by cascade, all of its transactions.
    ///
    /// Only `EntityDeleted` is published: the cache row goes away with the
    /// account, so per-transaction events would have nothing to touch.
    pub fn delete_account(&self, key: &EntityKey) -> HorizonResult<MutationEvent> {
        let event = {
            let mut tables = self.write()?;
            if tables.accounts.remove(key).is_none() {
                return Err(StorageError::NotFound { key: key.clone() }.into());
            }
            tables.transactions.retain(|_, tx| &tx.account != key);
            tables.ledgers.remove(key);
            MutationEvent::EntityDeleted { key: key.clone() }
        };
        self.publish(&event);
        Ok(event)
    }

    pub fn account(&self, key: &EntityKey) -> HorizonResult<Option<Account>> {
        Ok(self.read()?.accounts.get(key).cloned())
    }

    pub fn account_count(&self) -> usize {
        self.read().map(|t| t.accounts.len()).unwrap_or(0)
    }

    /// All account keys, sorted.
    pub fn account_keys(&self) -> HorizonResult<Vec<EntityKey>> {
        let mut keys: Vec<EntityKey> = self.read()?.accounts.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    // === Transaction Operations ===

    /// Insert a new transaction.
    pub fn insert_transaction(&self, tx: Transaction) -> HorizonResult<MutationEvent> {
        let event = {
            let mut tables = self.write()?;
            if !tables.accounts.contains_key(&tx.account) {
                return Err(StorageError::NotFound {
                    key: tx.account.clone(),
                }
                .into());
            }
            if tables.transactions.contains_key(&tx.transaction_id) {
                return Err(StorageError::InsertFailed {
                    key: tx.account.clone(),
                    reason: format!("transaction {} already exists", tx.transaction_id),
                }
                .into());
            }
            tables.index(&tx);
            let event = MutationEvent::FactCreated {
                fact_id: tx.transaction_id,
                owner: tx.account.clone(),
                effective_time: tx.post_time,
            };
            tables.transactions.insert(tx.transaction_id, tx);
            event
        };
        self.publish(&event);
        Ok(event)
    }

    /// Update a transaction in place.
    pub fn update_transaction(
        &self,
        id: FactId,
        update: TransactionUpdate,
    ) -> HorizonResult<MutationEvent> {
        let event = {
            let mut tables = self.write()?;
            let old = tables
                .transactions
                .get(&id)
                .cloned()
                .ok_or(StorageError::FactNotFound { id })?;

            let mut new = old.clone();
            if let Some(account) = update.account {
                if !tables.accounts.contains_key(&account) {
                    return Err(StorageError::NotFound { key: account }.into());
                }
                new.account = account;
            }
            if let Some(amount) = update.amount {
                new.amount = amount;
            }
            if let Some(post_time) = update.post_time {
                new.post_time = post_time;
            }
            if let Some(memo) = update.memo {
                new.memo = Some(memo);
            }

            tables.unindex(&old);
            tables.index(&new);
            let event = MutationEvent::FactUpdated {
                fact_id: id,
                old_owner: old.account.clone(),
                new_owner: new.account.clone(),
                relevant_change: old.amount != new.amount || old.post_time != new.post_time,
            };
            tables.transactions.insert(id, new);
            event
        };
        self.publish(&event);
        Ok(event)
    }

    /// Delete a transaction.
    pub fn delete_transaction(&self, id: FactId) -> HorizonResult<MutationEvent> {
        let event = {
            let mut tables = self.write()?;
            let tx = tables
                .transactions
                .remove(&id)
                .ok_or(StorageError::FactNotFound { id })?;
            tables.unindex(&tx);
            MutationEvent::FactDeleted {
                fact_id: id,
                owner: tx.account,
                effective_time: tx.post_time,
            }
        };
        self.publish(&event);
        Ok(event)
    }

    pub fn transaction(&self, id: FactId) -> HorizonResult<Option<Transaction>> {
        Ok(self.read()?.transactions.get(&id).cloned())
    }

    /// All transaction ids, sorted.
    pub fn transaction_ids(&self) -> HorizonResult<Vec<FactId>> {
        let mut ids: Vec<FactId> = self.read()?.transactions.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    /// Transactions owned by an account, ordered by post time.
    pub fn transactions_for(&self, key: &EntityKey) -> HorizonResult<Vec<Transaction>> {
        let tables = self.read()?;
        let mut txs: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|tx| &tx.account == key)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| (tx.post_time, tx.transaction_id));
        Ok(txs)
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn sum_effective(&self, key: &EntityKey, as_of: Timestamp) -> HorizonResult<Amount> {
        Ok(self.read()?.sum_effective(key, as_of)?)
    }

    async fn min_pending(&self, key: &EntityKey, as_of: Timestamp) -> HorizonResult<Expiration> {
        Ok(self.read()?.min_pending(key, as_of))
    }

    async fn entity_exists(&self, key: &EntityKey) -> HorizonResult<bool> {
        Ok(self.read()?.accounts.contains_key(key))
    }

    async fn aggregate_at(
        &self,
        key: &EntityKey,
        as_of: Timestamp,
    ) -> HorizonResult<(Amount, Expiration)> {
        let tables = self.read()?;
        Ok((tables.sum_effective(key, as_of)?, tables.min_pending(key, as_of)))
    }
}
