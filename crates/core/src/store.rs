//! Ledger store: accounts, entity tables and the transaction boundary.
//!
//! All state lives in one [`Tables`] value behind a mutex. A mutation runs as
//! [`Store::transact`]: the closure reads through a [`Txn`] that stages every
//! write (account rows, entity rows, audit entries) and the staged writes are
//! applied only if the closure returns `Ok`. Holding the lock for the whole
//! closure serializes transactions, so no reader observes half of a
//! credit/debit pair.
//!
//! Balance fields change only through [`Txn::credit`] and [`Txn::debit`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::accrual::Contract;
use crate::audit::{AuditAction, AuditEntry, EntityRef};
use crate::auth::Actor;
use crate::clock::TimeSource;
use crate::currency::{Coin, CurrencyLedger, RewardBalance, SpendableBalance};
use crate::deposit::Deposit;
use crate::error::{LedgerError, Result, StateConflict};
use crate::referral::Referral;
use crate::withdrawal::Withdrawal;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s.trim())
                    .map(Self)
                    .map_err(|e| LedgerError::InvalidAmount(format!("malformed id {s:?}: {e}")))
            }
        }
    };
}

ulid_id!(DepositId);
ulid_id!(WithdrawalId);
ulid_id!(ContractId);
ulid_id!(ReferralId);
ulid_id!(AuditId);

/// Account identity key, as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Accounts
// =============================================================================

/// Which of an account's two balance maps an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMap {
    Spendable,
    Reward,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralStats {
    pub referred_count: u32,
    pub bonus_earned: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub spendable: SpendableBalance,
    pub rewards: RewardBalance,
    #[serde(default)]
    pub referral: ReferralStats,
    /// The referral that brought this account in, at most one.
    #[serde(default)]
    pub referred_by: Option<ReferralId>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            spendable: SpendableBalance::default(),
            rewards: RewardBalance::default(),
            referral: ReferralStats::default(),
            referred_by: None,
            created_at,
        }
    }

    pub fn balance(&self, map: BalanceMap, coin: &Coin) -> Decimal {
        match map {
            BalanceMap::Spendable => self.spendable.get(coin),
            BalanceMap::Reward => self.rewards.get(coin),
        }
    }
}

// =============================================================================
// Tables
// =============================================================================

/// A row type kept in a [`Table`], indexed by owner and by status.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + 'static {
    type Id: Copy + Ord + fmt::Display + Send;
    type Status: Copy + Ord + fmt::Debug + Send;
    /// Entity name used in errors and logs.
    const ENTITY: &'static str;

    fn id(&self) -> Self::Id;
    fn owner(&self) -> &AccountId;
    fn status(&self) -> Self::Status;
}

/// Rows keyed by id with owner and status indexes for queue scans.
#[derive(Clone)]
pub struct Table<R: Record> {
    rows: BTreeMap<R::Id, R>,
    by_owner: HashMap<AccountId, BTreeSet<R::Id>>,
    by_status: BTreeMap<R::Status, BTreeSet<R::Id>>,
}

impl<R: Record> Default for Table<R> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            by_owner: HashMap::new(),
            by_status: BTreeMap::new(),
        }
    }
}

impl<R: Record> Table<R> {
    fn put(&mut self, row: R) {
        let id = row.id();
        if let Some(old) = self.rows.remove(&id) {
            self.unindex(&old);
        }
        self.by_owner
            .entry(row.owner().clone())
            .or_default()
            .insert(id);
        self.by_status.entry(row.status()).or_default().insert(id);
        self.rows.insert(id, row);
    }

    fn unindex(&mut self, row: &R) {
        let id = row.id();
        if let Some(ids) = self.by_owner.get_mut(row.owner()) {
            ids.remove(&id);
        }
        if let Some(ids) = self.by_status.get_mut(&row.status()) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_status.remove(&row.status());
            }
        }
    }

    pub fn get(&self, id: &R::Id) -> Option<&R> {
        self.rows.get(id)
    }

    pub fn by_owner<'a>(&'a self, owner: &AccountId) -> impl Iterator<Item = &'a R> + 'a {
        self.by_owner
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|id| self.rows.get(id))
    }

    pub fn by_status(&self, status: R::Status) -> impl Iterator<Item = &R> + '_ {
        self.by_status
            .get(&status)
            .into_iter()
            .flatten()
            .filter_map(|id| self.rows.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> + '_ {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// Persisted as a plain list; indexes are rebuilt on load.
impl<R: Record> Serialize for Table<R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.rows.values())
    }
}

impl<'de, R: Record> Deserialize<'de> for Table<R> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let rows = Vec::<R>::deserialize(deserializer)?;
        let mut table = Self::default();
        for row in rows {
            table.put(row);
        }
        Ok(table)
    }
}

/// The complete persisted state.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default)]
    accounts: BTreeMap<AccountId, Account>,
    #[serde(default)]
    deposits: Table<Deposit>,
    #[serde(default)]
    withdrawals: Table<Withdrawal>,
    #[serde(default)]
    contracts: Table<Contract>,
    #[serde(default)]
    referrals: Table<Referral>,
    #[serde(default)]
    audit: Vec<AuditEntry>,
}

impl Tables {
    fn apply(&mut self, writes: Writes) {
        self.accounts.extend(writes.accounts);
        for row in writes.deposits.into_values() {
            self.deposits.put(row);
        }
        for row in writes.withdrawals.into_values() {
            self.withdrawals.put(row);
        }
        for row in writes.contracts.into_values() {
            self.contracts.put(row);
        }
        for row in writes.referrals.into_values() {
            self.referrals.put(row);
        }
        self.audit.extend(writes.audit);
    }
}

/// Writes staged by a [`Txn`].
#[derive(Default)]
pub struct Writes {
    accounts: BTreeMap<AccountId, Account>,
    deposits: BTreeMap<DepositId, Deposit>,
    withdrawals: BTreeMap<WithdrawalId, Withdrawal>,
    contracts: BTreeMap<ContractId, Contract>,
    referrals: BTreeMap<ReferralId, Referral>,
    audit: Vec<AuditEntry>,
}

/// Storage plumbing binding a [`Record`] to its table and staging area.
#[doc(hidden)]
pub trait Stored: Record {
    fn table(tables: &Tables) -> &Table<Self>;
    fn staged(writes: &Writes) -> &BTreeMap<Self::Id, Self>;
    fn staged_mut(writes: &mut Writes) -> &mut BTreeMap<Self::Id, Self>;
}

macro_rules! stored {
    ($ty:ty, $field:ident) => {
        impl Stored for $ty {
            fn table(tables: &Tables) -> &Table<Self> {
                &tables.$field
            }
            fn staged(writes: &Writes) -> &BTreeMap<Self::Id, Self> {
                &writes.$field
            }
            fn staged_mut(writes: &mut Writes) -> &mut BTreeMap<Self::Id, Self> {
                &mut writes.$field
            }
        }
    };
}

stored!(Deposit, deposits);
stored!(Withdrawal, withdrawals);
stored!(Contract, contracts);
stored!(Referral, referrals);

// =============================================================================
// Transactions
// =============================================================================

/// A unit of work against the store. See the module docs.
pub struct Txn<'a> {
    base: &'a Tables,
    writes: Writes,
    now: DateTime<Utc>,
}

impl Txn<'_> {
    /// Transaction timestamp; every record touched in this unit shares it.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn account(&self, id: &AccountId) -> Result<Account> {
        self.writes
            .accounts
            .get(id)
            .or_else(|| self.base.accounts.get(id))
            .cloned()
            .ok_or_else(|| LedgerError::not_found("account", id))
    }

    pub fn has_account(&self, id: &AccountId) -> bool {
        self.writes.accounts.contains_key(id) || self.base.accounts.contains_key(id)
    }

    pub(crate) fn insert_account(&mut self, account: Account) -> Result<()> {
        if self.has_account(&account.id) {
            return Err(LedgerError::conflict(
                "account",
                &account.id,
                StateConflict::Duplicate,
            ));
        }
        self.writes.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    pub(crate) fn update_referral_stats(
        &mut self,
        id: &AccountId,
        f: impl FnOnce(&mut ReferralStats) -> Result<()>,
    ) -> Result<()> {
        let mut account = self.account(id)?;
        f(&mut account.referral)?;
        self.writes.accounts.insert(id.clone(), account);
        Ok(())
    }

    pub(crate) fn set_referred_by(&mut self, id: &AccountId, referral: ReferralId) -> Result<()> {
        let mut account = self.account(id)?;
        if account.referred_by.is_some() {
            return Err(LedgerError::conflict(
                "account",
                id,
                StateConflict::Duplicate,
            ));
        }
        account.referred_by = Some(referral);
        self.writes.accounts.insert(id.clone(), account);
        Ok(())
    }

    /// Add `amount` of `coin` to one of the account's balance maps.
    /// Returns the new balance.
    pub fn credit(
        &mut self,
        id: &AccountId,
        map: BalanceMap,
        coin: &Coin,
        amount: Decimal,
    ) -> Result<Decimal> {
        let mut account = self.account(id)?;
        let balance = match map {
            BalanceMap::Spendable => account.spendable.credit(coin, amount)?,
            BalanceMap::Reward => account.rewards.credit(coin, amount)?,
        };
        tracing::debug!(account = %id, ?map, %coin, %amount, %balance, "credit staged");
        self.writes.accounts.insert(id.clone(), account);
        Ok(balance)
    }

    /// Remove `amount` of `coin` from one of the account's balance maps.
    /// Fails with `InsufficientBalance` rather than going negative.
    pub fn debit(
        &mut self,
        id: &AccountId,
        map: BalanceMap,
        coin: &Coin,
        amount: Decimal,
    ) -> Result<Decimal> {
        let mut account = self.account(id)?;
        let balance = match map {
            BalanceMap::Spendable => account.spendable.debit(coin, amount)?,
            BalanceMap::Reward => account.rewards.debit(coin, amount)?,
        };
        tracing::debug!(account = %id, ?map, %coin, %amount, %balance, "debit staged");
        self.writes.accounts.insert(id.clone(), account);
        Ok(balance)
    }

    pub fn load<R: Stored>(&self, id: &R::Id) -> Result<R> {
        R::staged(&self.writes)
            .get(id)
            .or_else(|| R::table(self.base).get(id))
            .cloned()
            .ok_or_else(|| LedgerError::not_found(R::ENTITY, id))
    }

    pub(crate) fn save<R: Stored>(&mut self, row: R) {
        R::staged_mut(&mut self.writes).insert(row.id(), row);
    }

    pub(crate) fn audit(
        &mut self,
        actor: Actor,
        action: AuditAction,
        entity: EntityRef,
        metadata: serde_json::Value,
    ) {
        self.writes.audit.push(AuditEntry {
            id: AuditId::new(),
            actor,
            action,
            entity,
            metadata,
            at: self.now,
        });
    }
}

// =============================================================================
// Store
// =============================================================================

pub struct Store {
    tables: Mutex<Tables>,
    clock: Arc<dyn TimeSource>,
}

impl Store {
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self::with_tables(Tables::default(), clock)
    }

    pub fn with_tables(tables: Tables, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            tables: Mutex::new(tables),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `f` as one all-or-nothing transaction.
    pub fn transact<T>(&self, f: impl FnOnce(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.lock();
        let mut txn = Txn {
            base: &tables,
            writes: Writes::default(),
            now: self.clock.now(),
        };
        let out = f(&mut txn)?;
        let writes = txn.writes;
        tables.apply(writes);
        Ok(out)
    }

    pub fn account(&self, id: &AccountId) -> Result<Account> {
        self.tables
            .lock()
            .accounts
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("account", id))
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.tables.lock().accounts.values().cloned().collect()
    }

    pub fn get<R: Stored>(&self, id: &R::Id) -> Result<R> {
        R::table(&self.tables.lock())
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found(R::ENTITY, id))
    }

    pub fn list_by_owner<R: Stored>(&self, owner: &AccountId) -> Vec<R> {
        R::table(&self.tables.lock())
            .by_owner(owner)
            .cloned()
            .collect()
    }

    pub fn list_by_status<R: Stored>(&self, status: R::Status) -> Vec<R> {
        R::table(&self.tables.lock())
            .by_status(status)
            .cloned()
            .collect()
    }

    /// Rows matching an arbitrary predicate; a full scan.
    pub fn find<R: Stored>(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        R::table(&self.tables.lock())
            .iter()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }

    pub fn audit_by_actor(&self, actor: &Actor) -> Vec<AuditEntry> {
        self.tables
            .lock()
            .audit
            .iter()
            .filter(|e| &e.actor == actor)
            .cloned()
            .collect()
    }

    pub fn audit_for_entity(&self, entity: &EntityRef) -> Vec<AuditEntry> {
        self.tables
            .lock()
            .audit
            .iter()
            .filter(|e| &e.entity == entity)
            .cloned()
            .collect()
    }

    pub fn audit_len(&self) -> usize {
        self.tables.lock().audit.len()
    }

    /// Write the full table set to `path` as JSON.
    ///
    /// The snapshot goes to a temporary file in the same directory first and
    /// is renamed over `path`, so a crash never leaves a torn file behind.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = self.tables.lock().clone();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut file, &snapshot)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| LedgerError::from(e.error))?;
        tracing::info!(
            path = %path.display(),
            accounts = snapshot.accounts.len(),
            audit_entries = snapshot.audit.len(),
            "Ledger snapshot saved"
        );
        Ok(())
    }

    pub fn load_snapshot(path: &Path, clock: Arc<dyn TimeSource>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let tables: Tables = serde_json::from_slice(&bytes)?;
        tracing::info!(
            path = %path.display(),
            accounts = tables.accounts.len(),
            deposits = tables.deposits.len(),
            withdrawals = tables.withdrawals.len(),
            contracts = tables.contracts.len(),
            referrals = tables.referrals.len(),
            "Ledger snapshot loaded"
        );
        Ok(Self::with_tables(tables, clock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SharedMockClock;
    use crate::deposit::DepositStatus;
    use rust_decimal_macros::dec;

    fn make_store() -> Store {
        Store::new(Arc::new(SharedMockClock::new()))
    }

    fn open(store: &Store, id: &str) -> AccountId {
        let id = AccountId::from(id);
        store
            .transact(|txn| {
                let now = txn.now();
                txn.insert_account(Account::new(id.clone(), now))
            })
            .unwrap();
        id
    }

    fn make_deposit(owner: &AccountId, amount: Decimal) -> Deposit {
        Deposit {
            id: DepositId::new(),
            owner: owner.clone(),
            currency: Coin::Usdt,
            amount,
            address: "TQ-intake".into(),
            tx_ref: None,
            status: DepositStatus::Pending,
            admin_note: None,
            approved_by: None,
            contract_id: None,
            created_at: DateTime::<Utc>::default(),
            processed_at: None,
        }
    }

    #[test]
    fn test_failed_transaction_leaves_no_trace() {
        let store = make_store();
        let alice = open(&store, "alice");

        let result: Result<()> = store.transact(|txn| {
            txn.credit(&alice, BalanceMap::Spendable, &Coin::Usdt, dec!(50))?;
            txn.debit(&alice, BalanceMap::Spendable, &Coin::Usdt, dec!(80))?;
            Ok(())
        });

        assert!(matches!(
            result,
            Err(LedgerError::InsufficientBalance { .. })
        ));
        let account = store.account(&alice).unwrap();
        assert_eq!(account.spendable.get(&Coin::Usdt), Decimal::ZERO);
    }

    #[test]
    fn test_staged_writes_visible_within_transaction() {
        let store = make_store();
        let alice = open(&store, "alice");

        store
            .transact(|txn| {
                txn.credit(&alice, BalanceMap::Spendable, &Coin::Usd, dec!(10))?;
                txn.credit(&alice, BalanceMap::Spendable, &Coin::Usd, dec!(5))?;
                let balance = txn.debit(&alice, BalanceMap::Spendable, &Coin::Usd, dec!(12))?;
                assert_eq!(balance, dec!(3));
                Ok(())
            })
            .unwrap();

        assert_eq!(
            store.account(&alice).unwrap().spendable.get(&Coin::Usd),
            dec!(3)
        );
    }

    #[test]
    fn test_duplicate_account_rejected() {
        let store = make_store();
        open(&store, "alice");
        let err = store
            .transact(|txn| {
                let now = txn.now();
                txn.insert_account(Account::new("alice".into(), now))
            })
            .unwrap_err();
        assert_eq!(err.state_conflict(), Some(&StateConflict::Duplicate));
    }

    #[test]
    fn test_status_index_follows_updates() {
        let store = make_store();
        let alice = open(&store, "alice");
        let deposit = make_deposit(&alice, dec!(100));
        let id = deposit.id;

        store
            .transact(|txn| {
                txn.save(deposit);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.list_by_status::<Deposit>(DepositStatus::Pending).len(), 1);

        store
            .transact(|txn| {
                let mut d: Deposit = txn.load(&id)?;
                d.status = DepositStatus::Approved;
                txn.save(d);
                Ok(())
            })
            .unwrap();

        assert!(store
            .list_by_status::<Deposit>(DepositStatus::Pending)
            .is_empty());
        assert_eq!(store.list_by_status::<Deposit>(DepositStatus::Approved).len(), 1);
        assert_eq!(store.list_by_owner::<Deposit>(&alice).len(), 1);
    }

    #[test]
    fn test_snapshot_round_trip_rebuilds_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let clock: Arc<dyn TimeSource> = Arc::new(SharedMockClock::new());

        let store = Store::new(clock.clone());
        let alice = open(&store, "alice");
        store
            .transact(|txn| {
                txn.credit(&alice, BalanceMap::Reward, &"KAS".parse::<Coin>()?, dec!(3))?;
                txn.save(make_deposit(&alice, dec!(25)));
                Ok(())
            })
            .unwrap();
        store.save_snapshot(&path).unwrap();

        let restored = Store::load_snapshot(&path, clock).unwrap();
        let account = restored.account(&alice).unwrap();
        assert_eq!(account.rewards.get(&"KAS".parse::<Coin>().unwrap()), dec!(3));
        assert_eq!(
            restored
                .list_by_status::<Deposit>(DepositStatus::Pending)
                .len(),
            1
        );
    }

    #[test]
    fn test_load_snapshot_missing_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = match Store::load_snapshot(
            &dir.path().join("absent.json"),
            Arc::new(SharedMockClock::new()),
        ) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }
}
