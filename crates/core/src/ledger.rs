//! The [`Ledger`] facade: the store plus every external collaborator.
//!
//! State-machine operations live next to their records (`deposit`,
//! `withdrawal`, `purchase`, `accrual`, `referral`) as `impl Ledger` blocks.
//! This module wires the pieces together and holds the account queries.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;

use crate::audit::{AuditAction, AuditEntry, EntityKind, EntityRef};
use crate::auth::{Actor, Claims};
use crate::catalog::{Catalog, RateSampler, Tier, TierId, TierSpec, UniformSampler};
use crate::clock::{SystemClock, TimeSource};
use crate::config::LedgerConfig;
use crate::currency::Coin;
use crate::error::Result;
use crate::notify::{self, Notification, Notifier, TracingNotifier};
use crate::oracle::{PriceOracle, PriceSnapshot};
use crate::purchase::DebitPriority;
use crate::referral;
use crate::store::{Account, AccountId, Store};
use crate::verifier::{NoopVerifier, TxVerifier};

pub struct Ledger {
    pub(crate) store: Arc<Store>,
    pub(crate) config: LedgerConfig,
    pub(crate) priority: DebitPriority,
    pub(crate) catalog: RwLock<Catalog>,
    pub(crate) oracle: Arc<dyn PriceOracle>,
    pub(crate) verifier: Arc<dyn TxVerifier>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) sampler: Arc<dyn RateSampler>,
}

pub struct LedgerBuilder {
    config: LedgerConfig,
    oracle: Arc<dyn PriceOracle>,
    clock: Option<Arc<dyn TimeSource>>,
    store: Option<Store>,
    catalog: Catalog,
    verifier: Arc<dyn TxVerifier>,
    notifier: Arc<dyn Notifier>,
    sampler: Arc<dyn RateSampler>,
}

impl LedgerBuilder {
    pub fn new(config: LedgerConfig, oracle: Arc<dyn PriceOracle>) -> Self {
        Self {
            config,
            oracle,
            clock: None,
            store: None,
            catalog: Catalog::default(),
            verifier: Arc::new(NoopVerifier),
            notifier: Arc::new(TracingNotifier),
            sampler: Arc::new(UniformSampler),
        }
    }

    /// Clock for a fresh store. Ignored when [`LedgerBuilder::store`] is set.
    pub fn clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn TxVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn sampler(mut self, sampler: Arc<dyn RateSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn build(self) -> Result<Ledger> {
        let priority = DebitPriority::new(self.config.debit_priority.clone())?;
        let store = match self.store {
            Some(store) => store,
            None => Store::new(self.clock.unwrap_or_else(|| Arc::new(SystemClock))),
        };
        Ok(Ledger {
            store: Arc::new(store),
            config: self.config,
            priority,
            catalog: RwLock::new(self.catalog),
            oracle: self.oracle,
            verifier: self.verifier,
            notifier: self.notifier,
            sampler: self.sampler,
        })
    }
}

impl Ledger {
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn priority(&self) -> &DebitPriority {
        &self.priority
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        self.store.save_snapshot(path)
    }

    pub(crate) fn notify(&self, notification: Notification) {
        notify::dispatch(self.notifier.as_ref(), notification);
    }

    /// Read phase shared by every price-dependent operation.
    pub(crate) async fn price_snapshot(&self, coins: &[Coin]) -> PriceSnapshot {
        PriceSnapshot::resolve(self.oracle.as_ref(), coins, &self.config.fallback_prices).await
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Create an account, optionally linked to a referrer.
    ///
    /// Re-opening an existing account without a referrer returns it
    /// unchanged; with a referrer it is a duplicate.
    pub fn open_account(&self, id: &AccountId, referrer: Option<&AccountId>) -> Result<Account> {
        let bonus = self.config.referral.clone();
        let account = self.store.transact(|txn| {
            if txn.has_account(id) && referrer.is_none() {
                return txn.account(id);
            }
            let now = txn.now();
            txn.insert_account(Account::new(id.clone(), now))?;
            txn.audit(
                Actor::Account(id.clone()),
                AuditAction::AccountOpened,
                EntityRef::new(EntityKind::Account, id),
                json!({ "referrer": referrer.map(AccountId::as_str) }),
            );
            if let Some(referrer) = referrer {
                referral::link(txn, referrer, id, &bonus)?;
            }
            txn.account(id)
        })?;
        tracing::info!(account = %id, referrer = ?referrer.map(AccountId::as_str), "Account opened");
        Ok(account)
    }

    pub fn get_account(&self, id: &AccountId) -> Result<Account> {
        self.store.account(id)
    }

    // =========================================================================
    // Catalog administration
    // =========================================================================

    pub fn upsert_tier(&self, claims: &Claims, spec: TierSpec) -> Result<Tier> {
        let actor = claims.require_admin()?;
        let tier = spec.resolve()?;
        self.store.transact(|txn| {
            txn.audit(
                actor,
                AuditAction::TierUpserted,
                EntityRef::new(EntityKind::Tier, &tier.id),
                json!({
                    "min_usd": tier.min_usd,
                    "max_usd": tier.max_usd,
                    "duration_days": tier.duration_days,
                    "active": tier.active,
                }),
            );
            Ok(())
        })?;
        self.catalog.write().upsert(tier.clone());
        tracing::info!(tier = %tier.id, "Tier upserted");
        Ok(tier)
    }

    pub fn set_tier_active(&self, claims: &Claims, id: &TierId, active: bool) -> Result<Tier> {
        let actor = claims.require_admin()?;
        let mut catalog = self.catalog.write();
        catalog.get(id)?;
        self.store.transact(|txn| {
            txn.audit(
                actor,
                AuditAction::TierActivationChanged,
                EntityRef::new(EntityKind::Tier, id),
                json!({ "active": active }),
            );
            Ok(())
        })?;
        let tier = catalog.set_active(id, active)?.clone();
        tracing::info!(tier = %id, active, "Tier activation changed");
        Ok(tier)
    }

    pub fn tier(&self, id: &TierId) -> Result<Tier> {
        self.catalog.read().get(id).cloned()
    }

    pub fn active_tiers(&self) -> Vec<Tier> {
        self.catalog.read().list_active().into_iter().cloned().collect()
    }

    // =========================================================================
    // Audit queries
    // =========================================================================

    pub fn audit_by_actor(&self, actor: &Actor) -> Vec<AuditEntry> {
        self.store.audit_by_actor(actor)
    }

    pub fn audit_for_entity(&self, kind: EntityKind, id: impl ToString) -> Vec<AuditEntry> {
        self.store.audit_for_entity(&EntityRef::new(kind, id))
    }
}

// =============================================================================
// Test fixture
// =============================================================================

#[cfg(test)]
pub(crate) mod fixture {
    use std::collections::BTreeMap;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::catalog::FixedRateSampler;
    use crate::clock::SharedMockClock;
    use crate::notify::RecordingNotifier;
    use crate::oracle::MockPriceOracle;
    use crate::store::BalanceMap;
    use crate::verifier::MockTxVerifier;

    pub(crate) struct Fixture {
        pub ledger: Ledger,
        pub clock: SharedMockClock,
        pub oracle: Arc<MockPriceOracle>,
        pub notifier: Arc<RecordingNotifier>,
    }

    pub(crate) fn tier(id: &str, order: u32, min: Decimal, max: Option<Decimal>) -> TierSpec {
        TierSpec {
            id: id.into(),
            name: id.to_string(),
            capacity: "100 TH/s".into(),
            duration_days: 30,
            min_usd: min,
            max_usd: max,
            display_price: None,
            supported_coins: vec![Coin::Btc, Coin::Eth],
            min_daily_roi: Some(dec!(0.5)),
            max_daily_roi: Some(dec!(1.5)),
            estimated_daily_earning: None,
            active: true,
            order,
        }
    }

    pub(crate) fn config() -> LedgerConfig {
        let mut config = LedgerConfig::default();
        config.intake_addresses = BTreeMap::from([
            (Coin::Usdt, "TQ-usdt-intake".to_string()),
            (Coin::Usdc, "0x-usdc-intake".to_string()),
            (Coin::Btc, "bc1-intake".to_string()),
        ]);
        config
    }

    pub(crate) fn build_with(verifier: MockTxVerifier) -> Fixture {
        build_from(config(), verifier)
    }

    pub(crate) fn build_from(config: LedgerConfig, verifier: MockTxVerifier) -> Fixture {
        let clock = SharedMockClock::new();
        let oracle = Arc::new(MockPriceOracle::new([
            (Coin::Btc, dec!(100)),
            (Coin::Eth, dec!(50)),
        ]));
        let notifier = Arc::new(RecordingNotifier::new());
        let catalog = Catalog::from_specs([
            tier("small", 1, dec!(100), Some(dec!(499))),
            tier("medium", 2, dec!(500), Some(dec!(800))),
            tier("large", 3, dec!(2000), None),
        ])
        .unwrap();
        let ledger = LedgerBuilder::new(config, oracle.clone())
            .clock(Arc::new(clock.clone()))
            .catalog(catalog)
            .verifier(Arc::new(verifier))
            .notifier(notifier.clone())
            .sampler(Arc::new(FixedRateSampler(dec!(1))))
            .build()
            .unwrap();
        Fixture {
            ledger,
            clock,
            oracle,
            notifier,
        }
    }

    pub(crate) fn build() -> Fixture {
        build_with(MockTxVerifier::new())
    }

    impl Fixture {
        pub fn open(&self, id: &str) -> AccountId {
            let id = AccountId::from(id);
            self.ledger.open_account(&id, None).unwrap();
            id
        }

        /// Seed a spendable balance directly.
        pub fn fund(&self, id: &AccountId, coin: Coin, amount: Decimal) {
            self.ledger
                .store
                .transact(|txn| txn.credit(id, BalanceMap::Spendable, &coin, amount))
                .unwrap();
        }

        pub fn spendable(&self, id: &AccountId, coin: &Coin) -> Decimal {
            self.ledger
                .get_account(id)
                .unwrap()
                .balance(BalanceMap::Spendable, coin)
        }

        pub fn reward(&self, id: &AccountId, coin: &Coin) -> Decimal {
            self.ledger
                .get_account(id)
                .unwrap()
                .balance(BalanceMap::Reward, coin)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixture;
    use super::*;
    use crate::error::{ErrorKind, StateConflict};
    use rust_decimal_macros::dec;

    #[test]
    fn test_open_account_is_idempotent_without_referrer() {
        let fx = fixture::build();
        let alice = fx.open("alice");
        fx.fund(&alice, Coin::Usdt, dec!(5));

        let again = fx.ledger.open_account(&alice, None).unwrap();
        assert_eq!(again.balance(crate::store::BalanceMap::Spendable, &Coin::Usdt), dec!(5));
        assert_eq!(
            fx.ledger
                .audit_for_entity(EntityKind::Account, &alice)
                .len(),
            1
        );
    }

    #[test]
    fn test_open_account_with_referrer_links_referral() {
        let fx = fixture::build();
        let alice = fx.open("alice");
        let bob = AccountId::from("bob");

        let account = fx.ledger.open_account(&bob, Some(&alice)).unwrap();
        assert!(account.referred_by.is_some());
        assert_eq!(fx.ledger.get_account(&alice).unwrap().referral.referred_count, 1);

        let err = fx.ledger.open_account(&bob, Some(&alice)).unwrap_err();
        assert_eq!(err.state_conflict(), Some(&StateConflict::Duplicate));
    }

    #[test]
    fn test_open_account_with_unknown_referrer_creates_nothing() {
        let fx = fixture::build();
        let err = fx
            .ledger
            .open_account(&"bob".into(), Some(&"ghost".into()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(fx.ledger.get_account(&"bob".into()).is_err());
    }

    #[test]
    fn test_tier_administration_requires_admin() {
        let fx = fixture::build();
        let spec = fixture::tier("promo", 9, dec!(50), Some(dec!(99)));

        let err = fx
            .ledger
            .upsert_tier(&Claims::user("alice"), spec.clone())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let admin = Claims::admin("ops");
        fx.ledger.upsert_tier(&admin, spec).unwrap();
        assert_eq!(fx.ledger.active_tiers().len(), 4);

        let tier = fx
            .ledger
            .set_tier_active(&admin, &"promo".into(), false)
            .unwrap();
        assert!(!tier.active);
        assert_eq!(fx.ledger.active_tiers().len(), 3);
        assert_eq!(
            fx.ledger
                .audit_by_actor(&Actor::Account("ops".into()))
                .len(),
            2
        );
    }

    #[test]
    fn test_set_active_unknown_tier() {
        let fx = fixture::build();
        let err = fx
            .ledger
            .set_tier_active(&Claims::admin("ops"), &"nope".into(), true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
