#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use hashrent_ledger::catalog::{Catalog, FixedRateSampler, TierSpec};
use hashrent_ledger::clock::SharedMockClock;
use hashrent_ledger::currency::{Coin, CurrencyLedger};
use hashrent_ledger::notify::RecordingNotifier;
use hashrent_ledger::oracle::MockPriceOracle;
use hashrent_ledger::store::BalanceMap;
use hashrent_ledger::{AccountId, Ledger, LedgerBuilder, LedgerConfig};

pub struct Harness {
    pub ledger: Ledger,
    pub clock: SharedMockClock,
    pub oracle: Arc<MockPriceOracle>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn tier(id: &str, order: u32, min: Decimal, max: Option<Decimal>) -> TierSpec {
    TierSpec {
        id: id.into(),
        name: id.to_uppercase(),
        capacity: "50 TH/s".into(),
        duration_days: 30,
        min_usd: min,
        max_usd: max,
        display_price: None,
        supported_coins: vec![Coin::Btc, Coin::Eth],
        min_daily_roi: Some(dec!(0.8)),
        max_daily_roi: Some(dec!(1.2)),
        estimated_daily_earning: None,
        active: true,
        order,
    }
}

pub fn config() -> LedgerConfig {
    let mut config = LedgerConfig::default();
    config.intake_addresses = BTreeMap::from([
        (Coin::Usdt, "TQ-intake".to_string()),
        (Coin::Usdc, "0x-intake".to_string()),
        (Coin::Btc, "bc1-intake".to_string()),
    ]);
    config
}

/// Ledger over `tiers` with BTC at $100, ETH at $50 and a 1%/day rate.
pub fn harness(tiers: impl IntoIterator<Item = TierSpec>) -> Harness {
    let clock = SharedMockClock::new();
    let oracle = Arc::new(MockPriceOracle::new([
        (Coin::Btc, dec!(100)),
        (Coin::Eth, dec!(50)),
    ]));
    let notifier = Arc::new(RecordingNotifier::new());
    let ledger = LedgerBuilder::new(config(), oracle.clone())
        .clock(Arc::new(clock.clone()))
        .catalog(Catalog::from_specs(tiers).expect("valid catalog"))
        .notifier(notifier.clone())
        .sampler(Arc::new(FixedRateSampler(dec!(1))))
        .build()
        .expect("ledger builds");
    Harness {
        ledger,
        clock,
        oracle,
        notifier,
    }
}

pub fn default_harness() -> Harness {
    harness([
        tier("starter", 1, dec!(100), Some(dec!(499))),
        tier("pro", 2, dec!(500), Some(dec!(1000))),
    ])
}

impl Harness {
    pub fn open(&self, id: &str) -> AccountId {
        let id = AccountId::from(id);
        self.ledger.open_account(&id, None).expect("account opens");
        id
    }

    /// Seed a spendable balance without going through a deposit.
    pub fn fund(&self, id: &AccountId, coin: Coin, amount: Decimal) {
        self.ledger
            .store()
            .transact(|txn| txn.credit(id, BalanceMap::Spendable, &coin, amount))
            .expect("credit applies");
    }

    pub fn spendable(&self, id: &AccountId, coin: &Coin) -> Decimal {
        self.ledger.get_account(id).expect("account").spendable.get(coin)
    }

    pub fn reward(&self, id: &AccountId, coin: &Coin) -> Decimal {
        self.ledger.get_account(id).expect("account").rewards.get(coin)
    }

    /// Every non-zero field of both balance maps, for every account.
    pub fn all_balances(&self) -> Vec<(AccountId, Coin, Decimal)> {
        let mut out = Vec::new();
        for account in self.ledger.store().accounts() {
            for (coin, amount) in account
                .spendable
                .holdings()
                .into_iter()
                .chain(account.rewards.holdings())
            {
                out.push((account.id.clone(), coin, amount));
            }
        }
        out
    }
}
