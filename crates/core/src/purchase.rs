//! Contract purchase: tier validation, multi-currency funding, contract open.
//!
//! Funding is planned against a [`PriceSnapshot`] resolved before the
//! transaction. Balances are valued in USD in [`DebitPriority`] order and
//! drained one currency at a time.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use serde_json::json;

use crate::accrual::Contract;
use crate::audit::{AuditAction, EntityKind, EntityRef};
use crate::auth::Actor;
use crate::catalog::{Tier, TierId};
use crate::currency::{checked_value, Coin, SpendableBalance};
use crate::deposit::Deposit;
use crate::error::{LedgerError, Result, StateConflict};
use crate::ledger::Ledger;
use crate::oracle::PriceSnapshot;
use crate::store::{Account, AccountId, BalanceMap, Record, Txn};

// =============================================================================
// Debit priority
// =============================================================================

/// Ordered list of spendable currencies a purchase drains, first to last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitPriority(Vec<Coin>);

impl DebitPriority {
    /// Rejects non-spendable currencies. Duplicates keep their first position.
    pub fn new(coins: impl IntoIterator<Item = Coin>) -> Result<Self> {
        let mut ordered: Vec<Coin> = Vec::new();
        for coin in coins {
            if !SpendableBalance::supports(&coin) {
                return Err(LedgerError::UnsupportedCurrency(coin));
            }
            if !ordered.contains(&coin) {
                ordered.push(coin);
            }
        }
        if ordered.is_empty() {
            return Err(LedgerError::InvalidAmount("debit priority is empty".into()));
        }
        Ok(Self(ordered))
    }

    pub fn coins(&self) -> &[Coin] {
        &self.0
    }

    /// The same order with `coin` moved to the front.
    pub fn with_first(&self, coin: &Coin) -> Self {
        let mut ordered = vec![coin.clone()];
        ordered.extend(self.0.iter().filter(|c| *c != coin).cloned());
        Self(ordered)
    }
}

// =============================================================================
// Funding plan
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FundingLeg {
    pub currency: Coin,
    pub amount: Decimal,
    pub usd: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FundingPlan {
    /// USD value of every balance in the priority list.
    pub total_usd: Decimal,
    /// USD actually taken: the sum of the legs.
    pub consumed_usd: Decimal,
    pub legs: Vec<FundingLeg>,
}

/// Decide how much of each currency to take for a tier band.
///
/// Consumes `min(total, max_usd)`. Stable legs are exact; other coins are
/// converted at the snapshot price and rounded down to 8 decimal places.
pub fn plan_funding(
    account: &Account,
    priority: &DebitPriority,
    prices: &PriceSnapshot,
    min_usd: Decimal,
    max_usd: Option<Decimal>,
) -> Result<FundingPlan> {
    let mut holdings = Vec::new();
    let mut total_usd = Decimal::ZERO;
    for coin in priority.coins() {
        let balance = account.balance(BalanceMap::Spendable, coin);
        if balance <= Decimal::ZERO {
            continue;
        }
        let price = prices.price(coin)?;
        let value = checked_value(balance, price)?;
        total_usd = total_usd.checked_add(value).ok_or_else(|| {
            LedgerError::InvalidAmount(format!("spendable value overflows at {coin}"))
        })?;
        holdings.push((coin, balance, price));
    }

    if total_usd < min_usd {
        return Err(LedgerError::InsufficientBalance {
            currency: "USD".to_string(),
            available: total_usd,
            requested: min_usd,
        });
    }

    let target = max_usd.map_or(total_usd, |max| total_usd.min(max));
    let mut remaining = target;
    let mut legs = Vec::new();
    for (coin, balance, price) in holdings {
        if remaining <= Decimal::ZERO {
            break;
        }
        let value = checked_value(balance, price)?;
        let (amount, usd) = if value <= remaining {
            (balance, value)
        } else {
            let amount =
                (remaining / price).round_dp_with_strategy(8, RoundingStrategy::ToZero);
            (amount, checked_value(amount, price)?)
        };
        if amount.is_zero() {
            continue;
        }
        remaining -= usd;
        legs.push(FundingLeg {
            currency: coin.clone(),
            amount,
            usd,
        });
    }

    let consumed_usd = legs.iter().map(|l| l.usd).sum();
    Ok(FundingPlan {
        total_usd,
        consumed_usd,
        legs,
    })
}

fn check_reward_coin(tier: &Tier, coin: &Coin) -> Result<()> {
    if !coin.is_mineable() || !tier.supports(coin) {
        return Err(LedgerError::UnsupportedCurrency(coin.clone()));
    }
    Ok(())
}

// =============================================================================
// Purchase paths
// =============================================================================

/// What opens a contract.
pub(crate) struct PurchaseOrder<'a> {
    pub owner: &'a AccountId,
    pub tier: &'a Tier,
    pub reward_coin: Coin,
    pub priority: &'a DebitPriority,
    pub prices: &'a PriceSnapshot,
    pub actor: Actor,
    pub deposit: Option<&'a Deposit>,
}

/// Transactional phase: debit the plan, fix the rate, open the contract.
pub(crate) fn open_contract(
    txn: &mut Txn<'_>,
    ledger: &Ledger,
    order: PurchaseOrder<'_>,
) -> Result<Contract> {
    let account = txn.account(order.owner)?;
    let plan = plan_funding(
        &account,
        order.priority,
        order.prices,
        order.tier.min_usd,
        order.tier.max_usd,
    )?;
    for leg in &plan.legs {
        txn.debit(order.owner, BalanceMap::Spendable, &leg.currency, leg.amount)?;
    }

    let rate = order
        .tier
        .rate
        .sample(plan.consumed_usd, ledger.sampler.as_ref())?;
    let contract = Contract::open(
        order.owner.clone(),
        order.tier,
        order.reward_coin,
        rate,
        plan.consumed_usd,
        order.deposit.map(|d| d.id),
        txn.now(),
    );

    txn.audit(
        order.actor,
        AuditAction::ContractOpened,
        EntityRef::new(EntityKind::Contract, contract.id),
        json!({
            "owner": order.owner,
            "tier": order.tier.id,
            "reward_coin": contract.reward_coin,
            "daily_rate": rate,
            "funding": plan,
            "deposit": order.deposit.map(|d| d.id),
        }),
    );
    txn.save(contract.clone());
    Ok(contract)
}

impl Ledger {
    /// User-initiated purchase of `tier_id`, funded from spendable balances.
    pub async fn purchase(
        &self,
        owner: &AccountId,
        tier_id: &TierId,
        reward_coin: Coin,
    ) -> Result<Contract> {
        let tier = self.tier(tier_id)?;
        if !tier.active {
            return Err(LedgerError::unexpected_status(
                "tier", tier_id, "active", "inactive",
            ));
        }
        check_reward_coin(&tier, &reward_coin)?;

        let prices = self.price_snapshot(self.priority.coins()).await;
        let contract = self.store.transact(|txn| {
            open_contract(
                txn,
                self,
                PurchaseOrder {
                    owner,
                    tier: &tier,
                    reward_coin,
                    priority: &self.priority,
                    prices: &prices,
                    actor: Actor::Account(owner.clone()),
                    deposit: None,
                },
            )
        })?;
        tracing::info!(
            contract_id = %contract.id,
            owner = %owner,
            tier = %tier.id,
            purchase_usd = %contract.purchase_usd,
            daily_rate = %contract.daily_rate,
            "Contract purchased"
        );
        Ok(contract)
    }

    /// Deposit-triggered purchase.
    ///
    /// Values the deposit in USD, matches a tier, defaults the reward coin and
    /// funds the contract with the deposited coin first. Links the contract
    /// back to the deposit in the same transaction.
    pub(crate) async fn purchase_for_deposit(
        &self,
        deposit: &Deposit,
        actor: Actor,
    ) -> Result<Contract> {
        let priority = self.priority.with_first(&deposit.currency);
        let prices = self.price_snapshot(priority.coins()).await;
        let usd = prices.usd_value(&deposit.currency, deposit.amount)?;

        let tier = self.catalog.read().match_for_usd(usd)?.clone();
        let reward_coin = tier
            .default_reward_coin(&deposit.currency)
            .ok_or_else(|| LedgerError::not_found("reward coin", &tier.id))?;

        let contract = self.store.transact(|txn| {
            let mut current: Deposit = txn.load(&deposit.id)?;
            if current.contract_id.is_some() {
                return Err(LedgerError::conflict(
                    Deposit::ENTITY,
                    deposit.id,
                    StateConflict::AlreadyProcessed,
                ));
            }
            let contract = open_contract(
                txn,
                self,
                PurchaseOrder {
                    owner: &deposit.owner,
                    tier: &tier,
                    reward_coin,
                    priority: &priority,
                    prices: &prices,
                    actor: actor.clone(),
                    deposit: Some(deposit),
                },
            )?;
            current.contract_id = Some(contract.id);
            txn.audit(
                actor,
                AuditAction::DepositMatched,
                EntityRef::new(EntityKind::Deposit, deposit.id),
                json!({ "contract": contract.id, "tier": tier.id, "deposit_usd": usd }),
            );
            txn.save(current);
            Ok(contract)
        })?;
        tracing::info!(
            deposit_id = %deposit.id,
            contract_id = %contract.id,
            tier = %tier.id,
            deposit_usd = %usd,
            "Deposit matched to contract"
        );
        Ok(contract)
    }
}
