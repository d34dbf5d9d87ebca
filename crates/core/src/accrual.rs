//! Running contracts and the periodic accrual sweep.
//!
//! ## Delta credit
//!
//! Each sweep recomputes a contract's cumulative reward from absolute elapsed
//! time and credits only the difference from what is already stored. A
//! missed, late or repeated sweep therefore converges to the same balances.
//! The credited amount lands twice: once in the spendable map (so it can be
//! withdrawn) and once in the reward map (for reporting).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;

use crate::audit::{AuditAction, EntityKind, EntityRef};
use crate::auth::{Actor, Claims};
use crate::catalog::{Tier, TierId};
use crate::currency::{checked_value, Coin};
use crate::error::{LedgerError, Result, StateConflict};
use crate::ledger::Ledger;
use crate::notify::Notification;
use crate::store::{AccountId, BalanceMap, ContractId, DepositId, Record, Txn};

const MS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Paused,
    Completed,
}

impl std::fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub owner: AccountId,
    pub tier_id: TierId,
    pub reward_coin: Coin,
    pub capacity: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Daily rate in percent, fixed at open time.
    pub daily_rate: Decimal,
    /// USD value consumed from spendable balances to open the contract.
    pub purchase_usd: Decimal,
    /// Reward credited so far, in `reward_coin` units.
    pub cumulative_reward: Decimal,
    pub status: ContractStatus,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    /// Paused time before `end`, excluded from accrual.
    #[serde(default)]
    pub paused_ms: i64,
    #[serde(default)]
    pub deposit_id: Option<DepositId>,
    #[serde(default)]
    pub last_accrued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Record for Contract {
    type Id = ContractId;
    type Status = ContractStatus;
    const ENTITY: &'static str = "contract";

    fn id(&self) -> ContractId {
        self.id
    }

    fn owner(&self) -> &AccountId {
        &self.owner
    }

    fn status(&self) -> ContractStatus {
        self.status
    }
}

impl Contract {
    pub fn open(
        owner: AccountId,
        tier: &Tier,
        reward_coin: Coin,
        daily_rate: Decimal,
        purchase_usd: Decimal,
        deposit_id: Option<DepositId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ContractId::new(),
            owner,
            tier_id: tier.id.clone(),
            reward_coin,
            capacity: tier.capacity.clone(),
            start: now,
            end: now + tier.duration(),
            daily_rate,
            purchase_usd,
            cumulative_reward: Decimal::ZERO,
            status: ContractStatus::Active,
            paused_at: None,
            paused_ms: 0,
            deposit_id,
            last_accrued_at: None,
            completed_at: None,
        }
    }

    /// Accruing time up to `now`: capped at `end`, minus paused time.
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        let mut upto = now.min(self.end);
        if let Some(paused_at) = self.paused_at {
            upto = upto.min(paused_at);
        }
        let elapsed = upto - self.start - chrono::Duration::milliseconds(self.paused_ms);
        elapsed.max(chrono::Duration::zero())
    }

    /// Cumulative reward at `now` for a reward coin priced at `price` USD,
    /// rounded to 8 decimal places.
    pub fn reward_at(&self, now: DateTime<Utc>, price: Decimal) -> Result<Decimal> {
        if price <= Decimal::ZERO {
            return Ok(self.cumulative_reward);
        }
        let days = Decimal::from(self.elapsed(now).num_milliseconds()) / Decimal::from(MS_PER_DAY);
        let daily_usd = checked_value(self.purchase_usd, self.daily_rate)? / Decimal::ONE_HUNDRED;
        let usd = checked_value(daily_usd, days)?;
        usd.checked_div(price)
            .map(|r| r.round_dp(8))
            .ok_or_else(|| LedgerError::InvalidAmount(format!("{usd} at {price} is out of range")))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }
}

// =============================================================================
// Sweep
// =============================================================================

/// Totals from one accrual sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    /// Running contracts that received a credit.
    pub credited: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum AccrualOutcome {
    Credited,
    Completed(Contract),
    Skipped(&'static str),
}

/// Transactional phase for one contract, with its price already resolved.
fn accrue_one(
    txn: &mut Txn<'_>,
    id: &ContractId,
    price: Decimal,
    min_credit_delta: Decimal,
) -> Result<AccrualOutcome> {
    let now = txn.now();
    let mut contract: Contract = txn.load(id)?;
    if contract.status != ContractStatus::Active {
        return Ok(AccrualOutcome::Skipped("not active"));
    }

    let completing = contract.is_due(now);
    let target = contract.reward_at(now, price)?;
    let delta = target - contract.cumulative_reward;

    let credit = if completing {
        delta > Decimal::ZERO
    } else if delta < min_credit_delta {
        let reason = if delta < Decimal::ZERO {
            "negative delta"
        } else {
            "below threshold"
        };
        return Ok(AccrualOutcome::Skipped(reason));
    } else {
        true
    };

    if credit {
        let coin = contract.reward_coin.clone();
        txn.credit(&contract.owner, BalanceMap::Spendable, &coin, delta)?;
        txn.credit(&contract.owner, BalanceMap::Reward, &coin, delta)?;
        contract.cumulative_reward = target;
    }
    contract.last_accrued_at = Some(now);

    let entity = EntityRef::new(EntityKind::Contract, contract.id);
    let metadata = json!({
        "delta": if credit { delta } else { Decimal::ZERO },
        "cumulative_reward": contract.cumulative_reward,
        "reward_coin": contract.reward_coin,
        "price_usd": price,
    });

    if completing {
        contract.status = ContractStatus::Completed;
        contract.completed_at = Some(now);
        txn.audit(Actor::System, AuditAction::ContractCompleted, entity, metadata);
        txn.save(contract.clone());
        Ok(AccrualOutcome::Completed(contract))
    } else {
        txn.audit(Actor::System, AuditAction::ContractAccrued, entity, metadata);
        txn.save(contract);
        Ok(AccrualOutcome::Credited)
    }
}

impl Ledger {
    /// Recompute every active contract once.
    ///
    /// Prices for all reward coins are fetched up front; each contract is
    /// then settled in its own transaction, so one failure does not hold back
    /// the rest.
    pub async fn sweep(&self) -> SweepReport {
        let active = self
            .store
            .list_by_status::<Contract>(ContractStatus::Active);
        let mut report = SweepReport {
            examined: active.len(),
            ..SweepReport::default()
        };
        if active.is_empty() {
            return report;
        }

        let coins: Vec<Coin> = active.iter().map(|c| c.reward_coin.clone()).collect();
        let prices = self.price_snapshot(&coins).await;
        let min_delta = self.config.accrual.min_credit_delta;

        for contract in active {
            let price = match prices.price(&contract.reward_coin) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(contract_id = %contract.id, error = %e, "Accrual skipped, no price");
                    report.failed += 1;
                    continue;
                }
            };
            match self
                .store
                .transact(|txn| accrue_one(txn, &contract.id, price, min_delta))
            {
                Ok(AccrualOutcome::Credited) => report.credited += 1,
                Ok(AccrualOutcome::Completed(done)) => {
                    report.completed += 1;
                    tracing::info!(
                        contract_id = %done.id,
                        owner = %done.owner,
                        total_reward = %done.cumulative_reward,
                        reward_coin = %done.reward_coin,
                        "Contract completed"
                    );
                    self.notify(Notification::ContractCompleted {
                        account: done.owner.clone(),
                        contract: done.id,
                        reward_coin: done.reward_coin.clone(),
                        total_reward: done.cumulative_reward,
                    });
                }
                Ok(AccrualOutcome::Skipped(reason)) => {
                    tracing::debug!(contract_id = %contract.id, reason, "Accrual skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(contract_id = %contract.id, error = %e, "Accrual failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    // =========================================================================
    // Adjudicator pause / resume
    // =========================================================================

    /// Freeze accrual. Consumed funding is not refunded.
    pub fn pause_contract(&self, claims: &Claims, id: &ContractId) -> Result<Contract> {
        let actor = claims.require_admin()?;
        let contract = self.store.transact(|txn| {
            let mut contract: Contract = txn.load(id)?;
            match contract.status {
                ContractStatus::Active => {}
                ContractStatus::Completed => {
                    return Err(LedgerError::conflict(
                        Contract::ENTITY,
                        id,
                        StateConflict::AlreadyFinalized,
                    ))
                }
                other => {
                    return Err(LedgerError::unexpected_status(
                        Contract::ENTITY,
                        id,
                        "active",
                        other,
                    ))
                }
            }
            let now = txn.now();
            contract.status = ContractStatus::Paused;
            contract.paused_at = Some(now);
            txn.audit(
                actor,
                AuditAction::ContractPaused,
                EntityRef::new(EntityKind::Contract, id),
                json!({ "cumulative_reward": contract.cumulative_reward }),
            );
            txn.save(contract.clone());
            Ok(contract)
        })?;
        tracing::info!(contract_id = %id, "Contract paused");
        Ok(contract)
    }

    pub fn resume_contract(&self, claims: &Claims, id: &ContractId) -> Result<Contract> {
        let actor = claims.require_admin()?;
        let contract = self.store.transact(|txn| {
            let mut contract: Contract = txn.load(id)?;
            let paused_at = match (contract.status, contract.paused_at) {
                (ContractStatus::Paused, Some(at)) => at,
                (ContractStatus::Completed, _) => {
                    return Err(LedgerError::conflict(
                        Contract::ENTITY,
                        id,
                        StateConflict::AlreadyFinalized,
                    ))
                }
                (other, _) => {
                    return Err(LedgerError::unexpected_status(
                        Contract::ENTITY,
                        id,
                        "paused",
                        other,
                    ))
                }
            };
            let now = txn.now();
            // Only the part of the pause that fell inside the term counts.
            let paused = now.min(contract.end) - paused_at.min(contract.end);
            contract.paused_ms += paused.num_milliseconds().max(0);
            contract.paused_at = None;
            contract.status = ContractStatus::Active;
            txn.audit(
                actor,
                AuditAction::ContractResumed,
                EntityRef::new(EntityKind::Contract, id),
                json!({ "paused_ms": contract.paused_ms }),
            );
            txn.save(contract.clone());
            Ok(contract)
        })?;
        tracing::info!(contract_id = %id, paused_ms = contract.paused_ms, "Contract resumed");
        Ok(contract)
    }

    pub fn contract(&self, id: &ContractId) -> Result<Contract> {
        self.store.get(id)
    }

    pub fn contracts_for(&self, owner: &AccountId) -> Vec<Contract> {
        self.store.list_by_owner(owner)
    }

    pub fn contracts_by_status(&self, status: ContractStatus) -> Vec<Contract> {
        self.store.list_by_status(status)
    }
}

// =============================================================================
// AccrualWorker
// =============================================================================

/// Background task driving [`Ledger::sweep`] on a fixed interval.
pub struct AccrualWorker {
    ledger: Arc<Ledger>,
    interval: Duration,
    snapshot_path: Option<PathBuf>,
}

impl AccrualWorker {
    pub fn new(ledger: Arc<Ledger>, interval: Duration) -> Self {
        Self {
            ledger,
            interval,
            snapshot_path: None,
        }
    }

    /// Save a store snapshot after every sweep.
    pub fn with_snapshot(mut self, path: PathBuf) -> Self {
        self.snapshot_path = Some(path);
        self
    }

    /// Run one sweep, then persist if configured.
    pub async fn tick(&self) -> SweepReport {
        let report = self.ledger.sweep().await;
        tracing::info!(
            examined = report.examined,
            credited = report.credited,
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            "Accrual sweep finished"
        );
        if let Some(path) = &self.snapshot_path {
            if let Err(e) = self.ledger.save_snapshot(path) {
                tracing::warn!(path = %path.display(), error = %e, "Snapshot after sweep failed");
            }
        }
        report
    }

    /// Sweep on every interval tick until `shutdown` flips to `true` or its
    /// sender is dropped. The first sweep runs immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Accrual worker started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Accrual worker stopped");
    }
}
