//! Withdrawal requests and payout adjudication.
//!
//! The full requested amount is debited when the request is created, so
//! in-flight requests cannot spend the same funds twice. `rejected` and
//! `failed` refund that reservation in full; `completed` has no balance effect.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditAction, EntityKind, EntityRef};
use crate::auth::{Actor, Claims};
use crate::config::FeeRule;
use crate::currency::{Coin, SpendableBalance};
use crate::error::{LedgerError, Result, StateConflict};
use crate::ledger::Ledger;
use crate::notify::Notification;
use crate::store::{AccountId, BalanceMap, Record, Txn, WithdrawalId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: WithdrawalId,
    pub owner: AccountId,
    pub currency: Coin,
    /// Reserved from spendable balance at creation.
    pub amount: Decimal,
    pub fee: Decimal,
    /// `amount - fee`, what the destination receives.
    pub net_amount: Decimal,
    pub destination: String,
    pub status: WithdrawalStatus,
    pub tx_ref: Option<String>,
    pub user_note: Option<String>,
    pub admin_note: Option<String>,
    pub processed_by: Option<AccountId>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Record for Withdrawal {
    type Id = WithdrawalId;
    type Status = WithdrawalStatus;
    const ENTITY: &'static str = "withdrawal";

    fn id(&self) -> WithdrawalId {
        self.id
    }

    fn owner(&self) -> &AccountId {
        &self.owner
    }

    fn status(&self) -> WithdrawalStatus {
        self.status
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WithdrawalRequest {
    pub currency: Coin,
    pub amount: Decimal,
    pub destination: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// Per-currency network fee rules.
#[derive(Debug, Clone, Default)]
pub struct FeePolicy {
    rules: BTreeMap<Coin, FeeRule>,
}

impl FeePolicy {
    pub fn new(rules: BTreeMap<Coin, FeeRule>) -> Self {
        Self { rules }
    }

    pub fn fee_for(&self, coin: &Coin, amount: Decimal) -> Result<Decimal> {
        self.rules
            .get(coin)
            .ok_or_else(|| LedgerError::UnsupportedCurrency(coin.clone()))?
            .fee_for(amount)
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Terminal records refuse everything; otherwise the status must be one of
/// `allowed`.
fn guard(
    withdrawal: &Withdrawal,
    allowed: &[WithdrawalStatus],
    expected: &'static str,
) -> Result<()> {
    if withdrawal.status.is_terminal() {
        return Err(LedgerError::conflict(
            Withdrawal::ENTITY,
            withdrawal.id,
            StateConflict::AlreadyFinalized,
        ));
    }
    if !allowed.contains(&withdrawal.status) {
        return Err(LedgerError::unexpected_status(
            Withdrawal::ENTITY,
            withdrawal.id,
            expected,
            withdrawal.status,
        ));
    }
    Ok(())
}

/// Refund the reservation and close the record as `status`.
fn refund(
    txn: &mut Txn<'_>,
    withdrawal: &mut Withdrawal,
    status: WithdrawalStatus,
    actor: Actor,
    processed_by: &AccountId,
    note: Option<String>,
) -> Result<Decimal> {
    let balance = txn.credit(
        &withdrawal.owner,
        BalanceMap::Spendable,
        &withdrawal.currency,
        withdrawal.amount,
    )?;
    withdrawal.status = status;
    withdrawal.processed_by = Some(processed_by.clone());
    withdrawal.processed_at = Some(txn.now());
    if let Some(note) = non_empty(note) {
        withdrawal.admin_note = Some(note);
    }
    let action = match status {
        WithdrawalStatus::Rejected => AuditAction::WithdrawalRejected,
        _ => AuditAction::WithdrawalFailed,
    };
    txn.audit(
        actor,
        action,
        EntityRef::new(EntityKind::Withdrawal, withdrawal.id),
        json!({
            "refunded": withdrawal.amount,
            "currency": withdrawal.currency,
            "balance_after": balance,
            "note": withdrawal.admin_note,
        }),
    );
    txn.save(withdrawal.clone());
    Ok(balance)
}

impl Ledger {
    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy::new(self.config.fees.clone())
    }

    /// Create a request and reserve the full amount.
    pub fn request_withdrawal(
        &self,
        owner: &AccountId,
        request: WithdrawalRequest,
    ) -> Result<Withdrawal> {
        if request.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "withdrawal amount must be positive, got {}",
                request.amount
            )));
        }
        if !SpendableBalance::supports(&request.currency) {
            return Err(LedgerError::UnsupportedCurrency(request.currency));
        }
        let destination = request.destination.trim().to_string();
        if destination.is_empty() {
            return Err(LedgerError::InvalidAmount("destination address is empty".into()));
        }
        let fee = self.fee_policy().fee_for(&request.currency, request.amount)?;
        if fee >= request.amount {
            return Err(LedgerError::InvalidAmount(format!(
                "fee {fee} leaves nothing of {} {}",
                request.amount, request.currency
            )));
        }

        let withdrawal = self.store.transact(|txn| {
            let balance =
                txn.debit(owner, BalanceMap::Spendable, &request.currency, request.amount)?;
            let withdrawal = Withdrawal {
                id: WithdrawalId::new(),
                owner: owner.clone(),
                currency: request.currency,
                amount: request.amount,
                fee,
                net_amount: request.amount - fee,
                destination,
                status: WithdrawalStatus::Pending,
                tx_ref: None,
                user_note: non_empty(request.note),
                admin_note: None,
                processed_by: None,
                created_at: txn.now(),
                processed_at: None,
            };
            txn.audit(
                Actor::Account(owner.clone()),
                AuditAction::WithdrawalRequested,
                EntityRef::new(EntityKind::Withdrawal, withdrawal.id),
                json!({
                    "currency": withdrawal.currency,
                    "amount": withdrawal.amount,
                    "fee": withdrawal.fee,
                    "net_amount": withdrawal.net_amount,
                    "destination": withdrawal.destination,
                    "balance_after": balance,
                }),
            );
            txn.save(withdrawal.clone());
            Ok(withdrawal)
        })?;
        tracing::info!(
            withdrawal_id = %withdrawal.id,
            owner = %owner,
            currency = %withdrawal.currency,
            amount = %withdrawal.amount,
            fee = %withdrawal.fee,
            "Withdrawal requested"
        );
        Ok(withdrawal)
    }

    /// `pending → approved`. Unlocks execution, no balance effect.
    pub fn approve_withdrawal(
        &self,
        claims: &Claims,
        id: &WithdrawalId,
        note: Option<String>,
    ) -> Result<Withdrawal> {
        let actor = claims.require_admin()?;
        let withdrawal = self.store.transact(|txn| {
            let mut w: Withdrawal = txn.load(id)?;
            guard(&w, &[WithdrawalStatus::Pending], "pending")?;
            w.status = WithdrawalStatus::Approved;
            w.processed_by = Some(claims.subject.clone());
            if let Some(note) = non_empty(note) {
                w.admin_note = Some(note);
            }
            txn.audit(
                actor,
                AuditAction::WithdrawalApproved,
                EntityRef::new(EntityKind::Withdrawal, w.id),
                json!({ "note": w.admin_note }),
            );
            txn.save(w.clone());
            Ok(w)
        })?;
        tracing::info!(withdrawal_id = %id, approved_by = %claims.subject, "Withdrawal approved");
        self.notify(Notification::WithdrawalApproved {
            account: withdrawal.owner.clone(),
            withdrawal: withdrawal.id,
        });
        Ok(withdrawal)
    }

    /// `pending → rejected`, refunding the reservation.
    pub fn reject_withdrawal(
        &self,
        claims: &Claims,
        id: &WithdrawalId,
        note: Option<String>,
    ) -> Result<Withdrawal> {
        let actor = claims.require_admin()?;
        let withdrawal = self.store.transact(|txn| {
            let mut w: Withdrawal = txn.load(id)?;
            guard(&w, &[WithdrawalStatus::Pending], "pending")?;
            refund(txn, &mut w, WithdrawalStatus::Rejected, actor, &claims.subject, note)?;
            Ok(w)
        })?;
        tracing::info!(
            withdrawal_id = %id,
            refunded = %withdrawal.amount,
            currency = %withdrawal.currency,
            "Withdrawal rejected"
        );
        self.notify(Notification::WithdrawalRejected {
            account: withdrawal.owner.clone(),
            withdrawal: withdrawal.id,
            refunded: withdrawal.amount,
            currency: withdrawal.currency.clone(),
        });
        Ok(withdrawal)
    }

    /// `pending | approved → failed`, refunding the reservation.
    pub fn fail_withdrawal(
        &self,
        claims: &Claims,
        id: &WithdrawalId,
        note: Option<String>,
    ) -> Result<Withdrawal> {
        let actor = claims.require_admin()?;
        let withdrawal = self.store.transact(|txn| {
            let mut w: Withdrawal = txn.load(id)?;
            guard(
                &w,
                &[WithdrawalStatus::Pending, WithdrawalStatus::Approved],
                "pending or approved",
            )?;
            refund(txn, &mut w, WithdrawalStatus::Failed, actor, &claims.subject, note)?;
            Ok(w)
        })?;
        tracing::info!(
            withdrawal_id = %id,
            refunded = %withdrawal.amount,
            currency = %withdrawal.currency,
            "Withdrawal failed"
        );
        self.notify(Notification::WithdrawalFailed {
            account: withdrawal.owner.clone(),
            withdrawal: withdrawal.id,
            refunded: withdrawal.amount,
            currency: withdrawal.currency.clone(),
        });
        Ok(withdrawal)
    }

    /// `approved → completed`. Records the payout transaction.
    pub fn complete_withdrawal(
        &self,
        claims: &Claims,
        id: &WithdrawalId,
        tx_ref: &str,
        note: Option<String>,
    ) -> Result<Withdrawal> {
        let actor = claims.require_admin()?;
        let tx_ref = tx_ref.trim();
        if tx_ref.is_empty() {
            return Err(LedgerError::InvalidAmount(
                "completion needs a transaction reference".into(),
            ));
        }
        let withdrawal = self.store.transact(|txn| {
            let mut w: Withdrawal = txn.load(id)?;
            guard(&w, &[WithdrawalStatus::Approved], "approved")?;
            w.status = WithdrawalStatus::Completed;
            w.tx_ref = Some(tx_ref.to_string());
            w.processed_by = Some(claims.subject.clone());
            w.processed_at = Some(txn.now());
            if let Some(note) = non_empty(note) {
                w.admin_note = Some(note);
            }
            txn.audit(
                actor,
                AuditAction::WithdrawalCompleted,
                EntityRef::new(EntityKind::Withdrawal, w.id),
                json!({ "tx_ref": tx_ref, "net_amount": w.net_amount }),
            );
            txn.save(w.clone());
            Ok(w)
        })?;
        tracing::info!(withdrawal_id = %id, tx_ref, "Withdrawal completed");
        self.notify(Notification::WithdrawalCompleted {
            account: withdrawal.owner.clone(),
            withdrawal: withdrawal.id,
            tx_ref: tx_ref.to_string(),
        });
        Ok(withdrawal)
    }

    pub fn withdrawal(&self, id: &WithdrawalId) -> Result<Withdrawal> {
        self.store.get(id)
    }

    pub fn withdrawals_for(&self, owner: &AccountId) -> Vec<Withdrawal> {
        self.store.list_by_owner(owner)
    }

    pub fn withdrawals_by_status(&self, status: WithdrawalStatus) -> Vec<Withdrawal> {
        self.store.list_by_status(status)
    }
}
