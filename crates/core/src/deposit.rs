//! Deposit intake and adjudication.
//!
//! `pending → approved` credits the owner's spendable balance and then
//! attempts a deposit-triggered purchase. The purchase is a follow-on: if it
//! fails, the approval stands and the deposit stays "orphaned" (approved, no
//! contract) until an adjudicator re-matches it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::accrual::Contract;
use crate::audit::{AuditAction, EntityKind, EntityRef};
use crate::auth::{Actor, Claims};
use crate::currency::{Coin, SpendableBalance};
use crate::error::{LedgerError, Result, StateConflict};
use crate::ledger::Ledger;
use crate::notify::Notification;
use crate::store::{AccountId, BalanceMap, ContractId, DepositId, Record};
use crate::verifier::{VerificationAdvice, VerificationRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: DepositId,
    pub owner: AccountId,
    pub currency: Coin,
    pub amount: Decimal,
    /// Intake address at creation time; later rotation does not touch it.
    pub address: String,
    pub tx_ref: Option<String>,
    pub status: DepositStatus,
    pub admin_note: Option<String>,
    pub approved_by: Option<AccountId>,
    /// Contract opened by the follow-on purchase.
    pub contract_id: Option<ContractId>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Record for Deposit {
    type Id = DepositId;
    type Status = DepositStatus;
    const ENTITY: &'static str = "deposit";

    fn id(&self) -> DepositId {
        self.id
    }

    fn owner(&self) -> &AccountId {
        &self.owner
    }

    fn status(&self) -> DepositStatus {
        self.status
    }
}

impl Deposit {
    pub fn is_orphaned(&self) -> bool {
        self.status == DepositStatus::Approved && self.contract_id.is_none()
    }
}

/// What the owner submits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DepositRequest {
    pub currency: Coin,
    pub amount: Decimal,
    #[serde(default)]
    pub tx_ref: Option<String>,
}

/// Outcome of an approval: the credited deposit and, when the follow-on
/// purchase succeeded, the contract it opened.
#[derive(Debug, Clone)]
pub struct DepositApproval {
    pub deposit: Deposit,
    pub contract: Option<Contract>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn require_pending(deposit: &Deposit) -> Result<()> {
    if deposit.status != DepositStatus::Pending {
        return Err(LedgerError::conflict(
            Deposit::ENTITY,
            deposit.id,
            StateConflict::AlreadyProcessed,
        ));
    }
    Ok(())
}

impl Ledger {
    pub fn create_deposit(&self, owner: &AccountId, request: DepositRequest) -> Result<Deposit> {
        if request.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "deposit amount must be positive, got {}",
                request.amount
            )));
        }
        if !SpendableBalance::supports(&request.currency) {
            return Err(LedgerError::UnsupportedCurrency(request.currency));
        }
        let Some(address) = self.config.intake_addresses.get(&request.currency) else {
            return Err(LedgerError::UnsupportedCurrency(request.currency));
        };

        let deposit = self.store.transact(|txn| {
            txn.account(owner)?;
            let deposit = Deposit {
                id: DepositId::new(),
                owner: owner.clone(),
                currency: request.currency,
                amount: request.amount,
                address: address.clone(),
                tx_ref: non_empty(request.tx_ref),
                status: DepositStatus::Pending,
                admin_note: None,
                approved_by: None,
                contract_id: None,
                created_at: txn.now(),
                processed_at: None,
            };
            txn.audit(
                Actor::Account(owner.clone()),
                AuditAction::DepositCreated,
                EntityRef::new(EntityKind::Deposit, deposit.id),
                json!({
                    "currency": deposit.currency,
                    "amount": deposit.amount,
                    "address": deposit.address,
                    "tx_ref": deposit.tx_ref,
                }),
            );
            txn.save(deposit.clone());
            Ok(deposit)
        })?;
        tracing::info!(
            deposit_id = %deposit.id,
            owner = %owner,
            currency = %deposit.currency,
            amount = %deposit.amount,
            "Deposit created"
        );
        Ok(deposit)
    }

    /// Credit the deposit, then try to open a contract with it.
    ///
    /// A failed follow-on purchase is logged and leaves the approval in place.
    pub async fn approve_deposit(
        &self,
        claims: &Claims,
        id: &DepositId,
        note: Option<String>,
        tx_ref: Option<String>,
    ) -> Result<DepositApproval> {
        let actor = claims.require_admin()?;
        let deposit = self.store.transact(|txn| {
            let mut deposit: Deposit = txn.load(id)?;
            require_pending(&deposit)?;

            let balance = txn.credit(
                &deposit.owner,
                BalanceMap::Spendable,
                &deposit.currency,
                deposit.amount,
            )?;
            deposit.status = DepositStatus::Approved;
            deposit.approved_by = Some(claims.subject.clone());
            deposit.processed_at = Some(txn.now());
            if let Some(note) = non_empty(note) {
                deposit.admin_note = Some(note);
            }
            if let Some(tx_ref) = non_empty(tx_ref) {
                deposit.tx_ref = Some(tx_ref);
            }
            txn.audit(
                actor.clone(),
                AuditAction::DepositApproved,
                EntityRef::new(EntityKind::Deposit, deposit.id),
                json!({
                    "currency": deposit.currency,
                    "amount": deposit.amount,
                    "balance_after": balance,
                    "note": deposit.admin_note,
                }),
            );
            txn.save(deposit.clone());
            Ok(deposit)
        })?;
        tracing::info!(
            deposit_id = %deposit.id,
            owner = %deposit.owner,
            amount = %deposit.amount,
            currency = %deposit.currency,
            approved_by = %claims.subject,
            "Deposit approved"
        );
        self.notify(Notification::DepositApproved {
            account: deposit.owner.clone(),
            deposit: deposit.id,
            currency: deposit.currency.clone(),
            amount: deposit.amount,
        });

        let contract = match self.purchase_for_deposit(&deposit, actor).await {
            Ok(contract) => Some(contract),
            Err(e) => {
                tracing::warn!(
                    deposit_id = %deposit.id,
                    error = %e,
                    "Deposit credited but no contract opened"
                );
                None
            }
        };
        let deposit = match &contract {
            Some(_) => self.store.get(id)?,
            None => deposit,
        };
        Ok(DepositApproval { deposit, contract })
    }

    pub fn reject_deposit(
        &self,
        claims: &Claims,
        id: &DepositId,
        note: Option<String>,
    ) -> Result<Deposit> {
        let actor = claims.require_admin()?;
        let deposit = self.store.transact(|txn| {
            let mut deposit: Deposit = txn.load(id)?;
            require_pending(&deposit)?;
            deposit.status = DepositStatus::Rejected;
            deposit.processed_at = Some(txn.now());
            deposit.admin_note = non_empty(note);
            txn.audit(
                actor,
                AuditAction::DepositRejected,
                EntityRef::new(EntityKind::Deposit, deposit.id),
                json!({ "note": deposit.admin_note }),
            );
            txn.save(deposit.clone());
            Ok(deposit)
        })?;
        tracing::info!(deposit_id = %deposit.id, rejected_by = %claims.subject, "Deposit rejected");
        self.notify(Notification::DepositRejected {
            account: deposit.owner.clone(),
            deposit: deposit.id,
            note: deposit.admin_note.clone(),
        });
        Ok(deposit)
    }

    /// Ask the on-chain verifier about a deposit. Never changes state.
    pub async fn verify_deposit(&self, id: &DepositId) -> Result<VerificationAdvice> {
        let deposit: Deposit = self.store.get(id)?;
        let Some(tx_ref) = deposit.tx_ref.clone() else {
            return Ok(VerificationAdvice::NoReference);
        };
        let request = VerificationRequest {
            tx_ref,
            destination: deposit.address,
            currency: deposit.currency,
            amount: deposit.amount,
        };
        let advice = VerificationAdvice::from_outcome(self.verifier.verify(&request).await);
        tracing::debug!(deposit_id = %id, ?advice, "Deposit verification");
        Ok(advice)
    }

    /// Retry the follow-on purchase for an orphaned deposit.
    pub async fn rematch_deposit(&self, claims: &Claims, id: &DepositId) -> Result<Contract> {
        let actor = claims.require_admin()?;
        let deposit: Deposit = self.store.get(id)?;
        if deposit.status != DepositStatus::Approved {
            return Err(LedgerError::unexpected_status(
                Deposit::ENTITY,
                id,
                "approved",
                deposit.status,
            ));
        }
        if deposit.contract_id.is_some() {
            return Err(LedgerError::conflict(
                Deposit::ENTITY,
                id,
                StateConflict::AlreadyProcessed,
            ));
        }
        self.purchase_for_deposit(&deposit, actor).await
    }

    /// Approved deposits that never opened a contract.
    pub fn list_orphaned_deposits(&self) -> Vec<Deposit> {
        self.store
            .list_by_status::<Deposit>(DepositStatus::Approved)
            .into_iter()
            .filter(Deposit::is_orphaned)
            .collect()
    }

    /// Replace the admin note. Allowed in any status.
    pub fn update_deposit_note(
        &self,
        claims: &Claims,
        id: &DepositId,
        note: Option<String>,
    ) -> Result<Deposit> {
        let actor = claims.require_admin()?;
        self.store.transact(|txn| {
            let mut deposit: Deposit = txn.load(id)?;
            deposit.admin_note = non_empty(note);
            txn.audit(
                actor,
                AuditAction::DepositNoteUpdated,
                EntityRef::new(EntityKind::Deposit, deposit.id),
                json!({ "note": deposit.admin_note }),
            );
            txn.save(deposit.clone());
            Ok(deposit)
        })
    }

    pub fn deposit(&self, id: &DepositId) -> Result<Deposit> {
        self.store.get(id)
    }

    pub fn deposits_for(&self, owner: &AccountId) -> Vec<Deposit> {
        self.store.list_by_owner(owner)
    }

    pub fn deposits_by_status(&self, status: DepositStatus) -> Vec<Deposit> {
        self.store.list_by_status(status)
    }
}
