//! Append-only audit trail.
//!
//! Entries are staged by [`crate::store::Txn::audit`] and land in the same
//! commit as the mutation they describe. Nothing updates or removes them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Actor;
use crate::store::AuditId;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    AccountOpened,
    DepositCreated,
    DepositApproved,
    DepositRejected,
    DepositNoteUpdated,
    DepositMatched,
    WithdrawalRequested,
    WithdrawalApproved,
    WithdrawalRejected,
    WithdrawalCompleted,
    WithdrawalFailed,
    ContractOpened,
    ContractAccrued,
    ContractCompleted,
    ContractPaused,
    ContractResumed,
    ReferralLinked,
    ReferralAwarded,
    ReferralCancelled,
    TierUpserted,
    TierActivationChanged,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    Deposit,
    Withdrawal,
    Contract,
    Referral,
    Tier,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Account => "account",
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::Contract => "contract",
            Self::Referral => "referral",
            Self::Tier => "tier",
        };
        f.write_str(s)
    }
}

/// The record an audit entry is about.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl ToString) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AuditEntry {
    pub id: AuditId,
    pub actor: Actor,
    pub action: AuditAction,
    pub entity: EntityRef,
    /// Free-form payload: amounts, notes, balances before/after.
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}
