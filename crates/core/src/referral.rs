//! Referral linking and one-time bonus award.
//!
//! A referral is created when a new account names its referrer. The bonus
//! amount and currency are captured at that moment; later changes to the
//! referral settings never reprice an existing referral.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditAction, EntityKind, EntityRef};
use crate::auth::{Actor, Claims};
use crate::config::ReferralSettings;
use crate::currency::Coin;
use crate::error::{LedgerError, Result, StateConflict};
use crate::ledger::Ledger;
use crate::notify::Notification;
use crate::store::{AccountId, BalanceMap, Record, ReferralId, Txn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Awarded,
    Cancelled,
}

impl std::fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Awarded => "awarded",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referral {
    pub id: ReferralId,
    pub referrer: AccountId,
    pub referred: AccountId,
    pub bonus_amount: Decimal,
    pub bonus_currency: Coin,
    pub status: ReferralStatus,
    pub created_at: DateTime<Utc>,
    pub awarded_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Referrals are owned by the referrer; the owner index answers
/// "who did I bring in".
impl Record for Referral {
    type Id = ReferralId;
    type Status = ReferralStatus;
    const ENTITY: &'static str = "referral";

    fn id(&self) -> ReferralId {
        self.id
    }

    fn owner(&self) -> &AccountId {
        &self.referrer
    }

    fn status(&self) -> ReferralStatus {
        self.status
    }
}

/// What fires an award.
#[derive(Debug, Clone, Copy)]
pub enum AwardTrigger<'a> {
    Admin(&'a Claims),
    /// External identity-verification signal for the referred account.
    IdentityVerified,
}

impl AwardTrigger<'_> {
    fn actor(&self) -> Result<Actor> {
        match self {
            Self::Admin(claims) => claims.require_admin(),
            Self::IdentityVerified => Ok(Actor::System),
        }
    }
}

/// Link `referred` to `referrer` inside an open transaction.
pub(crate) fn link(
    txn: &mut Txn<'_>,
    referrer: &AccountId,
    referred: &AccountId,
    settings: &ReferralSettings,
) -> Result<Referral> {
    if referrer == referred {
        return Err(LedgerError::conflict(
            Referral::ENTITY,
            referred,
            StateConflict::Duplicate,
        ));
    }
    if !txn.has_account(referrer) {
        return Err(LedgerError::not_found("account", referrer));
    }

    let referral = Referral {
        id: ReferralId::new(),
        referrer: referrer.clone(),
        referred: referred.clone(),
        bonus_amount: settings.bonus_amount,
        bonus_currency: settings.bonus_currency.clone(),
        status: ReferralStatus::Pending,
        created_at: txn.now(),
        awarded_at: None,
        cancelled_at: None,
    };
    txn.set_referred_by(referred, referral.id)?;
    txn.update_referral_stats(referrer, |stats| {
        stats.referred_count = stats.referred_count.saturating_add(1);
        Ok(())
    })?;
    txn.audit(
        Actor::Account(referred.clone()),
        AuditAction::ReferralLinked,
        EntityRef::new(EntityKind::Referral, referral.id),
        json!({
            "referrer": referrer,
            "referred": referred,
            "bonus_amount": referral.bonus_amount,
            "bonus_currency": referral.bonus_currency,
        }),
    );
    txn.save(referral.clone());
    Ok(referral)
}

fn require_pending(referral: &Referral) -> Result<()> {
    let conflict = match referral.status {
        ReferralStatus::Pending => return Ok(()),
        ReferralStatus::Awarded => StateConflict::AlreadyProcessed,
        ReferralStatus::Cancelled => StateConflict::AlreadyFinalized,
    };
    Err(LedgerError::conflict(Referral::ENTITY, referral.id, conflict))
}

impl Ledger {
    /// `pending → awarded`, crediting the captured bonus to the referrer.
    ///
    /// Fails with `AlreadyProcessed` on re-delivery, so a duplicated trigger
    /// never credits twice.
    pub fn award_referral(&self, id: &ReferralId, trigger: AwardTrigger<'_>) -> Result<Referral> {
        let actor = trigger.actor()?;
        let (referral, balance) = self.store.transact(|txn| {
            let mut referral: Referral = txn.load(id)?;
            require_pending(&referral)?;
            let balance = txn.credit(
                &referral.referrer,
                BalanceMap::Spendable,
                &referral.bonus_currency,
                referral.bonus_amount,
            )?;
            let bonus = referral.bonus_amount;
            txn.update_referral_stats(&referral.referrer, |stats| {
                stats.bonus_earned = stats.bonus_earned.checked_add(bonus).ok_or_else(|| {
                    LedgerError::InvalidAmount(format!(
                        "bonus {bonus} overflows earned total {}",
                        stats.bonus_earned
                    ))
                })?;
                Ok(())
            })?;
            referral.status = ReferralStatus::Awarded;
            referral.awarded_at = Some(txn.now());
            txn.audit(
                actor,
                AuditAction::ReferralAwarded,
                EntityRef::new(EntityKind::Referral, referral.id),
                json!({
                    "referrer": referral.referrer,
                    "bonus_amount": referral.bonus_amount,
                    "bonus_currency": referral.bonus_currency,
                    "balance_after": balance,
                }),
            );
            txn.save(referral.clone());
            Ok((referral, balance))
        })?;
        tracing::info!(
            referral_id = %referral.id,
            referrer = %referral.referrer,
            bonus = %referral.bonus_amount,
            currency = %referral.bonus_currency,
            %balance,
            "Referral bonus awarded"
        );
        self.notify(Notification::ReferralAwarded {
            account: referral.referrer.clone(),
            referral: referral.id,
            bonus: referral.bonus_amount,
            currency: referral.bonus_currency.clone(),
        });
        Ok(referral)
    }

    /// Award the referral that brought `referred` in.
    pub fn award_for_referred(
        &self,
        referred: &AccountId,
        trigger: AwardTrigger<'_>,
    ) -> Result<Referral> {
        let account = self.store.account(referred)?;
        let id = account
            .referred_by
            .ok_or_else(|| LedgerError::not_found(Referral::ENTITY, referred))?;
        self.award_referral(&id, trigger)
    }

    /// `pending → cancelled`. No balance effect.
    pub fn cancel_referral(&self, claims: &Claims, id: &ReferralId) -> Result<Referral> {
        let actor = claims.require_admin()?;
        let referral = self.store.transact(|txn| {
            let mut referral: Referral = txn.load(id)?;
            require_pending(&referral)?;
            referral.status = ReferralStatus::Cancelled;
            referral.cancelled_at = Some(txn.now());
            txn.audit(
                actor,
                AuditAction::ReferralCancelled,
                EntityRef::new(EntityKind::Referral, referral.id),
                json!({ "referrer": referral.referrer, "referred": referral.referred }),
            );
            txn.save(referral.clone());
            Ok(referral)
        })?;
        tracing::info!(referral_id = %id, cancelled_by = %claims.subject, "Referral cancelled");
        Ok(referral)
    }

    pub fn referral(&self, id: &ReferralId) -> Result<Referral> {
        self.store.get(id)
    }

    pub fn referrals_by_referrer(&self, referrer: &AccountId) -> Vec<Referral> {
        self.store.list_by_owner(referrer)
    }

    pub fn referrals_by_status(&self, status: ReferralStatus) -> Vec<Referral> {
        self.store.list_by_status(status)
    }
}
