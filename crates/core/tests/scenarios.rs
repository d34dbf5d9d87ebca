//! End-to-end flows through the public `Ledger` API.

mod common;

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use testresult::TestResult;

use common::{default_harness, harness, tier};
use hashrent_ledger::audit::{AuditAction, EntityKind};
use hashrent_ledger::currency::CurrencyLedger;
use hashrent_ledger::notify::{Notification, RecordingNotifier};
use hashrent_ledger::{
    AwardTrigger, Claims, Coin, ContractStatus, DepositRequest, DepositStatus, LedgerBuilder,
    LedgerError, Store, WithdrawalRequest, WithdrawalStatus,
};

fn usdt_deposit(amount: Decimal) -> DepositRequest {
    DepositRequest {
        currency: Coin::Usdt,
        amount,
        tx_ref: Some("0xabc".into()),
    }
}

#[test_log::test(tokio::test)]
async fn deposit_approval_opens_contract_in_band() -> TestResult {
    let h = default_harness();
    let admin = Claims::admin("ops");
    let alice = h.open("alice");
    assert!(h.all_balances().is_empty());

    let deposit = h.ledger.create_deposit(&alice, usdt_deposit(dec!(1000)))?;
    let approval = h
        .ledger
        .approve_deposit(&admin, &deposit.id, None, None)
        .await?;

    let contract = approval.contract.ok_or("no contract opened")?;
    assert_eq!(contract.tier_id.as_str(), "pro");
    assert_eq!(contract.purchase_usd, dec!(1000));
    assert_eq!(contract.reward_coin, Coin::Btc);
    assert_eq!(approval.deposit.status, DepositStatus::Approved);
    assert_eq!(approval.deposit.contract_id, Some(contract.id));
    assert_eq!(h.spendable(&alice, &Coin::Usdt), Decimal::ZERO);

    let trail: Vec<AuditAction> = h
        .ledger
        .audit_for_entity(EntityKind::Deposit, deposit.id)
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        trail,
        [
            AuditAction::DepositCreated,
            AuditAction::DepositApproved,
            AuditAction::DepositMatched
        ]
    );
    Ok(())
}

#[tokio::test]
async fn approval_that_would_overflow_balance_is_refused() -> TestResult {
    let h = default_harness();
    let admin = Claims::admin("ops");
    let alice = h.open("alice");
    let huge = Decimal::from_i128_with_scale(5 * 10_i128.pow(28), 0);

    let first = h.ledger.create_deposit(&alice, usdt_deposit(huge))?;
    h.ledger.approve_deposit(&admin, &first.id, None, None).await?;
    let before = h.ledger.get_account(&alice)?;

    let second = h.ledger.create_deposit(&alice, usdt_deposit(huge))?;
    let err = h
        .ledger
        .approve_deposit(&admin, &second.id, None, None)
        .await
        .expect_err("credit past the decimal range");
    assert!(matches!(err, LedgerError::InvalidAmount(_)));
    assert_eq!(h.ledger.get_account(&alice)?, before);
    assert_eq!(h.ledger.deposit(&second.id)?.status, DepositStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn failing_notifier_does_not_undo_approval() -> TestResult {
    let h = default_harness();
    let notifier = Arc::new(RecordingNotifier::failing());
    let ledger = LedgerBuilder::new(common::config(), h.oracle.clone())
        .clock(Arc::new(h.clock.clone()))
        .notifier(notifier.clone())
        .build()?;
    let admin = Claims::admin("ops");
    let alice = "alice".into();
    ledger.open_account(&alice, None)?;

    let deposit = ledger.create_deposit(&alice, usdt_deposit(dec!(40)))?;
    let approval = ledger.approve_deposit(&admin, &deposit.id, None, None).await?;

    assert_eq!(approval.deposit.status, DepositStatus::Approved);
    assert_eq!(
        ledger.get_account(&alice)?.spendable.get(&Coin::Usdt),
        dec!(40)
    );
    let trail: Vec<AuditAction> = ledger
        .audit_for_entity(EntityKind::Deposit, deposit.id)
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        trail,
        [AuditAction::DepositCreated, AuditAction::DepositApproved]
    );
    assert!(notifier.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn deposit_above_every_band_leaves_remainder() -> TestResult {
    let h = harness([tier("basic", 1, dec!(100), Some(dec!(800)))]);
    let admin = Claims::admin("ops");
    let alice = h.open("alice");

    let deposit = h.ledger.create_deposit(&alice, usdt_deposit(dec!(1000)))?;
    let approval = h
        .ledger
        .approve_deposit(&admin, &deposit.id, None, None)
        .await?;

    let contract = approval.contract.ok_or("no contract opened")?;
    assert_eq!(contract.tier_id.as_str(), "basic");
    assert_eq!(contract.purchase_usd, dec!(800));
    assert_eq!(h.spendable(&alice, &Coin::Usdt), dec!(200));
    Ok(())
}

#[test]
fn failed_withdrawal_restores_balance() -> TestResult {
    let h = default_harness();
    let admin = Claims::admin("ops");
    let alice = h.open("alice");
    h.fund(&alice, Coin::Usdt, dec!(30));

    let w = h.ledger.request_withdrawal(
        &alice,
        WithdrawalRequest {
            currency: Coin::Usdt,
            amount: dec!(30),
            destination: "TQ-destination".into(),
            note: Some("rent money".into()),
        },
    )?;
    assert_eq!(w.fee, dec!(10));
    assert_eq!(w.net_amount, dec!(20));
    assert_eq!(h.spendable(&alice, &Coin::Usdt), Decimal::ZERO);

    let failed = h
        .ledger
        .fail_withdrawal(&admin, &w.id, Some("payout bounced".into()))?;
    assert_eq!(failed.status, WithdrawalStatus::Failed);
    assert_eq!(h.spendable(&alice, &Coin::Usdt), dec!(30));
    assert!(matches!(
        h.notifier.sent().last(),
        Some(Notification::WithdrawalFailed { refunded, .. }) if *refunded == dec!(30)
    ));
    Ok(())
}

#[tokio::test]
async fn one_day_of_accrual_credits_reward_coin() -> TestResult {
    let h = default_harness();
    let alice = h.open("alice");
    h.fund(&alice, Coin::Usdt, dec!(1000));

    let contract = h.ledger.purchase(&alice, &"pro".into(), Coin::Btc).await?;
    assert_eq!(contract.daily_rate, dec!(1));
    assert_eq!(contract.purchase_usd, dec!(1000));

    h.clock.advance_time(chrono::Duration::days(1));
    let report = h.ledger.sweep().await;
    assert_eq!(report.credited, 1);

    assert_eq!(h.spendable(&alice, &Coin::Btc), dec!(0.1));
    assert_eq!(h.reward(&alice, &Coin::Btc), dec!(0.1));
    assert_eq!(h.ledger.contract(&contract.id)?.cumulative_reward, dec!(0.1));
    Ok(())
}

#[tokio::test]
async fn contract_runs_to_completion() -> TestResult {
    let h = default_harness();
    let alice = h.open("alice");
    h.fund(&alice, Coin::Usdt, dec!(1000));
    let contract = h.ledger.purchase(&alice, &"pro".into(), Coin::Btc).await?;

    h.clock.advance_time(chrono::Duration::days(1));
    h.ledger.sweep().await;
    h.clock.advance_time(chrono::Duration::days(45));
    let report = h.ledger.sweep().await;
    assert_eq!(report.completed, 1);

    let done = h.ledger.contract(&contract.id)?;
    assert_eq!(done.status, ContractStatus::Completed);
    assert_eq!(done.cumulative_reward, dec!(3));
    assert_eq!(h.spendable(&alice, &Coin::Btc), dec!(3));
    assert!(matches!(
        h.notifier.sent().last(),
        Some(Notification::ContractCompleted { total_reward, .. }) if *total_reward == dec!(3)
    ));

    // Rewards are withdrawable once mirrored into spendable balance.
    let w = h.ledger.request_withdrawal(
        &alice,
        WithdrawalRequest {
            currency: Coin::Btc,
            amount: dec!(3),
            destination: "bc1-payout".into(),
            note: None,
        },
    )?;
    assert_eq!(w.fee, dec!(0.03));
    assert_eq!(h.spendable(&alice, &Coin::Btc), Decimal::ZERO);
    assert_eq!(h.reward(&alice, &Coin::Btc), dec!(3));
    Ok(())
}

#[test]
fn referral_bonus_paid_on_identity_verification() -> TestResult {
    let h = default_harness();
    let alice = h.open("alice");
    let bob = "bob".into();
    h.ledger.open_account(&bob, Some(&alice))?;

    h.ledger
        .award_for_referred(&bob, AwardTrigger::IdentityVerified)?;
    assert!(h
        .ledger
        .award_for_referred(&bob, AwardTrigger::IdentityVerified)
        .is_err());

    let account = h.ledger.get_account(&alice)?;
    assert_eq!(account.referral.referred_count, 1);
    assert_eq!(account.referral.bonus_earned, dec!(10));
    assert_eq!(h.spendable(&alice, &Coin::Usdt), dec!(10));
    Ok(())
}

#[tokio::test]
async fn snapshot_restores_ledger_state() -> TestResult {
    let h = default_harness();
    let admin = Claims::admin("ops");
    let alice = h.open("alice");
    h.fund(&alice, Coin::Usdt, dec!(1000));
    let contract = h.ledger.purchase(&alice, &"pro".into(), Coin::Eth).await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ledger.json");
    h.ledger.save_snapshot(&path)?;

    let store = Store::load_snapshot(&path, Arc::new(h.clock.clone()))?;
    let restored = LedgerBuilder::new(common::config(), h.oracle.clone())
        .store(store)
        .build()?;
    assert_eq!(restored.get_account(&alice)?, h.ledger.get_account(&alice)?);
    assert_eq!(restored.contract(&contract.id)?, contract);
    assert_eq!(
        restored.audit_by_actor(&hashrent_ledger::Actor::Account(alice.clone())),
        h.ledger
            .audit_by_actor(&hashrent_ledger::Actor::Account(alice.clone()))
    );

    // The restored ledger keeps working against the same records.
    assert!(restored
        .pause_contract(&admin, &contract.id)
        .is_ok());
    Ok(())
}
