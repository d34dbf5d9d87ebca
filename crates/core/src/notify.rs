//! Fire-and-forget notifications after terminal transitions.
//!
//! Notifications are sent after the transaction commits. A failing notifier
//! is logged and otherwise ignored; it never undoes ledger state.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::currency::Coin;
use crate::store::{AccountId, ContractId, DepositId, ReferralId, WithdrawalId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum Notification {
    DepositApproved {
        account: AccountId,
        deposit: DepositId,
        currency: Coin,
        amount: Decimal,
    },
    DepositRejected {
        account: AccountId,
        deposit: DepositId,
        note: Option<String>,
    },
    WithdrawalApproved {
        account: AccountId,
        withdrawal: WithdrawalId,
    },
    WithdrawalRejected {
        account: AccountId,
        withdrawal: WithdrawalId,
        refunded: Decimal,
        currency: Coin,
    },
    WithdrawalCompleted {
        account: AccountId,
        withdrawal: WithdrawalId,
        tx_ref: String,
    },
    WithdrawalFailed {
        account: AccountId,
        withdrawal: WithdrawalId,
        refunded: Decimal,
        currency: Coin,
    },
    ContractCompleted {
        account: AccountId,
        contract: ContractId,
        reward_coin: Coin,
        total_reward: Decimal,
    },
    ReferralAwarded {
        account: AccountId,
        referral: ReferralId,
        bonus: Decimal,
        currency: Coin,
    },
}

impl Notification {
    /// The account the notification is addressed to.
    pub fn recipient(&self) -> &AccountId {
        match self {
            Self::DepositApproved { account, .. }
            | Self::DepositRejected { account, .. }
            | Self::WithdrawalApproved { account, .. }
            | Self::WithdrawalRejected { account, .. }
            | Self::WithdrawalCompleted { account, .. }
            | Self::WithdrawalFailed { account, .. }
            | Self::ContractCompleted { account, .. }
            | Self::ReferralAwarded { account, .. } => account,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Send and log a failure at `warn`.
pub(crate) fn dispatch(notifier: &dyn Notifier, notification: Notification) {
    let recipient = notification.recipient().clone();
    if let Err(e) = notifier.notify(notification) {
        tracing::warn!(account = %recipient, error = %e, "Notification delivery failed");
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        tracing::info!(
            account = %notification.recipient(),
            event = ?notification,
            "Notification"
        );
        Ok(())
    }
}

/// Forwards notifications to a consumer task (mail, push).
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.tx.send(notification).map_err(|_| NotifyError::Closed)
    }
}

// =============================================================================
// Mock: RecordingNotifier (test / testing feature)
// =============================================================================

#[cfg(any(test, feature = "testing"))]
#[derive(Default)]
pub struct RecordingNotifier {
    sent: parking_lot::Mutex<Vec<Notification>>,
    pub should_fail: bool,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[cfg(any(test, feature = "testing"))]
impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        if self.should_fail {
            return Err(NotifyError::Other("mock failure".to_string()));
        }
        self.sent.lock().push(notification);
        Ok(())
    }
}
