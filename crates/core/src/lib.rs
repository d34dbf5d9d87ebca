//! Hashrent ledger: multi-currency balances, deposit intake, withdrawal
//! payout, contract purchase with reward accrual, and referral bonuses.
//!
//! Every balance mutation runs inside a [`store::Store`] transaction that
//! also appends the matching [`audit::AuditEntry`], so the audit trail alone
//! reconstructs how each balance came to be. [`Ledger`] wires the store to
//! its collaborators (price oracle, tx verifier, notifier, tier catalog) and
//! exposes the state machines as methods.

pub mod accrual;
pub mod audit;
pub mod auth;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod currency;
pub mod deposit;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod oracle;
pub mod purchase;
pub mod referral;
pub mod store;
pub mod verifier;
pub mod withdrawal;

pub use accrual::{AccrualWorker, Contract, ContractStatus, SweepReport};
pub use auth::{Actor, Claims, Role};
pub use catalog::{Catalog, Tier, TierId, TierSpec};
pub use config::LedgerConfig;
pub use currency::Coin;
pub use deposit::{Deposit, DepositApproval, DepositRequest, DepositStatus};
pub use error::{ErrorKind, LedgerError, Result, StateConflict};
pub use ledger::{Ledger, LedgerBuilder};
pub use referral::{AwardTrigger, Referral, ReferralStatus};
pub use store::{AccountId, ContractId, DepositId, ReferralId, Store, WithdrawalId};
pub use withdrawal::{Withdrawal, WithdrawalRequest, WithdrawalStatus};
