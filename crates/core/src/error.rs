//! Ledger error taxonomy.
//!
//! Every failure surfaced by the ledger is a [`LedgerError`]. Callers that
//! only care about the class of failure (adjudication UIs, form handlers)
//! match on [`LedgerError::kind`] instead of the concrete variant.

use rust_decimal::Decimal;

use crate::currency::Coin;

/// Coarse failure classes shown to adjudicators and end users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InsufficientBalance,
    InvalidAmount,
    Unauthorized,
    UpstreamUnavailable,
    Internal,
}

/// Why a transition was refused by a state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateConflict {
    /// A one-shot transition already happened (deposit decided, bonus awarded).
    AlreadyProcessed,
    /// The record reached a terminal status.
    AlreadyFinalized,
    /// A uniqueness rule was violated (second referral for an account, ...).
    Duplicate,
    UnexpectedStatus {
        expected: &'static str,
        actual: String,
    },
}

impl std::fmt::Display for StateConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyProcessed => f.write_str("already processed"),
            Self::AlreadyFinalized => f.write_str("already finalized"),
            Self::Duplicate => f.write_str("duplicate"),
            Self::UnexpectedStatus { expected, actual } => {
                write!(f, "expected status {expected}, found {actual}")
            }
        }
    }
}

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} {id}: {conflict}")]
    InvalidState {
        entity: &'static str,
        id: String,
        conflict: StateConflict,
    },
    #[error("insufficient {currency} balance: available {available}, requested {requested}")]
    InsufficientBalance {
        currency: String,
        available: Decimal,
        requested: Decimal,
    },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("currency {0} is not supported here")]
    UnsupportedCurrency(Coin),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::InvalidAmount(_) | Self::UnsupportedCurrency(_) => ErrorKind::InvalidAmount,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            Self::Persistence(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(entity: &'static str, id: impl ToString, conflict: StateConflict) -> Self {
        Self::InvalidState {
            entity,
            id: id.to_string(),
            conflict,
        }
    }

    pub(crate) fn unexpected_status(
        entity: &'static str,
        id: impl ToString,
        expected: &'static str,
        actual: impl ToString,
    ) -> Self {
        Self::conflict(
            entity,
            id,
            StateConflict::UnexpectedStatus {
                expected,
                actual: actual.to_string(),
            },
        )
    }

    /// The conflict carried by an `InvalidState` error, if any.
    pub fn state_conflict(&self) -> Option<&StateConflict> {
        match self {
            Self::InvalidState { conflict, .. } => Some(conflict),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            LedgerError::not_found("deposit", "x").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            LedgerError::conflict("deposit", "x", StateConflict::AlreadyProcessed).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            LedgerError::UnsupportedCurrency(Coin::Ltc).kind(),
            ErrorKind::InvalidAmount
        );
        assert_eq!(
            LedgerError::InsufficientBalance {
                currency: "USDT".into(),
                available: dec!(1),
                requested: dec!(2),
            }
            .kind(),
            ErrorKind::InsufficientBalance
        );
    }

    #[test]
    fn test_display_includes_conflict() {
        let err = LedgerError::unexpected_status("withdrawal", "abc", "approved", "pending");
        assert_eq!(
            err.to_string(),
            "withdrawal abc: expected status approved, found pending"
        );
        assert!(matches!(
            err.state_conflict(),
            Some(StateConflict::UnexpectedStatus { .. })
        ));
    }
}
