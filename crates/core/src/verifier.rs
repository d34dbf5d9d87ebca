//! Advisory on-chain transfer verification for deposit adjudication.
//!
//! The verifier answers "does this transaction reference pay the expected
//! amount to our intake address". Its answer is shown to the adjudicator and
//! never gates a transition.

use std::future::Future;
use std::pin::Pin;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::currency::Coin;

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("verifier not configured")]
    NotConfigured,
    #[error("verifier unreachable: {0}")]
    Unavailable(String),
}

/// What the deposit claims happened on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub tx_ref: String,
    pub destination: String,
    pub currency: Coin,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Transaction exists and pays `amount` of `currency` to `destination`.
    pub valid: bool,
    pub confirmations: u32,
    #[serde(default)]
    pub detail: Option<String>,
}

pub trait TxVerifier: Send + Sync + 'static {
    fn verify<'a>(
        &'a self,
        request: &'a VerificationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<VerificationReport, VerifierError>> + Send + 'a>>;
}

/// Result of a verification attempt, as presented to the adjudicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum VerificationAdvice {
    Verified { confirmations: u32 },
    Rejected(String),
    /// The deposit carries no transaction reference to check.
    NoReference,
    Unavailable(String),
}

impl VerificationAdvice {
    pub fn from_outcome(outcome: Result<VerificationReport, VerifierError>) -> Self {
        match outcome {
            Ok(report) if report.valid => Self::Verified {
                confirmations: report.confirmations,
            },
            Ok(report) => Self::Rejected(
                report
                    .detail
                    .unwrap_or_else(|| "transfer does not match the deposit".to_string()),
            ),
            Err(e) => Self::Unavailable(e.to_string()),
        }
    }
}

/// Verifier for deployments without chain access. Always unavailable.
#[derive(Debug, Default)]
pub struct NoopVerifier;

impl TxVerifier for NoopVerifier {
    fn verify<'a>(
        &'a self,
        _request: &'a VerificationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<VerificationReport, VerifierError>> + Send + 'a>> {
        Box::pin(async { Err(VerifierError::NotConfigured) })
    }
}

// =============================================================================
// Mock: MockTxVerifier (test / testing feature)
// =============================================================================

#[cfg(any(test, feature = "testing"))]
#[derive(Default)]
pub struct MockTxVerifier {
    reports: std::collections::HashMap<String, VerificationReport>,
    pub should_fail: bool,
}

#[cfg(any(test, feature = "testing"))]
impl MockTxVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_report(mut self, tx_ref: &str, report: VerificationReport) -> Self {
        self.reports.insert(tx_ref.to_string(), report);
        self
    }

    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }
}

#[cfg(any(test, feature = "testing"))]
impl TxVerifier for MockTxVerifier {
    fn verify<'a>(
        &'a self,
        request: &'a VerificationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<VerificationReport, VerifierError>> + Send + 'a>> {
        if self.should_fail {
            return Box::pin(async { Err(VerifierError::Unavailable("mock failure".to_string())) });
        }
        let report = self
            .reports
            .get(&request.tx_ref)
            .cloned()
            .unwrap_or(VerificationReport {
                valid: false,
                confirmations: 0,
                detail: Some(format!("unknown transaction {}", request.tx_ref)),
            });
        Box::pin(async move { Ok(report) })
    }
}
