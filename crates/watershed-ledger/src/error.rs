//! Error types for ledger operations.

use crate::loan::LoanStatus;
use crate::money::Money;
use std::fmt;
use thiserror::Error;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors raised by the lending rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Amount, term or purpose out of bounds.
    #[error("{0}")]
    Validation(String),

    /// The borrower does not qualify for a loan right now.
    #[error("{0}")]
    Ineligible(IneligibleReason),

    /// The loan is not in a status that allows the operation.
    #[error("loan is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: LoanStatus,
    },

    /// A watershed debit exceeds what the account can cover.
    #[error("insufficient watershed balance: {available} available, {requested} requested")]
    InsufficientBalance { available: Money, requested: Money },

    /// A ledger invariant would be broken.
    #[error("ledger invariant violated: {0}")]
    Invariant(String),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LedgerError::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        LedgerError::Invariant(msg.into())
    }
}

/// Why an eligibility check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    /// Available watershed is under the policy floor.
    BalanceBelowMinimum { available: Money, minimum: Money },
    /// The user already holds a loan that has not reached a terminal status.
    OpenLoanExists { loan_id: String, status: LoanStatus },
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IneligibleReason::BalanceBelowMinimum { available, minimum } => write!(
                f,
                "available watershed balance {} is below the {} minimum",
                available, minimum
            ),
            IneligibleReason::OpenLoanExists { loan_id, status } => write!(
                f,
                "you already have a {} watershed loan ({})",
                status, loan_id
            ),
        }
    }
}
