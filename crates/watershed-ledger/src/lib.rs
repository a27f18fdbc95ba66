//! Watershed Ledger - peer-funded micro-lending rules
//!
//! A user borrows against their own accrued giving balance (their
//! *watershed*). When that balance is short, the rest is opened to other
//! members as community shares, with the platform reserve fronting the
//! community portion until pledges clear.
//!
//! This crate is the pure rules engine: no storage, no clocks, no I/O. Every
//! operation takes the current time explicitly and mutates plain records the
//! caller persists atomically.
//!
//! # Components
//!
//! - **Money**: cent-exact amounts with half-away-from-zero rounding
//! - **Policy**: operator-supplied thresholds and step functions
//! - **Accounts**: watershed balances with audit rows
//! - **Origination**: eligibility, validation, pure/backed split, fees
//! - **Shares**: the authoritative record of who funded what
//! - **Distribution**: pro-rata allocation of each repayment across shares
//! - **State**: the loan status machine and funding-lock release
//! - **Reserve**: platform operating account and its health

pub mod account;
pub mod distribution;
pub mod error;
pub mod id;
pub mod loan;
pub mod money;
pub mod origination;
pub mod policy;
pub mod reserve;
pub mod share;
pub mod state;

pub use account::{WatershedAccount, WatershedTransaction, WatershedTxKind};
pub use distribution::{distribute, payment_amount, Distribution, ShareCredit};
pub use error::{IneligibleReason, LedgerError, Result};
pub use loan::{
    Backing, Funding, LoanStatus, LoanType, PaymentType, WatershedLoan, WatershedLoanPayment,
};
pub use money::Money;
pub use origination::{
    available_balance, check_eligibility, find_open_loan, originate, Eligibility,
    LoanApplication, Origination,
};
pub use policy::{LendingPolicy, ReserveBands, Tier, Tiers};
pub use reserve::{ReserveHealth, ReserveLedger, ReserveTransaction, ReserveTxKind};
pub use share::{LoanShare, Pledge};
pub use state::{apply_repayment, can_transition, transition, RepaymentOutcome};
