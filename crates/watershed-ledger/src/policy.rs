//! Business thresholds for lending.
//!
//! None of these numbers are structural. They are supplied by the operator
//! (see the node's environment config) and validated once at startup.

use crate::error::{LedgerError, Result};
use crate::money::Money;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One step of a step function keyed by an amount.
///
/// `ceiling: None` is the unbounded tail tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub ceiling: Option<Money>,
    pub value: u32,
}

/// Ordered step function: the first tier whose ceiling covers the amount wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tiers(Vec<Tier>);

impl Tiers {
    pub fn new(tiers: Vec<Tier>) -> Result<Self> {
        let tiers = Tiers(tiers);
        tiers.validate()?;
        Ok(tiers)
    }

    /// Look up the value for `amount`.
    pub fn lookup(&self, amount: Money) -> u32 {
        self.0
            .iter()
            .find(|t| t.ceiling.map_or(true, |c| amount <= c))
            .or_else(|| self.0.last())
            .map_or(0, |t| t.value)
    }

    pub fn as_slice(&self) -> &[Tier] {
        &self.0
    }

    fn validate(&self) -> Result<()> {
        let Some(last) = self.0.last() else {
            return Err(LedgerError::validation("tier list is empty"));
        };
        if last.ceiling.is_some() {
            return Err(LedgerError::validation("last tier must be unbounded (*)"));
        }
        let mut previous: Option<Money> = None;
        for tier in &self.0[..self.0.len() - 1] {
            let Some(ceiling) = tier.ceiling else {
                return Err(LedgerError::validation("only the last tier may be unbounded"));
            };
            if previous.is_some_and(|p| ceiling <= p) {
                return Err(LedgerError::validation("tier ceilings must be strictly increasing"));
            }
            previous = Some(ceiling);
        }
        if self.0.iter().any(|t| t.value == 0) {
            return Err(LedgerError::validation("tier values must be positive"));
        }
        Ok(())
    }
}

/// Parses `500:6,2000:12,*:24` (ceilings in dollars).
impl FromStr for Tiers {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let mut tiers = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (ceiling, value) = part
                .split_once(':')
                .ok_or_else(|| LedgerError::validation(format!("bad tier '{}'", part)))?;
            let ceiling = match ceiling.trim() {
                "*" => None,
                c => {
                    let dollars: f64 = c
                        .parse()
                        .map_err(|_| LedgerError::validation(format!("bad tier ceiling '{}'", c)))?;
                    Some(Money::from_dollars(dollars).ok_or_else(|| {
                        LedgerError::validation(format!("bad tier ceiling '{}'", c))
                    })?)
                }
            };
            let value = value
                .trim()
                .parse()
                .map_err(|_| LedgerError::validation(format!("bad tier value '{}'", value)))?;
            tiers.push(Tier { ceiling, value });
        }
        Tiers::new(tiers)
    }
}

impl fmt::Display for Tiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tier) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match tier.ceiling {
                Some(c) => write!(f, "{}:{}", c.to_dollars(), tier.value)?,
                None => write!(f, "*:{}", tier.value)?,
            }
        }
        Ok(())
    }
}

/// Coverage-ratio bands for reserve health, in basis points of coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveBands {
    /// Coverage at or above this is healthy.
    pub healthy_bps: u32,
    /// Coverage at or above this (and below healthy) is watch.
    pub watch_bps: u32,
}

impl Default for ReserveBands {
    fn default() -> Self {
        Self {
            healthy_bps: 15_000,
            watch_bps: 10_000,
        }
    }
}

/// Lending thresholds and step functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LendingPolicy {
    /// Minimum available watershed to qualify for any loan.
    pub min_balance: Money,
    /// Minimum principal of a loan request.
    pub min_amount: Money,
    /// Maximum principal of a loan request.
    pub max_amount: Money,
    /// Origination fee on the community-funded portion, in basis points.
    pub fee_rate_bps: u32,
    /// Minimum trimmed length of the purpose text.
    pub min_purpose_len: usize,
    /// Maximum term in months, keyed by principal.
    pub term_tiers: Tiers,
    /// Funding window in days, keyed by community-funded shortfall.
    pub deadline_tiers: Tiers,
    /// On-time payments in `recovering` before a loan returns to `active`.
    pub recovery_payments_required: u32,
    pub reserve_bands: ReserveBands,
}

impl Default for LendingPolicy {
    fn default() -> Self {
        Self {
            min_balance: Money::from_dollars_whole(100),
            min_amount: Money::from_dollars_whole(50),
            max_amount: Money::from_dollars_whole(50_000),
            fee_rate_bps: 500,
            min_purpose_len: 10,
            term_tiers: Tiers(vec![
                Tier { ceiling: Some(Money::from_dollars_whole(500)), value: 6 },
                Tier { ceiling: Some(Money::from_dollars_whole(2_000)), value: 12 },
                Tier { ceiling: None, value: 24 },
            ]),
            deadline_tiers: Tiers(vec![
                Tier { ceiling: Some(Money::from_dollars_whole(250)), value: 7 },
                Tier { ceiling: Some(Money::from_dollars_whole(1_000)), value: 14 },
                Tier { ceiling: None, value: 30 },
            ]),
            recovery_payments_required: 3,
            reserve_bands: ReserveBands::default(),
        }
    }
}

impl LendingPolicy {
    /// Longest term allowed for a principal of `amount`.
    pub fn max_term(&self, amount: Money) -> u32 {
        self.term_tiers.lookup(amount)
    }

    /// Funding window in days for a community-funded shortfall.
    pub fn funding_window_days(&self, shortfall: Money) -> u32 {
        self.deadline_tiers.lookup(shortfall)
    }

    /// Check the policy is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.min_balance.is_negative() || self.min_amount.is_negative() {
            return Err(LedgerError::validation("minimums must not be negative"));
        }
        if self.max_amount < self.min_amount || self.max_amount > Money::MAX {
            return Err(LedgerError::validation(
                "maximum loan amount must lie between the minimum and the money limit",
            ));
        }
        if self.fee_rate_bps > 10_000 {
            return Err(LedgerError::validation("fee rate cannot exceed 100%"));
        }
        if self.recovery_payments_required == 0 {
            return Err(LedgerError::validation("recovery payments must be at least 1"));
        }
        if self.reserve_bands.watch_bps > self.reserve_bands.healthy_bps {
            return Err(LedgerError::validation("watch band must not exceed healthy band"));
        }
        self.term_tiers.validate()?;
        self.deadline_tiers.validate()
    }
}
