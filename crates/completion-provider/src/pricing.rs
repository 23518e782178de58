//! Pricing for completion jobs
//!
//! Offer prices and balances are fixed-point amounts with 18 fractional digits,
//! expressed in the marketplace's smallest currency unit. All arithmetic is exact
//! integer math on `u128`; nothing here touches floating point.

use crate::protocol::{Offer, Usage};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of fractional digits in a fixed-point amount
pub const DECIMALS: u32 = 18;

const ONE: u128 = 10u128.pow(DECIMALS);

/// Errors from parsing or computing amounts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PricingError {
    #[error("invalid amount {input:?}: {reason}")]
    InvalidAmount { input: String, reason: &'static str },

    #[error("amount overflows 128-bit fixed point")]
    Overflow,
}

/// Fixed-point amount in base units (1 display unit = 10^18 base units)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Wei(pub u128);

impl Wei {
    /// Parse a human-readable decimal amount such as `"0.000001"`
    pub fn parse_decimal(input: &str) -> Result<Self, PricingError> {
        let invalid = |reason| PricingError::InvalidAmount {
            input: input.to_string(),
            reason,
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty"));
        }
        if trimmed.starts_with('-') {
            return Err(invalid("must not be negative"));
        }
        let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);

        let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid("no digits"));
        }
        let is_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if !is_digits(whole) || !is_digits(fraction) {
            return Err(invalid("not a decimal number"));
        }
        if fraction.len() > DECIMALS as usize {
            return Err(invalid("more than 18 fractional digits"));
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| PricingError::Overflow)?
        };
        let fraction: u128 = if fraction.is_empty() {
            0
        } else {
            let digits: u128 = fraction.parse().map_err(|_| PricingError::Overflow)?;
            digits * 10u128.pow(DECIMALS - fraction.len() as u32)
        };

        whole
            .checked_mul(ONE)
            .and_then(|v| v.checked_add(fraction))
            .map(Wei)
            .ok_or(PricingError::Overflow)
    }

    /// Render as a human-readable decimal, e.g. `0.0002`
    pub fn to_decimal_string(&self) -> String {
        let whole = self.0 / ONE;
        let fraction = self.0 % ONE;
        if fraction == 0 {
            return whole.to_string();
        }
        let fraction = format!("{:018}", fraction);
        format!("{}.{}", whole, fraction.trim_end_matches('0'))
    }

    pub fn checked_add(self, other: Wei) -> Option<Wei> {
        self.0.checked_add(other.0).map(Wei)
    }
}

/// Integer string form, as carried in `balance_delta` and `$pol` prices
impl fmt::Display for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Wei {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PricingError::InvalidAmount {
                input: s.to_string(),
                reason: "not an integer",
            });
        }
        s.parse().map(Wei).map_err(|_| PricingError::Overflow)
    }
}

impl Serialize for Wei {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Wei {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Balance owed for a job: `prompt × input price + completion × output price`
pub fn calc_cost(offer: &Offer, usage: &Usage) -> Result<Wei, PricingError> {
    let input = u128::from(usage.prompt_tokens)
        .checked_mul(offer.input_token_price.amount.0)
        .ok_or(PricingError::Overflow)?;
    let output = u128::from(usage.completion_tokens)
        .checked_mul(offer.output_token_price.amount.0)
        .ok_or(PricingError::Overflow)?;

    input
        .checked_add(output)
        .map(Wei)
        .ok_or(PricingError::Overflow)
}
