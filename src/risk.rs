//! Risk configuration.
//!
//! Immutable limits supplied at engine construction. Shared by reference (via `Arc`)
//! between the order book and the position book and never mutated at runtime.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{Leverage, Price, Quote, Size};

// ceiling for any configured limit
const MAX_LIMIT: Decimal = dec!(1_000_000_000_000);

/// Pre-trade limits and the maintenance margin rate used for liquidation prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Highest leverage an order may request (inclusive).
    pub max_leverage: u32,
    /// Fraction of notional that must remain as equity (e.g. 0.005 for 0.5%).
    pub maintenance_margin_rate: Decimal,
    /// Smallest accepted order size (inclusive).
    pub min_position_size: Decimal,
    /// Largest accepted order size (inclusive).
    pub max_position_size: Decimal,
    /// Largest accepted price or limit price (inclusive).
    pub max_price: Decimal,
    /// Largest single deposit (inclusive).
    pub max_deposit: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_leverage: 100,
            maintenance_margin_rate: dec!(0.005),
            min_position_size: dec!(1),
            max_position_size: dec!(1_000_000),
            max_price: dec!(1_000_000_000),
            max_deposit: dec!(1_000_000_000_000),
        }
    }
}

impl RiskConfig {
    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), RiskConfigError> {
        if self.max_leverage == 0 {
            return Err(RiskConfigError::MaxLeverage);
        }
        if self.maintenance_margin_rate < Decimal::ZERO || self.maintenance_margin_rate >= Decimal::ONE {
            return Err(RiskConfigError::MaintenanceRate(self.maintenance_margin_rate));
        }
        if self.min_position_size <= Decimal::ZERO || self.min_position_size > self.max_position_size {
            return Err(RiskConfigError::SizeBounds {
                min: self.min_position_size,
                max: self.max_position_size,
            });
        }
        // size * price and balance sums must stay far inside Decimal's range
        if self.max_price <= Decimal::ZERO || self.max_price > MAX_LIMIT {
            return Err(RiskConfigError::Limit {
                name: "max_price",
                value: self.max_price,
            });
        }
        if self.max_deposit <= Decimal::ZERO || self.max_deposit > MAX_LIMIT {
            return Err(RiskConfigError::Limit {
                name: "max_deposit",
                value: self.max_deposit,
            });
        }
        if self.max_position_size > MAX_LIMIT {
            return Err(RiskConfigError::Limit {
                name: "max_position_size",
                value: self.max_position_size,
            });
        }
        Ok(())
    }

    pub fn leverage_allowed(&self, leverage: Leverage) -> bool {
        leverage.value() <= self.max_leverage
    }

    pub fn size_too_small(&self, size: Size) -> bool {
        size.value() < self.min_position_size
    }

    pub fn size_too_large(&self, size: Size) -> bool {
        size.value() > self.max_position_size
    }

    pub fn price_too_large(&self, price: Price) -> bool {
        price.value() > self.max_price
    }

    pub fn deposit_too_large(&self, amount: Quote) -> bool {
        amount.value() > self.max_deposit
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RiskConfigError {
    #[error("max_leverage must be at least 1")]
    MaxLeverage,

    #[error("maintenance_margin_rate must be in [0, 1), got {0}")]
    MaintenanceRate(Decimal),

    #[error("invalid position size bounds: min {min}, max {max}")]
    SizeBounds { min: Decimal, max: Decimal },

    #[error("{name} must be in (0, 1e12], got {value}")]
    Limit { name: &'static str, value: Decimal },
}
