//! Cost model: declared provider rates applied to measured usage.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Units consumed by one provider call (tokens, pages, ... provider-defined).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_units: u64,
    pub output_units: u64,
}

impl Usage {
    pub fn new(input_units: u64, output_units: u64) -> Self {
        Self {
            input_units,
            output_units,
        }
    }
}

/// Price per unit, as declared by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRates {
    pub input_per_unit: Decimal,
    pub output_per_unit: Decimal,
}

impl CostRates {
    pub fn new(input_per_unit: Decimal, output_per_unit: Decimal) -> Self {
        Self {
            input_per_unit,
            output_per_unit,
        }
    }

    pub fn cost_of(&self, usage: Usage) -> Decimal {
        self.input_per_unit * Decimal::from(usage.input_units)
            + self.output_per_unit * Decimal::from(usage.output_units)
    }
}

/// Bounds on what one call may cost before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub min: Decimal,
    pub max: Decimal,
}

impl CostEstimate {
    pub fn new(min: Decimal, max: Decimal) -> Self {
        Self { min, max }
    }
}
