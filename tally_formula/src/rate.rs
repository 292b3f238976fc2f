//! Rate formulas, from an accumulated quantity and a unit price to a cost.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, finite, identity};

/// A pluggable rate formula.
pub trait RateFn: fmt::Debug + Send + Sync {
    /// Compute the cost of `quantity` at `price` per unit.
    ///
    /// # Errors
    ///
    /// Fails when the formula is misconfigured or cannot produce a finite
    /// value.
    fn rate(&self, price: f64, quantity: f64) -> Result<f64, Error>;

    /// Stable name of this formula and its parameters.
    fn identity(&self) -> String;
}

/// The built-in rate formulas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateFormula {
    /// `price * quantity`
    #[default]
    PerUnit,
    /// Price per started block of `size` units.
    Blocks {
        /// Units per block
        size: f64,
    },
}

impl RateFn for RateFormula {
    fn rate(&self, price: f64, quantity: f64) -> Result<f64, Error> {
        match *self {
            Self::PerUnit => finite("per_unit", price * quantity),
            Self::Blocks { size } => {
                if size.is_nan() || size <= 0.0 {
                    return Err(Error::InvalidBlockSize { size });
                }
                finite("blocks", price * (quantity / size).ceil())
            }
        }
    }

    fn identity(&self) -> String {
        identity("rate", self)
    }
}
