//! Charge formulas
//!
//! A charge formula turns the rated cost of one window slot into the amount
//! charged for it, given the time the charge is computed at.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, finite, identity};

/// Arguments of one charge call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChargeInput {
    /// Time the charge is computed at, epoch milliseconds
    pub time: i64,
    /// Rated cost of the slot, when one was attached
    pub cost: Option<f64>,
    /// Start of the slot's period
    pub from: i64,
    /// End of the slot's period, exclusive
    pub to: i64,
}

/// A pluggable charge formula.
pub trait ChargeFn: fmt::Debug + Send + Sync {
    /// Compute the charge of a slot.
    ///
    /// # Errors
    ///
    /// Fails when the formula cannot produce a finite value.
    fn charge(&self, input: &ChargeInput) -> Result<f64, Error>;

    /// Stable name of this formula and its parameters.
    fn identity(&self) -> String;
}

/// The built-in charge formulas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeFormula {
    /// Charge the rated cost, zero when there is none.
    #[default]
    Cost,
    /// Charge the rated cost multiplied by `factor`.
    Scaled {
        /// Multiplier applied to the cost
        factor: f64,
    },
    /// Charge a fixed amount for every recorded period.
    Flat {
        /// The amount charged
        amount: f64,
    },
    /// Charge the part of the cost covering the elapsed fraction of the
    /// period at the time of the charge.
    Prorated,
}

impl ChargeFormula {
    const fn name(self) -> &'static str {
        match self {
            Self::Cost => "cost",
            Self::Scaled { .. } => "scaled",
            Self::Flat { .. } => "flat",
            Self::Prorated => "prorated",
        }
    }
}

impl ChargeFn for ChargeFormula {
    fn charge(&self, input: &ChargeInput) -> Result<f64, Error> {
        let cost = input.cost.unwrap_or(0.0);
        let value = match *self {
            Self::Cost => cost,
            Self::Scaled { factor } => cost * factor,
            Self::Flat { amount } => amount,
            Self::Prorated => {
                let span = input.to - input.from;
                if span <= 0 {
                    return Err(Error::EmptyWindow {
                        from: input.from,
                        to: input.to,
                    });
                }
                let elapsed = (input.time - input.from).clamp(0, span);
                cost * elapsed as f64 / span as f64
            }
        };
        finite(self.name(), value)
    }

    fn identity(&self) -> String {
        identity("charge", self)
    }
}

/// A charge formula that always charges nothing. Stands in for metrics that
/// were retired from their rating plan after usage was recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Zero;

impl ChargeFn for Zero {
    fn charge(&self, _input: &ChargeInput) -> Result<f64, Error> {
        Ok(0.0)
    }

    fn identity(&self) -> String {
        identity("charge", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(cost: Option<f64>, time: i64) -> ChargeInput {
        ChargeInput {
            time,
            cost,
            from: 0,
            to: 100,
        }
    }

    #[test]
    fn cost_defaults_to_zero() {
        assert_eq!(ChargeFormula::Cost.charge(&input(Some(12.5), 0)).unwrap(), 12.5);
        assert_eq!(ChargeFormula::Cost.charge(&input(None, 0)).unwrap(), 0.0);
    }

    #[test]
    fn scaled_and_flat() {
        let scaled = ChargeFormula::Scaled { factor: 2.0 };
        assert_eq!(scaled.charge(&input(Some(3.0), 0)).unwrap(), 6.0);
        let flat = ChargeFormula::Flat { amount: 7.0 };
        assert_eq!(flat.charge(&input(None, 0)).unwrap(), 7.0);
    }

    #[test]
    fn prorated_follows_elapsed_time() {
        let prorated = ChargeFormula::Prorated;
        assert_eq!(prorated.charge(&input(Some(10.0), 25)).unwrap(), 2.5);
        assert_eq!(prorated.charge(&input(Some(10.0), -5)).unwrap(), 0.0);
        assert_eq!(prorated.charge(&input(Some(10.0), 500)).unwrap(), 10.0);

        let empty = ChargeInput {
            from: 100,
            ..input(Some(10.0), 0)
        };
        assert_eq!(
            prorated.charge(&empty).unwrap_err(),
            Error::EmptyWindow { from: 100, to: 100 }
        );
    }

    #[test]
    fn non_finite_factor_is_rejected() {
        let scaled = ChargeFormula::Scaled { factor: f64::NAN };
        assert!(scaled.charge(&input(Some(1.0), 0)).is_err());
    }

    #[test]
    fn zero_charges_nothing() {
        assert_eq!(Zero.charge(&input(Some(99.0), 0)).unwrap(), 0.0);
    }
}
