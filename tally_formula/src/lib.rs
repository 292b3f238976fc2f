//! Built-in usage formulas
//!
//! Plans never carry code. Each plan metric names one of the formulas in this
//! crate, and the names together with their parameters form a closed, versioned
//! registry. Four families exist:
//!
//! * [`accumulate`] folds a new quantity into a window slot,
//! * [`rate`] turns an accumulated quantity into a cost,
//! * [`charge`] turns a cost into the charge of a window slot,
//! * [`summarize`] turns a quantity into a reportable summary.
//!
//! Every family has a trait at its seam so callers may plug in their own
//! formulas, and an enum implementing it for the built-ins. Formula outputs can
//! be memoized through [`cache::FunctionCache`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use tally_window::Dimension;

pub mod accumulate;
pub mod cache;
pub mod charge;
pub mod rate;
pub mod summarize;

pub use accumulate::{AccumulateFn, AccumulateFormula, AccumulateInput};
pub use cache::{CacheConfig, FunctionCache, Memoized};
pub use charge::{ChargeFn, ChargeFormula, ChargeInput};
pub use rate::{RateFn, RateFormula};
pub use summarize::{SummarizeFn, SummarizeFormula, SummarizeInput};

/// Version of the formula registry. Part of every formula identity, so cached
/// results never outlive a change in formula semantics.
pub const REGISTRY_VERSION: &str = "1";

/// Errors produced while evaluating a formula.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// The formula produced NaN or an infinity.
    #[error("Formula {formula} produced non-finite value {value}")]
    NonFinite {
        /// Name of the formula
        formula: &'static str,
        /// The offending value
        value: f64,
    },
    /// The window the formula was evaluated over has no duration.
    #[error("Window [{from}, {to}) is empty")]
    EmptyWindow {
        /// Window start, epoch milliseconds
        from: i64,
        /// Window end, epoch milliseconds
        to: i64,
    },
    /// A block-rated metric was configured with a non-positive block.
    #[error("Block size {size} must be positive")]
    InvalidBlockSize {
        /// The configured size
        size: f64,
    },
}

/// Give access to the quantity already recorded for the period the usage
/// being accumulated falls into, at any resolution.
pub trait CellResolver {
    /// Current quantity of the slot `dimension` holds for the usage, if any.
    fn cell(&self, dimension: Dimension) -> Option<f64>;
}

/// A resolver over no windows at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCells;

impl CellResolver for NoCells {
    fn cell(&self, _dimension: Dimension) -> Option<f64> {
        None
    }
}

pub(crate) fn finite(formula: &'static str, value: f64) -> Result<f64, Error> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::NonFinite { formula, value })
    }
}

pub(crate) fn identity<T: std::fmt::Debug>(family: &str, formula: &T) -> String {
    format!("v{REGISTRY_VERSION}/{family}/{formula:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_the_plain_formulas() {
        assert_eq!(AccumulateFormula::default(), AccumulateFormula::Sum);
        assert_eq!(RateFormula::default(), RateFormula::PerUnit);
        assert_eq!(ChargeFormula::default(), ChargeFormula::Cost);
        assert_eq!(SummarizeFormula::default(), SummarizeFormula::Quantity);
    }

    #[test]
    fn identities_carry_the_registry_version() {
        assert!(AccumulateFormula::Sum.identity().starts_with("v1/accumulate/"));
        assert!(ChargeFormula::Cost.identity().starts_with("v1/charge/"));
    }
}
