//! Summary formulas, from an accumulated quantity to the figure shown in a
//! usage report.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, finite, identity};

/// Arguments of one summary call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummarizeInput {
    /// Time the summary is computed at, epoch milliseconds
    pub time: i64,
    /// Accumulated quantity of the slot
    pub quantity: Option<f64>,
    /// Start of the slot's period
    pub from: i64,
    /// End of the slot's period, exclusive
    pub to: i64,
}

/// A pluggable summary formula.
pub trait SummarizeFn: fmt::Debug + Send + Sync {
    /// Compute the summary of a slot.
    ///
    /// # Errors
    ///
    /// Fails when the formula cannot produce a finite value.
    fn summarize(&self, input: &SummarizeInput) -> Result<f64, Error>;

    /// Stable name of this formula and its parameters.
    fn identity(&self) -> String;
}

/// The built-in summary formulas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizeFormula {
    /// The quantity itself, zero when there is none.
    #[default]
    Quantity,
    /// The quantity multiplied by `factor`, for unit conversions.
    Scaled {
        /// Multiplier applied to the quantity
        factor: f64,
    },
}

impl SummarizeFn for SummarizeFormula {
    fn summarize(&self, input: &SummarizeInput) -> Result<f64, Error> {
        let quantity = input.quantity.unwrap_or(0.0);
        match *self {
            Self::Quantity => finite("quantity", quantity),
            Self::Scaled { factor } => finite("scaled", quantity * factor),
        }
    }

    fn identity(&self) -> String {
        identity("summarize", self)
    }
}
