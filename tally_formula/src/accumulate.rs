//! Accumulation formulas
//!
//! An accumulation formula receives the current value of one window slot, the
//! newly observed quantity, the usage interval and the period the slot covers.
//! Returning `None` leaves the slot untouched.

use std::fmt;

use serde::{Deserialize, Serialize};
use tally_window::Dimension;

use crate::{CellResolver, Error, finite, identity};

/// Arguments of one accumulation call. Serialized as part of the result cache
/// key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccumulateInput {
    /// Current value of the slot, zero when the slot is absent
    pub current: f64,
    /// Newly observed quantity
    pub quantity: f64,
    /// Start of the usage, epoch milliseconds
    pub start: i64,
    /// End of the usage, epoch milliseconds
    pub end: i64,
    /// Start of the slot's period
    pub from: i64,
    /// End of the slot's period, exclusive
    pub to: i64,
}

impl AccumulateInput {
    fn end_in_period(&self) -> bool {
        self.from <= self.end && self.end < self.to
    }
}

/// A pluggable accumulation formula.
pub trait AccumulateFn: fmt::Debug + Send + Sync {
    /// Compute the new value of a slot, or `None` when the slot's period is
    /// not affected by the usage.
    ///
    /// # Errors
    ///
    /// Fails when the formula cannot produce a finite value.
    fn accumulate(
        &self,
        input: &AccumulateInput,
        cells: &dyn CellResolver,
    ) -> Result<Option<f64>, Error>;

    /// Stable name of this formula and its parameters.
    fn identity(&self) -> String;

    /// Whether the result depends on the cell resolver. Such results are never
    /// memoized.
    fn uses_cells(&self) -> bool {
        false
    }
}

/// The built-in accumulation formulas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulateFormula {
    /// Add the quantity to the slot whose period contains the usage end.
    #[default]
    Sum,
    /// Keep the largest quantity seen in the period containing the usage end.
    Max,
    /// Keep the most recent quantity seen in the period containing the usage
    /// end.
    Latest,
    /// Record the quantity in every slot, whatever its period.
    Identity,
    /// Add quantity multiplied by the overlap of the usage interval with the
    /// slot's period, measured in `unit`. Useful for memory-hours and the like.
    Duration {
        /// Unit the overlap is measured in. Months count as 31 days.
        unit: Dimension,
    },
    /// Month-to-date total plus the quantity, for the period containing the
    /// usage end.
    MonthToDate,
}

impl AccumulateFormula {
    const fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Latest => "latest",
            Self::Identity => "identity",
            Self::Duration { .. } => "duration",
            Self::MonthToDate => "month_to_date",
        }
    }
}

impl AccumulateFn for AccumulateFormula {
    fn accumulate(
        &self,
        input: &AccumulateInput,
        cells: &dyn CellResolver,
    ) -> Result<Option<f64>, Error> {
        let value = match *self {
            Self::Sum => input
                .end_in_period()
                .then(|| input.current + input.quantity),
            Self::Max => input
                .end_in_period()
                .then(|| input.current.max(input.quantity)),
            Self::Latest => input.end_in_period().then_some(input.quantity),
            Self::Identity => Some(input.quantity),
            Self::Duration { unit } => {
                let overlap = input.end.min(input.to) - input.start.max(input.from);
                (overlap > 0).then(|| {
                    input.current + input.quantity * overlap as f64 / unit.millis() as f64
                })
            }
            Self::MonthToDate => input.end_in_period().then(|| {
                cells.cell(Dimension::Month).unwrap_or(0.0) + input.quantity
            }),
        };
        value.map(|v| finite(self.name(), v)).transpose()
    }

    fn identity(&self) -> String {
        identity("accumulate", self)
    }

    fn uses_cells(&self) -> bool {
        matches!(self, Self::MonthToDate)
    }
}
