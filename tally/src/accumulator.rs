//! The accumulation engine
//!
//! Merges one metered usage observation into the accumulated usage of its
//! reducer key. The merge is a pure function of the previous document, the
//! observation and the formulas its metering plan names; the only I/O is the
//! plan lookup, made at most once per observation and skipped entirely when
//! every formula is cached.
//!
//! Per metric and dimension the merge runs in three steps. The window is first
//! extended so the usage's period is addressable and shifted so slot 0 is the
//! period of 'now'. The quantities of the usage's periods are then captured for
//! the cell resolver. Finally the formula is applied to every slot.

use std::sync::Arc;

use tally_formula::{
    AccumulateFn, AccumulateFormula, AccumulateInput, CellResolver, FunctionCache,
};
use tally_window::{Dimension, Slot, SlackViolation, TimeWindowSet, WindowSizes, time};
use tracing::{debug, info, warn};

use crate::{
    plan::{MeteringPlans, PlanError, PlanLookup, ProviderError},
    usage::{
        AccumulatedUsage, DedupMarker, MeteredUsage, Metric, Quantity, RejectedUsage, UsageCell,
    },
};

/// Errors produced by [`Accumulator`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Usage for a closed month arrived after the slack deadline.
    #[error(transparent)]
    Slack(SlackViolation),
    /// Calendar arithmetic failed.
    #[error("Window error: {0}")]
    Window(tally_window::Error),
    /// A formula could not be evaluated.
    #[error("Formula error: {0}")]
    Formula(#[from] tally_formula::Error),
    /// The metering plan provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The usage carries no processing time.
    #[error("Usage carries neither a processed_id nor a processed time")]
    ProcessedTime,
    /// Formulas and metered quantities do not line up.
    #[error("Expected {expected} formulas, got {actual}")]
    FormulaCount {
        /// Number of metered quantities
        expected: usize,
        /// Number of formulas supplied
        actual: usize,
    },
}

impl From<tally_window::Error> for Error {
    fn from(err: tally_window::Error) -> Self {
        match err {
            tally_window::Error::Slack(violation) => Error::Slack(violation),
            other => Error::Window(other),
        }
    }
}

impl Error {
    /// HTTP-equivalent status for this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Error::Slack(violation) => violation.status(),
            Error::ProcessedTime | Error::Window(_) => 400,
            Error::Formula(_) | Error::FormulaCount { .. } => 422,
            Error::Provider(_) => 502,
        }
    }

    /// Whether retrying the same input can never succeed.
    #[must_use]
    pub fn noretry(&self) -> bool {
        match self {
            Error::Slack(violation) => violation.noretry(),
            Error::Provider(_) => false,
            _ => true,
        }
    }

    /// Short machine readable code, e.g. `slack`.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Error::Slack(_) => "slack",
            Error::Window(_) => "ewindow",
            Error::Formula(_) | Error::FormulaCount { .. } => "eformula",
            Error::Provider(_) => "eprovider",
            Error::ProcessedTime => "eprocessed",
        }
    }
}

/// Result of accumulating one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The observation was merged.
    Accumulated {
        /// The new accumulated document
        doc: AccumulatedUsage,
        /// Marker recording the observation as consumed
        marker: DedupMarker,
    },
    /// The metering plan rejected the observation. Nothing was merged.
    Rejected(RejectedUsage),
}

/// Quantities recorded for the usage's period in every dimension, captured
/// before any formula runs.
#[derive(Debug, Clone, Copy)]
struct Snapshot([Option<f64>; 5]);

impl Snapshot {
    fn capture(
        windows: &TimeWindowSet<UsageCell>,
        now: i64,
        end: i64,
    ) -> Result<Self, tally_window::Error> {
        let mut cells = [None; 5];
        for (dimension, window) in windows.iter() {
            let index = time::window_index(now, end, dimension)?;
            cells[dimension.index()] = window
                .get(index)
                .and_then(Slot::as_present)
                .map(|cell| cell.quantity.current);
        }
        Ok(Self(cells))
    }
}

impl CellResolver for Snapshot {
    fn cell(&self, dimension: Dimension) -> Option<f64> {
        self.0[dimension.index()]
    }
}

/// Extend and shift one dimension's window ahead of the formula.
fn prepare(
    windows: &mut TimeWindowSet<UsageCell>,
    dimension: Dimension,
    sizes: &WindowSizes,
    shift_from: Option<i64>,
    now: i64,
    end: i64,
) -> Result<(), tally_window::Error> {
    let window = windows.window_mut(dimension);
    if !sizes.supports(dimension) {
        *window = tally_window::TimeWindow::empty();
        return Ok(());
    }
    let target = time::window_index(now, end, dimension)?;
    if sizes.extendable(dimension) && target < sizes.retained(dimension) && window.len() <= target {
        window.extend(target);
    }
    if let Some(previous) = shift_from {
        window.shift(previous, now, dimension)?;
    }
    Ok(())
}

/// Apply `formula` to every slot of every supported dimension.
fn apply(
    windows: &mut TimeWindowSet<UsageCell>,
    sizes: &WindowSizes,
    formula: &dyn AccumulateFn,
    quantity: f64,
    usage: &MeteredUsage,
    now: i64,
    cells: &Snapshot,
) -> Result<(), Error> {
    for dimension in Dimension::ALL {
        if !sizes.supports(dimension) {
            continue;
        }
        for (offset, slot) in (0_i64..).zip(windows.window_mut(dimension).slots_mut()) {
            let bounds = time::bounds(now, dimension, -offset)?;
            let previous = slot.as_present().map(|c| c.quantity.current);
            let input = AccumulateInput {
                current: previous.unwrap_or(0.0),
                quantity,
                start: usage.start,
                end: usage.end,
                from: bounds.from,
                to: bounds.to,
            };
            let Some(value) = formula.accumulate(&input, cells)? else {
                continue;
            };
            *slot = Slot::Present(UsageCell {
                quantity: Quantity {
                    current: value,
                    previous,
                },
                ..UsageCell::default()
            });
        }
    }
    Ok(())
}

/// Merge `usage` into `previous` at time `now`.
///
/// `formulas` holds one formula per entry of `usage.metered_usage`, in the
/// same order. The slack check is the caller's concern. Windows stay anchored
/// on the latest processing time seen: a `now` older than
/// `previous.processed` is placed relative to `previous.processed`, which
/// never moves backward.
///
/// # Errors
///
/// Fails when calendar arithmetic or a formula fails.
pub fn merge(
    previous: Option<&AccumulatedUsage>,
    usage: &MeteredUsage,
    now: i64,
    formulas: &[&dyn AccumulateFn],
    sizes: &WindowSizes,
) -> Result<AccumulatedUsage, Error> {
    if formulas.len() != usage.metered_usage.len() {
        return Err(Error::FormulaCount {
            expected: usage.metered_usage.len(),
            actual: formulas.len(),
        });
    }
    let anchor = previous.map_or(now, |doc| doc.processed.max(now));
    let shift_from = previous
        .map(|doc| doc.processed)
        .filter(|processed| anchor > *processed);

    let mut metrics: Vec<Metric<UsageCell>> = previous
        .map(|doc| doc.accumulated_usage.clone())
        .unwrap_or_default();
    let mut shifted = vec![false; metrics.len()];

    for (metered, formula) in usage.metered_usage.iter().zip(formulas) {
        let index = if let Some(index) = metrics.iter().position(|m| m.metric == metered.metric) {
            index
        } else {
            metrics.push(Metric {
                metric: metered.metric.clone(),
                windows: TimeWindowSet::empty(),
            });
            shifted.push(false);
            metrics.len() - 1
        };
        let windows = &mut metrics[index].windows;

        let shift = if shifted[index] { None } else { shift_from };
        for dimension in Dimension::ALL {
            prepare(windows, dimension, sizes, shift, anchor, usage.end)?;
        }
        shifted[index] = true;

        let cells = Snapshot::capture(windows, anchor, usage.end)?;
        apply(windows, sizes, *formula, metered.quantity, usage, anchor, &cells)?;
    }

    // Keep slot 0 on the current period for metrics this usage did not touch.
    if let Some(previous) = shift_from {
        for (metric, _) in metrics.iter_mut().zip(&shifted).filter(|(_, s)| !**s) {
            for dimension in Dimension::ALL {
                metric
                    .windows
                    .window_mut(dimension)
                    .shift(previous, anchor, dimension)?;
            }
        }
    }

    Ok(AccumulatedUsage {
        identity: usage.identity.clone(),
        start: previous.map_or(usage.start, |doc| doc.start),
        end: usage.end,
        processed: anchor,
        processed_id: match previous {
            Some(doc) if doc.processed > now => doc.processed_id.clone(),
            _ => usage.processed_id.clone(),
        },
        accumulated_usage: metrics,
    })
}

/// Accumulates metered usage against metering plans.
#[derive(Debug)]
pub struct Accumulator<P> {
    plans: P,
    sizes: WindowSizes,
    cache: Arc<FunctionCache<AccumulateFormula>>,
}

impl<P> Accumulator<P>
where
    P: MeteringPlans,
{
    /// Create an accumulator looking plans up in `plans`.
    #[must_use]
    pub fn new(plans: P, sizes: WindowSizes, cache: Arc<FunctionCache<AccumulateFormula>>) -> Self {
        Self {
            plans,
            sizes,
            cache,
        }
    }

    /// The window sizes in effect.
    #[must_use]
    pub fn sizes(&self) -> &WindowSizes {
        &self.sizes
    }

    /// Resolve the formula of every metered metric, looking the plan up only
    /// when one is not cached.
    async fn formulas(
        &self,
        usage: &MeteredUsage,
        auth: Option<&str>,
    ) -> Result<PlanLookup<Vec<AccumulateFormula>>, Error> {
        let plan_id = usage.identity.metering_plan_id.as_str();
        let cached: Option<Vec<AccumulateFormula>> = usage
            .metered_usage
            .iter()
            .map(|m| self.cache.formula(plan_id, &m.metric))
            .collect();
        if let Some(formulas) = cached {
            return Ok(PlanLookup::Found(formulas));
        }

        debug!(plan_id, "looking up metering plan");
        let plan = match self.plans.metering_plan(plan_id, auth).await? {
            PlanLookup::Found(plan) => plan,
            PlanLookup::Rejected(err) => return Ok(PlanLookup::Rejected(err)),
        };
        for metric in &plan.metrics {
            self.cache.store_formula(plan_id, &metric.name, metric.accumulate);
        }
        let mut formulas = Vec::with_capacity(usage.metered_usage.len());
        for metered in &usage.metered_usage {
            match plan.metric(&metered.metric) {
                Some(metric) => formulas.push(metric.accumulate),
                None => {
                    return Ok(PlanLookup::Rejected(PlanError::unknown_metric(
                        plan_id,
                        &metered.metric,
                    )));
                }
            }
        }
        Ok(PlanLookup::Found(formulas))
    }

    /// Accumulate `usage` into `previous`, the latest accumulated document of
    /// the usage's reducer key, if any.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Slack`] for late usage, propagates provider
    /// failures, and fails when a formula cannot be evaluated. A plan
    /// rejection is not an error, see [`Outcome::Rejected`].
    pub async fn accumulate(
        &self,
        previous: Option<&AccumulatedUsage>,
        usage: &MeteredUsage,
        auth: Option<&str>,
    ) -> Result<Outcome, Error> {
        let now = usage.processed_time().ok_or(Error::ProcessedTime)?;
        debug!(
            key = %usage.reducer_key(),
            end = usage.end,
            now,
            previous_end = previous.map(|doc| doc.end),
            "accumulating usage"
        );

        if let Err(err) = self.sizes.slack().check(usage.end, now) {
            metrics::counter!("slack_violation").increment(1);
            warn!(key = %usage.reducer_key(), end = usage.end, now, "rejecting late usage");
            return Err(err.into());
        }

        let formulas = match self.formulas(usage, auth).await? {
            PlanLookup::Found(formulas) => formulas,
            PlanLookup::Rejected(err) => {
                metrics::counter!("plan_rejected").increment(1);
                info!(
                    plan_id = %usage.identity.metering_plan_id,
                    error = %err.error,
                    reason = %err.reason,
                    "metering plan rejected usage"
                );
                return Ok(Outcome::Rejected(RejectedUsage::new(usage.clone(), err)));
            }
        };

        let memoized: Vec<_> = formulas.iter().map(|f| self.cache.memoized(f)).collect();
        let dyns: Vec<&dyn AccumulateFn> = memoized.iter().map(|m| m as &dyn AccumulateFn).collect();
        let doc = merge(previous, usage, now, &dyns, &self.sizes)?;

        metrics::counter!("accumulated_usage").increment(1);
        let marker = DedupMarker {
            id: usage.dedup_id(),
            key: usage.reducer_key(),
            processed: now,
        };
        Ok(Outcome::Accumulated { doc, marker })
    }
}
