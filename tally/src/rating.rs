//! Rating: attach a cost to every recorded window slot.

use tally_formula::{RateFn, RateFormula};
use tracing::{debug, warn};

use crate::{
    plan::{PlanLookup, PricingPlan, PricingPlans, ProviderError, RatingPlan, RatingPlans},
    usage::{AccumulatedUsage, Metric, UsageCell},
};

/// Errors produced while rating.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A rate formula could not be evaluated.
    #[error("Rate formula failed for metric {metric}: {source}")]
    Formula {
        /// Metric being rated
        metric: String,
        /// Formula error
        #[source]
        source: tally_formula::Error,
    },
    /// A plan provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

fn rate_metric(
    metric: &Metric<UsageCell>,
    formula: &dyn RateFn,
    price: f64,
) -> Result<Metric<UsageCell>, Error> {
    let windows = metric.windows.try_map_slots(|_, _, slot| -> Result<_, Error> {
        let Some(cell) = slot.as_present() else {
            return Ok(tally_window::Slot::Absent);
        };
        let cost = formula
            .rate(price, cell.quantity.current)
            .map_err(|source| Error::Formula {
                metric: metric.metric.clone(),
                source,
            })?;
        Ok(tally_window::Slot::Present(UsageCell {
            cost: Some(cost),
            ..*cell
        }))
    })?;
    Ok(Metric {
        metric: metric.metric.clone(),
        windows,
    })
}

/// Attach a cost to every present slot of `doc`, using the rate formula the
/// rating plan declares for each metric and its price in `country`.
///
/// A metric the rating plan does not declare is rated per unit.
///
/// # Errors
///
/// Fails when a rate formula cannot be evaluated.
pub fn rate(
    doc: &AccumulatedUsage,
    rating: &RatingPlan,
    pricing: &PricingPlan,
    country: &str,
) -> Result<AccumulatedUsage, Error> {
    let accumulated_usage = doc
        .accumulated_usage
        .iter()
        .map(|metric| {
            let formula = match rating.metric(&metric.metric) {
                Some(declared) => declared.rate,
                None => {
                    warn!(
                        plan_id = %rating.plan_id,
                        metric = %metric.metric,
                        "metric missing from rating plan, rating per unit"
                    );
                    RateFormula::default()
                }
            };
            let price = pricing.price(&metric.metric, country);
            rate_metric(metric, &formula, price)
        })
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(AccumulatedUsage {
        accumulated_usage,
        ..doc.clone()
    })
}

/// Rates accumulated usage against the plans named by the document.
#[derive(Debug)]
pub struct Rater<P> {
    plans: P,
    country: String,
}

impl<P> Rater<P>
where
    P: RatingPlans + PricingPlans,
{
    /// Create a rater pricing in `country`.
    #[must_use]
    pub fn new(plans: P, country: String) -> Self {
        Self { plans, country }
    }

    /// Look up the rating and pricing plans of `doc` and rate it.
    ///
    /// # Errors
    ///
    /// Propagates provider failures and rate formula failures. A plan
    /// rejection is returned as [`PlanLookup::Rejected`].
    pub async fn rate(
        &self,
        doc: &AccumulatedUsage,
        auth: Option<&str>,
    ) -> Result<PlanLookup<AccumulatedUsage>, Error> {
        let rating = match self
            .plans
            .rating_plan(&doc.identity.rating_plan_id, auth)
            .await?
        {
            PlanLookup::Found(plan) => plan,
            PlanLookup::Rejected(err) => return Ok(PlanLookup::Rejected(err)),
        };
        let pricing = match self
            .plans
            .pricing_plan(&doc.identity.pricing_plan_id, auth)
            .await?
        {
            PlanLookup::Found(plan) => plan,
            PlanLookup::Rejected(err) => return Ok(PlanLookup::Rejected(err)),
        };
        debug!(
            rating_plan_id = %rating.plan_id,
            pricing_plan_id = %pricing.plan_id,
            country = %self.country,
            "rating accumulated usage"
        );
        rate(doc, &rating, &pricing, &self.country).map(PlanLookup::Found)
    }
}
