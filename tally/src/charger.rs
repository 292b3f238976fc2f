//! The charge engine
//!
//! Charges every recorded slot of every metric with the formula its rating
//! plan declares, then rolls charges up the report tree with
//! [`build_windows`]. Siblings are charged as independent tasks and joined
//! before their parent reduces; the roll-up is commutative so their completion
//! order does not matter.
//!
//! A formula failing on a slot charges that slot zero. One bad formula never
//! voids a report.

use std::{future::Future, sync::Arc};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tally_formula::{ChargeFn, ChargeFormula, ChargeInput, FunctionCache, charge::Zero};
use tally_window::{
    Slot, TimeWindowSet,
    reduce::{ChargeCell, build_windows, sum_costs},
    time,
};
use tracing::{debug, warn};

use crate::{
    plan::{PlanLookup, ProviderError, RatingPlans},
    report::{ConsumerUsage, PlanUsage, Report, ResourceUsage, SpaceUsage},
    usage::{AccumulatedUsage, Metric, UsageCell},
};

/// Errors produced by [`Charger`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The rating plan provider rejected the lookup.
    #[error("Rating plan {plan_id} rejected: {error}: {reason}")]
    RatingPlan {
        /// Rating plan looked up
        plan_id: String,
        /// Business error code
        error: String,
        /// Human readable reason
        reason: String,
    },
    /// The rating plan provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Calendar arithmetic failed.
    #[error("Window error: {0}")]
    Window(#[from] tally_window::Error),
}

impl Error {
    /// HTTP-equivalent status for this error. Plan rejections are business
    /// errors reported with a successful status.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Error::RatingPlan { .. } => 200,
            Error::Provider(_) => 502,
            Error::Window(_) => 400,
        }
    }
}

/// How one metric of a rating plan is charged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChargeRule {
    /// Charge with the formula.
    Apply(ChargeFormula),
    /// The plan declares the metric without a charge formula: slots pass
    /// through with no charge.
    PassThrough,
    /// The plan no longer declares the metric: slots are charged zero.
    Retired,
}

/// Charge every present slot of `metric` with `formula`.
///
/// Window bounds are computed relative to `processed`; `time` is the time the
/// charge is computed at. Without a formula present slots are copied
/// unchanged. A slot whose formula fails is charged zero.
///
/// # Errors
///
/// Fails only when calendar arithmetic fails.
pub fn charge_metric(
    metric: &Metric<UsageCell>,
    processed: i64,
    time: i64,
    formula: Option<&dyn ChargeFn>,
) -> Result<Metric<UsageCell>, tally_window::Error> {
    let windows = metric
        .windows
        .try_map_slots(|dimension, index, slot| -> Result<_, tally_window::Error> {
            let Some(cell) = slot.as_present() else {
                return Ok(Slot::Absent);
            };
            let Some(formula) = formula else {
                return Ok(Slot::Present(*cell));
            };
            let offset = i64::try_from(index).map_or(i64::MIN, |i| -i);
            let bounds = time::bounds(processed, dimension, offset)?;
            let input = ChargeInput {
                time,
                cost: cell.cost,
                from: bounds.from,
                to: bounds.to,
            };
            let charge = match formula.charge(&input) {
                Ok(charge) => charge,
                Err(err) => {
                    metrics::counter!("charge_formula_failure").increment(1);
                    warn!(
                        metric = %metric.metric,
                        %dimension,
                        index,
                        %err,
                        "failed to calculate charge"
                    );
                    0.0
                }
            };
            Ok(Slot::Present(UsageCell {
                charge: Some(charge),
                ..*cell
            }))
        })?;
    metrics::counter!("charged_metrics").increment(1);
    Ok(Metric {
        metric: metric.metric.clone(),
        windows,
    })
}

/// Charged accumulated usage of one resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargedInstance {
    /// The accumulated usage, with charges on every present slot
    #[serde(flatten)]
    pub doc: AccumulatedUsage,
    /// Charges summed across metrics
    pub windows: TimeWindowSet<ChargeCell>,
}

/// Time context of one charge request.
#[derive(Debug, Clone, Copy)]
pub struct Query<'a> {
    /// Time the charges are computed at
    pub time: i64,
    /// Time window bounds are anchored on
    pub processed: i64,
    /// Credentials for the rating plan provider
    pub auth: Option<&'a str>,
}

/// Charge every item on its own task, yielding between them, and collect
/// the results in input order.
async fn fan_out<T, U, F, Fut>(items: Vec<T>, f: F) -> Result<Vec<U>, Error>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<U, Error>>,
{
    try_join_all(items.into_iter().map(|item| {
        let charge = f(item);
        async move {
            tokio::task::yield_now().await;
            charge.await
        }
    }))
    .await
}

/// Charges rated usage against rating plans.
#[derive(Debug)]
pub struct Charger<R> {
    plans: R,
    cache: Arc<FunctionCache<ChargeRule>>,
}

impl<R> Charger<R>
where
    R: RatingPlans,
{
    /// Create a charger looking plans up in `plans`.
    #[must_use]
    pub fn new(plans: R, cache: Arc<FunctionCache<ChargeRule>>) -> Self {
        Self { plans, cache }
    }

    /// The charge rule of every metric in `metrics`, looking the rating plan
    /// up only when one is not cached.
    async fn rules(
        &self,
        plan_id: &str,
        metrics: &[&str],
        auth: Option<&str>,
    ) -> Result<Vec<ChargeRule>, Error> {
        let cached: Option<Vec<ChargeRule>> = metrics
            .iter()
            .map(|metric| self.cache.formula(plan_id, metric))
            .collect();
        if let Some(rules) = cached {
            return Ok(rules);
        }

        debug!(plan_id, "looking up rating plan");
        let plan = match self.plans.rating_plan(plan_id, auth).await? {
            PlanLookup::Found(plan) => plan,
            PlanLookup::Rejected(err) => {
                warn!(plan_id, error = %err.error, reason = %err.reason, "rating plan rejected");
                return Err(Error::RatingPlan {
                    plan_id: plan_id.to_string(),
                    error: err.error,
                    reason: err.reason,
                });
            }
        };
        let rules = metrics
            .iter()
            .map(|metric| {
                let rule = match plan.metric(metric) {
                    Some(declared) => declared.charge.map_or(ChargeRule::PassThrough, ChargeRule::Apply),
                    None => ChargeRule::Retired,
                };
                self.cache.store_formula(plan_id, metric, rule);
                rule
            })
            .collect();
        Ok(rules)
    }

    fn charge_with_rule(
        &self,
        plan_id: &str,
        metric: &Metric<UsageCell>,
        rule: ChargeRule,
        query: Query<'_>,
    ) -> Result<Metric<UsageCell>, Error> {
        let charged = match rule {
            ChargeRule::Apply(formula) => {
                let memoized = self.cache.memoized(&formula);
                charge_metric(metric, query.processed, query.time, Some(&memoized))?
            }
            ChargeRule::PassThrough => charge_metric(metric, query.processed, query.time, None)?,
            ChargeRule::Retired => {
                warn!(
                    plan_id,
                    metric = %metric.metric,
                    "plan change detected, metric missing from rating plan"
                );
                charge_metric(metric, query.processed, query.time, Some(&Zero))?
            }
        };
        Ok(charged)
    }

    async fn charge_metrics(
        &self,
        plan_id: &str,
        metrics: &[Metric<UsageCell>],
        query: Query<'_>,
    ) -> Result<Vec<Metric<UsageCell>>, Error> {
        let names: Vec<&str> = metrics.iter().map(|m| m.metric.as_str()).collect();
        let rules = self.rules(plan_id, &names, query.auth).await?;
        metrics
            .iter()
            .zip(rules)
            .map(|(metric, rule)| self.charge_with_rule(plan_id, metric, rule, query))
            .collect()
    }

    /// Charge the metrics of one plan and sum them into the plan's windows.
    ///
    /// # Errors
    ///
    /// Fails when the rating plan cannot be obtained.
    pub async fn charge_plan(&self, query: Query<'_>, plan: PlanUsage) -> Result<PlanUsage, Error> {
        let aggregated_usage = self
            .charge_metrics(&plan.rating_plan_id, &plan.aggregated_usage, query)
            .await?;
        let windows = build_windows(aggregated_usage.iter().map(|m| &m.windows));
        metrics::counter!("charged_plans").increment(1);
        Ok(PlanUsage {
            aggregated_usage,
            windows,
            ..plan
        })
    }

    /// Charge every plan of a resource, then sum per metric and overall.
    ///
    /// # Errors
    ///
    /// Fails when a rating plan cannot be obtained.
    pub async fn charge_resource(
        &self,
        query: Query<'_>,
        resource: ResourceUsage,
    ) -> Result<ResourceUsage, Error> {
        debug!(resource_id = %resource.resource_id, "charging resource");
        let ResourceUsage {
            resource_id, plans, ..
        } = resource;
        let plans = fan_out(plans, |plan| self.charge_plan(query, plan)).await?;

        let mut names: Vec<&str> = Vec::new();
        for metric in plans.iter().flat_map(|p| &p.aggregated_usage) {
            if !names.contains(&metric.metric.as_str()) {
                names.push(&metric.metric);
            }
        }
        let aggregated_usage = names
            .iter()
            .map(|name| Metric {
                metric: (*name).to_string(),
                windows: build_windows(
                    plans
                        .iter()
                        .flat_map(|p| &p.aggregated_usage)
                        .filter(|m| m.metric == *name)
                        .map(|m| &m.windows),
                ),
            })
            .collect();
        let windows = build_windows(plans.iter().map(|p| &p.windows));
        let cost = plans.iter().map(|p| p.cost).fold(None, sum_costs);
        metrics::counter!("charged_resources").increment(1);
        Ok(ResourceUsage {
            resource_id,
            plans,
            aggregated_usage,
            cost,
            windows,
        })
    }

    /// Charge every resource of a consumer.
    ///
    /// # Errors
    ///
    /// Fails when a rating plan cannot be obtained.
    pub async fn charge_consumer(
        &self,
        query: Query<'_>,
        consumer: ConsumerUsage,
    ) -> Result<ConsumerUsage, Error> {
        debug!(consumer_id = %consumer.consumer_id, "charging consumer");
        let resources = fan_out(consumer.resources, |r| self.charge_resource(query, r)).await?;
        let windows = build_windows(resources.iter().map(|r| &r.windows));
        let cost = resources.iter().map(|r| r.cost).fold(None, sum_costs);
        metrics::counter!("charged_consumers").increment(1);
        Ok(ConsumerUsage {
            consumer_id: consumer.consumer_id,
            resources,
            cost,
            windows,
        })
    }

    /// Charge every resource and consumer of a space. The space's windows sum
    /// its resources.
    ///
    /// # Errors
    ///
    /// Fails when a rating plan cannot be obtained.
    pub async fn charge_space(&self, query: Query<'_>, space: SpaceUsage) -> Result<SpaceUsage, Error> {
        debug!(space_id = %space.space_id, "charging space");
        let resources = fan_out(space.resources, |r| self.charge_resource(query, r)).await?;
        let consumers = fan_out(space.consumers, |c| self.charge_consumer(query, c)).await?;
        let windows = build_windows(resources.iter().map(|r| &r.windows));
        let cost = resources.iter().map(|r| r.cost).fold(None, sum_costs);
        metrics::counter!("charged_spaces").increment(1);
        Ok(SpaceUsage {
            space_id: space.space_id,
            resources,
            consumers,
            cost,
            windows,
        })
    }

    /// Charge a whole organization report at `time`.
    ///
    /// # Errors
    ///
    /// Fails when a rating plan cannot be obtained.
    pub async fn charge_report(
        &self,
        time: i64,
        report: Report,
        auth: Option<&str>,
    ) -> Result<Report, Error> {
        debug!(organization_id = %report.organization_id, time, "charging report");
        let query = Query {
            time,
            processed: report.processed,
            auth,
        };
        let resources = fan_out(report.resources, |r| self.charge_resource(query, r)).await?;
        let spaces = fan_out(report.spaces, |s| self.charge_space(query, s)).await?;
        let windows = build_windows(resources.iter().map(|r| &r.windows));
        let cost = resources.iter().map(|r| r.cost).fold(None, sum_costs);
        Ok(Report {
            organization_id: report.organization_id,
            processed: report.processed,
            resources,
            spaces,
            cost,
            windows,
        })
    }

    /// Charge the accumulated usage of one resource instance against its own
    /// rating plan.
    ///
    /// # Errors
    ///
    /// Fails when the rating plan cannot be obtained.
    pub async fn charge_instance(
        &self,
        time: i64,
        doc: AccumulatedUsage,
        auth: Option<&str>,
    ) -> Result<ChargedInstance, Error> {
        let query = Query {
            time,
            processed: doc.processed,
            auth,
        };
        let accumulated_usage = self
            .charge_metrics(&doc.identity.rating_plan_id, &doc.accumulated_usage, query)
            .await?;
        let windows = build_windows(accumulated_usage.iter().map(|m| &m.windows));
        Ok(ChargedInstance {
            doc: AccumulatedUsage {
                accumulated_usage,
                ..doc
            },
            windows,
        })
    }
}
