//! Summaries: attach a reportable figure to every recorded window slot.

use std::sync::Arc;

use tally_formula::{FunctionCache, SummarizeFn, SummarizeFormula, SummarizeInput};
use tally_window::{Slot, time};
use tracing::{debug, warn};

use crate::{
    plan::{MeteringPlan, MeteringPlans, PlanLookup, ProviderError},
    usage::{AccumulatedUsage, Metric, UsageCell},
};

/// Errors produced while summarizing.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The metering plan provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Calendar arithmetic failed.
    #[error("Window error: {0}")]
    Window(#[from] tally_window::Error),
}

/// Attach a summary to every present slot of `metric`. A slot whose formula
/// fails is summarized as zero.
///
/// # Errors
///
/// Fails only when calendar arithmetic fails.
pub fn summarize_metric(
    metric: &Metric<UsageCell>,
    processed: i64,
    time: i64,
    formula: &dyn SummarizeFn,
) -> Result<Metric<UsageCell>, tally_window::Error> {
    let windows = metric
        .windows
        .try_map_slots(|dimension, index, slot| -> Result<_, tally_window::Error> {
            let Some(cell) = slot.as_present() else {
                return Ok(Slot::Absent);
            };
            let offset = i64::try_from(index).map_or(i64::MIN, |i| -i);
            let bounds = time::bounds(processed, dimension, offset)?;
            let input = SummarizeInput {
                time,
                quantity: Some(cell.quantity.current),
                from: bounds.from,
                to: bounds.to,
            };
            let summary = formula.summarize(&input).unwrap_or_else(|err| {
                warn!(metric = %metric.metric, %dimension, index, %err, "failed to summarize");
                0.0
            });
            Ok(Slot::Present(UsageCell {
                summary: Some(summary),
                ..*cell
            }))
        })?;
    metrics::counter!("summarized_metrics").increment(1);
    Ok(Metric {
        metric: metric.metric.clone(),
        windows,
    })
}

fn formula_of(plan: &MeteringPlan, metric: &str) -> SummarizeFormula {
    if let Some(declared) = plan.metric(metric) {
        declared.summarize
    } else {
        warn!(plan_id = %plan.plan_id, metric, "metric missing from metering plan, summarizing quantity");
        SummarizeFormula::default()
    }
}

/// Summarize every metric of `doc` with the formulas of `plan`. Bounds are
/// anchored on the document's processing time.
///
/// # Errors
///
/// Fails only when calendar arithmetic fails.
pub fn summarize_instance(
    time: i64,
    doc: &AccumulatedUsage,
    plan: &MeteringPlan,
) -> Result<AccumulatedUsage, tally_window::Error> {
    let accumulated_usage = doc
        .accumulated_usage
        .iter()
        .map(|metric| summarize_metric(metric, doc.processed, time, &formula_of(plan, &metric.metric)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(AccumulatedUsage {
        accumulated_usage,
        ..doc.clone()
    })
}

/// Summarizes accumulated usage against its metering plan. The formula of
/// every plan metric and every formula result are memoized.
#[derive(Debug)]
pub struct Summarizer<P> {
    plans: P,
    cache: Arc<FunctionCache<SummarizeFormula>>,
}

impl<P> Summarizer<P>
where
    P: MeteringPlans,
{
    /// Create a summarizer looking plans up in `plans`.
    #[must_use]
    pub fn new(plans: P, cache: Arc<FunctionCache<SummarizeFormula>>) -> Self {
        Self { plans, cache }
    }

    /// Resolve the formula of every metric of `doc`, looking the plan up only
    /// when one is not cached.
    async fn formulas(
        &self,
        doc: &AccumulatedUsage,
        auth: Option<&str>,
    ) -> Result<PlanLookup<Vec<SummarizeFormula>>, Error> {
        let plan_id = doc.identity.metering_plan_id.as_str();
        let cached: Option<Vec<SummarizeFormula>> = doc
            .accumulated_usage
            .iter()
            .map(|metric| self.cache.formula(plan_id, &metric.metric))
            .collect();
        if let Some(formulas) = cached {
            return Ok(PlanLookup::Found(formulas));
        }

        debug!(plan_id, "looking up metering plan");
        let plan = match self.plans.metering_plan(plan_id, auth).await? {
            PlanLookup::Found(plan) => plan,
            PlanLookup::Rejected(err) => return Ok(PlanLookup::Rejected(err)),
        };
        let formulas = doc
            .accumulated_usage
            .iter()
            .map(|metric| {
                let formula = formula_of(&plan, &metric.metric);
                self.cache.store_formula(plan_id, &metric.metric, formula);
                formula
            })
            .collect();
        Ok(PlanLookup::Found(formulas))
    }

    /// Look up the metering plan of `doc` and summarize it at `time`.
    ///
    /// # Errors
    ///
    /// Propagates provider failures. A plan rejection is returned as
    /// [`PlanLookup::Rejected`].
    pub async fn summarize(
        &self,
        time: i64,
        doc: &AccumulatedUsage,
        auth: Option<&str>,
    ) -> Result<PlanLookup<AccumulatedUsage>, Error> {
        let formulas = match self.formulas(doc, auth).await? {
            PlanLookup::Found(formulas) => formulas,
            PlanLookup::Rejected(err) => return Ok(PlanLookup::Rejected(err)),
        };
        debug!(plan_id = %doc.identity.metering_plan_id, time, "summarizing accumulated usage");
        let accumulated_usage = doc
            .accumulated_usage
            .iter()
            .zip(&formulas)
            .map(|(metric, formula)| {
                summarize_metric(metric, doc.processed, time, &self.cache.memoized(formula))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PlanLookup::Found(AccumulatedUsage {
            accumulated_usage,
            ..doc.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tally_formula::CacheConfig;
    use tally_window::{Dimension, TimeWindow, TimeWindowSet};

    use super::*;
    use crate::{
        plan::{MeteringMetric, StaticPlans},
        usage::UsageIdentity,
    };

    fn doc() -> AccumulatedUsage {
        let mut windows = TimeWindowSet::empty();
        *windows.window_mut(Dimension::Day) =
            TimeWindow::from_slots(vec![Slot::Present(UsageCell::first(3.0)), Slot::Absent]);
        AccumulatedUsage {
            identity: UsageIdentity {
                organization_id: "org".to_string(),
                space_id: "space".to_string(),
                consumer_id: None,
                resource_id: "object-storage".to_string(),
                plan_id: "basic".to_string(),
                resource_instance_id: "instance".to_string(),
                metering_plan_id: "m".to_string(),
                rating_plan_id: "r".to_string(),
                pricing_plan_id: "p".to_string(),
            },
            start: 0,
            end: 0,
            processed: 0,
            processed_id: None,
            accumulated_usage: vec![Metric {
                metric: "storage".to_string(),
                windows,
            }],
        }
    }

    fn plan(summarize: SummarizeFormula) -> MeteringPlan {
        MeteringPlan {
            plan_id: "m".to_string(),
            metrics: vec![MeteringMetric {
                name: "storage".to_string(),
                accumulate: tally_formula::AccumulateFormula::Sum,
                summarize,
            }],
        }
    }

    fn day_summaries(doc: &AccumulatedUsage) -> Vec<Option<Option<f64>>> {
        doc.accumulated_usage[0]
            .windows
            .window(Dimension::Day)
            .iter()
            .map(|slot| slot.as_present().map(|c| c.summary))
            .collect()
    }

    #[test]
    fn summaries_are_attached_to_present_slots_only() {
        let summarized =
            summarize_instance(0, &doc(), &plan(SummarizeFormula::Scaled { factor: 2.0 })).unwrap();
        assert_eq!(day_summaries(&summarized), vec![Some(Some(6.0)), None]);
    }

    #[test]
    fn failing_summaries_become_zero() {
        let summarized = summarize_instance(
            0,
            &doc(),
            &plan(SummarizeFormula::Scaled { factor: f64::INFINITY }),
        )
        .unwrap();
        assert_eq!(day_summaries(&summarized), vec![Some(Some(0.0)), None]);
    }

    #[tokio::test]
    async fn summarizer_reports_rejections() {
        let cache = Arc::new(FunctionCache::new(CacheConfig::default(), CacheConfig::default()));
        let summarizer = Summarizer::new(StaticPlans::default(), cache);
        let outcome = summarizer.summarize(0, &doc(), None).await.unwrap();
        assert!(matches!(outcome, PlanLookup::Rejected(_)));
    }

    #[tokio::test]
    async fn summarizer_uses_the_metering_plan() {
        let plans = StaticPlans::new(vec![plan(SummarizeFormula::Quantity)], vec![], vec![]);
        let cache = Arc::new(FunctionCache::new(CacheConfig::default(), CacheConfig::default()));
        let summarizer = Summarizer::new(plans, cache);
        let PlanLookup::Found(summarized) = summarizer.summarize(0, &doc(), None).await.unwrap()
        else {
            panic!("expected a summary");
        };
        assert_eq!(day_summaries(&summarized), vec![Some(Some(3.0)), None]);
    }

    #[derive(Debug)]
    struct Counting {
        plans: StaticPlans,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl MeteringPlans for Counting {
        async fn metering_plan(
            &self,
            plan_id: &str,
            auth: Option<&str>,
        ) -> Result<PlanLookup<MeteringPlan>, ProviderError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.plans.metering_plan(plan_id, auth).await
        }
    }

    #[tokio::test]
    async fn metering_plans_are_looked_up_once() {
        let plans = Arc::new(Counting {
            plans: StaticPlans::new(vec![plan(SummarizeFormula::Quantity)], vec![], vec![]),
            lookups: AtomicUsize::new(0),
        });
        let cache = Arc::new(FunctionCache::new(CacheConfig::default(), CacheConfig::default()));
        let summarizer = Summarizer::new(Arc::clone(&plans), cache);
        let first = summarizer.summarize(0, &doc(), None).await.unwrap();
        let second = summarizer.summarize(0, &doc(), None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(plans.lookups.load(Ordering::SeqCst), 1);
    }
}
