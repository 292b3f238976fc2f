//! Metering, rating and pricing plans and the providers serving them
//!
//! Plans live outside the engine. A provider answers a lookup either with the
//! plan, with a business rejection that is reported as data, or with a
//! transient error that is propagated for the caller to retry.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tally_formula::{AccumulateFormula, ChargeFormula, RateFormula, SummarizeFormula};
use tracing::debug;

/// Errors produced by plan providers. Always transient.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider could not be reached or did not answer in time.
    #[error("Plan provider unavailable for plan {plan_id}: {reason}")]
    Unavailable {
        /// Plan being looked up
        plan_id: String,
        /// Cause reported by the transport
        reason: String,
    },
}

/// A business-level rejection of a plan lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanError {
    /// Machine readable error code
    pub error: String,
    /// Human readable reason
    pub reason: String,
}

impl PlanError {
    /// The plan id is not known to the provider.
    #[must_use]
    pub fn unknown_plan(kind: &str, plan_id: &str) -> Self {
        Self {
            error: format!("e{kind}plan"),
            reason: format!("{kind} plan {plan_id} not found"),
        }
    }

    /// The plan does not declare a metric that was metered.
    #[must_use]
    pub fn unknown_metric(plan_id: &str, metric: &str) -> Self {
        Self {
            error: "emetric".to_string(),
            reason: format!("metric {metric} is not declared by plan {plan_id}"),
        }
    }
}

/// Outcome of a plan lookup that reached the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanLookup<T> {
    /// The plan was found.
    Found(T),
    /// The provider rejected the lookup.
    Rejected(PlanError),
}

/// One metric of a metering plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeteringMetric {
    /// Metric name
    pub name: String,
    /// How quantities accumulate into window slots
    #[serde(default)]
    pub accumulate: AccumulateFormula,
    /// How accumulated quantities are summarized for reports
    #[serde(default)]
    pub summarize: SummarizeFormula,
}

/// Accumulation and summary formulas per metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeteringPlan {
    /// Plan id
    pub plan_id: String,
    /// Declared metrics
    pub metrics: Vec<MeteringMetric>,
}

impl MeteringPlan {
    /// The declaration of `name`, if any.
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<&MeteringMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

#[allow(clippy::unnecessary_wraps)]
fn default_charge() -> Option<ChargeFormula> {
    Some(ChargeFormula::Cost)
}

/// One metric of a rating plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RatingMetric {
    /// Metric name
    pub name: String,
    /// How a quantity and a price become a cost
    #[serde(default)]
    pub rate: RateFormula,
    /// How a cost becomes a charge. Explicitly empty means slots pass through
    /// charging untouched.
    #[serde(default = "default_charge")]
    pub charge: Option<ChargeFormula>,
}

/// Rate and charge formulas per metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RatingPlan {
    /// Plan id
    pub plan_id: String,
    /// Declared metrics
    pub metrics: Vec<RatingMetric>,
}

impl RatingPlan {
    /// The declaration of `name`, if any.
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<&RatingMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

/// Price of a metric in one country.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Price {
    /// Country code, e.g. `USA`
    pub country: String,
    /// Price per unit
    pub price: f64,
}

/// Prices of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingMetric {
    /// Metric name
    pub name: String,
    /// Per-country prices
    pub prices: Vec<Price>,
}

/// Prices per metric and country.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingPlan {
    /// Plan id
    pub plan_id: String,
    /// Priced metrics
    pub metrics: Vec<PricingMetric>,
}

impl PricingPlan {
    /// Price of `metric` in `country`, zero when not priced.
    #[must_use]
    pub fn price(&self, metric: &str, country: &str) -> f64 {
        self.metrics
            .iter()
            .find(|m| m.name == metric)
            .and_then(|m| m.prices.iter().find(|p| p.country == country))
            .map_or(0.0, |p| p.price)
    }
}

/// Serves metering plans.
#[async_trait]
pub trait MeteringPlans: Send + Sync {
    /// Look up metering plan `plan_id`.
    async fn metering_plan(
        &self,
        plan_id: &str,
        auth: Option<&str>,
    ) -> Result<PlanLookup<MeteringPlan>, ProviderError>;
}

/// Serves rating plans.
#[async_trait]
pub trait RatingPlans: Send + Sync {
    /// Look up rating plan `plan_id`.
    async fn rating_plan(
        &self,
        plan_id: &str,
        auth: Option<&str>,
    ) -> Result<PlanLookup<RatingPlan>, ProviderError>;
}

/// Serves pricing plans.
#[async_trait]
pub trait PricingPlans: Send + Sync {
    /// Look up pricing plan `plan_id`.
    async fn pricing_plan(
        &self,
        plan_id: &str,
        auth: Option<&str>,
    ) -> Result<PlanLookup<PricingPlan>, ProviderError>;
}

#[async_trait]
impl<T: MeteringPlans + ?Sized> MeteringPlans for Arc<T> {
    async fn metering_plan(
        &self,
        plan_id: &str,
        auth: Option<&str>,
    ) -> Result<PlanLookup<MeteringPlan>, ProviderError> {
        (**self).metering_plan(plan_id, auth).await
    }
}

#[async_trait]
impl<T: RatingPlans + ?Sized> RatingPlans for Arc<T> {
    async fn rating_plan(
        &self,
        plan_id: &str,
        auth: Option<&str>,
    ) -> Result<PlanLookup<RatingPlan>, ProviderError> {
        (**self).rating_plan(plan_id, auth).await
    }
}

#[async_trait]
impl<T: PricingPlans + ?Sized> PricingPlans for Arc<T> {
    async fn pricing_plan(
        &self,
        plan_id: &str,
        auth: Option<&str>,
    ) -> Result<PlanLookup<PricingPlan>, ProviderError> {
        (**self).pricing_plan(plan_id, auth).await
    }
}

/// Plans held in memory, as loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPlans {
    metering: FxHashMap<String, MeteringPlan>,
    rating: FxHashMap<String, RatingPlan>,
    pricing: FxHashMap<String, PricingPlan>,
}

impl StaticPlans {
    /// Index the given plans by id. A later plan replaces an earlier one with
    /// the same id.
    #[must_use]
    pub fn new(
        metering: Vec<MeteringPlan>,
        rating: Vec<RatingPlan>,
        pricing: Vec<PricingPlan>,
    ) -> Self {
        Self {
            metering: metering.into_iter().map(|p| (p.plan_id.clone(), p)).collect(),
            rating: rating.into_iter().map(|p| (p.plan_id.clone(), p)).collect(),
            pricing: pricing.into_iter().map(|p| (p.plan_id.clone(), p)).collect(),
        }
    }

    fn lookup<T: Clone>(
        plans: &FxHashMap<String, T>,
        kind: &str,
        plan_id: &str,
    ) -> PlanLookup<T> {
        if let Some(plan) = plans.get(plan_id) {
            PlanLookup::Found(plan.clone())
        } else {
            debug!(kind, plan_id, "plan not found");
            PlanLookup::Rejected(PlanError::unknown_plan(kind, plan_id))
        }
    }
}

#[async_trait]
impl MeteringPlans for StaticPlans {
    async fn metering_plan(
        &self,
        plan_id: &str,
        _auth: Option<&str>,
    ) -> Result<PlanLookup<MeteringPlan>, ProviderError> {
        Ok(Self::lookup(&self.metering, "metering", plan_id))
    }
}

#[async_trait]
impl RatingPlans for StaticPlans {
    async fn rating_plan(
        &self,
        plan_id: &str,
        _auth: Option<&str>,
    ) -> Result<PlanLookup<RatingPlan>, ProviderError> {
        Ok(Self::lookup(&self.rating, "rating", plan_id))
    }
}

#[async_trait]
impl PricingPlans for StaticPlans {
    async fn pricing_plan(
        &self,
        plan_id: &str,
        _auth: Option<&str>,
    ) -> Result<PlanLookup<PricingPlan>, ProviderError> {
        Ok(Self::lookup(&self.pricing, "pricing", plan_id))
    }
}
