//! The usage report tree: organization, spaces, consumers, resources, plans.
//!
//! Reports arrive rated, with a `cost` on every recorded slot, and leave
//! charged, with a `charge` on every recorded slot and the rolled-up `windows`
//! of every node filled in.

use serde::{Deserialize, Serialize};
use tally_window::{TimeWindowSet, reduce::ChargeCell};

use crate::usage::{Metric, UsageCell};

/// Usage of one resource under one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanUsage {
    /// Plan id
    pub plan_id: String,
    /// Metering plan of the usage
    #[serde(default)]
    pub metering_plan_id: String,
    /// Rating plan supplying the charge formulas
    pub rating_plan_id: String,
    /// Pricing plan the usage was rated with
    #[serde(default)]
    pub pricing_plan_id: String,
    /// Total cost, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Per-metric rated windows
    #[serde(default)]
    pub aggregated_usage: Vec<Metric<UsageCell>>,
    /// Charges summed across metrics
    #[serde(default)]
    pub windows: TimeWindowSet<ChargeCell>,
}

/// Usage of one resource across its plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Resource id
    pub resource_id: String,
    /// Usage per plan
    #[serde(default)]
    pub plans: Vec<PlanUsage>,
    /// Charges per metric summed across plans
    #[serde(default, skip_deserializing)]
    pub aggregated_usage: Vec<Metric<ChargeCell>>,
    /// Total cost of the plans
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Charges summed across plans
    #[serde(default)]
    pub windows: TimeWindowSet<ChargeCell>,
}

/// Usage of one consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerUsage {
    /// Consumer id
    pub consumer_id: String,
    /// Usage per resource
    #[serde(default)]
    pub resources: Vec<ResourceUsage>,
    /// Total cost of the resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Charges summed across resources
    #[serde(default)]
    pub windows: TimeWindowSet<ChargeCell>,
}

/// Usage of one space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceUsage {
    /// Space id
    pub space_id: String,
    /// Usage per resource, across consumers
    #[serde(default)]
    pub resources: Vec<ResourceUsage>,
    /// Usage per consumer
    #[serde(default)]
    pub consumers: Vec<ConsumerUsage>,
    /// Total cost of the resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Charges summed across resources
    #[serde(default)]
    pub windows: TimeWindowSet<ChargeCell>,
}

/// Usage of one organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Organization id
    pub organization_id: String,
    /// Time the rated usage was last accumulated, anchors window bounds
    pub processed: i64,
    /// Usage per resource, across spaces
    #[serde(default)]
    pub resources: Vec<ResourceUsage>,
    /// Usage per space
    #[serde(default)]
    pub spaces: Vec<SpaceUsage>,
    /// Total cost of the resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Charges summed across resources
    #[serde(default)]
    pub windows: TimeWindowSet<ChargeCell>,
}
