//! Usage documents
//!
//! Metered usage enters the engine, accumulated usage leaves it. Both carry
//! the same identity: who used the resource, under which plans.

use serde::{Deserialize, Serialize};
use tally_window::{TimeWindowSet, reduce::Charged};

use crate::plan::PlanError;

const UNKNOWN_CONSUMER: &str = "UNKNOWN";

/// Who used which resource, under which plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageIdentity {
    /// Owning organization
    pub organization_id: String,
    /// Space inside the organization
    pub space_id: String,
    /// Consuming application, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    /// Metered resource type
    pub resource_id: String,
    /// Plan the resource is used under
    pub plan_id: String,
    /// Metered resource instance
    pub resource_instance_id: String,
    /// Plan supplying accumulation formulas
    pub metering_plan_id: String,
    /// Plan supplying rate and charge formulas
    pub rating_plan_id: String,
    /// Plan supplying prices
    pub pricing_plan_id: String,
}

impl UsageIdentity {
    /// The key usage is partitioned and serialized by. Every observation with
    /// the same key is accumulated into the same document.
    #[must_use]
    pub fn reducer_key(&self) -> String {
        [
            self.organization_id.as_str(),
            self.resource_instance_id.as_str(),
            self.consumer_id.as_deref().unwrap_or(UNKNOWN_CONSUMER),
            self.resource_id.as_str(),
            self.plan_id.as_str(),
            self.metering_plan_id.as_str(),
            self.rating_plan_id.as_str(),
            self.pricing_plan_id.as_str(),
        ]
        .join("/")
    }
}

/// Parse the processing time out of a processed id. Ids start with the time
/// in milliseconds, optionally followed by a sequence suffix.
#[must_use]
pub fn parse_processed_id(processed_id: &str) -> Option<i64> {
    let digits = processed_id
        .find(|c: char| !c.is_ascii_digit())
        .map_or(processed_id, |end| &processed_id[..end]);
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// One metric's quantity inside a usage observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteredQuantity {
    /// Metric name as declared by the metering plan
    pub metric: String,
    /// Observed quantity
    pub quantity: f64,
}

/// A single metered usage observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteredUsage {
    /// Id of the input document, used for duplicate detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Usage identity
    #[serde(flatten)]
    pub identity: UsageIdentity,
    /// Start of the usage, epoch milliseconds
    pub start: i64,
    /// End of the usage, epoch milliseconds
    pub end: i64,
    /// Processing time, epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<i64>,
    /// Processing sequence id, leading digits are the processing time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_id: Option<String>,
    /// Observed quantities
    pub metered_usage: Vec<MeteredQuantity>,
}

impl MeteredUsage {
    /// The time the usage is accumulated at: the time encoded in
    /// `processed_id`, else `processed`.
    #[must_use]
    pub fn processed_time(&self) -> Option<i64> {
        self.processed_id
            .as_deref()
            .and_then(parse_processed_id)
            .or(self.processed)
    }

    /// See [`UsageIdentity::reducer_key`].
    #[must_use]
    pub fn reducer_key(&self) -> String {
        self.identity.reducer_key()
    }

    /// Observations of the same group are delivered to the same accumulation
    /// sequence. The group is the reducer key.
    #[must_use]
    pub fn group(&self) -> String {
        self.reducer_key()
    }

    /// Identifier recorded once this observation is consumed: the input id
    /// when present, else the key and interval.
    #[must_use]
    pub fn dedup_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!("{}/{}/{}", self.reducer_key(), self.end, self.start),
        }
    }
}

/// Accumulated and previous quantity of a window slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    /// Value after the latest write
    pub current: f64,
    /// Value before the latest write, absent after the first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<f64>,
}

/// Contents of a present usage window slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCell {
    /// Accumulated quantity
    #[serde(default)]
    pub quantity: Quantity,
    /// Rated cost
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Computed charge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge: Option<f64>,
    /// Reportable summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<f64>,
}

impl UsageCell {
    /// A cell holding only a first write of `current`.
    #[must_use]
    pub const fn first(current: f64) -> Self {
        Self {
            quantity: Quantity {
                current,
                previous: None,
            },
            cost: None,
            charge: None,
            summary: None,
        }
    }
}

impl Charged for UsageCell {
    fn charge(&self) -> Option<f64> {
        self.charge
    }
}

/// Windows of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric<T> {
    /// Metric name
    pub metric: String,
    /// Per-dimension windows
    pub windows: TimeWindowSet<T>,
}

/// The running accumulation for one reducer key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatedUsage {
    /// Usage identity
    #[serde(flatten)]
    pub identity: UsageIdentity,
    /// Start of the first accumulated usage
    pub start: i64,
    /// End of the latest accumulated usage
    pub end: i64,
    /// Time of the latest accumulation
    pub processed: i64,
    /// Processed id of the latest accumulated usage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_id: Option<String>,
    /// Per-metric windows
    pub accumulated_usage: Vec<Metric<UsageCell>>,
}

impl AccumulatedUsage {
    /// Windows of `metric`, if accumulated.
    #[must_use]
    pub fn metric(&self, metric: &str) -> Option<&Metric<UsageCell>> {
        self.accumulated_usage.iter().find(|m| m.metric == metric)
    }
}

/// Record that an input was consumed. Handed to the reducer alongside the
/// accumulated document so replays of the input can be suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupMarker {
    /// Dedup id of the consumed input
    pub id: String,
    /// Reducer key the input was accumulated under
    pub key: String,
    /// Time the input was accumulated at
    pub processed: i64,
}

/// Usage that was not accumulated because a plan rejected it. A terminal,
/// non-fatal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedUsage {
    /// The usage as submitted
    #[serde(flatten)]
    pub usage: MeteredUsage,
    /// Business error code
    pub error: String,
    /// Human readable reason
    pub reason: String,
}

impl RejectedUsage {
    /// Attach `error` to `usage`.
    #[must_use]
    pub fn new(usage: MeteredUsage, error: PlanError) -> Self {
        Self {
            usage,
            error: error.error,
            reason: error.reason,
        }
    }
}
