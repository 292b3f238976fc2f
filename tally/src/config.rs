//! This module controls configuration parsing from the end user. The file is
//! read first, then environment overrides are applied on top.

use std::{collections::BTreeMap, num::ParseIntError, time::Duration};

use serde::Deserialize;
use tally_formula::CacheConfig;
use tally_window::{Dimension, SlackPolicy, WindowSizes};
use tracing::warn;

use crate::plan::{MeteringPlan, PricingPlan, RatingPlan, StaticPlans};

/// Environment variable overriding [`Config::slack`]
pub const SLACK: &str = "SLACK";
/// Environment variable overriding [`Config::time_windows_sizes`], a JSON map
pub const TIME_WINDOWS_SIZES: &str = "TIME_WINDOWS_SIZES";
/// Environment variable overriding both
/// [`Config::results_cache_max_age_milliseconds`] and
/// [`Config::charge_cache_max_age_milliseconds`]
pub const RESULTS_CACHE_MAX_AGE: &str = "RESULTS_CACHE_MAX_AGE";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// `TIME_WINDOWS_SIZES` is not a JSON map of dimension to length.
    #[error("Failed to parse TIME_WINDOWS_SIZES: {0}")]
    WindowSizes(#[from] serde_json::Error),
    /// `RESULTS_CACHE_MAX_AGE` is not a number of milliseconds.
    #[error("Failed to parse RESULTS_CACHE_MAX_AGE: {0}")]
    CacheMaxAge(#[from] ParseIntError),
}

fn default_results_cache_max_age() -> u64 {
    120_000
}

fn default_charge_cache_max_age() -> u64 {
    300_000
}

fn default_cache_capacity() -> u64 {
    500
}

fn default_pricing_country() -> String {
    "USA".to_string()
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Grace period for late usage, e.g. `10m`
    #[serde(default)]
    pub slack: SlackPolicy,
    /// Retained window length per dimension. Naming a dimension here also
    /// tracks it.
    #[serde(default)]
    pub time_windows_sizes: BTreeMap<Dimension, usize>,
    /// Maximum age of memoized accumulation results
    #[serde(default = "default_results_cache_max_age")]
    pub results_cache_max_age_milliseconds: u64,
    /// Maximum age of cached charge formulas and memoized charges
    #[serde(default = "default_charge_cache_max_age")]
    pub charge_cache_max_age_milliseconds: u64,
    /// Entries per cache table
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    /// Country prices are looked up for when rating
    #[serde(default = "default_pricing_country")]
    pub pricing_country: String,
    /// Metering plans served to the accumulator
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub metering_plans: Vec<MeteringPlan>,
    /// Rating plans served to the rater and charger
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub rating_plans: Vec<RatingPlan>,
    /// Pricing plans served to the rater
    #[serde(default)]
    pub pricing_plans: Vec<PricingPlan>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slack: SlackPolicy::default(),
            time_windows_sizes: BTreeMap::new(),
            results_cache_max_age_milliseconds: default_results_cache_max_age(),
            charge_cache_max_age_milliseconds: default_charge_cache_max_age(),
            cache_capacity: default_cache_capacity(),
            pricing_country: default_pricing_country(),
            metering_plans: Vec::new(),
            rating_plans: Vec::new(),
            pricing_plans: Vec::new(),
        }
    }
}

impl Config {
    /// Parse a YAML configuration.
    ///
    /// # Errors
    ///
    /// Fails when `contents` is not a valid configuration.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Apply environment overrides read through `lookup`. A `SLACK` that does
    /// not parse leaves the default policy in place.
    ///
    /// # Errors
    ///
    /// Fails when `TIME_WINDOWS_SIZES` or `RESULTS_CACHE_MAX_AGE` do not parse.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(slack) = lookup(SLACK) {
            self.slack = slack.parse().unwrap_or_else(|err| {
                warn!(%slack, %err, "invalid SLACK, using the default");
                SlackPolicy::default()
            });
        }
        if let Some(sizes) = lookup(TIME_WINDOWS_SIZES) {
            self.time_windows_sizes = serde_json::from_str(&sizes)?;
        }
        if let Some(max_age) = lookup(RESULTS_CACHE_MAX_AGE) {
            let max_age = max_age.trim().parse()?;
            self.results_cache_max_age_milliseconds = max_age;
            self.charge_cache_max_age_milliseconds = max_age;
        }
        Ok(self)
    }

    /// Window sizes derived from the slack policy and explicit sizes.
    #[must_use]
    pub fn window_sizes(&self) -> WindowSizes {
        WindowSizes::new(self.slack, self.time_windows_sizes.clone())
    }

    /// Cache configuration of the accumulation engine.
    #[must_use]
    pub fn accumulate_cache(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_capacity,
            max_age: Duration::from_millis(self.results_cache_max_age_milliseconds),
        }
    }

    /// Cache configuration of the charge engine.
    #[must_use]
    pub fn charge_cache(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_capacity,
            max_age: Duration::from_millis(self.charge_cache_max_age_milliseconds),
        }
    }

    /// The configured plans, served from memory.
    #[must_use]
    pub fn plans(&self) -> StaticPlans {
        StaticPlans::new(
            self.metering_plans.clone(),
            self.rating_plans.clone(),
            self.pricing_plans.clone(),
        )
    }
}
