//! Bounded, time-expiring memoization of formulas and their results
//!
//! Two independent tables live in a [`FunctionCache`]. The formula table maps
//! a plan id and metric name to the formula the plan names for it, saving a
//! plan lookup per usage. The result table maps a formula identity and the
//! JSON of its arguments to the formula's output.
//!
//! Both tables are [`mini_moka`] caches bounded in entry count, and entries
//! expire a fixed time after insertion whatever their use. This bounds how
//! long an edited plan can be served stale.

use std::{fmt, time::Duration};

use mini_moka::sync::Cache;
use serde::Serialize;
use tracing::debug;

use crate::{
    AccumulateFn, AccumulateInput, CellResolver, ChargeFn, ChargeInput, Error, SummarizeFn,
    SummarizeInput,
};

/// Bounds of one cache table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries. Zero disables the table.
    pub capacity: u64,
    /// Time after insertion past which an entry is no longer served.
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            max_age: Duration::from_millis(120_000),
        }
    }
}

/// One cache table, absent when configured with zero capacity.
struct Table<V> {
    inner: Option<Cache<String, V>>,
}

impl<V> fmt::Debug for Table<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("enabled", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}

impl<V> Table<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn new(config: CacheConfig) -> Self {
        let inner = (config.capacity > 0).then(|| {
            Cache::builder()
                .max_capacity(config.capacity)
                .time_to_live(config.max_age)
                .build()
        });
        Self { inner }
    }

    fn get(&self, key: &str) -> Option<V> {
        self.inner.as_ref().and_then(|cache| cache.get(&key.to_owned()))
    }

    fn insert(&self, key: String, value: V) {
        if let Some(cache) = &self.inner {
            cache.insert(key, value);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |cache| cache.iter().count())
    }
}

/// Process-wide memoization for one family of plan formulas.
///
/// `F` is the formula type stored per plan metric. The result table is shared
/// by every formula evaluated through this cache.
#[derive(Debug)]
pub struct FunctionCache<F> {
    formulas: Table<F>,
    results: Table<Option<f64>>,
}

impl<F> FunctionCache<F>
where
    F: Clone + Send + Sync + 'static,
{
    /// Create a cache with the given bounds for its formula and result tables.
    #[must_use]
    pub fn new(formulas: CacheConfig, results: CacheConfig) -> Self {
        Self {
            formulas: Table::new(formulas),
            results: Table::new(results),
        }
    }

    fn formula_key(plan_id: &str, metric: &str) -> String {
        format!("{plan_id}/{metric}")
    }

    /// The formula cached for `metric` of `plan_id`, if still fresh.
    #[must_use]
    pub fn formula(&self, plan_id: &str, metric: &str) -> Option<F> {
        let found = self.formulas.get(&Self::formula_key(plan_id, metric));
        if found.is_some() {
            metrics::counter!("formula_cache_hit").increment(1);
        } else {
            metrics::counter!("formula_cache_miss").increment(1);
        }
        found
    }

    /// Remember the formula `plan_id` names for `metric`.
    pub fn store_formula(&self, plan_id: &str, metric: &str, formula: F) {
        self.formulas
            .insert(Self::formula_key(plan_id, metric), formula);
    }

    /// Return the memoized output of the formula `identity` for `args`, or
    /// compute and remember it. Errors are returned and never remembered.
    ///
    /// # Errors
    ///
    /// Propagates the error of `compute`.
    pub fn memoize<A, G>(&self, identity: &str, args: &A, compute: G) -> Result<Option<f64>, Error>
    where
        A: Serialize + ?Sized,
        G: FnOnce() -> Result<Option<f64>, Error>,
    {
        let key = match serde_json::to_string(args) {
            Ok(json) => format!("{identity}{json}"),
            Err(err) => {
                debug!(identity, %err, "formula arguments are not cacheable");
                return compute();
            }
        };
        if let Some(hit) = self.results.get(&key) {
            metrics::counter!("result_cache_hit").increment(1);
            return Ok(hit);
        }
        metrics::counter!("result_cache_miss").increment(1);
        let value = compute()?;
        self.results.insert(key, value);
        Ok(value)
    }

    /// Evaluate an accumulation formula through the result table. Formulas
    /// reading the cell resolver are evaluated directly.
    ///
    /// # Errors
    ///
    /// Propagates the formula's error.
    pub fn accumulate<T: AccumulateFn + ?Sized>(
        &self,
        formula: &T,
        input: &AccumulateInput,
        cells: &dyn CellResolver,
    ) -> Result<Option<f64>, Error> {
        if formula.uses_cells() {
            return formula.accumulate(input, cells);
        }
        self.memoize(&formula.identity(), input, || {
            formula.accumulate(input, cells)
        })
    }

    /// Evaluate a charge formula through the result table.
    ///
    /// # Errors
    ///
    /// Propagates the formula's error.
    pub fn charge<T: ChargeFn + ?Sized>(&self, formula: &T, input: &ChargeInput) -> Result<f64, Error> {
        match self.memoize(&formula.identity(), input, || formula.charge(input).map(Some))? {
            Some(charge) => Ok(charge),
            None => formula.charge(input),
        }
    }

    /// Evaluate a summary formula through the result table.
    ///
    /// # Errors
    ///
    /// Propagates the formula's error.
    pub fn summarize<T: SummarizeFn + ?Sized>(
        &self,
        formula: &T,
        input: &SummarizeInput,
    ) -> Result<f64, Error> {
        match self.memoize(&formula.identity(), input, || {
            formula.summarize(input).map(Some)
        })? {
            Some(summary) => Ok(summary),
            None => formula.summarize(input),
        }
    }

    /// Wrap `formula` so every evaluation goes through this cache.
    #[must_use]
    pub fn memoized<'a, T: ?Sized>(&'a self, formula: &'a T) -> Memoized<'a, T, F> {
        Memoized {
            inner: formula,
            cache: self,
        }
    }
}

/// A formula whose evaluations go through a [`FunctionCache`]. Implements the
/// same formula trait as the formula it wraps.
pub struct Memoized<'a, T: ?Sized, F> {
    inner: &'a T,
    cache: &'a FunctionCache<F>,
}

impl<T, F> fmt::Debug for Memoized<'_, T, F>
where
    T: fmt::Debug + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<T, F> AccumulateFn for Memoized<'_, T, F>
where
    T: AccumulateFn + ?Sized,
    F: Clone + Send + Sync + 'static,
{
    fn accumulate(
        &self,
        input: &AccumulateInput,
        cells: &dyn CellResolver,
    ) -> Result<Option<f64>, Error> {
        self.cache.accumulate(self.inner, input, cells)
    }

    fn identity(&self) -> String {
        self.inner.identity()
    }

    fn uses_cells(&self) -> bool {
        self.inner.uses_cells()
    }
}

impl<T, F> ChargeFn for Memoized<'_, T, F>
where
    T: ChargeFn + ?Sized,
    F: Clone + Send + Sync + 'static,
{
    fn charge(&self, input: &ChargeInput) -> Result<f64, Error> {
        self.cache.charge(self.inner, input)
    }

    fn identity(&self) -> String {
        self.inner.identity()
    }
}

impl<T, F> SummarizeFn for Memoized<'_, T, F>
where
    T: SummarizeFn + ?Sized,
    F: Clone + Send + Sync + 'static,
{
    fn summarize(&self, input: &SummarizeInput) -> Result<f64, Error> {
        self.cache.summarize(self.inner, input)
    }

    fn identity(&self) -> String {
        self.inner.identity()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;
    use crate::{AccumulateFormula, ChargeFormula, NoCells};

    fn config(capacity: u64, max_age: Duration) -> CacheConfig {
        CacheConfig { capacity, max_age }
    }

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(60 * n)
    }

    #[test]
    fn entries_expire_after_max_age() {
        let cache: FunctionCache<AccumulateFormula> =
            FunctionCache::new(config(10, Duration::from_millis(50)), config(10, minutes(10)));
        cache.store_formula("basic", "storage", AccumulateFormula::Max);
        assert_eq!(cache.formula("basic", "storage"), Some(AccumulateFormula::Max));

        thread::sleep(Duration::from_millis(150));
        assert_eq!(cache.formula("basic", "storage"), None);
    }

    #[test]
    fn zero_capacity_disables_the_table() {
        let cache: FunctionCache<AccumulateFormula> =
            FunctionCache::new(config(0, minutes(10)), config(0, minutes(10)));
        cache.store_formula("basic", "storage", AccumulateFormula::Max);
        assert_eq!(cache.formula("basic", "storage"), None);

        let calls = AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(Some(1.0))
        };
        cache.memoize("f", &1, compute).unwrap();
        cache.memoize("f", &1, compute).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn formulas_are_keyed_by_plan_and_metric() {
        let cache: FunctionCache<AccumulateFormula> =
            FunctionCache::new(config(10, minutes(10)), config(10, minutes(10)));
        cache.store_formula("basic", "storage", AccumulateFormula::Max);
        assert_eq!(cache.formula("basic", "storage"), Some(AccumulateFormula::Max));
        assert_eq!(cache.formula("basic", "memory"), None);
        assert_eq!(cache.formula("standard", "storage"), None);
    }

    #[test]
    fn results_are_computed_once_per_input() {
        let cache: FunctionCache<AccumulateFormula> =
            FunctionCache::new(config(10, minutes(10)), config(10, minutes(10)));
        let calls = AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(Some(4.0))
        };
        assert_eq!(cache.memoize("f", &(1, 2), compute).unwrap(), Some(4.0));
        assert_eq!(cache.memoize("f", &(1, 2), compute).unwrap(), Some(4.0));
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        assert_eq!(cache.memoize("f", &(1, 3), compute).unwrap(), Some(4.0));
        assert_eq!(cache.memoize("g", &(1, 2), compute).unwrap(), Some(4.0));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn errors_are_not_remembered() {
        let cache: FunctionCache<ChargeFormula> =
            FunctionCache::new(config(10, minutes(10)), config(10, minutes(10)));
        let failing = ChargeFormula::Prorated;
        let input = ChargeInput {
            time: 0,
            cost: Some(1.0),
            from: 5,
            to: 5,
        };
        assert!(cache.charge(&failing, &input).is_err());
        assert!(cache.charge(&failing, &input).is_err());
        assert_eq!(cache.results.len(), 0);
    }

    #[test]
    fn memoized_formulas_share_the_result_table() {
        let cache: FunctionCache<ChargeFormula> =
            FunctionCache::new(config(10, minutes(10)), config(10, minutes(10)));
        let input = ChargeInput {
            time: 0,
            cost: Some(2.0),
            from: 0,
            to: 10,
        };
        let formula = ChargeFormula::Scaled { factor: 3.0 };
        let memoized = cache.memoized(&formula);
        let as_dyn: &dyn ChargeFn = &memoized;
        assert_eq!(as_dyn.charge(&input).unwrap(), 6.0);
        assert_eq!(as_dyn.identity(), formula.identity());
        assert_eq!(cache.results.len(), 1);
    }

    #[test]
    fn accumulate_goes_through_the_result_table() {
        let cache: FunctionCache<AccumulateFormula> =
            FunctionCache::new(config(10, minutes(10)), config(10, minutes(10)));
        let input = AccumulateInput {
            current: 1.0,
            quantity: 2.0,
            start: 0,
            end: 0,
            from: 0,
            to: 10,
        };
        let sum = AccumulateFormula::Sum;
        assert_eq!(cache.accumulate(&sum, &input, &NoCells).unwrap(), Some(3.0));
        assert_eq!(cache.results.len(), 1);

        let month_to_date = AccumulateFormula::MonthToDate;
        assert_eq!(
            cache.accumulate(&month_to_date, &input, &NoCells).unwrap(),
            Some(2.0)
        );
        assert_eq!(cache.results.len(), 1);
    }
}
