//! Accumulation engine behavior across calls.

use std::sync::Arc;

use proptest::prelude::*;
use tally::{
    accumulator::{Accumulator, Error, Outcome, merge},
    ledger::{InMemoryLedger, Submission},
    plan::{MeteringMetric, MeteringPlan, StaticPlans},
    usage::{AccumulatedUsage, MeteredQuantity, MeteredUsage, UsageIdentity},
};
use tally_formula::{AccumulateFn, AccumulateFormula, CacheConfig, FunctionCache, SummarizeFormula};
use tally_window::{Dimension, SlackPolicy, Slot, WindowSizes};

const MINUTE: i64 = 60_000;
const HOUR: i64 = 3_600_000;
const DAY: i64 = 86_400_000;
// 2015-11-01T00:00:00Z
const NOV_1: i64 = 1_446_336_000_000;

fn identity() -> UsageIdentity {
    UsageIdentity {
        organization_id: "a3d7fe4d-3cb1-4cc3-a831-ffe98e20cf27".to_string(),
        space_id: "aaeae239-f3f8-483c-9dd0-de5d41c38b6a".to_string(),
        consumer_id: Some("app:bbeae239-f3f8-483c-9dd0-de6781c38bab".to_string()),
        resource_id: "object-storage".to_string(),
        plan_id: "basic".to_string(),
        resource_instance_id: "0b39fa70-a65f-4183-bae8-385633ca5c87".to_string(),
        metering_plan_id: "basic-object-storage".to_string(),
        rating_plan_id: "object-rating-plan".to_string(),
        pricing_plan_id: "object-pricing-basic".to_string(),
    }
}

fn usage(end: i64, now: i64, quantity: f64) -> MeteredUsage {
    MeteredUsage {
        id: None,
        identity: identity(),
        start: end,
        end,
        processed: Some(now),
        processed_id: None,
        metered_usage: vec![MeteredQuantity {
            metric: "storage".to_string(),
            quantity,
        }],
    }
}

fn stamped(end: i64, now: i64, quantity: f64) -> MeteredUsage {
    MeteredUsage {
        processed: None,
        processed_id: Some(format!("{now}-0-0-1-0")),
        ..usage(end, now, quantity)
    }
}

fn day(doc: &AccumulatedUsage) -> Vec<Option<f64>> {
    doc.accumulated_usage[0]
        .windows
        .window(Dimension::Day)
        .iter()
        .map(|slot| slot.as_present().map(|cell| cell.quantity.current))
        .collect()
}

fn plans() -> StaticPlans {
    StaticPlans::new(
        vec![MeteringPlan {
            plan_id: "basic-object-storage".to_string(),
            metrics: vec![MeteringMetric {
                name: "storage".to_string(),
                accumulate: AccumulateFormula::Sum,
                summarize: SummarizeFormula::Quantity,
            }],
        }],
        vec![],
        vec![],
    )
}

fn accumulator(sizes: WindowSizes) -> Accumulator<StaticPlans> {
    let cache = Arc::new(FunctionCache::new(CacheConfig::default(), CacheConfig::default()));
    Accumulator::new(plans(), sizes, cache)
}

fn slot(doc: &AccumulatedUsage, dimension: Dimension, index: usize) -> Option<(f64, Option<f64>)> {
    doc.accumulated_usage[0]
        .windows
        .slot(dimension, index)
        .and_then(Slot::as_present)
        .map(|cell| (cell.quantity.current, cell.quantity.previous))
}

#[test]
fn quantities_carry_forward() {
    let sizes = WindowSizes::default();
    let sum: [&dyn AccumulateFn; 1] = [&AccumulateFormula::Sum];

    let first = merge(None, &usage(NOV_1 + 1000, NOV_1 + 2000, 5.0), NOV_1 + 2000, &sum, &sizes)
        .unwrap();
    assert_eq!(slot(&first, Dimension::Day, 0), Some((5.0, None)));

    let second = merge(
        Some(&first),
        &usage(NOV_1 + 2500, NOV_1 + 3000, 8.0),
        NOV_1 + 3000,
        &sum,
        &sizes,
    )
    .unwrap();
    assert_eq!(slot(&second, Dimension::Day, 0), Some((13.0, Some(5.0))));
    assert_eq!(slot(&second, Dimension::Month, 0), Some((13.0, Some(5.0))));
    assert_eq!(second.start, NOV_1 + 1000);
    assert_eq!(second.end, NOV_1 + 2500);
}

#[test]
fn identity_formula_end_to_end() {
    let sizes = WindowSizes::all(SlackPolicy::default());
    let formula: [&dyn AccumulateFn; 1] = [&AccumulateFormula::Identity];
    let doc = merge(None, &usage(NOV_1 + 1000, NOV_1 + 2000, 1.0), NOV_1 + 2000, &formula, &sizes)
        .unwrap();
    assert_eq!(slot(&doc, Dimension::Month, 0), Some((1.0, None)));

    let json = serde_json::to_value(&doc).unwrap();
    let month = &json["accumulated_usage"][0]["windows"][4][0];
    assert_eq!(month["quantity"]["current"], 1.0);
    assert!(month["quantity"].get("previous").is_none());
}

#[tokio::test]
async fn slack_boundary_is_ten_minutes() {
    let accumulator = accumulator(WindowSizes::default());
    let last_month_end = NOV_1 - 1;

    let late = usage(last_month_end, NOV_1 + 11 * MINUTE, 1.0);
    let err = accumulator.accumulate(None, &late, None).await.unwrap_err();
    assert!(matches!(err, Error::Slack(_)));
    assert_eq!(err.status(), 409);
    assert!(err.noretry());

    let in_time = usage(last_month_end, NOV_1 + 9 * MINUTE, 1.0);
    let Outcome::Accumulated { doc, marker } =
        accumulator.accumulate(None, &in_time, None).await.unwrap()
    else {
        panic!("expected accumulated usage");
    };
    assert_eq!(slot(&doc, Dimension::Month, 0), None);
    assert_eq!(slot(&doc, Dimension::Month, 1), Some((1.0, None)));
    assert_eq!(marker.key, in_time.reducer_key());
    assert_eq!(marker.processed, NOV_1 + 9 * MINUTE);
}

#[tokio::test]
async fn slack_boundary_follows_processed_id() {
    let accumulator = accumulator(WindowSizes::default());
    let last_month_end = NOV_1 - 1;

    let late = stamped(last_month_end, NOV_1 + 11 * MINUTE, 1.0);
    let err = accumulator.accumulate(None, &late, None).await.unwrap_err();
    assert!(matches!(err, Error::Slack(_)));

    let in_time = stamped(last_month_end, NOV_1 + 9 * MINUTE, 1.0);
    let Outcome::Accumulated { doc, marker } =
        accumulator.accumulate(None, &in_time, None).await.unwrap()
    else {
        panic!("expected accumulated usage");
    };
    assert_eq!(doc.processed, NOV_1 + 9 * MINUTE);
    assert_eq!(doc.processed_id, in_time.processed_id);
    assert_eq!(marker.processed, NOV_1 + 9 * MINUTE);
    assert_eq!(slot(&doc, Dimension::Month, 1), Some((1.0, None)));
}

#[tokio::test]
async fn repeated_accumulation_is_idempotent() {
    let accumulator = accumulator(WindowSizes::default());
    let first = stamped(NOV_1 + 1000, NOV_1 + 2000, 5.0);
    let once = accumulator.accumulate(None, &first, None).await.unwrap();
    let twice = accumulator.accumulate(None, &first, None).await.unwrap();
    assert_eq!(once, twice);

    let Outcome::Accumulated { doc, .. } = once else {
        panic!("expected accumulated usage");
    };
    let next = stamped(NOV_1 + DAY + 1000, NOV_1 + DAY + 2000, 8.0);
    let once = accumulator.accumulate(Some(&doc), &next, None).await.unwrap();
    let twice = accumulator.accumulate(Some(&doc), &next, None).await.unwrap();
    assert_eq!(once, twice);
}

#[test]
fn older_processing_times_never_move_windows_back() {
    let sizes = WindowSizes::default();
    let sum: [&dyn AccumulateFn; 1] = [&AccumulateFormula::Sum];
    let nov_2 = NOV_1 + DAY;

    let first = merge(None, &usage(nov_2, nov_2, 5.0), nov_2, &sum, &sizes).unwrap();
    let late = usage(nov_2 - HOUR, nov_2 - HOUR, 3.0);
    let second = merge(Some(&first), &late, nov_2 - HOUR, &sum, &sizes).unwrap();
    assert_eq!(second.processed, nov_2);
    assert_eq!(day(&second), vec![Some(5.0), Some(3.0)]);

    let third = merge(
        Some(&second),
        &usage(nov_2 + HOUR, nov_2 + HOUR, 1.0),
        nov_2 + HOUR,
        &sum,
        &sizes,
    )
    .unwrap();
    assert_eq!(third.processed, nov_2 + HOUR);
    assert_eq!(day(&third), vec![Some(6.0), Some(3.0)]);
    assert_eq!(slot(&third, Dimension::Month, 0), Some((9.0, Some(8.0))));
}

#[tokio::test]
async fn unknown_metrics_are_rejected_as_data() {
    let accumulator = accumulator(WindowSizes::default());
    let mut unknown = usage(NOV_1 + 1000, NOV_1 + 2000, 1.0);
    unknown.metered_usage[0].metric = "memory".to_string();
    let Outcome::Rejected(rejected) = accumulator.accumulate(None, &unknown, None).await.unwrap()
    else {
        panic!("expected a rejection");
    };
    assert_eq!(rejected.error, "emetric");
    assert_eq!(rejected.usage, unknown);
}

#[tokio::test]
async fn ledger_keeps_the_latest_document_per_key() {
    let ledger = InMemoryLedger::new(accumulator(WindowSizes::default()));
    let mut first = usage(NOV_1 + 1000, NOV_1 + 2000, 5.0);
    first.id = Some("1".to_string());
    let mut second = usage(NOV_1 + DAY + 1000, NOV_1 + DAY + 2000, 8.0);
    second.id = Some("2".to_string());

    assert_eq!(ledger.submit(&first, None).await.unwrap().status(), 201);
    assert_eq!(ledger.submit(&second, None).await.unwrap().status(), 201);
    assert_eq!(
        ledger.submit(&first, None).await.unwrap(),
        Submission::Duplicate { id: "1".to_string() }
    );

    let latest = ledger.latest(&first.reducer_key()).await.unwrap();
    assert_eq!(slot(&latest, Dimension::Day, 0), Some((8.0, None)));
    assert_eq!(slot(&latest, Dimension::Month, 0), Some((13.0, Some(5.0))));
}

fn arb_steps() -> impl Strategy<Value = Vec<(i64, i64, f64)>> {
    proptest::collection::vec((1..3 * DAY, 0..2 * DAY, 0.0..1000.0_f64), 1..12)
}

fn arb_sizes() -> impl Strategy<Value = WindowSizes> {
    prop_oneof![
        Just(WindowSizes::default()),
        Just(WindowSizes::all(SlackPolicy::default())),
        Just(WindowSizes::all(SlackPolicy::new(Dimension::Day, 2))),
    ]
}

proptest! {
    #[test]
    fn windows_never_shrink(steps in arb_steps(), sizes in arb_sizes()) {
        let sum: [&dyn AccumulateFn; 1] = [&AccumulateFormula::Sum];
        let mut now = NOV_1;
        let mut previous: Option<AccumulatedUsage> = None;
        for (advance, lag, quantity) in steps {
            now += advance;
            let next = merge(previous.as_ref(), &usage(now - lag, now, quantity), now, &sum, &sizes)
                .unwrap();
            if let Some(previous) = &previous {
                for dimension in Dimension::ALL {
                    prop_assert!(
                        next.accumulated_usage[0].windows.window(dimension).len()
                            >= previous.accumulated_usage[0].windows.window(dimension).len()
                    );
                }
            }
            previous = Some(next);
        }
    }

    #[test]
    fn merge_is_idempotent(steps in arb_steps(), sizes in arb_sizes()) {
        let sum: [&dyn AccumulateFn; 1] = [&AccumulateFormula::Sum];
        let mut now = NOV_1;
        let mut previous: Option<AccumulatedUsage> = None;
        for (advance, lag, quantity) in steps {
            now += advance;
            let observed = usage(now - lag, now, quantity);
            let once = merge(previous.as_ref(), &observed, now, &sum, &sizes).unwrap();
            let twice = merge(previous.as_ref(), &observed, now, &sum, &sizes).unwrap();
            prop_assert_eq!(
                serde_json::to_string(&once).unwrap(),
                serde_json::to_string(&twice).unwrap()
            );
            previous = Some(once);
        }
    }
}
