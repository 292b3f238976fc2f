//! Null-preserving charge roll-ups
//!
//! Charges are summed slot by slot across entities: plans into a resource,
//! resources into a consumer or space, and so on. A summed slot is present as
//! soon as any contributing slot is present; absent slots contribute nothing
//! and never turn into zeros on their own.

use serde::{Deserialize, Serialize};

use crate::{Dimension, Slot, TimeWindow, TimeWindowSet};

/// A slot value that may carry a charge.
pub trait Charged {
    /// The charge, when one was computed.
    fn charge(&self) -> Option<f64>;
}

/// A rolled-up charge for one period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeCell {
    /// Total charge for the period
    pub charge: f64,
}

impl Charged for ChargeCell {
    fn charge(&self) -> Option<f64> {
        Some(self.charge)
    }
}

/// Fold `slot` into the running total `acc`.
///
/// A present slot without a charge counts as zero. Two absent inputs stay
/// absent.
#[must_use]
pub fn sum_charges<T: Charged>(acc: Slot<ChargeCell>, slot: &Slot<T>) -> Slot<ChargeCell> {
    let contribution = slot.as_present().map(|value| value.charge().unwrap_or(0.0));
    match (acc, contribution) {
        (Slot::Present(total), Some(charge)) => Slot::Present(ChargeCell {
            charge: total.charge + charge,
        }),
        (Slot::Present(total), None) => Slot::Present(total),
        (Slot::Absent, Some(charge)) => Slot::Present(ChargeCell { charge }),
        (Slot::Absent, None) => Slot::Absent,
    }
}

/// Sum the windows of every entity, slot by slot.
///
/// The result for each dimension is as long as the longest contributing
/// window; shorter windows count as absent past their end. With no entities
/// the result is [`TimeWindowSet::empty`].
pub fn build_windows<'a, T, I>(entities: I) -> TimeWindowSet<ChargeCell>
where
    T: Charged + 'a,
    I: IntoIterator<Item = &'a TimeWindowSet<T>>,
{
    let entities: Vec<&TimeWindowSet<T>> = entities.into_iter().collect();
    if entities.is_empty() {
        return TimeWindowSet::empty();
    }
    let windows = Dimension::ALL.map(|dimension| {
        let length = entities
            .iter()
            .map(|set| set.window(dimension).len())
            .max()
            .unwrap_or(0);
        let slots = (0..length)
            .map(|index| {
                entities.iter().fold(Slot::Absent, |acc, set| {
                    match set.slot(dimension, index) {
                        Some(slot) => sum_charges(acc, slot),
                        None => acc,
                    }
                })
            })
            .collect();
        TimeWindow::from_slots(slots)
    });
    TimeWindowSet::from_windows(windows)
}

/// Add two optional costs. `None` only when both are `None`.
#[must_use]
pub fn sum_costs(acc: Option<f64>, cost: Option<f64>) -> Option<f64> {
    match (acc, cost) {
        (Some(a), Some(b)) => Some(a + b),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cell(charge: f64) -> Slot<ChargeCell> {
        Slot::Present(ChargeCell { charge })
    }

    fn arb_slot() -> impl Strategy<Value = Slot<ChargeCell>> {
        prop_oneof![
            Just(Slot::Absent),
            (0u32..1_000).prop_map(|c| cell(f64::from(c))),
        ]
    }

    fn arb_set() -> impl Strategy<Value = TimeWindowSet<ChargeCell>> {
        proptest::array::uniform5(proptest::collection::vec(arb_slot(), 1..4))
            .prop_map(|windows| TimeWindowSet::from_windows(windows.map(TimeWindow::from_slots)))
    }

    #[test]
    fn absent_plus_absent_is_absent() {
        assert_eq!(sum_charges::<ChargeCell>(Slot::Absent, &Slot::Absent), Slot::Absent);
        assert_eq!(sum_charges(Slot::Absent, &cell(0.0)), cell(0.0));
        assert_eq!(sum_charges(cell(1.0), &Slot::<ChargeCell>::Absent), cell(1.0));
        assert_eq!(sum_charges(cell(1.0), &cell(2.5)), cell(3.5));
    }

    #[test]
    fn no_entities_yields_empty_set() {
        let set = build_windows::<ChargeCell, _>(std::iter::empty());
        assert_eq!(set, TimeWindowSet::empty());
    }

    #[test]
    fn shorter_windows_count_as_absent() {
        let mut a: TimeWindowSet<ChargeCell> = TimeWindowSet::empty();
        *a.window_mut(Dimension::Day) = TimeWindow::from_slots(vec![cell(1.0)]);
        let mut b: TimeWindowSet<ChargeCell> = TimeWindowSet::empty();
        *b.window_mut(Dimension::Day) =
            TimeWindow::from_slots(vec![Slot::Absent, cell(2.0), Slot::Absent]);

        let total = build_windows([&a, &b]);
        assert_eq!(
            total.window(Dimension::Day).slots(),
            &[cell(1.0), cell(2.0), Slot::Absent]
        );
        assert_eq!(total.window(Dimension::Hour).slots(), &[Slot::Absent]);
    }

    #[test]
    fn costs_are_null_safe() {
        assert_eq!(sum_costs(None, None), None);
        assert_eq!(sum_costs(Some(1.0), None), Some(1.0));
        assert_eq!(sum_costs(None, Some(2.0)), Some(2.0));
        assert_eq!(sum_costs(Some(1.0), Some(2.0)), Some(3.0));
    }

    proptest! {
        #[test]
        fn rollup_is_absent_only_where_every_input_is(sets in proptest::collection::vec(arb_set(), 1..5)) {
            let total = build_windows(sets.iter());
            for dimension in Dimension::ALL {
                for (index, slot) in total.window(dimension).iter().enumerate() {
                    let any_present = sets.iter().any(|set| {
                        set.slot(dimension, index).is_some_and(Slot::is_present)
                    });
                    prop_assert_eq!(slot.is_present(), any_present);
                }
            }
        }

        #[test]
        fn rollup_is_order_independent(sets in proptest::collection::vec(arb_set(), 1..5)) {
            let forward = build_windows(sets.iter());
            let backward = build_windows(sets.iter().rev());
            prop_assert_eq!(forward, backward);
        }
    }
}
