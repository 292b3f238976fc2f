//! Rolling time windows for usage accumulation
//!
//! Usage is tracked at five resolutions at once: second, minute, hour, day and
//! month. Each resolution owns a [`TimeWindow`], an ordered run of [`Slot`]s
//! where index 0 is the period containing 'now' and higher indexes are older
//! periods. The five windows together form a [`TimeWindowSet`].
//!
//! # Semantics
//!
//! A window only ever grows. It is extended on the right with absent slots when
//! late usage needs an older period that is not yet tracked, and it is shifted
//! when 'now' advances into a newer period: every slot slides toward the older
//! end by the number of elapsed periods, the oldest slots fall off, and the
//! length is preserved.
//!
//! ```text
//! [(5), ∅]          -- day window, now = D
//!  -> shift(D, D+1) => [∅, (5)]
//!  -> shift(D+1, D+3) => [∅, ∅]
//! ```
//!
//! An absent slot is not the same thing as a present slot holding zero. The
//! distinction is carried by the type, see [`Slot`], and every reduction in
//! [`reduce`] keeps it: folding only absent slots yields an absent slot.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod reduce;
pub mod slack;
pub mod time;

pub use slack::{SlackPolicy, SlackViolation, WindowSizes};
pub use time::Bounds;

/// Errors produced by window and calendar operations.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A millisecond timestamp could not be placed on the UTC calendar.
    #[error("Timestamp {millis} is outside the supported calendar range")]
    Timestamp {
        /// The offending timestamp
        millis: i64,
    },
    /// A month ordinal could not be turned back into a calendar date.
    #[error("Month ordinal {ordinal} is outside the supported calendar range")]
    Month {
        /// Months since year zero
        ordinal: i64,
    },
    /// Usage arrived after the slack deadline of its billing month.
    #[error(transparent)]
    Slack(#[from] SlackViolation),
}

/// One of the five resolutions usage is tracked at, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dimension {
    /// One second
    #[serde(rename = "s")]
    Second,
    /// One minute
    #[serde(rename = "m")]
    Minute,
    /// One hour
    #[serde(rename = "h")]
    Hour,
    /// One UTC day
    #[serde(rename = "D")]
    Day,
    /// One UTC calendar month
    #[serde(rename = "M")]
    Month,
}

impl Dimension {
    /// Every dimension, ordered by its position in a [`TimeWindowSet`].
    pub const ALL: [Dimension; 5] = [
        Dimension::Second,
        Dimension::Minute,
        Dimension::Hour,
        Dimension::Day,
        Dimension::Month,
    ];

    /// Position of this dimension inside a [`TimeWindowSet`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Dimension::Second => 0,
            Dimension::Minute => 1,
            Dimension::Hour => 2,
            Dimension::Day => 3,
            Dimension::Month => 4,
        }
    }

    /// The single letter used in configuration, `s m h D M`.
    #[must_use]
    pub const fn letter(self) -> char {
        match self {
            Dimension::Second => 's',
            Dimension::Minute => 'm',
            Dimension::Hour => 'h',
            Dimension::Day => 'D',
            Dimension::Month => 'M',
        }
    }

    /// Parse a configuration letter.
    #[must_use]
    pub const fn from_letter(letter: char) -> Option<Self> {
        match letter {
            's' => Some(Dimension::Second),
            'm' => Some(Dimension::Minute),
            'h' => Some(Dimension::Hour),
            'D' => Some(Dimension::Day),
            'M' => Some(Dimension::Month),
            _ => None,
        }
    }

    /// Size of one period in milliseconds as used for slack arithmetic. A month
    /// counts as 31 days here.
    #[must_use]
    pub const fn millis(self) -> i64 {
        match self {
            Dimension::Second => 1_000,
            Dimension::Minute => 60_000,
            Dimension::Hour => 3_600_000,
            Dimension::Day => 86_400_000,
            Dimension::Month => 2_678_400_000,
        }
    }

    /// Exact period length for the fixed-size dimensions. Months vary and
    /// return `None`.
    #[must_use]
    pub const fn fixed_millis(self) -> Option<i64> {
        match self {
            Dimension::Month => None,
            other => Some(other.millis()),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A single period's value inside a [`TimeWindow`].
///
/// Serializes as `null` when absent and as the inner value otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<T> {
    /// Nothing was recorded for this period.
    Absent,
    /// A value was recorded for this period.
    Present(T),
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot::Absent
    }
}

impl<T> Slot<T> {
    /// Whether a value was recorded.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        matches!(self, Slot::Present(_))
    }

    /// Borrow the recorded value, if any.
    #[must_use]
    pub const fn as_present(&self) -> Option<&T> {
        match self {
            Slot::Present(value) => Some(value),
            Slot::Absent => None,
        }
    }

    /// Transform the recorded value, keeping absence.
    pub fn map<U, F>(self, f: F) -> Slot<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Slot::Present(value) => Slot::Present(f(value)),
            Slot::Absent => Slot::Absent,
        }
    }
}

impl<T> From<Option<T>> for Slot<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Slot::Present(value),
            None => Slot::Absent,
        }
    }
}

impl<T> Serialize for Slot<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Slot::Present(value) => serializer.serialize_some(value),
            Slot::Absent => serializer.serialize_none(),
        }
    }
}

impl<'de, T> Deserialize<'de> for Slot<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Slot::from)
    }
}

/// The slots of one dimension, most recent period first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeWindow<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Default for TimeWindow<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> TimeWindow<T> {
    /// A window tracking only the current period, with nothing recorded.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            slots: vec![Slot::Absent],
        }
    }

    /// Construct a window from slots, most recent first.
    #[must_use]
    pub fn from_slots(slots: Vec<Slot<T>>) -> Self {
        Self { slots }
    }

    /// Number of periods tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no period is tracked at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Borrow the slot `index` periods before the current one.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Slot<T>> {
        self.slots.get(index)
    }

    /// Borrow every slot, most recent first.
    #[must_use]
    pub fn slots(&self) -> &[Slot<T>] {
        &self.slots
    }

    /// Mutably borrow every slot, most recent first.
    pub fn slots_mut(&mut self) -> &mut [Slot<T>] {
        &mut self.slots
    }

    /// Append absent slots until `index` is addressable. A no-op when the
    /// window is already long enough.
    pub fn extend(&mut self, index: usize) {
        while self.slots.len() <= index {
            self.slots.push(Slot::Absent);
        }
    }

    /// Slide slots toward older indexes by the number of `dimension` periods
    /// elapsed between `previous` and `now`, dropping what falls off the end.
    /// Returns the number of positions shifted; zero when `now` is not in a
    /// newer period.
    ///
    /// # Errors
    ///
    /// Fails if either timestamp cannot be placed on the calendar.
    pub fn shift(&mut self, previous: i64, now: i64, dimension: Dimension) -> Result<usize, Error> {
        let elapsed = time::periods_between(previous, now, dimension)?;
        let Ok(elapsed) = usize::try_from(elapsed) else {
            return Ok(0);
        };
        let positions = elapsed.min(self.slots.len());
        if positions == 0 {
            return Ok(0);
        }
        let kept = self.slots.len() - positions;
        let mut slots: Vec<Slot<T>> = std::iter::repeat_with(|| Slot::Absent)
            .take(positions)
            .collect();
        slots.extend(self.slots.drain(..kept));
        self.slots = slots;
        Ok(positions)
    }

    /// Iterate the slots, most recent first.
    pub fn iter(&self) -> std::slice::Iter<'_, Slot<T>> {
        self.slots.iter()
    }
}

/// One [`TimeWindow`] per [`Dimension`], finest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeWindowSet<T> {
    windows: [TimeWindow<T>; 5],
}

impl<T> Default for TimeWindowSet<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> TimeWindowSet<T> {
    /// One `[Absent]` window per dimension.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            windows: std::array::from_fn(|_| TimeWindow::empty()),
        }
    }

    /// Construct a set from windows ordered finest first.
    #[must_use]
    pub fn from_windows(windows: [TimeWindow<T>; 5]) -> Self {
        Self { windows }
    }

    /// Borrow the window of `dimension`.
    #[must_use]
    pub fn window(&self, dimension: Dimension) -> &TimeWindow<T> {
        &self.windows[dimension.index()]
    }

    /// Mutably borrow the window of `dimension`.
    pub fn window_mut(&mut self, dimension: Dimension) -> &mut TimeWindow<T> {
        &mut self.windows[dimension.index()]
    }

    /// Borrow the slot at `index` of `dimension`, if tracked.
    #[must_use]
    pub fn slot(&self, dimension: Dimension, index: usize) -> Option<&Slot<T>> {
        self.window(dimension).get(index)
    }

    /// Iterate `(dimension, window)` pairs, finest first.
    pub fn iter(&self) -> impl Iterator<Item = (Dimension, &TimeWindow<T>)> {
        Dimension::ALL.into_iter().zip(self.windows.iter())
    }

    /// Build a new set by visiting every slot with its dimension and index.
    /// The shape of the set is preserved.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn try_map_slots<U, E, F>(&self, mut f: F) -> Result<TimeWindowSet<U>, E>
    where
        F: FnMut(Dimension, usize, &Slot<T>) -> Result<Slot<U>, E>,
    {
        let mut windows: [TimeWindow<U>; 5] = std::array::from_fn(|_| TimeWindow::default());
        for (dimension, window) in self.iter() {
            let slots = window
                .iter()
                .enumerate()
                .map(|(index, slot)| f(dimension, index, slot))
                .collect::<Result<Vec<_>, E>>()?;
            windows[dimension.index()] = TimeWindow::from_slots(slots);
        }
        Ok(TimeWindowSet { windows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    fn present(v: u32) -> Slot<u32> {
        Slot::Present(v)
    }

    #[test]
    fn slot_serializes_absent_as_null() {
        let window = TimeWindow::from_slots(vec![present(1), Slot::Absent]);
        let json = serde_json::to_string(&window).unwrap();
        assert_eq!(json, "[1,null]");

        let back: TimeWindow<u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, window);
    }

    #[test]
    fn empty_set_has_one_absent_slot_per_dimension() {
        let set: TimeWindowSet<u32> = TimeWindowSet::empty();
        for (_, window) in set.iter() {
            assert_eq!(window.slots(), &[Slot::Absent]);
        }
        assert_eq!(serde_json::to_string(&set).unwrap(), "[[null],[null],[null],[null],[null]]");
    }

    #[test]
    fn extend_is_noop_when_long_enough() {
        let mut window = TimeWindow::from_slots(vec![present(1), present(2), Slot::Absent]);
        window.extend(1);
        assert_eq!(window.len(), 3);
        window.extend(4);
        assert_eq!(window.len(), 5);
        assert_eq!(window.get(4), Some(&Slot::Absent));
    }

    #[test]
    fn shift_slides_toward_older_periods() {
        let mut window = TimeWindow::from_slots(vec![present(5), present(4), present(3)]);
        let shifted = window.shift(10 * DAY, 11 * DAY + 5, Dimension::Day).unwrap();
        assert_eq!(shifted, 1);
        assert_eq!(window.slots(), &[Slot::Absent, present(5), present(4)]);
    }

    #[test]
    fn shift_past_window_clears_it() {
        let mut window = TimeWindow::from_slots(vec![present(5), present(4)]);
        window.shift(10 * DAY, 30 * DAY, Dimension::Day).unwrap();
        assert_eq!(window.slots(), &[Slot::Absent, Slot::Absent]);
    }

    #[test]
    fn shift_backward_is_noop() {
        let mut window = TimeWindow::from_slots(vec![present(5), present(4)]);
        let shifted = window.shift(11 * DAY, 10 * DAY, Dimension::Day).unwrap();
        assert_eq!(shifted, 0);
        assert_eq!(window.slots(), &[present(5), present(4)]);
    }

    #[test]
    fn dimension_letters_round_trip() {
        for dimension in Dimension::ALL {
            assert_eq!(Dimension::from_letter(dimension.letter()), Some(dimension));
        }
        assert_eq!(Dimension::from_letter('x'), None);
    }
}
