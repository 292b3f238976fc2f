//! UTC calendar arithmetic over millisecond timestamps
//!
//! Seconds, minutes, hours and days are fixed-size and truncate by division.
//! Months follow the calendar, so every month computation goes through a
//! 'month ordinal', the number of months since year zero.

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{Dimension, Error};

/// Half-open millisecond range `[from, to)` covering one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    /// First millisecond of the period
    pub from: i64,
    /// First millisecond of the following period
    pub to: i64,
}

impl Bounds {
    /// Whether `millis` falls inside the period.
    #[must_use]
    pub const fn contains(&self, millis: i64) -> bool {
        self.from <= millis && millis < self.to
    }
}

fn month_ordinal(millis: i64) -> Result<i64, Error> {
    let date = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or(Error::Timestamp { millis })?;
    Ok(i64::from(date.year()) * 12 + i64::from(date.month0()))
}

fn month_start(ordinal: i64) -> Result<i64, Error> {
    let year = i32::try_from(ordinal.div_euclid(12)).map_err(|_| Error::Month { ordinal })?;
    let month = u32::try_from(ordinal.rem_euclid(12) + 1).map_err(|_| Error::Month { ordinal })?;
    let midnight = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or(Error::Month { ordinal })?;
    Ok(Utc.from_utc_datetime(&midnight).timestamp_millis())
}

/// Zero out everything finer than `dimension`.
///
/// # Errors
///
/// Fails for month truncation of timestamps outside the calendar range.
pub fn truncate(millis: i64, dimension: Dimension) -> Result<i64, Error> {
    match dimension.fixed_millis() {
        Some(unit) => Ok(millis.div_euclid(unit) * unit),
        None => month_start(month_ordinal(millis)?),
    }
}

/// Number of `dimension` periods from the one containing `earlier` to the one
/// containing `later`. Negative when `later` is in an older period.
///
/// # Errors
///
/// Fails for month arithmetic on timestamps outside the calendar range.
pub fn periods_between(earlier: i64, later: i64, dimension: Dimension) -> Result<i64, Error> {
    match dimension.fixed_millis() {
        Some(unit) => Ok(later.div_euclid(unit) - earlier.div_euclid(unit)),
        None => Ok(month_ordinal(later)? - month_ordinal(earlier)?),
    }
}

/// Boundaries of the period `offset` steps away from the one containing
/// `now`. Slot `j` of a window is described by `bounds(now, dimension, -j)`.
///
/// # Errors
///
/// Fails for month arithmetic on timestamps outside the calendar range.
pub fn bounds(now: i64, dimension: Dimension, offset: i64) -> Result<Bounds, Error> {
    match dimension.fixed_millis() {
        Some(unit) => {
            let from = (now.div_euclid(unit) + offset) * unit;
            Ok(Bounds {
                from,
                to: from + unit,
            })
        }
        None => {
            let ordinal = month_ordinal(now)? + offset;
            Ok(Bounds {
                from: month_start(ordinal)?,
                to: month_start(ordinal + 1)?,
            })
        }
    }
}

/// Index, relative to `now`, of the slot that `end` falls into. Usage from
/// the future lands in the current slot.
///
/// # Errors
///
/// Fails for month arithmetic on timestamps outside the calendar range.
pub fn window_index(now: i64, end: i64, dimension: Dimension) -> Result<usize, Error> {
    let elapsed = periods_between(end, now, dimension)?;
    Ok(usize::try_from(elapsed).unwrap_or(0))
}

/// First millisecond of the calendar month containing `millis`.
///
/// # Errors
///
/// Fails for timestamps outside the calendar range.
pub fn start_of_month(millis: i64) -> Result<i64, Error> {
    truncate(millis, Dimension::Month)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap().timestamp_millis()
    }

    #[test]
    fn month_bounds_follow_the_calendar() {
        let now = utc(2015, 3, 15, 12, 0, 0);
        let previous = bounds(now, Dimension::Month, -1).unwrap();
        assert_eq!(previous.from, utc(2015, 2, 1, 0, 0, 0));
        assert_eq!(previous.to, utc(2015, 3, 1, 0, 0, 0));

        let current = bounds(now, Dimension::Month, 0).unwrap();
        assert_eq!(current.from, utc(2015, 3, 1, 0, 0, 0));
        assert_eq!(current.to, utc(2015, 4, 1, 0, 0, 0));
    }

    #[test]
    fn month_bounds_cross_year_boundaries() {
        let now = utc(2016, 1, 2, 0, 0, 0);
        let previous = bounds(now, Dimension::Month, -1).unwrap();
        assert_eq!(previous.from, utc(2015, 12, 1, 0, 0, 0));
        assert_eq!(previous.to, utc(2016, 1, 1, 0, 0, 0));
    }

    #[test]
    fn fixed_bounds_truncate() {
        let now = utc(2015, 3, 15, 12, 34, 56) + 789;
        let hour = bounds(now, Dimension::Hour, -2).unwrap();
        assert_eq!(hour.from, utc(2015, 3, 15, 10, 0, 0));
        assert_eq!(hour.to, utc(2015, 3, 15, 11, 0, 0));
        assert!(bounds(now, Dimension::Second, 0).unwrap().contains(now));
    }

    #[test]
    fn index_counts_calendar_periods() {
        let now = utc(2015, 11, 1, 23, 0, 0);
        let end = utc(2015, 10, 31, 0, 0, 0);
        assert_eq!(window_index(now, end, Dimension::Day).unwrap(), 1);
        assert_eq!(window_index(now, end, Dimension::Month).unwrap(), 1);
        assert_eq!(window_index(now, end, Dimension::Hour).unwrap(), 47);
    }

    #[test]
    fn future_usage_lands_in_current_slot() {
        let now = utc(2015, 11, 1, 0, 0, 0);
        let end = utc(2015, 11, 3, 0, 0, 0);
        assert_eq!(window_index(now, end, Dimension::Day).unwrap(), 0);
    }

    #[test]
    fn start_of_month_truncates() {
        let now = utc(2015, 11, 17, 5, 6, 7);
        assert_eq!(start_of_month(now).unwrap(), utc(2015, 11, 1, 0, 0, 0));
    }
}
