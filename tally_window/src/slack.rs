//! Late-usage tolerance and window sizing
//!
//! Usage for a billing month may still arrive after that month has closed, but
//! only within the slack: a duration counted from the start of the current
//! month. The slack also decides how many periods each window retains, enough
//! to absorb a full slack's worth of late usage.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Dimension, Error, time};

/// Nominal length of a month when comparing dimensions, 28 days.
const NOMINAL_MONTH_MILLIS: i64 = 28 * 86_400_000;

fn nominal_millis(dimension: Dimension) -> i64 {
    match dimension {
        Dimension::Month => NOMINAL_MONTH_MILLIS,
        other => other.millis(),
    }
}

/// Errors produced while parsing a slack policy.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The policy did not match `<digits><M|D|h|m|s>`.
    #[error("Slack policy '{0}' must look like <digits><M|D|h|m|s>")]
    Format(String),
    /// The width did not fit in a `u32`.
    #[error("Slack width in '{0}' is too large")]
    Width(String),
}

/// How late usage for a closed month may arrive, as `width` periods of
/// `scale`. Written `10m`, `2D` and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlackPolicy {
    scale: Dimension,
    width: u32,
}

impl Default for SlackPolicy {
    fn default() -> Self {
        Self {
            scale: Dimension::Minute,
            width: 10,
        }
    }
}

impl SlackPolicy {
    /// Construct a policy of `width` periods of `scale`.
    #[must_use]
    pub const fn new(scale: Dimension, width: u32) -> Self {
        Self { scale, width }
    }

    /// The unit the width is expressed in.
    #[must_use]
    pub const fn scale(self) -> Dimension {
        self.scale
    }

    /// Number of `scale` periods tolerated.
    #[must_use]
    pub const fn width(self) -> u32 {
        self.width
    }

    /// Total tolerance in milliseconds.
    #[must_use]
    pub fn limit_millis(self) -> i64 {
        i64::from(self.width) * self.scale.millis()
    }

    /// Number of periods of `dimension` needed to cover the slack. One more
    /// than the slack spans so the current period is always included.
    /// Dimensions finer than the scale only ever track their current period.
    #[must_use]
    pub fn max_length(self, dimension: Dimension) -> usize {
        if dimension < self.scale {
            return 1;
        }
        let ratio = nominal_millis(dimension) / nominal_millis(self.scale);
        let width = i64::from(self.width);
        let spanned = (width + ratio - 1) / ratio;
        usize::try_from(spanned).map_or(usize::MAX, |n| n.saturating_add(1))
    }

    /// Reject usage ending in a previous month once the slack deadline of the
    /// current month has passed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Slack`] when the usage is too late and a calendar
    /// error when `now` cannot be placed on the calendar.
    pub fn check(self, end: i64, now: i64) -> Result<(), Error> {
        let month_start = time::start_of_month(now)?;
        let last_month_end = month_start - 1;
        let deadline = month_start + self.limit_millis();
        if end <= last_month_end && now > deadline {
            tracing::debug!(end, now, deadline, "usage arrived past the slack deadline");
            return Err(Error::Slack(SlackViolation { end, now, deadline }));
        }
        Ok(())
    }
}

impl fmt::Display for SlackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.width, self.scale.letter())
    }
}

impl FromStr for SlackPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let scale = chars
            .next_back()
            .and_then(Dimension::from_letter)
            .ok_or_else(|| ParseError::Format(s.to_string()))?;
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::Format(s.to_string()));
        }
        let width = digits
            .parse::<u32>()
            .map_err(|_| ParseError::Width(s.to_string()))?;
        Ok(Self { scale, width })
    }
}

impl TryFrom<String> for SlackPolicy {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SlackPolicy> for String {
    fn from(value: SlackPolicy) -> Self {
        value.to_string()
    }
}

/// Usage for a closed month arrived after the slack deadline.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Usage ending at {end} is past the slack deadline {deadline} (now {now})")]
pub struct SlackViolation {
    /// End of the rejected usage, epoch milliseconds
    pub end: i64,
    /// Processing time the usage was checked at
    pub now: i64,
    /// Last instant usage for the previous month was accepted
    pub deadline: i64,
}

impl SlackViolation {
    /// HTTP-equivalent status reported for this rejection.
    #[must_use]
    pub const fn status(&self) -> u16 {
        409
    }

    /// Resubmitting the same usage will never succeed.
    #[must_use]
    pub const fn noretry(&self) -> bool {
        true
    }
}

/// Resolved window lengths for every dimension.
///
/// Seconds, minutes and hours are only tracked when explicitly sized; by
/// default their windows are kept as a single absent slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSizes {
    slack: SlackPolicy,
    sizes: BTreeMap<Dimension, usize>,
    supported: [bool; 5],
}

impl WindowSizes {
    /// Sizes derived from `slack`, with explicit `sizes` taking precedence.
    /// Days and months are always tracked, other dimensions only when sized.
    #[must_use]
    pub fn new(slack: SlackPolicy, sizes: BTreeMap<Dimension, usize>) -> Self {
        let mut supported = [false; 5];
        supported[Dimension::Day.index()] = true;
        supported[Dimension::Month.index()] = true;
        for dimension in sizes.keys() {
            supported[dimension.index()] = true;
        }
        Self {
            slack,
            sizes,
            supported,
        }
    }

    /// Sizes derived from `slack` with every dimension tracked.
    #[must_use]
    pub fn all(slack: SlackPolicy) -> Self {
        Self {
            slack,
            sizes: BTreeMap::new(),
            supported: [true; 5],
        }
    }

    /// The slack policy the sizes derive from.
    #[must_use]
    pub const fn slack(&self) -> &SlackPolicy {
        &self.slack
    }

    /// Whether `dimension` is tracked at all.
    #[must_use]
    pub const fn supports(&self, dimension: Dimension) -> bool {
        self.supported[dimension.index()]
    }

    /// Number of periods `dimension` retains.
    #[must_use]
    pub fn retained(&self, dimension: Dimension) -> usize {
        match self.sizes.get(&dimension) {
            Some(size) => (*size).max(1),
            None => self.slack.max_length(dimension),
        }
    }

    /// Whether late usage may grow the window of `dimension`.
    #[must_use]
    pub fn extendable(&self, dimension: Dimension) -> bool {
        dimension >= self.slack.scale
    }
}

impl Default for WindowSizes {
    fn default() -> Self {
        Self::new(SlackPolicy::default(), BTreeMap::new())
    }
}
