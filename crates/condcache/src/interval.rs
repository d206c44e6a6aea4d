use std::fmt;

use thiserror::Error;

use crate::time::TimePoint;

/// Returned when constructing a [`ValidityInterval`] whose start lies after its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid validity interval: start {start} is after end {end}")]
pub struct InvalidInterval<T: TimePoint> {
    pub start: T,
    pub end: T,
}

/// A right-open range `[start, end)` of time points over which a cached value is valid.
///
/// An interval without an `end` extends to infinity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValidityInterval<T> {
    start: T,
    end: Option<T>,
}

impl<T: TimePoint> ValidityInterval<T> {
    /// Creates the interval `[start, end)`.
    ///
    /// # Errors
    ///
    /// Fails with [`InvalidInterval`] if `start > end`.
    pub fn new(start: T, end: T) -> Result<Self, InvalidInterval<T>> {
        if start > end {
            return Err(InvalidInterval { start, end });
        }
        Ok(Self {
            start,
            end: Some(end),
        })
    }

    /// Creates the open-ended interval `[start, inf)`.
    pub fn starting_at(start: T) -> Self {
        Self { start, end: None }
    }

    /// The interval covering every time point.
    pub fn infinite() -> Self {
        Self::starting_at(T::MIN)
    }

    pub fn start(&self) -> T {
        self.start
    }

    /// The exclusive end, or `None` for an interval extending to infinity.
    pub fn end(&self) -> Option<T> {
        self.end
    }

    pub fn is_infinite(&self) -> bool {
        self.end.is_none()
    }

    /// Whether this interval contains no time point at all, i.e. `[t, t)`.
    pub fn is_empty(&self) -> bool {
        self.end == Some(self.start)
    }

    pub fn contains(&self, t: T) -> bool {
        t >= self.start && self.end.is_none_or(|end| t < end)
    }

    /// Whether both intervals share at least one time point.
    pub fn intersects(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let starts_before_other_ends = other.end.is_none_or(|end| self.start < end);
        let other_starts_before_end = self.end.is_none_or(|end| other.start < end);
        starts_before_other_ends && other_starts_before_end
    }

    /// Whether this interval is a strict extension of `previous`: it starts at the same
    /// time point but ends later.
    pub fn extends(&self, previous: &Self) -> bool {
        if self.start != previous.start {
            return false;
        }
        match (previous.end, self.end) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(previous_end), Some(end)) => end > previous_end,
        }
    }

    /// Whether this interval has entirely passed at time point `t`.
    pub(crate) fn ends_at_or_before(&self, t: T) -> bool {
        self.end.is_some_and(|end| end <= t)
    }
}

impl<T: fmt::Display> fmt::Display for ValidityInterval<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}, inf)", self.start),
        }
    }
}
