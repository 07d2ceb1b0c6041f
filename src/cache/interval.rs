//! Interval values and interval coverage sets
//!
//! Interval values describe the extent of a query dimension: a spatial
//! envelope, a time span or a plain numeric range. All intervals are closed.

use crate::cache::types::GroupId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    pub fn intersection(&self, other: &Envelope) -> Option<Envelope> {
        let env = Envelope::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );
        (!env.is_empty()).then_some(env)
    }

    pub fn contains(&self, other: &Envelope) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }
}

/// Closed time interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSpan {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn intersection(&self, other: &TimeSpan) -> Option<TimeSpan> {
        let span = TimeSpan::new(self.start.max(other.start), self.end.min(other.end));
        (!span.is_empty()).then_some(span)
    }

    pub fn contains(&self, other: &TimeSpan) -> bool {
        self.start <= other.start && self.end >= other.end
    }
}

/// An interval in one query dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalValue {
    Envelope(Envelope),
    TimeSpan(TimeSpan),
    Range { min: f64, max: f64 },
}

impl IntervalValue {
    pub fn envelope(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        IntervalValue::Envelope(Envelope::new(min_x, min_y, max_x, max_y))
    }

    pub fn time_span(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        IntervalValue::TimeSpan(TimeSpan::new(start, end))
    }

    pub fn range(min: f64, max: f64) -> Self {
        IntervalValue::Range { min, max }
    }

    /// Intersection of two intervals of the same kind.
    ///
    /// Returns `None` for disjoint intervals and for intervals of different kinds.
    pub fn intersection(&self, other: &IntervalValue) -> Option<IntervalValue> {
        match (self, other) {
            (IntervalValue::Envelope(a), IntervalValue::Envelope(b)) => {
                a.intersection(b).map(IntervalValue::Envelope)
            }
            (IntervalValue::TimeSpan(a), IntervalValue::TimeSpan(b)) => {
                a.intersection(b).map(IntervalValue::TimeSpan)
            }
            (
                IntervalValue::Range { min: a0, max: a1 },
                IntervalValue::Range { min: b0, max: b1 },
            ) => {
                let (min, max) = (a0.max(*b0), a1.min(*b1));
                (min <= max).then_some(IntervalValue::Range { min, max })
            }
            _ => None,
        }
    }

    pub fn overlaps(&self, other: &IntervalValue) -> bool {
        self.intersection(other).is_some()
    }

    /// True when `other` lies entirely inside this interval
    pub fn contains(&self, other: &IntervalValue) -> bool {
        match (self, other) {
            (IntervalValue::Envelope(a), IntervalValue::Envelope(b)) => a.contains(b),
            (IntervalValue::TimeSpan(a), IntervalValue::TimeSpan(b)) => a.contains(b),
            (
                IntervalValue::Range { min: a0, max: a1 },
                IntervalValue::Range { min: b0, max: b1 },
            ) => a0 <= b0 && a1 >= b1,
            _ => false,
        }
    }

    /// Lower bound used to order rows by an interval property
    pub fn sort_key(&self) -> f64 {
        match self {
            IntervalValue::Envelope(e) => e.min_x,
            IntervalValue::TimeSpan(t) => t.start.timestamp_millis() as f64,
            IntervalValue::Range { min, .. } => *min,
        }
    }
}

impl fmt::Display for IntervalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalValue::Envelope(e) => write!(
                f,
                "envelope[{}, {}, {}, {}]",
                e.min_x, e.min_y, e.max_x, e.max_y
            ),
            IntervalValue::TimeSpan(t) => {
                write!(f, "time[{} .. {}]", t.start.to_rfc3339(), t.end.to_rfc3339())
            }
            IntervalValue::Range { min, max } => write!(f, "range[{} .. {}]", min, max),
        }
    }
}

/// Immutable set of named interval values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntervalPropertyValueSet {
    values: BTreeMap<String, IntervalValue>,
}

impl IntervalPropertyValueSet {
    pub fn builder() -> IntervalPropertyValueSetBuilder {
        IntervalPropertyValueSetBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&IntervalValue> {
        self.values.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &IntervalValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when every dimension of `other` is contained in the same dimension here
    pub fn contains(&self, other: &IntervalPropertyValueSet) -> bool {
        other.values.iter().all(|(name, value)| {
            self.values
                .get(name)
                .map_or(false, |mine| mine.contains(value))
        })
    }
}

/// Builder for interval value sets
#[derive(Debug, Default)]
pub struct IntervalPropertyValueSetBuilder {
    values: BTreeMap<String, IntervalValue>,
}

impl IntervalPropertyValueSetBuilder {
    pub fn add(mut self, name: impl Into<String>, value: IntervalValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn build(self) -> IntervalPropertyValueSet {
        IntervalPropertyValueSet {
            values: self.values,
        }
    }
}

impl FromIterator<(String, IntervalValue)> for IntervalPropertyValueSet {
    fn from_iter<I: IntoIterator<Item = (String, IntervalValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Request for one interval dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalPropertyMatcher {
    /// Property name of the dimension
    pub name: String,

    /// Requested interval
    pub interval: IntervalValue,
}

impl IntervalPropertyMatcher {
    pub fn new(name: impl Into<String>, interval: IntervalValue) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }
}

/// Region of a request that is already cached in one storage group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Satisfaction {
    /// Group holding the cached rows
    pub group_id: GroupId,

    /// Covered sub-interval per requested dimension
    pub intervals: IntervalPropertyValueSet,
}
