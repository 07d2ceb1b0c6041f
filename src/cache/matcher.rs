//! Property matchers and order specifiers used by id queries
//!
//! Typed matchers are compiled into [`CompiledMatcher`]s when a query runs;
//! compiling serializes the operand, so an unserializable operand surfaces as
//! a serialization error from the query rather than at construction.

use crate::cache::interval::{IntervalPropertyMatcher, IntervalValue};
use crate::cache::property::{PropertyDescriptor, PropertyType};
use crate::error::{CacheError, Result};
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Condition on one property, with the operand type erased
pub trait ValueMatcher: Send + Sync {
    /// Name of the matched property
    fn property_name(&self) -> &str;

    /// True for matchers selecting a span of values (ranges, interval overlaps).
    /// The first ordered matcher of a query defines its default order.
    fn is_ordered(&self) -> bool;

    /// Serialize the operand into a matcher the backend can evaluate
    fn compile(&self) -> Result<CompiledMatcher>;
}

/// Boxed matcher accepted by queries
pub type AnyMatcher = Box<dyn ValueMatcher>;

/// Comparison applied by a [`PropertyMatcher`]
#[derive(Debug, Clone)]
pub enum MatchOp<T> {
    Equals(T),
    NotEquals(T),
    /// Inclusive bounds; `None` leaves that side open
    Range { min: Option<T>, max: Option<T> },
    OneOf(Vec<T>),
}

/// Typed condition on a property
#[derive(Debug, Clone)]
pub struct PropertyMatcher<T> {
    descriptor: PropertyDescriptor<T>,
    op: MatchOp<T>,
}

impl<T: PropertyType> PropertyMatcher<T> {
    pub fn new(descriptor: &PropertyDescriptor<T>, op: MatchOp<T>) -> Self {
        Self {
            descriptor: descriptor.clone(),
            op,
        }
    }

    pub fn equals(descriptor: &PropertyDescriptor<T>, value: T) -> Self {
        Self::new(descriptor, MatchOp::Equals(value))
    }

    pub fn not_equals(descriptor: &PropertyDescriptor<T>, value: T) -> Self {
        Self::new(descriptor, MatchOp::NotEquals(value))
    }

    pub fn range(descriptor: &PropertyDescriptor<T>, min: T, max: T) -> Self {
        Self::new(
            descriptor,
            MatchOp::Range {
                min: Some(min),
                max: Some(max),
            },
        )
    }

    pub fn at_least(descriptor: &PropertyDescriptor<T>, min: T) -> Self {
        Self::new(descriptor, MatchOp::Range { min: Some(min), max: None })
    }

    pub fn at_most(descriptor: &PropertyDescriptor<T>, max: T) -> Self {
        Self::new(descriptor, MatchOp::Range { min: None, max: Some(max) })
    }

    pub fn one_of(descriptor: &PropertyDescriptor<T>, values: Vec<T>) -> Self {
        Self::new(descriptor, MatchOp::OneOf(values))
    }

    pub fn boxed(self) -> AnyMatcher {
        Box::new(self)
    }

    fn serialize(&self, value: &T) -> Result<Value> {
        serde_json::to_value(value).map_err(|e| CacheError::serialization(self.descriptor.name(), e))
    }
}

impl<T: PropertyType> ValueMatcher for PropertyMatcher<T> {
    fn property_name(&self) -> &str {
        self.descriptor.name()
    }

    fn is_ordered(&self) -> bool {
        matches!(self.op, MatchOp::Range { .. })
    }

    fn compile(&self) -> Result<CompiledMatcher> {
        let op = match &self.op {
            MatchOp::Equals(v) => CompiledOp::Equals(self.serialize(v)?),
            MatchOp::NotEquals(v) => CompiledOp::NotEquals(self.serialize(v)?),
            MatchOp::Range { min, max } => CompiledOp::Range {
                min: min.as_ref().map(|v| self.serialize(v)).transpose()?,
                max: max.as_ref().map(|v| self.serialize(v)).transpose()?,
            },
            MatchOp::OneOf(values) => CompiledOp::OneOf(
                values
                    .iter()
                    .map(|v| self.serialize(v))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        Ok(CompiledMatcher {
            name: self.descriptor.name().to_string(),
            op,
        })
    }
}

impl IntervalPropertyMatcher {
    pub fn boxed(self) -> AnyMatcher {
        Box::new(self)
    }
}

impl ValueMatcher for IntervalPropertyMatcher {
    fn property_name(&self) -> &str {
        &self.name
    }

    fn is_ordered(&self) -> bool {
        true
    }

    fn compile(&self) -> Result<CompiledMatcher> {
        Ok(CompiledMatcher {
            name: self.name.clone(),
            op: CompiledOp::Overlaps(self.interval.clone()),
        })
    }
}

/// Serialized comparison evaluated against stored values
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledOp {
    Equals(Value),
    NotEquals(Value),
    Range { min: Option<Value>, max: Option<Value> },
    OneOf(Vec<Value>),
    Overlaps(IntervalValue),
}

/// Matcher in the form handed to a group store
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMatcher {
    pub name: String,
    pub op: CompiledOp,
}

impl CompiledMatcher {
    /// Evaluate against the stored value of the property (absent never matches)
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match &self.op {
            CompiledOp::Equals(operand) => values_equal(value, operand),
            CompiledOp::NotEquals(operand) => !values_equal(value, operand),
            CompiledOp::Range { min, max } => {
                let above = min.as_ref().map_or(true, |min| {
                    same_kind(value, min) && compare_values(value, min) != Ordering::Less
                });
                let below = max.as_ref().map_or(true, |max| {
                    same_kind(value, max) && compare_values(value, max) != Ordering::Greater
                });
                above && below
            }
            CompiledOp::OneOf(operands) => operands.iter().any(|o| values_equal(value, o)),
            CompiledOp::Overlaps(interval) => serde_json::from_value::<IntervalValue>(value.clone())
                .map_or(false, |stored| stored.overlaps(interval)),
        }
    }
}

/// Direction of an order specifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Sort rows of a query by one property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSpecifier {
    pub name: String,
    pub direction: SortDirection,
}

impl OrderSpecifier {
    pub fn ascending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: SortDirection::Descending,
        }
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    kind_rank(a) == kind_rank(b)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

/// Total order over stored values.
///
/// Values of different JSON kinds order by kind; numbers compare numerically;
/// objects that hold interval values compare by their lower bound.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (x, y) in x.iter().zip(y.iter()) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => {
            let x = serde_json::from_value::<IntervalValue>(a.clone());
            let y = serde_json::from_value::<IntervalValue>(b.clone());
            match (x, y) {
                (Ok(x), Ok(y)) => x
                    .sort_key()
                    .partial_cmp(&y.sort_key())
                    .unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            }
        }
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

fn integer_of(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

/// Exact comparison; integers are never rounded through `f64`
fn compare_numbers(x: &Number, y: &Number) -> Ordering {
    match (integer_of(x), integer_of(y)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(x), None) => compare_integer_float(x, y.as_f64().unwrap_or(f64::NAN)),
        (None, Some(y)) => compare_integer_float(y, x.as_f64().unwrap_or(f64::NAN)).reverse(),
        (None, None) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
    }
}

fn compare_integer_float(i: i128, f: f64) -> Ordering {
    // stored integers lie in [-2^63, 2^64)
    if f.is_nan() {
        return Ordering::Equal;
    }
    if f >= 18_446_744_073_709_551_616.0 {
        return Ordering::Less;
    }
    if f < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let floor = f.floor();
    match i.cmp(&(floor as i128)) {
        Ordering::Equal if f > floor => Ordering::Less,
        ord => ord,
    }
}
