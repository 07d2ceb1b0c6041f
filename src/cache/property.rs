//! Typed property descriptors, accessors and batch result containers
//!
//! A [`PropertyDescriptor`] names a property and fixes its Rust type. A
//! [`PropertyAccessor`] extracts that property from caller objects; accessors
//! are erased to [`AnyAccessor`] so one deposit can carry properties of
//! different types. Descriptor identity is the property name alone.

use crate::cache::interval::IntervalValue;
use crate::cache::registry::TypeRegistry;
use crate::error::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Types that can be stored as property values
pub trait PropertyType: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> PropertyType for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Type-erased descriptor: a property name and its declared type name
#[derive(Clone)]
pub struct PropertyKey {
    name: Arc<str>,
    type_name: &'static str,
}

impl PropertyKey {
    /// Key for a stored column whose declared type is only known by name
    pub(crate) fn from_parts(name: &str, type_name: &'static str) -> Self {
        Self {
            name: name.into(),
            type_name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for PropertyKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for PropertyKey {}

impl Hash for PropertyKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.type_name)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Named property of type `T`
pub struct PropertyDescriptor<T> {
    key: PropertyKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T: PropertyType> PropertyDescriptor<T> {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            key: PropertyKey {
                name: name.into(),
                type_name: type_name::<T>(),
            },
            _marker: PhantomData,
        }
    }
}

impl<T> PropertyDescriptor<T> {
    pub fn name(&self) -> &str {
        self.key.name()
    }

    pub fn type_name(&self) -> &'static str {
        self.key.type_name
    }

    pub fn key(&self) -> &PropertyKey {
        &self.key
    }
}

impl<T> Clone for PropertyDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for PropertyDescriptor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for PropertyDescriptor<T> {}

impl<T> Hash for PropertyDescriptor<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<T> fmt::Debug for PropertyDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyDescriptor({:?})", self.key)
    }
}

/// Extraction of one property from a source object, with the value type erased
pub trait ValueAccessor<S>: Send + Sync {
    /// Descriptor of the produced property
    fn key(&self) -> &PropertyKey;

    /// Extract and serialize the property value of `source`
    fn access(&self, source: &S) -> Result<Value>;

    /// Extent covered by the whole deposit, for interval accessors
    fn extent(&self) -> Option<&IntervalValue> {
        None
    }
}

/// Shared, type-erased accessor
pub type AnyAccessor<S> = Arc<dyn ValueAccessor<S>>;

/// Pure function extracting a `T` property from an `S`
pub struct PropertyAccessor<S, T> {
    descriptor: PropertyDescriptor<T>,
    extract: Arc<dyn Fn(&S) -> T + Send + Sync>,
}

impl<S: 'static, T: PropertyType> PropertyAccessor<S, T> {
    pub fn new<F>(descriptor: PropertyDescriptor<T>, extract: F) -> Self
    where
        F: Fn(&S) -> T + Send + Sync + 'static,
    {
        Self {
            descriptor,
            extract: Arc::new(extract),
        }
    }

    /// Accessor returning the same value for every source object
    pub fn constant(descriptor: PropertyDescriptor<T>, value: T) -> Self
    where
        T: Clone,
    {
        Self::new(descriptor, move |_: &S| value.clone())
    }

    pub fn descriptor(&self) -> &PropertyDescriptor<T> {
        &self.descriptor
    }

    /// Extract the typed value
    pub fn get(&self, source: &S) -> T {
        (self.extract)(source)
    }

    /// Erase the value type
    pub fn erased(self) -> AnyAccessor<S> {
        Arc::new(self)
    }
}

impl<S: 'static, T: PropertyType> ValueAccessor<S> for PropertyAccessor<S, T> {
    fn key(&self) -> &PropertyKey {
        self.descriptor.key()
    }

    fn access(&self, source: &S) -> Result<Value> {
        serde_json::to_value(self.get(source))
            .map_err(|e| CacheError::serialization(self.descriptor.name(), e))
    }
}

/// Accessor of an interval property that also knows the extent of its deposit
///
/// The extent is the region the deposit was fetched for (e.g. the requested
/// bounding box), which may be larger than the union of the row values.
pub struct IntervalPropertyAccessor<S> {
    inner: PropertyAccessor<S, IntervalValue>,
    extent: IntervalValue,
}

impl<S: 'static> IntervalPropertyAccessor<S> {
    pub fn new<F>(descriptor: PropertyDescriptor<IntervalValue>, extent: IntervalValue, extract: F) -> Self
    where
        F: Fn(&S) -> IntervalValue + Send + Sync + 'static,
    {
        Self {
            inner: PropertyAccessor::new(descriptor, extract),
            extent,
        }
    }

    pub fn erased(self) -> AnyAccessor<S> {
        Arc::new(self)
    }
}

impl<S: 'static> ValueAccessor<S> for IntervalPropertyAccessor<S> {
    fn key(&self) -> &PropertyKey {
        self.inner.key()
    }

    fn access(&self, source: &S) -> Result<Value> {
        self.inner.access(source)
    }

    fn extent(&self) -> Option<&IntervalValue> {
        Some(&self.extent)
    }
}

/// One typed result column of a [`PropertyValueMap`]
pub(crate) trait ValueList: Send {
    fn key(&self) -> &PropertyKey;
    fn len(&self) -> usize;
    fn try_push(&mut self, value: &Value, declared_type: &str, registry: &TypeRegistry) -> bool;
    fn push_missing(&mut self);
    fn truncate(&mut self, len: usize);
    fn reset(&mut self);
    fn as_any(&self) -> &dyn Any;
}

struct TypedList<T> {
    key: PropertyKey,
    values: Vec<Option<T>>,
}

impl<T: PropertyType> ValueList for TypedList<T> {
    fn key(&self) -> &PropertyKey {
        &self.key
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn try_push(&mut self, value: &Value, declared_type: &str, registry: &TypeRegistry) -> bool {
        if !registry.is_compatible::<T>(declared_type) {
            return false;
        }
        match serde_json::from_value::<T>(value.clone()) {
            Ok(v) => {
                self.values.push(Some(v));
                true
            }
            Err(_) => false,
        }
    }

    fn push_missing(&mut self) {
        self.values.push(None);
    }

    fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    fn reset(&mut self) {
        self.values.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Heterogeneous batch result: one typed list per requested property
///
/// After a retrieval, position `i` of every list holds the value for the
/// `i`-th requested id, or `None` when that row could not be resolved.
#[derive(Default)]
pub struct PropertyValueMap {
    lists: Vec<Box<dyn ValueList>>,
    index: HashMap<Arc<str>, usize>,
}

impl PropertyValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `descriptor` in the next retrieval
    pub fn add_property<T: PropertyType>(&mut self, descriptor: &PropertyDescriptor<T>) {
        let list = Box::new(TypedList::<T> {
            key: descriptor.key().clone(),
            values: Vec::new(),
        });
        match self.index.get(descriptor.name()) {
            Some(pos) => self.lists[*pos] = list,
            None => {
                self.index
                    .insert(descriptor.key().name.clone(), self.lists.len());
                self.lists.push(list);
            }
        }
    }

    /// Builder-style variant of [`add_property`](Self::add_property)
    pub fn with_property<T: PropertyType>(mut self, descriptor: &PropertyDescriptor<T>) -> Self {
        self.add_property(descriptor);
        self
    }

    /// Values retrieved for `descriptor`
    pub fn get<T: PropertyType>(&self, descriptor: &PropertyDescriptor<T>) -> Option<&[Option<T>]> {
        let pos = self.index.get(descriptor.name())?;
        self.lists[*pos]
            .as_any()
            .downcast_ref::<TypedList<T>>()
            .map(|list| list.values.as_slice())
    }

    /// Requested properties, in request order
    pub fn keys(&self) -> impl Iterator<Item = &PropertyKey> {
        self.lists.iter().map(|list| list.key())
    }

    /// Number of requested properties
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub(crate) fn lists_mut(&mut self) -> &mut [Box<dyn ValueList>] {
        &mut self.lists
    }
}

impl fmt::Debug for PropertyValueMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.lists.iter().map(|l| (l.key().clone(), l.len())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Road {
        name: String,
        length: f64,
    }

    #[test]
    fn test_descriptor_identity_is_name() {
        let a = PropertyDescriptor::<String>::new("name");
        let b = PropertyDescriptor::<String>::new("name");
        assert_eq!(a, b);
        assert_eq!(a.key(), PropertyDescriptor::<f64>::new("name").key());
        assert_eq!(a.type_name(), type_name::<String>());
    }

    #[test]
    fn test_accessor_extracts_and_serializes() {
        let name = PropertyAccessor::new(PropertyDescriptor::<String>::new("name"), |r: &Road| {
            r.name.clone()
        });
        let length = PropertyAccessor::new(PropertyDescriptor::<f64>::new("length"), |r: &Road| {
            r.length
        })
        .erased();

        let road = Road {
            name: "Main St".to_string(),
            length: 120.5,
        };
        assert_eq!(name.get(&road), "Main St");
        assert_eq!(length.access(&road).unwrap(), serde_json::json!(120.5));
        assert!(length.extent().is_none());
    }

    #[test]
    fn test_unserializable_value_is_serialization_error() {
        // JSON object keys must be strings
        let map_desc = PropertyDescriptor::<HashMap<Vec<u8>, i32>>::new("bad");
        let accessor = PropertyAccessor::new(map_desc, |_: &()| {
            HashMap::from([(vec![1u8], 1)])
        });
        let err = accessor.access(&()).unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }

    #[test]
    fn test_constant_and_interval_accessors() {
        let source = PropertyAccessor::constant(
            PropertyDescriptor::<String>::new("source"),
            "survey".to_string(),
        );
        assert_eq!(source.get(&1u8), "survey");

        let bbox = IntervalPropertyAccessor::new(
            PropertyDescriptor::<IntervalValue>::new("bbox"),
            IntervalValue::envelope(0.0, 0.0, 1.0, 1.0),
            |_: &u8| IntervalValue::envelope(0.5, 0.5, 0.5, 0.5),
        )
        .erased();
        assert_eq!(bbox.extent(), Some(&IntervalValue::envelope(0.0, 0.0, 1.0, 1.0)));
    }

    #[test]
    fn test_value_map_typed_lists() {
        let registry = TypeRegistry::new();
        let name = PropertyDescriptor::<String>::new("name");
        let mut map = PropertyValueMap::new().with_property(&name);
        assert_eq!(map.len(), 1);

        for list in map.lists_mut() {
            assert!(list.try_push(&serde_json::json!("Main St"), type_name::<String>(), &registry));
            assert!(!list.try_push(&serde_json::json!(3), type_name::<i64>(), &registry));
            list.push_missing();
        }

        let values = map.get(&name).unwrap();
        assert_eq!(values, &[Some("Main St".to_string()), None]);
        assert!(map.get(&PropertyDescriptor::<f64>::new("name")).is_none());
    }
}
