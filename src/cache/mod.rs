//! # Property Cache
//!
//! Unrelated subsystems deposit typed *model properties* of their objects
//! into a shared cache, query row ids by property values, read values back in
//! batches and get notified when rows change or leave the cache.
//!
//! ## Features
//!
//! - **Categories and groups**: rows are labelled `(source, family, category)`
//!   and stored in one group per category and expiration
//! - **Compact ids**: a 64-bit id packs the group id and the row id
//! - **Typed accessors**: properties are extracted by accessor functions and
//!   read back into typed lists, with no fixed column layout
//! - **Interval satisfaction**: spatial/temporal requests are split into the
//!   sub-regions the cache already holds
//! - **Change notification**: modification reports about the same rows are
//!   merged before delivery
//! - **Eviction**: expired rows first, then nearest-to-expiration rows until
//!   the byte budgets and row limit hold; critical rows are never evicted
//!
//! ## Example
//!
//! ```rust
//! use property_cache::cache::{
//!     CacheConfig, Category, Deposit, Expiration, InitWait, PropertyAccessor,
//!     PropertyCache, PropertyDescriptor, PropertyValueMap,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = PropertyCache::in_memory(CacheConfig::default());
//! cache.initialize(InitWait::Indefinite).await?;
//!
//! let name = PropertyDescriptor::<String>::new("name");
//! let length = PropertyDescriptor::<f64>::new("length");
//!
//! let deposit = Deposit::builder(Category::new("wfs", "feature", "roads"))
//!     .accessor(PropertyAccessor::new(name.clone(), |r: &(String, f64)| r.0.clone()).erased())
//!     .accessor(PropertyAccessor::new(length.clone(), |r: &(String, f64)| r.1).erased())
//!     .input(vec![("Main St".to_string(), 120.5)])
//!     .expiration(Expiration::SessionEnd)
//!     .build()?;
//! let ids = cache.put(deposit, None).await?;
//!
//! let mut values = PropertyValueMap::new().with_property(&name).with_property(&length);
//! cache.get_values(&ids, &mut values, None).await?;
//! assert_eq!(values.get(&length), Some(&[Some(120.5)][..]));
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod category;
pub mod config;
pub mod deposit;
pub mod group;
pub mod id;
pub mod interval;
pub mod invalidation;
pub mod matcher;
pub mod property;
pub mod query;
pub mod registry;
pub mod report;
pub mod satisfaction;
pub mod store;
pub mod types;

pub use backend::{GroupStore, MemoryGroupStore, StoredRow};
pub use category::Category;
pub use config::{CacheConfig, CacheConfigBuilder};
pub use deposit::{Deposit, DepositBuilder};
pub use interval::{
    Envelope, IntervalPropertyMatcher, IntervalPropertyValueSet, IntervalValue, Satisfaction, TimeSpan,
};
pub use invalidation::{InvalidationEvent, InvalidationReason};
pub use matcher::{AnyMatcher, MatchOp, OrderSpecifier, PropertyMatcher, SortDirection, ValueMatcher};
pub use property::{
    AnyAccessor, IntervalPropertyAccessor, PropertyAccessor, PropertyDescriptor, PropertyKey,
    PropertyType, PropertyValueMap, ValueAccessor,
};
pub use registry::{ClassProvider, TypeRegistry};
pub use report::{
    filter_accessors, merge_reports, CacheRemovalListener, ChannelListener, ModificationListener,
    ModificationReport,
};
pub use store::{InitWait, PropertyCache, RemovalListenerId};
pub use types::{CacheStats, CombinedId, Expiration, GroupId, RowId};
