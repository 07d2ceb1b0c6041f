//! # property-cache
//!
//! A generic, typed property cache for Rust.
//!
//! ## Features
//!
//! - Category-labelled rows stored in per-category, per-expiration groups
//! - 64-bit combined ids splitting losslessly into group and row ids
//! - Typed property accessors and heterogeneous batch retrieval
//! - Interval satisfaction for spatial/temporal range requests
//! - Merged modification reports and removal notifications
//! - Async-first design using tokio, with one lock per group
//! - Background eviction against byte budgets and a row limit
//!
//! See [`cache`] for a complete example.

pub mod cache;
pub mod error;

pub use cache::{
    CacheConfig, Category, CombinedId, Deposit, Expiration, InitWait, PropertyAccessor, PropertyCache,
    PropertyDescriptor, PropertyValueMap,
};
pub use error::{CacheError, Result};
