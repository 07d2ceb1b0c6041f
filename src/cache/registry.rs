//! Resolution of declared value type names
//!
//! Each stored property remembers the type name it was deposited with. When a
//! reader asks for the property under a different type name, the registry
//! decides whether the stored type is the requested Rust type, falling back to
//! the class provider for types owned by dynamically loaded modules.

use crate::cache::interval::{Envelope, IntervalValue, TimeSpan};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Hook resolving a declared type name the registry does not know
pub type ClassProvider = Arc<dyn Fn(&str) -> Option<TypeId> + Send + Sync>;

/// Registry mapping declared type names to Rust types
pub struct TypeRegistry {
    names: RwLock<HashMap<String, TypeId>>,
    provider: RwLock<Option<ClassProvider>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create a registry that knows the primitive and interval types
    pub fn new() -> Self {
        let registry = Self {
            names: RwLock::new(HashMap::new()),
            provider: RwLock::new(None),
        };
        registry.register_type::<String>();
        registry.register_type::<bool>();
        registry.register_type::<i32>();
        registry.register_type::<i64>();
        registry.register_type::<u32>();
        registry.register_type::<u64>();
        registry.register_type::<f32>();
        registry.register_type::<f64>();
        registry.register_type::<DateTime<Utc>>();
        registry.register_type::<IntervalValue>();
        registry.register_type::<Envelope>();
        registry.register_type::<TimeSpan>();
        registry.register_type::<serde_json::Value>();
        registry
    }

    /// Register `T` under its Rust type name
    pub fn register_type<T: 'static>(&self) {
        self.register::<T>(type_name::<T>());
    }

    /// Register `T` under an alias, e.g. a name used by an older release
    pub fn register<T: 'static>(&self, name: &str) {
        self.names.write().insert(name.to_string(), TypeId::of::<T>());
    }

    /// Install the hook consulted when a name is not registered
    pub fn set_class_provider(&self, provider: ClassProvider) {
        *self.provider.write() = Some(provider);
    }

    /// Resolve a declared type name
    pub fn resolve(&self, declared: &str) -> Option<TypeId> {
        if let Some(id) = self.names.read().get(declared) {
            return Some(*id);
        }
        let provider = self.provider.read().clone();
        let resolved = provider.and_then(|p| p(declared));
        debug!("Class provider resolution for {}: {:?}", declared, resolved.is_some());
        resolved
    }

    /// Check whether values declared as `declared` can be read as `T`
    pub fn is_compatible<T: 'static>(&self, declared: &str) -> bool {
        declared == type_name::<T>() || self.resolve(declared) == Some(TypeId::of::<T>())
    }
}
