//! Storage groups and the registry that allocates them
//!
//! A group holds the rows of one (category, expiration) pair. Mutations of a
//! group are serialized by its own async lock; the registry lock only guards
//! the maps from keys to groups and is never held across an await point.

use crate::cache::category::Category;
use crate::cache::satisfaction::CoverageIndex;
use crate::cache::types::{Expiration, GroupId, RowId};
use crate::error::{CacheError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::info;

/// Mutable state of a group, guarded by the group lock
#[derive(Debug, Default)]
pub struct GroupState {
    /// Regions known to be fully cached
    pub coverage: CoverageIndex,

    /// Declared type name of every property stored in the group
    pub columns: HashMap<String, &'static str>,

    /// Set once the group has been removed from the registry
    pub dropped: bool,
}

impl GroupState {
    /// Fail when a deposited property is already stored under another type
    pub fn check_columns<'a, I>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'static str)>,
    {
        for (name, type_name) in keys {
            if let Some(existing) = self.columns.get(name) {
                if *existing != type_name {
                    return Err(CacheError::Configuration(format!(
                        "property '{}' is stored as {} but was deposited as {}",
                        name, existing, type_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Check deposited properties against the declared types, then record them
    pub fn declare_columns<'a, I>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'static str)> + Clone,
    {
        self.check_columns(keys.clone())?;
        for (name, type_name) in keys {
            self.columns.insert(name.to_string(), type_name);
        }
        Ok(())
    }
}

/// Physical partition for one category and expiration
#[derive(Debug)]
pub struct Group {
    pub id: GroupId,
    pub category: Category,
    pub expiration: Expiration,
    next_row: AtomicU32,
    row_count: AtomicUsize,
    pub(crate) state: AsyncRwLock<GroupState>,
}

impl Group {
    fn new(id: GroupId, category: Category, expiration: Expiration) -> Self {
        Self {
            id,
            category,
            expiration,
            next_row: AtomicU32::new(0),
            row_count: AtomicUsize::new(0),
            state: AsyncRwLock::new(GroupState::default()),
        }
    }

    /// Allocate `count` consecutive row ids
    pub fn allocate_rows(&self, count: usize) -> Vec<RowId> {
        let first = self.next_row.fetch_add(count as u32, Ordering::AcqRel);
        (0..count as u32)
            .map(|i| first.wrapping_add(i) as RowId)
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.row_count.load(Ordering::Relaxed)
    }

    pub(crate) fn rows_added(&self, n: usize) {
        self.row_count.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn rows_removed(&self, n: usize) {
        let _ = self
            .row_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_sub(n)));
    }

    /// Description used in log lines and storage error context
    pub fn describe(&self) -> String {
        format!("group {} ({}, expires {})", self.id, self.category, self.expiration)
    }
}

#[derive(Default)]
struct RegistryMaps {
    by_key: HashMap<(Category, Expiration), Arc<Group>>,
    by_id: BTreeMap<GroupId, Arc<Group>>,
}

/// Registry of live groups
pub struct GroupRegistry {
    maps: RwLock<RegistryMaps>,
    next_group: AtomicI32,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(RegistryMaps::default()),
            next_group: AtomicI32::new(1),
        }
    }

    /// Group for `category` and `expiration`, if one exists
    pub fn find(&self, category: &Category, expiration: Expiration) -> Option<Arc<Group>> {
        self.maps
            .read()
            .by_key
            .get(&(category.clone(), expiration))
            .cloned()
    }

    /// Group for `category` and `expiration`, created on first use
    pub fn get_or_create(&self, category: &Category, expiration: Expiration) -> Arc<Group> {
        let key = (category.clone(), expiration);
        if let Some(group) = self.maps.read().by_key.get(&key) {
            return group.clone();
        }

        let mut maps = self.maps.write();
        if let Some(group) = maps.by_key.get(&key) {
            return group.clone();
        }
        let id = self.next_group.fetch_add(1, Ordering::AcqRel);
        let group = Arc::new(Group::new(id, category.clone(), expiration));
        info!("Created {}", group.describe());
        maps.by_key.insert(key, group.clone());
        maps.by_id.insert(id, group.clone());
        group
    }

    pub fn get(&self, id: GroupId) -> Option<Arc<Group>> {
        self.maps.read().by_id.get(&id).cloned()
    }

    /// Groups whose category matches `pattern`, by ascending id
    pub fn matching(&self, pattern: &Category) -> Vec<Arc<Group>> {
        self.maps
            .read()
            .by_id
            .values()
            .filter(|g| pattern.matches(&g.category))
            .cloned()
            .collect()
    }

    /// All groups, by ascending id
    pub fn all(&self) -> Vec<Arc<Group>> {
        self.maps.read().by_id.values().cloned().collect()
    }

    /// Unregister a group; later lookups of its key create a fresh group
    pub fn remove(&self, id: GroupId) -> Option<Arc<Group>> {
        let mut maps = self.maps.write();
        let group = maps.by_id.remove(&id)?;
        maps.by_key.remove(&(group.category.clone(), group.expiration));
        Some(group)
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
