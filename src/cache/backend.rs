//! Group store interface and the in-memory backend
//!
//! The cache core talks to physical storage only through [`GroupStore`].
//! Calls for one group are serialized by the cache's per-group lock, so a
//! backend only needs to be safe for concurrent calls on different groups.

use crate::cache::matcher::CompiledMatcher;
use crate::cache::types::{GroupId, RowId};
use crate::error::{CacheError, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// One stored row: serialized property values plus eviction metadata
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub values: HashMap<String, Value>,
    pub critical: bool,
}

impl StoredRow {
    pub fn new(values: HashMap<String, Value>, critical: bool) -> Self {
        Self { values, critical }
    }

    /// Approximate serialized size of the row in bytes
    pub fn byte_size(&self) -> u64 {
        self.values
            .iter()
            .map(|(k, v)| (k.len() + value_size(v)) as u64)
            .sum()
    }
}

/// Serialized size of one value in bytes
pub fn value_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0)
}

/// Durable row storage keyed by group and row id
pub trait GroupStore: Send + Sync {
    /// Prepare the backend for use; failures surface as initialization errors
    fn open(&self) -> Result<()>;

    /// Release backend resources
    fn close(&self) {}

    /// Insert new rows into a group
    fn insert(&self, group: GroupId, rows: Vec<(RowId, StoredRow)>) -> Result<()>;

    /// Overwrite the given properties of existing rows; returns the rows that existed
    fn update_by_ids(&self, group: GroupId, updates: Vec<(RowId, HashMap<String, Value>)>) -> Result<Vec<RowId>>;

    /// Ids of the rows satisfying every matcher, ascending
    fn scan_matching(&self, group: GroupId, matchers: &[CompiledMatcher]) -> Result<Vec<RowId>>;

    /// Rows by id, positional; `None` for absent rows
    fn fetch(&self, group: GroupId, rows: &[RowId]) -> Result<Vec<Option<StoredRow>>>;

    /// Delete rows; returns the rows that were removed
    fn delete_by_ids(&self, group: GroupId, rows: &[RowId]) -> Result<Vec<(RowId, StoredRow)>>;

    /// Delete a whole group; returns its rows
    fn drop_group(&self, group: GroupId) -> Result<Vec<(RowId, StoredRow)>>;

    /// Approximate persisted size of all groups in bytes
    fn approximate_byte_size(&self) -> u64;

    /// Approximate memory held by the backend in bytes
    fn in_memory_byte_size(&self) -> u64 {
        self.approximate_byte_size()
    }
}

/// Group store keeping every row in memory
#[derive(Default)]
pub struct MemoryGroupStore {
    groups: RwLock<HashMap<GroupId, BTreeMap<RowId, StoredRow>>>,
    size_bytes: AtomicU64,
    open: AtomicBool,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self, group: GroupId) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::storage(format!("group {}", group), "store is not open"))
        }
    }

    fn add_size(&self, delta: u64) {
        self.size_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    fn sub_size(&self, delta: u64) {
        let _ = self
            .size_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(s.saturating_sub(delta)));
    }
}

impl GroupStore for MemoryGroupStore {
    fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::Release);
        info!("In-memory group store opened");
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.groups.write().clear();
        self.size_bytes.store(0, Ordering::Relaxed);
    }

    fn insert(&self, group: GroupId, rows: Vec<(RowId, StoredRow)>) -> Result<()> {
        self.ensure_open(group)?;
        let mut groups = self.groups.write();
        let table = groups.entry(group).or_default();
        let mut added = 0;
        for (row, stored) in rows {
            added += stored.byte_size();
            if let Some(old) = table.insert(row, stored) {
                self.sub_size(old.byte_size());
            }
        }
        self.add_size(added);
        Ok(())
    }

    fn update_by_ids(&self, group: GroupId, updates: Vec<(RowId, HashMap<String, Value>)>) -> Result<Vec<RowId>> {
        self.ensure_open(group)?;
        let mut groups = self.groups.write();
        let Some(table) = groups.get_mut(&group) else {
            return Ok(Vec::new());
        };
        let mut updated = Vec::with_capacity(updates.len());
        for (row, values) in updates {
            if let Some(stored) = table.get_mut(&row) {
                let before = stored.byte_size();
                stored.values.extend(values);
                let after = stored.byte_size();
                self.sub_size(before);
                self.add_size(after);
                updated.push(row);
            }
        }
        Ok(updated)
    }

    fn scan_matching(&self, group: GroupId, matchers: &[CompiledMatcher]) -> Result<Vec<RowId>> {
        self.ensure_open(group)?;
        let groups = self.groups.read();
        let Some(table) = groups.get(&group) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<RowId> = table
            .iter()
            .filter(|(_, stored)| matchers.iter().all(|m| m.matches(stored.values.get(&m.name))))
            .map(|(row, _)| *row)
            .collect();
        // row ids are unsigned bit patterns
        rows.sort_by_key(|r| *r as u32);
        Ok(rows)
    }

    fn fetch(&self, group: GroupId, rows: &[RowId]) -> Result<Vec<Option<StoredRow>>> {
        self.ensure_open(group)?;
        let groups = self.groups.read();
        let table = groups.get(&group);
        Ok(rows
            .iter()
            .map(|row| table.and_then(|t| t.get(row)).cloned())
            .collect())
    }

    fn delete_by_ids(&self, group: GroupId, rows: &[RowId]) -> Result<Vec<(RowId, StoredRow)>> {
        self.ensure_open(group)?;
        let mut groups = self.groups.write();
        let Some(table) = groups.get_mut(&group) else {
            return Ok(Vec::new());
        };
        let mut removed = Vec::new();
        for row in rows {
            if let Some(stored) = table.remove(row) {
                self.sub_size(stored.byte_size());
                removed.push((*row, stored));
            }
        }
        debug!("Deleted {} rows from group {}", removed.len(), group);
        Ok(removed)
    }

    fn drop_group(&self, group: GroupId) -> Result<Vec<(RowId, StoredRow)>> {
        self.ensure_open(group)?;
        let table = self.groups.write().remove(&group).unwrap_or_default();
        let removed: Vec<(RowId, StoredRow)> = table.into_iter().collect();
        self.sub_size(removed.iter().map(|(_, r)| r.byte_size()).sum());
        Ok(removed)
    }

    fn approximate_byte_size(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }
}
