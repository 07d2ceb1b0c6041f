//! Cache façade: lifecycle, deposits, updates, clears and eviction

use crate::cache::backend::{GroupStore, MemoryGroupStore, StoredRow};
use crate::cache::category::Category;
use crate::cache::config::CacheConfig;
use crate::cache::deposit::{check_unique_accessors, Deposit};
use crate::cache::group::{Group, GroupRegistry};
use crate::cache::id;
use crate::cache::interval::{IntervalPropertyMatcher, Satisfaction};
use crate::cache::invalidation::{
    plan_eviction, EvictionBudget, GroupUsage, InvalidationEvent, InvalidationReason, UsageTotals,
};
use crate::cache::property::{AnyAccessor, PropertyKey};
use crate::cache::registry::TypeRegistry;
use crate::cache::report::{merge_reports, CacheRemovalListener, ModificationListener, ModificationReport};
use crate::cache::satisfaction::{compute_satisfactions, CoverageIndex};
use crate::cache::types::{CacheStats, CombinedId, GroupId, RowId};
use crate::error::{CacheError, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long [`PropertyCache::initialize`] waits for the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitWait {
    /// Start initialization and return at once
    Immediate,

    /// Block until initialization has finished
    Indefinite,

    /// Block up to the given duration; initialization continues afterwards
    UpTo(Duration),
}

impl InitWait {
    /// `0` waits not at all, a negative value waits indefinitely
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => InitWait::Immediate,
            ms if ms < 0 => InitWait::Indefinite,
            ms => InitWait::UpTo(Duration::from_millis(ms as u64)),
        }
    }
}

#[derive(Debug, Clone)]
enum Lifecycle {
    Uninitialized,
    Pending,
    Ready,
    Failed(CacheError),
    Closed,
}

/// Handle returned when a removal listener is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemovalListenerId(u64);

struct RegisteredListener {
    id: RemovalListenerId,
    pattern: Category,
    listener: Arc<dyn CacheRemovalListener>,
}

pub(super) struct CacheInner {
    pub(super) config: RwLock<CacheConfig>,
    pub(super) backend: Arc<dyn GroupStore>,
    pub(super) groups: GroupRegistry,
    pub(super) types: TypeRegistry,
    lifecycle: watch::Sender<Lifecycle>,
    counters: Mutex<CacheStats>,
    removal_listeners: RwLock<Vec<RegisteredListener>>,
    next_listener: AtomicU64,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

/// Typed property cache shared by independent subsystems
///
/// Cloning is cheap and every clone refers to the same cache. Writes to one
/// group are serialized by that group's lock; operations on different groups
/// run concurrently.
#[derive(Clone)]
pub struct PropertyCache {
    pub(super) inner: Arc<CacheInner>,
}

/// Consecutive ids of one group, as produced by [`id::for_each_group`]
pub(super) struct GroupRun {
    pub(super) group_id: GroupId,
    pub(super) ids: Vec<CombinedId>,
    pub(super) rows: Vec<RowId>,
}

pub(super) fn group_runs(ids: &[CombinedId]) -> Vec<GroupRun> {
    let mut runs = Vec::new();
    let _ = id::for_each_group(ids, |run, group_id, rows| {
        runs.push(GroupRun {
            group_id,
            ids: run.to_vec(),
            rows: rows.to_vec(),
        });
        Ok::<(), Infallible>(())
    });
    runs
}

/// Replace the context of backend errors with the group they happened in
pub(super) fn in_group(group: &Group) -> impl FnOnce(CacheError) -> CacheError + '_ {
    move |err| match err {
        CacheError::Storage { reason, .. } => CacheError::Storage {
            context: group.describe(),
            reason,
        },
        other => other,
    }
}

fn extract_rows<S>(accessors: &[AnyAccessor<S>], input: &[S]) -> Result<Vec<HashMap<String, Value>>> {
    input
        .iter()
        .map(|source| {
            accessors
                .iter()
                .map(|a| Ok((a.key().name().to_string(), a.access(source)?)))
                .collect::<Result<HashMap<String, Value>>>()
        })
        .collect()
}

impl PropertyCache {
    /// Create a cache over `backend`; call [`initialize`](Self::initialize) before use
    pub fn new(config: CacheConfig, backend: Arc<dyn GroupStore>) -> Self {
        info!("Creating property cache with config: {:?}", config);
        let (lifecycle, _) = watch::channel(Lifecycle::Uninitialized);

        Self {
            inner: Arc::new(CacheInner {
                config: RwLock::new(config),
                backend,
                groups: GroupRegistry::new(),
                types: TypeRegistry::new(),
                lifecycle,
                counters: Mutex::new(CacheStats::default()),
                removal_listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                cleanup_task: Mutex::new(None),
            }),
        }
    }

    /// Create a cache over a fresh [`MemoryGroupStore`]
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(MemoryGroupStore::new()))
    }

    /// Open the backend in the background and wait for it according to `wait`.
    ///
    /// Must be called exactly once. Operations issued while initialization is
    /// still running wait for it; after a failure every operation returns the
    /// same initialization error.
    pub async fn initialize(&self, wait: InitWait) -> Result<()> {
        let mut started = false;
        self.inner.lifecycle.send_if_modified(|state| {
            if matches!(state, Lifecycle::Uninitialized) {
                *state = Lifecycle::Pending;
                started = true;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(match &*self.inner.lifecycle.borrow() {
                Lifecycle::Closed => CacheError::Closed,
                _ => CacheError::AlreadyInitialized,
            });
        }

        info!("Initializing property cache ({:?})", wait);
        tokio::spawn(open_backend(self.inner.clone()));

        match wait {
            InitWait::Immediate => Ok(()),
            InitWait::Indefinite => self.ensure_ready().await,
            InitWait::UpTo(limit) => match tokio::time::timeout(limit, self.ensure_ready()).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Initialization still running after {:?}", limit);
                    Ok(())
                }
            },
        }
    }

    /// True once initialization has succeeded and the cache is not closed
    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.lifecycle.borrow(), Lifecycle::Ready)
    }

    /// Stop background work and release the backend; later calls fail with `Closed`
    pub fn close(&self) {
        let previous = self.inner.lifecycle.send_replace(Lifecycle::Closed);
        if matches!(previous, Lifecycle::Closed) {
            return;
        }
        if let Some(task) = self.inner.cleanup_task.lock().take() {
            task.abort();
        }
        if matches!(previous, Lifecycle::Ready) {
            self.inner.backend.close();
        }
        info!("Property cache closed");
    }

    pub(super) async fn ensure_ready(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.subscribe();
        let state = {
            let state = lifecycle
                .wait_for(|s| !matches!(s, Lifecycle::Pending))
                .await
                .map_err(|_| CacheError::Closed)?;
            (*state).clone()
        };
        match state {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Uninitialized => Err(CacheError::NotInitialized),
            Lifecycle::Failed(err) => Err(err),
            Lifecycle::Pending | Lifecycle::Closed => Err(CacheError::Closed),
        }
    }

    /// Fails once the cache is closed or its initialization has failed
    fn check_open(&self) -> Result<()> {
        match &*self.inner.lifecycle.borrow() {
            Lifecycle::Closed => Err(CacheError::Closed),
            Lifecycle::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Insert or update the rows of a deposit; returns their ids in input order.
    ///
    /// New deposits get freshly allocated rows. Update deposits must name
    /// existing rows of the same category through [`Deposit::with_ids`].
    pub async fn put<S>(
        &self,
        deposit: Deposit<S>,
        listener: Option<&dyn ModificationListener>,
    ) -> Result<Vec<CombinedId>> {
        self.ensure_ready().await?;

        let keys = deposit.property_keys();
        let rows = extract_rows(deposit.accessors(), deposit.input())?;
        let ids = if deposit.is_new() {
            self.insert_deposit(&deposit, &keys, rows).await?
        } else {
            self.update_deposit(&deposit, &keys, rows).await?
        };

        let report = ModificationReport::new(deposit.category().clone(), ids.clone(), keys);
        if let Some(listener) = listener {
            listener.values_modified(&report);
        }
        Ok(ids)
    }

    async fn insert_deposit<S>(
        &self,
        deposit: &Deposit<S>,
        keys: &[PropertyKey],
        rows: Vec<HashMap<String, Value>>,
    ) -> Result<Vec<CombinedId>> {
        if let Some(targets) = deposit.ids() {
            let existing = self.existing_ids(targets).await?;
            if !existing.is_empty() {
                return Err(CacheError::Mismatch(format!(
                    "deposit for {} marks {} existing rows as new",
                    deposit.category(),
                    existing.len()
                )));
            }
            return Err(CacheError::InvalidArgument(
                "target ids are only accepted by update deposits".to_string(),
            ));
        }

        loop {
            let group = self
                .inner
                .groups
                .get_or_create(deposit.category(), deposit.expiration());
            let mut state = group.state.write().await;
            if state.dropped {
                continue;
            }
            state.declare_columns(keys.iter().map(|k| (k.name(), k.type_name())))?;

            let count = rows.len();
            let row_ids = group.allocate_rows(count);
            let stored = row_ids
                .iter()
                .copied()
                .zip(rows.into_iter().map(|values| StoredRow::new(values, deposit.is_critical())))
                .collect();
            self.inner
                .backend
                .insert(group.id, stored)
                .map_err(in_group(&group))?;
            group.rows_added(count);
            if let Some(coverage) = deposit.coverage() {
                state.coverage.record(coverage);
            }
            drop(state);

            self.inner.counters.lock().rows_inserted += count as u64;
            debug!("Inserted {} rows into {}", count, group.describe());
            return Ok(row_ids.into_iter().map(|row| id::encode(group.id, row)).collect());
        }
    }

    async fn update_deposit<S>(
        &self,
        deposit: &Deposit<S>,
        keys: &[PropertyKey],
        rows: Vec<HashMap<String, Value>>,
    ) -> Result<Vec<CombinedId>> {
        let targets = deposit.ids().ok_or_else(|| {
            CacheError::Mismatch(format!(
                "update deposit for {} names no existing rows",
                deposit.category()
            ))
        })?;
        if targets.len() != rows.len() {
            return Err(CacheError::InvalidArgument(format!(
                "{} target ids for {} input objects",
                targets.len(),
                rows.len()
            )));
        }

        let runs = group_runs(targets);
        let mut groups = Vec::with_capacity(runs.len());
        for run in &runs {
            let group = self.inner.groups.get(run.group_id).ok_or_else(|| {
                CacheError::Mismatch(format!(
                    "rows of group {} named by update deposit for {} do not exist",
                    run.group_id,
                    deposit.category()
                ))
            })?;
            if group.category != *deposit.category() {
                return Err(CacheError::Mismatch(format!(
                    "rows of {} cannot be updated by a deposit for {}",
                    group.describe(),
                    deposit.category()
                )));
            }
            groups.push(group);
        }

        // runs ascend by group id, so every writer locks in the same order
        let mut states = Vec::with_capacity(groups.len());
        for group in &groups {
            states.push(group.state.write().await);
        }

        for ((run, group), state) in runs.iter().zip(&groups).zip(&states) {
            if state.dropped {
                return Err(CacheError::Mismatch(format!("{} was cleared", group.describe())));
            }
            let stored = self
                .inner
                .backend
                .fetch(group.id, &run.rows)
                .map_err(in_group(group))?;
            if let Some((missing, _)) = run.ids.iter().zip(&stored).find(|(_, row)| row.is_none()) {
                return Err(CacheError::Mismatch(format!(
                    "row {} named by update deposit for {} does not exist",
                    missing,
                    deposit.category()
                )));
            }
            state.check_columns(keys.iter().map(|k| (k.name(), k.type_name())))?;
        }

        let mut values: HashMap<CombinedId, HashMap<String, Value>> =
            targets.iter().copied().zip(rows).collect();
        let coverage = deposit.coverage();
        let mut updated_rows = 0;

        for ((run, group), state) in runs.iter().zip(&groups).zip(states.iter_mut()) {
            state.declare_columns(keys.iter().map(|k| (k.name(), k.type_name())))?;
            let updates = run
                .ids
                .iter()
                .zip(&run.rows)
                .filter_map(|(id, row)| values.remove(id).map(|v| (*row, v)))
                .collect();
            let updated = self
                .inner
                .backend
                .update_by_ids(group.id, updates)
                .map_err(in_group(group))?;
            if let Some(coverage) = &coverage {
                state.coverage.record(coverage.clone());
            }
            updated_rows += updated.len();
        }
        drop(states);

        self.inner.counters.lock().rows_updated += updated_rows as u64;
        debug!("Updated {} rows of {}", updated_rows, deposit.category());
        Ok(targets.to_vec())
    }

    /// Ids among `ids` whose rows are currently stored
    pub(super) async fn existing_ids(&self, ids: &[CombinedId]) -> Result<HashSet<CombinedId>> {
        let mut existing = HashSet::new();
        for run in group_runs(ids) {
            let Some(group) = self.inner.groups.get(run.group_id) else {
                continue;
            };
            let state = group.state.read().await;
            if state.dropped {
                continue;
            }
            let rows = self
                .inner
                .backend
                .fetch(group.id, &run.rows)
                .map_err(in_group(&group))?;
            drop(state);
            existing.extend(
                run.ids
                    .iter()
                    .zip(rows)
                    .filter(|(_, row)| row.is_some())
                    .map(|(id, _)| *id),
            );
        }
        Ok(existing)
    }

    /// Overwrite the accessors' properties of existing rows.
    ///
    /// `input` holds either one object applied to every id or one object per
    /// id. Ids that are no longer stored are skipped. Listeners receive one
    /// merged report per touched group; with an `executor` the delivery runs
    /// there and this call does not wait for it. The touched groups stay
    /// write-locked for the whole update, and a column type conflict in any of
    /// them fails the call before a row is written.
    pub async fn update_values<S>(
        &self,
        ids: &[CombinedId],
        input: &[S],
        accessors: &[AnyAccessor<S>],
        listener: Option<Arc<dyn ModificationListener>>,
        executor: Option<&Handle>,
    ) -> Result<()> {
        self.ensure_ready().await?;
        check_unique_accessors(accessors)?;
        if input.len() != 1 && input.len() != ids.len() {
            return Err(CacheError::InvalidArgument(format!(
                "update of {} ids needs 1 or {} input objects, got {}",
                ids.len(),
                ids.len(),
                input.len()
            )));
        }

        let values = extract_rows(accessors, input)?;
        let keys: Vec<PropertyKey> = accessors.iter().map(|a| a.key().clone()).collect();
        let broadcast = values.len() == 1;
        let positions: HashMap<CombinedId, usize> = ids
            .iter()
            .enumerate()
            .map(|(pos, id)| (*id, if broadcast { 0 } else { pos }))
            .collect();

        let mut touched_groups = Vec::new();
        for run in group_runs(ids) {
            match self.inner.groups.get(run.group_id) {
                Some(group) => touched_groups.push((run, group)),
                None => debug!("Skipping update of rows in removed group {}", run.group_id),
            }
        }

        // runs ascend by group id, so every writer locks in the same order
        let mut states = Vec::with_capacity(touched_groups.len());
        for (_, group) in &touched_groups {
            states.push(group.state.write().await);
        }
        for state in states.iter().filter(|s| !s.dropped) {
            state.check_columns(keys.iter().map(|k| (k.name(), k.type_name())))?;
        }

        let mut reports = Vec::new();
        let mut updated_rows = 0;
        for ((run, group), state) in touched_groups.iter().zip(states.iter_mut()) {
            if state.dropped {
                continue;
            }
            state.declare_columns(keys.iter().map(|k| (k.name(), k.type_name())))?;

            let updates = run
                .ids
                .iter()
                .zip(&run.rows)
                .filter_map(|(id, row)| {
                    let pos = positions.get(id)?;
                    values.get(*pos).map(|v| (*row, v.clone()))
                })
                .collect();
            let updated: HashSet<RowId> = self
                .inner
                .backend
                .update_by_ids(group.id, updates)
                .map_err(in_group(group))?
                .into_iter()
                .collect();
            if updated.is_empty() {
                continue;
            }
            let touched: Vec<CombinedId> = run
                .ids
                .iter()
                .filter(|id| updated.contains(&id::row_of(**id)))
                .copied()
                .collect();
            updated_rows += touched.len();
            reports.push(ModificationReport::new(group.category.clone(), touched, keys.clone()));
        }
        drop(states);
        self.inner.counters.lock().rows_updated += updated_rows as u64;

        let reports = merge_reports(reports);
        debug!("update_values produced {} reports", reports.len());
        if let Some(listener) = listener {
            match executor {
                Some(handle) => {
                    handle.spawn(async move {
                        for report in &reports {
                            listener.values_modified(report);
                        }
                    });
                }
                None => {
                    for report in &reports {
                        listener.values_modified(report);
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove rows by id; returns the number of rows removed
    pub async fn clear_ids(&self, ids: &[CombinedId]) -> Result<usize> {
        self.ensure_ready().await?;
        let mut removed = 0;
        for run in group_runs(ids) {
            let Some(group) = self.inner.groups.get(run.group_id) else {
                continue;
            };
            if let Some(event) = self
                .remove_rows(&group, &run.rows, InvalidationReason::Manual)
                .await?
            {
                removed += event.ids.len();
            }
        }
        info!("Cleared {} rows by id", removed);
        Ok(removed)
    }

    /// Remove whole groups; returns the number of rows removed
    pub async fn clear_groups(&self, group_ids: &[GroupId]) -> Result<usize> {
        self.ensure_ready().await?;
        let mut group_ids = group_ids.to_vec();
        group_ids.sort_unstable();
        group_ids.dedup();

        let mut removed = 0;
        for group_id in group_ids {
            let Some(group) = self.inner.groups.remove(group_id) else {
                continue;
            };
            if let Some(event) = self.drop_group(&group, InvalidationReason::Manual).await? {
                removed += event.ids.len();
            }
        }
        Ok(removed)
    }

    /// Remove every group whose category matches `pattern`
    pub async fn clear_category(&self, pattern: &Category) -> Result<usize> {
        let group_ids: Vec<GroupId> = self
            .inner
            .groups
            .matching(pattern)
            .iter()
            .map(|g| g.id)
            .collect();
        let removed = self.clear_groups(&group_ids).await?;
        info!("Cleared {} rows of category {}", removed, pattern);
        Ok(removed)
    }

    /// Remove everything
    pub async fn clear(&self) -> Result<usize> {
        self.clear_category(&Category::any()).await
    }

    async fn remove_rows(
        &self,
        group: &Group,
        rows: &[RowId],
        reason: InvalidationReason,
    ) -> Result<Option<InvalidationEvent>> {
        let mut state = group.state.write().await;
        if state.dropped {
            return Ok(None);
        }
        let removed = self
            .inner
            .backend
            .delete_by_ids(group.id, rows)
            .map_err(in_group(group))?;
        if removed.is_empty() {
            return Ok(None);
        }
        state.coverage.clear();
        group.rows_removed(removed.len());
        let columns = state.columns.clone();
        drop(state);

        Ok(Some(self.finish_removal(group, &columns, removed, reason)))
    }

    async fn drop_group(&self, group: &Group, reason: InvalidationReason) -> Result<Option<InvalidationEvent>> {
        let mut state = group.state.write().await;
        if state.dropped {
            return Ok(None);
        }
        state.dropped = true;
        state.coverage.clear();
        let removed = self
            .inner
            .backend
            .drop_group(group.id)
            .map_err(in_group(group))?;
        group.rows_removed(removed.len());
        let columns = std::mem::take(&mut state.columns);
        drop(state);

        info!("Dropped {}", group.describe());
        if removed.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.finish_removal(group, &columns, removed, reason)))
    }

    fn finish_removal(
        &self,
        group: &Group,
        columns: &HashMap<String, &'static str>,
        removed: Vec<(RowId, StoredRow)>,
        reason: InvalidationReason,
    ) -> InvalidationEvent {
        let ids: Vec<CombinedId> = removed.iter().map(|(row, _)| id::encode(group.id, *row)).collect();
        {
            let mut counters = self.inner.counters.lock();
            let count = ids.len() as u64;
            match reason {
                InvalidationReason::Expired => counters.evictions_ttl += count,
                InvalidationReason::SizeLimit | InvalidationReason::RowLimit => {
                    counters.evictions_size += count
                }
                InvalidationReason::Manual => counters.invalidations += count,
            }
        }

        self.notify_removed(&group.category, &ids, columns, &removed);
        debug!("Removed {} rows from {} ({})", ids.len(), group.describe(), reason);
        InvalidationEvent::new(reason, group.category.clone(), ids).with_context(group.describe())
    }

    fn notify_removed(
        &self,
        category: &Category,
        ids: &[CombinedId],
        columns: &HashMap<String, &'static str>,
        removed: &[(RowId, StoredRow)],
    ) {
        let listeners: Vec<Arc<dyn CacheRemovalListener>> = self
            .inner
            .removal_listeners
            .read()
            .iter()
            .filter(|r| r.pattern.matches(category))
            .map(|r| r.listener.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }

        for listener in &listeners {
            listener.values_removed(category, ids);
        }

        let mut columns: Vec<(&String, &&'static str)> = columns.iter().collect();
        columns.sort();
        for (name, type_name) in columns {
            let key = PropertyKey::from_parts(name, *type_name);
            let values: Vec<Option<Value>> = removed
                .iter()
                .map(|(_, row)| row.values.get(name.as_str()).cloned())
                .collect();
            for listener in &listeners {
                listener.values_removed_with_values(category, ids, &key, &values);
            }
        }
    }

    /// Sub-regions of the request already cached, per group matching `pattern`
    pub async fn get_interval_satisfactions(
        &self,
        pattern: &Category,
        matchers: &[IntervalPropertyMatcher],
    ) -> Result<Vec<Satisfaction>> {
        self.ensure_ready().await?;

        let mut coverage: Vec<(GroupId, CoverageIndex)> = Vec::new();
        for group in self.inner.groups.matching(pattern) {
            if group.expiration.is_expired() {
                continue;
            }
            let state = group.state.read().await;
            if !state.dropped && !state.coverage.is_empty() {
                coverage.push((group.id, state.coverage.clone()));
            }
        }

        compute_satisfactions(coverage.iter().map(|(id, index)| (*id, index)), matchers)
    }

    /// Set the in-memory byte budget enforced by cleanup passes
    pub fn set_in_memory_size_bytes(&self, bytes: i64) -> Result<()> {
        self.check_open()?;
        let bytes = u64::try_from(bytes).map_err(|_| {
            CacheError::InvalidArgument(format!("in-memory size must not be negative, got {}", bytes))
        })?;
        self.inner.config.write().in_memory_size_bytes = bytes;
        Ok(())
    }

    /// Set the on-disk byte budget; a negative value disables it
    pub fn set_on_disk_size_limit_bytes(&self, bytes: i64) -> Result<()> {
        self.check_open()?;
        self.inner.config.write().on_disk_size_limit_bytes = u64::try_from(bytes).ok();
        Ok(())
    }

    /// Resolver for declared type names the type registry does not know
    pub fn set_class_provider<F>(&self, provider: F) -> Result<()>
    where
        F: Fn(&str) -> Option<TypeId> + Send + Sync + 'static,
    {
        self.check_open()?;
        self.inner.types.set_class_provider(Arc::new(provider));
        Ok(())
    }

    /// Registry used to check stored values against requested types
    pub fn type_registry(&self) -> Result<&TypeRegistry> {
        self.check_open()?;
        Ok(&self.inner.types)
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> Result<CacheConfig> {
        self.check_open()?;
        Ok(self.inner.config.read().clone())
    }

    /// Notify `listener` about removals from groups whose category matches `pattern`
    pub fn register_removal_listener(
        &self,
        pattern: Category,
        listener: Arc<dyn CacheRemovalListener>,
    ) -> Result<RemovalListenerId> {
        self.check_open()?;
        let id = RemovalListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.removal_listeners.write().push(RegisteredListener {
            id,
            pattern,
            listener,
        });
        Ok(id)
    }

    /// Returns false when no listener was registered under `id`
    pub fn unregister_removal_listener(&self, id: RemovalListenerId) -> Result<bool> {
        self.check_open()?;
        let mut listeners = self.inner.removal_listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        Ok(listeners.len() != before)
    }

    /// Get cache statistics
    pub fn stats(&self) -> Result<CacheStats> {
        self.check_open()?;
        let mut stats = self.inner.counters.lock().clone();
        let groups = self.inner.groups.all();
        stats.groups = groups.len();
        stats.rows = groups.iter().map(|g| g.row_count()).sum();
        stats.in_memory_bytes = self.inner.backend.in_memory_byte_size();
        stats.on_disk_bytes = self.inner.backend.approximate_byte_size();
        Ok(stats)
    }

    /// Run one eviction pass now
    pub async fn run_cleanup(&self) -> Result<Vec<InvalidationEvent>> {
        self.ensure_ready().await?;
        let now = Utc::now();
        let groups = self.inner.groups.all();

        let mut usage = Vec::with_capacity(groups.len());
        for group in &groups {
            let state = group.state.read().await;
            if state.dropped {
                continue;
            }
            let rows = self
                .inner
                .backend
                .scan_matching(group.id, &[])
                .map_err(in_group(group))?;
            let stored = self
                .inner
                .backend
                .fetch(group.id, &rows)
                .map_err(in_group(group))?;
            drop(state);

            usage.push(GroupUsage {
                group_id: group.id,
                expiration: group.expiration,
                rows: rows
                    .into_iter()
                    .zip(stored)
                    .filter_map(|(row, stored)| {
                        stored
                            .filter(|s| !s.critical)
                            .map(|s| (row, s.byte_size()))
                    })
                    .collect(),
            });
        }

        let budget = {
            let config = self.inner.config.read();
            EvictionBudget {
                in_memory_bytes: config.in_memory_size_bytes,
                on_disk_bytes: config.on_disk_size_limit_bytes,
                row_limit: config.row_limit(),
            }
        };
        let totals = UsageTotals {
            in_memory_bytes: self.inner.backend.in_memory_byte_size(),
            on_disk_bytes: self.inner.backend.approximate_byte_size(),
        };

        let mut events = Vec::new();
        for step in plan_eviction(&usage, now, budget, totals) {
            let Some(group) = self.inner.groups.get(step.group_id) else {
                continue;
            };
            if let Some(event) = self.remove_rows(&group, &step.rows, step.reason).await? {
                events.push(event);
            }
        }

        // expired groups with nothing left are retired
        for group in groups
            .iter()
            .filter(|g| g.expiration.is_expired_at(now) && g.row_count() == 0)
        {
            if self.inner.groups.remove(group.id).is_some() {
                self.drop_group(group, InvalidationReason::Expired).await?;
            }
        }

        if !events.is_empty() {
            info!(
                "Cleanup removed {} rows in {} events",
                events.iter().map(|e| e.ids.len()).sum::<usize>(),
                events.len()
            );
        }
        Ok(events)
    }
}

async fn open_backend(inner: Arc<CacheInner>) {
    let (delay, validation, auto_cleanup, interval) = {
        let config = inner.config.read();
        (
            config.init_delay,
            config.validate(),
            config.enable_auto_cleanup,
            config.cleanup_interval,
        )
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let outcome = validation
        .map_err(CacheError::Initialization)
        .and_then(|()| {
            inner
                .backend
                .open()
                .map_err(|e| CacheError::Initialization(e.to_string()))
        });
    let next = match &outcome {
        Ok(()) => Lifecycle::Ready,
        Err(err) => Lifecycle::Failed(err.clone()),
    };
    let applied = inner.lifecycle.send_if_modified(|state| {
        if matches!(state, Lifecycle::Pending) {
            *state = next;
            true
        } else {
            false
        }
    });

    match outcome {
        Ok(()) if applied => {
            info!("Property cache ready");
            if auto_cleanup {
                let task = tokio::spawn(auto_cleanup_loop(Arc::downgrade(&inner), interval));
                *inner.cleanup_task.lock() = Some(task);
            }
        }
        // closed while the backend was opening
        Ok(()) => inner.backend.close(),
        Err(err) => warn!("Property cache initialization failed: {}", err),
    }
}

/// Background task for periodic eviction; ends when the cache is closed or dropped
async fn auto_cleanup_loop(cache: Weak<CacheInner>, interval: Duration) {
    info!("Starting automatic cache cleanup task (interval: {:?})", interval);

    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = cache.upgrade() else {
            break;
        };

        match (PropertyCache { inner }).run_cleanup().await {
            Ok(events) => {
                if !events.is_empty() {
                    debug!("Auto cleanup: {} events", events.len());
                }
            }
            Err(CacheError::Closed) => break,
            Err(e) => {
                warn!("Auto cleanup failed: {}", e);
            }
        }
    }
    debug!("Automatic cache cleanup task stopped");
}
