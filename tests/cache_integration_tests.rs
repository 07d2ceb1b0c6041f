//! Integration tests for the property cache
//!
//! These tests verify the complete cache functionality including:
//! - Depositing and reading back typed properties
//! - Insert/update mismatch handling
//! - Batch updates and modification reports
//! - Removal notifications on clear and eviction
//! - Interval satisfaction
//! - Initialization lifecycle
//! - Per-group concurrency

use property_cache::cache::{
    AnyAccessor, CacheConfig, CacheRemovalListener, Category, ChannelListener, CombinedId, Deposit,
    Expiration, GroupId, GroupStore, InitWait, IntervalPropertyAccessor, IntervalPropertyMatcher,
    IntervalValue, InvalidationReason, MemoryGroupStore, ModificationListener, OrderSpecifier,
    PropertyAccessor, PropertyCache, PropertyDescriptor, PropertyKey, PropertyMatcher,
    PropertyValueMap, RowId, StoredRow,
};
use property_cache::cache::matcher::CompiledMatcher;
use property_cache::CacheError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task;

type Road = (String, f64);

fn roads() -> Category {
    Category::new("wfs", "feature", "roads")
}

fn name() -> PropertyDescriptor<String> {
    PropertyDescriptor::new("name")
}

fn length() -> PropertyDescriptor<f64> {
    PropertyDescriptor::new("length")
}

fn road_accessors() -> Vec<AnyAccessor<Road>> {
    vec![
        PropertyAccessor::new(name(), |r: &Road| r.0.clone()).erased(),
        PropertyAccessor::new(length(), |r: &Road| r.1).erased(),
    ]
}

fn road(name: &str, length: f64) -> Road {
    (name.to_string(), length)
}

fn road_deposit(input: Vec<Road>) -> Deposit<Road> {
    Deposit::new(
        roads(),
        road_accessors(),
        input,
        true,
        Some(Expiration::SessionEnd),
        false,
    )
    .unwrap()
}

fn test_config() -> CacheConfig {
    CacheConfig::builder().enable_auto_cleanup(false).build()
}

async fn ready_cache() -> PropertyCache {
    let cache = PropertyCache::in_memory(test_config());
    cache.initialize(InitWait::Indefinite).await.unwrap();
    cache
}

#[derive(Default)]
struct RecordingRemovals {
    removed: Mutex<Vec<(Category, Vec<CombinedId>)>>,
    values: Mutex<Vec<(String, Vec<Option<Value>>)>>,
}

impl CacheRemovalListener for RecordingRemovals {
    fn values_removed(&self, category: &Category, ids: &[CombinedId]) {
        self.removed.lock().unwrap().push((category.clone(), ids.to_vec()));
    }

    fn values_removed_with_values(
        &self,
        _category: &Category,
        _ids: &[CombinedId],
        descriptor: &PropertyKey,
        values: &[Option<Value>],
    ) {
        self.values
            .lock()
            .unwrap()
            .push((descriptor.name().to_string(), values.to_vec()));
    }
}

#[tokio::test]
async fn test_put_and_get_values() {
    let cache = ready_cache().await;

    let ids = cache
        .put(road_deposit(vec![road("Main St", 120.5), road("Elm St", 80.0)]), None)
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    let mut values = PropertyValueMap::new().with_property(&name()).with_property(&length());
    let mut failed = Vec::new();
    cache.get_values(&ids, &mut values, Some(&mut failed)).await.unwrap();

    assert!(failed.is_empty());
    assert_eq!(
        values.get(&name()),
        Some(&[Some("Main St".to_string()), Some("Elm St".to_string())][..])
    );
    assert_eq!(values.get(&length()), Some(&[Some(120.5), Some(80.0)][..]));

    let stats = cache.stats().unwrap();
    assert_eq!(stats.groups, 1);
    assert_eq!(stats.rows, 2);
    assert_eq!(stats.rows_inserted, 2);
}

#[tokio::test]
async fn test_partial_retrieval_after_clear() {
    let cache = ready_cache().await;
    let ids = cache
        .put(road_deposit(vec![road("Main St", 120.5), road("Elm St", 80.0)]), None)
        .await
        .unwrap();

    assert_eq!(cache.clear_ids(&ids[..1]).await.unwrap(), 1);
    // already gone
    assert_eq!(cache.clear_ids(&ids[..1]).await.unwrap(), 0);

    let mut values = PropertyValueMap::new().with_property(&length());
    let mut failed = vec![7];
    cache.get_values(&ids, &mut values, Some(&mut failed)).await.unwrap();
    assert_eq!(failed, vec![0]);
    assert_eq!(values.get(&length()), Some(&[None, Some(80.0)][..]));

    let sizes = cache.get_value_sizes(&ids, &length(), None).await.unwrap();
    assert_eq!(sizes[0], 0);
    assert_eq!(sizes[1], "80.0".len());
}

#[tokio::test]
async fn test_requested_type_mismatch_fails_row() {
    let cache = ready_cache().await;
    let ids = cache.put(road_deposit(vec![road("Main St", 1.0)]), None).await.unwrap();

    let wrong = PropertyDescriptor::<i64>::new("name");
    let mut values = PropertyValueMap::new().with_property(&wrong);
    let mut failed = Vec::new();
    cache.get_values(&ids, &mut values, Some(&mut failed)).await.unwrap();
    assert_eq!(failed, vec![0]);
    assert_eq!(values.get(&wrong), Some(&[None][..]));

    let mut values = PropertyValueMap::new().with_property(&name());
    cache.get_values(&ids, &mut values, None).await.unwrap();
    assert_eq!(values.get(&name()), Some(&[Some("Main St".to_string())][..]));
}

#[tokio::test]
async fn test_requested_type_mismatch_has_no_size() {
    let cache = ready_cache().await;
    let ids = cache.put(road_deposit(vec![road("Main St", 1.0)]), None).await.unwrap();

    let mut failed = Vec::new();
    let wrong = PropertyDescriptor::<i64>::new("name");
    let sizes = cache.get_value_sizes(&ids, &wrong, Some(&mut failed)).await.unwrap();
    assert_eq!(sizes, vec![0]);
    assert_eq!(failed, vec![0]);

    let sizes = cache.get_value_sizes(&ids, &name(), Some(&mut failed)).await.unwrap();
    assert_eq!(sizes, vec!["\"Main St\"".len()]);
    assert!(failed.is_empty());
}

#[tokio::test]
async fn test_insert_update_mismatch() {
    let cache = ready_cache().await;
    let ids = cache.put(road_deposit(vec![road("Main St", 1.0)]), None).await.unwrap();

    let err = cache
        .put(road_deposit(vec![road("Main St", 2.0)]).with_ids(ids.clone()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Mismatch(_)));

    let update = Deposit::builder(roads())
        .accessor(PropertyAccessor::new(length(), |r: &Road| r.1).erased())
        .input(vec![road("Main St", 2.0)])
        .new_rows(false)
        .expiration(Expiration::SessionEnd)
        .build()
        .unwrap();
    assert!(matches!(
        cache.put(update, None).await.unwrap_err(),
        CacheError::Mismatch(_)
    ));

    cache.clear_ids(&ids).await.unwrap();
    let stale = Deposit::builder(roads())
        .accessor(PropertyAccessor::new(length(), |r: &Road| r.1).erased())
        .input(vec![road("Main St", 2.0)])
        .new_rows(false)
        .expiration(Expiration::SessionEnd)
        .ids(ids)
        .build()
        .unwrap();
    assert!(matches!(
        cache.put(stale, None).await.unwrap_err(),
        CacheError::Mismatch(_)
    ));
}

#[tokio::test]
async fn test_update_deposit_rewrites_rows() {
    let cache = ready_cache().await;
    let ids = cache
        .put(road_deposit(vec![road("Main St", 1.0), road("Elm St", 2.0)]), None)
        .await
        .unwrap();

    let (listener, mut reports) = ChannelListener::channel();
    let update = Deposit::builder(roads())
        .accessor(PropertyAccessor::new(length(), |r: &Road| r.1).erased())
        .input(vec![road("", 10.0), road("", 20.0)])
        .new_rows(false)
        .expiration(Expiration::SessionEnd)
        .ids(ids.clone())
        .build()
        .unwrap();
    let updated = cache.put(update, Some(&listener)).await.unwrap();
    assert_eq!(updated, ids);

    let report = reports.recv().await.unwrap();
    assert_eq!(report.category, roads());
    assert_eq!(report.ids, ids);
    assert!(report.contains_property("length"));
    assert!(!report.contains_property("name"));

    let mut values = PropertyValueMap::new().with_property(&name()).with_property(&length());
    cache.get_values(&ids, &mut values, None).await.unwrap();
    assert_eq!(values.get(&length()), Some(&[Some(10.0), Some(20.0)][..]));
    assert_eq!(
        values.get(&name()),
        Some(&[Some("Main St".to_string()), Some("Elm St".to_string())][..])
    );
    assert_eq!(cache.stats().unwrap().rows_updated, 2);
}

#[tokio::test]
async fn test_update_deposit_across_categories_is_mismatch() {
    let cache = ready_cache().await;
    let ids = cache.put(road_deposit(vec![road("Main St", 1.0)]), None).await.unwrap();

    let rivers = Category::new("wfs", "feature", "rivers");
    let update = Deposit::builder(rivers)
        .accessor(PropertyAccessor::new(length(), |r: &Road| r.1).erased())
        .input(vec![road("Main St", 2.0)])
        .new_rows(false)
        .expiration(Expiration::SessionEnd)
        .ids(ids)
        .build()
        .unwrap();
    assert!(matches!(
        cache.put(update, None).await.unwrap_err(),
        CacheError::Mismatch(_)
    ));
}

#[tokio::test]
async fn test_conflicting_property_type_is_configuration_error() {
    let cache = ready_cache().await;
    cache.put(road_deposit(vec![road("Main St", 1.0)]), None).await.unwrap();

    let deposit = Deposit::builder(roads())
        .accessor(PropertyAccessor::new(PropertyDescriptor::<String>::new("length"), |r: &Road| r.0.clone()).erased())
        .input(vec![road("Elm St", 2.0)])
        .expiration(Expiration::SessionEnd)
        .build()
        .unwrap();
    let err = cache.put(deposit, None).await.unwrap_err();
    assert!(err.is_configuration_error());
    assert_eq!(cache.stats().unwrap().rows, 1);
}

#[tokio::test]
async fn test_update_values() {
    let cache = ready_cache().await;
    let ids = cache
        .put(
            road_deposit(vec![road("Main St", 1.0), road("Elm St", 2.0), road("Oak St", 3.0)]),
            None,
        )
        .await
        .unwrap();
    let accessors = vec![PropertyAccessor::new(length(), |r: &Road| r.1).erased()];

    let err = cache
        .update_values(&ids, &[road("", 1.0), road("", 2.0)], &accessors, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidArgument(_)));

    // one object applies to every id
    let (listener, mut reports) = ChannelListener::channel();
    let listener: Arc<dyn ModificationListener> = Arc::new(listener);
    cache
        .update_values(&ids, &[road("", 9.0)], &accessors, Some(listener), None)
        .await
        .unwrap();
    let report = reports.recv().await.unwrap();
    assert_eq!(report.ids, ids);
    assert!(report.contains_property("length"));

    let mut values = PropertyValueMap::new().with_property(&length());
    cache.get_values(&ids, &mut values, None).await.unwrap();
    assert_eq!(values.get(&length()), Some(&[Some(9.0), Some(9.0), Some(9.0)][..]));

    // removed ids are skipped
    cache.clear_ids(&ids[1..2]).await.unwrap();
    cache
        .update_values(
            &ids,
            &[road("", 4.0), road("", 5.0), road("", 6.0)],
            &accessors,
            None,
            None,
        )
        .await
        .unwrap();
    let mut failed = Vec::new();
    cache.get_values(&ids, &mut values, Some(&mut failed)).await.unwrap();
    assert_eq!(failed, vec![1]);
    assert_eq!(values.get(&length()), Some(&[Some(4.0), None, Some(6.0)][..]));
}

#[tokio::test]
async fn test_update_values_delivers_on_executor() {
    let cache = ready_cache().await;
    let first = cache.put(road_deposit(vec![road("Main St", 1.0)]), None).await.unwrap();
    let rivers = Category::new("wfs", "feature", "rivers");
    let second = cache
        .put(
            Deposit::new(rivers.clone(), road_accessors(), vec![road("Avon", 2.0)], true, Some(Expiration::SessionEnd), false)
                .unwrap(),
            None,
        )
        .await
        .unwrap();

    let ids: Vec<CombinedId> = first.iter().chain(&second).copied().collect();
    let accessors = vec![PropertyAccessor::new(length(), |r: &Road| r.1).erased()];
    let (listener, mut reports) = ChannelListener::channel();
    let listener: Arc<dyn ModificationListener> = Arc::new(listener);
    let handle = tokio::runtime::Handle::current();

    cache
        .update_values(&ids, &[road("", 3.0)], &accessors, Some(listener), Some(&handle))
        .await
        .unwrap();

    let mut categories = Vec::new();
    for _ in 0..2 {
        let report = tokio::time::timeout(Duration::from_secs(1), reports.recv())
            .await
            .unwrap()
            .unwrap();
        categories.push(report.category);
    }
    categories.sort();
    let mut expected = vec![roads(), rivers];
    expected.sort();
    assert_eq!(categories, expected);
}

fn labelled_length_deposit(category: Category, expiration: Expiration, label: &str) -> Deposit<Road> {
    Deposit::builder(category)
        .accessor(
            PropertyAccessor::new(PropertyDescriptor::<String>::new("length"), |r: &Road| r.0.clone())
                .erased(),
        )
        .input(vec![road(label, 0.0)])
        .expiration(expiration)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_update_values_type_conflict_writes_nothing() {
    let cache = ready_cache().await;
    let road_ids = cache.put(road_deposit(vec![road("Main St", 1.0)]), None).await.unwrap();
    let rivers = Category::new("wfs", "feature", "rivers");
    let river_ids = cache
        .put(labelled_length_deposit(rivers, Expiration::SessionEnd, "long"), None)
        .await
        .unwrap();

    let ids: Vec<CombinedId> = road_ids.iter().chain(&river_ids).copied().collect();
    let accessors = vec![PropertyAccessor::new(length(), |r: &Road| r.1).erased()];
    let (listener, mut reports) = ChannelListener::channel();
    let listener: Arc<dyn ModificationListener> = Arc::new(listener);
    let err = cache
        .update_values(&ids, &[road("", 9.0)], &accessors, Some(listener), None)
        .await
        .unwrap_err();
    assert!(err.is_configuration_error());
    assert!(reports.try_recv().is_err());
    assert_eq!(cache.stats().unwrap().rows_updated, 0);

    let mut values = PropertyValueMap::new().with_property(&length());
    cache.get_values(&road_ids, &mut values, None).await.unwrap();
    assert_eq!(values.get(&length()), Some(&[Some(1.0)][..]));
}

#[tokio::test]
async fn test_update_deposit_type_conflict_writes_nothing() {
    let cache = ready_cache().await;
    let session = cache.put(road_deposit(vec![road("Main St", 1.0)]), None).await.unwrap();
    let hourly = cache
        .put(
            labelled_length_deposit(roads(), Expiration::after(Duration::from_secs(3600)), "long"),
            None,
        )
        .await
        .unwrap();

    let ids: Vec<CombinedId> = session.iter().chain(&hourly).copied().collect();
    let (listener, mut reports) = ChannelListener::channel();
    let update = Deposit::builder(roads())
        .accessor(PropertyAccessor::new(length(), |r: &Road| r.1).erased())
        .input(vec![road("", 10.0), road("", 20.0)])
        .new_rows(false)
        .expiration(Expiration::SessionEnd)
        .ids(ids)
        .build()
        .unwrap();
    let err = cache.put(update, Some(&listener)).await.unwrap_err();
    assert!(err.is_configuration_error());
    assert!(reports.try_recv().is_err());
    assert_eq!(cache.stats().unwrap().rows_updated, 0);

    let mut values = PropertyValueMap::new().with_property(&length());
    cache.get_values(&session, &mut values, None).await.unwrap();
    assert_eq!(values.get(&length()), Some(&[Some(1.0)][..]));
}

#[tokio::test]
async fn test_removal_listener_receives_values() {
    let cache = ready_cache().await;
    let listener = Arc::new(RecordingRemovals::default());
    cache.register_removal_listener(Category::any(), listener.clone()).unwrap();

    let ids = cache
        .put(road_deposit(vec![road("Main St", 1.0), road("Elm St", 2.0)]), None)
        .await
        .unwrap();
    assert_eq!(cache.clear_category(&roads()).await.unwrap(), 2);

    let removed = listener.removed.lock().unwrap().clone();
    assert_eq!(removed, vec![(roads(), ids)]);

    let values = listener.values.lock().unwrap().clone();
    assert_eq!(
        values,
        vec![
            (
                "length".to_string(),
                vec![Some(Value::from(1.0)), Some(Value::from(2.0))]
            ),
            (
                "name".to_string(),
                vec![Some(Value::from("Main St")), Some(Value::from("Elm St"))]
            ),
        ]
    );
    assert!(cache.get_group_ids(&roads()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_size_eviction_spares_critical_rows() {
    let cache = ready_cache().await;
    let listener = Arc::new(RecordingRemovals::default());
    cache.register_removal_listener(roads(), listener.clone()).unwrap();

    let evictable = cache
        .put(road_deposit(vec![road("Main St", 1.0), road("Elm St", 2.0)]), None)
        .await
        .unwrap();
    let pinned = Deposit::session_only(
        Category::new("wfs", "feature", "bridges"),
        PropertyAccessor::new(name(), |r: &Road| r.0.clone()).erased(),
        vec![road("Tower", 0.0)],
    )
    .unwrap();
    let pinned = cache.put(pinned, None).await.unwrap();

    cache.set_in_memory_size_bytes(1).unwrap();
    let events = cache.run_cleanup().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, InvalidationReason::SizeLimit);
    assert_eq!(events[0].ids, evictable);

    assert_eq!(listener.removed.lock().unwrap().len(), 1);
    let mut values = PropertyValueMap::new().with_property(&name());
    let mut failed = Vec::new();
    cache.get_values(&pinned, &mut values, Some(&mut failed)).await.unwrap();
    assert!(failed.is_empty());
    assert_eq!(cache.stats().unwrap().evictions_size, 2);
}

#[tokio::test]
async fn test_interval_satisfactions() {
    let cache = ready_cache().await;
    let tiles = Category::new("wms", "raster", "tiles");
    let bbox = PropertyDescriptor::<IntervalValue>::new("bbox");

    let tile_deposit = |extent: IntervalValue, cells: Vec<IntervalValue>| {
        let accessor = IntervalPropertyAccessor::new(bbox.clone(), extent, |c: &IntervalValue| c.clone());
        Deposit::new(
            tiles.clone(),
            vec![accessor.erased()],
            cells,
            true,
            Some(Expiration::SessionEnd),
            false,
        )
        .unwrap()
    };

    // the second window holds no rows but was fetched, so it still counts as cached
    let west = cache
        .put(
            tile_deposit(
                IntervalValue::envelope(0.0, 0.0, 10.0, 10.0),
                vec![IntervalValue::envelope(1.0, 1.0, 2.0, 2.0)],
            ),
            None,
        )
        .await
        .unwrap();
    cache
        .put(tile_deposit(IntervalValue::envelope(20.0, 0.0, 30.0, 10.0), Vec::new()), None)
        .await
        .unwrap();

    let request = vec![IntervalPropertyMatcher::new(
        "bbox",
        IntervalValue::envelope(5.0, 0.0, 25.0, 10.0),
    )];
    let satisfactions = cache.get_interval_satisfactions(&tiles, &request).await.unwrap();
    assert_eq!(satisfactions.len(), 2);
    assert_eq!(
        satisfactions[0].intervals.get("bbox"),
        Some(&IntervalValue::envelope(5.0, 0.0, 10.0, 10.0))
    );
    assert_eq!(
        satisfactions[1].intervals.get("bbox"),
        Some(&IntervalValue::envelope(20.0, 0.0, 25.0, 10.0))
    );
    assert_eq!(satisfactions[0].group_id, satisfactions[1].group_id);

    assert!(matches!(
        cache.get_interval_satisfactions(&tiles, &[]).await,
        Err(CacheError::InvalidArgument(_))
    ));

    // a request outside the cached windows is not satisfied
    let elsewhere = vec![IntervalPropertyMatcher::new(
        "bbox",
        IntervalValue::envelope(50.0, 50.0, 60.0, 60.0),
    )];
    assert!(cache
        .get_interval_satisfactions(&tiles, &elsewhere)
        .await
        .unwrap()
        .is_empty());

    // removing rows gives up the group's coverage
    cache.clear_ids(&west).await.unwrap();
    assert!(cache
        .get_interval_satisfactions(&tiles, &request)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_queries_across_categories() {
    let cache = ready_cache().await;
    let streets = cache
        .put(road_deposit(vec![road("Main St", 300.0), road("Elm St", 100.0)]), None)
        .await
        .unwrap();
    let rivers = Category::new("wfs", "feature", "rivers");
    let river = cache
        .put(
            Deposit::new(rivers.clone(), road_accessors(), vec![road("Avon", 200.0)], true, Some(Expiration::SessionEnd), false)
                .unwrap(),
            None,
        )
        .await
        .unwrap();

    let features = Category::pattern(Some("wfs"), Some("feature"), None);
    let matchers = vec![PropertyMatcher::at_least(&length(), 150.0).boxed()];
    let ids = cache.get_ids(&features, &matchers, &[], 0, None).await.unwrap();
    assert_eq!(ids, vec![river[0], streets[0]]);

    let ids = cache
        .get_ids(&features, &[], &[OrderSpecifier::descending("length")], 1, Some(1))
        .await
        .unwrap();
    assert_eq!(ids, vec![river[0]]);

    let group_ids: Vec<GroupId> = cache.get_group_ids(&features).await.unwrap();
    assert_eq!(group_ids.len(), 2);
    let in_group = cache
        .get_ids_in_groups(&group_ids[..1], &[], &[], 0, None)
        .await
        .unwrap();
    assert_eq!(in_group, streets);

    let categories = cache.get_categories(&Category::any()).await.unwrap();
    assert_eq!(categories.len(), 2);
    assert!(categories.contains(&rivers));
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let cache = PropertyCache::in_memory(test_config());
    assert_eq!(cache.clear().await.unwrap_err(), CacheError::NotInitialized);

    cache.initialize(InitWait::UpTo(Duration::from_secs(1))).await.unwrap();
    assert!(cache.is_ready());
    assert_eq!(
        cache.initialize(InitWait::Indefinite).await.unwrap_err(),
        CacheError::AlreadyInitialized
    );

    cache.close();
    assert_eq!(
        cache.put(road_deposit(vec![road("Main St", 1.0)]), None).await.unwrap_err(),
        CacheError::Closed
    );
    assert_eq!(
        cache.initialize(InitWait::Immediate).await.unwrap_err(),
        CacheError::Closed
    );
}

/// Backend whose open always fails
struct UnavailableStore(MemoryGroupStore);

impl GroupStore for UnavailableStore {
    fn open(&self) -> property_cache::Result<()> {
        Err(CacheError::Storage {
            context: "open".to_string(),
            reason: "disk unavailable".to_string(),
        })
    }

    fn insert(&self, group: GroupId, rows: Vec<(RowId, StoredRow)>) -> property_cache::Result<()> {
        self.0.insert(group, rows)
    }

    fn update_by_ids(
        &self,
        group: GroupId,
        updates: Vec<(RowId, HashMap<String, Value>)>,
    ) -> property_cache::Result<Vec<RowId>> {
        self.0.update_by_ids(group, updates)
    }

    fn scan_matching(&self, group: GroupId, matchers: &[CompiledMatcher]) -> property_cache::Result<Vec<RowId>> {
        self.0.scan_matching(group, matchers)
    }

    fn fetch(&self, group: GroupId, rows: &[RowId]) -> property_cache::Result<Vec<Option<StoredRow>>> {
        self.0.fetch(group, rows)
    }

    fn delete_by_ids(&self, group: GroupId, rows: &[RowId]) -> property_cache::Result<Vec<(RowId, StoredRow)>> {
        self.0.delete_by_ids(group, rows)
    }

    fn drop_group(&self, group: GroupId) -> property_cache::Result<Vec<(RowId, StoredRow)>> {
        self.0.drop_group(group)
    }

    fn approximate_byte_size(&self) -> u64 {
        self.0.approximate_byte_size()
    }
}

#[tokio::test]
async fn test_failed_initialization_is_sticky() {
    let cache = PropertyCache::new(test_config(), Arc::new(UnavailableStore(MemoryGroupStore::new())));
    cache.initialize(InitWait::Immediate).await.unwrap();

    let err = cache
        .put(road_deposit(vec![road("Main St", 1.0)]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Initialization(_)));
    assert!(err.to_string().contains("disk unavailable"));

    assert_eq!(cache.get_group_ids(&Category::any()).await.unwrap_err(), err);
    assert_eq!(cache.run_cleanup().await.unwrap_err(), err);
    assert!(!cache.is_ready());
}

/// Parks the next backend call that passes it until opened
#[derive(Default)]
struct Gate {
    armed: Mutex<bool>,
    released: Mutex<bool>,
    release: Condvar,
    entered: Notify,
}

impl Gate {
    fn arm(&self) {
        *self.armed.lock().unwrap() = true;
    }

    fn open(&self) {
        *self.released.lock().unwrap() = true;
        self.release.notify_all();
    }

    fn pass(&self) {
        let armed = std::mem::take(&mut *self.armed.lock().unwrap());
        if !armed {
            return;
        }
        self.entered.notify_one();
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.release.wait(released).unwrap();
        }
    }
}

/// Memory backend whose inserts and fetches can be parked mid-call
struct GatedStore {
    inner: MemoryGroupStore,
    insert_gate: Gate,
    fetch_gate: Gate,
}

impl GatedStore {
    fn new() -> Self {
        Self {
            inner: MemoryGroupStore::new(),
            insert_gate: Gate::default(),
            fetch_gate: Gate::default(),
        }
    }
}

impl GroupStore for GatedStore {
    fn open(&self) -> property_cache::Result<()> {
        self.inner.open()
    }

    fn insert(&self, group: GroupId, rows: Vec<(RowId, StoredRow)>) -> property_cache::Result<()> {
        self.insert_gate.pass();
        self.inner.insert(group, rows)
    }

    fn update_by_ids(
        &self,
        group: GroupId,
        updates: Vec<(RowId, HashMap<String, Value>)>,
    ) -> property_cache::Result<Vec<RowId>> {
        self.inner.update_by_ids(group, updates)
    }

    fn scan_matching(&self, group: GroupId, matchers: &[CompiledMatcher]) -> property_cache::Result<Vec<RowId>> {
        self.inner.scan_matching(group, matchers)
    }

    fn fetch(&self, group: GroupId, rows: &[RowId]) -> property_cache::Result<Vec<Option<StoredRow>>> {
        self.fetch_gate.pass();
        self.inner.fetch(group, rows)
    }

    fn delete_by_ids(&self, group: GroupId, rows: &[RowId]) -> property_cache::Result<Vec<(RowId, StoredRow)>> {
        self.inner.delete_by_ids(group, rows)
    }

    fn drop_group(&self, group: GroupId) -> property_cache::Result<Vec<(RowId, StoredRow)>> {
        self.inner.drop_group(group)
    }

    fn approximate_byte_size(&self) -> u64 {
        self.inner.approximate_byte_size()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocked_group_does_not_block_other_categories() {
    let store = Arc::new(GatedStore::new());
    let cache = PropertyCache::new(test_config(), store.clone());
    cache.initialize(InitWait::Indefinite).await.unwrap();

    store.insert_gate.arm();
    let blocked = {
        let cache = cache.clone();
        task::spawn(async move { cache.put(road_deposit(vec![road("Main St", 1.0)]), None).await })
    };
    store.insert_gate.entered.notified().await;

    let rivers = Category::new("wfs", "feature", "rivers");
    let other = Deposit::new(rivers, road_accessors(), vec![road("Avon", 2.0)], true, Some(Expiration::SessionEnd), false)
        .unwrap();
    let ids = tokio::time::timeout(Duration::from_secs(5), cache.put(other, None))
        .await
        .expect("put into another category was blocked")
        .unwrap();
    assert_eq!(ids.len(), 1);

    store.insert_gate.open();
    let blocked_ids = blocked.await.unwrap().unwrap();
    assert_eq!(blocked_ids.len(), 1);
    assert_eq!(cache.stats().unwrap().rows, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clear_waits_for_running_update_deposit() {
    let store = Arc::new(GatedStore::new());
    let cache = PropertyCache::new(test_config(), store.clone());
    cache.initialize(InitWait::Indefinite).await.unwrap();
    let listener = Arc::new(RecordingRemovals::default());
    cache.register_removal_listener(roads(), listener.clone()).unwrap();
    let ids = cache
        .put(road_deposit(vec![road("Main St", 1.0), road("Elm St", 2.0)]), None)
        .await
        .unwrap();

    let update = Deposit::builder(roads())
        .accessor(PropertyAccessor::new(length(), |r: &Road| r.1).erased())
        .input(vec![road("", 10.0), road("", 20.0)])
        .new_rows(false)
        .expiration(Expiration::SessionEnd)
        .ids(ids.clone())
        .build()
        .unwrap();
    store.fetch_gate.arm();
    let updating = {
        let cache = cache.clone();
        task::spawn(async move { cache.put(update, None).await })
    };
    store.fetch_gate.entered.notified().await;

    let clearing = {
        let cache = cache.clone();
        let ids = ids.clone();
        task::spawn(async move { cache.clear_ids(&ids).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!clearing.is_finished());

    store.fetch_gate.open();
    assert_eq!(updating.await.unwrap().unwrap(), ids);
    assert_eq!(clearing.await.unwrap().unwrap(), 2);

    // the clear removed the rows the update had just written
    let values = listener.values.lock().unwrap();
    let (_, removed) = values.iter().find(|(name, _)| name == "length").unwrap();
    assert_eq!(removed, &vec![Some(Value::from(10.0)), Some(Value::from(20.0))]);
}

#[tokio::test]
async fn test_update_deposit_of_removed_rows_is_mismatch() {
    let cache = ready_cache().await;
    let ids = cache
        .put(road_deposit(vec![road("Main St", 1.0), road("Elm St", 2.0)]), None)
        .await
        .unwrap();
    cache.clear_ids(&ids[1..]).await.unwrap();

    let (listener, mut reports) = ChannelListener::channel();
    let update = Deposit::builder(roads())
        .accessor(PropertyAccessor::new(length(), |r: &Road| r.1).erased())
        .input(vec![road("", 10.0), road("", 20.0)])
        .new_rows(false)
        .expiration(Expiration::SessionEnd)
        .ids(ids.clone())
        .build()
        .unwrap();
    let err = cache.put(update, Some(&listener)).await.unwrap_err();
    assert!(matches!(err, CacheError::Mismatch(_)));
    assert!(reports.try_recv().is_err());

    let mut values = PropertyValueMap::new().with_property(&length());
    cache.get_values(&ids[..1], &mut values, None).await.unwrap();
    assert_eq!(values.get(&length()), Some(&[Some(1.0)][..]));
}

#[tokio::test]
async fn test_concurrent_puts() {
    let cache = ready_cache().await;

    let mut handles = vec![];
    for i in 0..10 {
        let cache = cache.clone();
        let handle = task::spawn(async move {
            let category = Category::new("wfs", "feature", format!("layer-{}", i % 3));
            let deposit = Deposit::new(
                category,
                road_accessors(),
                vec![road(&format!("road-{}", i), i as f64)],
                true,
                Some(Expiration::SessionEnd),
                false,
            )
            .unwrap();
            cache.put(deposit, None).await
        });
        handles.push(handle);
    }

    let results = futures::future::join_all(handles).await;
    let mut all_ids = Vec::new();
    for result in results {
        all_ids.extend(result.unwrap().unwrap());
    }
    all_ids.sort();
    all_ids.dedup();
    assert_eq!(all_ids.len(), 10);

    let stats = cache.stats().unwrap();
    assert_eq!(stats.groups, 3);
    assert_eq!(stats.rows, 10);
}
