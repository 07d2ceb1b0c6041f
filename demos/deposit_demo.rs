//! Property Cache Demo Application
//!
//! Deposits road features, queries them by length, updates a batch of rows
//! and evicts against a tiny memory budget.
//!
//! Usage:
//!   cargo run --example deposit_demo
//!
//! Environment variables:
//!   PROPERTY_CACHE_ROW_LIMIT - maximum number of evictable rows (default: unlimited)
//!   RUST_LOG                 - log filter (default: info)

use property_cache::cache::{
    CacheConfig, CacheRemovalListener, Category, ChannelListener, CombinedId, Deposit, Expiration,
    InitWait, IntervalPropertyAccessor, IntervalPropertyMatcher, IntervalValue, ModificationListener,
    PropertyAccessor, PropertyCache, PropertyDescriptor, PropertyMatcher, PropertyValueMap,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct Road {
    name: String,
    length: f64,
    bbox: IntervalValue,
}

struct LoggingRemovals;

impl CacheRemovalListener for LoggingRemovals {
    fn values_removed(&self, category: &Category, ids: &[CombinedId]) {
        info!("{} rows of {} left the cache", ids.len(), category);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("=== Property Cache Demo ===");

    let mut config = CacheConfig::from_env();
    config.enable_auto_cleanup = false;
    let cache = PropertyCache::in_memory(config);
    cache.initialize(InitWait::UpTo(Duration::from_secs(5))).await?;
    cache.register_removal_listener(Category::any(), Arc::new(LoggingRemovals))?;

    let roads = Category::new("wfs", "feature", "roads");
    let name = PropertyDescriptor::<String>::new("name");
    let length = PropertyDescriptor::<f64>::new("length");
    let bbox = PropertyDescriptor::<IntervalValue>::new("bbox");

    let input = vec![
        Road {
            name: "Main St".to_string(),
            length: 120.5,
            bbox: IntervalValue::envelope(1.0, 1.0, 2.0, 3.0),
        },
        Road {
            name: "Elm St".to_string(),
            length: 80.0,
            bbox: IntervalValue::envelope(4.0, 4.0, 6.0, 5.0),
        },
        Road {
            name: "Harbour Rd".to_string(),
            length: 410.0,
            bbox: IntervalValue::envelope(7.0, 0.0, 9.0, 2.0),
        },
    ];

    info!("\n--- Deposit ---");
    let deposit = Deposit::builder(roads.clone())
        .accessor(PropertyAccessor::new(name.clone(), |r: &Road| r.name.clone()).erased())
        .accessor(PropertyAccessor::new(length.clone(), |r: &Road| r.length).erased())
        .accessor(
            IntervalPropertyAccessor::new(
                bbox.clone(),
                IntervalValue::envelope(0.0, 0.0, 10.0, 10.0),
                |r: &Road| r.bbox.clone(),
            )
            .erased(),
        )
        .input(input)
        .expiration(Expiration::after(Duration::from_secs(600)))
        .build()?;
    let (listener, mut reports) = ChannelListener::channel();
    let ids = cache.put(deposit, Some(&listener)).await?;
    if let Ok(report) = reports.try_recv() {
        info!("Modified {} rows of {}", report.ids.len(), report.category);
    }

    info!("\n--- Query ---");
    let long_roads = cache
        .get_ids(
            &roads,
            &[PropertyMatcher::at_least(&length, 100.0).boxed()],
            &[],
            0,
            None,
        )
        .await?;
    let mut values = PropertyValueMap::new().with_property(&name).with_property(&length);
    cache.get_values(&long_roads, &mut values, None).await?;
    info!("Roads of at least 100 m: {:?}", values.get(&name));

    info!("\n--- Interval satisfaction ---");
    let request = [IntervalPropertyMatcher::new(
        "bbox",
        IntervalValue::envelope(5.0, 5.0, 15.0, 15.0),
    )];
    for satisfaction in cache.get_interval_satisfactions(&roads, &request).await? {
        info!(
            "Group {} already covers {:?}",
            satisfaction.group_id,
            satisfaction.intervals.get("bbox")
        );
    }

    info!("\n--- Batch update ---");
    let listener: Arc<dyn ModificationListener> = Arc::new(listener);
    let closed = Road {
        name: String::new(),
        length: 0.0,
        bbox: IntervalValue::envelope(0.0, 0.0, 0.0, 0.0),
    };
    cache
        .update_values(
            &ids,
            &[closed],
            &[PropertyAccessor::new(length.clone(), |r: &Road| r.length).erased()],
            Some(listener),
            None,
        )
        .await?;
    while let Ok(report) = reports.try_recv() {
        info!("Updated {:?} on {} rows", report.descriptors, report.ids.len());
    }

    info!("\n--- Eviction ---");
    cache.set_in_memory_size_bytes(64)?;
    for event in cache.run_cleanup().await? {
        info!("Evicted {} rows ({})", event.ids.len(), event.reason);
    }
    info!("{}", cache.stats()?);

    cache.close();
    info!("=== Demo complete ===");
    Ok(())
}
