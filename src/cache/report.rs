//! Modification reports and cache listeners
//!
//! Every put or update produces [`ModificationReport`]s naming the affected
//! rows and properties. Reports about the same rows are merged before they are
//! delivered, so a multi-step update reaches listeners as one notification.

use crate::cache::category::Category;
use crate::cache::property::{AnyAccessor, PropertyKey};
use crate::cache::types::CombinedId;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// Rows and properties changed by one cache mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationReport {
    pub category: Category,
    pub ids: Vec<CombinedId>,
    pub descriptors: Vec<PropertyKey>,
}

impl ModificationReport {
    pub fn new(category: Category, ids: Vec<CombinedId>, descriptors: Vec<PropertyKey>) -> Self {
        Self {
            category,
            ids,
            descriptors,
        }
    }

    /// Reports are mergeable when they name the same category and the same id sequence
    pub fn is_mergeable_with(&self, other: &ModificationReport) -> bool {
        self.category == other.category && self.ids == other.ids
    }

    pub fn contains_property(&self, name: &str) -> bool {
        self.descriptors.iter().any(|d| d.name() == name)
    }
}

/// Coalesce reports that refer to the same category and ids.
///
/// Each surviving report keeps its position; descriptors of later reports are
/// appended after its own, in input order.
pub fn merge_reports(reports: Vec<ModificationReport>) -> Vec<ModificationReport> {
    let mut pending: Vec<Option<ModificationReport>> = reports.into_iter().map(Some).collect();
    let mut merged = Vec::with_capacity(pending.len());

    for i in 0..pending.len() {
        let Some(mut report) = pending[i].take() else {
            continue;
        };
        for later in pending.iter_mut().skip(i + 1) {
            if later.as_ref().map_or(false, |r| report.is_mergeable_with(r)) {
                if let Some(r) = later.take() {
                    report.descriptors.extend(r.descriptors);
                }
            }
        }
        merged.push(report);
    }
    merged
}

/// Accessors whose descriptor appears in `report`.
///
/// Accessors listed in the same order as the report's descriptors are matched
/// in one forward pass; anything left over is matched by lookup.
pub fn filter_accessors<S>(report: &ModificationReport, accessors: &[AnyAccessor<S>]) -> Vec<AnyAccessor<S>> {
    let mut result = Vec::new();
    let mut cursor = 0;
    let mut in_order = true;

    for accessor in accessors {
        let name = accessor.key().name();
        if in_order {
            match report.descriptors[cursor..].iter().position(|d| d.name() == name) {
                Some(offset) => {
                    cursor += offset + 1;
                    result.push(accessor.clone());
                    continue;
                }
                None => in_order = false,
            }
        }
        if report.contains_property(name) {
            result.push(accessor.clone());
        }
    }
    result
}

/// Receives modification reports for puts and updates
pub trait ModificationListener: Send + Sync {
    fn values_modified(&self, report: &ModificationReport);
}

impl<F> ModificationListener for F
where
    F: Fn(&ModificationReport) + Send + Sync,
{
    fn values_modified(&self, report: &ModificationReport) {
        self(report)
    }
}

/// Listener forwarding reports into a tokio channel
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<ModificationReport>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ModificationReport>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ModificationListener for ChannelListener {
    fn values_modified(&self, report: &ModificationReport) {
        if self.sender.send(report.clone()).is_err() {
            warn!("Modification report dropped, receiver closed: {}", report.category);
        }
    }
}

/// Notified when rows leave the cache, by explicit clear or by eviction
pub trait CacheRemovalListener: Send + Sync {
    /// Always delivered for every removal
    fn values_removed(&self, category: &Category, ids: &[CombinedId]);

    /// Per-property values of the removed rows, positional with `ids`.
    ///
    /// Only delivered by backends that return removed rows; a `None` entry
    /// marks a row without that property.
    fn values_removed_with_values(
        &self,
        _category: &Category,
        _ids: &[CombinedId],
        _descriptor: &PropertyKey,
        _values: &[Option<Value>],
    ) {
    }
}
