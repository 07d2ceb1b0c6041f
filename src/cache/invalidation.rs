//! Row invalidation: removal reasons, events and eviction planning
//!
//! Eviction never touches critical rows. Rows of groups whose expiration has
//! passed go first; after that, while a byte budget or the row limit is still
//! exceeded, rows are taken from the groups nearest to expiration (session-end
//! groups last), oldest row first.

use crate::cache::category::Category;
use crate::cache::types::{CombinedId, Expiration, GroupId, RowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reason rows left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Group expiration passed
    Expired,

    /// Removed to get under the in-memory or on-disk byte budget
    SizeLimit,

    /// Removed to get under the non-critical row limit
    RowLimit,

    /// Explicit clear by ids, groups or category
    Manual,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Expired => write!(f, "expiration passed"),
            InvalidationReason::SizeLimit => write!(f, "size budget exceeded"),
            InvalidationReason::RowLimit => write!(f, "row limit exceeded"),
            InvalidationReason::Manual => write!(f, "manual clear"),
        }
    }
}

/// Record of one removal from one group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Category of the group the rows belonged to
    pub category: Category,

    /// Ids that were removed
    pub ids: Vec<CombinedId>,

    /// Additional context
    pub context: Option<String>,
}

impl InvalidationEvent {
    pub fn new(reason: InvalidationReason, category: Category, ids: Vec<CombinedId>) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            category,
            ids,
            context: None,
        }
    }

    /// Add context to the event
    pub fn with_context(mut self, context: String) -> Self {
        self.context = Some(context);
        self
    }
}

/// Budgets a cleanup pass enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionBudget {
    pub in_memory_bytes: u64,
    pub on_disk_bytes: Option<u64>,
    pub row_limit: Option<usize>,
}

/// Evictable rows of one group, with their sizes in bytes
#[derive(Debug, Clone)]
pub struct GroupUsage {
    pub group_id: GroupId,
    pub expiration: Expiration,
    pub rows: Vec<(RowId, u64)>,
}

/// Current totals the budgets are compared against
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageTotals {
    pub in_memory_bytes: u64,
    pub on_disk_bytes: u64,
}

/// Rows of one group to remove for one reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionStep {
    pub group_id: GroupId,
    pub rows: Vec<RowId>,
    pub reason: InvalidationReason,
}

struct Tracker {
    budget: EvictionBudget,
    memory: u64,
    disk: u64,
    rows: usize,
}

impl Tracker {
    fn over(&self) -> Option<InvalidationReason> {
        let over_bytes = self.memory > self.budget.in_memory_bytes
            || self.budget.on_disk_bytes.map_or(false, |limit| self.disk > limit);
        if over_bytes {
            Some(InvalidationReason::SizeLimit)
        } else if self.budget.row_limit.map_or(false, |limit| self.rows > limit) {
            Some(InvalidationReason::RowLimit)
        } else {
            None
        }
    }

    fn remove(&mut self, bytes: u64) {
        self.memory = self.memory.saturating_sub(bytes);
        self.disk = self.disk.saturating_sub(bytes);
        self.rows = self.rows.saturating_sub(1);
    }
}

/// Decide which rows one cleanup pass removes
pub fn plan_eviction(
    usage: &[GroupUsage],
    now: DateTime<Utc>,
    budget: EvictionBudget,
    totals: UsageTotals,
) -> Vec<EvictionStep> {
    let mut tracker = Tracker {
        budget,
        memory: totals.in_memory_bytes,
        disk: totals.on_disk_bytes,
        rows: usage.iter().map(|g| g.rows.len()).sum(),
    };
    let mut steps = Vec::new();

    let (expired, mut live): (Vec<&GroupUsage>, Vec<&GroupUsage>) =
        usage.iter().partition(|g| g.expiration.is_expired_at(now));

    for group in expired.into_iter().filter(|g| !g.rows.is_empty()) {
        for (_, bytes) in &group.rows {
            tracker.remove(*bytes);
        }
        steps.push(EvictionStep {
            group_id: group.group_id,
            rows: group.rows.iter().map(|(row, _)| *row).collect(),
            reason: InvalidationReason::Expired,
        });
    }

    live.sort_by(|a, b| a.expiration.cmp(&b.expiration).then(a.group_id.cmp(&b.group_id)));

    'groups: for group in live {
        let mut rows = group.rows.clone();
        rows.sort_by_key(|(row, _)| *row as u32);

        let mut taken: BTreeMap<InvalidationReason, Vec<RowId>> = BTreeMap::new();
        for (row, bytes) in rows {
            let Some(reason) = tracker.over() else {
                flush(&mut steps, group.group_id, taken);
                break 'groups;
            };
            taken.entry(reason).or_default().push(row);
            tracker.remove(bytes);
        }
        flush(&mut steps, group.group_id, taken);
    }

    steps
}

fn flush(steps: &mut Vec<EvictionStep>, group_id: GroupId, taken: BTreeMap<InvalidationReason, Vec<RowId>>) {
    steps.extend(taken.into_iter().map(|(reason, rows)| EvictionStep {
        group_id,
        rows,
        reason,
    }));
}
