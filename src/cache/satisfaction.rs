//! Interval coverage index and satisfaction computation
//!
//! Each group records the regions its committed deposits were fetched for.
//! A request is answered region by region: the per-dimension intersection of a
//! region with the request is a sub-region that is known to be cached. Results
//! never claim more than a single recorded region, so they are always a subset
//! of the true coverage; redundant sub-regions inside the same group are
//! dropped.

use crate::cache::interval::{IntervalPropertyMatcher, IntervalPropertyValueSet, Satisfaction};
use crate::cache::types::GroupId;
use crate::error::{CacheError, Result};

/// Regions known to be fully cached in one group
#[derive(Debug, Clone, Default)]
pub struct CoverageIndex {
    regions: Vec<IntervalPropertyValueSet>,
}

impl CoverageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a region covered by a committed deposit
    pub fn record(&mut self, region: IntervalPropertyValueSet) {
        if region.is_empty() || self.regions.iter().any(|r| covers(r, &region)) {
            return;
        }
        self.regions.retain(|r| !covers(&region, r));
        self.regions.push(region);
    }

    /// Forget all coverage, e.g. after rows of the group were removed
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn regions(&self) -> &[IntervalPropertyValueSet] {
        &self.regions
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Cached sub-regions of the request described by `matchers`
    pub fn satisfactions(&self, group_id: GroupId, matchers: &[IntervalPropertyMatcher]) -> Vec<Satisfaction> {
        let mut found: Vec<IntervalPropertyValueSet> = Vec::new();

        for region in &self.regions {
            let Some(hit) = intersect(region, matchers) else {
                continue;
            };
            if found.iter().any(|f| f.contains(&hit)) {
                continue;
            }
            found.retain(|f| !hit.contains(f));
            found.push(hit);
        }

        found
            .into_iter()
            .map(|intervals| Satisfaction { group_id, intervals })
            .collect()
    }
}

/// Same dimensions, and every dimension of `inner` inside `outer`
fn covers(outer: &IntervalPropertyValueSet, inner: &IntervalPropertyValueSet) -> bool {
    outer.len() == inner.len() && outer.contains(inner)
}

fn intersect(
    region: &IntervalPropertyValueSet,
    matchers: &[IntervalPropertyMatcher],
) -> Option<IntervalPropertyValueSet> {
    matchers
        .iter()
        .map(|m| {
            region
                .get(&m.name)
                .and_then(|covered| covered.intersection(&m.interval))
                .map(|i| (m.name.clone(), i))
        })
        .collect()
}

/// Satisfactions across groups, in group order
pub fn compute_satisfactions<'a, I>(groups: I, matchers: &[IntervalPropertyMatcher]) -> Result<Vec<Satisfaction>>
where
    I: IntoIterator<Item = (GroupId, &'a CoverageIndex)>,
{
    if matchers.is_empty() {
        return Err(CacheError::InvalidArgument(
            "interval satisfaction requires at least one matcher".to_string(),
        ));
    }
    Ok(groups
        .into_iter()
        .flat_map(|(group_id, index)| index.satisfactions(group_id, matchers))
        .collect())
}
