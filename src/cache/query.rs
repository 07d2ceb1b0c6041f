//! Id queries and batch value retrieval

use crate::cache::backend::{value_size, StoredRow};
use crate::cache::category::Category;
use crate::cache::group::Group;
use crate::cache::id;
use crate::cache::matcher::{compare_values, AnyMatcher, OrderSpecifier, SortDirection};
use crate::cache::property::{PropertyDescriptor, PropertyType, PropertyValueMap};
use crate::cache::store::{group_runs, in_group, PropertyCache};
use crate::cache::types::{CombinedId, GroupId};
use crate::error::Result;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

struct Hit {
    id: CombinedId,
    keys: Vec<Option<Value>>,
}

/// Rows fetched for a retrieval, with the declared column types of their groups
#[derive(Default)]
struct FetchedRows {
    rows: HashMap<CombinedId, StoredRow>,
    columns: HashMap<GroupId, HashMap<String, &'static str>>,
}

impl FetchedRows {
    fn get(&self, id: CombinedId) -> Option<(&StoredRow, &HashMap<String, &'static str>)> {
        let row = self.rows.get(&id)?;
        let columns = self.columns.get(&id::group_of(id))?;
        Some((row, columns))
    }
}

impl PropertyCache {
    /// Ids of the rows in groups matching `pattern` that satisfy every matcher.
    ///
    /// Rows are ordered by `order`; without order specifiers by the property
    /// of the first range or interval matcher; otherwise by ascending id.
    /// Missing sort values go last and ties are broken by id. `offset` and
    /// `limit` apply after ordering.
    pub async fn get_ids(
        &self,
        pattern: &Category,
        matchers: &[AnyMatcher],
        order: &[OrderSpecifier],
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<CombinedId>> {
        self.ensure_ready().await?;
        let groups = self.inner.groups.matching(pattern);
        self.query_groups(groups, matchers, order, offset, limit).await
    }

    /// Like [`get_ids`](Self::get_ids), restricted to the given groups
    pub async fn get_ids_in_groups(
        &self,
        group_ids: &[GroupId],
        matchers: &[AnyMatcher],
        order: &[OrderSpecifier],
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<CombinedId>> {
        self.ensure_ready().await?;
        let wanted: BTreeSet<GroupId> = group_ids.iter().copied().collect();
        let groups = wanted
            .into_iter()
            .filter_map(|g| self.inner.groups.get(g))
            .collect();
        self.query_groups(groups, matchers, order, offset, limit).await
    }

    async fn query_groups(
        &self,
        groups: Vec<Arc<Group>>,
        matchers: &[AnyMatcher],
        order: &[OrderSpecifier],
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<CombinedId>> {
        let compiled = matchers
            .iter()
            .map(|m| m.compile())
            .collect::<Result<Vec<_>>>()?;
        let sort_keys = effective_order(matchers, order);

        let mut hits = Vec::new();
        for group in &groups {
            let state = group.state.read().await;
            if state.dropped {
                continue;
            }
            let rows = self
                .inner
                .backend
                .scan_matching(group.id, &compiled)
                .map_err(in_group(group))?;

            if sort_keys.is_empty() {
                hits.extend(rows.into_iter().map(|row| Hit {
                    id: id::encode(group.id, row),
                    keys: Vec::new(),
                }));
                continue;
            }

            let stored = self
                .inner
                .backend
                .fetch(group.id, &rows)
                .map_err(in_group(group))?;
            hits.extend(rows.into_iter().zip(stored).map(|(row, stored)| Hit {
                id: id::encode(group.id, row),
                keys: sort_keys
                    .iter()
                    .map(|key| stored.as_ref().and_then(|s| s.values.get(&key.name)).cloned())
                    .collect(),
            }));
        }

        hits.sort_by(|a, b| compare_hits(a, b, &sort_keys));
        debug!(
            "Query over {} groups matched {} rows",
            groups.len(),
            hits.len()
        );
        Ok(hits
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|hit| hit.id)
            .collect())
    }

    /// Fill `values` with the requested properties of `ids`, positionally.
    ///
    /// Every list of `values` is reset first. A row that was removed, lacks a
    /// requested property, or holds a value that cannot be read as the
    /// requested type leaves `None` in every list at its position; that
    /// position is recorded in `failed`.
    pub async fn get_values(
        &self,
        ids: &[CombinedId],
        values: &mut PropertyValueMap,
        mut failed: Option<&mut Vec<usize>>,
    ) -> Result<()> {
        self.ensure_ready().await?;
        let fetched = self.fetch_rows(ids).await?;
        if let Some(failed) = failed.as_deref_mut() {
            failed.clear();
        }

        let lists = values.lists_mut();
        for list in lists.iter_mut() {
            list.reset();
        }

        for (pos, id) in ids.iter().enumerate() {
            let resolved = match fetched.get(*id) {
                Some((row, columns)) => lists.iter_mut().all(|list| {
                    let value = row.values.get(list.key().name());
                    let declared = columns.get(list.key().name()).copied();
                    match (value, declared) {
                        (Some(value), Some(declared)) => list.try_push(value, declared, &self.inner.types),
                        _ => false,
                    }
                }),
                None => false,
            };

            if !resolved {
                for list in lists.iter_mut() {
                    list.truncate(pos);
                    list.push_missing();
                }
                if let Some(failed) = failed.as_deref_mut() {
                    failed.push(pos);
                }
            }
        }
        Ok(())
    }

    /// Serialized size in bytes of one property of `ids`, positionally.
    ///
    /// A row that was removed, lacks the property, or declares it under a type
    /// other than `T` gets size `0` and its position is recorded in `failed`.
    pub async fn get_value_sizes<T: PropertyType>(
        &self,
        ids: &[CombinedId],
        descriptor: &PropertyDescriptor<T>,
        mut failed: Option<&mut Vec<usize>>,
    ) -> Result<Vec<usize>> {
        self.ensure_ready().await?;
        let fetched = self.fetch_rows(ids).await?;
        if let Some(failed) = failed.as_deref_mut() {
            failed.clear();
        }

        let mut sizes = Vec::with_capacity(ids.len());
        for (pos, id) in ids.iter().enumerate() {
            let readable = fetched.get(*id).and_then(|(row, columns)| {
                let declared = columns.get(descriptor.name())?;
                if !self.inner.types.is_compatible::<T>(declared) {
                    return None;
                }
                row.values.get(descriptor.name())
            });
            match readable {
                Some(value) => sizes.push(value_size(value)),
                None => {
                    sizes.push(0);
                    if let Some(failed) = failed.as_deref_mut() {
                        failed.push(pos);
                    }
                }
            }
        }
        Ok(sizes)
    }

    /// Ids of the groups whose category matches `pattern`, ascending
    pub async fn get_group_ids(&self, pattern: &Category) -> Result<Vec<GroupId>> {
        self.ensure_ready().await?;
        Ok(self
            .inner
            .groups
            .matching(pattern)
            .iter()
            .map(|g| g.id)
            .collect())
    }

    /// Distinct stored categories matching `pattern`, sorted
    pub async fn get_categories(&self, pattern: &Category) -> Result<Vec<Category>> {
        self.ensure_ready().await?;
        let categories: BTreeSet<Category> = self
            .inner
            .groups
            .matching(pattern)
            .iter()
            .map(|g| g.category.clone())
            .collect();
        Ok(categories.into_iter().collect())
    }

    async fn fetch_rows(&self, ids: &[CombinedId]) -> Result<FetchedRows> {
        let mut fetched = FetchedRows::default();
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
            fetched.columns.insert(group.id, state.columns.clone());
            drop(state);

            fetched.rows.extend(
                run.ids
                    .iter()
                    .copied()
                    .zip(rows)
                    .filter_map(|(id, row)| row.map(|row| (id, row))),
            );
        }
        Ok(fetched)
    }
}

fn effective_order(matchers: &[AnyMatcher], order: &[OrderSpecifier]) -> Vec<OrderSpecifier> {
    if !order.is_empty() {
        return order.to_vec();
    }
    matchers
        .iter()
        .find(|m| m.is_ordered())
        .map(|m| vec![OrderSpecifier::ascending(m.property_name())])
        .unwrap_or_default()
}

fn compare_hits(a: &Hit, b: &Hit, order: &[OrderSpecifier]) -> Ordering {
    for ((x, y), spec) in a.keys.iter().zip(&b.keys).zip(order) {
        let ord = match (x, y) {
            (Some(x), Some(y)) => match spec.direction {
                SortDirection::Ascending => compare_values(x, y),
                SortDirection::Descending => compare_values(y, x),
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id.cmp(&b.id)
}
