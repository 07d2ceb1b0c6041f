//! Combined identifier codec
//!
//! A combined id packs a group id into the high 32 bits and a row id into the
//! low 32 bits of an `i64`. Numeric order of combined ids is therefore group
//! order first (signed) and row order second (unsigned).

use crate::cache::types::{CombinedId, GroupId, RowId};
use std::borrow::Cow;

const ROW_MASK: i64 = 0xFFFF_FFFF;

/// Pack a group id and a row id into a combined id
pub fn encode(group: GroupId, row: RowId) -> CombinedId {
    ((group as i64) << 32) | (row as u32 as i64)
}

/// Split a combined id into its group id and row id
pub fn decode(id: CombinedId) -> (GroupId, RowId) {
    ((id >> 32) as GroupId, (id & ROW_MASK) as u32 as RowId)
}

/// Group component of a combined id
pub fn group_of(id: CombinedId) -> GroupId {
    (id >> 32) as GroupId
}

/// Row component of a combined id
pub fn row_of(id: CombinedId) -> RowId {
    (id & ROW_MASK) as u32 as RowId
}

/// Extract the group id of every combined id.
///
/// In positional mode the result has the same length and order as `ids`.
/// With `distinct` the result is the sorted set of group ids instead.
pub fn group_ids(ids: &[CombinedId], distinct: bool) -> Vec<GroupId> {
    let mut groups: Vec<GroupId> = ids.iter().map(|id| group_of(*id)).collect();
    if distinct {
        groups.sort_unstable();
        groups.dedup();
    }
    groups
}

/// Invoke `f` once per maximal run of ids sharing a group id.
///
/// The callback receives the run, its group id and the row ids of the run.
/// Iteration stops at the first error, which is returned; runs already
/// visited are not revisited. Input that is not sorted by group is iterated
/// through a stably sorted copy, so each group is visited exactly once.
pub fn for_each_group<E, F>(ids: &[CombinedId], mut f: F) -> Result<(), E>
where
    F: FnMut(&[CombinedId], GroupId, &[RowId]) -> Result<(), E>,
{
    let ids: Cow<'_, [CombinedId]> = if is_grouped(ids) {
        Cow::Borrowed(ids)
    } else {
        let mut sorted = ids.to_vec();
        sorted.sort_by_key(|id| group_of(*id));
        Cow::Owned(sorted)
    };

    let mut start = 0;
    while start < ids.len() {
        let group = group_of(ids[start]);
        let mut end = start + 1;
        while end < ids.len() && group_of(ids[end]) == group {
            end += 1;
        }
        let run = &ids[start..end];
        let rows: Vec<RowId> = run.iter().map(|id| row_of(*id)).collect();
        f(run, group, &rows)?;
        start = end;
    }
    Ok(())
}

fn is_grouped(ids: &[CombinedId]) -> bool {
    ids.windows(2).all(|w| group_of(w[0]) <= group_of(w[1]))
}
