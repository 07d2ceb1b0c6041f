//! Core type definitions for the cache system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 64-bit identifier packing a group id (high half) and a row id (low half)
pub type CombinedId = i64;

/// Identifier of a physical storage group
pub type GroupId = i32;

/// Identifier of a row within its group (stored as an unsigned bit pattern)
pub type RowId = i32;

/// When the rows of a deposit stop being valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expiration {
    /// Expire at a fixed point in time
    At(DateTime<Utc>),

    /// Expire when the cache session ends
    SessionEnd,
}

impl Expiration {
    /// Expire `ttl` from now
    pub fn after(ttl: std::time::Duration) -> Self {
        let at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Expiration::At(at)
    }

    /// Check if the expiration time has passed
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Expiration::At(at) => *at <= now,
            Expiration::SessionEnd => false,
        }
    }

    /// Get time until expiration (`None` for session-end or passed expirations)
    pub fn time_until_expiration(&self) -> Option<std::time::Duration> {
        match self {
            Expiration::At(at) => (*at - Utc::now()).to_std().ok(),
            Expiration::SessionEnd => None,
        }
    }
}

impl PartialOrd for Expiration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Session end sorts after every timestamp.
impl Ord for Expiration {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Expiration::At(a), Expiration::At(b)) => a.cmp(b),
            (Expiration::At(_), Expiration::SessionEnd) => Ordering::Less,
            (Expiration::SessionEnd, Expiration::At(_)) => Ordering::Greater,
            (Expiration::SessionEnd, Expiration::SessionEnd) => Ordering::Equal,
        }
    }
}

impl fmt::Display for Expiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiration::At(at) => write!(f, "{}", at.to_rfc3339()),
            Expiration::SessionEnd => write!(f, "session-end"),
        }
    }
}

/// Statistics for cache monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheStats {
    /// Number of storage groups
    pub groups: usize,

    /// Number of rows currently stored
    pub rows: usize,

    /// Approximate in-memory size of stored values in bytes
    pub in_memory_bytes: u64,

    /// Approximate on-disk size of stored values in bytes
    pub on_disk_bytes: u64,

    /// Rows written by `put`
    pub rows_inserted: u64,

    /// Rows rewritten by `put` updates and `update_values`
    pub rows_updated: u64,

    /// Rows evicted to satisfy size or row budgets
    pub evictions_size: u64,

    /// Rows evicted because their expiration passed
    pub evictions_ttl: u64,

    /// Rows removed by explicit clear calls
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate total evictions
    pub fn total_evictions(&self) -> u64 {
        self.evictions_size + self.evictions_ttl
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ groups: {}, rows: {}, memory: {} bytes, disk: {} bytes, inserted: {}, updated: {}, evictions: {} }}",
            self.groups,
            self.rows,
            self.in_memory_bytes,
            self.on_disk_bytes,
            self.rows_inserted,
            self.rows_updated,
            self.total_evictions()
        )
    }
}
