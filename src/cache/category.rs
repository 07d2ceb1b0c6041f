//! Three-part classification key for cached rows
//!
//! A category is `(source, family, category)`. Absent fields are wildcards when
//! the category is used as a query pattern; a category labelling a deposit must
//! have every field present.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification key, also usable as a wildcard pattern
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Category {
    /// Data source, e.g. the importer that produced the rows
    pub source: Option<String>,

    /// Family of data within the source
    pub family: Option<String>,

    /// Concrete category name
    pub category: Option<String>,
}

impl Category {
    /// Create a fully specified category
    pub fn new(
        source: impl Into<String>,
        family: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            source: Some(source.into()),
            family: Some(family.into()),
            category: Some(category.into()),
        }
    }

    /// Create a pattern where `None` fields match anything
    pub fn pattern(source: Option<&str>, family: Option<&str>, category: Option<&str>) -> Self {
        Self {
            source: source.map(str::to_string),
            family: family.map(str::to_string),
            category: category.map(str::to_string),
        }
    }

    /// Pattern matching every category
    pub fn any() -> Self {
        Self::default()
    }

    /// True when no field is a wildcard
    pub fn is_fully_specified(&self) -> bool {
        self.source.is_some() && self.family.is_some() && self.category.is_some()
    }

    /// Check that this category can label a deposit
    pub fn require_fully_specified(&self) -> Result<()> {
        if self.is_fully_specified() {
            Ok(())
        } else {
            Err(CacheError::Configuration(format!(
                "deposit category must not contain wildcards: {}",
                self
            )))
        }
    }

    /// Check whether `concrete` satisfies this pattern
    pub fn matches(&self, concrete: &Category) -> bool {
        field_matches(&self.source, &concrete.source)
            && field_matches(&self.family, &concrete.family)
            && field_matches(&self.category, &concrete.category)
    }

    /// Check whether two categories can describe the same rows
    pub fn overlaps(&self, other: &Category) -> bool {
        field_overlaps(&self.source, &other.source)
            && field_overlaps(&self.family, &other.family)
            && field_overlaps(&self.category, &other.category)
    }
}

fn field_matches(pattern: &Option<String>, concrete: &Option<String>) -> bool {
    match pattern {
        None => true,
        Some(p) => concrete.as_deref() == Some(p.as_str()),
    }
}

fn field_overlaps(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |p: &Option<String>| p.clone().unwrap_or_else(|| "*".to_string());
        write!(
            f,
            "{}/{}/{}",
            part(&self.source),
            part(&self.family),
            part(&self.category)
        )
    }
}
