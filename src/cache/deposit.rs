//! Deposits: batches of source objects to insert into or update in the cache

use crate::cache::category::Category;
use crate::cache::interval::IntervalPropertyValueSet;
use crate::cache::property::{AnyAccessor, PropertyKey};
use crate::cache::types::{CombinedId, Expiration};
use crate::error::{CacheError, Result};
use std::collections::HashSet;

/// Insert-or-update instruction for a batch of source objects
///
/// Deposits that share a category should share an expiration where possible:
/// every distinct (category, expiration) pair is stored in its own group.
pub struct Deposit<S> {
    category: Category,
    accessors: Vec<AnyAccessor<S>>,
    input: Vec<S>,
    is_new: bool,
    expiration: Expiration,
    critical: bool,
    ids: Option<Vec<CombinedId>>,
}

impl<S> Deposit<S> {
    /// Create a deposit, validating it before it can reach the cache.
    ///
    /// Fails with a configuration error for wildcard categories or two
    /// accessors producing the same property, and with an invalid-argument
    /// error when no expiration is given.
    pub fn new(
        category: Category,
        accessors: Vec<AnyAccessor<S>>,
        input: Vec<S>,
        is_new: bool,
        expiration: Option<Expiration>,
        critical: bool,
    ) -> Result<Self> {
        category.require_fully_specified()?;
        check_unique_accessors(&accessors)?;
        let expiration = expiration.ok_or_else(|| {
            CacheError::InvalidArgument("deposit expiration must be provided".to_string())
        })?;

        Ok(Self {
            category,
            accessors,
            input,
            is_new,
            expiration,
            critical,
            ids: None,
        })
    }

    /// Start building a deposit for `category`
    pub fn builder(category: Category) -> DepositBuilder<S> {
        DepositBuilder {
            category,
            accessors: Vec::new(),
            input: Vec::new(),
            is_new: true,
            expiration: None,
            critical: false,
            ids: None,
        }
    }

    /// Single-accessor deposit kept until `expiration`, evictable
    pub fn persistent(
        category: Category,
        accessor: AnyAccessor<S>,
        input: Vec<S>,
        is_new: bool,
        expiration: Expiration,
    ) -> Result<Self> {
        Self::new(category, vec![accessor], input, is_new, Some(expiration), false)
    }

    /// Single-accessor deposit that lives for the session and is never evicted
    pub fn session_only(category: Category, accessor: AnyAccessor<S>, input: Vec<S>) -> Result<Self> {
        Self::new(
            category,
            vec![accessor],
            input,
            true,
            Some(Expiration::SessionEnd),
            true,
        )
    }

    /// Name the existing rows this deposit updates, positionally with the input
    pub fn with_ids(mut self, ids: Vec<CombinedId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn category(&self) -> &Category {
        &self.category
    }

    pub fn accessors(&self) -> &[AnyAccessor<S>] {
        &self.accessors
    }

    pub fn input(&self) -> &[S] {
        &self.input
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn expiration(&self) -> Expiration {
        self.expiration
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn ids(&self) -> Option<&[CombinedId]> {
        self.ids.as_deref()
    }

    /// Descriptors of the deposited properties, in accessor order
    pub fn property_keys(&self) -> Vec<PropertyKey> {
        self.accessors.iter().map(|a| a.key().clone()).collect()
    }

    /// Region covered by this deposit, from the extents of its interval accessors
    pub fn coverage(&self) -> Option<IntervalPropertyValueSet> {
        let coverage: IntervalPropertyValueSet = self
            .accessors
            .iter()
            .filter_map(|a| a.extent().map(|e| (a.key().name().to_string(), e.clone())))
            .collect();
        (!coverage.is_empty()).then_some(coverage)
    }
}

/// Builder for deposits with the same validation as [`Deposit::new`]
pub struct DepositBuilder<S> {
    category: Category,
    accessors: Vec<AnyAccessor<S>>,
    input: Vec<S>,
    is_new: bool,
    expiration: Option<Expiration>,
    critical: bool,
    ids: Option<Vec<CombinedId>>,
}

impl<S> DepositBuilder<S> {
    pub fn accessor(mut self, accessor: AnyAccessor<S>) -> Self {
        self.accessors.push(accessor);
        self
    }

    pub fn input(mut self, input: Vec<S>) -> Self {
        self.input = input;
        self
    }

    /// Whether rows are allocated (`true`, the default) or updated
    pub fn new_rows(mut self, is_new: bool) -> Self {
        self.is_new = is_new;
        self
    }

    pub fn expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn ids(mut self, ids: Vec<CombinedId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Deposit<S>> {
        let deposit = Deposit::new(
            self.category,
            self.accessors,
            self.input,
            self.is_new,
            self.expiration,
            self.critical,
        )?;
        Ok(match self.ids {
            Some(ids) => deposit.with_ids(ids),
            None => deposit,
        })
    }
}

/// Reject accessor lists naming a property twice
pub(crate) fn check_unique_accessors<S>(accessors: &[AnyAccessor<S>]) -> Result<()> {
    let mut seen = HashSet::new();
    for accessor in accessors {
        if !seen.insert(accessor.key().name()) {
            return Err(CacheError::DuplicateAccessor {
                name: accessor.key().name().to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::interval::IntervalValue;
    use crate::cache::property::{IntervalPropertyAccessor, PropertyAccessor, PropertyDescriptor};

    fn roads() -> Category {
        Category::new("wfs", "feature", "roads")
    }

    fn name_accessor() -> AnyAccessor<(String, f64)> {
        PropertyAccessor::new(PropertyDescriptor::<String>::new("name"), |r: &(String, f64)| {
            r.0.clone()
        })
        .erased()
    }

    fn length_accessor(name: &str) -> AnyAccessor<(String, f64)> {
        PropertyAccessor::new(PropertyDescriptor::<f64>::new(name), |r: &(String, f64)| r.1).erased()
    }

    #[test]
    fn test_valid_deposit() {
        let deposit = Deposit::new(
            roads(),
            vec![name_accessor(), length_accessor("length")],
            vec![("Main St".to_string(), 120.5)],
            true,
            Some(Expiration::SessionEnd),
            false,
        )
        .unwrap();
        assert!(deposit.is_new());
        assert_eq!(deposit.property_keys().len(), 2);
        assert!(deposit.coverage().is_none());
    }

    #[test]
    fn test_duplicate_accessor_rejected_in_any_position() {
        let layouts = vec![
            vec![name_accessor(), name_accessor()],
            vec![name_accessor(), length_accessor("length"), name_accessor()],
            vec![length_accessor("name"), name_accessor()],
            vec![length_accessor("a"), length_accessor("b"), length_accessor("b")],
        ];
        for accessors in layouts {
            let err = Deposit::new(
                roads(),
                accessors,
                Vec::new(),
                true,
                Some(Expiration::SessionEnd),
                false,
            )
            .err()
            .unwrap();
            assert!(err.is_configuration_error(), "unexpected error {err}");
        }
    }

    #[test]
    fn test_missing_expiration_rejected() {
        let err = Deposit::new(roads(), vec![name_accessor()], Vec::new(), true, None, false)
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
    }

    #[test]
    fn test_wildcard_category_rejected() {
        let err = Deposit::builder(Category::pattern(Some("wfs"), None, Some("roads")))
            .accessor(name_accessor())
            .expiration(Expiration::SessionEnd)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::Configuration(_)));
    }

    #[test]
    fn test_convenience_constructors() {
        let session = Deposit::session_only(roads(), name_accessor(), Vec::new()).unwrap();
        assert!(session.is_new());
        assert!(session.is_critical());
        assert_eq!(session.expiration(), Expiration::SessionEnd);

        let expiration = Expiration::after(std::time::Duration::from_secs(60));
        let persistent =
            Deposit::persistent(roads(), name_accessor(), Vec::new(), false, expiration).unwrap();
        assert!(!persistent.is_new());
        assert!(!persistent.is_critical());
        assert_eq!(persistent.expiration(), expiration);
    }

    #[test]
    fn test_coverage_from_interval_accessors() {
        let bbox = IntervalPropertyAccessor::new(
            PropertyDescriptor::<IntervalValue>::new("bbox"),
            IntervalValue::envelope(0.0, 0.0, 10.0, 10.0),
            |_: &(String, f64)| IntervalValue::envelope(1.0, 1.0, 1.0, 1.0),
        )
        .erased();
        let deposit = Deposit::builder(roads())
            .accessor(name_accessor())
            .accessor(bbox)
            .expiration(Expiration::SessionEnd)
            .ids(vec![1, 2])
            .build()
            .unwrap();

        let coverage = deposit.coverage().unwrap();
        assert_eq!(coverage.len(), 1);
        assert_eq!(
            coverage.get("bbox"),
            Some(&IntervalValue::envelope(0.0, 0.0, 10.0, 10.0))
        );
        assert_eq!(deposit.ids(), Some(&[1, 2][..]));
    }
}
