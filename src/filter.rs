//! Display filters.
//!
//! A filter only decides how a leaf is drawn. It never removes anything from
//! the mirror: structural positions must not depend on filter state, which
//! can change at any moment on another thread.

use std::{collections::HashSet, fmt};

use thiserror::Error;

use crate::backing::{LeafHandle, TestStatus};

#[derive(Debug, Error)]
#[error("filter '{filter}' failed on '{leaf}': {reason}")]
pub struct FilterFault {
    pub filter: String,
    pub leaf: String,
    pub reason: String,
}

pub trait ActiveFilterQuery: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, leaf: &LeafHandle) -> Result<bool, FilterFault>;
}

/// Asks `filter` about `leaf`, accepting the leaf if the filter itself
/// fails.
pub fn is_accepted(filter: &dyn ActiveFilterQuery, leaf: &LeafHandle) -> bool {
    match filter.evaluate(leaf) {
        Ok(accepted) => accepted,
        Err(fault) => {
            log::warn!("{}; showing '{}' unfiltered", fault, leaf.path());
            true
        }
    }
}

/// Accepts leaves whose status is in a fixed set.
#[derive(Debug, Clone)]
pub struct StatusFilter {
    accepted: HashSet<TestStatus>,
}

impl StatusFilter {
    pub fn new(accepted: impl IntoIterator<Item = TestStatus>) -> Self {
        Self {
            accepted: accepted.into_iter().collect(),
        }
    }
}

impl ActiveFilterQuery for StatusFilter {
    fn name(&self) -> &str {
        "status"
    }

    fn evaluate(&self, leaf: &LeafHandle) -> Result<bool, FilterFault> {
        Ok(self.accepted.contains(&leaf.status()))
    }
}

/// Adapts a closure into a filter.
pub struct PredicateFilter<F> {
    name: String,
    predicate: F,
}

impl<F> PredicateFilter<F>
where
    F: Fn(&LeafHandle) -> Result<bool, String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<F> ActiveFilterQuery for PredicateFilter<F>
where
    F: Fn(&LeafHandle) -> Result<bool, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, leaf: &LeafHandle) -> Result<bool, FilterFault> {
        (self.predicate)(leaf).map_err(|reason| FilterFault {
            filter: self.name.clone(),
            leaf: leaf.path().to_owned(),
            reason,
        })
    }
}

impl<F> fmt::Debug for PredicateFilter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PredicateFilter({})", self.name)
    }
}
