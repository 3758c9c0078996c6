//! Boolean/term queries over a block

pub mod executor;
pub mod results;

use bytes::Bytes;

pub use executor::{DocumentIterator, Executor};
pub use results::QueryResults;

/// A boolean/term query.
///
/// Matching is exact on field name and value; boolean nodes compose
/// sub-queries with set algebra over each segment's snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Match every document
    All,
    /// Match documents carrying the exact field/value pair
    Term {
        /// Tag name
        field: Bytes,
        /// Tag value
        value: Bytes,
    },
    /// Match documents matching every sub-query
    Conjunction(Vec<Query>),
    /// Match documents matching any sub-query
    Disjunction(Vec<Query>),
    /// Match documents not matching the sub-query
    Negation(Box<Query>),
}

impl Query {
    /// Term query shorthand
    pub fn term(field: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Query::Term {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Per-query options
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Stop accumulating once the results sink reaches this size;
    /// `0` means unlimited
    pub limit: usize,
}

impl QueryOptions {
    /// Options with a result limit
    pub fn with_limit(limit: usize) -> Self {
        Self { limit }
    }

    /// Whether `size` has reached the limit
    pub fn exceeds_limit(&self, size: usize) -> bool {
        self.limit > 0 && size >= self.limit
    }
}
