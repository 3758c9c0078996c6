//! Deduplicating query results sink

use std::collections::HashMap;

use bytes::Bytes;

use crate::types::Document;

/// Accumulates query matches, deduplicating by document id.
///
/// The same series routinely matches in several segments; the first
/// occurrence wins.
#[derive(Debug, Default)]
pub struct QueryResults {
    docs: HashMap<Bytes, Document>,
}

impl QueryResults {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a matched document, returning the new size
    pub fn add(&mut self, doc: Document) -> usize {
        self.docs.entry(doc.id.clone()).or_insert(doc);
        self.docs.len()
    }

    /// Current number of distinct documents
    pub fn size(&self) -> usize {
        self.docs.len()
    }

    /// Whether a document id was matched
    pub fn contains(&self, id: &[u8]) -> bool {
        self.docs.contains_key(id)
    }

    /// Iterate over the matched documents (unordered)
    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.docs.values()
    }

    /// Consume the sink, yielding the matched documents (unordered)
    pub fn into_documents(self) -> Vec<Document> {
        self.docs.into_values().collect()
    }
}
