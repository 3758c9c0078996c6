//! Write batches with per-entry outcome tracking
//!
//! A batch is submitted once per attempt; the block marks each entry
//! Success or Error and leaves entries marked by an earlier attempt alone.

use crate::error::{BatchPartialError, IndexError};
use crate::types::Document;

/// Outcome of one batch entry
#[derive(Debug, Clone, PartialEq)]
enum EntryState {
    Pending,
    Success,
    Error(IndexError),
}

/// One document queued for indexing plus its outcome
#[derive(Debug, Clone)]
pub struct WriteBatchEntry {
    doc: Document,
    state: EntryState,
}

impl WriteBatchEntry {
    /// The document
    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Whether the entry was indexed
    pub fn is_success(&self) -> bool {
        self.state == EntryState::Success
    }

    /// The entry's error, if it failed
    pub fn error(&self) -> Option<&IndexError> {
        match &self.state {
            EntryState::Error(err) => Some(err),
            _ => None,
        }
    }
}

/// An ordered batch of documents to index
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    entries: Vec<WriteBatchEntry>,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a batch from documents
    pub fn from_documents(docs: impl IntoIterator<Item = Document>) -> Self {
        Self {
            entries: docs
                .into_iter()
                .map(|doc| WriteBatchEntry {
                    doc,
                    state: EntryState::Pending,
                })
                .collect(),
        }
    }

    /// Append a document
    pub fn push(&mut self, doc: Document) {
        self.entries.push(WriteBatchEntry {
            doc,
            state: EntryState::Pending,
        });
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entries in submission order
    pub fn entries(&self) -> &[WriteBatchEntry] {
        &self.entries
    }

    /// Documents of entries not yet marked, in order. Indices into this
    /// view are what `mark_unmarked_entry_error` expects.
    pub fn pending_docs(&self) -> Vec<Document> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Pending)
            .map(|e| e.doc.clone())
            .collect()
    }

    /// Mark every unmarked entry with the given error
    pub fn mark_unmarked_entries_error(&mut self, err: &IndexError) {
        for entry in &mut self.entries {
            if entry.state == EntryState::Pending {
                entry.state = EntryState::Error(err.clone());
            }
        }
    }

    /// Mark every unmarked entry Success
    pub fn mark_unmarked_entries_success(&mut self) {
        for entry in &mut self.entries {
            if entry.state == EntryState::Pending {
                entry.state = EntryState::Success;
            }
        }
    }

    /// Mark the failed entries of a partial batch error. Its indices refer
    /// to the `pending_docs` view the attempt was submitted with, so the
    /// pending positions are resolved before any entry is marked.
    pub fn mark_unmarked_entries_partial(&mut self, partial: &BatchPartialError) {
        let positions: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == EntryState::Pending)
            .map(|(i, _)| i)
            .collect();
        for batch_err in partial.errs() {
            if let Some(&pos) = positions.get(batch_err.index) {
                self.entries[pos].state = EntryState::Error(batch_err.err.clone());
            }
        }
    }

    /// Mark the `pending_idx`-th unmarked entry with an error, where
    /// `pending_idx` indexes the `pending_docs` view this attempt was
    /// submitted with.
    pub fn mark_unmarked_entry_error(&mut self, pending_idx: usize, err: IndexError) {
        let entry = self
            .entries
            .iter_mut()
            .filter(|e| e.state == EntryState::Pending)
            .nth(pending_idx);
        if let Some(entry) = entry {
            entry.state = EntryState::Error(err);
        }
    }

    /// Number of entries marked Success
    pub fn num_success(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Success)
            .count()
    }

    /// Number of entries marked Error
    pub fn num_error(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, EntryState::Error(_)))
            .count()
    }
}

/// Outcome of one `write_batch` call: the counts and, when the call did not
/// fully succeed, the operation error.
#[derive(Debug, Clone, Default)]
pub struct WriteBatchResult {
    /// Entries indexed by this call
    pub num_success: u64,
    /// Entries failed by this call
    pub num_error: u64,
    /// The operation error, if any
    pub error: Option<IndexError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(n: usize) -> WriteBatch {
        WriteBatch::from_documents((0..n).map(|i| Document::new(format!("doc-{}", i))))
    }

    #[test]
    fn test_mark_all_error() {
        let mut batch = batch_of(3);
        batch.mark_unmarked_entries_error(&IndexError::WriteBlockSealed);

        assert_eq!(batch.num_error(), 3);
        assert_eq!(batch.num_success(), 0);
        assert_eq!(
            batch.entries()[0].error(),
            Some(&IndexError::WriteBlockSealed)
        );
    }

    #[test]
    fn test_partial_marking() {
        let mut batch = batch_of(5);
        batch.mark_unmarked_entry_error(2, IndexError::DuplicateDocId);
        batch.mark_unmarked_entries_success();

        assert_eq!(batch.num_success(), 4);
        assert_eq!(batch.num_error(), 1);
        assert!(batch.entries()[2].error().is_some());
        assert!(batch.entries()[0].is_success());
        assert!(batch.entries()[4].is_success());
    }

    #[test]
    fn test_marked_entries_left_alone() {
        let mut batch = batch_of(2);
        batch.mark_unmarked_entry_error(0, IndexError::DuplicateDocId);

        // second attempt only sees the remaining pending entry
        assert_eq!(batch.pending_docs().len(), 1);
        batch.mark_unmarked_entries_error(&IndexError::WriteBlockClosed);

        assert_eq!(batch.entries()[0].error(), Some(&IndexError::DuplicateDocId));
        assert_eq!(
            batch.entries()[1].error(),
            Some(&IndexError::WriteBlockClosed)
        );
    }
}
