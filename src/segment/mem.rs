//! In-memory mutable segment
//!
//! Stores documents and a term dictionary of roaring posting lists behind a
//! read/write lock. Readers capture the document count at acquisition time
//! and never observe later inserts. Closing marks the segment unusable for
//! new inserts and readers; memory is released once the last reader drops
//! its reference.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use roaring::RoaringBitmap;

use crate::error::{BatchPartialError, IndexError, Result};
use crate::options::MemSegmentOptions;
use crate::segment::{Batch, ReaderCount, ReaderGuard, Segment, SegmentHandle, SegmentReader};
use crate::types::Document;

/// Mutable in-memory segment
pub struct MemSegment {
    sealed: AtomicBool,
    closed: AtomicBool,
    num_docs: AtomicU64,
    inner: Arc<RwLock<MemInner>>,
    readers: Arc<ReaderCount>,
}

#[derive(Default)]
struct MemInner {
    docs: Vec<Document>,
    doc_ids: HashMap<Bytes, u32>,
    postings: HashMap<(Bytes, Bytes), RoaringBitmap>,
}

impl MemSegment {
    /// Create an empty mutable segment
    pub fn new(opts: &MemSegmentOptions) -> Self {
        let inner = MemInner {
            docs: Vec::with_capacity(opts.initial_capacity),
            ..Default::default()
        };
        Self {
            sealed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            num_docs: AtomicU64::new(0),
            inner: Arc::new(RwLock::new(inner)),
            readers: Arc::new(ReaderCount::default()),
        }
    }

    /// Insert a batch of documents.
    ///
    /// With partial updates allowed, per-document failures (empty or
    /// duplicate ids) are collected into a `PartialBatch` error whose
    /// indices refer to positions in the submitted batch; the remaining
    /// documents are applied. Without, the batch is validated up front and
    /// applied only if every document passes.
    pub fn insert_batch(&self, batch: Batch) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IndexError::SegmentClosed);
        }
        if self.is_sealed() {
            return Err(IndexError::SegmentSealed);
        }

        let mut inner = self.inner.write();

        if !batch.allow_partial_updates {
            {
                let mut batch_ids: HashSet<&[u8]> = HashSet::with_capacity(batch.docs.len());
                for doc in &batch.docs {
                    Self::validate(&inner, &batch_ids, doc)?;
                    batch_ids.insert(doc.id.as_ref());
                }
            }
            for doc in batch.docs {
                Self::apply(&mut inner, doc);
            }
            self.num_docs
                .store(inner.docs.len() as u64, Ordering::SeqCst);
            return Ok(());
        }

        let empty = HashSet::new();
        let mut partial = BatchPartialError::new();
        for (idx, doc) in batch.docs.into_iter().enumerate() {
            if let Err(err) = Self::validate(&inner, &empty, &doc) {
                partial.add(idx, err);
                continue;
            }
            Self::apply(&mut inner, doc);
        }
        self.num_docs
            .store(inner.docs.len() as u64, Ordering::SeqCst);
        drop(inner);

        if partial.is_empty() {
            Ok(())
        } else {
            Err(IndexError::PartialBatch(partial))
        }
    }

    fn validate(inner: &MemInner, batch_ids: &HashSet<&[u8]>, doc: &Document) -> Result<()> {
        if doc.id.is_empty() {
            return Err(IndexError::EmptyDocId);
        }
        if inner.doc_ids.contains_key(&doc.id) || batch_ids.contains(doc.id.as_ref()) {
            return Err(IndexError::DuplicateDocId);
        }
        Ok(())
    }

    fn apply(inner: &mut MemInner, doc: Document) {
        let pos = inner.docs.len() as u32;
        inner.doc_ids.insert(doc.id.clone(), pos);
        for field in &doc.fields {
            inner
                .postings
                .entry((field.name.clone(), field.value.clone()))
                .or_default()
                .insert(pos);
        }
        inner.docs.push(doc);
    }

    /// Freeze the segment; further inserts fail
    pub fn seal(&self) -> Result<()> {
        if self.sealed.swap(true, Ordering::SeqCst) {
            return Err(IndexError::SegmentAlreadySealed);
        }
        Ok(())
    }

    /// Whether the segment is frozen
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Number of open readers; observational
    pub fn open_readers(&self) -> usize {
        self.readers.open()
    }

    /// Snapshot of documents and term postings, for the FST transform
    pub(crate) fn export(&self) -> (Vec<Document>, Vec<((Bytes, Bytes), RoaringBitmap)>) {
        let inner = self.inner.read();
        let docs = inner.docs.clone();
        let terms = inner
            .postings
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        (docs, terms)
    }
}

impl Segment for MemSegment {
    fn size(&self) -> u64 {
        self.num_docs.load(Ordering::SeqCst)
    }

    fn reader(&self) -> Result<Box<dyn SegmentReader>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IndexError::SegmentClosed);
        }
        let limit = self.inner.read().docs.len() as u32;
        Ok(Box::new(MemReader {
            inner: Arc::clone(&self.inner),
            limit,
            _guard: self.readers.acquire(),
        }))
    }

    fn close(&self) -> Result<()> {
        // Readers hold the inner Arc, so contents are not torn down here;
        // the flag just fences off new inserts and readers.
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(IndexError::SegmentClosed);
        }
        Ok(())
    }
}

/// Snapshot reader over a mutable segment
struct MemReader {
    inner: Arc<RwLock<MemInner>>,
    limit: u32,
    _guard: ReaderGuard,
}

impl SegmentReader for MemReader {
    fn doc_limit(&self) -> u32 {
        self.limit
    }

    fn postings(&self, field: &[u8], value: &[u8]) -> Result<RoaringBitmap> {
        let key = (
            Bytes::copy_from_slice(field),
            Bytes::copy_from_slice(value),
        );
        let inner = self.inner.read();
        let mut bitmap = match inner.postings.get(&key) {
            Some(bitmap) => bitmap.clone(),
            None => return Ok(RoaringBitmap::new()),
        };
        drop(inner);
        bitmap.remove_range(self.limit..);
        Ok(bitmap)
    }

    fn doc(&self, pos: u32) -> Result<Document> {
        if pos >= self.limit {
            return Err(IndexError::InvariantViolation(format!(
                "document position {} outside reader limit {}",
                pos, self.limit
            )));
        }
        Ok(self.inner.read().docs[pos as usize].clone())
    }
}

/// Copy every document of every source into `dest`.
///
/// Sources routinely overlap (the same series indexed into several small
/// segments), so duplicate ids are skipped rather than reported.
pub fn merge(dest: &MemSegment, sources: &[SegmentHandle]) -> Result<()> {
    let mut docs = Vec::new();
    for source in sources {
        let reader = source.reader()?;
        for pos in 0..reader.doc_limit() {
            docs.push(reader.doc(pos)?);
        }
    }

    match dest.insert_batch(Batch::new(docs)) {
        Ok(()) => Ok(()),
        Err(IndexError::PartialBatch(partial))
            if partial
                .errs()
                .iter()
                .all(|e| e.err == IndexError::DuplicateDocId) =>
        {
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, value: &str) -> Document {
        Document::new(id.to_string()).with_field("host", value.to_string())
    }

    fn new_segment() -> MemSegment {
        MemSegment::new(&MemSegmentOptions::default())
    }

    #[test]
    fn test_insert_and_postings() {
        let seg = new_segment();
        seg.insert_batch(Batch::new(vec![doc("a", "h1"), doc("b", "h2"), doc("c", "h1")]))
            .unwrap();

        assert_eq!(seg.size(), 3);

        let reader = seg.reader().unwrap();
        let postings = reader.postings(b"host", b"h1").unwrap();
        assert_eq!(postings.iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(reader.doc(2).unwrap().id, Bytes::from("c"));
    }

    #[test]
    fn test_duplicate_id_partial_error() {
        let seg = new_segment();
        seg.insert_batch(Batch::new(vec![doc("a", "h1")])).unwrap();

        let err = seg
            .insert_batch(Batch::new(vec![doc("b", "h1"), doc("a", "h2"), doc("c", "h3")]))
            .unwrap_err();

        match err {
            IndexError::PartialBatch(partial) => {
                assert_eq!(partial.len(), 1);
                assert_eq!(partial.errs()[0].index, 1);
                assert_eq!(partial.errs()[0].err, IndexError::DuplicateDocId);
            }
            other => panic!("expected partial batch error, got {:?}", other),
        }

        // the valid documents were applied
        assert_eq!(seg.size(), 3);
    }

    #[test]
    fn test_strict_batch_rejects_all_or_nothing() {
        let seg = new_segment();
        let err = seg
            .insert_batch(Batch::strict(vec![doc("a", "h1"), doc("a", "h2")]))
            .unwrap_err();
        assert_eq!(err, IndexError::DuplicateDocId);
        assert_eq!(seg.size(), 0);
    }

    #[test]
    fn test_sealed_rejects_inserts() {
        let seg = new_segment();
        seg.seal().unwrap();
        assert!(seg.is_sealed());
        assert_eq!(
            seg.insert_batch(Batch::new(vec![doc("a", "h1")])),
            Err(IndexError::SegmentSealed)
        );
        assert_eq!(seg.seal(), Err(IndexError::SegmentAlreadySealed));
    }

    #[test]
    fn test_reader_snapshot_isolation() {
        let seg = new_segment();
        seg.insert_batch(Batch::new(vec![doc("a", "h1")])).unwrap();

        let reader = seg.reader().unwrap();
        seg.insert_batch(Batch::new(vec![doc("b", "h1")])).unwrap();

        assert_eq!(reader.doc_limit(), 1);
        let postings = reader.postings(b"host", b"h1").unwrap();
        assert_eq!(postings.len(), 1);
        assert!(reader.doc(1).is_err());
    }

    #[test]
    fn test_close_safe_with_open_reader() {
        let seg = new_segment();
        seg.insert_batch(Batch::new(vec![doc("a", "h1")])).unwrap();

        let reader = seg.reader().unwrap();
        Segment::close(&seg).unwrap();

        // closed segments reject new work but the old reader stays valid
        assert!(seg.reader().is_err());
        assert_eq!(reader.doc(0).unwrap().id, Bytes::from("a"));
    }

    #[test]
    fn test_reader_accounting() {
        let seg = new_segment();
        assert_eq!(seg.open_readers(), 0);
        let r1 = seg.reader().unwrap();
        let r2 = seg.reader().unwrap();
        assert_eq!(seg.open_readers(), 2);
        drop(r1);
        drop(r2);
        assert_eq!(seg.open_readers(), 0);
    }

    #[test]
    fn test_merge_dedups_across_sources() {
        let a = Arc::new(new_segment());
        let b = Arc::new(new_segment());
        a.insert_batch(Batch::new(vec![doc("x", "h1"), doc("y", "h2")]))
            .unwrap();
        b.insert_batch(Batch::new(vec![doc("y", "h2"), doc("z", "h3")]))
            .unwrap();

        let dest = new_segment();
        merge(
            &dest,
            &[SegmentHandle::Mem(a), SegmentHandle::Mem(b)],
        )
        .unwrap();

        assert_eq!(dest.size(), 3);
    }
}
