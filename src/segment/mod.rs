//! Segment contracts and the handle type the block owns
//!
//! A segment stores indexed documents and hands out snapshot readers.
//! Readers hold `Arc` references to the segment's data, so closing a
//! segment is always safe against readers already handed out.

pub mod fst;
pub mod mem;
pub mod persist;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::error::Result;
use crate::types::Document;

pub use self::fst::FstSegment;
pub use self::mem::MemSegment;

/// Read-only segment contract
pub trait Segment: Send + Sync {
    /// Current document count; monotonic once the segment is sealed
    fn size(&self) -> u64;

    /// Acquire a concurrent snapshot reader
    fn reader(&self) -> Result<Box<dyn SegmentReader>>;

    /// Release the segment's storage. Outstanding readers stay valid.
    fn close(&self) -> Result<()>;
}

/// Snapshot reader over one segment
///
/// Positions are segment-local document indexes in `[0, doc_limit)`.
/// Documents inserted after the reader was acquired are invisible to it.
pub trait SegmentReader: Send {
    /// Exclusive upper bound on document positions visible to this reader
    fn doc_limit(&self) -> u32;

    /// Positions of documents carrying the exact field/value pair
    fn postings(&self, field: &[u8], value: &[u8]) -> Result<RoaringBitmap>;

    /// Fetch the document at a position
    fn doc(&self, pos: u32) -> Result<Document>;
}

/// Insert unit for mutable segments
#[derive(Debug, Clone)]
pub struct Batch {
    /// Documents to index, in order
    pub docs: Vec<Document>,
    /// Keep going on per-document failures and report them together
    pub allow_partial_updates: bool,
}

impl Batch {
    /// Create a batch allowing partial updates
    pub fn new(docs: Vec<Document>) -> Self {
        Self {
            docs,
            allow_partial_updates: true,
        }
    }

    /// Create an all-or-nothing batch
    pub fn strict(docs: Vec<Document>) -> Self {
        Self {
            docs,
            allow_partial_updates: false,
        }
    }
}

/// A segment the block (or a bootstrap record) owns: either mutable
/// in-memory or a sealed FST.
///
/// The sum type replaces runtime mutability probing; `as_mem` is the only
/// place the distinction surfaces.
#[derive(Clone)]
pub enum SegmentHandle {
    /// In-memory segment, possibly still accepting inserts
    Mem(Arc<MemSegment>),
    /// Immutable mmap-backed FST segment
    Fst(Arc<FstSegment>),
}

impl SegmentHandle {
    /// Document count
    pub fn size(&self) -> u64 {
        match self {
            SegmentHandle::Mem(seg) => seg.size(),
            SegmentHandle::Fst(seg) => seg.size(),
        }
    }

    /// Acquire a reader
    pub fn reader(&self) -> Result<Box<dyn SegmentReader>> {
        match self {
            SegmentHandle::Mem(seg) => seg.reader(),
            SegmentHandle::Fst(seg) => seg.reader(),
        }
    }

    /// Release the segment's storage
    pub fn close(&self) -> Result<()> {
        match self {
            SegmentHandle::Mem(seg) => Segment::close(seg.as_ref()),
            SegmentHandle::Fst(seg) => Segment::close(seg.as_ref()),
        }
    }

    /// The mutable segment behind this handle, if it is one
    pub fn as_mem(&self) -> Option<&Arc<MemSegment>> {
        match self {
            SegmentHandle::Mem(seg) => Some(seg),
            SegmentHandle::Fst(_) => None,
        }
    }

    /// Whether two handles refer to the same segment
    pub fn same_segment(&self, other: &SegmentHandle) -> bool {
        match (self, other) {
            (SegmentHandle::Mem(a), SegmentHandle::Mem(b)) => Arc::ptr_eq(a, b),
            (SegmentHandle::Fst(a), SegmentHandle::Fst(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for SegmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentHandle::Mem(seg) => f
                .debug_struct("SegmentHandle::Mem")
                .field("size", &seg.size())
                .field("sealed", &seg.is_sealed())
                .finish(),
            SegmentHandle::Fst(seg) => f
                .debug_struct("SegmentHandle::Fst")
                .field("size", &seg.size())
                .finish(),
        }
    }
}

/// Open-reader accounting shared between a segment and its readers.
///
/// Purely observational; used to verify readers are released on every
/// query exit path.
#[derive(Debug, Default)]
pub struct ReaderCount(AtomicUsize);

impl ReaderCount {
    /// Current number of open readers
    pub fn open(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> ReaderGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ReaderGuard(Arc::clone(self))
    }
}

/// Decrements the segment's open-reader count when the reader drops
pub(crate) struct ReaderGuard(Arc<ReaderCount>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::SeqCst);
    }
}
