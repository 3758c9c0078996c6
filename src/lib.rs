//! TideDB reverse-index block engine
//!
//! A block owns the inverted index for every document (time series) whose
//! timestamp falls inside a contiguous window `[start_time, start_time +
//! block_size)`. Writers feed it batches of tagged documents, readers run
//! boolean/term queries against it, and the bootstrapper hands it pre-built
//! segments recovered from persisted data.
//!
//! # Architecture
//!
//! - **MemSegment**: mutable in-memory segment accepting inserts
//! - **FstSegment**: immutable, mmap-backed segment with an FST term dictionary
//! - **Block**: the `{Closed, Open, Sealed}` state machine composing segments
//! - **Rotator**: background task merging small sealed segments into FSTs

pub mod batch;
pub mod block;
pub mod error;
pub mod options;
pub mod query;
pub mod segment;
pub mod types;

pub use batch::{WriteBatch, WriteBatchResult};
pub use block::{Block, BlockState, BlockTickResult, EvictActiveSegmentsResult, IndexBlockResult};
pub use error::{BatchError, BatchPartialError, IndexError, MultiError, Result};
pub use options::{BlockOptions, FstSegmentOptions, InstrumentOptions, MemSegmentOptions};
pub use query::{Query, QueryOptions, QueryResults};
pub use segment::{Batch, FstSegment, MemSegment, Segment, SegmentHandle, SegmentReader};
pub use types::{Document, Field, NamespaceMetadata, ShardId, ShardTimeRanges, TimeRange, Timestamp};

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Mutable segment document count that triggers a rotation (2^16)
    pub const MUTABLE_SEGMENT_ROTATION_SIZE: u64 = 1 << 16;

    /// Cumulative document ceiling for one rotation merge (2^20)
    pub const MUTABLE_SEGMENT_ROTATION_MERGE_SIZE: u64 = 1 << 20;

    /// Mutable segment age that triggers a rotation
    pub const MUTABLE_SEGMENT_ROTATION_AGE: Duration = Duration::from_secs(30);

    /// Interval between metric reports
    pub const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(10);
}
