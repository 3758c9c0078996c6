//! The time-bounded reverse-index block
//!
//! A block owns the inverted index for all documents whose timestamps fall
//! within `[start_time, start_time + block_size)` across an assignable set
//! of shards. It is created Open with one mutable active segment and two
//! background tasks (rotator, metrics reporter), accepts writes and queries
//! concurrently, seals to end ingestion, evicts its mutable state once
//! persisted, and closes to release everything.

mod metrics;
mod rotation;

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::batch::{WriteBatch, WriteBatchResult};
use crate::error::{IndexError, MultiError, Result};
use crate::options::BlockOptions;
use crate::query::{Executor, Query, QueryOptions, QueryResults};
use crate::segment::{Batch, FstSegment, MemSegment, Segment, SegmentHandle, SegmentReader};
use crate::types::{NamespaceMetadata, ShardTimeRanges, Timestamp};

use metrics::BlockMetrics;

/// Block lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Terminal; every operation fails
    Closed,
    /// Accepting writes and queries
    Open,
    /// Ingestion ended; queries, ticks, and bootstraps continue
    Sealed,
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockState::Closed => write!(f, "closed"),
            BlockState::Open => write!(f, "open"),
            BlockState::Sealed => write!(f, "sealed"),
        }
    }
}

/// A segment owned directly by the block, tagged with its lifecycle state
pub(crate) enum ActiveSegment {
    /// Accepts inserts; readable concurrently
    Mutable {
        segment: Arc<MemSegment>,
        created_at: Timestamp,
    },
    /// Frozen, owned by the rotator; skipped by queries
    Rotating {
        segment: Arc<MemSegment>,
        created_at: Timestamp,
    },
    /// Read-only mmap-backed FST
    Fst {
        segment: Arc<FstSegment>,
        created_at: Timestamp,
    },
}

impl ActiveSegment {
    pub(crate) fn size(&self) -> u64 {
        match self {
            ActiveSegment::Mutable { segment, .. } => segment.size(),
            ActiveSegment::Rotating { segment, .. } => segment.size(),
            ActiveSegment::Fst { segment, .. } => segment.size(),
        }
    }

    fn close(&self) -> Result<()> {
        match self {
            ActiveSegment::Mutable { segment, .. } => Segment::close(segment.as_ref()),
            ActiveSegment::Rotating { segment, .. } => Segment::close(segment.as_ref()),
            ActiveSegment::Fst { segment, .. } => Segment::close(segment.as_ref()),
        }
    }

    fn state_name(&self) -> &'static str {
        match self {
            ActiveSegment::Mutable { .. } => "mutable",
            ActiveSegment::Rotating { .. } => "rotating",
            ActiveSegment::Fst { .. } => "fst",
        }
    }
}

/// Externally built segments covering a set of shard time ranges,
/// contributed by the bootstrapper.
#[derive(Debug)]
pub struct IndexBlockResult {
    /// The `(shard, time)` space the segments completely cover
    pub fulfilled: ShardTimeRanges,
    /// The segments carrying that coverage
    pub segments: Vec<SegmentHandle>,
}

/// One bootstrap record the block retains
pub(crate) struct ShardRangesSegments {
    shard_time_ranges: ShardTimeRanges,
    segments: Vec<SegmentHandle>,
}

/// Result of a `tick`: segment and document counts across active segments
/// and bootstrap records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockTickResult {
    /// Segments observed
    pub num_segments: u64,
    /// Sum of per-segment document counts
    pub num_docs: u64,
}

/// Result of evicting a sealed block's mutable state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictActiveSegmentsResult {
    /// Segments closed
    pub num_active_segments: u64,
    /// Documents those segments held
    pub num_docs: u64,
}

pub(crate) struct BlockCore {
    pub(crate) state: BlockState,
    pub(crate) active_segments: Vec<ActiveSegment>,
    pub(crate) shard_ranges_segments: Vec<ShardRangesSegments>,
}

impl BlockCore {
    /// The segment writes land in: the first Mutable active segment still
    /// accepting inserts.
    fn mutable_active_segment(&self) -> Option<(&Arc<MemSegment>, Timestamp)> {
        self.active_segments.iter().find_map(|seg| match seg {
            ActiveSegment::Mutable {
                segment,
                created_at,
            } if !segment.is_sealed() => Some((segment, *created_at)),
            _ => None,
        })
    }
}

/// State shared between the block handle and its background tasks
pub(crate) struct Shared {
    pub(crate) namespace: String,
    pub(crate) start_time: Timestamp,
    pub(crate) end_time: Timestamp,
    pub(crate) opts: BlockOptions,
    pub(crate) rotate_tx: Sender<()>,
    pub(crate) core: RwLock<BlockCore>,
    pub(crate) metrics: BlockMetrics,
}

impl Shared {
    /// Signal the rotator; a signal already pending coalesces with this one
    pub(crate) fn trigger_rotation(&self) {
        let _ = self.rotate_tx.try_send(());
    }

    /// Allocate a fresh mutable segment at the front of the active set
    pub(crate) fn add_active_segment_with_lock(&self, core: &mut BlockCore) {
        let segment = Arc::new(MemSegment::new(&self.opts.mem_segment));
        core.active_segments.insert(
            0,
            ActiveSegment::Mutable {
                segment,
                created_at: (self.opts.now_fn)(),
            },
        );
        debug!(
            namespace = %self.namespace,
            block_start = self.start_time,
            num_active = core.active_segments.len(),
            "added mutable active segment"
        );
    }
}

/// A time-bounded reverse-index block
pub struct Block {
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    rotator: Mutex<Option<JoinHandle<()>>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl Block {
    /// Create a block covering `[start_time, start_time + block_size)` for
    /// the namespace, Open with one mutable active segment and its two
    /// background tasks running.
    pub fn new(
        start_time: Timestamp,
        namespace: &NamespaceMetadata,
        opts: BlockOptions,
    ) -> Result<Self> {
        let block_size = namespace.index_block_size;
        let end_time = start_time + block_size.as_nanos() as i64;

        let (rotate_tx, rotate_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let metrics = BlockMetrics::new(&namespace.name, start_time, &opts.instrument);
        let shared = Arc::new(Shared {
            namespace: namespace.name.clone(),
            start_time,
            end_time,
            opts,
            rotate_tx,
            core: RwLock::new(BlockCore {
                state: BlockState::Open,
                active_segments: Vec::new(),
                shard_ranges_segments: Vec::new(),
            }),
            metrics,
        });

        {
            let mut core = shared.core.write();
            shared.add_active_segment_with_lock(&mut core);
        }

        let rotator = {
            let shared = Arc::clone(&shared);
            let shutdown_rx = shutdown_rx.clone();
            std::thread::Builder::new()
                .name(format!("tidedb-index-rotator-{}", start_time))
                .spawn(move || rotation::run_rotator(shared, rotate_rx, shutdown_rx))?
        };
        let reporter = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("tidedb-index-reporter-{}", start_time))
                .spawn(move || metrics::run_reporter(shared, shutdown_rx))?
        };

        info!(
            namespace = %shared.namespace,
            block_start = start_time,
            block_size_secs = block_size.as_secs(),
            "opened index block"
        );

        Ok(Self {
            shared,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            rotator: Mutex::new(Some(rotator)),
            reporter: Mutex::new(Some(reporter)),
        })
    }

    /// Inclusive start of the block window
    pub fn start_time(&self) -> Timestamp {
        self.shared.start_time
    }

    /// Exclusive end of the block window
    pub fn end_time(&self) -> Timestamp {
        self.shared.end_time
    }

    /// Namespace the block belongs to
    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    /// Index a batch of documents.
    ///
    /// Each unmarked entry is marked Success or Error; entries marked by an
    /// earlier attempt are left alone. The result pairs the counts with the
    /// operation error, if any.
    pub fn write_batch(&self, batch: &mut WriteBatch) -> WriteBatchResult {
        let mut core = self.shared.core.write();

        if core.state != BlockState::Open {
            let err = match core.state {
                BlockState::Closed => IndexError::WriteBlockClosed,
                _ => IndexError::WriteBlockSealed,
            };
            batch.mark_unmarked_entries_error(&err);
            return WriteBatchResult {
                num_error: batch.len() as u64,
                error: Some(err),
                ..Default::default()
            };
        }

        let Some((segment, created_at)) = core.mutable_active_segment() else {
            let err = self
                .shared
                .metrics
                .invariant_violation("open block has no mutable active segment".to_string());
            batch.mark_unmarked_entries_error(&err);
            return WriteBatchResult {
                num_error: batch.len() as u64,
                error: Some(err),
                ..Default::default()
            };
        };
        let segment = Arc::clone(segment);

        let pending = batch.pending_docs();
        let num_pending = pending.len() as u64;
        let result = match segment.insert_batch(Batch::new(pending)) {
            Ok(()) => {
                batch.mark_unmarked_entries_success();
                WriteBatchResult {
                    num_success: num_pending,
                    ..Default::default()
                }
            }
            Err(IndexError::PartialBatch(partial)) => {
                let num_err = partial.len() as u64;
                batch.mark_unmarked_entries_partial(&partial);
                batch.mark_unmarked_entries_success();
                WriteBatchResult {
                    num_success: num_pending - num_err,
                    num_error: num_err,
                    error: Some(IndexError::PartialBatch(partial)),
                }
            }
            Err(other) => {
                let err = self.shared.metrics.invariant_violation(format!(
                    "unexpected insert error from mutable segment: {}",
                    other
                ));
                batch.mark_unmarked_entries_error(&err);
                WriteBatchResult {
                    num_error: num_pending,
                    error: Some(err),
                    ..Default::default()
                }
            }
        };

        // rotation trigger, evaluated before releasing the write lock
        let now = (self.shared.opts.now_fn)();
        let age = Duration::from_nanos(now.saturating_sub(created_at).max(0) as u64);
        if segment.size() >= self.shared.opts.rotation_size || age >= self.shared.opts.rotation_age
        {
            if let Err(err) = segment.seal() {
                warn!(%err, "failed to seal mutable segment for rotation");
            }
            self.shared.add_active_segment_with_lock(&mut core);
            self.shared.trigger_rotation();
        }

        result
    }

    /// Run a query, feeding matches into `results` until exhaustion or the
    /// option limit. Returns whether the candidate set was exhausted.
    pub fn query(
        &self,
        query: &Query,
        opts: QueryOptions,
        results: &mut QueryResults,
    ) -> Result<bool> {
        let core = self.shared.core.read();
        if core.state == BlockState::Closed {
            return Err(IndexError::QueryBlockClosed);
        }

        let executor = Self::executor_with_rlock(&core)?;

        let mut size = results.size();
        let mut broke_early = false;
        for item in executor.execute(query) {
            if opts.exceeds_limit(size) {
                broke_early = true;
                break;
            }
            size = results.add(item?);
        }

        Ok(!broke_early)
    }

    /// Acquire a reader from every queryable segment. Rotating segments are
    /// skipped: the rotator is about to replace them with its FST. Readers
    /// already acquired release via drop if any later acquisition fails.
    fn executor_with_rlock(core: &BlockCore) -> Result<Executor> {
        let expected = core.active_segments.len()
            + core
                .shard_ranges_segments
                .iter()
                .map(|g| g.segments.len())
                .sum::<usize>();
        let mut readers: Vec<Box<dyn SegmentReader>> = Vec::with_capacity(expected);

        for seg in &core.active_segments {
            match seg {
                ActiveSegment::Mutable { segment, .. } => readers.push(segment.reader()?),
                ActiveSegment::Fst { segment, .. } => readers.push(segment.reader()?),
                ActiveSegment::Rotating { .. } => {}
            }
        }
        for group in &core.shard_ranges_segments {
            for seg in &group.segments {
                readers.push(seg.reader()?);
            }
        }

        Ok(Executor::new(readers))
    }

    /// Merge externally bootstrapped segments into the block.
    ///
    /// Accepted while Open or Sealed (topology changes can assign new
    /// shards to a sealed block; incoming mutable segments are sealed on
    /// arrival). A record whose fulfilled ranges cover everything already
    /// bootstrapped replaces the existing records; otherwise it is
    /// appended.
    pub fn add_results(&self, results: IndexBlockResult) -> Result<()> {
        let mut core = self.shared.core.write();
        if core.state == BlockState::Closed {
            return Err(IndexError::BootstrapBlockClosed);
        }

        if let Some((min, max)) = results.fulfilled.min_max() {
            if min < self.shared.start_time || max > self.shared.end_time {
                return Err(IndexError::RangeOutsideBlock {
                    min,
                    max,
                    start: self.shared.start_time,
                    end: self.shared.end_time,
                });
            }
        }

        let mut multi = MultiError::new();
        if core.state == BlockState::Sealed {
            for seg in &results.segments {
                if let Some(mem) = seg.as_mem() {
                    if !mem.is_sealed() {
                        if let Err(err) = mem.seal() {
                            multi.add(self.shared.metrics.invariant_violation(format!(
                                "failed to seal bootstrapped mutable segment: {}",
                                err
                            )));
                        }
                    }
                }
            }
        }

        let entry = ShardRangesSegments {
            shard_time_ranges: results.fulfilled,
            segments: results.segments,
        };

        let mut unfulfilled = ShardTimeRanges::new();
        for existing in &core.shard_ranges_segments {
            unfulfilled.add_ranges(&existing.shard_time_ranges);
        }
        unfulfilled.subtract(&entry.shard_time_ranges);

        if !unfulfilled.is_empty() {
            // cannot wholly replace the current records; append
            core.shard_ranges_segments.push(entry);
            return multi.final_result();
        }

        // the new record covers everything bootstrapped so far; replace and
        // close the superseded segments
        for group in core.shard_ranges_segments.drain(..) {
            for seg in group.segments {
                multi.add_result(seg.close());
            }
        }
        core.shard_ranges_segments.push(entry);

        multi.final_result()
    }

    /// Count segments and documents across active segments and bootstrap
    /// records. Purely observational.
    pub fn tick(&self) -> Result<BlockTickResult> {
        let core = self.shared.core.read();
        if core.state == BlockState::Closed {
            return Err(IndexError::TickBlockClosed);
        }

        let mut result = BlockTickResult::default();
        for seg in &core.active_segments {
            result.num_segments += 1;
            result.num_docs += seg.size();
        }
        for group in &core.shard_ranges_segments {
            for seg in &group.segments {
                result.num_segments += 1;
                result.num_docs += seg.size();
            }
        }
        Ok(result)
    }

    /// End ingestion: every mutable segment (active or bootstrapped) is
    /// sealed in place. Legal only while Open.
    pub fn seal(&self) -> Result<()> {
        let mut core = self.shared.core.write();
        if core.state != BlockState::Open {
            return Err(IndexError::SealIllegalState(core.state.to_string()));
        }
        core.state = BlockState::Sealed;

        let mut multi = MultiError::new();
        for seg in &core.active_segments {
            if let ActiveSegment::Mutable { segment, .. } = seg {
                if !segment.is_sealed() {
                    multi.add_result(segment.seal());
                }
            }
        }
        for group in &core.shard_ranges_segments {
            for seg in &group.segments {
                if let Some(mem) = seg.as_mem() {
                    if !mem.is_sealed() {
                        multi.add_result(mem.seal());
                    }
                }
            }
        }

        info!(
            namespace = %self.shared.namespace,
            block_start = self.shared.start_time,
            "sealed index block"
        );
        multi.final_result()
    }

    /// Whether the block is sealed
    pub fn is_sealed(&self) -> bool {
        self.shared.core.read().state == BlockState::Sealed
    }

    /// Whether any mutable state remains that eviction would release
    pub fn needs_mutable_segments_evicted(&self) -> bool {
        let core = self.shared.core.read();
        let active = core.active_segments.iter().any(|seg| seg.size() > 0);
        if active {
            return true;
        }
        core.shard_ranges_segments.iter().any(|group| {
            group
                .segments
                .iter()
                .any(|seg| seg.as_mem().is_some_and(|mem| mem.size() > 0))
        })
    }

    /// Release the block's mutable state. Legal only once Sealed; the
    /// caller guarantees the data has already been persisted durably.
    pub fn evict_active_segments(&self) -> Result<EvictActiveSegmentsResult> {
        let mut core = self.shared.core.write();
        if core.state != BlockState::Sealed {
            return Err(IndexError::EvictIllegalState(core.state.to_string()));
        }

        let mut results = EvictActiveSegmentsResult::default();
        let mut multi = MultiError::new();

        for seg in core.active_segments.drain(..) {
            results.num_active_segments += 1;
            results.num_docs += seg.size();
            multi.add_result(seg.close());
        }

        // bootstrap records keep their immutable segments
        for group in core.shard_ranges_segments.iter_mut() {
            let mut kept = Vec::with_capacity(group.segments.len());
            for seg in group.segments.drain(..) {
                match seg.as_mem() {
                    Some(mem) => {
                        results.num_active_segments += 1;
                        results.num_docs += mem.size();
                        multi.add_result(seg.close());
                    }
                    None => kept.push(seg),
                }
            }
            group.segments = kept;
        }

        multi.final_result()?;
        Ok(results)
    }

    /// Close the block: terminal and idempotent-erroring. Cancels the
    /// background tasks and closes every segment everywhere.
    pub fn close(&self) -> Result<()> {
        let mut multi = MultiError::new();
        {
            let mut core = self.shared.core.write();
            if core.state == BlockState::Closed {
                return Err(IndexError::BlockAlreadyClosed);
            }
            core.state = BlockState::Closed;

            for seg in core.active_segments.drain(..) {
                multi.add_result(seg.close());
            }
            for group in core.shard_ranges_segments.drain(..) {
                for seg in group.segments {
                    multi.add_result(seg.close());
                }
            }
        }

        // cancel the background tasks and wait for them outside the lock
        self.shutdown_tx.lock().take();
        if let Some(handle) = self.rotator.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reporter.lock().take() {
            let _ = handle.join();
        }

        info!(
            namespace = %self.shared.namespace,
            block_start = self.shared.start_time,
            "closed index block"
        );
        multi.final_result()
    }
}

#[cfg(test)]
impl Block {
    /// Active segments as `(state, size)` pairs, for assertions
    fn snapshot_active(&self) -> Vec<(&'static str, u64)> {
        self.shared
            .core
            .read()
            .active_segments
            .iter()
            .map(|seg| (seg.state_name(), seg.size()))
            .collect()
    }

    fn num_bootstrap_records(&self) -> usize {
        self.shared.core.read().shard_ranges_segments.len()
    }

    fn active_open_readers(&self) -> Vec<usize> {
        self.shared
            .core
            .read()
            .active_segments
            .iter()
            .map(|seg| match seg {
                ActiveSegment::Mutable { segment, .. } => segment.open_readers(),
                ActiveSegment::Rotating { segment, .. } => segment.open_readers(),
                ActiveSegment::Fst { segment, .. } => segment.open_readers(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::MemSegmentOptions;
    use crate::types::{Document, TimeRange};
    use std::time::Instant;

    const SECOND: i64 = 1_000_000_000;

    fn namespace() -> NamespaceMetadata {
        NamespaceMetadata::new("n", Duration::from_secs(3600))
    }

    fn new_block(opts: BlockOptions) -> Block {
        Block::new(1000, &namespace(), opts).unwrap()
    }

    fn docs(prefix: &str, n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| {
                Document::new(format!("{}-{}", prefix, i)).with_field("t", "v")
            })
            .collect()
    }

    fn mem_segment(doc_list: Vec<Document>) -> Arc<MemSegment> {
        let seg = MemSegment::new(&MemSegmentOptions::default());
        seg.insert_batch(Batch::new(doc_list)).unwrap();
        Arc::new(seg)
    }

    fn query_all(block: &Block) -> (usize, bool) {
        let mut results = QueryResults::new();
        let exhaustive = block
            .query(&Query::All, QueryOptions::default(), &mut results)
            .unwrap();
        (results.size(), exhaustive)
    }

    fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn test_new_block_window() {
        let block = new_block(BlockOptions::default());
        assert_eq!(block.start_time(), 1000);
        assert_eq!(block.end_time(), 1000 + 3600 * SECOND);
        assert_eq!(block.namespace(), "n");
        assert!(!block.is_sealed());
        assert_eq!(block.snapshot_active(), vec![("mutable", 0)]);
        block.close().unwrap();
    }

    #[test]
    fn test_write_seal_evict_lifecycle() {
        let block = new_block(BlockOptions::default());

        let mut batch = WriteBatch::from_documents(docs("d", 100));
        let result = block.write_batch(&mut batch);
        assert_eq!(result.num_success, 100);
        assert_eq!(result.num_error, 0);
        assert!(result.error.is_none());

        let tick = block.tick().unwrap();
        assert_eq!(tick.num_segments, 1);
        assert_eq!(tick.num_docs, 100);

        block.seal().unwrap();
        assert!(block.is_sealed());

        let mut late = WriteBatch::from_documents(docs("late", 1));
        let result = block.write_batch(&mut late);
        assert_eq!(result.num_error, 1);
        assert_eq!(result.error, Some(IndexError::WriteBlockSealed));
        assert_eq!(late.num_success(), 0);

        assert!(block.needs_mutable_segments_evicted());
        let evicted = block.evict_active_segments().unwrap();
        assert_eq!(evicted.num_active_segments, 1);
        assert_eq!(evicted.num_docs, 100);
        assert!(!block.needs_mutable_segments_evicted());

        let tick = block.tick().unwrap();
        assert_eq!(tick, BlockTickResult::default());

        block.close().unwrap();
    }

    #[test]
    fn test_rotation_by_size() {
        let opts = BlockOptions::default()
            .with_rotation_size(2)
            .with_rotation_merge_size(100)
            .with_rotation_age(Duration::from_secs(3600));
        let block = new_block(opts);

        let mut batch = WriteBatch::from_documents(vec![
            Document::new("d1").with_field("t", "v"),
            Document::new("d2").with_field("t", "v"),
        ]);
        let result = block.write_batch(&mut batch);
        assert_eq!(result.num_success, 2);

        wait_for(
            || {
                let mut active = block.snapshot_active();
                active.sort();
                active == vec![("fst", 2), ("mutable", 0)]
            },
            "rotation to one fst segment plus one empty mutable",
        );

        let mut results = QueryResults::new();
        let exhaustive = block
            .query(&Query::All, QueryOptions::default(), &mut results)
            .unwrap();
        assert!(exhaustive);
        assert_eq!(results.size(), 2);
        assert!(results.contains(b"d1"));
        assert!(results.contains(b"d2"));

        block.close().unwrap();
    }

    #[test]
    fn test_rotation_merges_small_segments() {
        // every write seals the segment; successive rotations fold the
        // small fsts together
        let opts = BlockOptions::default()
            .with_rotation_size(1)
            .with_rotation_merge_size(1000)
            .with_rotation_age(Duration::from_secs(3600));
        let block = new_block(opts);

        for i in 0..4 {
            let mut batch =
                WriteBatch::from_documents(vec![Document::new(format!("d{}", i)).with_field("t", "v")]);
            let result = block.write_batch(&mut batch);
            assert_eq!(result.num_success, 1, "write {}", i);
        }

        wait_for(
            || {
                let (size, _) = query_all(&block);
                size == 4
            },
            "all four docs visible",
        );
        wait_for(
            || block.snapshot_active().len() <= 3,
            "small segments folded together",
        );

        block.close().unwrap();
    }

    #[test]
    fn test_query_limit() {
        let block = new_block(BlockOptions::default());
        let mut batch = WriteBatch::from_documents(docs("d", 10));
        block.write_batch(&mut batch);

        let query = Query::term("t", "v");

        let mut results = QueryResults::new();
        let exhaustive = block
            .query(&query, QueryOptions::with_limit(3), &mut results)
            .unwrap();
        assert_eq!(results.size(), 3);
        assert!(!exhaustive);

        let mut results = QueryResults::new();
        let exhaustive = block
            .query(&query, QueryOptions::default(), &mut results)
            .unwrap();
        assert_eq!(results.size(), 10);
        assert!(exhaustive);

        block.close().unwrap();
    }

    #[test]
    fn test_partial_batch() {
        let block = new_block(BlockOptions::default());

        let mut batch = WriteBatch::from_documents(vec![
            Document::new("a").with_field("t", "v"),
            Document::new("b").with_field("t", "v"),
            Document::new("a").with_field("t", "v"), // duplicate id
            Document::new("c").with_field("t", "v"),
            Document::new("d").with_field("t", "v"),
        ]);
        let result = block.write_batch(&mut batch);

        assert_eq!(result.num_success, 4);
        assert_eq!(result.num_error, 1);
        match result.error {
            Some(IndexError::PartialBatch(partial)) => {
                assert_eq!(partial.len(), 1);
                assert_eq!(partial.errs()[0].index, 2);
            }
            other => panic!("expected partial batch error, got {:?}", other),
        }

        let entries = batch.entries();
        for idx in [0, 1, 3, 4] {
            assert!(entries[idx].is_success(), "entry {}", idx);
        }
        assert_eq!(entries[2].error(), Some(&IndexError::DuplicateDocId));

        block.close().unwrap();
    }

    #[test]
    fn test_bootstrap_supersede() {
        let block = new_block(BlockOptions::default());

        let first = mem_segment(vec![Document::new("s1").with_field("t", "v")]);
        block
            .add_results(IndexBlockResult {
                fulfilled: ShardTimeRanges::with_range(7, TimeRange::new(1000, 2000)),
                segments: vec![SegmentHandle::Mem(Arc::clone(&first))],
            })
            .unwrap();
        assert_eq!(block.num_bootstrap_records(), 1);

        let second = mem_segment(vec![Document::new("s2").with_field("t", "v")]);
        block
            .add_results(IndexBlockResult {
                fulfilled: ShardTimeRanges::with_range(7, TimeRange::new(1000, 3600)),
                segments: vec![SegmentHandle::Mem(Arc::clone(&second))],
            })
            .unwrap();

        assert_eq!(block.num_bootstrap_records(), 1);
        // superseded segments were closed
        assert!(first.reader().is_err());
        assert!(second.reader().is_ok());

        let (size, _) = query_all(&block);
        assert_eq!(size, 1);

        block.close().unwrap();
    }

    #[test]
    fn test_bootstrap_append() {
        let block = new_block(BlockOptions::default());

        let first = mem_segment(vec![Document::new("s1").with_field("t", "v")]);
        block
            .add_results(IndexBlockResult {
                fulfilled: ShardTimeRanges::with_range(7, TimeRange::new(1000, 2000)),
                segments: vec![SegmentHandle::Mem(Arc::clone(&first))],
            })
            .unwrap();

        let third = mem_segment(vec![Document::new("s3").with_field("t", "v")]);
        block
            .add_results(IndexBlockResult {
                fulfilled: ShardTimeRanges::with_range(8, TimeRange::new(1000, 2000)),
                segments: vec![SegmentHandle::Mem(Arc::clone(&third))],
            })
            .unwrap();

        assert_eq!(block.num_bootstrap_records(), 2);
        assert!(first.reader().is_ok());
        assert!(third.reader().is_ok());

        let (size, _) = query_all(&block);
        assert_eq!(size, 2);

        block.close().unwrap();
    }

    #[test]
    fn test_bootstrap_range_containment() {
        let block = new_block(BlockOptions::default());

        let err = block
            .add_results(IndexBlockResult {
                fulfilled: ShardTimeRanges::with_range(7, TimeRange::new(500, 2000)),
                segments: vec![SegmentHandle::Mem(mem_segment(Vec::new()))],
            })
            .unwrap_err();
        assert!(matches!(err, IndexError::RangeOutsideBlock { .. }));

        let err = block
            .add_results(IndexBlockResult {
                fulfilled: ShardTimeRanges::with_range(
                    7,
                    TimeRange::new(1000, block.end_time() + 1),
                ),
                segments: vec![SegmentHandle::Mem(mem_segment(Vec::new()))],
            })
            .unwrap_err();
        assert!(matches!(err, IndexError::RangeOutsideBlock { .. }));

        assert_eq!(block.num_bootstrap_records(), 0);
        block.close().unwrap();
    }

    #[test]
    fn test_bootstrap_on_sealed_block_seals_segments() {
        let block = new_block(BlockOptions::default());
        block.seal().unwrap();

        let seg = mem_segment(vec![Document::new("s").with_field("t", "v")]);
        assert!(!seg.is_sealed());

        block
            .add_results(IndexBlockResult {
                fulfilled: ShardTimeRanges::with_range(7, TimeRange::new(1000, 2000)),
                segments: vec![SegmentHandle::Mem(Arc::clone(&seg))],
            })
            .unwrap();

        assert!(seg.is_sealed());
        // sealed block still answers queries over bootstrapped data
        let (size, exhaustive) = query_all(&block);
        assert_eq!(size, 1);
        assert!(exhaustive);

        block.close().unwrap();
    }

    #[test]
    fn test_seal_illegal_state() {
        let block = new_block(BlockOptions::default());
        block.seal().unwrap();

        assert_eq!(
            block.seal(),
            Err(IndexError::SealIllegalState("sealed".to_string()))
        );

        block.close().unwrap();
        assert_eq!(
            block.seal(),
            Err(IndexError::SealIllegalState("closed".to_string()))
        );
    }

    #[test]
    fn test_evict_requires_sealed() {
        let block = new_block(BlockOptions::default());
        assert_eq!(
            block.evict_active_segments(),
            Err(IndexError::EvictIllegalState("open".to_string()))
        );
        block.close().unwrap();
    }

    #[test]
    fn test_evict_keeps_immutable_bootstrap_segments() {
        let block = new_block(BlockOptions::default());

        let mem = mem_segment(vec![Document::new("m").with_field("t", "v")]);
        let sealed_source = MemSegment::new(&MemSegmentOptions::default());
        sealed_source
            .insert_batch(Batch::new(vec![Document::new("f").with_field("t", "v")]))
            .unwrap();
        sealed_source.seal().unwrap();
        let fst = Arc::new(
            crate::segment::persist::transform_and_mmap(
                &sealed_source,
                &crate::options::FstSegmentOptions::default(),
            )
            .unwrap(),
        );

        block
            .add_results(IndexBlockResult {
                fulfilled: ShardTimeRanges::with_range(7, TimeRange::new(1000, 2000)),
                segments: vec![
                    SegmentHandle::Mem(Arc::clone(&mem)),
                    SegmentHandle::Fst(Arc::clone(&fst)),
                ],
            })
            .unwrap();

        block.seal().unwrap();
        let evicted = block.evict_active_segments().unwrap();
        // the empty active segment plus the bootstrapped mutable
        assert_eq!(evicted.num_active_segments, 2);
        assert_eq!(evicted.num_docs, 1);

        // the fst segment survived and stays queryable
        let (size, _) = query_all(&block);
        assert_eq!(size, 1);
        assert!(mem.reader().is_err());
        assert!(fst.reader().is_ok());

        block.close().unwrap();
    }

    #[test]
    fn test_closed_block_rejects_everything() {
        let block = new_block(BlockOptions::default());
        block.close().unwrap();

        let mut results = QueryResults::new();
        assert_eq!(
            block.query(&Query::All, QueryOptions::default(), &mut results),
            Err(IndexError::QueryBlockClosed)
        );

        let mut batch = WriteBatch::from_documents(docs("d", 1));
        let result = block.write_batch(&mut batch);
        assert_eq!(result.num_error, 1);
        assert_eq!(result.error, Some(IndexError::WriteBlockClosed));

        assert_eq!(block.tick(), Err(IndexError::TickBlockClosed));
        assert_eq!(
            block
                .add_results(IndexBlockResult {
                    fulfilled: ShardTimeRanges::new(),
                    segments: Vec::new(),
                })
                .unwrap_err(),
            IndexError::BootstrapBlockClosed
        );
        assert_eq!(block.close(), Err(IndexError::BlockAlreadyClosed));
    }

    #[test]
    fn test_query_error_leaks_no_readers() {
        let block = new_block(BlockOptions::default());
        let mut batch = WriteBatch::from_documents(docs("d", 3));
        block.write_batch(&mut batch);

        // a bootstrap record holding an already closed segment makes
        // reader acquisition fail partway through
        let broken = mem_segment(Vec::new());
        Segment::close(broken.as_ref()).unwrap();
        block
            .add_results(IndexBlockResult {
                fulfilled: ShardTimeRanges::with_range(7, TimeRange::new(1000, 2000)),
                segments: vec![SegmentHandle::Mem(broken)],
            })
            .unwrap();

        let mut results = QueryResults::new();
        assert_eq!(
            block.query(&Query::All, QueryOptions::default(), &mut results),
            Err(IndexError::SegmentClosed)
        );
        assert!(block.active_open_readers().iter().all(|&n| n == 0));

        block.close().unwrap();
    }

    #[test]
    fn test_rotation_failure_reverts_markers() {
        let mut opts = BlockOptions::default()
            .with_rotation_size(1)
            .with_rotation_age(Duration::from_secs(3600));
        // unbuildable scratch dir forces the fst transform to fail
        opts.fst_segment.dir = Some(std::path::PathBuf::from(
            "/nonexistent/tidedb-index-scratch",
        ));
        let block = new_block(opts);

        let mut batch = WriteBatch::from_documents(vec![Document::new("d1").with_field("t", "v")]);
        assert_eq!(block.write_batch(&mut batch).num_success, 1);

        wait_for(
            || block.shared.metrics.compaction_failures.get() >= 1,
            "the rotation pass to run and fail",
        );
        wait_for(
            || {
                let active = block.snapshot_active();
                active.contains(&("mutable", 1))
                    && !active.iter().any(|(state, _)| *state == "rotating")
            },
            "failed rotation to revert the rotating marker",
        );

        // the document never became invisible to new queries for good
        let (size, exhaustive) = query_all(&block);
        assert_eq!(size, 1);
        assert!(exhaustive);

        block.close().unwrap();
    }

    #[test]
    fn test_concurrent_writes_and_queries() {
        let opts = BlockOptions::default()
            .with_rotation_size(8)
            .with_rotation_age(Duration::from_secs(3600));
        let block = Arc::new(new_block(opts));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let block = Arc::clone(&block);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let mut batch = WriteBatch::from_documents(vec![Document::new(format!(
                            "w{}-{}",
                            w, i
                        ))
                        .with_field("t", "v")]);
                        let result = block.write_batch(&mut batch);
                        assert_eq!(result.num_success, 1);
                    }
                })
            })
            .collect();

        let reader = {
            let block = Arc::clone(&block);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let mut results = QueryResults::new();
                    block
                        .query(&Query::All, QueryOptions::default(), &mut results)
                        .unwrap();
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        for handle in writers {
            handle.join().unwrap();
        }
        reader.join().unwrap();

        // once in-flight rotations settle, every acknowledged write is
        // visible
        wait_for(
            || {
                let (size, _) = query_all(&block);
                size == 100
            },
            "all 100 acknowledged docs visible",
        );

        block.close().unwrap();
    }

    #[test]
    fn test_rotation_by_age() {
        let opts = BlockOptions::default()
            .with_rotation_size(1000)
            .with_rotation_age(Duration::from_millis(1));
        let block = new_block(opts);

        let mut batch = WriteBatch::from_documents(docs("d", 2));
        block.write_batch(&mut batch);
        std::thread::sleep(Duration::from_millis(5));
        let mut batch = WriteBatch::from_documents(docs("e", 1));
        block.write_batch(&mut batch);

        wait_for(
            || block.snapshot_active().iter().any(|(s, _)| *s == "fst"),
            "age-based rotation to produce an fst segment",
        );
        wait_for(
            || {
                let (size, _) = query_all(&block);
                size == 3
            },
            "all docs visible after age rotation",
        );

        block.close().unwrap();
    }
}
