//! Background segment rotation
//!
//! One long-lived task per block waits on a single-slot signal and, per
//! pass, merges small sealed segments into a fresh mutable segment,
//! transforms it into an mmap-backed FST, and swaps it in. The signal slot
//! coalesces triggers: many signals while a pass runs collapse into at
//! most one pending pass.
//!
//! The block lock is held only for candidate selection and the final swap;
//! merge and transform run unlocked so foreground writes and queries never
//! wait on them.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{select, Receiver};
use tracing::{error, info, warn};

use crate::block::{ActiveSegment, BlockState, Shared};
use crate::segment::{mem, persist, MemSegment, Segment, SegmentHandle};

/// Rotator loop; one rotation pass per received signal, terminating when
/// the shutdown channel disconnects.
pub(crate) fn run_rotator(
    shared: Arc<Shared>,
    rotate_rx: Receiver<()>,
    shutdown_rx: Receiver<()>,
) {
    loop {
        select! {
            recv(shutdown_rx) -> _ => return,
            recv(rotate_rx) -> msg => {
                if msg.is_err() {
                    return;
                }
                rotate_once(&shared);
            }
        }
    }
}

/// One rotation pass: select, merge, transform, swap.
pub(crate) fn rotate_once(shared: &Shared) {
    let (selected, num_mutable) = select_candidates(shared);
    // nothing to merge, or a single fst that a merge would only copy
    if selected.is_empty() || (selected.len() == 1 && num_mutable == 0) {
        return;
    }

    let start = Instant::now();
    let merged = MemSegment::new(&shared.opts.mem_segment);
    if let Err(err) = mem::merge(&merged, &selected) {
        error!(%err, "unable to merge segments for rotation");
        abandon_pass(shared, &selected);
        return;
    }
    let merge_time = start.elapsed();

    if let Err(err) = merged.seal() {
        error!(%err, "unable to seal merged segment");
        abandon_pass(shared, &selected);
        return;
    }

    let fst_segment = match persist::transform_and_mmap(&merged, &shared.opts.fst_segment) {
        Ok(segment) => segment,
        Err(err) => {
            error!(%err, "unable to transform merged segment to fst");
            abandon_pass(shared, &selected);
            return;
        }
    };
    let compaction_time = start.elapsed();
    shared
        .metrics
        .compaction_duration_seconds
        .observe(compaction_time.as_secs_f64());
    info!(
        namespace = %shared.namespace,
        block_start = shared.start_time,
        num_segments = selected.len(),
        num_docs = fst_segment.size(),
        merge_ms = merge_time.as_millis() as u64,
        compaction_ms = compaction_time.as_millis() as u64,
        "rotated segments into fst"
    );

    // the fst now carries the data
    let _ = Segment::close(&merged);

    let fst_segment = Arc::new(fst_segment);
    {
        let mut core = shared.core.write();
        if core.state == BlockState::Closed {
            drop(core);
            let _ = Segment::close(fst_segment.as_ref());
            return;
        }

        let before = core.active_segments.len();
        core.active_segments
            .retain(|entry| !entry_selected(entry, &selected));
        if core.active_segments.len() == before {
            // the selected segments were evicted while the pass ran
            // unlocked; their data is persisted elsewhere, so the fresh
            // fst must not resurrect it
            drop(core);
            let _ = Segment::close(fst_segment.as_ref());
            return;
        }

        core.active_segments.push(ActiveSegment::Fst {
            segment: Arc::clone(&fst_segment),
            created_at: (shared.opts.now_fn)(),
        });
    }

    // release the merged-away segments outside the lock
    for seg in &selected {
        if let Err(err) = seg.close() {
            warn!(%err, "failed to close rotated segment");
        }
    }
}

/// Pick the segments for one pass under the write lock.
///
/// Active segments are sorted ascending by size and accumulated while the
/// running total stays below the merge ceiling; once one segment would
/// overflow, all later ones would too. Eligible candidates are sealed
/// mutable segments (marked `Rotating` in place, committing them to the
/// pass) and existing FST segments (left readable until the swap).
fn select_candidates(shared: &Shared) -> (Vec<SegmentHandle>, usize) {
    let mut selected = Vec::new();
    let mut num_mutable = 0;
    let mut accumulated: u64 = 0;

    let mut core = shared.core.write();
    core.active_segments.sort_by_key(|seg| seg.size());
    for entry in core.active_segments.iter_mut() {
        let size = entry.size();
        if accumulated + size >= shared.opts.rotation_merge_size {
            break;
        }
        match entry {
            ActiveSegment::Mutable {
                segment,
                created_at,
            } if segment.is_sealed() => {
                let segment = Arc::clone(segment);
                let created_at = *created_at;
                *entry = ActiveSegment::Rotating {
                    segment: Arc::clone(&segment),
                    created_at,
                };
                accumulated += size;
                num_mutable += 1;
                selected.push(SegmentHandle::Mem(segment));
            }
            ActiveSegment::Fst { segment, .. } => {
                accumulated += size;
                selected.push(SegmentHandle::Fst(Arc::clone(segment)));
            }
            _ => {}
        }
    }

    (selected, num_mutable)
}

/// A failed pass: count it and put the selected segments back.
fn abandon_pass(shared: &Shared, selected: &[SegmentHandle]) {
    shared.metrics.compaction_failures.inc();
    revert_rotating(shared, selected);
}

/// Put the selected segments back in circulation after a failed pass, so
/// they stay queryable and the next signal reconsiders them.
fn revert_rotating(shared: &Shared, selected: &[SegmentHandle]) {
    let mut core = shared.core.write();
    for entry in core.active_segments.iter_mut() {
        if let ActiveSegment::Rotating {
            segment,
            created_at,
        } = entry
        {
            let committed = selected
                .iter()
                .any(|h| matches!(h, SegmentHandle::Mem(s) if Arc::ptr_eq(s, segment)));
            if committed {
                let segment = Arc::clone(segment);
                let created_at = *created_at;
                *entry = ActiveSegment::Mutable {
                    segment,
                    created_at,
                };
            }
        }
    }
}

fn entry_selected(entry: &ActiveSegment, selected: &[SegmentHandle]) -> bool {
    selected.iter().any(|handle| match (entry, handle) {
        (ActiveSegment::Rotating { segment, .. }, SegmentHandle::Mem(s)) => {
            Arc::ptr_eq(segment, s)
        }
        (ActiveSegment::Fst { segment, .. }, SegmentHandle::Fst(s)) => Arc::ptr_eq(segment, s),
        _ => false,
    })
}
