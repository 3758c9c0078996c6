//! Configuration options for the index block

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;

use crate::defaults;
use crate::types::{now_nanos, Timestamp};

/// Injectable clock; returns "now" in nanoseconds since epoch
pub type NowFn = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Options for in-memory mutable segments
#[derive(Debug, Clone)]
pub struct MemSegmentOptions {
    /// Initial document capacity to reserve per segment
    pub initial_capacity: usize,
}

impl Default for MemSegmentOptions {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
        }
    }
}

/// Options for building mmap-backed FST segments
#[derive(Debug, Clone, Default)]
pub struct FstSegmentOptions {
    /// Directory for segment backing files; the system temp dir if unset
    pub dir: Option<PathBuf>,
}

impl FstSegmentOptions {
    /// The directory backing files are created in
    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Logging and metrics options
#[derive(Clone, Default)]
pub struct InstrumentOptions {
    /// Registry block metrics are registered against; metrics still record
    /// when unset, they are just not exported
    pub registry: Option<Registry>,
    /// Interval between background metric reports
    pub report_interval: Option<Duration>,
}

impl InstrumentOptions {
    /// The effective report interval
    pub fn report_interval(&self) -> Duration {
        self.report_interval
            .unwrap_or(defaults::METRICS_REPORT_INTERVAL)
    }
}

/// Options governing a block's segments, rotation policy, and
/// instrumentation.
#[derive(Clone)]
pub struct BlockOptions {
    /// Mutable segment document count that triggers a rotation
    pub rotation_size: u64,
    /// Cumulative document ceiling for one rotation merge
    pub rotation_merge_size: u64,
    /// Mutable segment age that triggers a rotation
    pub rotation_age: Duration,
    /// Forwarded to mutable segments
    pub mem_segment: MemSegmentOptions,
    /// Forwarded to the FST transform
    pub fst_segment: FstSegmentOptions,
    /// Logging and metrics
    pub instrument: InstrumentOptions,
    /// Clock used for segment creation times and age-based rotation
    pub now_fn: NowFn,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            rotation_size: defaults::MUTABLE_SEGMENT_ROTATION_SIZE,
            rotation_merge_size: defaults::MUTABLE_SEGMENT_ROTATION_MERGE_SIZE,
            rotation_age: defaults::MUTABLE_SEGMENT_ROTATION_AGE,
            mem_segment: MemSegmentOptions::default(),
            fst_segment: FstSegmentOptions::default(),
            instrument: InstrumentOptions::default(),
            now_fn: Arc::new(now_nanos),
        }
    }
}

impl BlockOptions {
    /// Set the rotation size threshold
    pub fn with_rotation_size(mut self, size: u64) -> Self {
        self.rotation_size = size;
        self
    }

    /// Set the rotation merge ceiling
    pub fn with_rotation_merge_size(mut self, size: u64) -> Self {
        self.rotation_merge_size = size;
        self
    }

    /// Set the rotation age threshold
    pub fn with_rotation_age(mut self, age: Duration) -> Self {
        self.rotation_age = age;
        self
    }

    /// Set the clock
    pub fn with_now_fn(mut self, now_fn: NowFn) -> Self {
        self.now_fn = now_fn;
        self
    }

    /// Set the instrument options
    pub fn with_instrument(mut self, instrument: InstrumentOptions) -> Self {
        self.instrument = instrument;
        self
    }
}

impl std::fmt::Debug for BlockOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockOptions")
            .field("rotation_size", &self.rotation_size)
            .field("rotation_merge_size", &self.rotation_merge_size)
            .field("rotation_age", &self.rotation_age)
            .field("mem_segment", &self.mem_segment)
            .field("fst_segment", &self.fst_segment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let opts = BlockOptions::default();
        assert_eq!(opts.rotation_size, 1 << 16);
        assert_eq!(opts.rotation_merge_size, 1 << 20);
        assert_eq!(opts.rotation_age, Duration::from_secs(30));
    }

    #[test]
    fn test_injectable_clock() {
        let opts = BlockOptions::default().with_now_fn(Arc::new(|| 42));
        assert_eq!((opts.now_fn)(), 42);
    }
}
