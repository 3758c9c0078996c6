//! Per-block metrics and the background reporter task

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{select, Receiver};
use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntGauge, Opts,
};
use tracing::{error, warn};

use crate::block::{ActiveSegment, Shared};
use crate::error::IndexError;
use crate::options::InstrumentOptions;
use crate::types::Timestamp;

/// Metrics handle for one block
pub(crate) struct BlockMetrics {
    pub num_segments: IntGauge,
    pub num_docs: IntGauge,
    pub num_segments_compacting: IntGauge,
    pub segment_size_docs: Histogram,
    pub compaction_duration_seconds: Histogram,
    pub compaction_failures: IntCounter,
    pub invariant_violations: IntCounter,
}

impl BlockMetrics {
    pub fn new(namespace: &str, start_time: Timestamp, instrument: &InstrumentOptions) -> Self {
        let labels: HashMap<String, String> = [
            ("namespace".to_string(), namespace.to_string()),
            ("block_start".to_string(), start_time.to_string()),
        ]
        .into_iter()
        .collect();

        let num_segments = IntGauge::with_opts(
            Opts::new("tidedb_index_block_segments", "Active segments in the block")
                .const_labels(labels.clone()),
        )
        .expect("metric can be created");
        let num_docs = IntGauge::with_opts(
            Opts::new("tidedb_index_block_docs", "Documents across active segments")
                .const_labels(labels.clone()),
        )
        .expect("metric can be created");
        let num_segments_compacting = IntGauge::with_opts(
            Opts::new(
                "tidedb_index_block_segments_compacting",
                "Active segments currently being rotated",
            )
            .const_labels(labels.clone()),
        )
        .expect("metric can be created");
        let segment_size_docs = Histogram::with_opts(
            HistogramOpts::new(
                "tidedb_index_block_segment_size_docs",
                "Per-segment document counts",
            )
            .buckets(exponential_buckets(1.0, 10.0, 7).expect("valid buckets"))
            .const_labels(labels.clone()),
        )
        .expect("metric can be created");
        let compaction_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "tidedb_index_block_compaction_duration_seconds",
                "Rotation pass duration",
            )
            .const_labels(labels.clone()),
        )
        .expect("metric can be created");
        let compaction_failures = IntCounter::with_opts(
            Opts::new(
                "tidedb_index_block_compaction_failures",
                "Rotation passes abandoned on merge, seal, or transform errors",
            )
            .const_labels(labels.clone()),
        )
        .expect("metric can be created");
        let invariant_violations = IntCounter::with_opts(
            Opts::new(
                "tidedb_index_block_invariant_violations",
                "Internal contract violations detected",
            )
            .const_labels(labels),
        )
        .expect("metric can be created");

        if let Some(registry) = &instrument.registry {
            let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
                Box::new(num_segments.clone()),
                Box::new(num_docs.clone()),
                Box::new(num_segments_compacting.clone()),
                Box::new(segment_size_docs.clone()),
                Box::new(compaction_duration_seconds.clone()),
                Box::new(compaction_failures.clone()),
                Box::new(invariant_violations.clone()),
            ];
            for collector in collectors {
                if let Err(err) = registry.register(collector) {
                    warn!(%err, "failed to register block metric");
                }
            }
        }

        Self {
            num_segments,
            num_docs,
            num_segments_compacting,
            segment_size_docs,
            compaction_duration_seconds,
            compaction_failures,
            invariant_violations,
        }
    }

    /// The invariant-violation sink: log, count, and surface an opaque
    /// internal error.
    pub fn invariant_violation(&self, msg: String) -> IndexError {
        error!("invariant violation: {}", msg);
        self.invariant_violations.inc();
        IndexError::InvariantViolation(msg)
    }
}

/// Periodic metrics reporter; runs until the shutdown channel disconnects.
pub(crate) fn run_reporter(shared: Arc<Shared>, shutdown_rx: Receiver<()>) {
    let ticker = crossbeam_channel::tick(shared.opts.instrument.report_interval());
    loop {
        select! {
            recv(shutdown_rx) -> _ => return,
            recv(ticker) -> _ => shared.report_metrics(),
        }
    }
}

impl Shared {
    pub(crate) fn report_metrics(&self) {
        let mut num_docs: u64 = 0;
        let mut num_segments: i64 = 0;
        let mut num_compacting: i64 = 0;
        {
            let core = self.core.read();
            for seg in &core.active_segments {
                let size = seg.size();
                num_docs += size;
                num_segments += 1;
                if matches!(seg, ActiveSegment::Rotating { .. }) {
                    num_compacting += 1;
                }
                self.metrics.segment_size_docs.observe(size as f64);
            }
        }
        self.metrics.num_docs.set(num_docs as i64);
        self.metrics.num_segments.set(num_segments);
        self.metrics.num_segments_compacting.set(num_compacting);
    }
}
