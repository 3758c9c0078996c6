//! Error types for the index block engine

use std::fmt;

use thiserror::Error;

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Index block error types
///
/// Errors are `Clone` so a single state error can be fanned out across every
/// unmarked entry of a write batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    /// Write attempted on a closed block
    #[error("unable to write, index block is closed")]
    WriteBlockClosed,

    /// Write attempted on a sealed block
    #[error("unable to write, index block is sealed")]
    WriteBlockSealed,

    /// Query attempted on a closed block
    #[error("unable to query, index block is closed")]
    QueryBlockClosed,

    /// Bootstrap attempted on a closed block
    #[error("unable to bootstrap, index block is closed")]
    BootstrapBlockClosed,

    /// Tick attempted on a closed block
    #[error("unable to tick, index block is closed")]
    TickBlockClosed,

    /// Close attempted on an already closed block
    #[error("unable to close, index block already closed")]
    BlockAlreadyClosed,

    /// Seal attempted on a block that is not open
    #[error("unable to seal, index block state: {0}")]
    SealIllegalState(String),

    /// Evict attempted on a block that is not sealed
    #[error("unable to evict mutable segments, block must be sealed, found: {0}")]
    EvictIllegalState(String),

    /// Bootstrap fulfilled ranges extend outside the block window
    #[error("fulfilled range [{min}, {max}) is outside of index block range [{start}, {end})")]
    RangeOutsideBlock {
        min: i64,
        max: i64,
        start: i64,
        end: i64,
    },

    /// Internal contract broken; reported, never retried
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Insert attempted on a sealed segment
    #[error("unable to insert, segment is sealed")]
    SegmentSealed,

    /// Seal attempted on an already sealed segment
    #[error("segment is already sealed")]
    SegmentAlreadySealed,

    /// FST transform requires a sealed source segment
    #[error("segment is not sealed")]
    SegmentNotSealed,

    /// Operation attempted on a closed segment
    #[error("segment is closed")]
    SegmentClosed,

    /// Document id already present in the segment
    #[error("duplicate document id")]
    DuplicateDocId,

    /// Document has an empty id
    #[error("document id is empty")]
    EmptyDocId,

    /// Some entries of a write batch failed; per-index errors attached
    #[error("{0}")]
    PartialBatch(BatchPartialError),

    /// Several failures collected from one sweep
    #[error("{0}")]
    Multi(MultiError),

    /// Segment file contents failed validation
    #[error("segment corruption: {0}")]
    Corruption(String),

    /// IO operation failed
    #[error("io error: {0}")]
    Io(String),

    /// FST build or lookup failed
    #[error("fst error: {0}")]
    Fst(String),

    /// Serialization failed
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        IndexError::Io(err.to_string())
    }
}

impl From<fst::Error> for IndexError {
    fn from(err: fst::Error) -> Self {
        IndexError::Fst(err.to_string())
    }
}

impl From<bincode::Error> for IndexError {
    fn from(err: bincode::Error) -> Self {
        IndexError::Encoding(err.to_string())
    }
}

/// One failed entry inside a batch insert
#[derive(Debug, Clone, PartialEq)]
pub struct BatchError {
    /// Position of the failed document within the submitted batch
    pub index: usize,
    /// Why it failed
    pub err: IndexError,
}

/// Partial failure of a batch insert: the named indices failed, the rest
/// were applied.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchPartialError {
    errs: Vec<BatchError>,
}

impl BatchPartialError {
    /// Create an empty partial error
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed entry
    pub fn add(&mut self, index: usize, err: IndexError) {
        self.errs.push(BatchError { index, err });
    }

    /// The failed entries
    pub fn errs(&self) -> &[BatchError] {
        &self.errs
    }

    /// Whether any entry failed
    pub fn is_empty(&self) -> bool {
        self.errs.is_empty()
    }

    /// Number of failed entries
    pub fn len(&self) -> usize {
        self.errs.len()
    }
}

impl fmt::Display for BatchPartialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unable to insert {} batch entries: [", self.errs.len())?;
        for (i, e) in self.errs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "index {}: {}", e.index, e.err)?;
        }
        write!(f, "]")
    }
}

/// Collects several errors from one sweep (seal/evict/close) into one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiError {
    errors: Vec<IndexError>,
}

impl MultiError {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn add(&mut self, err: IndexError) {
        self.errors.push(err);
    }

    /// Record the error of a failed result, if any
    pub fn add_result<T>(&mut self, result: Result<T>) {
        if let Err(err) = result {
            self.errors.push(err);
        }
    }

    /// Whether any error was recorded
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse into a final result: `Ok` if nothing was recorded, the sole
    /// error if exactly one was, the aggregate otherwise.
    pub fn final_result(self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.into_iter().next().expect("len checked")),
            _ => Err(IndexError::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred: [", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, "]")
    }
}
