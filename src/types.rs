//! Core types for the index block engine

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Shard identifier
pub type ShardId = u32;

/// Current wall-clock time in nanoseconds
pub fn now_nanos() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Closed-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if the range covers no time
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The overlapping portion of two ranges, if any
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let range = TimeRange::new(self.start.max(other.start), self.end.min(other.end));
        if range.is_empty() {
            None
        } else {
            Some(range)
        }
    }

    /// Remove `other` from this range, yielding the uncovered fragments
    /// (zero, one, or two of them).
    pub fn subtract(&self, other: &TimeRange) -> Vec<TimeRange> {
        if !self.overlaps(other) {
            return vec![*self];
        }
        let mut out = Vec::new();
        if self.start < other.start {
            out.push(TimeRange::new(self.start, other.start));
        }
        if other.end < self.end {
            out.push(TimeRange::new(other.end, self.end));
        }
        out
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Per-shard time coverage: which `[start, end)` ranges of which shards a
/// set of segments completely covers.
///
/// Range lists are kept normalized (sorted by start, overlapping and
/// adjacent ranges coalesced).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTimeRanges {
    ranges: BTreeMap<ShardId, Vec<TimeRange>>,
}

impl ShardTimeRanges {
    /// Create an empty coverage map
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a coverage map with a single shard range
    pub fn with_range(shard: ShardId, range: TimeRange) -> Self {
        let mut s = Self::new();
        s.add_range(shard, range);
        s
    }

    /// Add one range for a shard
    pub fn add_range(&mut self, shard: ShardId, range: TimeRange) {
        if range.is_empty() {
            return;
        }
        let list = self.ranges.entry(shard).or_default();
        list.push(range);
        *list = normalize(std::mem::take(list));
    }

    /// Union another coverage map into this one
    pub fn add_ranges(&mut self, other: &ShardTimeRanges) {
        for (&shard, list) in &other.ranges {
            for range in list {
                self.add_range(shard, *range);
            }
        }
    }

    /// Remove another coverage map's ranges from this one
    pub fn subtract(&mut self, other: &ShardTimeRanges) {
        for (&shard, sub_list) in &other.ranges {
            if let Some(list) = self.ranges.get_mut(&shard) {
                let mut remaining = std::mem::take(list);
                for sub in sub_list {
                    remaining = remaining
                        .iter()
                        .flat_map(|r| r.subtract(sub))
                        .collect();
                }
                *list = remaining;
            }
        }
        self.ranges.retain(|_, list| !list.is_empty());
    }

    /// Check if no shard has any coverage
    pub fn is_empty(&self) -> bool {
        self.ranges.values().all(|l| l.is_empty())
    }

    /// The earliest start and latest end across every shard
    pub fn min_max(&self) -> Option<(Timestamp, Timestamp)> {
        let mut min = None;
        let mut max = None;
        for list in self.ranges.values() {
            for range in list {
                min = Some(min.map_or(range.start, |m: Timestamp| m.min(range.start)));
                max = Some(max.map_or(range.end, |m: Timestamp| m.max(range.end)));
            }
        }
        Some((min?, max?))
    }

    /// Iterate over shards and their ranges
    pub fn iter(&self) -> impl Iterator<Item = (ShardId, &[TimeRange])> {
        self.ranges.iter().map(|(&s, l)| (s, l.as_slice()))
    }

    /// Number of shards with coverage
    pub fn num_shards(&self) -> usize {
        self.ranges.len()
    }
}

impl fmt::Display for ShardTimeRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (shard, list)) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: ", shard)?;
            for (j, range) in list.iter().enumerate() {
                if j > 0 {
                    write!(f, "+")?;
                }
                write!(f, "{}", range)?;
            }
        }
        write!(f, "}}")
    }
}

fn normalize(mut list: Vec<TimeRange>) -> Vec<TimeRange> {
    list.retain(|r| !r.is_empty());
    list.sort_by_key(|r| r.start);
    let mut out: Vec<TimeRange> = Vec::with_capacity(list.len());
    for range in list {
        match out.last_mut() {
            Some(last) if range.start <= last.end => {
                last.end = last.end.max(range.end);
            }
            _ => out.push(range),
        }
    }
    out
}

/// A document to index: one time series, identified by its series id and
/// described by its tag name/value pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Series id; unique within a block
    pub id: Bytes,
    /// Tag name/value pairs
    pub fields: Vec<Field>,
}

impl Document {
    /// Create a document with no fields
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field
    pub fn with_field(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Look up a field value by name
    pub fn get(&self, name: &[u8]) -> Option<&Bytes> {
        self.fields
            .iter()
            .find(|f| f.name.as_ref() == name)
            .map(|f| &f.value)
    }
}

/// A single tag name/value pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Tag name
    pub name: Bytes,
    /// Tag value
    pub value: Bytes,
}

/// Namespace metadata the block needs: its name and the index block size.
#[derive(Debug, Clone)]
pub struct NamespaceMetadata {
    /// Namespace name
    pub name: String,
    /// Width of each index block window
    pub index_block_size: std::time::Duration,
}

impl NamespaceMetadata {
    /// Create namespace metadata
    pub fn new(name: impl Into<String>, index_block_size: std::time::Duration) -> Self {
        Self {
            name: name.into(),
            index_block_size,
        }
    }
}
