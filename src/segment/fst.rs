//! Immutable mmap-backed FST segment
//!
//! On-disk layout (little-endian):
//!
//! ```text
//! magic u32 | version u32 | doc_count u32 | reserved u32
//! fst_len u64 | postings_len u64 | doc_index_len u64 | docs_len u64
//! [fst region][postings region][doc-offset table][doc region]
//! ```
//!
//! The FST maps a term key (`field NUL value`) to the byte offset of its
//! posting block inside the postings region; blocks and documents are
//! length-prefixed. The whole file is mapped read-only and shared with
//! readers through an `Arc`, so closing the segment never invalidates a
//! reader already handed out.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::Mmap;
use roaring::RoaringBitmap;
use tempfile::NamedTempFile;

use crate::error::{IndexError, Result};
use crate::segment::{ReaderCount, ReaderGuard, Segment, SegmentReader};
use crate::types::Document;

pub(crate) const MAGIC: u32 = 0x5844_4954; // "TIDX"
pub(crate) const VERSION: u32 = 1;
pub(crate) const HEADER_LEN: usize = 48;

/// Term keys join field and value with a NUL; field names must not
/// contain NUL.
pub(crate) fn encode_term_key(field: &[u8], value: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(field.len() + 1 + value.len());
    key.extend_from_slice(field);
    key.push(0);
    key.extend_from_slice(value);
    key
}

/// Sealed, immutable segment backed by a memory-mapped file
#[derive(Debug)]
pub struct FstSegment {
    data: Arc<FstData>,
    closed: AtomicBool,
    readers: Arc<ReaderCount>,
}

#[derive(Debug)]
struct FstData {
    // keeps the backing file alive (and deleted on drop) for as long as
    // the mmap or any reader needs it
    _file: NamedTempFile,
    mmap: Arc<Mmap>,
    term_map: fst::Map<MmapSlice>,
    doc_count: u32,
    postings: Range<usize>,
    doc_index: Range<usize>,
    docs: Range<usize>,
}

/// A byte range of a shared mmap, usable as `fst::Map` storage
#[derive(Debug)]
struct MmapSlice {
    mmap: Arc<Mmap>,
    range: Range<usize>,
}

impl AsRef<[u8]> for MmapSlice {
    fn as_ref(&self) -> &[u8] {
        &self.mmap[self.range.clone()]
    }
}

impl FstSegment {
    /// Map a segment file and validate its layout
    pub fn open(file: NamedTempFile) -> Result<Self> {
        let mmap = Arc::new(unsafe { Mmap::map(file.as_file())? });
        let buf: &[u8] = &mmap;

        if buf.len() < HEADER_LEN {
            return Err(IndexError::Corruption(format!(
                "file too short for header: {} bytes",
                buf.len()
            )));
        }
        let magic = read_u32_at(buf, 0)?;
        if magic != MAGIC {
            return Err(IndexError::Corruption(format!(
                "bad magic: {:#x}",
                magic
            )));
        }
        let version = read_u32_at(buf, 4)?;
        if version != VERSION {
            return Err(IndexError::Corruption(format!(
                "unsupported version: {}",
                version
            )));
        }
        let doc_count = read_u32_at(buf, 8)?;
        let fst_len = read_u64_at(buf, 16)? as usize;
        let postings_len = read_u64_at(buf, 24)? as usize;
        let doc_index_len = read_u64_at(buf, 32)? as usize;
        let docs_len = read_u64_at(buf, 40)? as usize;

        let expected = HEADER_LEN + fst_len + postings_len + doc_index_len + docs_len;
        if buf.len() != expected {
            return Err(IndexError::Corruption(format!(
                "file length {} does not match header regions {}",
                buf.len(),
                expected
            )));
        }
        if doc_index_len != doc_count as usize * 8 {
            return Err(IndexError::Corruption(
                "doc-offset table length does not match document count".to_string(),
            ));
        }

        let fst_start = HEADER_LEN;
        let postings_start = fst_start + fst_len;
        let doc_index_start = postings_start + postings_len;
        let docs_start = doc_index_start + doc_index_len;

        let term_map = fst::Map::new(MmapSlice {
            mmap: Arc::clone(&mmap),
            range: fst_start..postings_start,
        })?;

        Ok(Self {
            data: Arc::new(FstData {
                _file: file,
                mmap,
                term_map,
                doc_count,
                postings: postings_start..doc_index_start,
                doc_index: doc_index_start..docs_start,
                docs: docs_start..expected,
            }),
            closed: AtomicBool::new(false),
            readers: Arc::new(ReaderCount::default()),
        })
    }

    /// Number of open readers; observational
    pub fn open_readers(&self) -> usize {
        self.readers.open()
    }
}

impl Segment for FstSegment {
    fn size(&self) -> u64 {
        self.data.doc_count as u64
    }

    fn reader(&self) -> Result<Box<dyn SegmentReader>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IndexError::SegmentClosed);
        }
        Ok(Box::new(FstReader {
            data: Arc::clone(&self.data),
            _guard: self.readers.acquire(),
        }))
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(IndexError::SegmentClosed);
        }
        Ok(())
    }
}

struct FstReader {
    data: Arc<FstData>,
    _guard: ReaderGuard,
}

impl SegmentReader for FstReader {
    fn doc_limit(&self) -> u32 {
        self.data.doc_count
    }

    fn postings(&self, field: &[u8], value: &[u8]) -> Result<RoaringBitmap> {
        let key = encode_term_key(field, value);
        let offset = match self.data.term_map.get(key) {
            Some(offset) => offset as usize,
            None => return Ok(RoaringBitmap::new()),
        };

        let region = &self.data.mmap[self.data.postings.clone()];
        let len = read_u32_at(region, offset)? as usize;
        let start = offset + 4;
        if start + len > region.len() {
            return Err(IndexError::Corruption(format!(
                "posting block at {} overruns region",
                offset
            )));
        }
        RoaringBitmap::deserialize_from(&region[start..start + len])
            .map_err(|e| IndexError::Corruption(format!("posting block: {}", e)))
    }

    fn doc(&self, pos: u32) -> Result<Document> {
        if pos >= self.data.doc_count {
            return Err(IndexError::InvariantViolation(format!(
                "document position {} outside segment of {} docs",
                pos, self.data.doc_count
            )));
        }

        let index = &self.data.mmap[self.data.doc_index.clone()];
        let offset = read_u64_at(index, pos as usize * 8)? as usize;

        let region = &self.data.mmap[self.data.docs.clone()];
        let len = read_u32_at(region, offset)? as usize;
        let start = offset + 4;
        if start + len > region.len() {
            return Err(IndexError::Corruption(format!(
                "document block at {} overruns region",
                offset
            )));
        }
        Ok(bincode::deserialize(&region[start..start + len])?)
    }
}

pub(crate) fn read_u32_at(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or_else(|| IndexError::Corruption(format!("u32 read at {} out of bounds", offset)))?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
}

pub(crate) fn read_u64_at(buf: &[u8], offset: usize) -> Result<u64> {
    let bytes = buf
        .get(offset..offset + 8)
        .ok_or_else(|| IndexError::Corruption(format!("u64 read at {} out of bounds", offset)))?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
}
