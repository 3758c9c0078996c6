//! FST transform: sealed mutable segment -> mmap-backed FST segment

use std::io::{BufWriter, Write};

use fst::MapBuilder;
use tempfile::NamedTempFile;

use crate::error::{IndexError, Result};
use crate::options::FstSegmentOptions;
use crate::segment::fst::{encode_term_key, FstSegment, HEADER_LEN, MAGIC, VERSION};
use crate::segment::mem::MemSegment;

/// Transform a sealed mutable segment into an mmap-backed FST segment.
///
/// The source may be closed once this returns successfully; the FST
/// segment carries all of its data.
pub fn transform_and_mmap(
    source: &MemSegment,
    opts: &FstSegmentOptions,
) -> Result<FstSegment> {
    if !source.is_sealed() {
        return Err(IndexError::SegmentNotSealed);
    }

    let (docs, terms) = source.export();

    // postings region: length-prefixed roaring blocks, offsets fed to the FST
    let mut keyed: Vec<(Vec<u8>, &roaring::RoaringBitmap)> = terms
        .iter()
        .map(|((field, value), bitmap)| (encode_term_key(field, value), bitmap))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));

    let mut postings_region = Vec::new();
    let mut builder = MapBuilder::memory();
    for (key, bitmap) in keyed {
        let offset = postings_region.len() as u64;
        let mut block = Vec::with_capacity(bitmap.serialized_size());
        bitmap
            .serialize_into(&mut block)
            .map_err(|e| IndexError::Encoding(format!("posting block: {}", e)))?;
        postings_region.extend_from_slice(&(block.len() as u32).to_le_bytes());
        postings_region.extend_from_slice(&block);
        builder.insert(key, offset)?;
    }
    let fst_region = builder.into_inner()?;

    // doc-offset table + length-prefixed document region
    let mut doc_index = Vec::with_capacity(docs.len() * 8);
    let mut docs_region = Vec::new();
    for doc in &docs {
        doc_index.extend_from_slice(&(docs_region.len() as u64).to_le_bytes());
        let blob = bincode::serialize(doc)?;
        docs_region.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        docs_region.extend_from_slice(&blob);
    }

    let file = NamedTempFile::new_in(opts.scratch_dir())?;
    let mut writer = BufWriter::new(file.as_file());
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&MAGIC.to_le_bytes());
    header.extend_from_slice(&VERSION.to_le_bytes());
    header.extend_from_slice(&(docs.len() as u32).to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(&(fst_region.len() as u64).to_le_bytes());
    header.extend_from_slice(&(postings_region.len() as u64).to_le_bytes());
    header.extend_from_slice(&(doc_index.len() as u64).to_le_bytes());
    header.extend_from_slice(&(docs_region.len() as u64).to_le_bytes());

    writer.write_all(&header)?;
    writer.write_all(&fst_region)?;
    writer.write_all(&postings_region)?;
    writer.write_all(&doc_index)?;
    writer.write_all(&docs_region)?;
    writer.flush()?;
    drop(writer);

    FstSegment::open(file)
}
