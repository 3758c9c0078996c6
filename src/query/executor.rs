//! Query execution over acquired segment readers
//!
//! The executor owns one reader per segment and evaluates the query one
//! reader at a time, so a limited query never touches segments past the
//! one that filled the limit. Everything releases through `Drop`.

use roaring::RoaringBitmap;

use crate::error::Result;
use crate::query::Query;
use crate::segment::SegmentReader;
use crate::types::Document;

/// Evaluate a query against one reader's snapshot, yielding matching
/// document positions.
fn eval(reader: &dyn SegmentReader, query: &Query) -> Result<RoaringBitmap> {
    match query {
        Query::All => Ok(universe(reader)),
        Query::Term { field, value } => reader.postings(field, value),
        Query::Conjunction(queries) => {
            // identity for intersection is the full snapshot
            let mut acc = universe(reader);
            for q in queries {
                if acc.is_empty() {
                    break;
                }
                acc &= eval(reader, q)?;
            }
            Ok(acc)
        }
        Query::Disjunction(queries) => {
            let mut acc = RoaringBitmap::new();
            for q in queries {
                acc |= eval(reader, q)?;
            }
            Ok(acc)
        }
        Query::Negation(query) => {
            let mut acc = universe(reader);
            acc -= eval(reader, query.as_ref())?;
            Ok(acc)
        }
    }
}

fn universe(reader: &dyn SegmentReader) -> RoaringBitmap {
    let mut bitmap = RoaringBitmap::new();
    bitmap.insert_range(0..reader.doc_limit());
    bitmap
}

/// Executes queries over a set of segment readers
pub struct Executor {
    readers: Vec<Box<dyn SegmentReader>>,
}

impl Executor {
    /// Create an executor owning the given readers
    pub fn new(readers: Vec<Box<dyn SegmentReader>>) -> Self {
        Self { readers }
    }

    /// Run a query, returning a lazy iterator over matching documents
    pub fn execute<'a>(&'a self, query: &'a Query) -> DocumentIterator<'a> {
        DocumentIterator {
            readers: &self.readers,
            query,
            next_reader: 0,
            current_reader: 0,
            current: None,
            failed: false,
        }
    }
}

/// Lazy iterator over the documents matching a query
pub struct DocumentIterator<'a> {
    readers: &'a [Box<dyn SegmentReader>],
    query: &'a Query,
    next_reader: usize,
    current_reader: usize,
    current: Option<roaring::bitmap::IntoIter>,
    failed: bool,
}

impl Iterator for DocumentIterator<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(positions) = &mut self.current {
                if let Some(pos) = positions.next() {
                    match self.readers[self.current_reader].doc(pos) {
                        Ok(doc) => return Some(Ok(doc)),
                        Err(err) => {
                            self.failed = true;
                            return Some(Err(err));
                        }
                    }
                }
                self.current = None;
            }

            if self.next_reader >= self.readers.len() {
                return None;
            }
            self.current_reader = self.next_reader;
            self.next_reader += 1;

            match eval(self.readers[self.current_reader].as_ref(), self.query) {
                Ok(bitmap) => self.current = Some(bitmap.into_iter()),
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
