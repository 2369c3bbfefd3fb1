use crate::{DocId, SparseVector, Timestamp};
use serde::{Deserialize, Serialize};

/// An ingested document. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    /// Logical ingestion sequence number, not wall-clock time.
    pub timestamp: Timestamp,
    /// Original text or an external reference, returned with search hits.
    pub payload: Option<String>,
    pub vector: SparseVector,
}

impl Document {
    pub fn nnz(&self) -> usize { self.vector.len() }
}

/// Id and logical clock allocation for one index.
///
/// Both counters are persisted with every commit, so ids handed out after a
/// reopen are strictly greater than every id ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocator {
    pub next_id: DocId,
    pub next_timestamp: Timestamp,
}

impl Default for Allocator {
    fn default() -> Self { Self { next_id: 1, next_timestamp: 1 } }
}

impl Allocator {
    /// Hand out the next id and timestamp. Callers commit the advanced
    /// allocator only once the document is durable.
    pub fn allocate(&mut self) -> (DocId, Timestamp) {
        let out = (self.next_id, self.next_timestamp);
        self.next_id += 1;
        self.next_timestamp += 1;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_strictly_increasing() {
        let mut alloc = Allocator::default();
        let (a, ta) = alloc.allocate();
        let (b, tb) = alloc.allocate();
        assert_eq!(a, 1);
        assert!(b > a);
        assert!(tb > ta);
    }

    #[test]
    fn resumes_from_persisted_counters() {
        let mut alloc = Allocator { next_id: 42, next_timestamp: 100 };
        assert_eq!(alloc.allocate(), (42, 100));
        assert_eq!(alloc, Allocator { next_id: 43, next_timestamp: 101 });
    }
}
