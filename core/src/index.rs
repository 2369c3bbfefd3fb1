//! In-memory inverted index.
//!
//! Postings live in immutable segments. Each segment covers a contiguous,
//! ascending range of document ids and owns the documents in that range, so a
//! document and its postings always become visible together. A [`Snapshot`] is
//! the ordered list of segments at one point in time; writers publish new
//! snapshots while readers keep whichever one they started with.

use crate::docs::Document;
use crate::{DocId, TermId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: DocId,
    pub weight: f32,
}

/// One term's postings within a segment, sorted by doc id.
#[derive(Debug, Clone, Default)]
pub struct PostingList {
    pub entries: Vec<Posting>,
    pub max_weight: f32,
}

impl PostingList {
    fn push(&mut self, p: Posting) {
        if p.weight > self.max_weight { self.max_weight = p.weight; }
        self.entries.push(p);
    }
}

#[derive(Debug, Default)]
pub struct Segment {
    docs: Vec<Arc<Document>>,
    postings: HashMap<TermId, PostingList>,
    num_postings: usize,
}

impl Segment {
    /// `docs` must be sorted by id.
    pub fn from_documents(docs: Vec<Arc<Document>>) -> Self {
        let mut postings: HashMap<TermId, PostingList> = HashMap::new();
        let mut num_postings = 0;
        for doc in &docs {
            for (term_id, weight) in doc.vector.iter() {
                postings.entry(term_id).or_default().push(Posting { doc_id: doc.id, weight });
                num_postings += 1;
            }
        }
        Self { docs, postings, num_postings }
    }

    /// Concatenate two adjacent segments; `older` must precede `newer` in id order.
    pub fn merge(older: &Segment, newer: &Segment) -> Self {
        let mut postings = older.postings.clone();
        for (term_id, list) in &newer.postings {
            let slot = postings.entry(*term_id).or_default();
            slot.entries.extend_from_slice(&list.entries);
            if list.max_weight > slot.max_weight { slot.max_weight = list.max_weight; }
        }
        let mut docs = Vec::with_capacity(older.docs.len() + newer.docs.len());
        docs.extend(older.docs.iter().cloned());
        docs.extend(newer.docs.iter().cloned());
        Self { docs, postings, num_postings: older.num_postings + newer.num_postings }
    }

    pub fn num_docs(&self) -> usize { self.docs.len() }

    pub fn postings(&self, term_id: TermId) -> Option<&PostingList> { self.postings.get(&term_id) }

    pub fn document(&self, doc_id: DocId) -> Option<&Arc<Document>> {
        self.docs.binary_search_by_key(&doc_id, |d| d.id).ok().map(|i| &self.docs[i])
    }

    fn first_id(&self) -> Option<DocId> { self.docs.first().map(|d| d.id) }
}

/// Point-in-time view of the whole posting store.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    segments: Vec<Arc<Segment>>,
}

impl Snapshot {
    /// A new snapshot with `docs` appended as a fresh segment.
    ///
    /// Trailing segments are merged while the older one is no larger than the
    /// newer, which keeps the segment count logarithmic in the document count.
    pub fn with_documents(&self, docs: Vec<Arc<Document>>) -> Snapshot {
        if docs.is_empty() {
            return self.clone();
        }
        let mut segments = self.segments.clone();
        segments.push(Arc::new(Segment::from_documents(docs)));
        while let [.., older, newer] = segments.as_slice() {
            if older.num_docs() > newer.num_docs() { break; }
            let merged = Arc::new(Segment::merge(older, newer));
            segments.truncate(segments.len() - 2);
            segments.push(merged);
        }
        Snapshot { segments }
    }

    pub fn segments(&self) -> &[Arc<Segment>] { &self.segments }

    /// All postings for `term_id` in doc id order.
    pub fn lookup(&self, term_id: TermId) -> Vec<Posting> {
        self.segments
            .iter()
            .filter_map(|s| s.postings(term_id))
            .flat_map(|l| l.entries.iter().copied())
            .collect()
    }

    /// Highest-weight postings first; ties by ascending doc id.
    pub fn top_entries(&self, term_id: TermId, limit: usize) -> Vec<Posting> {
        let mut all = self.lookup(term_id);
        all.sort_by(|a, b| b.weight.total_cmp(&a.weight).then(a.doc_id.cmp(&b.doc_id)));
        all.truncate(limit);
        all
    }

    pub fn max_weight(&self, term_id: TermId) -> f32 {
        self.segments
            .iter()
            .filter_map(|s| s.postings(term_id))
            .map(|l| l.max_weight)
            .fold(0.0, f32::max)
    }

    pub fn document(&self, doc_id: DocId) -> Option<Arc<Document>> {
        let idx = self.segments.partition_point(|s| s.first_id().is_some_and(|f| f <= doc_id));
        idx.checked_sub(1).and_then(|i| self.segments[i].document(doc_id)).cloned()
    }

    /// Documents newest first.
    pub fn documents_rev(&self) -> impl Iterator<Item = &Arc<Document>> + '_ {
        self.segments.iter().rev().flat_map(|s| s.docs.iter().rev())
    }

    pub fn num_docs(&self) -> usize { self.segments.iter().map(|s| s.num_docs()).sum() }

    pub fn num_postings(&self) -> usize { self.segments.iter().map(|s| s.num_postings).sum() }

    pub fn num_terms(&self) -> usize {
        let mut terms: HashSet<TermId> = HashSet::new();
        for seg in &self.segments {
            terms.extend(seg.postings.keys().copied());
        }
        terms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SparseVector;

    fn doc(id: DocId, pairs: &[(TermId, f32)]) -> Arc<Document> {
        Arc::new(Document {
            id,
            timestamp: id,
            payload: None,
            vector: SparseVector::from_pairs(16, pairs.iter().copied()).unwrap(),
        })
    }

    fn build(n: u64) -> Snapshot {
        let mut snap = Snapshot::default();
        for id in 1..=n {
            snap = snap.with_documents(vec![doc(id, &[(1, id as f32), ((id % 4) as TermId + 2, 0.5)])]);
        }
        snap
    }

    #[test]
    fn lookup_returns_postings_in_doc_order() {
        let snap = build(10);
        let ids: Vec<DocId> = snap.lookup(1).iter().map(|p| p.doc_id).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
        assert!(snap.lookup(15).is_empty());
    }

    #[test]
    fn segment_count_stays_logarithmic() {
        let snap = build(1000);
        assert_eq!(snap.num_docs(), 1000);
        assert!(snap.segments().len() <= 11);
    }

    #[test]
    fn top_entries_by_weight() {
        let snap = build(10);
        let top = snap.top_entries(1, 3);
        assert_eq!(top.iter().map(|p| p.doc_id).collect::<Vec<_>>(), vec![10, 9, 8]);
        assert_eq!(snap.max_weight(1), 10.0);
        assert_eq!(snap.max_weight(14), 0.0);
    }

    #[test]
    fn document_lookup_across_segments() {
        let snap = build(37);
        for id in 1..=37 {
            assert_eq!(snap.document(id).unwrap().id, id);
        }
        assert!(snap.document(0).is_none());
        assert!(snap.document(38).is_none());
    }

    #[test]
    fn old_snapshot_is_unaffected_by_appends() {
        let before = build(3);
        let after = before.with_documents(vec![doc(4, &[(1, 9.0)])]);
        assert_eq!(before.num_docs(), 3);
        assert_eq!(before.lookup(1).len(), 3);
        assert_eq!(after.lookup(1).len(), 4);
    }

    #[test]
    fn counts_terms_and_postings() {
        let snap = build(8);
        assert_eq!(snap.num_postings(), 16);
        assert_eq!(snap.num_terms(), 5);
    }
}
