//! Top-k dot-product scoring over a snapshot.
//!
//! Two strategies produce identical rankings: exhaustive term-at-a-time
//! accumulation, and MaxScore doc-at-a-time traversal that skips documents
//! whose score upper bound cannot reach the current k-th best. Both sum a
//! document's contributions in ascending term id order, so scores agree bit
//! for bit.

use crate::index::{Posting, Snapshot};
use crate::{DocId, Error, Result, SparseVector, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Relative slack applied to score upper bounds before pruning, covering f32
/// rounding differences between bound sums and real scores.
const BOUND_SLACK: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Equal scores rank the lower document id first.
    #[default]
    DocIdAsc,
    /// Equal scores rank the most recently ingested document first.
    Recency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    MaxScore,
    Exhaustive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub k: usize,
    #[serde(default)]
    pub tie_break: TieBreak,
    #[serde(default)]
    pub strategy: Strategy,
}

impl QueryOptions {
    pub fn top(k: usize) -> Self { Self { k, tie_break: TieBreak::default(), strategy: Strategy::default() } }

    pub fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_id: DocId,
    pub score: f32,
    pub timestamp: Timestamp,
    pub payload: Option<String>,
}

/// A candidate in rank order: `Less` means ranks higher.
#[derive(Debug, Clone, Copy)]
struct Ranked {
    doc_id: DocId,
    score: f32,
    tie_key: u64,
}

impl Ranked {
    fn new(doc_id: DocId, score: f32, tie_break: TieBreak) -> Self {
        // Timestamps grow with ids, so recency is descending id.
        let tie_key = match tie_break {
            TieBreak::DocIdAsc => doc_id,
            TieBreak::Recency => u64::MAX - doc_id,
        };
        Self { doc_id, score, tie_key }
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool { self.cmp(other) == Ordering::Equal }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        other.score.total_cmp(&self.score).then_with(|| self.tie_key.cmp(&other.tie_key))
    }
}

/// Bounded collector; the heap top is the worst hit kept so far.
struct TopK {
    k: usize,
    tie_break: TieBreak,
    heap: BinaryHeap<Ranked>,
}

impl TopK {
    fn new(k: usize, tie_break: TieBreak) -> Self { Self { k, tie_break, heap: BinaryHeap::with_capacity(k.min(1024) + 1) } }

    fn offer(&mut self, doc_id: DocId, score: f32) {
        let r = Ranked::new(doc_id, score, self.tie_break);
        if self.heap.len() < self.k {
            self.heap.push(r);
        } else if self.heap.peek().is_some_and(|worst| r < *worst) {
            self.heap.pop();
            self.heap.push(r);
        }
    }

    /// Score of the k-th best hit once k hits are held.
    fn threshold(&self) -> Option<f32> {
        if self.heap.len() < self.k { None } else { self.heap.peek().map(|r| r.score) }
    }

    fn into_sorted(self) -> Vec<Ranked> { self.heap.into_sorted_vec() }
}

/// One query term's postings across every segment of a snapshot.
struct TermCursor<'a> {
    /// Position of the term in the query's ascending term order.
    slot: usize,
    query_weight: f32,
    upper_bound: f32,
    lists: Vec<&'a [Posting]>,
    seg: usize,
    pos: usize,
}

impl<'a> TermCursor<'a> {
    fn current(&self) -> Option<&'a Posting> { self.lists.get(self.seg).copied().and_then(|l| l.get(self.pos)) }

    fn advance(&mut self) {
        if let Some(list) = self.lists.get(self.seg) {
            self.pos += 1;
            if self.pos >= list.len() {
                self.seg += 1;
                self.pos = 0;
            }
        }
    }

    /// Move to the first posting with doc id >= `target`.
    fn seek(&mut self, target: DocId) {
        while let Some(list) = self.lists.get(self.seg) {
            if list.last().map_or(true, |p| p.doc_id < target) {
                self.seg += 1;
                self.pos = 0;
                continue;
            }
            self.pos += list[self.pos..].partition_point(|p| p.doc_id < target);
            return;
        }
    }
}

fn loosen(bound: f32) -> f32 { bound * (1.0 + BOUND_SLACK) + f32::MIN_POSITIVE }

/// Scores a query vector against one snapshot.
pub struct QueryEngine<'a> {
    snapshot: &'a Snapshot,
}

impl<'a> QueryEngine<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self { Self { snapshot } }

    pub fn search(&self, query: &SparseVector, opts: &QueryOptions) -> Result<Vec<SearchHit>> {
        if opts.k == 0 {
            return Err(Error::InvalidArgument("k must be positive".into()));
        }
        if query.is_empty() {
            return Err(Error::EmptyQueryVector);
        }
        let ranked = match opts.strategy {
            Strategy::Exhaustive => self.exhaustive(query, opts),
            Strategy::MaxScore => self.max_score(query, opts),
        };
        Ok(ranked
            .into_iter()
            .filter_map(|r| {
                self.snapshot.document(r.doc_id).map(|doc| SearchHit {
                    doc_id: r.doc_id,
                    score: r.score,
                    timestamp: doc.timestamp,
                    payload: doc.payload.clone(),
                })
            })
            .collect())
    }

    /// Union of all posting lists, accumulated per document, then a full sort.
    fn exhaustive(&self, query: &SparseVector, opts: &QueryOptions) -> Vec<Ranked> {
        let mut scores: HashMap<DocId, f32> = HashMap::new();
        for (term_id, qw) in query.iter() {
            for seg in self.snapshot.segments() {
                if let Some(list) = seg.postings(term_id) {
                    for p in &list.entries {
                        *scores.entry(p.doc_id).or_insert(0.0) += qw * p.weight;
                    }
                }
            }
        }
        let mut ranked: Vec<Ranked> =
            scores.into_iter().map(|(doc_id, score)| Ranked::new(doc_id, score, opts.tie_break)).collect();
        ranked.sort();
        ranked.truncate(opts.k);
        ranked
    }

    fn cursors(&self, query: &SparseVector) -> Vec<TermCursor<'a>> {
        let snapshot: &'a Snapshot = self.snapshot;
        query
            .iter()
            .enumerate()
            .filter_map(|(slot, (term_id, qw))| {
                let lists: Vec<&'a [Posting]> = snapshot
                    .segments()
                    .iter()
                    .filter_map(|s| s.postings(term_id))
                    .filter(|l| !l.entries.is_empty())
                    .map(|l| l.entries.as_slice())
                    .collect();
                if lists.is_empty() {
                    return None;
                }
                let upper_bound = qw * snapshot.max_weight(term_id);
                Some(TermCursor { slot, query_weight: qw, upper_bound, lists, seg: 0, pos: 0 })
            })
            .collect()
    }

    fn max_score(&self, query: &SparseVector, opts: &QueryOptions) -> Vec<Ranked> {
        let mut cursors = self.cursors(query);
        if cursors.is_empty() {
            return Vec::new();
        }
        cursors.sort_by(|a, b| a.upper_bound.total_cmp(&b.upper_bound));
        // prefix[i]: best total any document can collect from cursors[0..=i]
        let prefix: Vec<f32> = cursors
            .iter()
            .scan(0.0f32, |acc, c| {
                *acc += c.upper_bound;
                Some(*acc)
            })
            .collect();

        let query_weights: Vec<f32> = query.iter().map(|(_, w)| w).collect();
        let mut matched: Vec<Option<f32>> = vec![None; query_weights.len()];
        let mut top = TopK::new(opts.k, opts.tie_break);

        loop {
            let threshold = top.threshold();
            // Terms before `essential` cannot lift a document past the threshold on their own.
            let essential = match threshold {
                Some(t) => prefix.iter().take_while(|&&b| loosen(b) < t).count(),
                None => 0,
            };
            if essential == cursors.len() {
                break;
            }
            let Some(candidate) = cursors[essential..].iter().filter_map(|c| c.current()).map(|p| p.doc_id).min()
            else {
                break;
            };

            matched.iter_mut().for_each(|m| *m = None);
            let mut partial = 0.0f32;
            for c in cursors[essential..].iter_mut() {
                if let Some(p) = c.current().filter(|p| p.doc_id == candidate) {
                    matched[c.slot] = Some(p.weight);
                    partial += c.query_weight * p.weight;
                    c.advance();
                }
            }

            let mut pruned = false;
            if let Some(t) = threshold {
                for i in (0..essential).rev() {
                    if loosen(partial + prefix[i]) < t {
                        pruned = true;
                        break;
                    }
                    let c = &mut cursors[i];
                    c.seek(candidate);
                    if let Some(p) = c.current().filter(|p| p.doc_id == candidate) {
                        matched[c.slot] = Some(p.weight);
                        partial += c.query_weight * p.weight;
                    }
                }
            }
            if pruned {
                continue;
            }

            let mut score = 0.0f32;
            for (qw, dw) in query_weights.iter().zip(&matched) {
                if let Some(dw) = dw {
                    score += qw * dw;
                }
            }
            top.offer(candidate, score);
        }
        top.into_sorted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::Document;
    use crate::TermId;
    use std::sync::Arc;

    fn snapshot_of(vectors: &[&[(TermId, f32)]]) -> Snapshot {
        let mut snap = Snapshot::default();
        for (i, pairs) in vectors.iter().enumerate() {
            let id = i as DocId + 1;
            let vector = SparseVector::from_pairs(8, pairs.iter().copied()).unwrap();
            snap = snap.with_documents(vec![Arc::new(Document { id, timestamp: id, payload: None, vector })]);
        }
        snap
    }

    fn q(pairs: &[(TermId, f32)]) -> SparseVector { SparseVector::from_pairs(8, pairs.iter().copied()).unwrap() }

    fn ids(hits: &[SearchHit]) -> Vec<DocId> { hits.iter().map(|h| h.doc_id).collect() }

    #[test]
    fn scores_are_dot_products() {
        let snap = snapshot_of(&[&[(1, 1.0), (3, 0.5)], &[(1, 0.2), (5, 0.9)]]);
        let engine = QueryEngine::new(&snap);
        for strategy in [Strategy::MaxScore, Strategy::Exhaustive] {
            let hits = engine.search(&q(&[(1, 1.0)]), &QueryOptions::top(10).strategy(strategy)).unwrap();
            assert_eq!(ids(&hits), vec![1, 2]);
            assert_eq!(hits[0].score, 1.0);
            assert!((hits[1].score - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn non_matching_documents_are_excluded() {
        let snap = snapshot_of(&[&[(1, 1.0)], &[(2, 1.0)], &[(3, 1.0)]]);
        let hits = QueryEngine::new(&snap).search(&q(&[(2, 1.0), (7, 1.0)]), &QueryOptions::top(10)).unwrap();
        assert_eq!(ids(&hits), vec![2]);
    }

    #[test]
    fn unknown_terms_give_empty_results() {
        let snap = snapshot_of(&[&[(1, 1.0)]]);
        let hits = QueryEngine::new(&snap).search(&q(&[(6, 1.0), (7, 2.0)]), &QueryOptions::top(3)).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn ties_break_by_id_or_recency() {
        let snap = snapshot_of(&[&[(1, 0.5)], &[(1, 0.5)], &[(1, 0.5)]]);
        let engine = QueryEngine::new(&snap);
        let asc = engine.search(&q(&[(1, 1.0)]), &QueryOptions::top(2)).unwrap();
        assert_eq!(ids(&asc), vec![1, 2]);
        let recent = engine.search(&q(&[(1, 1.0)]), &QueryOptions::top(2).tie_break(TieBreak::Recency)).unwrap();
        assert_eq!(ids(&recent), vec![3, 2]);
    }

    #[test]
    fn rejects_zero_k_and_empty_query() {
        let snap = snapshot_of(&[&[(1, 1.0)]]);
        let engine = QueryEngine::new(&snap);
        assert!(matches!(engine.search(&q(&[(1, 1.0)]), &QueryOptions::top(0)), Err(Error::InvalidArgument(_))));
        assert!(matches!(engine.search(&q(&[]), &QueryOptions::top(1)), Err(Error::EmptyQueryVector)));
    }

    #[test]
    fn max_score_matches_exhaustive_with_pruning() {
        let docs: Vec<Vec<(TermId, f32)>> = (0..200u32)
            .map(|i| {
                vec![
                    (i % 8, ((i * 37) % 11) as f32 / 10.0 + 0.1),
                    ((i / 3) % 8, ((i * 13) % 7) as f32 / 7.0 + 0.05),
                ]
            })
            .collect();
        let refs: Vec<&[(TermId, f32)]> = docs.iter().map(|d| d.as_slice()).collect();
        let snap = snapshot_of(&refs);
        let engine = QueryEngine::new(&snap);
        let query = q(&[(0, 0.3), (2, 1.5), (5, 0.7), (7, 0.01)]);
        for k in [1, 3, 10, 50, 500] {
            for tie in [TieBreak::DocIdAsc, TieBreak::Recency] {
                let a = engine.search(&query, &QueryOptions::top(k).tie_break(tie)).unwrap();
                let b = engine
                    .search(&query, &QueryOptions::top(k).tie_break(tie).strategy(Strategy::Exhaustive))
                    .unwrap();
                assert_eq!(a, b, "k={k} tie={tie:?}");
            }
        }
    }

    #[test]
    fn hits_carry_timestamp_and_payload() {
        let mut snap = Snapshot::default();
        let vector = q(&[(4, 2.0)]);
        snap = snap.with_documents(vec![Arc::new(Document {
            id: 7,
            timestamp: 11,
            payload: Some("hello".into()),
            vector,
        })]);
        let hits = QueryEngine::new(&snap).search(&q(&[(4, 1.0)]), &QueryOptions::top(1)).unwrap();
        assert_eq!(hits[0].timestamp, 11);
        assert_eq!(hits[0].payload.as_deref(), Some("hello"));
    }
}
