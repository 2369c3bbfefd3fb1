use crate::{Error, Result, TermId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A learned sparse term-weight vector with a fixed dimensionality bound.
///
/// Entries are unique by term id, sorted ascending, and carry finite positive
/// weights. Zero weights are implicit and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    dims: usize,
    entries: Vec<(TermId, f32)>,
}

impl SparseVector {
    /// Build from parallel id/weight sequences as emitted by an encoder.
    ///
    /// Repeated ids are merged keeping the maximum weight.
    pub fn new(dims: usize, ids: &[TermId], weights: &[f32]) -> Result<Self> {
        if ids.len() != weights.len() {
            return Err(Error::validation(format!(
                "ids and weights differ in length ({} vs {})",
                ids.len(),
                weights.len()
            )));
        }
        Self::from_pairs(dims, ids.iter().copied().zip(weights.iter().copied()))
    }

    pub fn from_pairs<I>(dims: usize, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (TermId, f32)>,
    {
        if dims == 0 {
            return Err(Error::InvalidArgument("dims must be positive".into()));
        }
        let mut merged: BTreeMap<TermId, f32> = BTreeMap::new();
        for (id, w) in pairs {
            if id as usize >= dims {
                return Err(Error::validation(format!("term id {id} outside [0, {dims})")));
            }
            if !w.is_finite() || w < 0.0 {
                return Err(Error::validation(format!("term {id} has invalid weight {w}")));
            }
            let slot = merged.entry(id).or_insert(w);
            if w > *slot { *slot = w; }
        }
        let entries = merged.into_iter().filter(|(_, w)| *w > 0.0).collect();
        Ok(Self { dims, entries })
    }

    pub fn empty(dims: usize) -> Result<Self> { Self::from_pairs(dims, std::iter::empty()) }

    pub fn dims(&self) -> usize { self.dims }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (TermId, f32)> + '_ { self.entries.iter().copied() }

    pub fn get(&self, term_id: TermId) -> Option<f32> {
        self.entries
            .binary_search_by_key(&term_id, |(t, _)| *t)
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn term_ids(&self) -> impl Iterator<Item = TermId> + '_ { self.entries.iter().map(|(t, _)| *t) }

    /// Dot product over shared term ids, summed in ascending term order.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (mut i, mut j) = (0, 0);
        let mut acc = 0.0f32;
        while i < self.entries.len() && j < other.entries.len() {
            let (ta, wa) = self.entries[i];
            let (tb, wb) = other.entries[j];
            match ta.cmp(&tb) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    acc += wa * wb;
                    i += 1;
                    j += 1;
                }
            }
        }
        acc
    }

    /// Fails with `DimensionMismatch` unless this vector was built for `dims`.
    pub fn check_dims(&self, dims: usize) -> Result<()> {
        if self.dims != dims {
            return Err(Error::DimensionMismatch { expected: dims, actual: self.dims });
        }
        Ok(())
    }
}
