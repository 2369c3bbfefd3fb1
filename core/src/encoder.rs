//! The encoder seam: anything that maps text to (term ids, weights).

use crate::tokenizer::term_counts;
use crate::{Error, Result, TermId};

/// Raw encoder output: parallel term ids and weights.
pub type Encoded = (Vec<TermId>, Vec<f32>);

/// Capability interface for text encoders (SPLADE-style models, test doubles, ...).
///
/// `dims` must stay fixed for the lifetime of any index the encoder is used with,
/// and every emitted id must lie in `[0, dims)`.
pub trait Encoder: Send + Sync {
    fn dims(&self) -> usize;

    fn encode(&self, text: &str) -> Result<Encoded>;

    fn encode_many(&self, texts: &[&str]) -> Result<Vec<Encoded>> {
        texts.iter().map(|t| self.encode(t)).collect()
    }
}

/// Deterministic lexical encoder: stems hashed into `dims` buckets, weight `1 + ln(tf)`.
///
/// Useful for tooling and tests where no learned model is available.
#[derive(Debug, Clone)]
pub struct HashingEncoder {
    dims: usize,
}

impl HashingEncoder {
    pub fn new(dims: usize) -> Result<Self> {
        if dims == 0 || dims > (TermId::MAX as usize).saturating_add(1) {
            return Err(Error::InvalidArgument(format!("unsupported dims {dims}")));
        }
        Ok(Self { dims })
    }

    fn bucket(&self, stem: &str) -> TermId { (crc32fast::hash(stem.as_bytes()) as usize % self.dims) as TermId }
}

impl Encoder for HashingEncoder {
    fn dims(&self) -> usize { self.dims }

    fn encode(&self, text: &str) -> Result<Encoded> {
        let counts = term_counts(text);
        let mut ids = Vec::with_capacity(counts.len());
        let mut weights = Vec::with_capacity(counts.len());
        for (stem, tf) in counts {
            ids.push(self.bucket(&stem));
            weights.push(1.0 + (tf as f32).ln());
        }
        Ok((ids, weights))
    }
}
