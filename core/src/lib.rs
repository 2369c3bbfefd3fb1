//! Local retrieval over learned sparse term-weight vectors.
//!
//! Documents arrive as SPLADE-style sparse vectors (or as text run through an
//! [`Encoder`]), are stored in an inverted index on disk, and are ranked for a
//! query by exact dot product.
//!
//! ```no_run
//! use recollex::{HashingEncoder, Recollex};
//!
//! # fn main() -> recollex::Result<()> {
//! let index = Recollex::open_with_encoder("./idx", HashingEncoder::new(1 << 16)?)?;
//! index.add("sparse retrieval in rust", Some("doc-1".into()))?;
//! for hit in index.query("rust retrieval", 10)? {
//!     println!("{} {:.3} {:?}", hit.doc_id, hit.score, hit.payload);
//! }
//! index.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod docs;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod index;
pub mod persist;
pub mod query;
pub mod tokenizer;
pub mod vector;

pub type TermId = u32;
pub type DocId = u64;
pub type Timestamp = u64;

pub use config::{Durability, IndexConfig};
pub use docs::Document;
pub use encoder::{Encoded, Encoder, HashingEncoder};
pub use engine::{IndexStats, Input, Recollex};
pub use error::{Error, Result};
pub use index::{Posting, Snapshot};
pub use query::{QueryEngine, QueryOptions, SearchHit, Strategy, TieBreak};
pub use vector::SparseVector;
