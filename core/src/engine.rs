use crate::config::{Durability, IndexConfig};
use crate::docs::{Allocator, Document};
use crate::encoder::{Encoded, Encoder};
use crate::index::Snapshot;
use crate::persist::{self, IndexPaths, Store};
use crate::query::{QueryEngine, QueryOptions, SearchHit};
use crate::{DocId, Error, Result, SparseVector, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Something to add or query: raw text (needs an encoder) or a ready vector.
#[derive(Debug, Clone)]
pub enum Input<'a> {
    Text(Cow<'a, str>),
    Vector(SparseVector),
}

impl<'a> From<&'a str> for Input<'a> {
    fn from(s: &'a str) -> Self { Input::Text(Cow::Borrowed(s)) }
}

impl From<String> for Input<'static> {
    fn from(s: String) -> Self { Input::Text(Cow::Owned(s)) }
}

impl From<SparseVector> for Input<'static> {
    fn from(v: SparseVector) -> Self { Input::Vector(v) }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub dims: Option<usize>,
    pub num_docs: usize,
    pub num_terms: usize,
    pub num_postings: usize,
    pub num_segments: usize,
    pub next_doc_id: DocId,
}

struct Writer {
    store: Store,
    alloc: Allocator,
}

/// A sparse-vector index rooted at one directory.
///
/// Adds are serialized on an internal writer lock and become visible to
/// queries atomically, after they are committed to disk. Queries run against
/// an immutable snapshot and never wait on writers.
pub struct Recollex {
    root: PathBuf,
    durability: Durability,
    encoder: Option<Arc<dyn Encoder>>,
    /// 0 until the dimensionality is fixed.
    dims: AtomicUsize,
    snapshot: RwLock<Arc<Snapshot>>,
    writer: Mutex<Option<Writer>>,
    closed: AtomicBool,
}

impl Recollex {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> { Self::open_with(path, IndexConfig::default()) }

    pub fn open_with<P: AsRef<Path>>(path: P, config: IndexConfig) -> Result<Self> {
        let paths = IndexPaths::new(path);
        let created = persist::prepare(&paths)?;
        let store = Store::open(&paths)?;
        let loaded = store.load()?;

        let dims = match (loaded.dims, config.dims) {
            (Some(stored), Some(wanted)) if stored != wanted => {
                return Err(Error::DimensionMismatch { expected: stored, actual: wanted })
            }
            (Some(0), _) => return Err(Error::corrupt("stored dims is zero")),
            (_, Some(0)) => return Err(Error::InvalidArgument("dims must be positive".into())),
            (stored, wanted) => stored.or(wanted),
        };
        if loaded.dims.is_none() {
            if let Some(d) = dims {
                store.commit(&[], d, &loaded.alloc)?;
                store.flush()?;
            }
        }

        let num_docs = loaded.docs.len();
        let snapshot = Snapshot::default().with_documents(loaded.docs.into_iter().map(Arc::new).collect());
        info!(path = %paths.root.display(), created, num_docs, ?dims, "opened index");
        Ok(Self {
            root: paths.root,
            durability: config.durability,
            encoder: None,
            dims: AtomicUsize::new(dims.unwrap_or(0)),
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(Some(Writer { store, alloc: loaded.alloc })),
            closed: AtomicBool::new(false),
        })
    }

    /// Open with an encoder attached; the encoder's dims become the index dims.
    pub fn open_with_encoder<P, E>(path: P, encoder: E) -> Result<Self>
    where
        P: AsRef<Path>,
        E: Encoder + 'static,
    {
        Self::open(path)?.with_encoder(encoder)
    }

    /// Attach the encoder used for text input. Its dims must agree with the index.
    pub fn with_encoder<E: Encoder + 'static>(mut self, encoder: E) -> Result<Self> {
        let enc_dims = encoder.dims();
        if enc_dims == 0 {
            return Err(Error::InvalidArgument("encoder declares zero dims".into()));
        }
        match self.dims() {
            Some(d) if d != enc_dims => return Err(Error::DimensionMismatch { expected: d, actual: enc_dims }),
            Some(_) => {}
            None => {
                let writer = self.writer.get_mut().as_ref().ok_or(Error::IndexClosed)?;
                writer.store.commit(&[], enc_dims, &writer.alloc)?;
                writer.store.flush()?;
                self.dims.store(enc_dims, Ordering::SeqCst);
            }
        }
        self.encoder = Some(Arc::new(encoder));
        Ok(self)
    }

    pub fn path(&self) -> &Path { &self.root }

    pub fn dims(&self) -> Option<usize> {
        match self.dims.load(Ordering::SeqCst) {
            0 => None,
            d => Some(d),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) { Err(Error::IndexClosed) } else { Ok(()) }
    }

    /// Turn inputs into vectors, encoding all text in one `encode_many` call.
    fn vectorize(&self, inputs: Vec<Input<'_>>) -> Result<Vec<SparseVector>> {
        let texts: Vec<&str> = inputs
            .iter()
            .filter_map(|i| match i {
                Input::Text(t) => Some(&**t),
                Input::Vector(_) => None,
            })
            .collect();
        let encoded: Vec<Encoded> = if texts.is_empty() {
            Vec::new()
        } else {
            let encoder = self.encoder.as_ref().ok_or(Error::EncoderMissing)?;
            let out = encoder.encode_many(&texts)?;
            if out.len() != texts.len() {
                return Err(Error::validation(format!(
                    "encoder returned {} vectors for {} texts",
                    out.len(),
                    texts.len()
                )));
            }
            out
        };
        let mut encoded = encoded.into_iter();

        let mut vectors = Vec::with_capacity(inputs.len());
        for input in inputs {
            let v = match input {
                Input::Vector(v) => v,
                Input::Text(_) => {
                    let (ids, weights) = encoded.next().ok_or_else(|| Error::validation("encoder output exhausted"))?;
                    let dims = self.encoder.as_ref().map(|e| e.dims()).ok_or(Error::EncoderMissing)?;
                    SparseVector::new(dims, &ids, &weights)?
                }
            };
            if let Some(d) = self.dims() {
                v.check_dims(d)?;
            }
            vectors.push(v);
        }
        Ok(vectors)
    }

    /// Ingest one document and return its id.
    pub fn add<'a>(&self, input: impl Into<Input<'a>>, payload: Option<String>) -> Result<DocId> {
        let ids = self.add_many(vec![(input.into(), payload)])?;
        ids.into_iter().next().ok_or_else(|| Error::validation("nothing was added"))
    }

    /// Ingest a batch as one atomic commit. Ids are returned in input order.
    pub fn add_many<'a, I>(&self, items: I) -> Result<Vec<DocId>>
    where
        I: IntoIterator<Item = (Input<'a>, Option<String>)>,
    {
        self.ensure_open()?;
        let (inputs, payloads): (Vec<Input<'a>>, Vec<Option<String>>) = items.into_iter().unzip();
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.vectorize(inputs)?;

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(Error::IndexClosed)?;
        let dims = match self.dims() {
            Some(d) => d,
            None => vectors[0].dims(),
        };
        for v in &vectors {
            v.check_dims(dims)?;
        }

        let mut alloc = writer.alloc;
        let docs: Vec<Document> = vectors
            .into_iter()
            .zip(payloads)
            .map(|(vector, payload)| {
                let (id, timestamp) = alloc.allocate();
                Document { id, timestamp, payload, vector }
            })
            .collect();
        let ids: Vec<DocId> = docs.iter().map(|d| d.id).collect();

        writer.store.commit(&docs, dims, &alloc)?;
        writer.alloc = alloc;
        self.dims.store(dims, Ordering::SeqCst);
        let flushed = match self.durability {
            Durability::Sync => writer.store.flush(),
            Durability::Batched => Ok(()),
        };

        // Publish even if the flush failed: the commit is in the store either way.
        {
            let mut snap = self.snapshot.write();
            let next = snap.with_documents(docs.into_iter().map(Arc::new).collect());
            *snap = Arc::new(next);
        }
        debug!(count = ids.len(), first = ids[0], "added documents");
        flushed?;
        Ok(ids)
    }

    pub fn query<'a>(&self, input: impl Into<Input<'a>>, k: usize) -> Result<Vec<SearchHit>> {
        self.query_with(input, &QueryOptions::top(k))
    }

    pub fn query_with<'a>(&self, input: impl Into<Input<'a>>, opts: &QueryOptions) -> Result<Vec<SearchHit>> {
        self.ensure_open()?;
        let vector = self.vectorize(vec![input.into()])?.pop().ok_or(Error::EmptyQueryVector)?;
        let snapshot = self.snapshot();
        let hits = QueryEngine::new(&snapshot).search(&vector, opts)?;
        debug!(terms = vector.len(), k = opts.k, hits = hits.len(), "query");
        Ok(hits)
    }

    /// The current point-in-time view of the index.
    pub fn snapshot(&self) -> Arc<Snapshot> { self.snapshot.read().clone() }

    pub fn get(&self, doc_id: DocId) -> Result<Option<Document>> {
        self.ensure_open()?;
        Ok(self.snapshot().document(doc_id).map(|d| (*d).clone()))
    }

    pub fn timestamp_for(&self, doc_id: DocId) -> Result<Option<Timestamp>> {
        self.ensure_open()?;
        Ok(self.snapshot().document(doc_id).map(|d| d.timestamp))
    }

    /// The `n` most recently ingested documents, newest first.
    pub fn recent(&self, n: usize) -> Result<Vec<Document>> {
        self.ensure_open()?;
        let snapshot = self.snapshot();
        let docs = snapshot.documents_rev().take(n).map(|d| (**d).clone()).collect();
        Ok(docs)
    }

    pub fn len(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.snapshot().num_docs())
    }

    pub fn is_empty(&self) -> Result<bool> { Ok(self.len()? == 0) }

    pub fn stats(&self) -> Result<IndexStats> {
        self.ensure_open()?;
        let next_doc_id = self.writer.lock().as_ref().ok_or(Error::IndexClosed)?.alloc.next_id;
        let snapshot = self.snapshot();
        Ok(IndexStats {
            dims: self.dims(),
            num_docs: snapshot.num_docs(),
            num_terms: snapshot.num_terms(),
            num_postings: snapshot.num_postings(),
            num_segments: snapshot.segments().len(),
            next_doc_id,
        })
    }

    /// Force committed adds to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let guard = self.writer.lock();
        guard.as_ref().ok_or(Error::IndexClosed)?.store.flush()
    }

    /// Flush and release the store. Every later call fails with `IndexClosed`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::IndexClosed);
        }
        let writer = self.writer.lock().take();
        *self.snapshot.write() = Arc::new(Snapshot::default());
        if let Some(w) = writer {
            w.store.flush()?;
        }
        info!(path = %self.root.display(), "closed index");
        Ok(())
    }
}

impl Drop for Recollex {
    fn drop(&mut self) {
        if let Some(w) = self.writer.get_mut().as_ref() {
            if let Err(e) = w.store.flush() {
                warn!(path = %self.root.display(), error = %e, "flush on drop failed");
            }
        }
    }
}
