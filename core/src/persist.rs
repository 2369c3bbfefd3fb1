//! On-disk layout of an index directory.
//!
//! ```text
//! <root>/meta.json   format version and creation time
//! <root>/store/      sled database with trees:
//!     meta      "dims" | "next_id" | "next_ts" -> u64 BE
//!     docs      doc id (u64 BE) -> bincode Document
//!     postings  term id (u32 BE) ++ doc id (u64 BE) -> weight (f32 LE)
//! ```
//!
//! Every add is a single transaction across the three trees.

use crate::docs::{Allocator, Document};
use crate::{DocId, Error, Result, SparseVector, TermId};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;

const KEY_DIMS: &[u8] = b"dims";
const KEY_NEXT_ID: &[u8] = b"next_id";
const KEY_NEXT_TS: &[u8] = b"next_ts";

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u32,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    pub fn meta(&self) -> PathBuf { self.root.join("meta.json") }
    pub fn store(&self) -> PathBuf { self.root.join("store") }
}

pub fn save_meta(paths: &IndexPaths, meta: &MetaFile) -> Result<()> {
    create_dir_all(&paths.root)?;
    let mut f = File::create(paths.meta())?;
    let json = serde_json::to_string_pretty(meta)?;
    f.write_all(json.as_bytes())?;
    f.sync_all()?;
    Ok(())
}

pub fn load_meta(paths: &IndexPaths) -> Result<MetaFile> {
    let mut f = File::open(paths.meta())?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let meta: MetaFile = serde_json::from_str(&buf).map_err(|e| Error::corrupt(format!("meta.json: {e}")))?;
    Ok(meta)
}

/// Create the directory skeleton for a fresh index, or check the existing one.
/// Returns true when the index was newly created.
pub fn prepare(paths: &IndexPaths) -> Result<bool> {
    if paths.meta().exists() {
        let meta = load_meta(paths)?;
        if meta.version != FORMAT_VERSION {
            return Err(Error::corrupt(format!("unsupported format version {}", meta.version)));
        }
        return Ok(false);
    }
    if paths.store().exists() {
        return Err(Error::corrupt("store present but meta.json missing"));
    }
    let created_at = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    save_meta(paths, &MetaFile { version: FORMAT_VERSION, created_at })?;
    Ok(true)
}

/// Everything read back from the store at open time, already validated.
#[derive(Debug, Default)]
pub struct Loaded {
    pub dims: Option<usize>,
    pub alloc: Allocator,
    pub docs: Vec<Document>,
}

pub struct Store {
    db: sled::Db,
    meta: sled::Tree,
    docs: sled::Tree,
    postings: sled::Tree,
}

fn posting_key(term_id: TermId, doc_id: DocId) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&term_id.to_be_bytes());
    key[4..].copy_from_slice(&doc_id.to_be_bytes());
    key
}

fn read_u64(bytes: &[u8], what: &str) -> Result<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| Error::corrupt(format!("malformed {what}")))?;
    Ok(u64::from_be_bytes(arr))
}

impl Store {
    pub fn open(paths: &IndexPaths) -> Result<Self> {
        let db = sled::Config::new().path(paths.store()).open()?;
        let meta = db.open_tree("meta")?;
        let docs = db.open_tree("docs")?;
        let postings = db.open_tree("postings")?;
        Ok(Self { db, meta, docs, postings })
    }

    fn meta_u64(&self, key: &[u8]) -> Result<Option<u64>> {
        match self.meta.get(key)? {
            Some(v) => Ok(Some(read_u64(&v, "meta value")?)),
            None => Ok(None),
        }
    }

    /// Read and cross-check the whole store.
    pub fn load(&self) -> Result<Loaded> {
        let dims = self.meta_u64(KEY_DIMS)?.map(|d| d as usize);
        let mut alloc = Allocator::default();
        if let Some(n) = self.meta_u64(KEY_NEXT_ID)? { alloc.next_id = n; }
        if let Some(n) = self.meta_u64(KEY_NEXT_TS)? { alloc.next_timestamp = n; }

        let mut docs: Vec<Document> = Vec::new();
        for row in self.docs.iter() {
            let (k, v) = row?;
            let key = read_u64(&k, "document key")?;
            let doc: Document = bincode::deserialize(&v).map_err(|e| Error::corrupt(format!("document {key}: {e}")))?;
            if doc.id != key {
                return Err(Error::corrupt(format!("document stored under {key} claims id {}", doc.id)));
            }
            match dims {
                Some(d) if d == doc.vector.dims() => {}
                _ => return Err(Error::corrupt(format!("document {key} dims do not match index dims {dims:?}"))),
            }
            let canonical = SparseVector::from_pairs(doc.vector.dims(), doc.vector.iter())
                .map_err(|e| Error::corrupt(format!("document {key} vector: {e}")))?;
            if canonical != doc.vector {
                return Err(Error::corrupt(format!("document {key} vector is not sorted and deduplicated")));
            }
            if doc.id >= alloc.next_id || doc.timestamp >= alloc.next_timestamp {
                return Err(Error::corrupt(format!("document {key} is ahead of the id counter")));
            }
            if let Some(prev) = docs.last() {
                if doc.timestamp <= prev.timestamp {
                    return Err(Error::corrupt(format!("document {key} timestamp is not increasing")));
                }
            }
            docs.push(doc);
        }

        let by_id: HashMap<DocId, &Document> = docs.iter().map(|d| (d.id, d)).collect();
        let mut seen: HashMap<DocId, usize> = HashMap::new();
        for row in self.postings.iter() {
            let (k, v) = row?;
            if k.len() != 12 || v.len() != 4 {
                return Err(Error::corrupt("malformed posting entry"));
            }
            let term_id = TermId::from_be_bytes([k[0], k[1], k[2], k[3]]);
            let doc_id = read_u64(&k[4..], "posting key")?;
            let weight = f32::from_le_bytes([v[0], v[1], v[2], v[3]]);
            let doc = by_id
                .get(&doc_id)
                .ok_or_else(|| Error::corrupt(format!("posting for term {term_id} references missing document {doc_id}")))?;
            if doc.vector.get(term_id).map(f32::to_bits) != Some(weight.to_bits()) {
                return Err(Error::corrupt(format!("posting ({term_id}, {doc_id}) disagrees with the stored vector")));
            }
            *seen.entry(doc_id).or_insert(0) += 1;
        }
        for doc in &docs {
            let n = seen.get(&doc.id).copied().unwrap_or(0);
            if n != doc.nnz() {
                return Err(Error::corrupt(format!("document {} has {} of {} postings", doc.id, n, doc.nnz())));
            }
        }
        Ok(Loaded { dims, alloc, docs })
    }

    /// Atomically write `docs`, their postings, and the counters.
    pub fn commit(&self, docs: &[Document], dims: usize, alloc: &Allocator) -> Result<()> {
        let mut doc_rows: Vec<([u8; 8], Vec<u8>)> = Vec::with_capacity(docs.len());
        let mut posting_rows: Vec<([u8; 12], [u8; 4])> = Vec::new();
        for doc in docs {
            doc_rows.push((doc.id.to_be_bytes(), bincode::serialize(doc)?));
            for (term_id, weight) in doc.vector.iter() {
                posting_rows.push((posting_key(term_id, doc.id), weight.to_le_bytes()));
            }
        }
        let meta_rows = [
            (KEY_DIMS, (dims as u64).to_be_bytes()),
            (KEY_NEXT_ID, alloc.next_id.to_be_bytes()),
            (KEY_NEXT_TS, alloc.next_timestamp.to_be_bytes()),
        ];

        (&self.meta, &self.docs, &self.postings)
            .transaction(|(meta, docs, postings)| -> ConflictableTransactionResult<(), Infallible> {
                for (k, v) in &doc_rows {
                    docs.insert(&k[..], v.as_slice())?;
                }
                for (k, v) in &posting_rows {
                    postings.insert(&k[..], &v[..])?;
                }
                for (k, v) in &meta_rows {
                    meta.insert(*k, &v[..])?;
                }
                Ok(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(never) => match never {},
                TransactionError::Storage(e) => Error::Storage(e),
            })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn doc(id: DocId, pairs: &[(TermId, f32)]) -> Document {
        Document { id, timestamp: id, payload: Some(format!("doc {id}")), vector: SparseVector::from_pairs(8, pairs.iter().copied()).unwrap() }
    }

    #[test]
    fn prepare_creates_then_reuses() {
        let dir = tempdir().unwrap();
        let paths = IndexPaths::new(dir.path().join("idx"));
        assert!(prepare(&paths).unwrap());
        assert!(!prepare(&paths).unwrap());
        assert_eq!(load_meta(&paths).unwrap().version, FORMAT_VERSION);
    }

    #[test]
    fn commit_then_load() {
        let dir = tempdir().unwrap();
        let paths = IndexPaths::new(dir.path());
        prepare(&paths).unwrap();
        let store = Store::open(&paths).unwrap();
        let docs = vec![doc(1, &[(1, 1.0), (3, 0.5)]), doc(2, &[(1, 0.2)])];
        store.commit(&docs, 8, &Allocator { next_id: 3, next_timestamp: 3 }).unwrap();
        store.flush().unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.dims, Some(8));
        assert_eq!(loaded.alloc, Allocator { next_id: 3, next_timestamp: 3 });
        assert_eq!(loaded.docs, docs);
    }

    #[test]
    fn dangling_posting_is_corruption() {
        let dir = tempdir().unwrap();
        let paths = IndexPaths::new(dir.path());
        prepare(&paths).unwrap();
        let store = Store::open(&paths).unwrap();
        store.commit(&[doc(1, &[(1, 1.0)])], 8, &Allocator { next_id: 2, next_timestamp: 2 }).unwrap();
        store.postings.insert(&posting_key(4, 9)[..], &1.0f32.to_le_bytes()[..]).unwrap();
        assert!(matches!(store.load(), Err(Error::CorruptIndex(_))));
    }

    /// Same field order as `Document`, but with an unchecked vector.
    #[derive(Serialize)]
    struct RawDocument {
        id: DocId,
        timestamp: u64,
        payload: Option<String>,
        dims: usize,
        entries: Vec<(TermId, f32)>,
    }

    fn overwrite_document(store: &Store, id: DocId, dims: usize, entries: &[(TermId, f32)]) {
        let raw = RawDocument { id, timestamp: id, payload: None, dims, entries: entries.to_vec() };
        store.docs.insert(&id.to_be_bytes()[..], bincode::serialize(&raw).unwrap()).unwrap();
        store.postings.clear().unwrap();
        for (t, w) in entries {
            store.postings.insert(&posting_key(*t, id)[..], &w.to_le_bytes()[..]).unwrap();
        }
    }

    #[test]
    fn invalid_stored_vectors_are_corruption() {
        let cases: &[&[(TermId, f32)]] = &[
            &[(2, -3.0)],
            &[(9, 1.0)],
            &[(2, f32::NAN)],
            &[(2, f32::INFINITY)],
            &[(3, 1.0), (2, 1.0)],
            &[(2, 0.0)],
        ];
        for entries in cases {
            let dir = tempdir().unwrap();
            let paths = IndexPaths::new(dir.path());
            prepare(&paths).unwrap();
            let store = Store::open(&paths).unwrap();
            store.commit(&[doc(1, &[(2, 1.0)])], 8, &Allocator { next_id: 2, next_timestamp: 2 }).unwrap();
            overwrite_document(&store, 1, 8, entries);
            assert!(matches!(store.load(), Err(Error::CorruptIndex(_))), "{entries:?} loaded");
        }
    }

    #[test]
    fn missing_posting_is_corruption() {
        let dir = tempdir().unwrap();
        let paths = IndexPaths::new(dir.path());
        prepare(&paths).unwrap();
        let store = Store::open(&paths).unwrap();
        store.commit(&[doc(1, &[(1, 1.0), (2, 0.3)])], 8, &Allocator { next_id: 2, next_timestamp: 2 }).unwrap();
        store.postings.remove(&posting_key(2, 1)[..]).unwrap();
        assert!(matches!(store.load(), Err(Error::CorruptIndex(_))));
    }

    #[test]
    fn store_without_meta_is_corruption() {
        let dir = tempdir().unwrap();
        let paths = IndexPaths::new(dir.path());
        std::fs::create_dir_all(paths.store()).unwrap();
        assert!(matches!(prepare(&paths), Err(Error::CorruptIndex(_))));
    }
}
