use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recollex::{Durability, HashingEncoder, IndexConfig, Input, QueryOptions, Recollex, SparseVector, TieBreak};
use serde::Deserialize;
use tracing_subscriber::{fmt, EnvFilter};
use walkdir::WalkDir;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// One input record: either raw text or a precomputed sparse vector.
#[derive(Debug, Deserialize)]
struct InputDoc {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ids: Option<Vec<u32>>,
    #[serde(default)]
    weights: Option<Vec<f32>>,
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Parser)]
#[command(name = "recollex-indexer")]
#[command(about = "Ingest into and query a sparse-vector index", long_about = None)]
struct Cli {
    /// Index directory
    #[arg(long, env = "RECOLLEX_INDEX", global = true, default_value = "./index")]
    index: PathBuf,
    /// Dimensionality of the built-in hashing encoder
    #[arg(long, env = "RECOLLEX_DIMS", global = true, default_value_t = 1 << 16)]
    dims: usize,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add documents from JSON/JSONL files or a directory of them
    Add {
        /// Input path (file or directory)
        #[arg(long)]
        input: PathBuf,
        /// Documents per atomic commit
        #[arg(long, default_value_t = 256)]
        batch: usize,
    },
    /// Run a top-k query
    Query {
        /// Query text, encoded with the hashing encoder
        #[arg(long, conflicts_with = "terms")]
        text: Option<String>,
        /// Query vector as "id:weight,id:weight"
        #[arg(long)]
        terms: Option<String>,
        #[arg(long, default_value_t = 10)]
        k: usize,
        /// Break score ties by recency instead of document id
        #[arg(long, default_value_t = false)]
        recency: bool,
    },
    /// Print index statistics as JSON
    Stats,
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Add { input, batch } => {
            let index = open_index(&cli.index, cli.dims, Durability::Batched)?;
            let added = add_documents(&index, &input, batch.max(1))?;
            index.close()?;
            tracing::info!(added, index = %cli.index.display(), "ingest complete");
            Ok(())
        }
        Commands::Query { text, terms, k, recency } => {
            let index = open_index(&cli.index, cli.dims, Durability::Sync)?;
            let input: Input = match (text, terms) {
                (Some(t), _) => t.into(),
                (None, Some(spec)) => parse_terms(&spec, index.dims().unwrap_or(cli.dims))?.into(),
                (None, None) => bail!("one of --text or --terms is required"),
            };
            let tie_break = if recency { TieBreak::Recency } else { TieBreak::DocIdAsc };
            let hits = index.query_with(input, &QueryOptions::top(k).tie_break(tie_break))?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
            index.close()?;
            Ok(())
        }
        Commands::Stats => {
            let index = open_index(&cli.index, cli.dims, Durability::Sync)?;
            println!("{}", serde_json::to_string_pretty(&index.stats()?)?);
            index.close()?;
            Ok(())
        }
    }
}

/// Open the index with the hashing encoder, unless it was built with other dims
/// (vectors from an external encoder), in which case text input is unavailable.
fn open_index(path: &Path, dims: usize, durability: Durability) -> Result<Recollex> {
    let config = IndexConfig::default().with_durability(durability);
    let index = Recollex::open_with(path, config)?;
    match index.dims() {
        Some(d) if d != dims => {
            tracing::warn!(index_dims = d, dims, "index dims differ from --dims; text input disabled");
            Ok(index)
        }
        _ => Ok(index.with_encoder(HashingEncoder::new(dims)?)?),
    }
}

fn parse_terms(spec: &str, dims: usize) -> Result<SparseVector> {
    let mut pairs = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, w) = part.split_once(':').with_context(|| format!("expected id:weight, got {part:?}"))?;
        pairs.push((id.trim().parse::<u32>()?, w.trim().parse::<f32>()?));
    }
    Ok(SparseVector::from_pairs(dims, pairs)?)
}

fn collect_files(input: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    if input.is_dir() {
        for entry in WalkDir::new(input).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() && matches!(p.extension().and_then(|s| s.to_str()), Some("json" | "jsonl")) {
                files.push(p.to_path_buf());
            }
        }
    } else if input.is_file() {
        files.push(input.to_path_buf());
    }
    files
}

fn add_documents(index: &Recollex, input: &Path, batch: usize) -> Result<usize> {
    let mut pending: Vec<InputDoc> = Vec::with_capacity(batch);
    let mut added = 0;
    for file in collect_files(input) {
        let docs = if file.extension().and_then(|s| s.to_str()) == Some("jsonl") {
            read_jsonl(&file)?
        } else {
            read_json(&file)?
        };
        tracing::debug!(file = %file.display(), docs = docs.len(), "read input file");
        for doc in docs {
            pending.push(doc);
            if pending.len() >= batch {
                added += commit(index, std::mem::take(&mut pending))?;
            }
        }
    }
    added += commit(index, pending)?;
    Ok(added)
}

fn commit(index: &Recollex, docs: Vec<InputDoc>) -> Result<usize> {
    if docs.is_empty() {
        return Ok(0);
    }
    let dims = index.dims().context("index dims are not set")?;
    let mut items: Vec<(Input<'static>, Option<String>)> = Vec::with_capacity(docs.len());
    for doc in docs {
        let input: Input = match (doc.ids, doc.weights, doc.text) {
            (Some(ids), Some(weights), _) => SparseVector::new(dims, &ids, &weights)?.into(),
            (None, None, Some(text)) => text.into(),
            _ => bail!("each record needs either `text` or both `ids` and `weights`"),
        };
        items.push((input, doc.payload));
    }
    let ids = index.add_many(items)?;
    index.flush()?;
    Ok(ids.len())
}

fn read_jsonl(file: &Path) -> Result<Vec<InputDoc>> {
    let reader = BufReader::new(File::open(file)?);
    let mut docs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() { continue; }
        docs.push(serde_json::from_str(&line).with_context(|| format!("bad record in {}", file.display()))?);
    }
    Ok(docs)
}

fn read_json(file: &Path) -> Result<Vec<InputDoc>> {
    let reader = BufReader::new(File::open(file)?);
    let json: serde_json::Value = serde_json::from_reader(reader)?;
    match json {
        serde_json::Value::Array(arr) => arr.into_iter().map(|v| Ok(serde_json::from_value(v)?)).collect(),
        serde_json::Value::Object(_) => Ok(vec![serde_json::from_value(json)?]),
        _ => Ok(Vec::new()),
    }
}
