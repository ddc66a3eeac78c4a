//! Ingestion pipeline: files → chunks → index pair.
//!
//! Chunking fans out one blocking task per file; it is CPU-bound and needs no
//! shared state, so files are processed in parallel. Only the final
//! [`HybridRetriever::add`] touches the indices, and it runs once per batch
//! under the retriever's write lock.
//!
//! A file that fails to load is reported and skipped. It never aborts the
//! rest of the batch.

use std::path::{Path, PathBuf};

use anyhow::Result;
use walkdir::WalkDir;

use crate::chunk::{load_and_split, TextSplitter};
use crate::config::Config;
use crate::error::RagError;
use crate::models::Chunk;
use crate::retrieval::HybridRetriever;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Indexed { chunks: usize },
    /// Loaded fine but produced no text.
    Empty,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct FileReport {
    pub path: PathBuf,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub files: Vec<FileReport>,
    pub chunks_indexed: usize,
}

impl IngestReport {
    pub fn failed(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Failed { .. }))
            .count()
    }
}

/// Expand directories (recursively, sorted by name) into their files.
/// Plain file paths pass through unchanged, missing ones included, so they
/// surface as per-file failures later.
pub fn collect_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        files.push(entry.into_path());
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "skipping unreadable directory entry"),
                }
            }
        } else {
            files.push(path.clone());
        }
    }
    files
}

/// Load and split every file in parallel. Results keep input order.
pub async fn chunk_files(
    paths: &[PathBuf],
    splitter: TextSplitter,
) -> Vec<(PathBuf, Result<Vec<Chunk>, RagError>)> {
    let handles: Vec<_> = paths
        .iter()
        .cloned()
        .map(|path| {
            tokio::task::spawn_blocking(move || {
                let result = load_and_split(&path, &splitter);
                (path, result)
            })
        })
        .collect();

    let mut out = Vec::with_capacity(handles.len());
    for (path, handle) in paths.iter().zip(handles) {
        match handle.await {
            Ok(pair) => out.push(pair),
            Err(e) => out.push((
                path.clone(),
                Err(RagError::LoadFailure {
                    path: path.clone(),
                    reason: format!("chunking task failed: {}", e),
                }),
            )),
        }
    }
    out
}

/// Chunk `paths` and add every resulting chunk to the retriever in one
/// serialized index update.
pub async fn ingest_files(
    retriever: &HybridRetriever,
    paths: &[PathBuf],
    splitter: TextSplitter,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    let mut batch = Vec::new();

    for (path, result) in chunk_files(paths, splitter).await {
        let outcome = match result {
            Ok(chunks) if chunks.is_empty() => {
                tracing::info!(file = %path.display(), "no text extracted");
                FileOutcome::Empty
            }
            Ok(chunks) => {
                tracing::debug!(file = %path.display(), chunks = chunks.len(), "chunked");
                let count = chunks.len();
                batch.extend(chunks);
                FileOutcome::Indexed { chunks: count }
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping file");
                FileOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        report.files.push(FileReport { path, outcome });
    }

    report.chunks_indexed = retriever.add(batch).await?;
    Ok(report)
}

/// CLI entry point for `corpus ingest`.
pub async fn run_ingest(config: &Config, paths: &[PathBuf]) -> Result<()> {
    let retriever = HybridRetriever::from_config(config)?;
    let files = collect_files(paths);
    let report = ingest_files(&retriever, &files, TextSplitter::from_config(&config.chunking)).await?;

    println!("ingest");
    for file in &report.files {
        match &file.outcome {
            FileOutcome::Indexed { chunks } => {
                println!("  {}: {} chunks", display(&file.path), chunks)
            }
            FileOutcome::Empty => println!("  {}: no text", display(&file.path)),
            FileOutcome::Failed { reason } => {
                println!("  {}: FAILED ({})", display(&file.path), reason)
            }
        }
    }
    println!("  files: {} ({} failed)", report.files.len(), report.failed());
    println!("  chunks indexed: {}", report.chunks_indexed);
    println!("  corpus size: {}", retriever.len().await);
    println!("ok");
    Ok(())
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
