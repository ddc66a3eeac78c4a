//! Hybrid retrieval: dense + lexical candidates, Reciprocal Rank Fusion,
//! then a pairwise rerank.
//!
//! # Pipeline
//!
//! ```text
//! query ─┬─ dense top-k_fusion ───┐
//!        └─ lexical top-k_fusion ─┴─ RRF ─ top-k_fusion ─ rerank ─ top-k_final
//! ```
//!
//! RRF score for a chunk is `Σ 1 / (rrf_k + rank + 1)` over the lists it
//! appears in (0-based rank). Chunks are identified by their text, so the
//! same passage found by both retrievers accumulates both terms as a single
//! entry.
//!
//! The index pair lives behind a `tokio::sync::RwLock`: [`HybridRetriever::add`]
//! takes the write half, [`HybridRetriever::retrieve`] the read half.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{create_embedder, embed_query, Embedder};
use crate::error::RagError;
use crate::index::IndexStore;
use crate::models::{Chunk, RankedCandidate};
use crate::rerank::{create_reranker, Reranker};

pub const NO_RESULTS_MSG: &str = "No relevant information found in the knowledge base.";

/// Merge ranked lists by Reciprocal Rank Fusion.
///
/// Entries are keyed by chunk text. Equal fused scores keep first-seen order
/// (earlier lists first). At most `limit` candidates are returned.
pub fn rrf_fuse(lists: &[Vec<Chunk>], rrf_k: f64, limit: usize) -> Vec<RankedCandidate> {
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut fused: Vec<RankedCandidate> = Vec::new();

    for list in lists {
        for (rank, chunk) in list.iter().enumerate() {
            let contribution = 1.0 / (rrf_k + rank as f64 + 1.0);
            let key = chunk.digest();
            if let Some(&i) = position.get(&key) {
                fused[i].fusion_score += contribution;
            } else {
                position.insert(key, fused.len());
                fused.push(RankedCandidate {
                    chunk: chunk.clone(),
                    fusion_score: contribution,
                });
            }
        }
    }

    fused.sort_by(|a, b| b.fusion_score.total_cmp(&a.fusion_score));
    fused.truncate(limit);
    fused
}

/// Render retrieved chunks as the document-search tool's output text.
pub fn format_results(chunks: &[Chunk]) -> String {
    if chunks.is_empty() {
        return NO_RESULTS_MSG.to_string();
    }
    let mut out = String::from("Found the following information:\n\n");
    for (i, chunk) in chunks.iter().enumerate() {
        out.push_str(&format!(
            "--- Document {} ---\nMetadata provided: {}\nContent:\n{}\n\n",
            i + 1,
            chunk.citation(),
            chunk.text
        ));
    }
    out
}

pub struct HybridRetriever {
    store: RwLock<IndexStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    settings: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        store: IndexStore,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        settings: RetrievalConfig,
    ) -> Self {
        Self {
            store: RwLock::new(store),
            embedder,
            reranker,
            settings,
        }
    }

    /// Load persisted indices and build the configured providers.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            IndexStore::open(&config.data)?,
            create_embedder(&config.embedding)?,
            create_reranker(&config.rerank)?,
            config.retrieval.clone(),
        ))
    }

    pub fn settings(&self) -> &RetrievalConfig {
        &self.settings
    }

    /// Number of indexed chunks.
    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Append chunks to both indices. Serialized against every other `add`
    /// and every in-flight `retrieve`.
    pub async fn add(&self, chunks: Vec<Chunk>) -> Result<usize> {
        let mut store = self.store.write().await;
        store.add(chunks, self.embedder.as_ref()).await
    }

    /// [`HybridRetriever::retrieve`] with the configured `k_fusion` / `k_final`.
    pub async fn retrieve_default(&self, query: &str) -> Result<Vec<Chunk>> {
        self.retrieve(query, self.settings.k_fusion, self.settings.k_final)
            .await
    }

    /// Best `k_final` chunks for `query`. Empty when either index is missing.
    pub async fn retrieve(&self, query: &str, k_fusion: usize, k_final: usize) -> Result<Vec<Chunk>> {
        let store = self.store.read().await;
        let (Some(dense), Some(lexical)) = (store.dense(), store.lexical()) else {
            tracing::debug!(error = %RagError::IndexUnavailable, "retrieval skipped");
            return Ok(Vec::new());
        };

        let query_vector = embed_query(self.embedder.as_ref(), query).await?;
        let dense_hits: Vec<Chunk> = dense
            .search(&query_vector, k_fusion)
            .into_iter()
            .map(|(c, _)| c)
            .collect();
        let lexical_hits: Vec<Chunk> = lexical
            .search(query, k_fusion)
            .into_iter()
            .map(|(c, _)| c)
            .collect();

        let fused = rrf_fuse(&[dense_hits, lexical_hits], self.settings.rrf_k, k_fusion);
        tracing::debug!(query, candidates = fused.len(), "fusion complete");
        if fused.is_empty() {
            return Ok(Vec::new());
        }

        let passages: Vec<String> = fused.iter().map(|c| c.chunk.text.clone()).collect();
        let scores = self.reranker.score(query, &passages).await?;
        if scores.len() != fused.len() {
            anyhow::bail!(
                "reranker '{}' returned {} scores for {} passages",
                self.reranker.name(),
                scores.len(),
                fused.len()
            );
        }

        let mut reranked: Vec<(f32, Chunk)> = scores
            .into_iter()
            .zip(fused.into_iter().map(|c| c.chunk))
            .collect();
        reranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        reranked.truncate(k_final);
        Ok(reranked.into_iter().map(|(_, c)| c).collect())
    }
}

/// CLI entry point for `corpus search`.
pub async fn run_search(
    config: &Config,
    query: &str,
    k_fusion: Option<usize>,
    k_final: Option<usize>,
) -> Result<()> {
    let retriever = HybridRetriever::from_config(config)?;
    let k_final = k_final.unwrap_or(config.retrieval.k_final);
    let k_fusion = k_fusion.unwrap_or(config.retrieval.k_fusion).max(k_final);
    let hits = retriever.retrieve(query, k_fusion, k_final).await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, chunk) in hits.iter().enumerate() {
        println!("{}. {}", i + 1, chunk.citation());
        if let Some(offset) = chunk.start_offset {
            println!("    offset: {}", offset);
        }
        println!("    excerpt: \"{}\"", excerpt(&chunk.text, 240));
        println!();
    }
    Ok(())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataConfig;
    use crate::embedding::HashEmbedder;
    use crate::rerank::LexicalOverlapReranker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunk(text: &str) -> Chunk {
        Chunk::new(text, "t.txt")
    }

    #[test]
    fn test_rrf_double_listed_chunk_wins() {
        let a = chunk("A");
        let b = chunk("B");
        let fused = rrf_fuse(&[vec![a.clone(), b.clone()], vec![b.clone()]], 60.0, 10);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].chunk, b);
        assert!((fused[0].fusion_score - (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-12);
        assert_eq!(fused[1].chunk, a);
        assert!((fused[1].fusion_score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_dedups_by_text_not_source() {
        let fused = rrf_fuse(
            &[
                vec![Chunk::new("same", "one.pdf")],
                vec![Chunk::new("same", "two.pdf")],
            ],
            60.0,
            10,
        );
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].chunk.source, "one.pdf");
    }

    #[test]
    fn test_rrf_ties_keep_input_order() {
        let fused = rrf_fuse(&[vec![chunk("x")], vec![chunk("y")]], 60.0, 10);
        assert_eq!(fused[0].chunk.text, "x");
        assert_eq!(fused[1].chunk.text, "y");
    }

    #[test]
    fn test_rrf_limit_and_empty() {
        let list: Vec<Chunk> = (0..5).map(|i| chunk(&i.to_string())).collect();
        assert_eq!(rrf_fuse(&[list], 60.0, 3).len(), 3);
        assert!(rrf_fuse(&[Vec::new(), Vec::new()], 60.0, 3).is_empty());
    }

    #[test]
    fn test_excerpt_flattens_and_cuts() {
        assert_eq!(excerpt("a\nb ", 10), "a b");
        assert_eq!(excerpt("abcdef", 3), "abc...");
    }

    #[test]
    fn test_format_results() {
        assert_eq!(format_results(&[]), NO_RESULTS_MSG);
        let text = format_results(&[Chunk::new("Body text", "report.pdf").with_page(0)]);
        assert!(text.starts_with("Found the following information:\n\n"));
        assert!(text.contains("--- Document 1 ---"));
        assert!(text.contains("Metadata provided: [Source: report.pdf, Page: 0]"));
        assert!(text.contains("Content:\nBody text"));
    }

    struct CountingReranker(AtomicUsize);

    #[async_trait::async_trait]
    impl Reranker for CountingReranker {
        fn name(&self) -> &str {
            "counting"
        }
        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.0; passages.len()])
        }
    }

    fn retriever(dir: &std::path::Path, reranker: Arc<dyn Reranker>) -> HybridRetriever {
        let store = IndexStore::open(&DataConfig {
            dir: dir.to_path_buf(),
        })
        .unwrap();
        HybridRetriever::new(
            store,
            Arc::new(HashEmbedder::new(128)),
            reranker,
            RetrievalConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_retrieve_without_index_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(CountingReranker(AtomicUsize::new(0)));
        let r = retriever(dir.path(), counter.clone());
        assert!(r.retrieve("anything", 25, 5).await.unwrap().is_empty());
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reranker_skipped_when_fusion_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(CountingReranker(AtomicUsize::new(0)));
        let r = retriever(dir.path(), counter.clone());
        r.add(vec![chunk("some indexed text")]).await.unwrap();
        assert!(r.retrieve("text", 0, 5).await.unwrap().is_empty());
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_headquarters_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let r = retriever(dir.path(), Arc::new(LexicalOverlapReranker));
        r.add(vec![
            chunk("The company headquarters is located in Austin, Texas."),
            chunk("Employees receive twenty days of paid leave per year."),
            chunk("The cafeteria serves lunch from noon until two."),
        ])
        .await
        .unwrap();

        let hits = r.retrieve("headquarters location", 25, 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("Austin"));
    }

    #[tokio::test]
    async fn test_retrieve_returns_each_text_once() {
        let dir = tempfile::tempdir().unwrap();
        let r = retriever(dir.path(), Arc::new(LexicalOverlapReranker));
        r.add(vec![chunk("alpha beta"), chunk("beta gamma")])
            .await
            .unwrap();
        let hits = r.retrieve("beta", 25, 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_ne!(hits[0].text, hits[1].text);
    }

    /// Tracks how many `embed` calls are in flight at once.
    struct OverlapEmbedder {
        inner: HashEmbedder,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Embedder for OverlapEmbedder {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            let out = self.inner.embed(texts).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    #[tokio::test]
    async fn test_retrieve_never_overlaps_add() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = Arc::new(OverlapEmbedder {
            inner: HashEmbedder::new(64),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let store = IndexStore::open(&DataConfig {
            dir: dir.path().to_path_buf(),
        })
        .unwrap();
        let r = HybridRetriever::new(
            store,
            embedder.clone(),
            Arc::new(LexicalOverlapReranker),
            RetrievalConfig::default(),
        );
        r.add(vec![chunk("seed record")]).await.unwrap();

        let (added, hits) = tokio::join!(
            r.add(vec![chunk("zeta record")]),
            r.retrieve("zeta record", 25, 5)
        );
        assert_eq!(added.unwrap(), 1);
        assert!(!hits.unwrap().is_empty());
        assert_eq!(embedder.peak.load(Ordering::SeqCst), 1);
        assert_eq!(r.len().await, 2);
    }
}
