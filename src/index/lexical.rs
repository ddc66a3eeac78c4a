//! BM25 lexical index.
//!
//! There is no incremental add: the index is always built from the whole
//! corpus, so term statistics (document frequency, average length) reflect
//! every chunk. Persisted as a single JSON file.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::write_atomic;
use crate::models::Chunk;

pub const BM25_K1: f64 = 1.5;
pub const BM25_B: f64 = 0.75;

/// Lowercase alphanumeric runs.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexicalIndex {
    k1: f64,
    b: f64,
    docs: Vec<Chunk>,
    doc_lens: Vec<usize>,
    avg_doc_len: f64,
    term_freqs: Vec<BTreeMap<String, u32>>,
    doc_freqs: BTreeMap<String, usize>,
}

impl LexicalIndex {
    /// Build over the full corpus.
    pub fn build(docs: Vec<Chunk>) -> Self {
        let mut doc_lens = Vec::with_capacity(docs.len());
        let mut term_freqs = Vec::with_capacity(docs.len());
        let mut doc_freqs: BTreeMap<String, usize> = BTreeMap::new();

        for doc in &docs {
            let tokens = tokenize(&doc.text);
            doc_lens.push(tokens.len());
            let mut tf: BTreeMap<String, u32> = BTreeMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for term in tf.keys() {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(tf);
        }

        let avg_doc_len = if docs.is_empty() {
            0.0
        } else {
            doc_lens.iter().sum::<usize>() as f64 / docs.len() as f64
        };

        Self {
            k1: BM25_K1,
            b: BM25_B,
            docs,
            doc_lens,
            avg_doc_len,
            term_freqs,
            doc_freqs,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn docs(&self) -> &[Chunk] {
        &self.docs
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = self.doc_freqs.get(term).copied().unwrap_or(0) as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// BM25 score of one document against pre-tokenised query terms.
    fn score_doc(&self, doc: usize, query_terms: &[String]) -> f64 {
        let tf_map = &self.term_freqs[doc];
        let len_norm = if self.avg_doc_len > 0.0 {
            self.doc_lens[doc] as f64 / self.avg_doc_len
        } else {
            0.0
        };
        query_terms
            .iter()
            .filter_map(|term| tf_map.get(term).map(|tf| (term, *tf as f64)))
            .map(|(term, tf)| {
                let denom = tf + self.k1 * (1.0 - self.b + self.b * len_norm);
                self.idf(term) * tf * (self.k1 + 1.0) / denom
            })
            .sum()
    }

    /// Top `k` documents with a positive score, best first. Equal scores keep
    /// corpus order.
    pub fn search(&self, query: &str, k: usize) -> Vec<(Chunk, f64)> {
        let terms = tokenize(query);
        if terms.is_empty() || k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f64)> = (0..self.docs.len())
            .map(|i| (i, self.score_doc(i, &terms)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(i, s)| (self.docs[i].clone(), s))
            .collect()
    }

    /// `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read lexical index: {}", path.display()))?;
        let index = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt lexical index: {}", path.display()))?;
        Ok(Some(index))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(self)?;
        write_atomic(path, &bytes)
            .with_context(|| format!("Failed to write lexical index: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<Chunk> {
        vec![
            Chunk::new("The cat sat on the mat.", "a.txt"),
            Chunk::new("Dogs and cats are popular pets.", "b.txt"),
            Chunk::new("Quarterly revenue grew by ten percent.", "c.txt"),
        ]
    }

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Hello, World! It's 2024."),
            vec!["hello", "world", "it", "s", "2024"]
        );
        assert!(tokenize("  --  ").is_empty());
    }

    #[test]
    fn test_search_ranks_matching_doc_first() {
        let index = LexicalIndex::build(corpus());
        let hits = index.search("revenue growth", 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.source, "c.txt");
    }

    #[test]
    fn test_only_positive_scores_returned() {
        let index = LexicalIndex::build(corpus());
        assert!(index.search("zebra", 5).is_empty());
        assert!(index.search("", 5).is_empty());
    }

    #[test]
    fn test_idf_always_positive() {
        // A term in every document still contributes a positive score.
        let docs = vec![Chunk::new("alpha beta", "1"), Chunk::new("alpha gamma", "2")];
        let index = LexicalIndex::build(docs);
        let hits = index.search("alpha", 5);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|(_, s)| *s > 0.0));
        assert_eq!(hits[0].0.source, "1");
    }

    #[test]
    fn test_shorter_doc_wins_on_equal_tf() {
        let docs = vec![
            Chunk::new("budget report with many extra filler words here", "long"),
            Chunk::new("budget report", "short"),
        ];
        let hits = LexicalIndex::build(docs).search("budget", 2);
        assert_eq!(hits[0].0.source, "short");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm25_index.json");
        assert!(LexicalIndex::load(&path).unwrap().is_none());
        let index = LexicalIndex::build(corpus());
        index.save(&path).unwrap();
        let loaded = LexicalIndex::load(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(
            loaded.search("cat", 1)[0].0.text,
            index.search("cat", 1)[0].0.text
        );
    }

    #[test]
    fn test_empty_corpus_searches_empty() {
        let index = LexicalIndex::build(Vec::new());
        assert!(index.is_empty());
        assert!(index.search("anything", 3).is_empty());
    }
}
