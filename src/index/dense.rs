//! Dense vector index persisted as a directory:
//!
//! ```text
//! dense_index/
//!   manifest.json   model, dims, count, updated_at
//!   chunks.json     ordered chunk metadata (row i ↔ vector i)
//!   vectors.bin     count × dims little-endian f32
//! ```
//!
//! Search is an exhaustive cosine scan. Growth is append-only.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::write_atomic;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::Chunk;

const MANIFEST_FILE: &str = "manifest.json";
const CHUNKS_FILE: &str = "chunks.json";
const VECTORS_FILE: &str = "vectors.bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseManifest {
    pub model: String,
    pub dims: usize,
    pub count: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DenseIndex {
    manifest: DenseManifest,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
}

impl DenseIndex {
    pub fn new(model: &str, dims: usize) -> Self {
        Self {
            manifest: DenseManifest {
                model: model.to_string(),
                dims,
                count: 0,
                updated_at: Utc::now(),
            },
            chunks: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn manifest(&self) -> &DenseManifest {
        &self.manifest
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Append rows. Every vector must match the index dimensionality.
    pub fn append(&mut self, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<()> {
        if chunks.len() != vectors.len() {
            bail!(
                "embedding count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.manifest.dims) {
            bail!(
                "embedding dimension mismatch: index has {}, got {}",
                self.manifest.dims,
                bad.len()
            );
        }
        self.chunks.extend(chunks);
        self.vectors.extend(vectors);
        self.manifest.count = self.chunks.len();
        self.manifest.updated_at = Utc::now();
        Ok(())
    }

    /// Top `k` rows by cosine similarity, best first; ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(Chunk, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(i, s)| (self.chunks[i].clone(), s))
            .collect()
    }

    /// `Ok(None)` when no manifest exists in `dir`.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Ok(None);
        }
        let manifest: DenseManifest = serde_json::from_slice(
            &std::fs::read(&manifest_path)
                .with_context(|| format!("Failed to read {}", manifest_path.display()))?,
        )
        .with_context(|| format!("Corrupt dense manifest: {}", manifest_path.display()))?;

        let chunks: Vec<Chunk> = serde_json::from_slice(&std::fs::read(dir.join(CHUNKS_FILE))?)
            .with_context(|| "Corrupt dense chunk table")?;
        let blob = std::fs::read(dir.join(VECTORS_FILE))?;
        let flat = blob_to_vec(&blob);

        if manifest.dims == 0 || flat.len() != manifest.count * manifest.dims {
            bail!(
                "dense index is inconsistent: manifest says {} × {}, vectors.bin holds {} floats",
                manifest.count,
                manifest.dims,
                flat.len()
            );
        }
        if chunks.len() != manifest.count {
            bail!(
                "dense index is inconsistent: manifest says {} rows, chunks.json holds {}",
                manifest.count,
                chunks.len()
            );
        }

        let vectors = flat.chunks(manifest.dims).map(|c| c.to_vec()).collect();
        Ok(Some(Self {
            manifest,
            chunks,
            vectors,
        }))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut blob = Vec::with_capacity(self.vectors.len() * self.manifest.dims * 4);
        for v in &self.vectors {
            blob.extend_from_slice(&vec_to_blob(v));
        }
        write_atomic(&dir.join(VECTORS_FILE), &blob)?;
        write_atomic(&dir.join(CHUNKS_FILE), &serde_json::to_vec(&self.chunks)?)?;
        // Manifest last: load() keys on it.
        write_atomic(
            &dir.join(MANIFEST_FILE),
            &serde_json::to_vec_pretty(&self.manifest)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dims: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let mut index = DenseIndex::new("test", 3);
        index
            .append(
                vec![Chunk::new("x", "x.txt"), Chunk::new("y", "y.txt")],
                vec![unit(3, 0), unit(3, 1)],
            )
            .unwrap();
        let hits = index.search(&[0.1, 0.9, 0.0], 2);
        assert_eq!(hits[0].0.text, "y");
        assert_eq!(hits[1].0.text, "x");
        assert_eq!(index.search(&[1.0, 0.0, 0.0], 1).len(), 1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = DenseIndex::new("test", 3);
        let err = index
            .append(vec![Chunk::new("x", "x.txt")], vec![vec![1.0, 0.0]])
            .unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
        assert!(index.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dense_index");
        assert!(DenseIndex::load(&path).unwrap().is_none());

        let mut index = DenseIndex::new("hash", 2);
        index
            .append(
                vec![Chunk::new("a", "a.pdf").with_page(2)],
                vec![vec![0.6, 0.8]],
            )
            .unwrap();
        index.save(&path).unwrap();

        let loaded = DenseIndex::load(&path).unwrap().unwrap();
        assert_eq!(loaded.manifest().model, "hash");
        assert_eq!(loaded.manifest().count, 1);
        assert_eq!(loaded.chunks()[0].page, Some(2));
        assert_eq!(loaded.search(&[0.6, 0.8], 1)[0].0.text, "a");
    }

    #[test]
    fn test_truncated_vectors_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = DenseIndex::new("hash", 2);
        index
            .append(vec![Chunk::new("a", "a.txt")], vec![vec![1.0, 0.0]])
            .unwrap();
        index.save(dir.path()).unwrap();
        std::fs::write(dir.path().join(VECTORS_FILE), [0u8; 4]).unwrap();
        assert!(DenseIndex::load(dir.path()).is_err());
    }
}
