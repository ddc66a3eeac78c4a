//! The index pair: a dense vector index and a BM25 lexical index over the
//! same chunk corpus.
//!
//! The dense index is the authoritative corpus. Every [`IndexStore::add`]
//! appends to it, persists it, then rebuilds the lexical index from the
//! dense corpus in full, so the lexical corpus always contains every dense
//! chunk.
//!
//! `IndexStore` is not internally synchronized. The retriever wraps it in a
//! `tokio::sync::RwLock`: one `add` at a time, any number of concurrent
//! searches, never both.

pub mod dense;
pub mod lexical;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::config::DataConfig;
use crate::embedding::Embedder;
use crate::models::Chunk;

pub use dense::DenseIndex;
pub use lexical::LexicalIndex;

#[derive(Debug)]
pub struct IndexStore {
    dense_dir: PathBuf,
    lexical_path: PathBuf,
    dense: Option<DenseIndex>,
    lexical: Option<LexicalIndex>,
}

impl IndexStore {
    /// An empty store rooted at the configured data directory. Nothing is
    /// read until [`IndexStore::load`].
    pub fn new(data: &DataConfig) -> Self {
        Self {
            dense_dir: data.dense_index_dir(),
            lexical_path: data.lexical_index_path(),
            dense: None,
            lexical: None,
        }
    }

    /// Construct and load in one step.
    pub fn open(data: &DataConfig) -> Result<Self> {
        let mut store = Self::new(data);
        store.load()?;
        Ok(store)
    }

    /// Deserialize both indices if present. Absence is not an error, and
    /// neither is an unreadable index: it is logged and treated as missing,
    /// so retrieval degrades to empty results until the next `add`.
    ///
    /// A dense index whose lexical companion is missing or does not cover
    /// the dense corpus gets the lexical index rebuilt from it.
    pub fn load(&mut self) -> Result<()> {
        self.dense = DenseIndex::load(&self.dense_dir).unwrap_or_else(|e| {
            tracing::warn!(
                path = %self.dense_dir.display(),
                error = %format!("{:#}", e),
                "dense index unreadable, treating as unavailable"
            );
            None
        });
        self.lexical = LexicalIndex::load(&self.lexical_path).unwrap_or_else(|e| {
            tracing::warn!(
                path = %self.lexical_path.display(),
                error = %format!("{:#}", e),
                "lexical index unreadable, treating as unavailable"
            );
            None
        });

        if let Some(dense) = &self.dense {
            let stale = match &self.lexical {
                None => true,
                Some(lexical) => lexical.docs() != dense.chunks(),
            };
            if stale {
                tracing::warn!(
                    chunks = dense.len(),
                    "lexical index missing or stale, rebuilding from dense corpus"
                );
                let lexical = LexicalIndex::build(dense.chunks().to_vec());
                if let Err(e) = lexical.save(&self.lexical_path) {
                    tracing::warn!(error = %format!("{:#}", e), "could not persist rebuilt lexical index");
                }
                self.lexical = Some(lexical);
            }
        }

        tracing::info!(
            dense_chunks = self.dense.as_ref().map(|d| d.len()).unwrap_or(0),
            lexical_chunks = self.lexical.as_ref().map(|l| l.len()).unwrap_or(0),
            "index store loaded"
        );
        Ok(())
    }

    /// Both indices exist.
    pub fn is_ready(&self) -> bool {
        self.dense.is_some() && self.lexical.is_some()
    }

    pub fn dense(&self) -> Option<&DenseIndex> {
        self.dense.as_ref()
    }

    pub fn lexical(&self) -> Option<&LexicalIndex> {
        self.lexical.as_ref()
    }

    pub fn len(&self) -> usize {
        self.dense.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embed and append `chunks`, persist the dense index, then rebuild and
    /// persist the lexical index over the whole corpus.
    ///
    /// An empty batch returns immediately without touching disk.
    pub async fn add(&mut self, chunks: Vec<Chunk>, embedder: &dyn Embedder) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        if let Some(dense) = &self.dense {
            if dense.manifest().model != embedder.model_name() {
                bail!(
                    "dense index was built with model '{}', but the configured embedder is '{}'",
                    dense.manifest().model,
                    embedder.model_name()
                );
            }
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed(&texts).await?;

        let mut dense = self
            .dense
            .take()
            .unwrap_or_else(|| DenseIndex::new(embedder.model_name(), embedder.dims()));
        let added = chunks.len();
        let appended = dense.append(chunks, vectors);
        let saved = appended.and_then(|()| dense.save(&self.dense_dir));
        // Keep whatever is now in memory even on failure so the store never
        // loses its dense corpus.
        let corpus = dense.chunks().to_vec();
        self.dense = Some(dense);
        saved?;

        // Memory first: a failed save leaves a stale file, which `load` rebuilds.
        let lexical = self.lexical.insert(LexicalIndex::build(corpus));
        lexical.save(&self.lexical_path)?;

        tracing::info!(added, total = self.len(), "indices updated");
        Ok(added)
    }
}

/// Write `bytes` to a sibling temp file and rename it over `path`, so a
/// reader never sees a half-written index file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("Failed to replace {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;

    fn data_config(dir: &std::path::Path) -> DataConfig {
        DataConfig {
            dir: dir.to_path_buf(),
        }
    }

    fn snapshot_bytes(dir: &std::path::Path) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                out.push((
                    entry.path().display().to_string(),
                    std::fs::read(entry.path()).unwrap(),
                ));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_missing_indices_are_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&data_config(dir.path())).unwrap();
        assert!(!store.is_ready());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_add_empty_batch_leaves_bytes_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = HashEmbedder::new(32);
        let mut store = IndexStore::open(&data_config(dir.path())).unwrap();
        store
            .add(vec![Chunk::new("first chunk", "a.txt")], &embedder)
            .await
            .unwrap();

        let before = snapshot_bytes(dir.path());
        assert_eq!(store.add(Vec::new(), &embedder).await.unwrap(), 0);
        assert_eq!(snapshot_bytes(dir.path()), before);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_add_empty_batch_on_fresh_store_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IndexStore::new(&data_config(dir.path()));
        store.add(Vec::new(), &HashEmbedder::new(8)).await.unwrap();
        assert!(snapshot_bytes(dir.path()).is_empty());
        assert!(!store.is_ready());
    }

    #[tokio::test]
    async fn test_lexical_tracks_dense_corpus_across_adds_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = HashEmbedder::new(32);
        let config = data_config(dir.path());
        let mut store = IndexStore::open(&config).unwrap();
        store
            .add(vec![Chunk::new("alpha document", "a.txt")], &embedder)
            .await
            .unwrap();
        store
            .add(
                vec![
                    Chunk::new("beta document", "b.txt"),
                    Chunk::new("gamma document", "c.txt"),
                ],
                &embedder,
            )
            .await
            .unwrap();

        let reloaded = IndexStore::open(&config).unwrap();
        assert!(reloaded.is_ready());
        let dense = reloaded.dense().unwrap();
        let lexical = reloaded.lexical().unwrap();
        assert_eq!(dense.len(), 3);
        for chunk in dense.chunks() {
            assert!(lexical.docs().contains(chunk));
        }
        assert_eq!(lexical.search("alpha", 1)[0].0.source, "a.txt");
    }

    #[tokio::test]
    async fn test_missing_lexical_file_is_rebuilt_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = data_config(dir.path());
        let mut store = IndexStore::open(&config).unwrap();
        store
            .add(vec![Chunk::new("orphaned text", "o.txt")], &HashEmbedder::new(8))
            .await
            .unwrap();
        std::fs::remove_file(config.lexical_index_path()).unwrap();

        let reloaded = IndexStore::open(&config).unwrap();
        assert!(reloaded.is_ready());
        assert!(config.lexical_index_path().exists());
        assert_eq!(reloaded.lexical().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_lexical_save_keeps_memory_in_sync() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = HashEmbedder::new(16);
        let config = data_config(dir.path());
        let mut store = IndexStore::open(&config).unwrap();
        store
            .add(vec![Chunk::new("first chunk", "a.txt")], &embedder)
            .await
            .unwrap();

        let lexical_path = config.lexical_index_path();
        std::fs::remove_file(&lexical_path).unwrap();
        std::fs::create_dir(&lexical_path).unwrap();

        let second = Chunk::new("second chunk", "b.txt");
        assert!(store.add(vec![second.clone()], &embedder).await.is_err());
        assert_eq!(store.len(), 2);
        assert!(store.lexical().unwrap().docs().contains(&second));
        assert_eq!(store.lexical().unwrap().search("second", 1)[0].0, second);

        std::fs::remove_dir(&lexical_path).unwrap();
        let reloaded = IndexStore::open(&config).unwrap();
        assert!(reloaded.lexical().unwrap().docs().contains(&second));
        assert_eq!(reloaded.lexical().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_lexical_file_is_rebuilt_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = data_config(dir.path());
        let mut store = IndexStore::open(&config).unwrap();
        store
            .add(
                vec![Chunk::new("kept", "a.txt"), Chunk::new("dropped", "b.txt")],
                &HashEmbedder::new(8),
            )
            .await
            .unwrap();
        LexicalIndex::build(vec![Chunk::new("kept", "a.txt")])
            .save(&config.lexical_index_path())
            .unwrap();

        let reloaded = IndexStore::open(&config).unwrap();
        assert_eq!(reloaded.lexical().unwrap().len(), 2);
        let on_disk = LexicalIndex::load(&config.lexical_index_path())
            .unwrap()
            .unwrap();
        assert_eq!(on_disk.len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_dense_index_degrades_to_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = HashEmbedder::new(8);
        let config = data_config(dir.path());
        let mut store = IndexStore::open(&config).unwrap();
        store
            .add(vec![Chunk::new("x", "x.txt")], &embedder)
            .await
            .unwrap();
        std::fs::write(config.dense_index_dir().join("manifest.json"), b"{ not json").unwrap();

        let mut reopened = IndexStore::open(&config).unwrap();
        assert!(!reopened.is_ready());
        assert!(reopened.is_empty());

        // The next add starts a fresh dense corpus over the corrupt files.
        reopened
            .add(vec![Chunk::new("y", "y.txt")], &embedder)
            .await
            .unwrap();
        assert!(reopened.is_ready());
        assert_eq!(IndexStore::open(&config).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_lexical_index_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let config = data_config(dir.path());
        let mut store = IndexStore::open(&config).unwrap();
        store
            .add(vec![Chunk::new("x", "x.txt")], &HashEmbedder::new(8))
            .await
            .unwrap();
        std::fs::write(config.lexical_index_path(), b"garbage").unwrap();

        let reopened = IndexStore::open(&config).unwrap();
        assert!(reopened.is_ready());
        assert_eq!(reopened.lexical().unwrap().len(), 1);
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("index.json")]);
    }

    #[test]
    fn test_write_atomic_over_directory_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::create_dir(&path).unwrap();
        assert!(write_atomic(&path, b"new").is_err());
        assert!(!dir.path().join("index.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_model_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IndexStore::open(&data_config(dir.path())).unwrap();
        store
            .add(vec![Chunk::new("x", "x.txt")], &HashEmbedder::new(8))
            .await
            .unwrap();

        struct Other;
        #[async_trait::async_trait]
        impl Embedder for Other {
            fn model_name(&self) -> &str {
                "other-model"
            }
            fn dims(&self) -> usize {
                8
            }
            async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
                Ok(vec![vec![0.0; 8]; texts.len()])
            }
        }

        let err = store
            .add(vec![Chunk::new("y", "y.txt")], &Other)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("other-model"));
        assert_eq!(store.len(), 1);
    }
}
