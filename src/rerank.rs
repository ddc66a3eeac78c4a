//! Pairwise (query, passage) relevance scorers applied after fusion.
//!
//! | Config Value | Scorer |
//! |-------------|--------|
//! | `"lexical"` | [`LexicalOverlapReranker`]: offline, term coverage |
//! | `"http"` | [`HttpReranker`]: Cohere/Jina-style `/rerank` endpoint |
//! | `"local"` | `LocalReranker`: fastembed cross-encoder (feature `local-embeddings-fastembed`) |

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::RerankConfig;
use crate::http::send_with_retry;
use crate::index::lexical::tokenize;

/// Scores passages against a query; higher is more relevant.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;
    /// One score per passage, aligned with the input order.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;
}

/// Fraction of distinct query terms found in the passage, plus a bonus
/// below 0.1 for repeated hits so coverage always dominates.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalOverlapReranker;

impl LexicalOverlapReranker {
    pub fn score_one(query_terms: &HashSet<String>, passage: &str) -> f32 {
        if query_terms.is_empty() {
            return 0.0;
        }
        let tokens = tokenize(passage);
        let present: HashSet<&String> = tokens.iter().filter(|t| query_terms.contains(*t)).collect();
        let hits = tokens.iter().filter(|t| query_terms.contains(*t)).count() as f32;
        let coverage = present.len() as f32 / query_terms.len() as f32;
        coverage + 0.1 * hits / (hits + 1.0)
    }
}

#[async_trait]
impl Reranker for LexicalOverlapReranker {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let terms: HashSet<String> = tokenize(query).into_iter().collect();
        Ok(passages
            .iter()
            .map(|p| Self::score_one(&terms, p))
            .collect())
    }
}

/// POSTs `{model, query, documents}` and reads `results[].{index, relevance_score|score}`.
pub struct HttpReranker {
    url: String,
    model: Option<String>,
    api_key: Option<String>,
    batch_size: usize,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rerank.url required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url,
            model: config.model.clone(),
            api_key: std::env::var("RERANK_API_KEY").ok(),
            batch_size: config.batch_size.max(1),
            client,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        "http"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(passages.len());
        for batch in passages.chunks(self.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "query": query,
                "documents": batch,
            });
            let mut request = self.client.post(&self.url).json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            let json = send_with_retry(request, 2, "Rerank").await?;
            scores.extend(parse_rerank_response(&json, batch.len())?);
        }
        Ok(scores)
    }
}

fn parse_rerank_response(json: &Value, doc_count: usize) -> Result<Vec<f32>> {
    let mut scores = vec![0.0f32; doc_count];
    let results = json
        .get("results")
        .or_else(|| json.get("data"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("Rerank response is missing results array"))?;

    for item in results {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow::anyhow!("Rerank result missing index"))? as usize;
        let score = item
            .get("relevance_score")
            .or_else(|| item.get("score"))
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("Rerank result missing score"))? as f32;
        if index < scores.len() {
            scores[index] = score;
        }
    }

    Ok(scores)
}

#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalReranker {
    batch_size: usize,
    model: Arc<std::sync::Mutex<fastembed::TextRerank>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let model_kind = match config.model.as_deref().unwrap_or("bge-reranker-base") {
            "bge-reranker-base" => fastembed::RerankerModel::BGERerankerBase,
            "jina-reranker-v1-turbo-en" => fastembed::RerankerModel::JINARerankerV1TurboEn,
            other => bail!("Unknown local rerank model: '{}'", other),
        };
        let model = fastembed::TextRerank::try_new(
            fastembed::RerankInitOptions::new(model_kind).with_show_download_progress(true),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local rerank model: {}", e))?;
        Ok(Self {
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Reranker for LocalReranker {
    fn name(&self) -> &str {
        "local"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let query = query.to_string();
        let passages = passages.to_vec();
        let batch_size = self.batch_size;
        tokio::task::spawn_blocking(move || {
            let count = passages.len();
            let mut model = model
                .lock()
                .map_err(|_| anyhow::anyhow!("local rerank model lock poisoned"))?;
            let results = model
                .rerank(query, passages, false, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("Local rerank failed: {}", e))?;
            let mut scores = vec![0.0f32; count];
            for r in results {
                if r.index < count {
                    scores[r.index] = r.score;
                }
            }
            Ok(scores)
        })
        .await?
    }
}

pub fn create_reranker(config: &RerankConfig) -> Result<Arc<dyn Reranker>> {
    match config.provider.as_str() {
        "lexical" => Ok(Arc::new(LexicalOverlapReranker)),
        "http" => Ok(Arc::new(HttpReranker::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalReranker::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local reranker requires --features local-embeddings-fastembed"),
        other => bail!("Unknown rerank provider: {}", other),
    }
}
