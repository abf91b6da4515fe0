//! Pluggable similarity scoring for knowledge nodes.
//!
//! Provides the [`SimilarityScorer`] trait, a local term-frequency scorer and a
//! remote embedding scorer. The scorer is created via [`create_scorer`] from
//! configuration.

pub mod lexical;
pub mod remote;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::SimilarityConfig;

pub use lexical::LexicalScorer;
pub use remote::RemoteEmbeddingScorer;

/// Scores how similar two pieces of text are, in `[0, 1]`.
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    /// Stable identifier, stored in the graph's `schema_meta`.
    fn name(&self) -> &str;

    async fn score(&self, a: &str, b: &str) -> Result<f64>;

    /// Score one query against many candidates. Implementations may override for batching.
    async fn score_many(&self, query: &str, candidates: &[&str]) -> Result<Vec<f64>> {
        let mut scores = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            scores.push(self.score(query, candidate).await?);
        }
        Ok(scores)
    }
}

/// Cosine similarity of two dense vectors, clamped to `[0, 1]`.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(0.0, 1.0)
}

/// Create a similarity scorer from config.
///
/// `"lexical"` needs nothing external. `"remote"` reads its API key from the
/// environment variable named by `api_key_env`.
pub fn create_scorer(config: &SimilarityConfig) -> Result<Arc<dyn SimilarityScorer>> {
    match config.provider.as_str() {
        "lexical" => Ok(Arc::new(LexicalScorer::new())),
        "remote" => Ok(Arc::new(RemoteEmbeddingScorer::from_config(config)?)),
        other => anyhow::bail!("unknown similarity provider: {other}. Supported: lexical, remote"),
    }
}
