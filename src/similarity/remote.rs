//! Similarity from a remote OpenAI-compatible `/embeddings` endpoint.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{cosine, SimilarityScorer};
use crate::config::SimilarityConfig;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

pub struct RemoteEmbeddingScorer {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl RemoteEmbeddingScorer {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        })
    }

    pub fn from_config(config: &SimilarityConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "no API key for remote similarity; sending unauthenticated requests"
            );
        }
        Self::new(
            &config.endpoint,
            &config.model,
            api_key,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    async fn embed(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        debug!(texts = expected, model = %self.model, "requesting embeddings");

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.context("embedding request failed")?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            bail!("embedding endpoint returned {status}: {body}");
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .context("failed to decode embedding response")?;
        if parsed.data.len() != expected {
            bail!(
                "embedding endpoint returned {} vectors for {expected} inputs",
                parsed.data.len()
            );
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl SimilarityScorer for RemoteEmbeddingScorer {
    fn name(&self) -> &str {
        &self.model
    }

    async fn score(&self, a: &str, b: &str) -> Result<f64> {
        let vectors = self.embed(vec![a, b]).await?;
        Ok(cosine(&vectors[0], &vectors[1]))
    }

    async fn score_many(&self, query: &str, candidates: &[&str]) -> Result<Vec<f64>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut input = Vec::with_capacity(candidates.len() + 1);
        input.push(query);
        input.extend_from_slice(candidates);

        let vectors = self.embed(input).await?;
        let (query_vec, rest) = vectors
            .split_first()
            .context("embedding response was empty")?;
        Ok(rest.iter().map(|v| cosine(query_vec, v)).collect())
    }
}
