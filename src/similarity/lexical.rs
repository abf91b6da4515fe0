//! Term-frequency cosine similarity. No model, no network.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

use super::SimilarityScorer;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "was", "we", "with",
];

#[derive(Debug, Default, Clone)]
pub struct LexicalScorer;

impl LexicalScorer {
    pub fn new() -> Self {
        Self
    }

    fn terms(text: &str) -> HashMap<String, f64> {
        let mut tf = HashMap::new();
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .filter(|t| !STOPWORDS.contains(&t.as_str()))
        {
            *tf.entry(token).or_insert(0.0) += 1.0;
        }
        tf
    }

    /// Cosine over term-frequency vectors.
    pub fn similarity(a: &str, b: &str) -> f64 {
        let ta = Self::terms(a);
        let tb = Self::terms(b);
        if ta.is_empty() || tb.is_empty() {
            return 0.0;
        }

        let dot: f64 = ta
            .iter()
            .filter_map(|(term, x)| tb.get(term).map(|y| x * y))
            .sum();
        let na: f64 = ta.values().map(|x| x * x).sum::<f64>().sqrt();
        let nb: f64 = tb.values().map(|y| y * y).sum::<f64>().sqrt();
        (dot / (na * nb)).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl SimilarityScorer for LexicalScorer {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn score(&self, a: &str, b: &str) -> Result<f64> {
        Ok(Self::similarity(a, b))
    }
}
