//! Text embedding capability

use crate::error::{MemoryError, Result};
use async_trait::async_trait;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn dimension(&self) -> usize;

    /// Embed each text; identical input must yield identical vectors.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text through any provider
pub async fn embed_one(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    provider
        .embed(&[text.to_string()])
        .await?
        .pop()
        .ok_or_else(|| {
            MemoryError::Connectivity(format!("{} returned no embedding", provider.name()))
        })
}

/// Signed feature hashing over lower-cased word tokens.
///
/// Needs no model or network. Texts sharing words score close together,
/// which is enough for grounding and for tests.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn project(&self, text: &str) -> Vec<f32> {
        let mut features = vec![0.0f32; self.dimension];
        let tokens = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);
        for token in tokens {
            let hash = fnv1a(token.as_bytes());
            let slot = (hash % self.dimension as u64) as usize;
            // The top bit picks the sign so collisions tend to cancel out
            features[slot] += if hash >> 63 == 0 { 1.0 } else { -1.0 };
        }

        let norm = features.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            features.iter_mut().for_each(|x| *x /= norm);
        }
        features
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn name(&self) -> &'static str {
        "feature-hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.project(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_search::cosine_similarity;

    #[tokio::test]
    async fn projection_is_deterministic_and_case_blind() {
        let provider = HashEmbeddingProvider::new(64);
        let a = embed_one(&provider, "John helped with Python").await.unwrap();
        let b = embed_one(&provider, "john HELPED with python").await.unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn shared_words_score_higher() {
        let provider = HashEmbeddingProvider::new(384);
        let vectors = provider
            .embed(&[
                "debugged a python script".to_string(),
                "python script crashed".to_string(),
                "went hiking on sunday".to_string(),
            ])
            .await
            .unwrap();
        let close = cosine_similarity(&vectors[0], &vectors[1]);
        let far = cosine_similarity(&vectors[0], &vectors[2]);
        assert!(close > far);
    }
}
