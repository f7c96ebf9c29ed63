use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ServiceError;
use crate::ports::Embedder;
use crate::supervisor::{BlockingPool, TaskResult};

/// Feature-hashing bag-of-words embedder. Lexical only: paraphrases that
/// share few words score low, so it is the offline fallback for deployments
/// without an embeddings endpoint.
#[derive(Clone, Copy, Debug)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dimensions: 256 }
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(8) }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for token in text
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|token| token.len() > 1)
            .map(str::to_lowercase)
        {
            let hash = fnv1a(token.as_bytes());
            let index = (hash % self.dimensions as u64) as usize;
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        Ok(self.vectorize(text))
    }

    fn model(&self) -> &str {
        "local-hashing"
    }
}

/// Runs the hashing embedder on the bounded blocking pool so long messages
/// never stall a runtime worker.
#[derive(Clone, Debug)]
pub struct PooledEmbedder {
    inner: HashingEmbedder,
    pool: BlockingPool,
    timeout: Duration,
}

impl PooledEmbedder {
    pub fn new(inner: HashingEmbedder, pool: BlockingPool, timeout: Duration) -> Self {
        Self { inner, pool, timeout }
    }
}

#[async_trait]
impl Embedder for PooledEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let inner = self.inner;
        let text = text.to_owned();
        match self
            .pool
            .run("embedding.local", self.timeout, move || Ok::<_, Infallible>(inner.vectorize(&text)))
            .await
        {
            TaskResult::Success(vector) => Ok(vector),
            TaskResult::Timeout => Err(ServiceError::unavailable("local embedder timed out")),
            TaskResult::Failure(cause) => Err(ServiceError::unavailable(cause.to_string())),
        }
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Cosine similarity; zero when either side is empty or dimensions differ.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}
