use std::collections::HashMap;
use std::future::Future;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("Embedding service unreachable at {0}")]
    Connection(String),

    #[error("Embedding service returned error (status {status}): {body}")]
    Service { status: u16, body: String },

    #[error("Embedding call timed out")]
    Timeout,

    #[error("Malformed embedding response: {0}")]
    MalformedResponse(String),

    #[error("Cannot embed empty text")]
    EmptyInput,
}

impl EmbeddingError {
    /// Transport-level failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout => true,
            Self::Service { status, .. } => *status == 429 || *status >= 500,
            Self::MalformedResponse(_) | Self::EmptyInput => false,
        }
    }
}

/// `embed(text) -> fixed-length vector`. The model itself lives outside this crate.
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, EmbeddingError>> + Send;

    /// Model name recorded alongside catalog versions.
    fn model_name(&self) -> &str;
}

/// Cosine similarity, or `None` when the vectors are not comparable
/// (different lengths, empty, or zero norm).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }

    Some(dot / (norm_a * norm_b))
}

// ═══════════════════════════════════════════════════════════
// Deterministic embedders
// ═══════════════════════════════════════════════════════════

/// Returns preset vectors: an exact-text override if one exists, else the default.
#[derive(Debug, Clone, Default)]
pub struct FixedEmbedder {
    default: Option<Vec<f32>>,
    by_text: HashMap<String, Vec<f32>>,
}

impl FixedEmbedder {
    pub fn new(default: Vec<f32>) -> Self {
        Self {
            default: Some(default),
            by_text: HashMap::new(),
        }
    }

    /// An embedder whose every call fails with a connection error.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.by_text.insert(text.into(), vector);
        self
    }
}

impl EmbeddingModel for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        self.by_text
            .get(text)
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| EmbeddingError::Connection("fixed://unavailable".to_string()))
    }

    fn model_name(&self) -> &str {
        "fixed"
    }
}

/// Bag-of-words feature hashing into an L2-normalized vector.
///
/// Texts sharing vocabulary score high; disjoint texts score zero. Good
/// enough to exercise ranking without a real model.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
        {
            let bucket = (fnv1a(&token.to_lowercase()) % self.dimension as u64) as usize;
            vec[bucket] += 1.0;
        }

        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in &mut vec {
                *val /= norm;
            }
        }
        vec
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EmbeddingModel for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        Ok(self.embed_sync(text))
    }

    fn model_name(&self) -> &str {
        "hash-bow"
    }
}

fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}
