//! Text generation capability consumed by the selection and review stages.

pub mod ollama;
pub mod scripted;

pub use ollama::*;
pub use scripted::*;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::models::Stage;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Generation service is not reachable at {0}")]
    Connection(String),

    #[error("Generation service returned error (status {status}): {body}")]
    Service { status: u16, body: String },

    #[error("Generation call timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Malformed generation response: {0}")]
    MalformedResponse(String),
}

impl GenerationError {
    /// Transport-level failures worth another attempt. A malformed envelope
    /// or a 4xx will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::HttpClient(_) => true,
            Self::Service { status, .. } => *status == 429 || *status >= 500,
            Self::MalformedResponse(_) => false,
        }
    }
}

/// One generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPrompt {
    pub stage: Stage,
    pub model: String,
    pub system: String,
    pub user: String,
}

/// `generate(prompt) -> raw text`. No ordering or idempotence is assumed
/// across calls with identical input.
pub trait GenerationClient: Send + Sync {
    fn generate(
        &self,
        prompt: &GenerationPrompt,
    ) -> impl Future<Output = Result<String, GenerationError>> + Send;
}
