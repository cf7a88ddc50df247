use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{GenerationClient, GenerationError, GenerationPrompt};
use crate::pipeline::embedding::{EmbeddingError, EmbeddingModel};
use crate::pipeline_config::GenerationConfig;

/// Ollama HTTP client for generation and embeddings.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
    embedding_model: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout,
            embedding_model: GenerationConfig::default().embedding_model,
        })
    }

    pub fn from_config(config: &GenerationConfig, timeout: Duration) -> Result<Self, GenerationError> {
        Ok(Self::new(&config.base_url, timeout)?.with_embedding_model(&config.embedding_model))
    }

    pub fn with_embedding_model(mut self, model: &str) -> Self {
        self.embedding_model = model.to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Names of the models installed on the server (`/api/tags`).
    pub async fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    fn transport_error(&self, e: reqwest::Error) -> GenerationError {
        if e.is_connect() {
            GenerationError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            GenerationError::Timeout(self.timeout)
        } else {
            GenerationError::HttpClient(e.to_string())
        }
    }
}

/// Entries of `required` that `installed` lacks, deduplicated. A bare name
/// matches its `:latest` tag.
pub fn missing_models<'a>(installed: &[String], required: &[&'a str]) -> Vec<&'a str> {
    let mut missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| {
            !installed
                .iter()
                .any(|have| have == name || have.strip_suffix(":latest") == Some(*name))
        })
        .collect();
    missing.sort_unstable();
    missing.dedup();
    missing
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Request body for Ollama /api/embeddings
#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Response body from Ollama /api/tags
#[derive(Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

impl GenerationClient for OllamaClient {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String, GenerationError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model: &prompt.model,
            prompt: &prompt.user,
            system: &prompt.system,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;

        tracing::debug!(
            stage = %prompt.stage,
            model = %prompt.model,
            response_len = parsed.response.len(),
            "Generation complete"
        );
        Ok(parsed.response)
    }
}

impl EmbeddingModel for OllamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let body = OllamaEmbeddingRequest {
            model: &self.embedding_model,
            prompt: text,
        };

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_connect() {
                EmbeddingError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                EmbeddingError::Timeout
            } else {
                EmbeddingError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::MalformedResponse(e.to_string()))?;
        if parsed.embedding.is_empty() {
            return Err(EmbeddingError::MalformedResponse("empty embedding".into()));
        }
        Ok(parsed.embedding)
    }

    fn model_name(&self) -> &str {
        &self.embedding_model
    }
}
