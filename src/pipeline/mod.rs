pub mod cancel;
pub mod catalog;
pub mod controller;
pub mod embedding;
pub mod generation;
pub mod matcher;
pub mod parser;
pub mod prompt;
pub mod rate_limit;
pub mod retry;
pub mod risk;
pub mod validation;

pub use cancel::{CancelHandle, CancelToken};
pub use catalog::{CatalogError, CatalogHandle, LiteratureSearch, NoLiterature};
pub use controller::{PipelineController, PipelineError};
pub use embedding::{EmbeddingError, EmbeddingModel, FixedEmbedder, HashEmbedder};
pub use generation::{GenerationClient, GenerationError, GenerationPrompt, OllamaClient, ScriptedGenerator};
pub use matcher::ProtocolMatcher;
pub use parser::ParseError;
pub use rate_limit::{RateLimitError, RateLimiter};
pub use retry::BackoffPolicy;
pub use risk::RiskAssessor;
pub use validation::{OutputValidator, Validated, ValidationError};
