//! Pipeline configuration consumed by the orchestration core.
//!
//! Every value has a default, so a partial JSON file (or none at all) yields a
//! usable configuration. The controller, rate limiter, matcher and risk
//! assessor read their limits from here; none of them owns these numbers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::pipeline::retry::BackoffPolicy;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Full configuration surface of the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub rate_limit: RateLimitConfig,
    pub matcher: MatcherConfig,
    pub gate: GateConfig,
    pub stage: StageRetryConfig,
    pub external: ExternalCallConfig,
    pub thresholds: ClinicalThresholds,
    pub generation: GenerationConfig,
}

/// Shared limit on outbound generation calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum admissions in any window.
    pub ceiling: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Token bucket capacity. Bounds how many calls may go out back-to-back.
    pub burst: u32,
    /// How long `acquire()` may wait before giving up.
    pub acquire_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ceiling: 12,
            window_secs: 60,
            burst: 3,
            acquire_timeout_secs: 90,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Candidate ranking policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Minimum cosine similarity for a protocol to be a candidate.
    pub relevance_threshold: f32,
    pub top_k: usize,
    /// Supporting snippets attached to each candidate.
    pub max_snippets: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: 0.6,
            top_k: 3,
            max_snippets: 3,
        }
    }
}

/// Confidence gate and selection/review loop bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub acceptance_threshold: f32,
    /// Retry ceiling: total selection/review cycles a run may perform.
    pub max_cycles: u32,
    /// Cycles that must complete before the gate may accept.
    pub min_cycles: u32,
    /// Confidence removed from a review per stripped ungrounded concern.
    pub ungrounded_concern_penalty: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.75,
            max_cycles: 3,
            min_cycles: 1,
            ungrounded_concern_penalty: 0.05,
        }
    }
}

/// Same-stage retries for malformed or ungrounded model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRetryConfig {
    /// Extra generation attempts after the first one within a single stage.
    pub local_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for StageRetryConfig {
    fn default() -> Self {
        Self {
            local_retries: 2,
            backoff_initial_ms: 250,
            backoff_max_ms: 2_000,
        }
    }
}

impl StageRetryConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            multiplier: 2,
            jitter: Duration::ZERO,
        }
    }
}

/// Timeout and backoff for transport-level failures of external services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalCallConfig {
    pub call_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: u32,
    pub jitter_ms: u64,
}

impl Default for ExternalCallConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 120,
            max_attempts: 3,
            backoff_initial_ms: 500,
            backoff_max_ms: 8_000,
            backoff_multiplier: 2,
            jitter_ms: 0,
        }
    }
}

impl ExternalCallConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            multiplier: self.backoff_multiplier,
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }
}

/// Fixed clinical thresholds evaluated by the risk assessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicalThresholds {
    /// eGFR below this (mL/min/1.73m²) is high renal risk.
    pub egfr_high_risk: f64,
    /// eGFR below this (and at or above `egfr_high_risk`) warrants caution.
    pub egfr_caution: f64,
    /// Creatinine at or above this (mg/dL) is high.
    pub creatinine_high: f64,
    pub creatinine_attention: f64,
    /// Potassium at or above this (mEq/L) is critical.
    pub potassium_critical: f64,
    pub potassium_warning: f64,
    /// Labs older than this are stale.
    pub stale_lab_hours: i64,
}

impl Default for ClinicalThresholds {
    fn default() -> Self {
        Self {
            egfr_high_risk: 30.0,
            egfr_caution: 45.0,
            creatinine_high: 1.5,
            creatinine_attention: 1.1,
            potassium_critical: 5.5,
            potassium_warning: 5.0,
            stale_lab_hours: 48,
        }
    }
}

/// Where the generation and embedding services live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub selection_model: String,
    pub review_model: String,
    pub embedding_model: String,
    /// Grades each valid selection independently of the review. Unset skips the call.
    pub scoring_model: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            selection_model: "medgemma:27b".into(),
            review_model: "medgemma:27b".into(),
            embedding_model: "nomic-embed-text".into(),
            scoring_model: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════

impl PipelineConfig {
    /// Reject values the core cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        if rl.ceiling == 0 || rl.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.ceiling and rate_limit.window_secs must be positive".into(),
            ));
        }
        if rl.burst == 0 || rl.burst > rl.ceiling {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.burst must be in 1..={}",
                rl.ceiling
            )));
        }

        if !unit_interval(self.matcher.relevance_threshold) {
            return Err(ConfigError::Invalid(
                "matcher.relevance_threshold must be within [0, 1]".into(),
            ));
        }
        if self.matcher.top_k == 0 {
            return Err(ConfigError::Invalid("matcher.top_k must be positive".into()));
        }

        let gate = &self.gate;
        if !unit_interval(gate.acceptance_threshold) || !unit_interval(gate.ungrounded_concern_penalty) {
            return Err(ConfigError::Invalid(
                "gate thresholds must be within [0, 1]".into(),
            ));
        }
        if gate.max_cycles == 0 {
            return Err(ConfigError::Invalid("gate.max_cycles must be positive".into()));
        }
        if gate.min_cycles > gate.max_cycles {
            return Err(ConfigError::Invalid(
                "gate.min_cycles cannot exceed gate.max_cycles".into(),
            ));
        }

        if self.external.max_attempts == 0 || self.external.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "external.max_attempts and external.call_timeout_secs must be positive".into(),
            ));
        }

        let t = &self.thresholds;
        if t.egfr_high_risk >= t.egfr_caution
            || t.creatinine_attention >= t.creatinine_high
            || t.potassium_warning >= t.potassium_critical
        {
            return Err(ConfigError::Invalid(
                "clinical threshold bands are inverted".into(),
            ));
        }
        if self
            .generation
            .scoring_model
            .as_deref()
            .is_some_and(|m| m.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "generation.scoring_model cannot be empty".into(),
            ));
        }

        if t.stale_lab_hours <= 0 {
            return Err(ConfigError::Invalid(
                "thresholds.stale_lab_hours must be positive".into(),
            ));
        }

        Ok(())
    }
}

fn unit_interval(value: f32) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
