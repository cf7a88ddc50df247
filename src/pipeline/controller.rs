//! Pipeline controller.
//!
//! Drives one patient request through the run state machine:
//! structuring → context → (selection → review → confidence gate)* → outcome.
//!
//! Uses trait-based injection for the generation and embedding services so the
//! controller runs unchanged against [`ScriptedGenerator`](super::generation::ScriptedGenerator)
//! in tests. The rate limiter is the only state shared between runs.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::models::{
    AttemptRecord, EnrichedContext, EscalationReason, PatientError, PatientRecord, PipelineRun,
    ReviewFeedback, ReviewResult, RiskFindings, RunOutcome, RunState, SelectionResult, Stage,
    Verdict,
};
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::catalog::CatalogHandle;
use crate::pipeline::embedding::{EmbeddingError, EmbeddingModel};
use crate::pipeline::generation::{GenerationClient, GenerationError, GenerationPrompt};
use crate::pipeline::matcher::{build_query, ProtocolMatcher};
use crate::pipeline::parser::{parse_review, parse_selection, parse_selection_score};
use crate::pipeline::prompt::{
    build_review_prompt, build_scoring_prompt, build_selection_prompt, REVIEW_SYSTEM_PROMPT,
    SCORING_SYSTEM_PROMPT, SELECTION_SYSTEM_PROMPT,
};
use crate::pipeline::rate_limit::RateLimiter;
use crate::pipeline::risk::{apply_safety_override, RiskAssessor};
use crate::pipeline::validation::{OutputValidator, Validated};
use crate::pipeline_config::PipelineConfig;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Caller fault. Never retried.
    #[error("Invalid patient input: {0}")]
    InvalidInput(#[from] PatientError),

    #[error("External service failure during {operation} after {attempts} attempt(s): {message}")]
    ExternalService {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("Pipeline run cancelled")]
    Cancelled,
}

/// How a stage attempt ended when it produced nothing usable.
enum StageError {
    /// Local retry budget exhausted. The cycle is recorded as failed.
    Local(String),
    /// Ends the run.
    Fatal(PipelineError),
}

impl From<PipelineError> for StageError {
    fn from(e: PipelineError) -> Self {
        Self::Fatal(e)
    }
}

/// Failures the external-call loop knows how to classify.
trait Retryable: fmt::Display {
    fn is_retryable(&self) -> bool;
}

impl Retryable for GenerationError {
    fn is_retryable(&self) -> bool {
        GenerationError::is_retryable(self)
    }
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        EmbeddingError::is_retryable(self)
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct PipelineController<G, E> {
    config: PipelineConfig,
    generator: G,
    embedder: E,
    limiter: Arc<RateLimiter>,
    catalog: CatalogHandle,
    matcher: ProtocolMatcher,
    assessor: RiskAssessor,
    validator: OutputValidator,
}

impl<G: GenerationClient, E: EmbeddingModel> PipelineController<G, E> {
    /// `limiter` is shared by every controller talking to the same service.
    pub fn new(
        config: PipelineConfig,
        generator: G,
        embedder: E,
        limiter: Arc<RateLimiter>,
        catalog: CatalogHandle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            matcher: ProtocolMatcher::new(config.matcher.clone()),
            assessor: RiskAssessor::new(config.thresholds.clone()),
            validator: OutputValidator::new(config.gate.ungrounded_concern_penalty),
            config,
            generator,
            embedder,
            limiter,
            catalog,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn catalog(&self) -> &CatalogHandle {
        &self.catalog
    }

    /// Run one patient request, assessing lab staleness against the current time.
    pub async fn run(&self, raw: &Value, cancel: &CancelToken) -> Result<PipelineRun, PipelineError> {
        self.run_at(raw, Utc::now(), cancel).await
    }

    /// Run one patient request with an explicit `as_of` instant.
    ///
    /// Returns the finished run for every terminal outcome. External-service
    /// exhaustion escalates with the best attempt so far, or fails when there
    /// is none. `Err` is reserved for invalid input and cancellation.
    pub async fn run_at(
        &self,
        raw: &Value,
        as_of: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<PipelineRun, PipelineError> {
        let mut run = PipelineRun::new(Utc::now());
        let span = tracing::info_span!(
            "pipeline_run",
            run_id = %run.id(),
            patient_id = tracing::field::Empty
        );

        async {
            match self.drive(&mut run, raw, as_of, cancel).await {
                Ok(()) => {}
                Err(e @ PipelineError::ExternalService { .. }) => {
                    tracing::error!(error = %e, "Run stopped on external service");
                    match run.best_attempt().cloned() {
                        Some(best) => run.finish(RunOutcome::Escalated {
                            reason: EscalationReason::ServiceFailure,
                            best_attempt: Some(best),
                        }),
                        None => run.finish(RunOutcome::Failed {
                            reason: e.to_string(),
                        }),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, state = %run.state(), "Run aborted");
                    return Err(e);
                }
            }

            let report = run.report();
            tracing::info!(
                outcome = %report.outcome,
                cycles = run.cycle(),
                confidence = ?report.confidence,
                requires_human_review = report.requires_human_review,
                "Run finished"
            );
            Ok(run)
        }
        .instrument(span)
        .await
    }

    /// Run several patients concurrently. Results keep input order; one
    /// patient's failure never affects another's.
    pub async fn run_batch(
        &self,
        patients: &[Value],
        cancel: &CancelToken,
    ) -> Vec<Result<PipelineRun, PipelineError>> {
        let as_of = Utc::now();
        tracing::info!(patients = patients.len(), "Starting batch");
        join_all(patients.iter().map(|raw| self.run_at(raw, as_of, cancel))).await
    }

    // ── State machine ─────────────────────────────────────────

    async fn drive(
        &self,
        run: &mut PipelineRun,
        raw: &Value,
        as_of: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<(), PipelineError> {
        // Structuring
        let record = PatientRecord::from_raw(raw)?;
        run.set_patient(&record.patient_id);
        tracing::Span::current().record("patient_id", record.patient_id.as_str());
        if !record.normalization_notes.is_empty() {
            tracing::debug!(notes = record.normalization_notes.len(), "Patient input normalized");
        }

        let findings = self.assessor.assess(&record, as_of);
        run.set_risk_findings(findings.clone());

        // Context
        let catalog = self.catalog.snapshot();
        let query = build_query(&record);
        let query_vector = self
            .call_external("query embedding", None, cancel, || self.embedder.embed(&query))
            .await?;
        let context = EnrichedContext {
            id: Uuid::new_v4(),
            catalog_version: catalog.version().to_string(),
            candidates: self.matcher.rank(&query_vector, &catalog),
            query,
        };
        let candidate_count = context.candidates.len();
        run.set_context(context.clone());
        run.advance(
            RunState::ContextBuilt,
            format!("{candidate_count} candidate(s) above relevance threshold"),
        );
        tracing::info!(
            context_id = %context.id,
            catalog_version = %context.catalog_version,
            candidates = candidate_count,
            "Context built"
        );

        if context.candidates.is_empty() {
            run.finish(RunOutcome::Escalated {
                reason: EscalationReason::NoProtocolMatch,
                best_attempt: None,
            });
            return Ok(());
        }

        // Selection / review loop
        let gate = &self.config.gate;
        let mut feedback: Option<ReviewFeedback> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let cycle = run.begin_cycle();
            run.advance(RunState::Selecting, format!("cycle {cycle} of {}", gate.max_cycles));

            let mut attempt = AttemptRecord::new(cycle);
            let cycle_result = self
                .run_cycle(run, &mut attempt, &record, &context, &findings, feedback.as_ref(), cancel)
                .await;
            if let Err(e) = &cycle_result {
                attempt.failure = Some(e.to_string());
            }
            run.record_attempt(attempt.clone());
            cycle_result?;
            run.advance(RunState::ConfidenceGate, gate_note(&attempt));

            if let (Some(selection), Some(review)) = (&attempt.selection, &attempt.review) {
                let passes = review.verdict == Verdict::Approved
                    && review.adjusted_confidence >= gate.acceptance_threshold
                    && cycle >= gate.min_cycles;
                if passes {
                    run.advance(RunState::Finalizing, "confidence gate passed");
                    run.finish(RunOutcome::Accepted {
                        selection: selection.clone(),
                        review: review.clone(),
                    });
                    return Ok(());
                }
            }

            if cycle >= gate.max_cycles {
                match run.best_attempt().cloned() {
                    Some(best) => run.finish(RunOutcome::Escalated {
                        reason: escalation_reason(&best),
                        best_attempt: Some(best),
                    }),
                    None => run.finish(RunOutcome::Failed {
                        reason: format!(
                            "no valid selection and review after {cycle} cycle(s)"
                        ),
                    }),
                }
                return Ok(());
            }

            tracing::info!(
                cycle,
                confidence = ?attempt.confidence(),
                "Confidence gate not met, retrying with feedback"
            );
            feedback = Some(match (&attempt.review, &attempt.failure) {
                (Some(review), _) => ReviewFeedback::from_review(review),
                (None, Some(note)) => ReviewFeedback::from_failure(note.clone()),
                (None, None) => ReviewFeedback::default(),
            });
        }
    }

    /// Fill `attempt` with this cycle's work. On `Err` it holds whatever was
    /// validated before the failure.
    #[allow(clippy::too_many_arguments)]
    async fn run_cycle(
        &self,
        run: &mut PipelineRun,
        attempt: &mut AttemptRecord,
        record: &PatientRecord,
        context: &EnrichedContext,
        findings: &RiskFindings,
        feedback: Option<&ReviewFeedback>,
        cancel: &CancelToken,
    ) -> Result<(), PipelineError> {
        let selection = match self.select(record, context, feedback, cancel).await {
            Ok(validated) => validated,
            Err(StageError::Local(note)) => {
                attempt.failure = Some(note);
                return Ok(());
            }
            Err(StageError::Fatal(e)) => return Err(e),
        };
        attempt.corrections.extend(selection.corrections);
        let selection = selection.value;
        attempt.selection = Some(selection.clone());

        attempt.selection_score = self.score(record, &selection, findings, cancel).await?;

        run.advance(
            RunState::Reviewing,
            format!(
                "selected {}",
                selection.primary_protocol().unwrap_or("nothing")
            ),
        );

        match self.review(record, context, &selection, findings, cancel).await {
            Ok(validated) => {
                attempt.corrections.extend(validated.corrections);
                attempt.review = Some(validated.value);
            }
            Err(StageError::Local(note)) => attempt.failure = Some(note),
            Err(StageError::Fatal(e)) => return Err(e),
        }
        Ok(())
    }

    // ── Stages ────────────────────────────────────────────────

    async fn select(
        &self,
        record: &PatientRecord,
        context: &EnrichedContext,
        feedback: Option<&ReviewFeedback>,
        cancel: &CancelToken,
    ) -> Result<Validated<SelectionResult>, StageError> {
        let backoff = self.config.stage.backoff();
        let attempts = self.config.stage.local_retries + 1;
        let mut refusal: Option<String> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                self.pause(backoff.delay_for(attempt - 1), cancel).await?;
            }

            let prompt = GenerationPrompt {
                stage: Stage::Selection,
                model: self.config.generation.selection_model.clone(),
                system: SELECTION_SYSTEM_PROMPT.to_string(),
                user: build_selection_prompt(record, context, feedback, refusal.as_deref()),
            };
            let raw = self.generate(&prompt, cancel).await?;

            let problem = match parse_selection(&raw) {
                Ok(draft) => match self.validator.validate_selection(draft, context) {
                    Ok(validated) => return Ok(validated),
                    Err(e) => e.to_string(),
                },
                Err(e) => e.to_string(),
            };
            tracing::warn!(
                stage = "selection",
                attempt = attempt + 1,
                of = attempts,
                error = %problem,
                "Stage output refused"
            );
            refusal = Some(problem);
        }

        Err(StageError::Local(format!(
            "selection refused {attempts} time(s): {}",
            refusal.unwrap_or_default()
        )))
    }

    async fn review(
        &self,
        record: &PatientRecord,
        context: &EnrichedContext,
        selection: &SelectionResult,
        findings: &RiskFindings,
        cancel: &CancelToken,
    ) -> Result<Validated<ReviewResult>, StageError> {
        let backoff = self.config.stage.backoff();
        let attempts = self.config.stage.local_retries + 1;
        let prompt = GenerationPrompt {
            stage: Stage::Review,
            model: self.config.generation.review_model.clone(),
            system: REVIEW_SYSTEM_PROMPT.to_string(),
            user: build_review_prompt(record, context, selection, findings),
        };
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                self.pause(backoff.delay_for(attempt - 1), cancel).await?;
            }

            let raw = self.generate(&prompt, cancel).await?;
            match parse_review(&raw) {
                Ok(draft) => {
                    let mut validated = self.validator.validate_review(draft, context, findings);
                    if let Some(correction) = apply_safety_override(&mut validated.value, findings) {
                        validated.corrections.push(correction);
                    }
                    return Ok(validated);
                }
                Err(e) => {
                    tracing::warn!(
                        stage = "review",
                        attempt = attempt + 1,
                        of = attempts,
                        error = %e,
                        "Stage output refused"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(StageError::Local(format!(
            "review unparseable {attempts} time(s): {last_error}"
        )))
    }

    /// Independent grade of a validated selection. Only cancellation is an
    /// error; any other failure leaves the score unset.
    async fn score(
        &self,
        record: &PatientRecord,
        selection: &SelectionResult,
        findings: &RiskFindings,
        cancel: &CancelToken,
    ) -> Result<Option<f32>, PipelineError> {
        let Some(model) = &self.config.generation.scoring_model else {
            return Ok(None);
        };
        let prompt = GenerationPrompt {
            stage: Stage::Scoring,
            model: model.clone(),
            system: SCORING_SYSTEM_PROMPT.to_string(),
            user: build_scoring_prompt(record, selection, findings),
        };

        let raw = match self.generate(&prompt, cancel).await {
            Ok(raw) => raw,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "Selection scoring unavailable");
                return Ok(None);
            }
        };
        match parse_selection_score(&raw) {
            Ok(score) => {
                tracing::debug!(score, "Selection scored");
                Ok(Some(score))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Selection score unparseable");
                Ok(None)
            }
        }
    }

    // ── External calls ────────────────────────────────────────

    async fn generate(
        &self,
        prompt: &GenerationPrompt,
        cancel: &CancelToken,
    ) -> Result<String, PipelineError> {
        let operation = match prompt.stage {
            Stage::Selection => "selection generation",
            Stage::Review => "review generation",
            Stage::Scoring => "selection scoring",
        };
        self.call_external(operation, Some(self.limiter.as_ref()), cancel, || {
            self.generator.generate(prompt)
        })
        .await
    }

    /// Call an external service with a per-call timeout, retrying transient
    /// failures with exponential backoff up to `external.max_attempts`.
    /// With a limiter, every attempt first waits for its own permit.
    async fn call_external<T, CallErr, F, Fut>(
        &self,
        operation: &'static str,
        limiter: Option<&RateLimiter>,
        cancel: &CancelToken,
        mut call: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallErr>>,
        CallErr: Retryable,
    {
        let external = &self.config.external;
        let policy = external.backoff();
        let timeout = external.call_timeout();
        let max_attempts = external.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            if let Some(limiter) = limiter {
                match cancel.run(limiter.acquire()).await {
                    None => return Err(PipelineError::Cancelled),
                    Some(Err(e)) => {
                        return Err(PipelineError::ExternalService {
                            operation,
                            attempts: attempt,
                            message: e.to_string(),
                        })
                    }
                    Some(Ok(permit)) if !permit.waited.is_zero() => {
                        tracing::debug!(
                            operation,
                            waited_ms = permit.waited.as_millis() as u64,
                            "Rate limiter delayed call"
                        );
                    }
                    Some(Ok(_)) => {}
                }
            }

            let outcome = cancel
                .run(tokio::time::timeout(timeout, call()))
                .await
                .ok_or(PipelineError::Cancelled)?;

            let message = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_retryable() => {
                    return Err(PipelineError::ExternalService {
                        operation,
                        attempts: attempt,
                        message: e.to_string(),
                    })
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {timeout:?}"),
            };

            if attempt >= max_attempts {
                return Err(PipelineError::ExternalService {
                    operation,
                    attempts: attempt,
                    message,
                });
            }

            let delay = policy.delay_for(attempt - 1);
            tracing::warn!(
                operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "External call failed, backing off"
            );
            self.pause(delay, cancel).await?;
        }
    }

    async fn pause(&self, delay: Duration, cancel: &CancelToken) -> Result<(), PipelineError> {
        if delay.is_zero() {
            return Ok(());
        }
        cancel
            .run(tokio::time::sleep(delay))
            .await
            .ok_or(PipelineError::Cancelled)
    }
}

fn escalation_reason(best: &AttemptRecord) -> EscalationReason {
    match &best.review {
        Some(review) if review.safety_override => EscalationReason::SafetyOverride,
        _ => EscalationReason::LowConfidence,
    }
}

fn gate_note(attempt: &AttemptRecord) -> String {
    match (&attempt.review, &attempt.failure) {
        (Some(review), _) => format!(
            "verdict {}, confidence {:.2}",
            review.verdict, review.adjusted_confidence
        ),
        (None, Some(failure)) => format!("cycle failed: {failure}"),
        (None, None) => "cycle produced no review".to_string(),
    }
}
