//! Grounding checks on generated output.
//!
//! Selections must stay inside the candidate list they were given; a miss is
//! an error the controller retries. Reviews are corrected instead: concerns
//! with no support in the risk findings or the catalog safety notes are
//! stripped and recorded, so extra caution never fails a run on its own.

use thiserror::Error;

use crate::models::{
    Correction, CorrectionKind, EnrichedContext, ReviewResult, RiskFindings, RiskFlag,
    SafetyConcern, SelectionResult, Stage,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Ungrounded {stage} output: protocol '{protocol_id}' is not among the supplied candidates")]
    UngroundedOutput { stage: Stage, protocol_id: String },

    #[error("Selection named no protocol")]
    EmptySelection,
}

/// Output plus every change made to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated<T> {
    pub value: T,
    pub corrections: Vec<Correction>,
}

impl<T> Validated<T> {
    pub fn unchanged(value: T) -> Self {
        Self {
            value,
            corrections: Vec::new(),
        }
    }

    pub fn was_corrected(&self) -> bool {
        !self.corrections.is_empty()
    }
}

pub struct OutputValidator {
    /// Confidence removed per stripped concern.
    concern_penalty: f32,
}

impl OutputValidator {
    pub fn new(concern_penalty: f32) -> Self {
        Self {
            concern_penalty: concern_penalty.clamp(0.0, 1.0),
        }
    }

    pub fn validate_selection(
        &self,
        mut selection: SelectionResult,
        context: &EnrichedContext,
    ) -> Result<Validated<SelectionResult>, ValidationError> {
        let mut seen = std::collections::HashSet::new();
        selection
            .protocol_ids
            .retain(|id| !id.trim().is_empty() && seen.insert(id.clone()));

        if selection.protocol_ids.is_empty() {
            return Err(ValidationError::EmptySelection);
        }

        if let Some(unknown) = selection.protocol_ids.iter().find(|id| !context.contains(id)) {
            tracing::warn!(
                context_id = %context.id,
                candidates = context.candidates.len(),
                "Selection named a protocol outside the candidate list"
            );
            return Err(ValidationError::UngroundedOutput {
                stage: Stage::Selection,
                protocol_id: unknown.clone(),
            });
        }

        selection.context_id = context.id;
        selection.confidence = clamp_unit(selection.confidence);
        Ok(Validated::unchanged(selection))
    }

    pub fn validate_review(
        &self,
        mut review: ReviewResult,
        context: &EnrichedContext,
        findings: &RiskFindings,
    ) -> Validated<ReviewResult> {
        let mut corrections = Vec::new();

        let (kept, stripped): (Vec<SafetyConcern>, Vec<SafetyConcern>) = review
            .safety_concerns
            .into_iter()
            .partition(|concern| is_grounded(concern, context, findings));
        review.safety_concerns = kept;

        for concern in &stripped {
            corrections.push(Correction {
                stage: Stage::Review,
                kind: CorrectionKind::StrippedConcern,
                detail: format!(
                    "unsupported concern removed (cited flag: {}, cited protocol: {}): {}",
                    concern.cited_flag.as_deref().unwrap_or("none"),
                    concern.cited_protocol.as_deref().unwrap_or("none"),
                    concern.description
                ),
            });
        }

        if let Some(corrected) = review.corrected_protocol.take() {
            if context.contains(&corrected) {
                review.corrected_protocol = Some(corrected);
            } else {
                corrections.push(Correction {
                    stage: Stage::Review,
                    kind: CorrectionKind::DroppedCorrectedProtocol,
                    detail: format!("corrected protocol '{corrected}' is not a candidate"),
                });
            }
        }

        let original = clamp_unit(review.adjusted_confidence);
        review.adjusted_confidence = original;
        if !stripped.is_empty() && self.concern_penalty > 0.0 {
            let penalised =
                clamp_unit(original - self.concern_penalty * stripped.len() as f32);
            review.adjusted_confidence = penalised;
            corrections.push(Correction {
                stage: Stage::Review,
                kind: CorrectionKind::ConfidencePenalised,
                detail: format!(
                    "confidence {original:.2} -> {penalised:.2} for {} stripped concern(s)",
                    stripped.len()
                ),
            });
        }

        if !corrections.is_empty() {
            tracing::info!(
                context_id = %context.id,
                stripped = stripped.len(),
                corrections = corrections.len(),
                "Review output corrected"
            );
        }

        Validated {
            value: review,
            corrections,
        }
    }
}

fn is_grounded(concern: &SafetyConcern, context: &EnrichedContext, findings: &RiskFindings) -> bool {
    let flag_supported = concern
        .cited_flag
        .as_deref()
        .and_then(parse_flag_loose)
        .is_some_and(|flag| findings.contains(flag));

    let note_supported = concern
        .cited_protocol
        .as_deref()
        .and_then(|id| context.candidate(id))
        .is_some_and(|candidate| !candidate.safety_notes.is_empty());

    flag_supported || note_supported
}

/// Match a flag name ignoring case, spaces and separators
/// ("renal_high_risk", "Renal High Risk", "RenalHighRisk").
pub fn parse_flag_loose(text: &str) -> Option<RiskFlag> {
    let wanted = squash(text);
    RiskFlag::ALL.into_iter().find(|flag| squash(flag.as_str()) == wanted)
}

pub(crate) fn squash(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
