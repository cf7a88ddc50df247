use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{Stage, Verdict};

/// A catalog protocol that cleared the relevance floor for this patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolCandidate {
    pub protocol_id: String,
    pub title: String,
    pub score: f32,
    pub quality_score: f32,
    pub snippets: Vec<String>,
    pub safety_notes: Vec<String>,
}

/// Patient context plus ranked candidates. Built once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedContext {
    pub id: Uuid,
    pub catalog_version: String,
    pub query: String,
    pub candidates: Vec<ProtocolCandidate>,
}

impl EnrichedContext {
    pub fn candidate(&self, protocol_id: &str) -> Option<&ProtocolCandidate> {
        self.candidates.iter().find(|c| c.protocol_id == protocol_id)
    }

    pub fn contains(&self, protocol_id: &str) -> bool {
        self.candidate(protocol_id).is_some()
    }
}

/// Output of the selection stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    /// Chosen protocols, primary first. Never empty once validated.
    pub protocol_ids: Vec<String>,
    pub rationale: String,
    pub confidence: f32,
    /// The [`EnrichedContext`] this selection was derived from.
    pub context_id: Uuid,
}

impl SelectionResult {
    pub fn primary_protocol(&self) -> Option<&str> {
        self.protocol_ids.first().map(String::as_str)
    }
}

/// A safety concern raised by the review stage.
///
/// A concern is grounded only when it cites a risk flag that was actually
/// raised, or a candidate protocol carrying an explicit safety note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConcern {
    pub description: String,
    /// Risk flag name as cited by the model (may not be a real flag).
    pub cited_flag: Option<String>,
    /// Protocol whose safety note the concern relies on.
    pub cited_protocol: Option<String>,
}

/// Output of the review stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub verdict: Verdict,
    pub adjusted_confidence: f32,
    pub safety_concerns: Vec<SafetyConcern>,
    pub recommendations: Vec<String>,
    pub corrected_protocol: Option<String>,
    /// Set when a critical risk finding forced the verdict to rejected.
    pub safety_override: bool,
}

/// What the next selection attempt is told about the previous cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub concerns: Vec<SafetyConcern>,
    pub recommendations: Vec<String>,
    pub previous_confidence: Option<f32>,
    /// Set when the previous cycle produced no usable result.
    pub failure_note: Option<String>,
}

impl ReviewFeedback {
    pub fn from_review(review: &ReviewResult) -> Self {
        Self {
            concerns: review.safety_concerns.clone(),
            recommendations: review.recommendations.clone(),
            previous_confidence: Some(review.adjusted_confidence),
            failure_note: None,
        }
    }

    pub fn from_failure(note: impl Into<String>) -> Self {
        Self {
            failure_note: Some(note.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    /// A concern with no support in findings or catalog notes was removed.
    StrippedConcern,
    /// A corrected protocol outside the candidate list was dropped.
    DroppedCorrectedProtocol,
    /// Confidence was lowered to account for stripped claims.
    ConfidencePenalised,
    /// A critical finding forced the verdict to rejected.
    VerdictOverridden,
}

/// Auditable record of a change made to generated output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub stage: Stage,
    pub kind: CorrectionKind,
    pub detail: String,
}
