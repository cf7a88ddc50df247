//! Per-request unit of work and its append-only audit trail.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{RunState, Verdict};
use super::findings::RiskFindings;
use super::results::{Correction, EnrichedContext, ReviewResult, SelectionResult};

/// One state transition. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub seq: u32,
    pub at: DateTime<Utc>,
    pub from: Option<RunState>,
    pub to: RunState,
    pub cycle: u32,
    pub note: String,
}

/// One selection/review cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub cycle: u32,
    pub selection: Option<SelectionResult>,
    pub review: Option<ReviewResult>,
    pub corrections: Vec<Correction>,
    /// Independent grade of the selection, when scoring is configured and succeeded.
    #[serde(default)]
    pub selection_score: Option<f32>,
    /// Why the cycle produced no usable pair, if it didn't.
    pub failure: Option<String>,
}

impl AttemptRecord {
    pub fn new(cycle: u32) -> Self {
        Self {
            cycle,
            selection: None,
            review: None,
            corrections: Vec::new(),
            selection_score: None,
            failure: None,
        }
    }

    pub fn confidence(&self) -> Option<f32> {
        self.review.as_ref().map(|r| r.adjusted_confidence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    NoProtocolMatch,
    LowConfidence,
    /// Critical risk findings forced every review to `rejected`.
    SafetyOverride,
    /// An external service gave out after at least one cycle produced a pair.
    ServiceFailure,
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoProtocolMatch => f.write_str("no protocol match"),
            Self::LowConfidence => f.write_str("low confidence — requires human review"),
            Self::SafetyOverride => {
                f.write_str("critical risk findings overrode the review; requires human review")
            }
            Self::ServiceFailure => {
                f.write_str("external service failure mid-run; requires human review")
            }
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Accepted {
        selection: SelectionResult,
        review: ReviewResult,
    },
    /// Requires human review. Low-confidence escalations retain the best attempt.
    Escalated {
        reason: EscalationReason,
        best_attempt: Option<AttemptRecord>,
    },
    Failed {
        reason: String,
    },
}

impl RunOutcome {
    pub fn state(&self) -> RunState {
        match self {
            Self::Accepted { .. } => RunState::Accepted,
            Self::Escalated { .. } => RunState::Escalated,
            Self::Failed { .. } => RunState::Failed,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Accepted { review, .. } => format!(
                "accepted with confidence {:.2}",
                review.adjusted_confidence
            ),
            Self::Escalated { reason, .. } => reason.to_string(),
            Self::Failed { reason } => reason.clone(),
        }
    }

    fn final_pair(&self) -> Option<(&SelectionResult, &ReviewResult)> {
        match self {
            Self::Accepted { selection, review } => Some((selection, review)),
            Self::Escalated {
                best_attempt: Some(attempt),
                ..
            } => attempt.selection.as_ref().zip(attempt.review.as_ref()),
            _ => None,
        }
    }
}

/// State, history and outcome of one patient request.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    id: Uuid,
    patient_id: Option<String>,
    started_at: DateTime<Utc>,
    state: RunState,
    cycle: u32,
    catalog_version: Option<String>,
    context: Option<EnrichedContext>,
    risk_findings: RiskFindings,
    transitions: Vec<TransitionRecord>,
    attempts: Vec<AttemptRecord>,
    outcome: Option<RunOutcome>,
}

impl PipelineRun {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        let mut run = Self {
            id: Uuid::new_v4(),
            patient_id: None,
            started_at,
            state: RunState::Structuring,
            cycle: 0,
            catalog_version: None,
            context: None,
            risk_findings: RiskFindings::default(),
            transitions: Vec::new(),
            attempts: Vec::new(),
            outcome: None,
        };
        run.push_transition(None, RunState::Structuring, "run created");
        run
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.patient_id.as_deref()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Cycles started so far (1-based once selection begins).
    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn catalog_version(&self) -> Option<&str> {
        self.catalog_version.as_deref()
    }

    pub fn context(&self) -> Option<&EnrichedContext> {
        self.context.as_ref()
    }

    pub fn risk_findings(&self) -> &RiskFindings {
        &self.risk_findings
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    /// Highest review confidence so far; ties keep the earliest cycle.
    pub fn best_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts
            .iter()
            .filter(|a| a.selection.is_some() && a.review.is_some())
            .fold(None, |best: Option<&AttemptRecord>, a| match best {
                Some(b) if b.confidence() >= a.confidence() => Some(b),
                _ => Some(a),
            })
    }

    // ── Mutation (controller only, append-only) ────────────────

    pub(crate) fn set_patient(&mut self, patient_id: &str) {
        self.patient_id = Some(patient_id.to_string());
    }

    pub(crate) fn set_context(&mut self, context: EnrichedContext) {
        self.catalog_version = Some(context.catalog_version.clone());
        self.context = Some(context);
    }

    pub(crate) fn set_risk_findings(&mut self, findings: RiskFindings) {
        self.risk_findings = findings;
    }

    pub(crate) fn begin_cycle(&mut self) -> u32 {
        self.cycle += 1;
        self.cycle
    }

    pub(crate) fn record_attempt(&mut self, attempt: AttemptRecord) {
        self.attempts.push(attempt);
    }

    pub(crate) fn advance(&mut self, to: RunState, note: impl Into<String>) {
        let from = self.state;
        if !from.can_advance_to(to) {
            tracing::error!(run_id = %self.id, from = %from, to = %to, "Illegal run state transition");
            debug_assert!(false, "illegal transition {from} -> {to}");
            return;
        }
        self.state = to;
        self.push_transition(Some(from), to, note);
    }

    pub(crate) fn finish(&mut self, outcome: RunOutcome) {
        let note = outcome.reason();
        self.advance(outcome.state(), note);
        if self.state.is_terminal() {
            self.outcome = Some(outcome);
        }
    }

    fn push_transition(&mut self, from: Option<RunState>, to: RunState, note: impl Into<String>) {
        self.transitions.push(TransitionRecord {
            seq: self.transitions.len() as u32,
            at: Utc::now(),
            from,
            to,
            cycle: self.cycle,
            note: note.into(),
        });
    }

    /// Payload handed to the downstream bundle converter.
    pub fn report(&self) -> PipelineReport {
        let outcome_state = self.outcome.as_ref().map(RunOutcome::state).unwrap_or(self.state);
        let reason = self
            .outcome
            .as_ref()
            .map(RunOutcome::reason)
            .unwrap_or_else(|| "run still in progress".to_string());
        let pair = self.outcome.as_ref().and_then(RunOutcome::final_pair);

        PipelineReport {
            run_id: self.id,
            patient_id: self.patient_id.clone(),
            outcome: outcome_state,
            reason,
            requires_human_review: outcome_state != RunState::Accepted,
            verdict: pair.map(|(_, review)| review.verdict),
            chosen_protocol: pair.and_then(|(selection, review)| {
                review
                    .corrected_protocol
                    .clone()
                    .or_else(|| selection.primary_protocol().map(str::to_string))
            }),
            confidence: pair.map(|(_, review)| review.adjusted_confidence),
            catalog_version: self.catalog_version.clone(),
            risk_findings: self.risk_findings.clone(),
            audit_history: AuditHistory {
                transitions: self.transitions.clone(),
                attempts: self.attempts.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditHistory {
    pub transitions: Vec<TransitionRecord>,
    pub attempts: Vec<AttemptRecord>,
}

/// `{verdict, chosen_protocol, confidence, risk_findings, audit_history}` for
/// conversion into an interoperability bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub patient_id: Option<String>,
    pub outcome: RunState,
    pub reason: String,
    pub requires_human_review: bool,
    pub verdict: Option<Verdict>,
    pub chosen_protocol: Option<String>,
    pub confidence: Option<f32>,
    pub catalog_version: Option<String>,
    pub risk_findings: RiskFindings,
    pub audit_history: AuditHistory,
}
