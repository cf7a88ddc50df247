use std::fmt::Write;

use crate::models::{
    EnrichedContext, PatientRecord, ReviewFeedback, RiskFindings, SelectionResult,
};

pub const SELECTION_SYSTEM_PROMPT: &str = r#"You are a radiology protocol selection assistant. You choose the imaging protocol that best fits a patient's clinical picture from a fixed list of candidates.

RULES — ABSOLUTE, NO EXCEPTIONS:
1. Choose ONLY from the candidate protocol ids listed in <candidates>. Never invent an id.
2. List the primary protocol first. Alternatives, if any, follow in order of preference.
3. Consider renal function and contrast safety notes for every contrast protocol.
4. If reviewer feedback is present, address every concern it raises.
5. Confidence is a number between 0 and 1.

OUTPUT FORMAT:
A single JSON object wrapped in ```json``` fences, nothing else."#;

pub const REVIEW_SYSTEM_PROMPT: &str = r#"You are a clinical safety reviewer for imaging protocol recommendations. You check a proposed protocol against the patient's risk findings and the protocol safety notes.

RULES — ABSOLUTE, NO EXCEPTIONS:
1. Every safety concern MUST cite either a risk flag from <risk_findings> or a candidate protocol id whose safety notes support it.
2. Do not raise concerns you cannot support from the material provided.
3. verdict is "approved" or "rejected".
4. corrected_protocol, if given, MUST be one of the candidate ids.
5. confidence is a number between 0 and 1 expressing how safe and appropriate the proposal is.

OUTPUT FORMAT:
A single JSON object wrapped in ```json``` fences, nothing else."#;

pub const SCORING_SYSTEM_PROMPT: &str = r#"You grade imaging protocol recommendations made by another assistant. Judge whether the proposed protocol is correct and appropriate for this patient given the risk findings.

Return ONLY a JSON object with a single key "selection_confidence" between 0 and 1."#;

fn push_patient(prompt: &mut String, record: &PatientRecord) {
    prompt.push_str("<patient>\n");
    let _ = writeln!(prompt, "Primary diagnosis: {}", record.primary_diagnosis);
    if let Some(age) = record.demographics.age_years {
        let _ = writeln!(prompt, "Age: {age}");
    }
    if let Some(sex) = &record.demographics.sex {
        let _ = writeln!(prompt, "Sex: {sex}");
    }
    for fact in record.clinical_facts() {
        let _ = writeln!(prompt, "- {fact}");
    }
    let _ = writeln!(prompt, "Record completeness: {:.0}%", record.completeness_pct());
    prompt.push_str("</patient>\n\n");
}

fn push_candidates(prompt: &mut String, context: &EnrichedContext) {
    prompt.push_str("<candidates>\n");
    for candidate in &context.candidates {
        let _ = writeln!(
            prompt,
            "[{}] {} (relevance {:.2}, quality {:.2})",
            candidate.protocol_id, candidate.title, candidate.score, candidate.quality_score
        );
        for note in &candidate.safety_notes {
            let _ = writeln!(prompt, "  Safety note: {note}");
        }
        for snippet in &candidate.snippets {
            let _ = writeln!(prompt, "  Evidence: {snippet}");
        }
    }
    prompt.push_str("</candidates>\n\n");
}

fn push_findings(prompt: &mut String, findings: &RiskFindings) {
    prompt.push_str("<risk_findings>\n");
    if findings.is_empty() {
        prompt.push_str("None\n");
    }
    for finding in findings.iter() {
        let _ = writeln!(
            prompt,
            "{} ({}): observed {} [{}]",
            finding.flag, finding.severity, finding.observed, finding.threshold
        );
    }
    prompt.push_str("</risk_findings>\n\n");
}

fn push_proposal(prompt: &mut String, selection: &SelectionResult) {
    prompt.push_str("<proposal>\n");
    let _ = writeln!(prompt, "Protocols: {}", selection.protocol_ids.join(", "));
    let _ = writeln!(prompt, "Rationale: {}", selection.rationale);
    let _ = writeln!(prompt, "Selector confidence: {:.2}", selection.confidence);
    prompt.push_str("</proposal>\n\n");
}

/// Selection prompt. `feedback` carries the previous cycle's review;
/// `correction` explains why the previous answer in this cycle was refused.
pub fn build_selection_prompt(
    record: &PatientRecord,
    context: &EnrichedContext,
    feedback: Option<&ReviewFeedback>,
    correction: Option<&str>,
) -> String {
    let mut prompt = String::new();
    push_patient(&mut prompt, record);
    push_candidates(&mut prompt, context);

    if let Some(feedback) = feedback {
        prompt.push_str("<reviewer_feedback>\n");
        if let Some(previous) = feedback.previous_confidence {
            let _ = writeln!(prompt, "Previous confidence: {previous:.2}");
        }
        if let Some(note) = &feedback.failure_note {
            let _ = writeln!(prompt, "Previous attempt failed: {note}");
        }
        for concern in &feedback.concerns {
            let _ = writeln!(prompt, "Concern: {}", concern.description);
        }
        for recommendation in &feedback.recommendations {
            let _ = writeln!(prompt, "Recommendation: {recommendation}");
        }
        prompt.push_str("</reviewer_feedback>\n\n");
    }

    if let Some(correction) = correction {
        let _ = writeln!(prompt, "Your previous answer was rejected: {correction}\n");
    }

    prompt.push_str(
        r#"Return:
```json
{
  "protocol_ids": ["candidate id, primary first"],
  "rationale": "why this protocol fits the patient",
  "confidence": 0.0
}
```"#,
    );
    prompt
}

pub fn build_review_prompt(
    record: &PatientRecord,
    context: &EnrichedContext,
    selection: &SelectionResult,
    findings: &RiskFindings,
) -> String {
    let mut prompt = String::new();
    push_patient(&mut prompt, record);
    push_candidates(&mut prompt, context);
    push_findings(&mut prompt, findings);
    push_proposal(&mut prompt, selection);

    prompt.push_str(
        r#"Return:
```json
{
  "verdict": "approved | rejected",
  "confidence": 0.0,
  "safety_concerns": [
    {"description": "concern", "cited_flag": "flag name or null", "cited_protocol": "candidate id or null"}
  ],
  "recommendations": ["recommendation"],
  "corrected_protocol": "candidate id or null"
}
```"#,
    );
    prompt
}

/// Independent grade of a selection, without the candidate evidence.
pub fn build_scoring_prompt(
    record: &PatientRecord,
    selection: &SelectionResult,
    findings: &RiskFindings,
) -> String {
    let mut prompt = String::new();
    push_patient(&mut prompt, record);
    push_findings(&mut prompt, findings);
    push_proposal(&mut prompt, selection);
    prompt.push_str("Example:\n{\"selection_confidence\": 0.87}");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProtocolCandidate, RiskFinding, RiskFlag, SafetyConcern, Severity};
    use uuid::Uuid;

    fn record() -> PatientRecord {
        PatientRecord::from_raw(&serde_json::json!({
            "patient_id": "P-9",
            "primary_diagnosis": "suspected pulmonary embolism",
            "egfr": 38,
            "age": 71
        }))
        .unwrap()
    }

    fn context() -> EnrichedContext {
        EnrichedContext {
            id: Uuid::new_v4(),
            catalog_version: "v".into(),
            query: "q".into(),
            candidates: vec![ProtocolCandidate {
                protocol_id: "ctpa".into(),
                title: "CT Pulmonary Angiography".into(),
                score: 0.91,
                quality_score: 0.8,
                snippets: vec!["Guideline: CTPA first line".into()],
                safety_notes: vec!["Iodinated contrast; check eGFR".into()],
            }],
        }
    }

    #[test]
    fn selection_prompt_lists_candidates_and_facts() {
        let prompt = build_selection_prompt(&record(), &context(), None, None);
        assert!(prompt.contains("Primary diagnosis: suspected pulmonary embolism"));
        assert!(prompt.contains("[ctpa] CT Pulmonary Angiography"));
        assert!(prompt.contains("Safety note: Iodinated contrast"));
        assert!(prompt.contains("eGFR: 38"));
        assert!(!prompt.contains("<reviewer_feedback>"));
    }

    #[test]
    fn selection_prompt_threads_feedback_and_correction() {
        let feedback = ReviewFeedback {
            concerns: vec![SafetyConcern {
                description: "Reduced renal function".into(),
                cited_flag: Some("RenalCaution".into()),
                cited_protocol: None,
            }],
            recommendations: vec!["Consider non-contrast alternative".into()],
            previous_confidence: Some(0.6),
            failure_note: None,
        };
        let prompt = build_selection_prompt(
            &record(),
            &context(),
            Some(&feedback),
            Some("protocol 'ct-head' is not a candidate"),
        );
        assert!(prompt.contains("Previous confidence: 0.60"));
        assert!(prompt.contains("Concern: Reduced renal function"));
        assert!(prompt.contains("Recommendation: Consider non-contrast alternative"));
        assert!(prompt.contains("'ct-head' is not a candidate"));
    }

    #[test]
    fn review_prompt_includes_findings_and_proposal() {
        let findings = RiskFindings::new(vec![RiskFinding {
            flag: RiskFlag::RenalCaution,
            severity: Severity::Warning,
            observed: 38.0,
            threshold: "30 <= eGFR < 45".into(),
        }]);
        let selection = SelectionResult {
            protocol_ids: vec!["ctpa".into()],
            rationale: "first line".into(),
            confidence: 0.8,
            context_id: Uuid::nil(),
        };
        let prompt = build_review_prompt(&record(), &context(), &selection, &findings);
        assert!(prompt.contains("RenalCaution (warning): observed 38"));
        assert!(prompt.contains("Protocols: ctpa"));
    }

    #[test]
    fn scoring_prompt_omits_candidate_evidence() {
        let selection = SelectionResult {
            protocol_ids: vec!["ctpa".into()],
            rationale: "first line".into(),
            confidence: 0.8,
            context_id: Uuid::nil(),
        };
        let prompt = build_scoring_prompt(&record(), &selection, &RiskFindings::default());
        assert!(prompt.contains("Protocols: ctpa"));
        assert!(prompt.contains("<risk_findings>\nNone"));
        assert!(prompt.contains("selection_confidence"));
        assert!(!prompt.contains("<candidates>"));
    }
}
