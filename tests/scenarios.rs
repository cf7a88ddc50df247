//! End-to-end runs against scripted services.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::time::Instant;

use imaging_orchestrator::models::{
    CorrectionKind, EscalationReason, ProtocolEntry, RiskFlag, RunOutcome, RunState, Severity,
    Stage, Verdict,
};
use imaging_orchestrator::pipeline::catalog::build_catalog;
use imaging_orchestrator::pipeline::{
    CancelHandle, CancelToken, CatalogHandle, FixedEmbedder, GenerationClient, GenerationError,
    GenerationPrompt, PipelineController, PipelineError, RateLimiter, ScriptedGenerator,
};
use imaging_orchestrator::pipeline_config::PipelineConfig;

// ═══════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════

fn entry(id: &str, title: &str, embedding: Vec<f32>, notes: &[&str]) -> ProtocolEntry {
    serde_json::from_value(json!({
        "id": id,
        "title": title,
        "modality": "CT",
        "quality_score": 0.8,
        "renal_safety_notes": notes,
        "embedding": embedding,
    }))
    .unwrap()
}

/// `ctpa` and `mra-chest` match the default query vector; `ct-head` never does.
fn catalog() -> CatalogHandle {
    CatalogHandle::new(
        build_catalog(vec![
            entry(
                "ctpa",
                "CT Pulmonary Angiography",
                vec![1.0, 0.0, 0.0],
                &["Iodinated contrast: hold if eGFR < 30"],
            ),
            entry("mra-chest", "MR Angiography Chest", vec![0.8, 0.6, 0.0], &[]),
            entry("ct-head", "CT Head Non-Contrast", vec![0.0, 1.0, 0.0], &[]),
        ])
        .unwrap(),
    )
}

fn embedder() -> FixedEmbedder {
    FixedEmbedder::new(vec![1.0, 0.0, 0.0])
}

fn controller<G: GenerationClient>(
    config: PipelineConfig,
    generator: G,
    embedder: FixedEmbedder,
) -> PipelineController<G, FixedEmbedder> {
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    PipelineController::new(config, generator, embedder, limiter, catalog()).unwrap()
}

fn as_of() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

fn patient(id: &str) -> Value {
    json!({
        "patient_id": id,
        "primary_diagnosis": "suspected pulmonary embolism",
        "age": 64,
        "lab_timestamp": "2025-03-01T08:00:00Z"
    })
}

fn selection(id: &str) -> String {
    format!(
        "```json\n{{\"protocol_ids\": [\"{id}\"], \"rationale\": \"matches presentation\", \"confidence\": 0.8}}\n```"
    )
}

fn review(verdict: &str, confidence: f32) -> String {
    format!(
        "```json\n{{\"verdict\": \"{verdict}\", \"confidence\": {confidence}, \"safety_concerns\": [], \"recommendations\": [\"Confirm renal function\"]}}\n```"
    )
}

// ═══════════════════════════════════════════════════════════
// Scenarios
// ═══════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn critical_labs_force_rejection_whatever_the_model_says() {
    let approving_review = r#"{"verdict": "approved", "confidence": 0.95,
        "safety_concerns": [{"description": "Severely reduced renal function", "cited_flag": "RenalHighRisk"}]}"#;
    let generator = ScriptedGenerator::new()
        .fallback(Stage::Selection, selection("ctpa"))
        .fallback(Stage::Review, approving_review);
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let mut raw = patient("A-1");
    raw["egfr"] = json!(20);
    raw["potassium"] = json!(6.0);
    let run = controller.run_at(&raw, as_of(), &CancelToken::never()).await.unwrap();

    let findings: Vec<(RiskFlag, Severity)> =
        run.risk_findings().iter().map(|f| (f.flag, f.severity)).collect();
    assert_eq!(
        findings,
        vec![
            (RiskFlag::RenalHighRisk, Severity::Critical),
            (RiskFlag::PotassiumCritical, Severity::Critical),
        ]
    );

    for attempt in run.attempts() {
        let review = attempt.review.as_ref().unwrap();
        assert_eq!(review.verdict, Verdict::Rejected);
        assert!(review.safety_override);
        assert!(attempt
            .corrections
            .iter()
            .any(|c| c.kind == CorrectionKind::VerdictOverridden));
    }

    assert_eq!(run.state(), RunState::Escalated);
    assert!(matches!(
        run.outcome(),
        Some(RunOutcome::Escalated {
            reason: EscalationReason::SafetyOverride,
            best_attempt: Some(_),
        })
    ));
    let report = run.report();
    assert_eq!(report.verdict, Some(Verdict::Rejected));
    assert!(report.reason.starts_with("critical risk findings overrode the review"));
    assert!(report.requires_human_review);
}

#[tokio::test(start_paused = true)]
async fn no_candidate_above_threshold_escalates() {
    let controller = controller(
        PipelineConfig::default(),
        ScriptedGenerator::new(),
        FixedEmbedder::new(vec![0.0, 0.0, 1.0]),
    );
    let raw = json!({"patient_id": "B-1", "primary_diagnosis": "unknown syndrome X"});

    let run = controller.run_at(&raw, as_of(), &CancelToken::never()).await.unwrap();

    assert_eq!(run.state(), RunState::Escalated);
    assert!(run.context().unwrap().candidates.is_empty());
    assert_eq!(run.report().reason, "no protocol match");
    assert!(matches!(
        run.outcome(),
        Some(RunOutcome::Escalated {
            reason: EscalationReason::NoProtocolMatch,
            best_attempt: None
        })
    ));
    assert!(controller.generator().calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn three_low_confidence_cycles_escalate_with_best_attempt() {
    let generator = ScriptedGenerator::new()
        .fallback(Stage::Selection, selection("ctpa"))
        .then_text(Stage::Review, review("approved", 0.5))
        .then_text(Stage::Review, review("approved", 0.6))
        .then_text(Stage::Review, review("approved", 0.7));
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let run = controller
        .run_at(&patient("C-1"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Escalated);
    assert_eq!(run.cycle(), 3);
    assert_eq!(run.attempts().len(), 3);
    assert_eq!(run.report().reason, "low confidence — requires human review");

    let best = match run.outcome() {
        Some(RunOutcome::Escalated {
            reason: EscalationReason::LowConfidence,
            best_attempt: Some(best),
        }) => best,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(best.cycle, 3);
    assert!((best.confidence().unwrap() - 0.7).abs() < 1e-6);
    assert!((run.report().confidence.unwrap() - 0.7).abs() < 1e-6);

    let generator = controller.generator();
    assert_eq!(generator.call_count(Stage::Selection), 3);
    assert_eq!(generator.call_count(Stage::Review), 3);

    // Feedback from each review reaches the next selection prompt.
    let selections: Vec<_> = generator
        .calls()
        .into_iter()
        .filter(|c| c.stage == Stage::Selection)
        .collect();
    assert!(!selections[0].user.contains("<reviewer_feedback>"));
    assert!(selections[1].user.contains("Previous confidence: 0.50"));
    assert!(selections[2].user.contains("Previous confidence: 0.60"));
    assert!(selections[2].user.contains("Recommendation: Confirm renal function"));
}

#[tokio::test(start_paused = true)]
async fn ungrounded_selection_is_retried_within_the_stage() {
    let generator = ScriptedGenerator::new()
        .then_text(Stage::Selection, selection("ct-head"))
        .then_text(Stage::Selection, selection("ctpa"))
        .then_text(Stage::Review, review("approved", 0.9));
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let run = controller
        .run_at(&patient("D-1"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Accepted);
    assert_eq!(run.cycle(), 1);
    assert_eq!(run.report().chosen_protocol.as_deref(), Some("ctpa"));

    let calls = controller.generator().calls();
    assert_eq!(controller.generator().call_count(Stage::Selection), 2);
    assert!(calls[1].user.contains("'ct-head' is not among the supplied candidates"));

    let states: Vec<RunState> = run.transitions().iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            RunState::Structuring,
            RunState::ContextBuilt,
            RunState::Selecting,
            RunState::Reviewing,
            RunState::ConfidenceGate,
            RunState::Finalizing,
            RunState::Accepted,
        ]
    );
}

// ═══════════════════════════════════════════════════════════
// Loop bounds
// ═══════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn retry_ceiling_is_never_exceeded() {
    let mut config = PipelineConfig::default();
    config.gate.max_cycles = 2;
    let generator = ScriptedGenerator::new()
        .fallback(Stage::Selection, selection("ctpa"))
        .fallback(Stage::Review, review("approved", 0.6));
    let controller = controller(config, generator, embedder());

    let run = controller
        .run_at(&patient("E-1"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Escalated);
    assert_eq!(run.attempts().len(), 2);
    assert_eq!(controller.generator().call_count(Stage::Review), 2);
    assert!(run.transitions().iter().all(|t| t.to != RunState::Accepted));
}

#[tokio::test(start_paused = true)]
async fn confident_rejection_is_not_accepted() {
    let generator = ScriptedGenerator::new()
        .fallback(Stage::Selection, selection("ctpa"))
        .fallback(Stage::Review, review("rejected", 0.95));
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let run = controller
        .run_at(&patient("E-2"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Escalated);
    assert_eq!(run.report().verdict, Some(Verdict::Rejected));
}

#[tokio::test(start_paused = true)]
async fn selection_that_never_grounds_fails_the_run() {
    let generator = ScriptedGenerator::new().fallback(Stage::Selection, selection("ct-head"));
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let run = controller
        .run_at(&patient("E-3"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Failed);
    assert_eq!(run.report().reason, "no valid selection and review after 3 cycle(s)");
    // Three cycles, each with one attempt plus two local retries.
    assert_eq!(controller.generator().call_count(Stage::Selection), 9);
    assert_eq!(controller.generator().call_count(Stage::Review), 0);
    assert!(run.attempts().iter().all(|a| a.failure.is_some()));
}

#[tokio::test(start_paused = true)]
async fn unparseable_review_counts_as_a_failed_cycle() {
    let generator = ScriptedGenerator::new()
        .fallback(Stage::Selection, selection("ctpa"))
        .then_text(Stage::Review, "I think it looks fine.")
        .then_text(Stage::Review, "{}")
        .then_text(Stage::Review, "")
        .then_text(Stage::Review, review("approved", 0.9));
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let run = controller
        .run_at(&patient("E-4"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Accepted);
    assert_eq!(run.cycle(), 2);
    let first = &run.attempts()[0];
    assert!(first.selection.is_some());
    assert!(first.review.is_none());
    assert!(first.failure.as_deref().unwrap().starts_with("review unparseable"));
}

// ═══════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn ungrounded_concern_is_stripped_and_run_still_accepted() {
    let reply = r#"{"verdict": "approved", "confidence": 0.9,
        "safety_concerns": [{"description": "Hyperkalemia risk", "cited_flag": "PotassiumCritical"}]}"#;
    let generator = ScriptedGenerator::new()
        .then_text(Stage::Selection, selection("ctpa"))
        .then_text(Stage::Review, reply);
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let run = controller
        .run_at(&patient("F-1"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Accepted);
    let attempt = &run.attempts()[0];
    let kinds: Vec<CorrectionKind> = attempt.corrections.iter().map(|c| c.kind).collect();
    assert!(kinds.contains(&CorrectionKind::StrippedConcern));
    assert!(kinds.contains(&CorrectionKind::ConfidencePenalised));

    let review = attempt.review.as_ref().unwrap();
    assert!(review.safety_concerns.is_empty());
    assert!((review.adjusted_confidence - 0.85).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn concern_citing_a_catalog_safety_note_is_kept() {
    let reply = r#"{"verdict": "approved", "confidence": 0.8,
        "safety_concerns": [{"description": "Contrast load", "cited_protocol": "ctpa"}]}"#;
    let generator = ScriptedGenerator::new()
        .then_text(Stage::Selection, selection("ctpa"))
        .then_text(Stage::Review, reply);
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let run = controller
        .run_at(&patient("F-2"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    let review = run.attempts()[0].review.as_ref().unwrap();
    assert_eq!(review.safety_concerns.len(), 1);
    assert!(run.attempts()[0].corrections.is_empty());
}

// ═══════════════════════════════════════════════════════════
// Concurrency, cancellation, failures
// ═══════════════════════════════════════════════════════════

/// Records when each generation call reached the service.
struct Clocked {
    inner: ScriptedGenerator,
    stamps: Mutex<Vec<Instant>>,
}

impl GenerationClient for Clocked {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String, GenerationError> {
        self.stamps.lock().unwrap().push(Instant::now());
        self.inner.generate(prompt).await
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_share_the_rate_ceiling() {
    let mut config = PipelineConfig::default();
    config.rate_limit.ceiling = 4;
    config.rate_limit.window_secs = 10;
    config.rate_limit.burst = 2;
    let window = Duration::from_secs(10);

    let generator = Clocked {
        inner: ScriptedGenerator::new()
            .fallback(Stage::Selection, selection("ctpa"))
            .fallback(Stage::Review, review("approved", 0.9)),
        stamps: Mutex::new(Vec::new()),
    };
    let controller = controller(config, generator, embedder());

    let patients: Vec<Value> = (0..6).map(|i| patient(&format!("G-{i}"))).collect();
    let results = controller.run_batch(&patients, &CancelToken::never()).await;

    for result in &results {
        assert_eq!(result.as_ref().unwrap().state(), RunState::Accepted);
    }

    let stamps = controller.generator().stamps.lock().unwrap().clone();
    assert_eq!(stamps.len(), 12);
    for &start in &stamps {
        let in_window = stamps
            .iter()
            .filter(|&&t| t >= start && t < start + window)
            .count();
        assert!(in_window <= 4, "{in_window} calls inside one window");
    }
}

#[tokio::test(start_paused = true)]
async fn one_bad_patient_does_not_affect_the_batch() {
    let generator = ScriptedGenerator::new()
        .fallback(Stage::Selection, selection("ctpa"))
        .fallback(Stage::Review, review("approved", 0.9));
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let patients = vec![
        patient("H-1"),
        json!({"patient_id": "H-2"}),
        patient("H-3"),
    ];
    let results = controller.run_batch(&patients, &CancelToken::never()).await;

    assert_eq!(results[0].as_ref().unwrap().state(), RunState::Accepted);
    assert!(matches!(results[1], Err(PipelineError::InvalidInput(_))));
    assert_eq!(results[2].as_ref().unwrap().patient_id(), Some("H-3"));
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_stops_at_the_next_suspension_point() {
    let generator = ScriptedGenerator::new().fallback(Stage::Selection, selection("ctpa"));
    let controller = controller(PipelineConfig::default(), generator, embedder());
    let (handle, token) = CancelHandle::new();
    handle.cancel();

    let result = controller.run_at(&patient("I-1"), as_of(), &token).await;
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert!(controller.generator().calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn generation_outage_fails_only_that_run() {
    let generator = ScriptedGenerator::new()
        .then_fail(Stage::Selection, GenerationError::Connection("svc".into()))
        .then_fail(Stage::Selection, GenerationError::Connection("svc".into()))
        .then_fail(Stage::Selection, GenerationError::Connection("svc".into()));
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let run = controller
        .run_at(&patient("J-1"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Failed);
    let report = run.report();
    assert!(report.reason.starts_with("External service failure during selection generation"));
    assert!(!report.audit_history.transitions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn review_outage_after_a_valid_cycle_escalates_with_full_history() {
    let generator = ScriptedGenerator::new()
        .fallback(Stage::Selection, selection("ctpa"))
        .then_text(Stage::Review, review("approved", 0.7))
        .then_fail(Stage::Review, GenerationError::Connection("svc".into()))
        .then_fail(Stage::Review, GenerationError::Connection("svc".into()))
        .then_fail(Stage::Review, GenerationError::Connection("svc".into()));
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let run = controller
        .run_at(&patient("J-2"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Escalated);
    assert_eq!(run.attempts().len(), 2);

    let interrupted = &run.attempts()[1];
    assert_eq!(interrupted.cycle, 2);
    assert_eq!(
        interrupted.selection.as_ref().unwrap().primary_protocol(),
        Some("ctpa")
    );
    assert!(interrupted.review.is_none());
    assert!(interrupted
        .failure
        .as_deref()
        .unwrap()
        .contains("review generation after 3 attempt(s)"));

    let best = match run.outcome() {
        Some(RunOutcome::Escalated {
            reason: EscalationReason::ServiceFailure,
            best_attempt: Some(best),
        }) => best,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(best.cycle, 1);

    let report = run.report();
    assert!(report.requires_human_review);
    assert_eq!(report.chosen_protocol.as_deref(), Some("ctpa"));
    assert!((report.confidence.unwrap() - 0.7).abs() < 1e-6);
    assert_eq!(report.audit_history.attempts.len(), 2);
}

// ═══════════════════════════════════════════════════════════
// Selection scoring
// ═══════════════════════════════════════════════════════════

fn scoring_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.generation.scoring_model = Some("grader".into());
    config
}

#[tokio::test(start_paused = true)]
async fn selection_score_is_recorded_next_to_the_review() {
    let generator = ScriptedGenerator::new()
        .then_text(Stage::Selection, selection("ctpa"))
        .then_text(Stage::Scoring, r#"{"selection_confidence": 0.82}"#)
        .then_text(Stage::Review, review("approved", 0.9));
    let controller = controller(scoring_config(), generator, embedder());

    let run = controller
        .run_at(&patient("S-1"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Accepted);
    let attempt = &run.attempts()[0];
    assert!((attempt.selection_score.unwrap() - 0.82).abs() < 1e-6);
    assert!(attempt.review.is_some());

    let calls = controller.generator().calls();
    let stages: Vec<Stage> = calls.iter().map(|c| c.stage).collect();
    assert_eq!(stages, vec![Stage::Selection, Stage::Scoring, Stage::Review]);
    assert_eq!(calls[1].model, "grader");
    assert!(calls[1].user.contains("Protocols: ctpa"));
}

#[tokio::test(start_paused = true)]
async fn failed_scoring_leaves_the_score_unset_and_the_run_intact() {
    let generator = ScriptedGenerator::new()
        .then_text(Stage::Selection, selection("ctpa"))
        .then_fail(
            Stage::Scoring,
            GenerationError::Service {
                status: 404,
                body: "model 'grader' not found".into(),
            },
        )
        .then_text(Stage::Review, review("approved", 0.9));
    let controller = controller(scoring_config(), generator, embedder());

    let run = controller
        .run_at(&patient("S-2"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Accepted);
    assert_eq!(run.attempts()[0].selection_score, None);
    assert_eq!(controller.generator().call_count(Stage::Scoring), 1);
}

#[tokio::test(start_paused = true)]
async fn scoring_is_skipped_without_a_scoring_model() {
    let generator = ScriptedGenerator::new()
        .then_text(Stage::Selection, selection("ctpa"))
        .then_text(Stage::Review, review("approved", 0.9));
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let run = controller
        .run_at(&patient("S-3"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(run.state(), RunState::Accepted);
    assert_eq!(run.attempts()[0].selection_score, None);
    assert_eq!(controller.generator().call_count(Stage::Scoring), 0);
}

#[tokio::test(start_paused = true)]
async fn runs_pin_the_catalog_snapshot_they_started_with() {
    let generator = ScriptedGenerator::new()
        .fallback(Stage::Selection, selection("ctpa"))
        .fallback(Stage::Review, review("approved", 0.9));
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let first = controller
        .run_at(&patient("K-1"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    controller.catalog().replace(
        build_catalog(vec![entry("ctpa", "CT Pulmonary Angiography v2", vec![1.0, 0.0, 0.0], &[])])
            .unwrap(),
    );
    let second = controller
        .run_at(&patient("K-2"), as_of(), &CancelToken::never())
        .await
        .unwrap();

    assert_ne!(first.catalog_version(), second.catalog_version());
    assert_eq!(
        second.catalog_version(),
        Some(controller.catalog().snapshot().version())
    );
}

#[tokio::test(start_paused = true)]
async fn report_serializes_for_downstream_conversion() {
    let generator = ScriptedGenerator::new()
        .then_text(Stage::Selection, selection("ctpa"))
        .then_text(Stage::Review, review("approved", 0.9));
    let controller = controller(PipelineConfig::default(), generator, embedder());

    let run = controller
        .run_at(&patient("L-1"), as_of(), &CancelToken::never())
        .await
        .unwrap();
    let json = serde_json::to_value(run.report()).unwrap();

    assert_eq!(json["outcome"], "accepted");
    assert_eq!(json["verdict"], "approved");
    assert_eq!(json["chosen_protocol"], "ctpa");
    assert_eq!(json["requires_human_review"], false);
    assert!(json["risk_findings"].is_array() || json["risk_findings"].is_object());
    assert!(json["audit_history"]["transitions"].as_array().unwrap().len() >= 7);
}
