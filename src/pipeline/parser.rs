//! Structured output extraction from raw model text.
//!
//! Models wrap JSON in code fences, prepend thinking blocks, leave trailing
//! commas and rename fields. Extraction tolerates all of that; coercion then
//! maps the loose JSON onto selection and review results. Grounding is not
//! checked here, see `validation`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ReviewResult, SafetyConcern, SelectionResult, Stage, Verdict};

use super::validation::squash;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Model returned empty output")]
    Empty,

    #[error("No JSON object found in model output")]
    NoJsonObject,

    #[error("Invalid JSON in model output: {0}")]
    InvalidJson(String),

    #[error("{stage} output missing required field '{field}'")]
    MissingField { stage: Stage, field: &'static str },

    #[error("{stage} output has unusable value for '{field}'")]
    InvalidField { stage: Stage, field: &'static str },
}

/// Confidence assumed when the model omits one.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

static GEMMA_THOUGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<unused\d+>thought\n.*?<unused\d+>").expect("valid regex"));
static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think(?:ing)?>.*?</think(?:ing)?>").expect("valid regex"));
static UNUSED_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("valid regex"));
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("valid regex"));

/// Strip thinking blocks and stray tokenizer artifacts.
pub fn sanitize_model_output(raw: &str) -> String {
    let mut text = GEMMA_THOUGHT.replace_all(raw, "").into_owned();

    // Unterminated `<unusedN>thought\n...` prefix.
    if let Some(idx) = text.find("<unused") {
        if let Some(offset) = text[idx..].find("thought\n") {
            text = text[idx + offset + "thought\n".len()..].to_string();
        }
    }
    text = THINK_BLOCK.replace_all(&text, "").into_owned();
    text = UNUSED_TOKEN.replace_all(&text, "").into_owned();
    text.trim().to_string()
}

/// Pull the first parseable JSON object out of model text.
pub fn extract_json(raw: &str) -> Result<Map<String, Value>, ParseError> {
    let text = sanitize_model_output(raw);
    if text.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut sources: Vec<&str> = Vec::new();
    if let Some(fenced) = CODE_FENCE.captures(&text).and_then(|c| c.get(1)) {
        sources.push(fenced.as_str().trim());
    }
    sources.push(&text);

    let mut last_error = None;
    for source in sources {
        let mut from = 0;
        while let Some((start, object_text)) = next_balanced_object(source, from) {
            let parsed = serde_json::from_str::<Value>(object_text).or_else(|_| {
                serde_json::from_str(&TRAILING_COMMA.replace_all(object_text, "$1"))
            });
            match parsed {
                Ok(Value::Object(map)) => return Ok(map),
                Ok(_) => last_error = Some(ParseError::NoJsonObject),
                Err(e) => last_error = Some(ParseError::InvalidJson(e.to_string())),
            }
            from = start + 1;
        }
    }

    Err(last_error.unwrap_or(ParseError::NoJsonObject))
}

/// The next `{ ... }` span at or after `from` with balanced braces, ignoring
/// braces inside strings. Returns its start offset and text.
fn next_balanced_object(text: &str, from: usize) -> Option<(usize, &str)> {
    let start = from + text.get(from..)?.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, &text[start..start + offset + 1]));
                }
            }
            _ => {}
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════
// Coercion
// ═══════════════════════════════════════════════════════════

const SELECTION_ID_FIELDS: &[&str] = &[
    "protocol_ids",
    "selected_protocols",
    "protocols",
    "protocol_id",
    "selected_protocol",
    "chosen_protocol",
];
const RATIONALE_FIELDS: &[&str] = &["rationale", "reasoning", "justification", "explanation"];
const CONFIDENCE_FIELDS: &[&str] = &["confidence", "adjusted_confidence", "confidence_score"];
const CONCERN_FIELDS: &[&str] = &["safety_concerns", "concerns", "issues"];
const RECOMMENDATION_FIELDS: &[&str] = &["recommendations", "recommendation", "suggestions"];
const CORRECTED_FIELDS: &[&str] = &["corrected_protocol", "alternative_protocol", "suggested_protocol"];
const SCORE_FIELDS: &[&str] = &["selection_confidence", "agent2_confidence", "score", "confidence"];

/// Parse a selection. `context_id` is bound later by the validator.
pub fn parse_selection(raw: &str) -> Result<SelectionResult, ParseError> {
    let map = extract_json(raw)?;

    let protocol_ids = first_present(&map, SELECTION_ID_FIELDS)
        .map(|v| string_list(v, &["protocol_id", "id"]))
        .ok_or(ParseError::MissingField {
            stage: Stage::Selection,
            field: "protocol_ids",
        })?;
    if protocol_ids.is_empty() {
        return Err(ParseError::InvalidField {
            stage: Stage::Selection,
            field: "protocol_ids",
        });
    }

    Ok(SelectionResult {
        protocol_ids,
        rationale: first_present(&map, RATIONALE_FIELDS)
            .and_then(text_value)
            .unwrap_or_default(),
        confidence: confidence(&map),
        context_id: Uuid::nil(),
    })
}

pub fn parse_review(raw: &str) -> Result<ReviewResult, ParseError> {
    let map = extract_json(raw)?;

    let verdict_text = first_present(&map, &["verdict", "decision", "status"])
        .and_then(text_value)
        .ok_or(ParseError::MissingField {
            stage: Stage::Review,
            field: "verdict",
        })?;
    let verdict = parse_verdict(&verdict_text).ok_or(ParseError::InvalidField {
        stage: Stage::Review,
        field: "verdict",
    })?;

    let safety_concerns = first_present(&map, CONCERN_FIELDS)
        .map(concern_list)
        .unwrap_or_default();
    let recommendations = first_present(&map, RECOMMENDATION_FIELDS)
        .map(|v| string_list(v, &["text", "recommendation", "description"]))
        .unwrap_or_default();
    let corrected_protocol = first_present(&map, CORRECTED_FIELDS).and_then(text_value);

    Ok(ReviewResult {
        verdict,
        adjusted_confidence: confidence(&map),
        safety_concerns,
        recommendations,
        corrected_protocol,
        safety_override: false,
    })
}

/// Parse an independent grade of a selection into [0, 1].
pub fn parse_selection_score(raw: &str) -> Result<f32, ParseError> {
    let map = extract_json(raw)?;
    let value = first_present(&map, SCORE_FIELDS).ok_or(ParseError::MissingField {
        stage: Stage::Scoring,
        field: "selection_confidence",
    })?;
    unit_confidence(value).ok_or(ParseError::InvalidField {
        stage: Stage::Scoring,
        field: "selection_confidence",
    })
}

fn parse_verdict(text: &str) -> Option<Verdict> {
    match squash(text).as_str() {
        "approved" | "approve" | "accept" | "accepted" | "pass" | "ok" => Some(Verdict::Approved),
        "rejected" | "reject" | "denied" | "fail" | "failed" => Some(Verdict::Rejected),
        _ => None,
    }
}

fn first_present<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find(|v| !v.is_null())
}

fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Scalars become one-element lists; objects contribute their first named text field.
fn string_list(value: &Value, object_keys: &[&str]) -> Vec<String> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(obj) => first_present(obj, object_keys).and_then(text_value),
            other => text_value(other),
        })
        .collect()
}

fn concern_list(value: &Value) -> Vec<SafetyConcern> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    items.into_iter().filter_map(concern).collect()
}

fn concern(value: &Value) -> Option<SafetyConcern> {
    match value {
        Value::Object(obj) => {
            let description = first_present(obj, &["description", "concern", "issue", "text"])
                .and_then(text_value)?;
            let cited_flag = first_present(obj, &["cited_flag", "flag", "risk_flag"])
                .and_then(text_value)
                .or_else(|| infer_flag(&description));
            let cited_protocol =
                first_present(obj, &["cited_protocol", "protocol_id", "protocol"]).and_then(text_value);
            Some(SafetyConcern {
                description,
                cited_flag,
                cited_protocol,
            })
        }
        other => {
            let description = text_value(other)?;
            Some(SafetyConcern {
                cited_flag: infer_flag(&description),
                description,
                cited_protocol: None,
            })
        }
    }
}

/// Flag named verbatim somewhere in free text ("... (RenalHighRisk)").
fn infer_flag(text: &str) -> Option<String> {
    let squashed = squash(text);
    crate::models::RiskFlag::ALL
        .into_iter()
        .find(|flag| squashed.contains(&squash(flag.as_str())))
        .map(|flag| flag.as_str().to_string())
}

/// Confidence in [0, 1]; percentages are scaled, missing or junk falls back
/// to [`DEFAULT_CONFIDENCE`].
fn confidence(map: &Map<String, Value>) -> f32 {
    first_present(map, CONFIDENCE_FIELDS)
        .and_then(unit_confidence)
        .unwrap_or(DEFAULT_CONFIDENCE)
}

fn unit_confidence(value: &Value) -> Option<f32> {
    let v = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    }?;
    if !v.is_finite() {
        return None;
    }
    let v = if v > 1.0 && v <= 100.0 { v / 100.0 } else { v };
    Some(v.clamp(0.0, 1.0) as f32)
}
