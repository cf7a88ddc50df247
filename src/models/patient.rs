//! Patient record: the immutable input of one pipeline run.
//!
//! Built only through [`PatientRecord::from_raw`], which accepts loosely shaped
//! JSON (nested `labs`/`vitals` objects, aliased field names, numeric strings
//! with units) and normalizes it. Every numeric field is either present or
//! explicitly `None`. Completeness is derived from the fields on demand, so a
//! caller-supplied percentage is never trusted.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatientError {
    #[error("Patient input must be a JSON object")]
    NotAnObject,

    #[error("Required identifier missing: {0}")]
    MissingIdentifier(&'static str),

    #[error("Primary diagnosis is required to select a protocol")]
    MissingDiagnosis,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    pub age_years: Option<f64>,
    pub sex: Option<String>,
    pub weight_kg: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabPanel {
    /// mL/min/1.73m²
    pub egfr: Option<f64>,
    /// mg/dL
    pub creatinine: Option<f64>,
    /// mEq/L
    pub potassium: Option<f64>,
    pub sodium: Option<f64>,
    pub bun: Option<f64>,
    pub hemoglobin: Option<f64>,
    pub glucose: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    pub heart_rate: Option<f64>,
    pub systolic_bp: Option<f64>,
    pub diastolic_bp: Option<f64>,
    pub spo2: Option<f64>,
    pub temperature_c: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: String,
    pub mrn: Option<String>,
    pub demographics: Demographics,
    pub labs: LabPanel,
    pub vitals: Vitals,
    pub primary_diagnosis: String,
    pub lab_timestamp: Option<DateTime<Utc>>,
    /// What normalization changed or dropped (field names only, no values).
    pub normalization_notes: Vec<String>,
}

/// Nested objects whose members are lifted to the top level.
const NESTED_SECTIONS: &[&str] = &["labs", "lab_values", "vitals", "vital_signs", "demographics"];

/// Messy field names mapped to canonical names (keys already lower-snake-cased).
const FIELD_ALIASES: &[(&str, &str)] = &[
    // identifiers
    ("id", "patient_id"),
    ("patientid", "patient_id"),
    ("patient", "patient_id"),
    ("medical_record_number", "mrn"),
    // demographics
    ("age", "age_years"),
    ("gender", "sex"),
    ("weight", "weight_kg"),
    // potassium
    ("potassium_meq_l", "potassium"),
    ("potassium_mmol_l", "potassium"),
    ("k", "potassium"),
    ("k_meq_l", "potassium"),
    ("k_mmol_l", "potassium"),
    ("serum_potassium", "potassium"),
    // bun
    ("bun_mg_dl", "bun"),
    ("bun_mgdl", "bun"),
    ("bun_mmol_l", "bun"),
    // creatinine
    ("creatinine_mg_dl", "creatinine"),
    ("creatinine_mgdl", "creatinine"),
    ("serum_creatinine", "creatinine"),
    ("cr", "creatinine"),
    // egfr
    ("gfr", "egfr"),
    ("egfr_ckd_epi", "egfr"),
    ("estimated_gfr", "egfr"),
    // other labs
    ("na", "sodium"),
    ("serum_sodium", "sodium"),
    ("hgb", "hemoglobin"),
    ("hb", "hemoglobin"),
    ("blood_glucose", "glucose"),
    // vitals
    ("hr", "heart_rate"),
    ("pulse", "heart_rate"),
    ("sbp", "systolic_bp"),
    ("dbp", "diastolic_bp"),
    ("o2_sat", "spo2"),
    ("oxygen_saturation", "spo2"),
    ("temp", "temperature_c"),
    ("temperature", "temperature_c"),
    ("bp", "blood_pressure"),
    // clinical context
    ("diagnosis", "primary_diagnosis"),
    ("dx", "primary_diagnosis"),
    ("lab_time", "lab_timestamp"),
    ("lab_date", "lab_timestamp"),
    ("labs_collected_at", "lab_timestamp"),
    ("completeness", "completeness_pct"),
];

static LEADING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([-+]?\d+(?:\.\d+)?)").expect("valid regex"));

impl PatientRecord {
    /// Validate and normalize a raw patient payload.
    pub fn from_raw(raw: &Value) -> Result<Self, PatientError> {
        let object = raw.as_object().ok_or(PatientError::NotAnObject)?;

        // The HTTP surface historically wrapped the record as {"sample_patient": {...}}.
        let object = match object.get("sample_patient") {
            Some(Value::Object(inner)) if object.len() == 1 => inner,
            _ => object,
        };

        let fields = flatten_and_normalize(object);
        let mut notes = Vec::new();

        let patient_id = text_field(&fields, "patient_id")
            .ok_or(PatientError::MissingIdentifier("patient_id"))?;
        let primary_diagnosis =
            text_field(&fields, "primary_diagnosis").ok_or(PatientError::MissingDiagnosis)?;

        if fields.contains_key("completeness_pct") {
            notes.push("caller-supplied completeness ignored".to_string());
        }

        let mut number = |key: &'static str| numeric_field(&fields, key, &mut notes);

        let demographics = Demographics {
            age_years: number("age_years"),
            sex: text_field(&fields, "sex"),
            weight_kg: number("weight_kg"),
        };
        let labs = LabPanel {
            egfr: number("egfr"),
            creatinine: number("creatinine"),
            potassium: number("potassium"),
            sodium: number("sodium"),
            bun: number("bun"),
            hemoglobin: number("hemoglobin"),
            glucose: number("glucose"),
        };
        let mut vitals = Vitals {
            heart_rate: number("heart_rate"),
            systolic_bp: number("systolic_bp"),
            diastolic_bp: number("diastolic_bp"),
            spo2: number("spo2"),
            temperature_c: number("temperature_c"),
        };

        // "120/80" style blood pressure fills whichever side is still missing.
        if let Some((sys, dia)) = fields.get("blood_pressure").and_then(split_blood_pressure) {
            vitals.systolic_bp = vitals.systolic_bp.or(Some(sys));
            vitals.diastolic_bp = vitals.diastolic_bp.or(Some(dia));
        }

        let lab_timestamp = match fields.get("lab_timestamp") {
            None | Some(Value::Null) => None,
            Some(value) => {
                let parsed = value.as_str().and_then(parse_timestamp);
                if parsed.is_none() {
                    notes.push("lab_timestamp unparseable, treated as missing".to_string());
                }
                parsed
            }
        };

        Ok(Self {
            patient_id,
            mrn: text_field(&fields, "mrn"),
            demographics,
            labs,
            vitals,
            primary_diagnosis,
            lab_timestamp,
            normalization_notes: notes,
        })
    }

    /// Percentage of tracked numeric fields (labs, vitals, age, weight) present
    /// plus the lab timestamp. Always recomputed from the record itself.
    pub fn completeness_pct(&self) -> f32 {
        let tracked = self.tracked_fields();
        let present = tracked.iter().filter(|present| **present).count();
        (present as f32 / tracked.len() as f32) * 100.0
    }

    fn tracked_fields(&self) -> [bool; 15] {
        let l = &self.labs;
        let v = &self.vitals;
        let d = &self.demographics;
        [
            d.age_years.is_some(),
            d.weight_kg.is_some(),
            l.egfr.is_some(),
            l.creatinine.is_some(),
            l.potassium.is_some(),
            l.sodium.is_some(),
            l.bun.is_some(),
            l.hemoglobin.is_some(),
            l.glucose.is_some(),
            v.heart_rate.is_some(),
            v.systolic_bp.is_some(),
            v.diastolic_bp.is_some(),
            v.spo2.is_some(),
            v.temperature_c.is_some(),
            self.lab_timestamp.is_some(),
        ]
    }

    /// Key clinical facts as short labelled lines, used for the matcher query
    /// and the generation prompts.
    pub fn clinical_facts(&self) -> Vec<String> {
        let mut facts = Vec::new();
        let mut push = |label: &str, value: Option<f64>, unit: &str| {
            if let Some(v) = value {
                facts.push(format!("{label}: {v} {unit}").trim_end().to_string());
            }
        };
        push("eGFR", self.labs.egfr, "mL/min/1.73m2");
        push("Creatinine", self.labs.creatinine, "mg/dL");
        push("Potassium", self.labs.potassium, "mEq/L");
        push("Sodium", self.labs.sodium, "mEq/L");
        push("BUN", self.labs.bun, "mg/dL");
        push("Hemoglobin", self.labs.hemoglobin, "g/dL");
        push("Glucose", self.labs.glucose, "mg/dL");
        push("Heart rate", self.vitals.heart_rate, "bpm");
        push("Systolic BP", self.vitals.systolic_bp, "mmHg");
        push("Diastolic BP", self.vitals.diastolic_bp, "mmHg");
        push("SpO2", self.vitals.spo2, "%");
        push("Age", self.demographics.age_years, "years");
        push("Weight", self.demographics.weight_kg, "kg");
        facts
    }
}

// ═══════════════════════════════════════════════════════════
// Normalization helpers
// ═══════════════════════════════════════════════════════════

fn canonical_key(key: &str) -> String {
    let normalized: String = key
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect();
    FIELD_ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(normalized)
}

/// Lift nested sections to the top level and canonicalize every key.
/// Top-level values win over nested ones with the same canonical key.
fn flatten_and_normalize(object: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in object {
        let lowered = key.trim().to_lowercase();
        if NESTED_SECTIONS.contains(&lowered.as_str()) {
            if let Value::Object(inner) = value {
                for (inner_key, inner_value) in inner {
                    out.entry(canonical_key(inner_key))
                        .or_insert_with(|| inner_value.clone());
                }
                continue;
            }
        }
        out.insert(canonical_key(key), value.clone());
    }
    out
}

fn text_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn numeric_field(fields: &Map<String, Value>, key: &str, notes: &mut Vec<String>) -> Option<f64> {
    let value = match fields.get(key) {
        None | Some(Value::Null) => return None,
        Some(value) => value,
    };
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_leading_number(s),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() && v >= 0.0 => Some(v),
        _ => {
            notes.push(format!("{key} not a usable number, treated as missing"));
            None
        }
    }
}

/// "1.4 mg/dL" → 1.4
fn parse_leading_number(text: &str) -> Option<f64> {
    LEADING_NUMBER
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn split_blood_pressure(value: &Value) -> Option<(f64, f64)> {
    let text = value.as_str()?;
    let (sys, dia) = text.split_once('/')?;
    Some((parse_leading_number(sys)?, parse_leading_number(dia)?))
}

/// RFC 3339, naive "YYYY-MM-DD HH:MM:SS" / "YYYY-MM-DDTHH:MM:SS" (taken as
/// UTC) or a bare date (midnight UTC).
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Decode a patient file: a JSON document, a header line followed by one
/// comma-separated value line, or anything else as `{"raw_text": ...}`.
pub fn patient_input_from_text(text: &str) -> Value {
    let text = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return value;
    }

    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    if let (Some(header), Some(values)) = (lines.next(), lines.next()) {
        let header = split_csv_line(header);
        let numeric_lead = header.first().is_some_and(|h| h.parse::<f64>().is_ok());
        if header.len() > 1 && !numeric_lead {
            let record: Map<String, Value> = header
                .into_iter()
                .zip(split_csv_line(values))
                .filter(|(key, value)| !key.is_empty() && !value.is_empty())
                .map(|(key, value)| (key, Value::String(value)))
                .collect();
            return Value::Object(record);
        }
    }

    let mut raw = Map::new();
    raw.insert("raw_text".into(), Value::String(text.to_string()));
    Value::Object(raw)
}

fn split_csv_line(line: &str) -> Vec<String> {
    line.split(',')
        .map(|cell| cell.trim().trim_matches('"').trim().to_string())
        .collect()
}
