//! Deterministic lab/vital threshold rules.
//!
//! Every rule is evaluated on its own; all that apply are emitted in table
//! order. No I/O and no clock reads: lab staleness is judged against the
//! `as_of` instant the caller supplies.

use chrono::{DateTime, Utc};

use crate::models::{
    Correction, CorrectionKind, PatientRecord, ReviewResult, RiskFinding, RiskFindings, RiskFlag,
    Severity, Stage, Verdict,
};
use crate::pipeline_config::ClinicalThresholds;

pub struct RiskAssessor {
    thresholds: ClinicalThresholds,
}

impl RiskAssessor {
    pub fn new(thresholds: ClinicalThresholds) -> Self {
        Self { thresholds }
    }

    pub fn assess(&self, record: &PatientRecord, as_of: DateTime<Utc>) -> RiskFindings {
        let t = &self.thresholds;
        let mut findings = Vec::new();

        if let Some(egfr) = record.labs.egfr {
            if egfr < t.egfr_high_risk {
                findings.push(finding(
                    RiskFlag::RenalHighRisk,
                    Severity::Critical,
                    egfr,
                    format!("eGFR < {}", t.egfr_high_risk),
                ));
            } else if egfr < t.egfr_caution {
                findings.push(finding(
                    RiskFlag::RenalCaution,
                    Severity::Warning,
                    egfr,
                    format!("{} <= eGFR < {}", t.egfr_high_risk, t.egfr_caution),
                ));
            }
        }

        if let Some(creatinine) = record.labs.creatinine {
            if creatinine >= t.creatinine_high {
                findings.push(finding(
                    RiskFlag::CreatinineHigh,
                    Severity::Warning,
                    creatinine,
                    format!("creatinine >= {} mg/dL", t.creatinine_high),
                ));
            } else if creatinine >= t.creatinine_attention {
                findings.push(finding(
                    RiskFlag::CreatinineAttention,
                    Severity::Info,
                    creatinine,
                    format!(
                        "{} <= creatinine < {} mg/dL",
                        t.creatinine_attention, t.creatinine_high
                    ),
                ));
            }
        }

        if let Some(potassium) = record.labs.potassium {
            if potassium >= t.potassium_critical {
                findings.push(finding(
                    RiskFlag::PotassiumCritical,
                    Severity::Critical,
                    potassium,
                    format!("potassium >= {} mEq/L", t.potassium_critical),
                ));
            } else if potassium >= t.potassium_warning {
                findings.push(finding(
                    RiskFlag::PotassiumWarning,
                    Severity::Warning,
                    potassium,
                    format!(
                        "{} <= potassium < {} mEq/L",
                        t.potassium_warning, t.potassium_critical
                    ),
                ));
            }
        }

        if let Some(taken) = record.lab_timestamp {
            let age = as_of.signed_duration_since(taken);
            if age > chrono::Duration::hours(t.stale_lab_hours) {
                findings.push(finding(
                    RiskFlag::StaleLab,
                    Severity::Warning,
                    age.num_minutes() as f64 / 60.0,
                    format!("lab age > {}h", t.stale_lab_hours),
                ));
            }
        }

        RiskFindings::new(findings)
    }
}

fn finding(flag: RiskFlag, severity: Severity, observed: f64, threshold: String) -> RiskFinding {
    RiskFinding {
        flag,
        severity,
        observed,
        threshold,
    }
}

/// Force `rejected` when any finding is critical, whatever the model said.
///
/// Returns the correction when the verdict actually changed.
pub fn apply_safety_override(
    review: &mut ReviewResult,
    findings: &RiskFindings,
) -> Option<Correction> {
    if !findings.has_critical() {
        return None;
    }

    let flags: Vec<&str> = findings.critical_flags().iter().map(|f| f.as_str()).collect();
    review.safety_override = true;
    if review.verdict == Verdict::Rejected {
        return None;
    }

    review.verdict = Verdict::Rejected;
    tracing::warn!(flags = ?flags, "Critical risk finding overrode approved verdict");
    Some(Correction {
        stage: Stage::Review,
        kind: CorrectionKind::VerdictOverridden,
        detail: format!("verdict forced to rejected by critical findings: {}", flags.join(", ")),
    })
}
