use serde::{Deserialize, Serialize};

use super::enums::{RiskFlag, Severity};

/// One rule that fired, with the value that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFinding {
    pub flag: RiskFlag,
    pub severity: Severity,
    /// Observed value (hours of lab age for `StaleLab`).
    pub observed: f64,
    /// Human-readable rule, e.g. "eGFR < 30".
    pub threshold: String,
}

/// Findings in rule-evaluation order. Identical input yields identical findings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskFindings {
    findings: Vec<RiskFinding>,
}

impl RiskFindings {
    pub fn new(findings: Vec<RiskFinding>) -> Self {
        Self { findings }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RiskFinding> {
        self.findings.iter()
    }

    pub fn as_slice(&self) -> &[RiskFinding] {
        &self.findings
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn contains(&self, flag: RiskFlag) -> bool {
        self.findings.iter().any(|f| f.flag == flag)
    }

    pub fn flags(&self) -> Vec<RiskFlag> {
        self.findings.iter().map(|f| f.flag).collect()
    }

    pub fn has_critical(&self) -> bool {
        self.max_severity() == Some(Severity::Critical)
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    pub fn critical_flags(&self) -> Vec<RiskFlag> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .map(|f| f.flag)
            .collect()
    }
}
