use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when a string does not name a known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {field} value: {value}")]
pub struct UnknownVariant {
    pub field: String,
    pub value: String,
}

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(UnknownVariant {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(
    /// Typed risk flag raised by the risk assessor.
    RiskFlag {
        RenalHighRisk => "RenalHighRisk",
        RenalCaution => "RenalCaution",
        CreatinineHigh => "CreatinineHigh",
        CreatinineAttention => "CreatinineAttention",
        PotassiumCritical => "PotassiumCritical",
        PotassiumWarning => "PotassiumWarning",
        StaleLab => "StaleLab",
    }
);

impl RiskFlag {
    pub const ALL: [RiskFlag; 7] = [
        RiskFlag::RenalHighRisk,
        RiskFlag::RenalCaution,
        RiskFlag::CreatinineHigh,
        RiskFlag::CreatinineAttention,
        RiskFlag::PotassiumCritical,
        RiskFlag::PotassiumWarning,
        RiskFlag::StaleLab,
    ];
}

str_enum!(
    /// Ordered: `Info < Warning < Critical`.
    Severity {
        Info => "info",
        Warning => "warning",
        Critical => "critical",
    }
);

str_enum!(Verdict {
    Approved => "approved",
    Rejected => "rejected",
});

str_enum!(
    /// Stages that call the generation service.
    Stage {
        Selection => "selection",
        Review => "review",
        Scoring => "scoring",
    }
);

str_enum!(
    /// Pipeline run states. The last three are terminal.
    RunState {
        Structuring => "structuring",
        ContextBuilt => "context_built",
        Selecting => "selecting",
        Reviewing => "reviewing",
        ConfidenceGate => "confidence_gate",
        Finalizing => "finalizing",
        Accepted => "accepted",
        Escalated => "escalated",
        Failed => "failed",
    }
);

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Escalated | Self::Failed)
    }

    /// Legal edges of the run state machine.
    pub fn can_advance_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (*self, next) {
            (Structuring, ContextBuilt) => true,
            (ContextBuilt, Selecting) => true,
            (Selecting, Reviewing) => true,
            // A selection cycle that failed locally still passes through the gate.
            (Selecting, ConfidenceGate) => true,
            (Reviewing, ConfidenceGate) => true,
            (ConfidenceGate, Selecting) => true,
            (ConfidenceGate, Finalizing) => true,
            (Finalizing, Accepted) => true,
            (from, Escalated | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}
