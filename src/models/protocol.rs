use serde::{Deserialize, Serialize};

/// Contrast administration parameters of a protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContrastParameters {
    pub agent: Option<String>,
    pub dose_ml_per_kg: Option<f64>,
    pub route: Option<String>,
    pub notes: Option<String>,
}

impl ContrastParameters {
    pub fn uses_contrast(&self) -> bool {
        self.agent.is_some()
    }
}

/// One imaging protocol in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub indications: Vec<String>,
    #[serde(default)]
    pub contrast: ContrastParameters,
    /// Explicit renal safety notes. A review concern may cite these.
    #[serde(default)]
    pub renal_safety_notes: Vec<String>,
    /// Catalog-defined quality score, used to break ranking ties.
    #[serde(default)]
    pub quality_score: f32,
    /// Precomputed embedding of [`ProtocolEntry::embedding_text`].
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Supporting snippets attached during catalog enrichment.
    #[serde(default)]
    pub literature: Vec<String>,
}

impl ProtocolEntry {
    /// Text the entry's embedding is computed from.
    pub fn embedding_text(&self) -> String {
        let mut text = self.title.clone();
        if let Some(modality) = &self.modality {
            text.push_str(". Modality: ");
            text.push_str(modality);
        }
        if !self.indications.is_empty() {
            text.push_str(". Indications: ");
            text.push_str(&self.indications.join("; "));
        }
        text
    }

    pub fn has_safety_notes(&self) -> bool {
        !self.renal_safety_notes.is_empty()
    }
}

/// Read-only, versioned snapshot of the protocol catalog.
///
/// The version is a SHA-256 over the canonical JSON of the entries, so two
/// snapshots with the same version rank identically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolCatalog {
    version: String,
    entries: Vec<ProtocolEntry>,
}

impl ProtocolCatalog {
    pub(crate) fn from_parts(version: String, entries: Vec<ProtocolEntry>) -> Self {
        Self { version, entries }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn entries(&self) -> &[ProtocolEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&ProtocolEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
