//! Protocol catalog: loading, versioning, enrichment, and the shared handle
//! runs take their snapshot from.
//!
//! Enrichment (embeddings and literature snippets) runs offline, before a
//! catalog is published through [`CatalogHandle::replace`]. Per-request code
//! only ever reads an immutable snapshot.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{ProtocolCatalog, ProtocolEntry};

use super::embedding::{EmbeddingError, EmbeddingModel};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse catalog {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Catalog entry has an empty id (position {0})")]
    EmptyId(usize),

    #[error("Duplicate protocol id in catalog: {0}")]
    DuplicateId(String),

    #[error("Catalog serialization failed: {0}")]
    Serialize(String),

    #[error("Embedding failed for protocol {protocol_id}: {source}")]
    Embedding {
        protocol_id: String,
        #[source]
        source: EmbeddingError,
    },

    #[error("Literature search failed: {0}")]
    Literature(String),
}

/// Accepted file layouts: a bare array, or `{"entries": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    Bare(Vec<ProtocolEntry>),
    Wrapped { entries: Vec<ProtocolEntry> },
}

/// Validate entries and stamp the snapshot with a content hash.
pub fn build_catalog(entries: Vec<ProtocolEntry>) -> Result<ProtocolCatalog, CatalogError> {
    let mut seen = std::collections::HashSet::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        if entry.id.trim().is_empty() {
            return Err(CatalogError::EmptyId(index));
        }
        if !seen.insert(entry.id.as_str()) {
            return Err(CatalogError::DuplicateId(entry.id.clone()));
        }
    }

    let version = catalog_version(&entries)?;
    Ok(ProtocolCatalog::from_parts(version, entries))
}

/// SHA-256 over the canonical JSON encoding of the entries.
pub fn catalog_version(entries: &[ProtocolEntry]) -> Result<String, CatalogError> {
    let canonical =
        serde_json::to_vec(entries).map_err(|e| CatalogError::Serialize(e.to_string()))?;
    let digest = Sha256::digest(&canonical);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

pub fn parse_catalog(json: &str, path: &Path) -> Result<Vec<ProtocolEntry>, CatalogError> {
    let file: CatalogFile = serde_json::from_str(json).map_err(|e| CatalogError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(match file {
        CatalogFile::Bare(entries) | CatalogFile::Wrapped { entries } => entries,
    })
}

/// Read entries from disk. Call [`build_catalog`] or [`enrich_catalog`] next.
pub fn load_catalog_entries(path: &Path) -> Result<Vec<ProtocolEntry>, CatalogError> {
    let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let entries = parse_catalog(&json, path)?;
    tracing::info!(path = %path.display(), entries = entries.len(), "Catalog loaded");
    Ok(entries)
}

// ═══════════════════════════════════════════════════════════
// Enrichment
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct LiteratureDocument {
    pub title: String,
    pub snippet: String,
    pub source: Option<String>,
}

/// `search(query) -> external documents`. Used only during enrichment.
pub trait LiteratureSearch: Send + Sync {
    fn search(
        &self,
        query: &str,
    ) -> impl Future<Output = Result<Vec<LiteratureDocument>, CatalogError>> + Send;
}

/// Literature source that never returns anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLiterature;

impl LiteratureSearch for NoLiterature {
    async fn search(&self, _query: &str) -> Result<Vec<LiteratureDocument>, CatalogError> {
        Ok(Vec::new())
    }
}

/// Fill in missing embeddings and literature snippets, then build the snapshot.
///
/// Entries that already carry an embedding or snippets are left untouched.
/// A literature failure is logged and skipped; an embedding failure aborts,
/// since an entry without a vector can never be ranked.
pub async fn enrich_catalog<E, L>(
    mut entries: Vec<ProtocolEntry>,
    embedder: &E,
    literature: &L,
    max_snippets: usize,
) -> Result<ProtocolCatalog, CatalogError>
where
    E: EmbeddingModel,
    L: LiteratureSearch,
{
    let mut embedded = 0usize;
    let mut annotated = 0usize;

    for entry in &mut entries {
        if entry.embedding.is_empty() {
            entry.embedding = embedder
                .embed(&entry.embedding_text())
                .await
                .map_err(|source| CatalogError::Embedding {
                    protocol_id: entry.id.clone(),
                    source,
                })?;
            embedded += 1;
        }

        if entry.literature.is_empty() && max_snippets > 0 {
            match literature.search(&entry.embedding_text()).await {
                Ok(docs) => {
                    entry.literature = docs
                        .into_iter()
                        .take(max_snippets)
                        .map(|d| format!("{}: {}", d.title, d.snippet))
                        .collect();
                    if !entry.literature.is_empty() {
                        annotated += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(protocol_id = %entry.id, error = %e, "Literature search failed, skipping");
                }
            }
        }
    }

    let catalog = build_catalog(entries)?;
    tracing::info!(
        version = %catalog.version(),
        entries = catalog.len(),
        embedded,
        annotated,
        model = embedder.model_name(),
        "Catalog enriched"
    );
    Ok(catalog)
}

// ═══════════════════════════════════════════════════════════
// Shared handle
// ═══════════════════════════════════════════════════════════

/// Current catalog, swappable without disturbing runs already in flight.
#[derive(Debug, Clone)]
pub struct CatalogHandle {
    current: Arc<RwLock<Arc<ProtocolCatalog>>>,
}

impl CatalogHandle {
    pub fn new(catalog: ProtocolCatalog) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    /// The snapshot a run keeps for its whole lifetime.
    pub fn snapshot(&self) -> Arc<ProtocolCatalog> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }

    /// Publish a new catalog. Runs holding an older snapshot keep it.
    pub fn replace(&self, catalog: ProtocolCatalog) {
        let version = catalog.version().to_string();
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(catalog);
        tracing::info!(version = %version, "Catalog replaced");
    }
}
