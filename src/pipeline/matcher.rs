//! Protocol ranking: similarity filter, deterministic order, top-K.
//!
//! Similarity comes from precomputed catalog embeddings; this module owns only
//! the threshold, the ordering (score, then quality, then id) and the cut.

use crate::models::{PatientRecord, ProtocolCandidate, ProtocolCatalog, ProtocolEntry};
use crate::pipeline_config::MatcherConfig;

use super::embedding::cosine_similarity;

/// Query text for the embedding service: diagnosis first, then key facts.
pub fn build_query(record: &PatientRecord) -> String {
    let facts = record.clinical_facts();
    if facts.is_empty() {
        record.primary_diagnosis.clone()
    } else {
        format!("{}. {}", record.primary_diagnosis, facts.join("; "))
    }
}

pub struct ProtocolMatcher {
    config: MatcherConfig,
}

impl ProtocolMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Rank `catalog` against `query_vector`. An empty result is a valid outcome.
    pub fn rank(&self, query_vector: &[f32], catalog: &ProtocolCatalog) -> Vec<ProtocolCandidate> {
        let mut scored: Vec<(f32, &ProtocolEntry)> = Vec::new();
        let mut mismatched = 0usize;

        for entry in catalog.entries() {
            if entry.embedding.len() != query_vector.len() {
                mismatched += 1;
                continue;
            }
            let Some(score) = cosine_similarity(query_vector, &entry.embedding) else {
                continue;
            };
            if score.is_finite() && score >= self.config.relevance_threshold {
                scored.push((score, entry));
            }
        }

        if mismatched > 0 {
            tracing::warn!(
                mismatched,
                query_dim = query_vector.len(),
                catalog_version = %catalog.version(),
                "Catalog entries skipped: embedding dimension mismatch"
            );
        }

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .total_cmp(score_a)
                .then_with(|| b.quality_score.total_cmp(&a.quality_score))
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(self.config.top_k);

        let candidates: Vec<ProtocolCandidate> = scored
            .into_iter()
            .map(|(score, entry)| ProtocolCandidate {
                protocol_id: entry.id.clone(),
                title: entry.title.clone(),
                score,
                quality_score: entry.quality_score,
                snippets: entry
                    .literature
                    .iter()
                    .take(self.config.max_snippets)
                    .cloned()
                    .collect(),
                safety_notes: entry.renal_safety_notes.clone(),
            })
            .collect();

        tracing::debug!(
            catalog_size = catalog.len(),
            kept = candidates.len(),
            threshold = self.config.relevance_threshold,
            "Protocol ranking complete"
        );

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::catalog::build_catalog;
    use std::cmp::Ordering;

    fn is_ranked(candidates: &[ProtocolCandidate]) -> bool {
        candidates.windows(2).all(|pair| {
            let (a, b) = (&pair[0], &pair[1]);
            match b.score.total_cmp(&a.score) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => match b.quality_score.total_cmp(&a.quality_score) {
                    Ordering::Less => true,
                    Ordering::Greater => false,
                    Ordering::Equal => a.protocol_id <= b.protocol_id,
                },
            }
        })
    }

    fn entry(id: &str, embedding: Vec<f32>, quality: f32) -> ProtocolEntry {
        ProtocolEntry {
            id: id.into(),
            title: format!("Protocol {id}"),
            modality: None,
            indications: vec![],
            contrast: Default::default(),
            renal_safety_notes: vec![],
            quality_score: quality,
            embedding,
            literature: vec!["a".into(), "b".into(), "c".into(), "d".into()],
        }
    }

    fn matcher() -> ProtocolMatcher {
        ProtocolMatcher::new(MatcherConfig::default())
    }

    #[test]
    fn filters_below_threshold_and_sorts_descending() {
        let catalog = build_catalog(vec![
            entry("low", vec![0.0, 1.0], 1.0),
            entry("high", vec![1.0, 0.0], 0.1),
            entry("mid", vec![1.0, 0.5], 0.1),
        ])
        .unwrap();

        let ranked = matcher().rank(&[1.0, 0.0], &catalog);
        let ids: Vec<&str> = ranked.iter().map(|c| c.protocol_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid"]);
        assert!(ranked.iter().all(|c| c.score >= 0.6));
        assert!(is_ranked(&ranked));
    }

    #[test]
    fn ties_broken_by_quality_then_id() {
        let catalog = build_catalog(vec![
            entry("b-proto", vec![1.0, 0.0], 0.5),
            entry("a-proto", vec![1.0, 0.0], 0.5),
            entry("c-proto", vec![1.0, 0.0], 0.9),
        ])
        .unwrap();

        let ids: Vec<String> = matcher()
            .rank(&[1.0, 0.0], &catalog)
            .into_iter()
            .map(|c| c.protocol_id)
            .collect();
        assert_eq!(ids, vec!["c-proto", "a-proto", "b-proto"]);
    }

    #[test]
    fn truncates_to_top_k_and_snippet_limit() {
        let catalog = build_catalog(
            (0..6)
                .map(|i| entry(&format!("p{i}"), vec![1.0, i as f32 * 0.01], 0.5))
                .collect(),
        )
        .unwrap();

        let ranked = matcher().rank(&[1.0, 0.0], &catalog);
        assert_eq!(ranked.len(), 3);
        assert!(ranked.iter().all(|c| c.snippets.len() == 3));
    }

    #[test]
    fn empty_when_nothing_clears_threshold() {
        let catalog = build_catalog(vec![entry("ortho", vec![0.0, 1.0], 1.0)]).unwrap();
        assert!(matcher().rank(&[1.0, 0.0], &catalog).is_empty());
    }

    #[test]
    fn empty_catalog_is_not_an_error() {
        let catalog = build_catalog(vec![]).unwrap();
        assert!(matcher().rank(&[1.0, 0.0], &catalog).is_empty());
    }

    #[test]
    fn skips_dimension_mismatch_and_non_finite() {
        let catalog = build_catalog(vec![
            entry("short", vec![1.0], 1.0),
            entry("nan", vec![f32::NAN, 0.0], 1.0),
            entry("ok", vec![1.0, 0.1], 0.0),
        ])
        .unwrap();

        let ranked = matcher().rank(&[1.0, 0.0], &catalog);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].protocol_id, "ok");
    }

    #[test]
    fn query_leads_with_diagnosis() {
        let record = PatientRecord::from_raw(&serde_json::json!({
            "patient_id": "P-1",
            "primary_diagnosis": "suspected aortic dissection",
            "egfr": 55
        }))
        .unwrap();
        let query = build_query(&record);
        assert!(query.starts_with("suspected aortic dissection. "));
        assert!(query.contains("eGFR: 55"));
    }
}
