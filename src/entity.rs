//! Entity records and the per-instance working set.
//!
//! Records arrive from an upstream decomposition/embedding pipeline; this
//! module only validates and holds them. The engine never generates
//! embeddings itself; a record without one is rejected, not auto-embedded.

use crate::error::Result;
use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// An entity with its semantic embedding, as supplied by the upstream
/// knowledge-graph decomposition service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Unique key for the entity.
    pub uri: String,
    /// Human-readable name.
    pub name: String,
    /// Optional entity type tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    /// Optional raw content the embedding was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Fixed-length embedding vector.
    #[serde(default)]
    pub embedding: Vec<f64>,
    /// Free-form metadata passed through untouched.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EntityRecord {
    /// Creates a record with just a uri, name and embedding.
    pub fn new(uri: impl Into<String>, name: impl Into<String>, embedding: Vec<f64>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            entity_type: None,
            content: None,
            embedding,
            metadata: HashMap::new(),
        }
    }
}

/// A record rejected during a load, with the reason it was refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRecord {
    /// The offending record's uri.
    pub uri: String,
    /// Why the record was refused.
    pub reason: String,
}

/// Outcome of a batch load: how many records were accepted and which were
/// rejected, each with its reason. Rejections never abort the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadReport {
    /// Number of records accepted into the store.
    pub loaded: usize,
    /// Per-record rejections.
    pub rejected: Vec<RejectedRecord>,
}

/// The validated working set of entities for one map instance.
///
/// Built whole from a batch, then swapped in atomically; it is never
/// mutated in place, so concurrent readers cannot observe a torn state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityStore {
    records: Vec<EntityRecord>,
    embedding_dim: usize,
}

impl EntityStore {
    /// Builds a store from a batch of records, validating each one against
    /// the expected embedding dimension.
    ///
    /// Invalid records (missing embedding, wrong length, non-finite values,
    /// duplicate uri) are reported individually; valid records load.
    pub fn build(records: Vec<EntityRecord>, embedding_dim: usize) -> (Self, LoadReport) {
        let mut accepted = Vec::with_capacity(records.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(records.len());
        let mut report = LoadReport::default();

        for record in records {
            if record.embedding.is_empty() {
                report.rejected.push(RejectedRecord {
                    uri: record.uri,
                    reason: "record has no embedding".to_string(),
                });
                continue;
            }
            if record.embedding.len() != embedding_dim {
                report.rejected.push(RejectedRecord {
                    uri: record.uri,
                    reason: format!(
                        "embedding length {} does not match configured dimension {}",
                        record.embedding.len(),
                        embedding_dim
                    ),
                });
                continue;
            }
            if record.embedding.iter().any(|v| !v.is_finite()) {
                report.rejected.push(RejectedRecord {
                    uri: record.uri,
                    reason: "embedding contains non-finite values".to_string(),
                });
                continue;
            }
            if !seen.insert(record.uri.clone()) {
                report.rejected.push(RejectedRecord {
                    uri: record.uri,
                    reason: "duplicate uri in batch".to_string(),
                });
                continue;
            }
            accepted.push(record);
        }

        report.loaded = accepted.len();
        debug!(
            "entity store built: {} loaded, {} rejected",
            report.loaded,
            report.rejected.len()
        );

        (
            Self {
                records: accepted,
                embedding_dim,
            },
            report,
        )
    }

    /// Number of entities in the store.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the store holds no entities.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The embedding dimension every record satisfies.
    #[inline]
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// The validated records.
    #[inline]
    pub fn records(&self) -> &[EntityRecord] {
        &self.records
    }
}

/// Upstream source of entity records (e.g. a SPARQL endpoint fronting the
/// knowledge graph). Transport lives behind this seam; the engine only
/// sees the records the query produced.
pub trait EntitySource {
    /// Fetches entity records matching a query.
    fn fetch(&self, query: &str) -> Result<Vec<EntityRecord>>;
}

/// An in-memory source holding a fixed set of records.
///
/// The query is matched as a substring filter on uri and name; an empty
/// query returns everything. Used in tests and by the CLI.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    records: Vec<EntityRecord>,
}

impl StaticSource {
    /// Creates a source over a fixed record set.
    pub fn new(records: Vec<EntityRecord>) -> Self {
        Self { records }
    }
}

impl EntitySource for StaticSource {
    fn fetch(&self, query: &str) -> Result<Vec<EntityRecord>> {
        if query.is_empty() {
            return Ok(self.records.clone());
        }
        Ok(self
            .records
            .iter()
            .filter(|r| r.uri.contains(query) || r.name.contains(query))
            .cloned()
            .collect())
    }
}

/// Generates `count` synthetic entities of the given dimension.
///
/// Entities are drawn around a handful of well-separated Gaussian centers
/// so that trained maps exhibit visible cluster structure. Deterministic
/// for a fixed seed.
pub fn generate_sample(count: usize, embedding_dim: usize, seed: Option<u64>) -> Vec<EntityRecord> {
    let mut rng = match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    };

    let num_centers = ((count as f64).sqrt().round() as usize).clamp(2, 8);
    let centers: Vec<Vec<f64>> = (0..num_centers)
        .map(|_| (0..embedding_dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();

    let noise = Normal::new(0.0, 0.05).unwrap();
    (0..count)
        .map(|i| {
            let center = &centers[i % num_centers];
            let embedding: Vec<f64> = center.iter().map(|c| c + noise.sample(&mut rng)).collect();
            let mut record = EntityRecord::new(
                format!("urn:mercator:sample:{i}"),
                format!("sample-{i}"),
                embedding,
            );
            record.entity_type = Some("sample".to_string());
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_records(n: usize, dim: usize) -> Vec<EntityRecord> {
        (0..n)
            .map(|i| EntityRecord::new(format!("urn:e:{i}"), format!("e{i}"), vec![i as f64; dim]))
            .collect()
    }

    #[test]
    fn test_build_all_valid() {
        let (store, report) = EntityStore::build(valid_records(5, 4), 4);
        assert_eq!(report.loaded, 5);
        assert!(report.rejected.is_empty());
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_wrong_length_rejected_individually() {
        let mut records = valid_records(4, 4);
        records[2].embedding = vec![1.0, 2.0];
        let (store, report) = EntityStore::build(records, 4);
        assert_eq!(report.loaded, 3);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].uri, "urn:e:2");
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_missing_embedding_rejected() {
        let mut records = valid_records(2, 4);
        records[0].embedding = vec![];
        let (_, report) = EntityStore::build(records, 4);
        assert_eq!(report.loaded, 1);
        assert!(report.rejected[0].reason.contains("no embedding"));
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut records = valid_records(2, 4);
        records[1].embedding[0] = f64::NAN;
        let (_, report) = EntityStore::build(records, 4);
        assert_eq!(report.loaded, 1);
        assert!(report.rejected[0].reason.contains("non-finite"));
    }

    #[test]
    fn test_duplicate_uri_rejected() {
        let mut records = valid_records(3, 4);
        records[2].uri = "urn:e:0".to_string();
        let (_, report) = EntityStore::build(records, 4);
        assert_eq!(report.loaded, 2);
        assert!(report.rejected[0].reason.contains("duplicate"));
    }

    #[test]
    fn test_static_source_filter() {
        let source = StaticSource::new(valid_records(10, 4));
        assert_eq!(source.fetch("").unwrap().len(), 10);
        assert_eq!(source.fetch("urn:e:3").unwrap().len(), 1);
        assert!(source.fetch("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_generate_sample_deterministic() {
        let a = generate_sample(20, 8, Some(7));
        let b = generate_sample(20, 8, Some(7));
        assert_eq!(a.len(), 20);
        for (ra, rb) in a.iter().zip(&b) {
            assert_eq!(ra.uri, rb.uri);
            assert_eq!(ra.embedding, rb.embedding);
            assert_eq!(ra.embedding.len(), 8);
        }
    }

    #[test]
    fn test_record_json_shape() {
        let json = r#"{"uri":"urn:x","name":"x","embedding":[1.0,2.0],"metadata":{"source":"graph"}}"#;
        let record: EntityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.embedding.len(), 2);
        assert!(record.metadata.contains_key("source"));
    }
}
