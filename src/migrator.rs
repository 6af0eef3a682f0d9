//! Format migrator: brings legacy single-file stores to canonical form.
//!
//! Earlier deployments persisted a knowledge base's whole store as one
//! `store.json` file — either a combined object carrying both an index
//! facet and a docstore facet, or a bare (vectors, payload-mapping) pair.
//! Those objects already contain their vectors, so migration never needs
//! the embedding provider.
//!
//! What is on disk is classified into an explicit [`ClassifiedArtifact`]
//! variant before anything acts on it. The legacy file is deleted only
//! after the canonical replacement has been verified loadable; an
//! unrecognizable store surfaces as [`KbError::ArtifactCorruption`] and the
//! lifecycle manager falls back to a full rebuild from the metadata store.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::artifact::{self, Artifact, LEGACY_FILENAME};
use crate::error::{KbError, KbResult};
use crate::models::DocstoreEntry;

/// Shape of a knowledge base's on-disk store, decided before acting.
pub enum ClassifiedArtifact {
    /// Both canonical files already exist; no action needed.
    CanonicalPair,
    /// A fully-formed legacy object exposing index and docstore facets,
    /// merely persisted in the single-file convention.
    LegacyCombinedObject(Artifact),
    /// An ordered (vectors, payload-mapping) pair; the canonical object is
    /// reconstructed from the two parts directly.
    LegacyTuplePair(Artifact),
    /// Unreadable, or no recognizable shape.
    Unrecognized { reason: String },
}

impl ClassifiedArtifact {
    pub fn shape_name(&self) -> &'static str {
        match self {
            ClassifiedArtifact::CanonicalPair => "canonical pair",
            ClassifiedArtifact::LegacyCombinedObject(_) => "legacy combined object",
            ClassifiedArtifact::LegacyTuplePair(_) => "legacy tuple pair",
            ClassifiedArtifact::Unrecognized { .. } => "unrecognized",
        }
    }
}

/// What a migration pass did for one knowledge base.
#[derive(Debug, PartialEq)]
pub enum MigrationOutcome {
    /// Neither canonical files nor a legacy store exist.
    NothingToMigrate,
    AlreadyCanonical,
    Repersisted { shape: &'static str, rows: usize },
}

/// Classify the store in an artifact directory. `None` means nothing is on
/// disk at all — the knowledge base has simply never been built.
pub fn classify(dir: &Path) -> KbResult<Option<ClassifiedArtifact>> {
    if artifact::exists(dir) {
        return Ok(Some(ClassifiedArtifact::CanonicalPair));
    }
    let legacy = dir.join(LEGACY_FILENAME);
    if !legacy.exists() {
        return Ok(None);
    }

    let bytes = fs::read(&legacy)?;
    let value: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => {
            return Ok(Some(ClassifiedArtifact::Unrecognized {
                reason: format!("not valid JSON: {}", e),
            }))
        }
    };
    Ok(Some(classify_value(value)))
}

fn classify_value(value: serde_json::Value) -> ClassifiedArtifact {
    match value {
        serde_json::Value::Object(map)
            if map.contains_key("index") && map.contains_key("docstore") =>
        {
            match artifact_from_facets(&map["index"], &map["docstore"]) {
                Ok(artifact) => ClassifiedArtifact::LegacyCombinedObject(artifact),
                Err(reason) => ClassifiedArtifact::Unrecognized { reason },
            }
        }
        serde_json::Value::Array(items) if items.len() == 2 => {
            let mut items = items;
            let payload = items.pop().expect("len checked");
            let vectors = items.pop().expect("len checked");
            match artifact_from_tuple(vectors, payload) {
                Ok(artifact) => ClassifiedArtifact::LegacyTuplePair(artifact),
                Err(reason) => ClassifiedArtifact::Unrecognized { reason },
            }
        }
        _ => ClassifiedArtifact::Unrecognized {
            reason: "no recognizable index/docstore shape".to_string(),
        },
    }
}

/// Combined legacy object: `{"index": {"dims": D, "vectors": [...]},
/// "docstore": [...]}`.
fn artifact_from_facets(
    index: &serde_json::Value,
    docstore: &serde_json::Value,
) -> Result<Artifact, String> {
    let vectors_value = index
        .get("vectors")
        .ok_or_else(|| "index facet has no vectors".to_string())?;
    let vectors: Vec<Vec<f32>> = serde_json::from_value(vectors_value.clone())
        .map_err(|e| format!("index facet vectors are malformed: {}", e))?;

    let entries = docstore_entries(docstore)?;
    let dims = index
        .get("dims")
        .and_then(|d| d.as_u64())
        .map(|d| d as usize)
        .or_else(|| vectors.first().map(|v| v.len()))
        .unwrap_or(0);

    assemble(vectors, entries, dims)
}

/// Tuple legacy object: `[vectors, payload-mapping]`.
fn artifact_from_tuple(
    vectors: serde_json::Value,
    payload: serde_json::Value,
) -> Result<Artifact, String> {
    let vectors: Vec<Vec<f32>> = serde_json::from_value(vectors)
        .map_err(|e| format!("tuple element 0 is not a vector array: {}", e))?;
    let entries = docstore_entries(&payload)?;
    let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
    assemble(vectors, entries, dims)
}

/// A docstore facet is either an array (row order) or an object keyed by
/// row position.
fn docstore_entries(value: &serde_json::Value) -> Result<Vec<DocstoreEntry>, String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| {
                serde_json::from_value(item.clone())
                    .map_err(|e| format!("docstore entry is malformed: {}", e))
            })
            .collect(),
        serde_json::Value::Object(map) => {
            let mut keyed: Vec<(i64, &serde_json::Value)> = Vec::with_capacity(map.len());
            for (key, item) in map {
                let position = key
                    .parse::<i64>()
                    .map_err(|_| format!("docstore key '{}' is not a row position", key))?;
                keyed.push((position, item));
            }
            keyed.sort_by_key(|(position, _)| *position);
            keyed
                .into_iter()
                .map(|(_, item)| {
                    serde_json::from_value(item.clone())
                        .map_err(|e| format!("docstore entry is malformed: {}", e))
                })
                .collect()
        }
        _ => Err("docstore facet is neither an array nor a mapping".to_string()),
    }
}

fn assemble(
    vectors: Vec<Vec<f32>>,
    entries: Vec<DocstoreEntry>,
    dims: usize,
) -> Result<Artifact, String> {
    if vectors.len() != entries.len() {
        return Err(format!(
            "{} vectors but {} docstore entries",
            vectors.len(),
            entries.len()
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(format!("vector has {} dims, expected {}", bad.len(), dims));
    }
    Ok(Artifact::new(dims, vectors, entries))
}

/// Migrate one artifact directory to the canonical two-file convention.
///
/// Errors with [`KbError::ArtifactCorruption`] for an unrecognized or
/// unreadable legacy store; the legacy file is left in place in that case.
pub fn migrate_artifact(dir: &Path) -> KbResult<MigrationOutcome> {
    let legacy = dir.join(LEGACY_FILENAME);

    match classify(dir)? {
        None => Ok(MigrationOutcome::NothingToMigrate),
        Some(ClassifiedArtifact::CanonicalPair) => {
            debug!(dir = %dir.display(), "store already canonical");
            Ok(MigrationOutcome::AlreadyCanonical)
        }
        Some(shape @ ClassifiedArtifact::LegacyCombinedObject(_))
        | Some(shape @ ClassifiedArtifact::LegacyTuplePair(_)) => {
            let shape_name = shape.shape_name();
            let artifact = match shape {
                ClassifiedArtifact::LegacyCombinedObject(a)
                | ClassifiedArtifact::LegacyTuplePair(a) => a,
                _ => unreachable!(),
            };
            let rows = artifact.row_count();

            let pair = artifact.write_temp(dir)?;
            // The legacy file may only be removed once the replacement is
            // known to load; verify the temp pair before promoting.
            if let Err(e) = Artifact::load_pair(&pair.index, &pair.docstore) {
                pair.discard();
                return Err(e);
            }
            pair.promote(dir)?;
            fs::remove_file(&legacy)?;

            debug!(dir = %dir.display(), shape = shape_name, rows, "repersisted legacy store");
            Ok(MigrationOutcome::Repersisted {
                shape: shape_name,
                rows,
            })
        }
        Some(ClassifiedArtifact::Unrecognized { reason }) => {
            warn!(dir = %dir.display(), %reason, "legacy store not migratable");
            Err(KbError::ArtifactCorruption {
                path: legacy,
                reason,
            })
        }
    }
}
