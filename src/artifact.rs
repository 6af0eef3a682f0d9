//! On-disk vector index artifact: the canonical two-file pair.
//!
//! Per knowledge base, a directory holds exactly two canonical files:
//!
//! - `index.bin` — embedding index proper: a fixed header (magic, format
//!   version, dimension, row count, SHA-256 of the docstore file) followed
//!   by row-major little-endian `f32` vectors. The nearest-neighbor
//!   structure is the flat exhaustive layout built over the full batch.
//! - `docstore.json` — entry *i* maps row *i* back to the originating
//!   chunk's text and metadata.
//!
//! The artifact is a derived, disposable cache: writers build a fresh pair
//! under temporary names and promote it with per-file renames, so readers
//! see either the fully-old or fully-new pair and a crash mid-build leaves
//! the previous pair intact. Absence of either file means "not yet built";
//! unrecognized extra files are ignored.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{KbError, KbResult};
use crate::models::DocstoreEntry;

pub const INDEX_FILENAME: &str = "index.bin";
pub const DOCSTORE_FILENAME: &str = "docstore.json";
/// Single-file store predating the two-file convention; input to migration.
pub const LEGACY_FILENAME: &str = "store.json";

const MAGIC: [u8; 4] = *b"KBVI";
const FORMAT_VERSION: u32 = 1;
// magic + version + dims + rows + docstore sha256
const HEADER_LEN: usize = 4 + 4 + 4 + 4 + 32;

/// The artifact directory for a knowledge base under the configured root.
pub fn artifact_dir(config: &Config, kb_id: i64) -> PathBuf {
    config.artifacts.root.join(format!("vectorstore_{}", kb_id))
}

/// True when both canonical files are present.
pub fn exists(dir: &Path) -> bool {
    dir.join(INDEX_FILENAME).exists() && dir.join(DOCSTORE_FILENAME).exists()
}

/// A fully-materialized artifact: vectors plus their docstore, row-aligned.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub dims: usize,
    pub vectors: Vec<Vec<f32>>,
    pub docstore: Vec<DocstoreEntry>,
}

impl Artifact {
    pub fn new(dims: usize, vectors: Vec<Vec<f32>>, docstore: Vec<DocstoreEntry>) -> Self {
        Self {
            dims,
            vectors,
            docstore,
        }
    }

    pub fn row_count(&self) -> usize {
        self.vectors.len()
    }

    fn index_bytes(&self, docstore_bytes: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(docstore_bytes);
        let checksum = hasher.finalize();

        let mut bytes = Vec::with_capacity(HEADER_LEN + self.vectors.len() * self.dims * 4);
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.vectors.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&checksum);
        for vector in &self.vectors {
            bytes.extend_from_slice(&vec_to_blob(vector));
        }
        bytes
    }

    /// Write both files under temporary names inside `dir`. Nothing the
    /// caller later aborts will be visible to readers of the canonical pair.
    pub fn write_temp(&self, dir: &Path) -> KbResult<TempPair> {
        fs::create_dir_all(dir)?;
        let suffix = Uuid::new_v4();
        let docstore_bytes = serde_json::to_vec_pretty(&self.docstore)?;
        let index_path = dir.join(format!("{}.tmp-{}", INDEX_FILENAME, suffix));
        let docstore_path = dir.join(format!("{}.tmp-{}", DOCSTORE_FILENAME, suffix));
        fs::write(&docstore_path, &docstore_bytes)?;
        fs::write(&index_path, self.index_bytes(&docstore_bytes))?;
        debug!(dir = %dir.display(), rows = self.vectors.len(), "wrote temp artifact pair");
        Ok(TempPair {
            index: index_path,
            docstore: docstore_path,
        })
    }

    /// Load the canonical pair from an artifact directory.
    pub fn load(dir: &Path) -> KbResult<Artifact> {
        Self::load_pair(&dir.join(INDEX_FILENAME), &dir.join(DOCSTORE_FILENAME))
    }

    /// Load and validate an explicit (index, docstore) file pair: header
    /// magic and version, row-count agreement, docstore checksum.
    pub fn load_pair(index_path: &Path, docstore_path: &Path) -> KbResult<Artifact> {
        let corrupt = |reason: String| KbError::ArtifactCorruption {
            path: index_path.to_path_buf(),
            reason,
        };

        let index_bytes = fs::read(index_path)?;
        if index_bytes.len() < HEADER_LEN {
            return Err(corrupt("truncated header".to_string()));
        }
        if index_bytes[0..4] != MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let version = u32::from_le_bytes(index_bytes[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", version)));
        }
        let dims = u32::from_le_bytes(index_bytes[8..12].try_into().unwrap()) as usize;
        let rows = u32::from_le_bytes(index_bytes[12..16].try_into().unwrap()) as usize;
        let checksum = &index_bytes[16..HEADER_LEN];

        let body = &index_bytes[HEADER_LEN..];
        if body.len() != rows * dims * 4 {
            return Err(corrupt(format!(
                "index body is {} bytes, expected {} ({} rows x {} dims)",
                body.len(),
                rows * dims * 4,
                rows,
                dims
            )));
        }

        let docstore_bytes = fs::read(docstore_path)?;
        let mut hasher = Sha256::new();
        hasher.update(&docstore_bytes);
        if hasher.finalize().as_slice() != checksum {
            return Err(KbError::ArtifactCorruption {
                path: docstore_path.to_path_buf(),
                reason: "docstore checksum mismatch".to_string(),
            });
        }

        let docstore: Vec<DocstoreEntry> =
            serde_json::from_slice(&docstore_bytes).map_err(|e| KbError::ArtifactCorruption {
                path: docstore_path.to_path_buf(),
                reason: format!("docstore is not valid JSON: {}", e),
            })?;
        if docstore.len() != rows {
            return Err(KbError::ArtifactCorruption {
                path: docstore_path.to_path_buf(),
                reason: format!("docstore has {} entries, index has {} rows", docstore.len(), rows),
            });
        }

        let vectors: Vec<Vec<f32>> = body.chunks_exact(dims * 4).map(blob_to_vec).collect();

        Ok(Artifact {
            dims,
            vectors,
            docstore,
        })
    }
}

/// A written-but-not-promoted artifact pair.
pub struct TempPair {
    pub index: PathBuf,
    pub docstore: PathBuf,
}

impl TempPair {
    /// Re-read the written temp docstore from disk and return its entry
    /// count — the pre-swap verification step.
    pub fn read_back_docstore_len(&self) -> KbResult<usize> {
        let bytes = fs::read(&self.docstore)?;
        let entries: Vec<DocstoreEntry> = serde_json::from_slice(&bytes)?;
        Ok(entries.len())
    }

    /// Promote the pair over the canonical names. Each rename is atomic, so
    /// a reader of either file sees a complete old or new version.
    pub fn promote(self, dir: &Path) -> KbResult<()> {
        fs::rename(&self.index, dir.join(INDEX_FILENAME))?;
        fs::rename(&self.docstore, dir.join(DOCSTORE_FILENAME))?;
        debug!(dir = %dir.display(), "promoted artifact pair");
        Ok(())
    }

    /// Delete the temp files; used when a build aborts before the swap.
    pub fn discard(self) {
        let _ = fs::remove_file(&self.index);
        let _ = fs::remove_file(&self.docstore);
    }
}

/// Remove leftover temp files from builds that crashed or were cancelled
/// before promotion. Returns the number of files removed.
pub fn sweep_stale_temps(dir: &Path) -> KbResult<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().contains(".tmp-") {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "swept stale temp files");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_artifact() -> Artifact {
        let entries = vec![
            DocstoreEntry {
                chunk_id: 1,
                doc_id: 10,
                content: "uplink capacity is billed per MHz".to_string(),
                metadata: json!({"kb_id": 1, "chunk_index": 0}),
            },
            DocstoreEntry {
                chunk_id: 2,
                doc_id: 10,
                content: "downlink rates are tiered".to_string(),
                metadata: json!({"kb_id": 1, "chunk_index": 1}),
            },
        ];
        Artifact::new(4, vec![vec![0.1, 0.2, 0.3, 0.4], vec![0.5, 0.6, 0.7, 0.8]], entries)
    }

    #[test]
    fn test_write_promote_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("vectorstore_1");

        let artifact = sample_artifact();
        let pair = artifact.write_temp(&dir).unwrap();
        assert_eq!(pair.read_back_docstore_len().unwrap(), 2);
        pair.promote(&dir).unwrap();

        assert!(exists(&dir));
        let loaded = Artifact::load(&dir).unwrap();
        assert_eq!(loaded.row_count(), 2);
        assert_eq!(loaded.dims, 4);
        assert_eq!(loaded.docstore, artifact.docstore);
        assert_eq!(loaded.vectors, artifact.vectors);
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("vectorstore_1");
        let pair = sample_artifact().write_temp(&dir).unwrap();
        pair.promote(&dir).unwrap();

        let index_path = dir.join(INDEX_FILENAME);
        let mut bytes = fs::read(&index_path).unwrap();
        bytes[0] = b'X';
        fs::write(&index_path, bytes).unwrap();

        match Artifact::load(&dir) {
            Err(KbError::ArtifactCorruption { reason, .. }) => assert!(reason.contains("magic")),
            other => panic!("expected corruption error, got {:?}", other.map(|a| a.row_count())),
        }
    }

    #[test]
    fn test_load_rejects_tampered_docstore() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("vectorstore_1");
        let pair = sample_artifact().write_temp(&dir).unwrap();
        pair.promote(&dir).unwrap();

        let docstore_path = dir.join(DOCSTORE_FILENAME);
        fs::write(&docstore_path, b"[]").unwrap();

        match Artifact::load(&dir) {
            Err(KbError::ArtifactCorruption { reason, .. }) => {
                assert!(reason.contains("checksum"))
            }
            other => panic!("expected corruption error, got {:?}", other.map(|a| a.row_count())),
        }
    }

    #[test]
    fn test_discard_leaves_no_canonical_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("vectorstore_1");
        let pair = sample_artifact().write_temp(&dir).unwrap();
        pair.discard();
        assert!(!exists(&dir));
        assert_eq!(sweep_stale_temps(&dir).unwrap(), 0);
    }

    #[test]
    fn test_sweep_removes_only_temps() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("vectorstore_1");
        let artifact = sample_artifact();
        artifact.write_temp(&dir).unwrap().promote(&dir).unwrap();
        // A second build that never promoted
        let _stale = artifact.write_temp(&dir).unwrap();

        let removed = sweep_stale_temps(&dir).unwrap();
        assert_eq!(removed, 2);
        assert!(exists(&dir));
        assert!(Artifact::load(&dir).is_ok());
    }
}
