//! Chunk consistency checker.
//!
//! Finds chunks whose `doc_id` has no corresponding document record — an
//! observed failure mode where chunk ingestion succeeded but the document
//! record write did not, or was pruned separately — and synthesizes the
//! missing parent records. Chunks are never deleted here; this step only
//! adds.
//!
//! The owning knowledge base of an orphan is inferred through the
//! configured id-range policy. That policy is a heuristic of last resort:
//! every use is logged at WARN and carried in the report with its basis
//! string so operators can audit the assignment.

use sqlx::SqlitePool;
use tracing::warn;

use crate::config::RepairConfig;
use crate::error::KbResult;
use crate::models::{Document, ProcessingStatus};
use crate::report::{SynthesizedDocument, UnassignedOrphan};
use crate::store;

/// Result of one consistency sweep.
#[derive(Debug)]
pub struct RepairScan {
    /// Distinct orphaned document ids found.
    pub orphaned: usize,
    pub synthesized: Vec<SynthesizedDocument>,
    pub unassigned: Vec<UnassignedOrphan>,
}

/// Apply the id-range policy to an orphaned document id.
///
/// Returns the inferred knowledge base id and a basis string describing
/// the rule that fired. `None` when no range matches and no default is
/// configured — the orphan is then reported instead of guessed at.
pub fn infer_kb(policy: &RepairConfig, doc_id: i64) -> Option<(i64, String)> {
    for range in &policy.kb_ranges {
        if doc_id <= range.max_doc_id {
            return Some((
                range.kb_id,
                format!(
                    "id-range: doc_id {} <= {} -> kb {}",
                    doc_id, range.max_doc_id, range.kb_id
                ),
            ));
        }
    }
    policy.default_kb_id.map(|kb_id| {
        (
            kb_id,
            format!("default: no id-range matched doc_id {} -> kb {}", doc_id, kb_id),
        )
    })
}

/// Synthesize a minimal document record for every orphaned `doc_id`.
///
/// The title is recovered from the lowest-index chunk's metadata, falling
/// back to a placeholder. All inserts run in a single transaction.
pub async fn synthesize_missing_documents(
    pool: &SqlitePool,
    policy: &RepairConfig,
) -> KbResult<RepairScan> {
    let orphans = store::orphaned_doc_ids(pool).await?;
    let mut scan = RepairScan {
        orphaned: orphans.len(),
        synthesized: Vec::new(),
        unassigned: Vec::new(),
    };
    if orphans.is_empty() {
        return Ok(scan);
    }

    let mut tx = pool.begin().await?;

    for doc_id in orphans {
        let Some(first) = store::first_chunk_for(pool, doc_id).await? else {
            continue;
        };
        let title = title_from_metadata(&first.metadata_json)
            .unwrap_or_else(|| format!("Document {}", doc_id));

        let Some((kb_id, basis)) = infer_kb(policy, doc_id) else {
            warn!(doc_id, "orphaned chunks found but no inference rule covers this id");
            scan.unassigned.push(UnassignedOrphan {
                doc_id,
                reason: "no inference rule configured for this id".to_string(),
            });
            continue;
        };

        if store::get_knowledge_base(pool, kb_id).await?.is_none() {
            warn!(doc_id, kb_id, "inference points at a knowledge base that does not exist");
            scan.unassigned.push(UnassignedOrphan {
                doc_id,
                reason: format!("inferred kb {} does not exist", kb_id),
            });
            continue;
        }

        warn!(doc_id, kb_id, %basis, "synthesizing missing document record from heuristic assignment");

        let doc = Document {
            id: doc_id,
            kb_id,
            title: title.clone(),
            file_path: Some(format!("document_{}.pdf", doc_id)),
            content_type: "application/pdf".to_string(),
            file_size: 0,
            upload_date: chrono::Utc::now().to_rfc3339(),
            processed: true,
            processing_status: ProcessingStatus::Completed,
            metadata_json: first.metadata_json.clone(),
        };
        store::insert_document_record(&mut *tx, &doc).await?;

        scan.synthesized.push(SynthesizedDocument {
            doc_id,
            kb_id,
            title,
            basis,
        });
    }

    tx.commit().await?;
    Ok(scan)
}

fn title_from_metadata(metadata_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(metadata_json).ok()?;
    value
        .get("title")
        .and_then(|t| t.as_str())
        .filter(|t| !t.trim().is_empty())
        .map(|t| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KbRange;

    fn policy() -> RepairConfig {
        RepairConfig {
            kb_ranges: vec![
                KbRange {
                    max_doc_id: 7,
                    kb_id: 1,
                },
                KbRange {
                    max_doc_id: 14,
                    kb_id: 2,
                },
            ],
            default_kb_id: Some(3),
        }
    }

    #[test]
    fn test_infer_first_range() {
        let (kb, basis) = infer_kb(&policy(), 5).unwrap();
        assert_eq!(kb, 1);
        assert!(basis.contains("doc_id 5 <= 7"));
    }

    #[test]
    fn test_infer_second_range() {
        let (kb, _) = infer_kb(&policy(), 8).unwrap();
        assert_eq!(kb, 2);
    }

    #[test]
    fn test_infer_default() {
        let (kb, basis) = infer_kb(&policy(), 99).unwrap();
        assert_eq!(kb, 3);
        assert!(basis.starts_with("default"));
    }

    #[test]
    fn test_infer_none_without_rules() {
        let empty = RepairConfig::default();
        assert!(infer_kb(&empty, 5).is_none());
    }

    #[test]
    fn test_title_from_metadata() {
        assert_eq!(
            title_from_metadata(r#"{"title": "Uplink Tariffs"}"#),
            Some("Uplink Tariffs".to_string())
        );
        assert_eq!(title_from_metadata(r#"{"title": "  "}"#), None);
        assert_eq!(title_from_metadata("not json"), None);
        assert_eq!(title_from_metadata("{}"), None);
    }
}
