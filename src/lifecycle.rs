//! Index lifecycle manager: the operations exposed per knowledge base.
//!
//! - `create` — build where no artifact exists; a no-op (reported, not an
//!   error) when one is already present.
//! - `recreate` — unconditional full rebuild, superseding any artifact.
//! - `repair` — consistency-check first, then recreate, so synthesized
//!   documents are included in the fresh artifact.
//! - `verify` — read-only drift check; reports without modifying anything.
//! - `migrate` — bring a legacy single-file store to canonical form,
//!   falling back to a full rebuild when the store is unreadable.
//!
//! The artifact is never externally observable in a half-state: every path
//! to a new pair goes through the builder's temp-write/verify/rename
//! discipline. Two racing recreates resolve as last-writer-wins at the
//! swap.

use sqlx::SqlitePool;
use tracing::warn;

use crate::artifact::{self, Artifact};
use crate::builder;
use crate::checker;
use crate::config::Config;
use crate::db;
use crate::error::{KbError, KbResult};
use crate::migrator::{self, MigrationOutcome};
use crate::models::KnowledgeBase;
use crate::report::{ArtifactState, OperationReport, VerifyReport};
use crate::store;

/// Which knowledge bases a CLI invocation addresses.
#[derive(Debug, Clone)]
pub enum KbTarget {
    One(i64),
    AllActive,
}

/// Build where no artifact exists yet.
pub async fn create(config: &Config, pool: &SqlitePool, kb_id: i64) -> KbResult<OperationReport> {
    let kb = store::require_active_knowledge_base(pool, kb_id).await?;
    let dir = artifact::artifact_dir(config, kb.id);

    if artifact::exists(&dir) {
        let mut report = OperationReport::new("create", kb.id, &kb.name);
        report.notes.push("artifact already present".to_string());
        return Ok(report);
    }

    rebuild(config, pool, &kb, "create").await
}

/// Unconditional full rebuild.
pub async fn recreate(config: &Config, pool: &SqlitePool, kb_id: i64) -> KbResult<OperationReport> {
    let kb = store::require_active_knowledge_base(pool, kb_id).await?;
    rebuild(config, pool, &kb, "recreate").await
}

/// Run the consistency checker, then rebuild so synthesized documents are
/// represented in the fresh artifact.
pub async fn repair(config: &Config, pool: &SqlitePool, kb_id: i64) -> KbResult<OperationReport> {
    let kb = store::require_active_knowledge_base(pool, kb_id).await?;

    let scan = checker::synthesize_missing_documents(pool, &config.repair).await?;

    let mut report = rebuild(config, pool, &kb, "repair").await?;
    report.synthesized = scan.synthesized;
    report.unassigned_orphans = scan.unassigned;
    Ok(report)
}

/// Read-only check that the artifact agrees with the metadata store.
///
/// Allowed on inactive knowledge bases: they retain their last-built
/// artifact, and looking is harmless.
pub async fn verify(config: &Config, pool: &SqlitePool, kb_id: i64) -> KbResult<VerifyReport> {
    let kb = store::get_knowledge_base(pool, kb_id)
        .await?
        .ok_or(KbError::KnowledgeBaseNotFound(kb_id))?;

    let dir = artifact::artifact_dir(config, kb.id);
    let chunk_count = store::count_chunks(pool, kb.id).await?;
    let mut issues = Vec::new();

    let artifact_rows = if artifact::exists(&dir) {
        match Artifact::load(&dir) {
            Ok(loaded) => {
                let doc_ids: std::collections::BTreeSet<i64> =
                    loaded.docstore.iter().map(|e| e.doc_id).collect();
                for doc_id in doc_ids {
                    match store::get_document(pool, doc_id).await? {
                        None => issues.push(format!(
                            "artifact references document {} which no longer exists",
                            doc_id
                        )),
                        Some(doc) if !doc.processed => issues.push(format!(
                            "artifact references document {} which is not processed",
                            doc_id
                        )),
                        Some(_) => {}
                    }
                }
                Some(loaded.row_count())
            }
            Err(e) => {
                issues.push(format!("artifact unreadable: {}", e));
                None
            }
        }
    } else {
        if chunk_count > 0 {
            issues.push("artifact not built but processed chunks exist".to_string());
        }
        None
    };

    if let Some(rows) = artifact_rows {
        if rows as i64 != chunk_count {
            issues.push(format!(
                "artifact has {} rows but the knowledge base currently has {} chunks",
                rows, chunk_count
            ));
        }
    }

    for doc_id in store::unchunked_processed_documents(pool, kb.id).await? {
        issues.push(format!("document {} is processed but owns no chunks", doc_id));
    }

    Ok(VerifyReport {
        kb_id: kb.id,
        kb_name: kb.name,
        artifact_rows,
        chunk_count,
        issues,
    })
}

/// Bring a legacy on-disk store to canonical form, or rebuild when it is
/// beyond recognition. The unreadable legacy file is kept for forensics;
/// once a canonical pair exists it is ignored.
pub async fn migrate(config: &Config, pool: &SqlitePool, kb_id: i64) -> KbResult<OperationReport> {
    let kb = store::require_active_knowledge_base(pool, kb_id).await?;
    let dir = artifact::artifact_dir(config, kb.id);
    let mut report = OperationReport::new("migrate", kb.id, &kb.name);

    match migrator::migrate_artifact(&dir) {
        Ok(MigrationOutcome::NothingToMigrate) => {
            report.notes.push("nothing on disk; not yet built".to_string());
        }
        Ok(MigrationOutcome::AlreadyCanonical) => {
            report.notes.push("store already canonical".to_string());
        }
        Ok(MigrationOutcome::Repersisted { shape, rows }) => {
            report.state = ArtifactState::Built { rows };
            report
                .notes
                .push(format!("repersisted {} as canonical pair", shape));
        }
        Err(KbError::ArtifactCorruption { reason, .. }) => {
            warn!(kb_id = kb.id, %reason, "legacy store not migratable; rebuilding from metadata store");
            let mut rebuilt = rebuild(config, pool, &kb, "migrate").await?;
            rebuilt.notes.insert(
                0,
                format!("legacy store unreadable ({}); rebuilt from metadata store", reason),
            );
            return Ok(rebuilt);
        }
        Err(e) => return Err(e),
    }

    Ok(report)
}

async fn rebuild(
    config: &Config,
    pool: &SqlitePool,
    kb: &KnowledgeBase,
    operation: &'static str,
) -> KbResult<OperationReport> {
    let mut report = OperationReport::new(operation, kb.id, &kb.name);

    match builder::build_index(config, pool, kb).await {
        Ok(outcome) => {
            report.chunks_processed = outcome.chunks_total;
            report.skipped = outcome.skipped;
            if matches!(outcome.state, ArtifactState::Unchanged) {
                report
                    .notes
                    .push("no processed content; nothing to build".to_string());
            }
            report.state = outcome.state;
        }
        // A failed row-count verification aborts the swap; the old artifact
        // remains authoritative and the operation is reported as failed.
        Err(e @ KbError::SwapVerification { .. }) => {
            report.state = ArtifactState::Failed {
                reason: e.to_string(),
            };
        }
        Err(e) => return Err(e),
    }

    Ok(report)
}

async fn resolve_targets(pool: &SqlitePool, target: &KbTarget) -> KbResult<Vec<i64>> {
    match target {
        KbTarget::One(id) => Ok(vec![*id]),
        KbTarget::AllActive => Ok(store::list_active_knowledge_bases(pool)
            .await?
            .iter()
            .map(|kb| kb.id)
            .collect()),
    }
}

// ============ CLI entry points ============

pub async fn run_create(config: &Config, target: KbTarget) -> anyhow::Result<()> {
    run_op(config, target, "create").await
}

pub async fn run_recreate(config: &Config, target: KbTarget) -> anyhow::Result<()> {
    run_op(config, target, "recreate").await
}

pub async fn run_repair(config: &Config, target: KbTarget) -> anyhow::Result<()> {
    run_op(config, target, "repair").await
}

pub async fn run_migrate(config: &Config, target: KbTarget) -> anyhow::Result<()> {
    run_op(config, target, "migrate").await
}

async fn run_op(config: &Config, target: KbTarget, op: &'static str) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;

    for kb_id in resolve_targets(&pool, &target).await? {
        let report = match op {
            "create" => create(config, &pool, kb_id).await?,
            "recreate" => recreate(config, &pool, kb_id).await?,
            "repair" => repair(config, &pool, kb_id).await?,
            "migrate" => migrate(config, &pool, kb_id).await?,
            _ => unreachable!(),
        };
        print_report(&report);
    }

    println!("ok");
    pool.close().await;
    Ok(())
}

pub async fn run_verify(config: &Config, target: KbTarget) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;

    let mut drift = false;
    for kb_id in resolve_targets(&pool, &target).await? {
        let report = verify(config, &pool, kb_id).await?;
        drift |= !report.in_sync();
        print_verify_report(&report);
    }

    pool.close().await;
    if drift {
        anyhow::bail!("drift detected");
    }
    println!("ok");
    Ok(())
}

fn print_report(report: &OperationReport) {
    println!("{} kb {} ({})", report.operation, report.kb_id, report.kb_name);
    println!("  chunks processed: {}", report.chunks_processed);

    if !report.skipped.is_empty() {
        println!("  chunks skipped: {}", report.skipped.len());
        for skipped in &report.skipped {
            println!(
                "    - chunk {} (doc {}): {}",
                skipped.chunk_id, skipped.doc_id, skipped.reason
            );
        }
    }

    if !report.synthesized.is_empty() {
        println!("  documents synthesized: {}", report.synthesized.len());
        for doc in &report.synthesized {
            println!(
                "    - doc {} -> kb {} \"{}\" [{}]",
                doc.doc_id, doc.kb_id, doc.title, doc.basis
            );
        }
    }

    for orphan in &report.unassigned_orphans {
        println!("    - doc {} left unassigned: {}", orphan.doc_id, orphan.reason);
    }

    match &report.state {
        ArtifactState::Built { rows } => println!("  artifact: built ({} rows)", rows),
        ArtifactState::Unchanged => println!("  artifact: unchanged"),
        ArtifactState::Failed { reason } => println!("  artifact: failed ({})", reason),
    }

    for note in &report.notes {
        println!("  note: {}", note);
    }
}

fn print_verify_report(report: &VerifyReport) {
    println!("verify kb {} ({})", report.kb_id, report.kb_name);
    match report.artifact_rows {
        Some(rows) => println!("  artifact rows: {}", rows),
        None => println!("  artifact rows: not built"),
    }
    println!("  current chunks: {}", report.chunk_count);
    if report.in_sync() {
        println!("  in sync");
    } else {
        for issue in &report.issues {
            println!("  drift: {}", issue);
        }
    }
}
