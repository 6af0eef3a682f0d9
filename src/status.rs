//! Knowledge base status overview.
//!
//! A quick per-knowledge-base summary of what's recorded and what's built:
//! document and chunk counts next to the on-disk artifact's state and row
//! count. Used by `kbx status` to spot drift and unmigrated legacy stores
//! at a glance.

use anyhow::Result;

use crate::artifact::{self, Artifact};
use crate::config::Config;
use crate::db;
use crate::migrator::{self, ClassifiedArtifact};
use crate::store;

/// Run the status command: query the database and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let kbs = store::list_knowledge_bases(&pool, false).await?;

    println!("kb-index — Knowledge Base Status");
    println!("================================");
    println!();
    println!("  Database:  {}", config.db.path.display());
    println!("  Artifacts: {}", config.artifacts.root.display());
    println!();
    println!(
        "  {:<4} {:<28} {:<7} {:>6} {:>8} {:>8}   {}",
        "ID", "NAME", "ACTIVE", "DOCS", "CHUNKS", "ROWS", "ARTIFACT"
    );
    println!("  {}", "-".repeat(78));

    for kb in &kbs {
        let (doc_count, _, chunk_count) = store::kb_counts(&pool, kb.id).await?;
        let dir = artifact::artifact_dir(config, kb.id);

        let (state, rows) = match migrator::classify(&dir)? {
            None => ("absent", None),
            Some(ClassifiedArtifact::CanonicalPair) => match Artifact::load(&dir) {
                Ok(loaded) => ("canonical", Some(loaded.row_count())),
                Err(_) => ("corrupt", None),
            },
            Some(ClassifiedArtifact::LegacyCombinedObject(_))
            | Some(ClassifiedArtifact::LegacyTuplePair(_)) => ("legacy", None),
            Some(ClassifiedArtifact::Unrecognized { .. }) => ("unrecognized", None),
        };
        let rows_display = rows.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());

        println!(
            "  {:<4} {:<28} {:<7} {:>6} {:>8} {:>8}   {}",
            kb.id,
            kb.name,
            if kb.is_active { "yes" } else { "no" },
            doc_count,
            chunk_count,
            rows_display,
            state
        );
    }

    println!();
    pool.close().await;
    Ok(())
}
