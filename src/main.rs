//! # kb-index CLI (`kbx`)
//!
//! The `kbx` binary is the operator interface for kb-index. It provides
//! commands for schema initialization, document ingestion, and the vector
//! index lifecycle: create, recreate, repair, verify, and legacy migration.
//!
//! ## Usage
//!
//! ```bash
//! kbx --config ./config/kbx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbx init` | Create the SQLite database and run schema migrations |
//! | `kbx kb create <name>` | Create a knowledge base |
//! | `kbx kb list` | List knowledge bases |
//! | `kbx kb deactivate <id>` | Deactivate a knowledge base (records retained) |
//! | `kbx add <kb_id> <file>` | Ingest a text file as a document plus chunks |
//! | `kbx create <kb_id>\|--all` | Build the artifact where none exists |
//! | `kbx recreate <kb_id>\|--all` | Unconditional full rebuild |
//! | `kbx repair <kb_id>\|--all` | Synthesize missing documents, then rebuild |
//! | `kbx verify <kb_id>\|--all` | Read-only drift check |
//! | `kbx migrate <kb_id>\|--all` | Convert a legacy store to the canonical pair |
//! | `kbx status` | Per-knowledge-base overview |

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use kb_index::config;
use kb_index::ingest;
use kb_index::kb_admin;
use kb_index::lifecycle::{self, KbTarget};
use kb_index::migrate;
use kb_index::status;

/// kb-index CLI — keeps relational knowledge-base records consistent with
/// their derived vector index artifacts.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kbx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kbx",
    about = "kb-index — vector index lifecycle manager for relational knowledge bases",
    version,
    long_about = "kb-index maintains per-knowledge-base vector index artifacts derived from a \
    relational store of documents and chunks. The metadata store is authoritative: artifacts are \
    disposable caches rebuilt wholesale, swapped atomically, repaired when chunk ingestion outran \
    its document records, and migrated from legacy single-file stores."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (knowledge_bases, knowledge_documents, document_chunks). This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Ingest a text file into a knowledge base.
    ///
    /// Chunks the file on paragraph boundaries and writes the document
    /// plus its full chunk set in a single transaction. Re-adding a file
    /// the knowledge base already knows replaces its chunk set.
    Add {
        /// Knowledge base id.
        kb_id: i64,

        /// Path to a plain-text file.
        path: PathBuf,

        /// Document title; defaults to the file stem.
        #[arg(long)]
        title: Option<String>,
    },

    /// Build the vector index artifact where none exists.
    ///
    /// A no-op (reported, not an error) when the knowledge base already
    /// has a canonical artifact pair on disk.
    Create {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Rebuild the vector index artifact unconditionally.
    ///
    /// Embeds every chunk of the knowledge base's processed documents and
    /// atomically replaces the previous artifact pair. Readers of the old
    /// pair are never exposed to a half-written index.
    Recreate {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Synthesize missing document records, then rebuild.
    ///
    /// Runs the chunk consistency checker first so chunks whose document
    /// record was lost are re-parented (via the configured id-range
    /// policy) and included in the fresh artifact.
    Repair {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Check that the artifact agrees with the metadata store.
    ///
    /// Read-only: compares artifact row count with the current chunk
    /// count and confirms every referenced document is processed. Exits
    /// non-zero when drift is found.
    Verify {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Convert a legacy single-file store to the canonical pair.
    ///
    /// Classifies what is on disk first; fully-formed legacy objects are
    /// repersisted without re-embedding, unreadable ones trigger a full
    /// rebuild from the metadata store.
    Migrate {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Show a per-knowledge-base status overview.
    ///
    /// Document and chunk counts next to each artifact's on-disk state
    /// (canonical, legacy, corrupt, absent) and row count.
    Status,

    /// Manage knowledge bases.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },
}

/// Selects the knowledge base(s) an operation addresses.
#[derive(Args)]
struct TargetArgs {
    /// Knowledge base id.
    kb_id: Option<i64>,

    /// Operate on every active knowledge base.
    #[arg(long)]
    all: bool,
}

impl TargetArgs {
    fn resolve(&self) -> anyhow::Result<KbTarget> {
        match (self.kb_id, self.all) {
            (Some(id), false) => Ok(KbTarget::One(id)),
            (None, true) => Ok(KbTarget::AllActive),
            (Some(_), true) => anyhow::bail!("pass either a knowledge base id or --all, not both"),
            (None, false) => anyhow::bail!("pass a knowledge base id or --all"),
        }
    }
}

/// Knowledge base management subcommands.
#[derive(Subcommand)]
enum KbAction {
    /// Create a knowledge base.
    Create {
        /// Unique knowledge base name.
        name: String,

        /// Free-form description.
        #[arg(long)]
        description: Option<String>,

        /// Category label (e.g. technical, user, security).
        #[arg(long, default_value = "general")]
        category: String,

        /// Creator recorded on the knowledge base.
        #[arg(long, default_value = "admin")]
        created_by: String,
    },

    /// List knowledge bases.
    List {
        /// Include deactivated knowledge bases.
        #[arg(long)]
        include_inactive: bool,
    },

    /// Deactivate a knowledge base.
    ///
    /// Records and the last-built artifact are retained; the knowledge
    /// base is excluded from rebuild and retrieval.
    Deactivate {
        /// Knowledge base id.
        kb_id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Add { kb_id, path, title } => {
            ingest::run_add(&cfg, kb_id, &path, title).await?;
        }
        Commands::Create { target } => {
            lifecycle::run_create(&cfg, target.resolve()?).await?;
        }
        Commands::Recreate { target } => {
            lifecycle::run_recreate(&cfg, target.resolve()?).await?;
        }
        Commands::Repair { target } => {
            lifecycle::run_repair(&cfg, target.resolve()?).await?;
        }
        Commands::Verify { target } => {
            lifecycle::run_verify(&cfg, target.resolve()?).await?;
        }
        Commands::Migrate { target } => {
            lifecycle::run_migrate(&cfg, target.resolve()?).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Kb { action } => match action {
            KbAction::Create {
                name,
                description,
                category,
                created_by,
            } => {
                kb_admin::run_kb_create(&cfg, &name, description.as_deref(), &category, &created_by)
                    .await?;
            }
            KbAction::List { include_inactive } => {
                kb_admin::run_kb_list(&cfg, include_inactive).await?;
            }
            KbAction::Deactivate { kb_id } => {
                kb_admin::run_kb_deactivate(&cfg, kb_id).await?;
            }
        },
    }

    Ok(())
}
