//! # Labelforge CLI (`lbf`)
//!
//! The `lbf` binary drives the label acquisition and QA pipeline. Commands
//! follow the data flow: ingest a registry snapshot, reconcile it against
//! the local inventory, acquire missing documents, quality-check their
//! text, escalate to OCR, gate on agricultural relevance, and canonicalize
//! raw names.
//!
//! ## Usage
//!
//! ```bash
//! lbf --config ./config/lbf.toml <command>
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use labelforge::{
    acquire, cancel, canonical, catalog, config, db, migrate, ocr, oracle, progress, qa,
    reconcile, relevance, review, snapshot, store,
};

/// Labelforge CLI — acquisition and QA pipeline for regulatory
/// product-label documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lbf.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lbf",
    about = "Labelforge — acquisition and QA pipeline for regulatory product-label documents",
    version,
    long_about = "Labelforge reconciles a state pesticide-registry snapshot against a local \
    document inventory, downloads missing label PDFs through a bounded and rate-limited \
    session pool, quality-checks the extracted text with OCR escalation, gates documents on \
    agricultural relevance, and canonicalizes raw crop/target names via an external \
    classification oracle."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lbf.toml")]
    config: PathBuf,

    /// Progress output: `auto` (human when stderr is a TTY), `human`,
    /// `json`, or `off`.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Ingest a registry export (a `.zip` archive or a directory of CSVs).
    ///
    /// Joins the auxiliary attribute tables onto each product and stores
    /// the result under a content-derived snapshot version. Re-ingesting
    /// identical files is a no-op.
    Snapshot {
        /// Path to the export archive or directory.
        path: PathBuf,
    },

    /// Preview the acquisition work queue for a snapshot.
    ///
    /// Applies the use-type allow-list and product-type exclusions,
    /// records every exclusion with its reason, and subtracts products
    /// whose documents are already in the store.
    Reconcile {
        /// Snapshot version to reconcile (defaults to the latest).
        #[arg(long)]
        snapshot: Option<String>,
    },

    /// Acquire missing label documents from the remote catalog.
    ///
    /// Runs the bounded session pool with the global start throttle.
    /// Ctrl-C cancels cooperatively: in-flight items finish, queued items
    /// are skipped.
    Acquire {
        /// Snapshot version to acquire against (defaults to the latest).
        #[arg(long)]
        snapshot: Option<String>,

        /// Maximum number of queue items to process in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the configured session pool bound.
        #[arg(long)]
        max_sessions: Option<usize>,

        /// Override the configured headless setting for browser-backed
        /// catalog sessions. Bare `--headless` means true; pass
        /// `--headless false` to watch the sessions.
        #[arg(long, num_args(0..=1), default_missing_value = "true")]
        headless: Option<bool>,
    },

    /// Extract text and classify quality for unchecked documents.
    Qa {
        /// Maximum number of documents to check in this run.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run OCR escalation for documents flagged by QA.
    ///
    /// Requires `pdftoppm` and `tesseract` on PATH. Ctrl-C cancels
    /// cooperatively.
    Ocr {
        /// Maximum number of documents to escalate in this run.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Classify accepted documents by agricultural relevance.
    Relevance,

    /// Manage the canonical name vocabulary.
    Names {
        #[command(subcommand)]
        action: NamesAction,
    },

    /// Manual-review workflow for documents that failed OCR escalation.
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Show pipeline counts: snapshots, documents by verdict, relevance,
    /// and name-record progress.
    Status,
}

/// Name-vocabulary subcommands.
#[derive(Subcommand)]
enum NamesAction {
    /// Import raw names from a CSV with `raw_name` and `crop` columns.
    Import {
        /// Path to the CSV file.
        path: PathBuf,
    },

    /// Phase one: assign a category to every unclassified name.
    ///
    /// Small batches preserve oracle accuracy; names the oracle drops
    /// default to `Other`.
    Classify,

    /// Phase two: unify each (crop, category) group onto canonical names.
    ///
    /// The whole group is sent as context. Locked rows are never sent and
    /// never mutated.
    Refine {
        /// Rewrite rows that already carry a canonical name. Without this
        /// flag only uncanonicalized rows are updated.
        #[arg(long)]
        overwrite: bool,
    },

    /// Lock a record after a manual edit so automated passes skip it.
    Lock {
        /// The raw name (exact string) to lock.
        raw_name: String,
    },
}

/// Manual-review subcommands.
#[derive(Subcommand)]
enum ReviewAction {
    /// List documents awaiting manual review with their failing signals.
    List,

    /// Delete all artifacts for every reviewed document and re-queue the
    /// products for acquisition.
    ///
    /// Prints the affected count and stops unless `--yes` is given.
    /// Consider re-running `acquire` with a smaller
    /// `acquisition.max_sessions` afterwards; review entries usually come
    /// from acquisition interference.
    Purge {
        /// Proceed without confirmation.
        #[arg(long)]
        yes: bool,
    },
}

fn progress_mode(flag: &str) -> anyhow::Result<progress::ProgressMode> {
    Ok(match flag {
        "auto" => progress::ProgressMode::default_for_tty(),
        "human" => progress::ProgressMode::Human,
        "json" => progress::ProgressMode::Json,
        "off" => progress::ProgressMode::Off,
        other => anyhow::bail!("Unknown progress mode: '{}'", other),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let reporter = progress_mode(&cli.progress)?.reporter();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Snapshot { path } => {
            let pool = db::connect(&cfg).await?;
            let snap = snapshot::load_export(&path)?;
            let inserted = snapshot::persist_snapshot(&pool, &snap).await?;
            if inserted {
                println!(
                    "Ingested snapshot {} ({} products).",
                    snap.version,
                    snap.products.len()
                );
            } else {
                println!("Snapshot {} already ingested.", snap.version);
            }
        }
        Commands::Reconcile { snapshot: version } => {
            let pool = db::connect(&cfg).await?;
            let version = resolve_version(&pool, version).await?;
            let snap = snapshot::load_snapshot(&pool, &version).await?;
            let inventory = store::ArtifactStore::new(&cfg.store.root).inventory()?;
            let (queue, report) = reconcile::build_work_queue(&pool, &snap, &inventory).await?;
            println!(
                "Snapshot {}: {} queued, {} already acquired, {} excluded.",
                version, report.queued, report.already_acquired, report.excluded
            );
            for item in queue.iter().take(20) {
                println!("  {}  {}", item.product_no, item.product_name);
            }
            if queue.len() > 20 {
                println!("  ... and {} more", queue.len() - 20);
            }
        }
        Commands::Acquire {
            snapshot: version,
            limit,
            max_sessions,
            headless,
        } => {
            let mut acquisition = cfg.acquisition.clone();
            if let Some(max_sessions) = max_sessions {
                acquisition.max_sessions = max_sessions;
            }
            if let Some(headless) = headless {
                acquisition.headless = headless;
            }

            let pool = db::connect(&cfg).await?;
            let version = resolve_version(&pool, version).await?;
            let snap = snapshot::load_snapshot(&pool, &version).await?;
            let artifact_store = store::ArtifactStore::new(&cfg.store.root);
            let inventory = artifact_store.inventory()?;
            let (mut queue, _) = reconcile::build_work_queue(&pool, &snap, &inventory).await?;
            if let Some(limit) = limit {
                queue.truncate(limit);
            }
            if queue.is_empty() {
                println!("Nothing to acquire.");
                return Ok(());
            }

            let cancel = cancel_on_ctrl_c("in-flight sessions will finish");
            let remote = Arc::new(catalog::HttpCatalog::new(&cfg.catalog)?);
            let report = acquire::run(
                remote,
                artifact_store,
                pool,
                queue,
                &acquisition,
                reporter,
                cancel,
            )
            .await?;
            println!(
                "{} succeeded, {} failed, {} cancelled.",
                report.succeeded, report.failed, report.cancelled
            );
            for (product_no, outcome) in &report.outcomes {
                if let acquire::ItemOutcome::Failed(reason) = outcome {
                    println!("  failed {}: {}", product_no, reason);
                }
            }
        }
        Commands::Qa { limit } => {
            let pool = db::connect(&cfg).await?;
            let artifact_store = store::ArtifactStore::new(&cfg.store.root);
            let report = qa::run(&pool, &artifact_store, &cfg.qa, limit, reporter).await?;
            println!(
                "{} passed, {} page-ocr, {} full-ocr, {} unreadable.",
                report.passed, report.page_ocr, report.full_ocr, report.extract_failed
            );
        }
        Commands::Ocr { limit } => {
            let pool = db::connect(&cfg).await?;
            let artifact_store = store::ArtifactStore::new(&cfg.store.root);
            let backend = Arc::new(ocr::TesseractBackend::new(&cfg.ocr));
            let cancel = cancel_on_ctrl_c("documents being escalated will finish");
            let report = ocr::run(
                &pool,
                &artifact_store,
                backend,
                &cfg.ocr,
                &cfg.qa,
                limit,
                reporter,
                cancel,
            )
            .await?;
            println!(
                "{} improved, {} not necessary, {} still failing, {} errored, {} cancelled.",
                report.improved,
                report.not_necessary,
                report.still_failing,
                report.errored,
                report.cancelled
            );
            if report.still_failing > 0 {
                println!("Run `lbf review list` to inspect the failures.");
            }
        }
        Commands::Relevance => {
            let pool = db::connect(&cfg).await?;
            let report = relevance::run(&pool, cfg.ocr.min_gain_chars, reporter).await?;
            println!(
                "{} both, {} ag-only, {} rei-only, {} none.",
                report.both, report.ag_only, report.rei_only, report.none
            );
        }
        Commands::Names { action } => {
            let pool = db::connect(&cfg).await?;
            match action {
                NamesAction::Import { path } => {
                    let report = canonical::import(&pool, &path).await?;
                    println!(
                        "{} names imported, {} already known.",
                        report.inserted, report.already_known
                    );
                }
                NamesAction::Classify => {
                    let remote = build_oracle(&cfg)?;
                    let report =
                        canonical::classify(&pool, remote.as_ref(), &cfg.oracle, reporter).await?;
                    println!(
                        "{} classified, {} defaulted to Other, {} batches errored.",
                        report.classified, report.defaulted_other, report.errored_batches
                    );
                }
                NamesAction::Refine { overwrite } => {
                    let remote = build_oracle(&cfg)?;
                    let report =
                        canonical::refine(&pool, remote.as_ref(), &cfg.oracle, overwrite, reporter)
                            .await?;
                    println!(
                        "{} updated, {} locked rows untouched, {} groups errored.",
                        report.updated, report.locked_skipped, report.errored_groups
                    );
                }
                NamesAction::Lock { raw_name } => {
                    if canonical::lock_record(&pool, &raw_name).await? {
                        println!("Locked '{}'.", raw_name);
                    } else {
                        println!("No record named '{}'.", raw_name);
                    }
                }
            }
        }
        Commands::Review { action } => {
            let pool = db::connect(&cfg).await?;
            match action {
                ReviewAction::List => {
                    let entries = review::list(&pool).await?;
                    if entries.is_empty() {
                        println!("No documents awaiting review.");
                    }
                    for entry in entries {
                        println!(
                            "{}  {}  chars={}  name={}  reg_no={}  phrase={}  last={}",
                            entry.product_no,
                            entry.product_name,
                            entry.total_chars.unwrap_or(0),
                            flag(entry.name_match),
                            flag(entry.reg_no_match),
                            flag(entry.safety_phrase_match),
                            entry.last_outcome.as_deref().unwrap_or("-"),
                        );
                    }
                }
                ReviewAction::Purge { yes } => {
                    let entries = review::list(&pool).await?;
                    if entries.is_empty() {
                        println!("No documents awaiting review.");
                    } else if !yes {
                        println!(
                            "{} documents would be purged and re-queued. \
                             Re-run with --yes to proceed.",
                            entries.len()
                        );
                    } else {
                        let artifact_store = store::ArtifactStore::new(&cfg.store.root);
                        let report = review::purge_all(&pool, &artifact_store).await?;
                        println!(
                            "{} documents purged and re-queued. Consider lowering \
                             acquisition.max_sessions before re-acquiring.",
                            report.purged
                        );
                    }
                }
            }
        }
        Commands::Status => {
            let pool = db::connect(&cfg).await?;
            print_status(&pool).await?;
        }
    }

    Ok(())
}

fn cancel_on_ctrl_c(note: &'static str) -> cancel::CancelToken {
    let token = cancel::CancelToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling: {}", note);
            handle.cancel();
        }
    });
    token
}

fn build_oracle(cfg: &config::Config) -> anyhow::Result<Arc<dyn oracle::NameOracle>> {
    if !cfg.oracle.is_enabled() {
        anyhow::bail!(
            "No oracle configured. Set [oracle] provider and model in the config file."
        );
    }
    Ok(Arc::new(oracle::OpenAiOracle::new(&cfg.oracle)?))
}

async fn resolve_version(
    pool: &sqlx::SqlitePool,
    requested: Option<String>,
) -> anyhow::Result<String> {
    match requested {
        Some(version) => Ok(version),
        None => snapshot::latest_version(pool)
            .await?
            .context("No snapshot ingested yet. Run `lbf snapshot <export>` first."),
    }
}

fn flag(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "ok",
        Some(false) => "MISS",
        None => "-",
    }
}

async fn print_status(pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
    let snapshots: Vec<(String, i64)> = sqlx::query_as(
        "SELECT version, product_count FROM snapshots ORDER BY ingested_at DESC",
    )
    .fetch_all(pool)
    .await?;
    println!("Snapshots:");
    for (version, count) in &snapshots {
        println!("  {}  {} products", version, count);
    }
    if snapshots.is_empty() {
        println!("  (none)");
    }

    let verdicts: Vec<(Option<String>, i64)> = sqlx::query_as(
        "SELECT verdict, COUNT(*) FROM documents WHERE flagged_for_deletion = 0 GROUP BY verdict",
    )
    .fetch_all(pool)
    .await?;
    println!("Documents:");
    for (verdict, count) in &verdicts {
        println!("  {}  {}", verdict.as_deref().unwrap_or("unchecked"), count);
    }
    if verdicts.is_empty() {
        println!("  (none)");
    }

    let relevance: Vec<(Option<String>, i64)> = sqlx::query_as(
        "SELECT relevance, COUNT(*) FROM documents WHERE relevance IS NOT NULL GROUP BY relevance",
    )
    .fetch_all(pool)
    .await?;
    if !relevance.is_empty() {
        println!("Relevance:");
        for (value, count) in &relevance {
            println!("  {}  {}", value.as_deref().unwrap_or("-"), count);
        }
    }

    let (total_names,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM name_records")
        .fetch_one(pool)
        .await?;
    let (canonical_names,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM name_records WHERE canonical_name IS NOT NULL")
            .fetch_one(pool)
            .await?;
    let (locked_names,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM name_records WHERE locked = 1")
            .fetch_one(pool)
            .await?;
    println!(
        "Names: {} total, {} canonicalized, {} locked",
        total_names, canonical_names, locked_names
    );

    Ok(())
}
