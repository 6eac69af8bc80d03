//! Database schema migrations.
//!
//! Every statement is `CREATE ... IF NOT EXISTS`, so `lbf init` can run
//! any number of times against the same database.

use anyhow::Result;

use crate::config::Config;
use crate::db;

/// Create all tables and indexes.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Registry snapshots (one row per ingested export)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            version TEXT PRIMARY KEY,
            ingested_at INTEGER NOT NULL,
            product_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Products, refreshed per snapshot
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            product_no TEXT NOT NULL,
            snapshot_version TEXT NOT NULL,
            registration_number TEXT NOT NULL,
            product_name TEXT NOT NULL,
            product_id TEXT,
            registration_status TEXT,
            auth_type TEXT,
            product_types TEXT NOT NULL DEFAULT '[]',
            use_types TEXT NOT NULL DEFAULT '[]',
            toxicities TEXT NOT NULL DEFAULT '[]',
            formulation TEXT,
            PRIMARY KEY (product_no, snapshot_version),
            FOREIGN KEY (snapshot_version) REFERENCES snapshots(version)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Filter audit: every product excluded by the reconciler, with reason
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS exclusions (
            product_no TEXT NOT NULL,
            snapshot_version TEXT NOT NULL,
            reason TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,
            PRIMARY KEY (product_no, snapshot_version)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Label document QA ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            artifact_key TEXT NOT NULL UNIQUE,
            product_no TEXT NOT NULL,
            registration_number TEXT NOT NULL,
            product_name TEXT NOT NULL,
            label_type TEXT,
            total_chars INTEGER,
            page_chars TEXT,
            name_match INTEGER,
            reg_no_match INTEGER,
            safety_phrase_match INTEGER,
            verdict TEXT,
            verdict_detail TEXT,
            accepted_version TEXT NOT NULL DEFAULT 'original',
            relevance TEXT,
            flagged_for_deletion INTEGER NOT NULL DEFAULT 0,
            acquired_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Extracted page texts; original rows are never deleted, OCR rows are
    // stored alongside under version = 'ocr'
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_pages (
            document_id TEXT NOT NULL,
            page_index INTEGER NOT NULL,
            version TEXT NOT NULL,
            text TEXT NOT NULL,
            char_count INTEGER NOT NULL,
            PRIMARY KEY (document_id, page_index, version),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Append-only OCR attempt ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ocr_attempts (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            scope TEXT NOT NULL,
            before_signals TEXT NOT NULL,
            after_signals TEXT,
            outcome TEXT NOT NULL,
            attempted_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Canonical name mapping (crops and biological targets)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS name_records (
            raw_name TEXT PRIMARY KEY,
            crop TEXT NOT NULL,
            category TEXT,
            canonical_name TEXT,
            scientific_name TEXT,
            locked INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_product_no ON documents(product_no)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_verdict ON documents(verdict)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ocr_attempts_document_id ON ocr_attempts(document_id)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_name_records_crop ON name_records(crop)")
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}
