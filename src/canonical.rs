//! Two-phase name canonicalization.
//!
//! Phase one (Classify) assigns each raw crop/target name a coarse
//! category in small batches, defaulting to `Other` when the oracle is
//! unsure or silent. Phase two (Refine) regroups rows by (crop, category)
//! and sends each whole group as context, letting the oracle cluster
//! synonyms onto one canonical name. Rows an operator has locked are never
//! sent and never mutated; repeated refine runs converge instead of
//! thrashing manual work.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::OracleConfig;
use crate::models::NameRecord;
use crate::oracle::{NameOracle, RefineInput};
use crate::progress::Progress;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub inserted: usize,
    pub already_known: usize,
}

/// Import raw names from a CSV with `raw_name` and `crop` columns. Already
/// known names are left untouched, whatever their state.
pub async fn import(pool: &SqlitePool, path: &Path) -> Result<ImportReport> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open name CSV: {}", path.display()))?;
    let headers = rdr.headers()?.clone();
    let name_col = headers
        .iter()
        .position(|h| {
            let h = h.trim();
            h.eq_ignore_ascii_case("raw_name")
                || h.eq_ignore_ascii_case("name")
                || h.eq_ignore_ascii_case("target")
        })
        .context("name CSV missing a raw_name column")?;
    let crop_col = headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case("crop"))
        .context("name CSV missing a crop column")?;

    let mut report = ImportReport::default();
    for record in rdr.records() {
        let record = record?;
        let raw_name = record.get(name_col).unwrap_or("").trim().to_string();
        let crop = record.get(crop_col).unwrap_or("").trim().to_string();
        if raw_name.is_empty() || crop.is_empty() {
            continue;
        }
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO name_records (raw_name, crop, updated_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&raw_name)
        .bind(&crop)
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?;
        if result.rows_affected() > 0 {
            report.inserted += 1;
        } else {
            report.already_known += 1;
        }
    }
    Ok(report)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClassifyReport {
    pub classified: usize,
    pub defaulted_other: usize,
    pub errored_batches: usize,
}

/// Classify phase: categorize every unclassified, unlocked name. A failed
/// batch is counted and skipped; the run always completes.
pub async fn classify(
    pool: &SqlitePool,
    oracle: &dyn NameOracle,
    cfg: &OracleConfig,
    progress: Arc<dyn Progress>,
) -> Result<ClassifyReport> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT raw_name FROM name_records WHERE category IS NULL AND locked = 0 ORDER BY raw_name",
    )
    .fetch_all(pool)
    .await?;
    let names: Vec<String> = rows.into_iter().map(|(n,)| n).collect();

    progress.begin(names.len() as u64, "classifying raw names");
    let mut report = ClassifyReport::default();

    for batch in names.chunks(cfg.classify_batch_size.max(1)) {
        let suggestions = match oracle.classify(batch).await {
            Ok(s) => s,
            Err(_) => {
                report.errored_batches += 1;
                progress.advance(batch.len() as u64);
                continue;
            }
        };
        let by_name: BTreeMap<&str, &str> = suggestions
            .iter()
            .map(|s| (s.raw_name.as_str(), s.category.as_str()))
            .collect();

        for raw_name in batch {
            // Names the oracle dropped from its answer default to Other;
            // every input row leaves this phase categorized.
            let category = by_name.get(raw_name.as_str()).copied().unwrap_or("Other");
            if category == "Other" && !by_name.contains_key(raw_name.as_str()) {
                report.defaulted_other += 1;
            }
            sqlx::query(
                "UPDATE name_records SET category = ?, updated_at = ? WHERE raw_name = ? AND locked = 0",
            )
            .bind(category)
            .bind(chrono::Utc::now().timestamp())
            .bind(raw_name)
            .execute(pool)
            .await?;
            report.classified += 1;
        }
        progress.advance(batch.len() as u64);
    }

    progress.finish(&format!(
        "{} classified, {} defaulted to Other, {} batches errored",
        report.classified, report.defaulted_other, report.errored_batches
    ));
    Ok(report)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefineReport {
    pub updated: usize,
    pub locked_skipped: usize,
    pub errored_groups: usize,
}

/// Refine phase: unify each (crop, category) group onto canonical names.
///
/// The whole group travels as context either way. Without `overwrite`,
/// suggestions land only on rows that have no canonical name yet; with it,
/// every unlocked row in the group is rewritten.
pub async fn refine(
    pool: &SqlitePool,
    oracle: &dyn NameOracle,
    cfg: &OracleConfig,
    overwrite: bool,
    progress: Arc<dyn Progress>,
) -> Result<RefineReport> {
    let locked_count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM name_records WHERE locked = 1")
            .fetch_one(pool)
            .await?;

    let rows: Vec<(String, String, String, Option<String>, Option<String>)> = sqlx::query_as(
        r#"
        SELECT raw_name, crop, category, canonical_name, scientific_name
        FROM name_records
        WHERE category IS NOT NULL AND locked = 0
        ORDER BY crop, category, raw_name
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut groups: BTreeMap<(String, String), Vec<RefineInput>> = BTreeMap::new();
    for (raw_name, crop, category, canonical_name, scientific_name) in rows {
        groups.entry((crop, category)).or_default().push(RefineInput {
            raw_name,
            canonical_name,
            scientific_name,
        });
    }

    let total: usize = groups.values().map(|g| g.len()).sum();
    progress.begin(total as u64, "refining canonical names");
    let mut report = RefineReport {
        locked_skipped: locked_count.0 as usize,
        ..Default::default()
    };

    for ((crop, category), group) in &groups {
        for chunk in group.chunks(cfg.refine_batch_size.max(1)) {
            let suggestions = match oracle.refine(crop, category, chunk).await {
                Ok(s) => s,
                Err(_) => {
                    report.errored_groups += 1;
                    progress.advance(chunk.len() as u64);
                    continue;
                }
            };
            for suggestion in suggestions {
                // The lock guard repeats in SQL: a row locked between the
                // read and this write stays untouched.
                let sql = if overwrite {
                    r#"
                    UPDATE name_records
                    SET category = ?, canonical_name = ?, scientific_name = ?, updated_at = ?
                    WHERE raw_name = ? AND locked = 0
                    "#
                } else {
                    r#"
                    UPDATE name_records
                    SET category = ?, canonical_name = ?, scientific_name = ?, updated_at = ?
                    WHERE raw_name = ? AND locked = 0 AND canonical_name IS NULL
                    "#
                };
                let result = sqlx::query(sql)
                    .bind(&suggestion.category)
                    .bind(&suggestion.canonical_name)
                    .bind(&suggestion.scientific_name)
                    .bind(chrono::Utc::now().timestamp())
                    .bind(&suggestion.raw_name)
                    .execute(pool)
                    .await?;
                report.updated += result.rows_affected() as usize;
            }
            progress.advance(chunk.len() as u64);
        }
    }

    progress.finish(&format!(
        "{} updated, {} locked rows untouched, {} groups errored",
        report.updated, report.locked_skipped, report.errored_groups
    ));
    Ok(report)
}

/// Load one record; test and CLI helper.
pub async fn get_record(pool: &SqlitePool, raw_name: &str) -> Result<Option<NameRecord>> {
    let row: Option<(String, String, Option<String>, Option<String>, Option<String>, bool)> =
        sqlx::query_as(
            r#"
            SELECT raw_name, crop, category, canonical_name, scientific_name, locked
            FROM name_records WHERE raw_name = ?
            "#,
        )
        .bind(raw_name)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(
        |(raw_name, crop, category, canonical_name, scientific_name, locked)| NameRecord {
            raw_name,
            crop,
            category,
            canonical_name,
            scientific_name,
            locked,
        },
    ))
}

/// Mark a record as manually edited. Automated passes skip it afterwards.
pub async fn lock_record(pool: &SqlitePool, raw_name: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE name_records SET locked = 1, updated_at = ? WHERE raw_name = ?",
    )
    .bind(chrono::Utc::now().timestamp())
    .bind(raw_name)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
