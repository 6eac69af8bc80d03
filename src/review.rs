//! Manual-review workflow.
//!
//! Documents whose signals stay below policy after OCR accumulate here.
//! The observed failure mode is acquisition interference fetching the
//! wrong document, which re-acquiring fixes, so the purge action deletes
//! the artifacts and re-queues the product instead of trying to repair the
//! text. Purging is always operator-initiated, never automatic.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::store::ArtifactStore;

/// One manual-review entry with its latest attempt outcome.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReviewEntry {
    pub id: String,
    pub artifact_key: String,
    pub product_no: String,
    pub product_name: String,
    pub total_chars: Option<i64>,
    pub name_match: Option<bool>,
    pub reg_no_match: Option<bool>,
    pub safety_phrase_match: Option<bool>,
    pub last_outcome: Option<String>,
}

/// All documents awaiting manual review, oldest acquisition first.
pub async fn list(pool: &SqlitePool) -> Result<Vec<ReviewEntry>> {
    let entries = sqlx::query_as(
        r#"
        SELECT d.id, d.artifact_key, d.product_no, d.product_name,
               d.total_chars, d.name_match, d.reg_no_match, d.safety_phrase_match,
               (SELECT outcome FROM ocr_attempts a
                WHERE a.document_id = d.id
                ORDER BY a.attempted_at DESC LIMIT 1) AS last_outcome
        FROM documents d
        WHERE d.verdict = 'manual_review_needed' AND d.flagged_for_deletion = 0
        ORDER BY d.acquired_at
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: usize,
}

/// Bulk purge of every document in manual review: delete the PDF and
/// sidecar from the store, drop the extracted text rows, and flag the
/// ledger row so the reconciler re-queues the product. The attempt ledger
/// stays; it documents why the document was purged.
pub async fn purge_all(pool: &SqlitePool, store: &ArtifactStore) -> Result<PurgeReport> {
    let entries = list(pool).await?;
    let mut report = PurgeReport::default();

    for entry in entries {
        store.purge(&entry.artifact_key)?;

        sqlx::query("DELETE FROM document_pages WHERE document_id = ?")
            .bind(&entry.id)
            .execute(pool)
            .await?;
        sqlx::query(
            r#"
            UPDATE documents
            SET flagged_for_deletion = 1,
                verdict = NULL, verdict_detail = NULL,
                total_chars = NULL, page_chars = NULL,
                name_match = NULL, reg_no_match = NULL, safety_phrase_match = NULL,
                relevance = NULL,
                accepted_version = 'original'
            WHERE id = ?
            "#,
        )
        .bind(&entry.id)
        .execute(pool)
        .await?;

        report.purged += 1;
    }

    Ok(report)
}
