//! Agricultural-relevance classification.
//!
//! Labels for farm use carry an "agricultural use requirements" block and a
//! "restricted entry interval" statement. Both phrases are searched fuzzily
//! over normalized text, at a wider tolerance than the identity checks:
//! these phrases are long and OCR noise accumulates over them.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::models::{Relevance, TextVersion};
use crate::progress::Progress;
use crate::qa;

const AG_PHRASE: &str = "agricultural use requirements";
const REI_PHRASE: &str = "restricted entry interval";
const PHRASE_MAX_DIST: usize = 2;

/// Classify one document's accepted text.
pub fn classify_text(text: &str) -> Relevance {
    let norm = qa::normalize_for_match(text);
    let ag = qa::fuzzy_contains(&norm, &qa::normalize_for_match(AG_PHRASE), PHRASE_MAX_DIST);
    let rei = qa::fuzzy_contains(&norm, &qa::normalize_for_match(REI_PHRASE), PHRASE_MAX_DIST);
    match (ag, rei) {
        (true, true) => Relevance::Both,
        (true, false) => Relevance::AgOnly,
        (false, true) => Relevance::ReiOnly,
        (false, false) => Relevance::None,
    }
}

/// A document is admitted for downstream extraction only when its verdict
/// is not manual review and its text shows at least one relevance cue.
pub fn is_admitted(verdict: Option<&str>, relevance: Relevance) -> bool {
    verdict != Some("manual_review_needed") && relevance != Relevance::None
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelevanceReport {
    pub both: usize,
    pub ag_only: usize,
    pub rei_only: usize,
    pub none: usize,
}

/// Classify every document with a verdict but no relevance yet. Documents
/// in manual review are skipped; their text is not trusted.
pub async fn run(
    pool: &SqlitePool,
    min_gain_chars: usize,
    progress: Arc<dyn Progress>,
) -> Result<RelevanceReport> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT id, accepted_version FROM documents
        WHERE verdict IS NOT NULL
          AND verdict != 'manual_review_needed'
          AND relevance IS NULL
          AND flagged_for_deletion = 0
        ORDER BY artifact_key
        "#,
    )
    .fetch_all(pool)
    .await?;

    progress.begin(rows.len() as u64, "classifying agricultural relevance");
    let mut report = RelevanceReport::default();

    for (id, accepted_version) in rows {
        let pages = load_accepted_pages(pool, &id, &accepted_version, min_gain_chars).await?;
        let relevance = classify_text(&pages.join(" "));
        match relevance {
            Relevance::Both => report.both += 1,
            Relevance::AgOnly => report.ag_only += 1,
            Relevance::ReiOnly => report.rei_only += 1,
            Relevance::None => report.none += 1,
        }
        sqlx::query("UPDATE documents SET relevance = ? WHERE id = ?")
            .bind(relevance.as_str())
            .bind(&id)
            .execute(pool)
            .await?;
        progress.advance(1);
    }

    progress.finish(&format!(
        "{} both, {} ag, {} rei, {} none",
        report.both, report.ag_only, report.rei_only, report.none
    ));
    Ok(report)
}

/// The accepted text of a document: original pages, overridden by adopted
/// OCR pages when the OCR version is accepted.
pub async fn load_accepted_pages(
    pool: &SqlitePool,
    document_id: &str,
    accepted_version: &str,
    min_gain_chars: usize,
) -> Result<Vec<String>> {
    let mut pages = qa::load_pages(pool, document_id, TextVersion::Original).await?;
    if accepted_version == TextVersion::Ocr.as_str() {
        let ocr: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT page_index, text FROM document_pages
            WHERE document_id = ? AND version = 'ocr'
            ORDER BY page_index
            "#,
        )
        .bind(document_id)
        .fetch_all(pool)
        .await?;
        for (index, text) in ocr {
            let index = index as usize;
            if index < pages.len()
                && text.chars().count() > pages[index].chars().count() + min_gain_chars
            {
                pages[index] = text;
            }
        }
    }
    Ok(pages)
}
