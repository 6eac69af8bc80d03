//! Text-quality signal computation and the QA decision policy.
//!
//! Signals per document: total character count, ordered per-page counts,
//! a fuzzy identity check (product-name first token / registration number
//! present at edit distance ≤ 1), and for primary labels a fuzzy check for
//! the mandated safety phrase. The decision policy is evaluated in order,
//! first match wins; per-page granularity keeps one bad page from
//! escalating a large mostly-good document.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::QaConfig;
use crate::extract;
use crate::models::{QaEvidence, QaSignals, QaVerdict, TextVersion};
use crate::progress::Progress;
use crate::store::ArtifactStore;

/// Safety phrase mandated on every primary label.
pub const SAFETY_PHRASE: &str = "keep out of reach of children";

/// Lowercase and strip everything that is not a letter or digit. Extracted
/// and OCR'd text frequently drops or inserts spaces and hyphens, so all
/// fuzzy matching runs over this normalized form.
pub fn normalize_for_match(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Fuzzy substring search: does `haystack` contain a window within
/// Damerau-Levenshtein distance `max_dist` of `needle`? Both inputs must
/// already be normalized. An exact hit short-circuits the window scan.
pub fn fuzzy_contains(haystack: &str, needle: &str, max_dist: usize) -> bool {
    if needle.is_empty() {
        return false;
    }
    if haystack.contains(needle) {
        return true;
    }
    if max_dist == 0 {
        return false;
    }

    let hay: Vec<char> = haystack.chars().collect();
    let n = needle.chars().count();
    if hay.len() + max_dist < n {
        return false;
    }

    let min_w = n.saturating_sub(max_dist).max(1);
    let max_w = (n + max_dist).min(hay.len());
    for width in min_w..=max_w {
        for start in 0..=(hay.len() - width) {
            let window: String = hay[start..start + width].iter().collect();
            if strsim::damerau_levenshtein(&window, needle) <= max_dist {
                return true;
            }
        }
    }
    false
}

/// First whitespace-separated token of the product name, normalized.
/// Matches how artifact keys are prefixed, so the check also verifies the
/// right document was fetched.
pub fn product_name_token(product_name: &str) -> String {
    normalize_for_match(product_name.split_whitespace().next().unwrap_or(""))
}

/// Compute the full signal set for one set of page texts.
pub fn compute_signals(
    pages: &[String],
    product_name: &str,
    registration_number: &str,
) -> QaSignals {
    let page_chars: Vec<usize> = pages.iter().map(|p| p.chars().count()).collect();
    let total_chars = page_chars.iter().sum();

    let text_norm = normalize_for_match(&pages.concat());
    let name_token = product_name_token(product_name);
    let reg_norm = normalize_for_match(registration_number);

    QaSignals {
        total_chars,
        page_chars,
        name_match: fuzzy_contains(&text_norm, &name_token, 1),
        reg_no_match: fuzzy_contains(&text_norm, &reg_norm, 1),
        safety_phrase_match: fuzzy_contains(&text_norm, &normalize_for_match(SAFETY_PHRASE), 1),
    }
}

/// Apply the decision policy to a signal set. Evaluated in order, first
/// match wins.
pub fn classify(signals: &QaSignals, is_primary: bool, cfg: &QaConfig) -> QaVerdict {
    // 1. No text at all: corrupted or fully scanned.
    if signals.total_chars == 0 {
        return QaVerdict::FullOcrNeeded {
            evidence: QaEvidence::EmptyText,
        };
    }

    // 2. Overlay-only scan. Legitimate baseline for non-primary label
    // types, flagged for primaries.
    if signals.total_chars < cfg.min_total_chars {
        if is_primary {
            return QaVerdict::FullOcrNeeded {
                evidence: QaEvidence::OverlayOnlyPrimary,
            };
        }
        return QaVerdict::Pass;
    }

    // 3. Individual short pages: escalate only the offending pages.
    let short_pages: Vec<usize> = signals
        .page_chars
        .iter()
        .enumerate()
        .filter(|(_, &len)| len < cfg.min_page_chars)
        .map(|(i, _)| i)
        .collect();
    if !short_pages.is_empty() {
        return QaVerdict::PageOcrNeeded { pages: short_pages };
    }

    // 4. Identity: either cue is sufficient; neither means the text
    // cannot be trusted at all.
    if !signals.name_match && !signals.reg_no_match {
        return QaVerdict::FullOcrNeeded {
            evidence: QaEvidence::IdentityMismatch,
        };
    }

    // 5. Primary labels must carry the safety phrase.
    if is_primary && !signals.safety_phrase_match {
        return QaVerdict::FullOcrNeeded {
            evidence: QaEvidence::MissingSafetyPhrase,
        };
    }

    QaVerdict::Pass
}

/// Whether a document row describes a primary label. Unknown label types
/// are treated as primary so the stricter checks apply.
pub fn is_primary_label_type(label_type: Option<&str>) -> bool {
    match label_type {
        Some(t) => t.to_ascii_uppercase().contains("PRIMARY"),
        None => true,
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QaReport {
    pub passed: usize,
    pub page_ocr: usize,
    pub full_ocr: usize,
    pub extract_failed: usize,
}

/// Extract and classify every document that has no verdict yet. Extraction
/// failures get an EmptyText full-OCR verdict rather than aborting the run.
pub async fn run(
    pool: &SqlitePool,
    store: &ArtifactStore,
    cfg: &QaConfig,
    limit: Option<usize>,
    progress: Arc<dyn Progress>,
) -> Result<QaReport> {
    let mut rows: Vec<(String, String, String, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT id, artifact_key, product_name, registration_number, label_type
        FROM documents
        WHERE verdict IS NULL AND flagged_for_deletion = 0
        ORDER BY artifact_key
        "#,
    )
    .fetch_all(pool)
    .await?;
    if let Some(limit) = limit {
        rows.truncate(limit);
    }

    progress.begin(rows.len() as u64, "classifying extracted text");
    let mut report = QaReport::default();

    for (id, artifact_key, product_name, registration_number, label_type) in rows {
        let pdf = store.pdf_path(&artifact_key);
        let pages = match extract::extract_pages(&pdf) {
            Ok(pages) => pages,
            Err(_) => {
                report.extract_failed += 1;
                vec![String::new()]
            }
        };

        store_pages(pool, &id, &pages, TextVersion::Original).await?;

        let signals = compute_signals(&pages, &product_name, &registration_number);
        let is_primary = is_primary_label_type(label_type.as_deref());
        let verdict = classify(&signals, is_primary, cfg);
        match &verdict {
            QaVerdict::Pass => report.passed += 1,
            QaVerdict::PageOcrNeeded { .. } => report.page_ocr += 1,
            QaVerdict::FullOcrNeeded { .. } => report.full_ocr += 1,
            QaVerdict::ManualReviewNeeded => {}
        }
        store_verdict(pool, &id, &signals, &verdict).await?;
        progress.advance(1);
    }

    progress.finish(&format!(
        "{} passed, {} page-ocr, {} full-ocr, {} unreadable",
        report.passed, report.page_ocr, report.full_ocr, report.extract_failed
    ));
    Ok(report)
}

pub async fn store_pages(
    pool: &SqlitePool,
    document_id: &str,
    pages: &[String],
    version: TextVersion,
) -> Result<()> {
    for (index, text) in pages.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO document_pages
                (document_id, page_index, version, text, char_count)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(document_id)
        .bind(index as i64)
        .bind(version.as_str())
        .bind(text)
        .bind(text.chars().count() as i64)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn load_pages(
    pool: &SqlitePool,
    document_id: &str,
    version: TextVersion,
) -> Result<Vec<String>> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        r#"
        SELECT page_index, text FROM document_pages
        WHERE document_id = ? AND version = ?
        ORDER BY page_index
        "#,
    )
    .bind(document_id)
    .bind(version.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(_, t)| t).collect())
}

pub async fn store_verdict(
    pool: &SqlitePool,
    document_id: &str,
    signals: &QaSignals,
    verdict: &QaVerdict,
) -> Result<()> {
    let detail = match verdict {
        QaVerdict::PageOcrNeeded { pages } => Some(serde_json::to_string(pages)?),
        QaVerdict::FullOcrNeeded { evidence } => Some(evidence.as_str().to_string()),
        QaVerdict::Pass | QaVerdict::ManualReviewNeeded => None,
    };
    sqlx::query(
        r#"
        UPDATE documents SET
            total_chars = ?, page_chars = ?,
            name_match = ?, reg_no_match = ?, safety_phrase_match = ?,
            verdict = ?, verdict_detail = ?
        WHERE id = ?
        "#,
    )
    .bind(signals.total_chars as i64)
    .bind(serde_json::to_string(&signals.page_chars)?)
    .bind(signals.name_match)
    .bind(signals.reg_no_match)
    .bind(signals.safety_phrase_match)
    .bind(verdict.as_str())
    .bind(detail)
    .bind(document_id)
    .execute(pool)
    .await
    .context("Failed to store verdict")?;
    Ok(())
}
