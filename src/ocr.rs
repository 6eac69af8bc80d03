//! OCR escalation engine.
//!
//! Re-derives text for flagged scope (specific pages or the whole
//! document), re-evaluates quality signals, and adjudicates the outcome.
//! Original extracted text is never discarded: OCR text is stored alongside
//! it and the document records which version is accepted. Attempts append
//! to a per-document ledger with before/after signal snapshots.
//!
//! Documents are processed by a compute-bound worker pool sized
//! independently from the network-bound acquisition pool.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::config::{OcrConfig, QaConfig};
use crate::models::{OcrAttempt, OcrOutcome, OcrScope, QaVerdict, TextVersion};
use crate::progress::Progress;
use crate::qa;
use crate::store::ArtifactStore;

#[derive(Debug)]
pub enum OcrError {
    Io(std::io::Error),
    /// The rasterizer or recognizer exited nonzero.
    Tool { tool: &'static str, detail: String },
}

impl fmt::Display for OcrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrError::Io(e) => write!(f, "ocr io failure: {}", e),
            OcrError::Tool { tool, detail } => write!(f, "{} failed: {}", tool, detail),
        }
    }
}

impl std::error::Error for OcrError {}

impl From<std::io::Error> for OcrError {
    fn from(e: std::io::Error) -> Self {
        OcrError::Io(e)
    }
}

/// Recognizes the text of one rendered page. Behind a trait so the engine
/// can be tested without the system tools installed.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    async fn recognize_page(&self, pdf: &Path, page_index: usize) -> Result<String, OcrError>;
}

/// Shells out to `pdftoppm` and `tesseract`. Falls back to half resolution
/// when the first render fails; very large pages can exhaust the
/// rasterizer at full dpi.
pub struct TesseractBackend {
    dpi: u32,
}

impl TesseractBackend {
    pub fn new(cfg: &OcrConfig) -> Self {
        Self { dpi: cfg.dpi }
    }

    async fn render_and_recognize(
        &self,
        pdf: &Path,
        page_index: usize,
        dpi: u32,
    ) -> Result<String, OcrError> {
        let work_dir = scratch_dir()?;
        let result = self.run_tools(pdf, page_index, dpi, &work_dir).await;
        let _ = std::fs::remove_dir_all(&work_dir);
        result
    }

    async fn run_tools(
        &self,
        pdf: &Path,
        page_index: usize,
        dpi: u32,
        work_dir: &Path,
    ) -> Result<String, OcrError> {
        let page = (page_index + 1).to_string();
        let prefix = work_dir.join("page");

        let render = Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(&page)
            .arg("-l")
            .arg(&page)
            .arg(pdf)
            .arg(&prefix)
            .output()
            .await?;
        if !render.status.success() {
            return Err(OcrError::Tool {
                tool: "pdftoppm",
                detail: String::from_utf8_lossy(&render.stderr).trim().to_string(),
            });
        }

        // pdftoppm pads the page number in the output name; take whatever
        // single png it produced.
        let image = std::fs::read_dir(work_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().and_then(|e| e.to_str()) == Some("png"))
            .ok_or(OcrError::Tool {
                tool: "pdftoppm",
                detail: "no page image produced".to_string(),
            })?;

        let recognize = Command::new("tesseract")
            .arg(&image)
            .arg("stdout")
            .output()
            .await?;
        if !recognize.status.success() {
            return Err(OcrError::Tool {
                tool: "tesseract",
                detail: String::from_utf8_lossy(&recognize.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&recognize.stdout).trim().to_string())
    }
}

fn scratch_dir() -> Result<PathBuf, OcrError> {
    let dir = std::env::temp_dir().join(format!("labelforge-ocr-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[async_trait]
impl OcrBackend for TesseractBackend {
    async fn recognize_page(&self, pdf: &Path, page_index: usize) -> Result<String, OcrError> {
        match self.render_and_recognize(pdf, page_index, self.dpi).await {
            Ok(text) => Ok(text),
            Err(OcrError::Tool { .. }) if self.dpi >= 2 => {
                self.render_and_recognize(pdf, page_index, self.dpi / 2).await
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OcrReport {
    pub improved: usize,
    pub not_necessary: usize,
    pub still_failing: usize,
    pub errored: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OcrCandidate {
    pub id: String,
    pub artifact_key: String,
    pub product_name: String,
    pub registration_number: String,
    pub label_type: Option<String>,
    pub verdict: String,
    pub verdict_detail: Option<String>,
}

/// Process every document currently flagged for OCR. `limit` caps the
/// batch; cancellation skips documents whose worker has not started yet.
pub async fn run(
    pool: &SqlitePool,
    store: &ArtifactStore,
    backend: Arc<dyn OcrBackend>,
    ocr_cfg: &OcrConfig,
    qa_cfg: &QaConfig,
    limit: Option<usize>,
    progress: Arc<dyn Progress>,
    cancel: CancelToken,
) -> Result<OcrReport> {
    let mut candidates: Vec<OcrCandidate> = sqlx::query_as(
        r#"
        SELECT id, artifact_key, product_name, registration_number,
               label_type, verdict, verdict_detail
        FROM documents
        WHERE verdict IN ('page_ocr_needed', 'full_ocr_needed')
          AND flagged_for_deletion = 0
        ORDER BY artifact_key
        "#,
    )
    .fetch_all(pool)
    .await?;
    if let Some(limit) = limit {
        candidates.truncate(limit);
    }

    progress.begin(candidates.len() as u64, "running ocr escalation");

    let semaphore = Arc::new(Semaphore::new(ocr_cfg.workers));
    let mut tasks = JoinSet::new();
    let mut task_keys: HashMap<tokio::task::Id, String> = HashMap::new();
    for candidate in candidates {
        let pool = pool.clone();
        let store = store.clone();
        let backend = Arc::clone(&backend);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let ocr_cfg = ocr_cfg.clone();
        let qa_cfg = qa_cfg.clone();
        let key = candidate.artifact_key.clone();
        let handle = tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            if cancel.is_cancelled() {
                return Ok(None);
            }
            process_document(&pool, &store, backend.as_ref(), &candidate, &ocr_cfg, &qa_cfg)
                .await
                .map(Some)
        });
        task_keys.insert(handle.id(), key);
    }

    let mut report = OcrReport::default();
    while let Some(joined) = tasks.join_next_with_id().await {
        // A crashed worker costs only its own document; the rest of the
        // pool keeps running.
        let (key, result) = match joined {
            Ok((id, result)) => (task_keys.remove(&id).unwrap_or_default(), result),
            Err(join_error) => {
                let key = task_keys.remove(&join_error.id()).unwrap_or_default();
                (key, Err(anyhow::anyhow!("ocr worker crashed: {}", join_error)))
            }
        };
        let word = match &result {
            Ok(Some(OcrOutcome::Improved)) => {
                report.improved += 1;
                "improved"
            }
            Ok(Some(OcrOutcome::NotNecessary)) => {
                report.not_necessary += 1;
                "not necessary"
            }
            Ok(Some(OcrOutcome::StillFailing)) => {
                report.still_failing += 1;
                "still failing"
            }
            Ok(None) => {
                report.cancelled += 1;
                "cancelled"
            }
            Err(_) => {
                report.errored += 1;
                "errored"
            }
        };
        progress.item(&format!("{} {}", key, word));
    }

    progress.finish(&format!(
        "{} improved, {} not necessary, {} still failing, {} errored",
        report.improved, report.not_necessary, report.still_failing, report.errored
    ));
    Ok(report)
}

/// Escalate one document. Returns the adjudicated outcome; the verdict and
/// attempt ledger are updated as side effects.
pub async fn process_document(
    pool: &SqlitePool,
    store: &ArtifactStore,
    backend: &dyn OcrBackend,
    candidate: &OcrCandidate,
    ocr_cfg: &OcrConfig,
    qa_cfg: &QaConfig,
) -> Result<OcrOutcome> {
    let original = qa::load_pages(pool, &candidate.id, TextVersion::Original).await?;
    let before = qa::compute_signals(
        &original,
        &candidate.product_name,
        &candidate.registration_number,
    );
    let is_primary = qa::is_primary_label_type(candidate.label_type.as_deref());

    // Re-check before spending OCR time; a flag can be stale after a
    // threshold change.
    if qa::classify(&before, is_primary, qa_cfg) == QaVerdict::Pass {
        qa::store_verdict(pool, &candidate.id, &before, &QaVerdict::Pass).await?;
        record_attempt(
            pool,
            &OcrAttempt {
                document_id: candidate.id.clone(),
                scope: scope_for(candidate)?,
                before,
                after: None,
                outcome: OcrOutcome::NotNecessary,
            },
        )
        .await?;
        return Ok(OcrOutcome::NotNecessary);
    }

    let scope = scope_for(candidate)?;
    let page_indexes: Vec<usize> = match &scope {
        OcrScope::Pages(pages) => pages.clone(),
        OcrScope::Full => (0..original.len()).collect(),
    };

    let pdf = store.pdf_path(&candidate.artifact_key);
    let mut merged = original.clone();
    let mut ocr_pages: Vec<(usize, String)> = Vec::new();
    for &index in &page_indexes {
        let text = backend
            .recognize_page(&pdf, index)
            .await
            .with_context(|| format!("ocr failed for {} page {}", candidate.artifact_key, index))?;
        // Adopt OCR text only when it recovers materially more characters
        // than the original extraction.
        let original_len = merged.get(index).map(|p| p.chars().count()).unwrap_or(0);
        if text.chars().count() > original_len + ocr_cfg.min_gain_chars {
            if index < merged.len() {
                merged[index] = text.clone();
            }
        }
        ocr_pages.push((index, text));
    }

    // OCR text is stored for every attempted page whether or not it was
    // adopted; originals stay untouched under their own version.
    for (index, text) in &ocr_pages {
        store_ocr_page(pool, &candidate.id, *index, text).await?;
    }

    let after = qa::compute_signals(
        &merged,
        &candidate.product_name,
        &candidate.registration_number,
    );
    let verdict = qa::classify(&after, is_primary, qa_cfg);
    let outcome = if verdict == QaVerdict::Pass {
        sqlx::query("UPDATE documents SET accepted_version = ? WHERE id = ?")
            .bind(TextVersion::Ocr.as_str())
            .bind(&candidate.id)
            .execute(pool)
            .await?;
        qa::store_verdict(pool, &candidate.id, &after, &QaVerdict::Pass).await?;
        OcrOutcome::Improved
    } else {
        qa::store_verdict(pool, &candidate.id, &after, &QaVerdict::ManualReviewNeeded).await?;
        OcrOutcome::StillFailing
    };

    record_attempt(
        pool,
        &OcrAttempt {
            document_id: candidate.id.clone(),
            scope,
            before,
            after: Some(after),
            outcome,
        },
    )
    .await?;

    Ok(outcome)
}

fn scope_for(candidate: &OcrCandidate) -> Result<OcrScope> {
    if candidate.verdict == "page_ocr_needed" {
        let detail = candidate
            .verdict_detail
            .as_deref()
            .context("page-scoped verdict without page list")?;
        let pages: Vec<usize> = serde_json::from_str(detail)
            .with_context(|| format!("bad page list for {}", candidate.id))?;
        Ok(OcrScope::Pages(pages))
    } else {
        Ok(OcrScope::Full)
    }
}

async fn store_ocr_page(
    pool: &SqlitePool,
    document_id: &str,
    page_index: usize,
    text: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO document_pages
            (document_id, page_index, version, text, char_count)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(document_id)
    .bind(page_index as i64)
    .bind(TextVersion::Ocr.as_str())
    .bind(text)
    .bind(text.chars().count() as i64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_attempt(pool: &SqlitePool, attempt: &OcrAttempt) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ocr_attempts
            (id, document_id, scope, before_signals, after_signals, outcome, attempted_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&attempt.document_id)
    .bind(serde_json::to_string(&attempt.scope)?)
    .bind(serde_json::to_string(&attempt.before)?)
    .bind(match &attempt.after {
        Some(after) => Some(serde_json::to_string(after)?),
        None => None,
    })
    .bind(attempt.outcome.as_str())
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}
