//! Library-level pipeline tests: scheduler concurrency, OCR escalation
//! adjudication, the review/purge/re-queue loop, and the two-phase name
//! canonicalization engine, all against a real sqlite database and mock
//! remote capabilities.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use labelforge::acquire;
use labelforge::cancel::CancelToken;
use labelforge::canonical;
use labelforge::catalog::{Catalog, CatalogError, CatalogSession, DocumentDetail, SearchHit};
use labelforge::config::{AcquisitionConfig, Config, OcrConfig, QaConfig};
use labelforge::models::{OcrOutcome, WorkItem};
use labelforge::ocr::{self, OcrBackend, OcrCandidate, OcrError};
use labelforge::oracle::{
    ClassifySuggestion, DisabledOracle, NameOracle, OracleError, RefineInput, RefineSuggestion,
};
use labelforge::progress::{NoProgress, Progress};
use labelforge::qa;
use labelforge::reconcile;
use labelforge::review;
use labelforge::store::ArtifactStore;
use labelforge::{db, migrate};

async fn test_pool(root: &Path) -> (Config, SqlitePool) {
    let cfg = Config::minimal(root.to_path_buf());
    migrate::run_migrations(&cfg).await.unwrap();
    let pool = db::connect(&cfg).await.unwrap();
    (cfg, pool)
}

// ---------------------------------------------------------------------------
// Acquisition scheduler

/// Counts concurrently open sessions and remembers the high-water mark.
struct CountingCatalog {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct CountingSession {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Catalog for CountingCatalog {
    async fn open_session(&self, _headless: bool) -> Result<Box<dyn CatalogSession>, CatalogError> {
        Ok(Box::new(CountingSession {
            current: Arc::clone(&self.current),
            peak: Arc::clone(&self.peak),
        }))
    }
}

#[async_trait]
impl CatalogSession for CountingSession {
    async fn search(&mut self, product_name: &str) -> Result<Vec<SearchHit>, CatalogError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(vec![SearchHit {
            document_number: format!("doc-{}", product_name),
        }])
    }

    async fn open_detail(&mut self, hit: &SearchHit) -> Result<DocumentDetail, CatalogError> {
        Ok(DocumentDetail {
            document_number: hit.document_number.clone(),
            label_type: Some("PRIMARY LABEL".to_string()),
        })
    }

    async fn download(&mut self, detail: &DocumentDetail) -> Result<Vec<u8>, CatalogError> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("%PDF {}", detail.document_number).into_bytes())
    }
}

fn work_items(n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| WorkItem {
            product_no: format!("100-{}-1", i),
            registration_number: format!("100-{}", i),
            product_name: format!("Product {}", i),
        })
        .collect()
}

#[tokio::test]
async fn scheduler_respects_session_bound() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = test_pool(tmp.path()).await;
    let store = ArtifactStore::new(&cfg.store.root);

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let catalog = Arc::new(CountingCatalog {
        current: Arc::clone(&current),
        peak: Arc::clone(&peak),
    });

    let acq = AcquisitionConfig {
        max_sessions: 3,
        session_start_delay_ms: 0,
        step_delay_ms: 0,
        headless: true,
        max_retries: 0,
    };

    let report = acquire::run(
        catalog,
        store.clone(),
        pool.clone(),
        work_items(12),
        &acq,
        Arc::new(NoProgress),
        CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.succeeded, 12);
    assert_eq!(report.failed, 0);
    assert!(peak.load(Ordering::SeqCst) <= 3, "peak was {}", peak.load(Ordering::SeqCst));

    // Every item is now in the store and the ledger.
    let inventory = store.inventory().unwrap();
    assert_eq!(inventory.len(), 12);
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 12);
}

/// Always fails with a non-retryable error; the run must still complete.
struct FailingCatalog;

struct FailingSession;

#[async_trait]
impl Catalog for FailingCatalog {
    async fn open_session(&self, _headless: bool) -> Result<Box<dyn CatalogSession>, CatalogError> {
        Ok(Box::new(FailingSession))
    }
}

#[async_trait]
impl CatalogSession for FailingSession {
    async fn search(&mut self, _product_name: &str) -> Result<Vec<SearchHit>, CatalogError> {
        // No candidates; the scheduler reports the item as not found.
        Ok(Vec::new())
    }

    async fn open_detail(&mut self, _hit: &SearchHit) -> Result<DocumentDetail, CatalogError> {
        unreachable!("no search hit to open")
    }

    async fn download(&mut self, _detail: &DocumentDetail) -> Result<Vec<u8>, CatalogError> {
        unreachable!("no detail to download")
    }
}

#[tokio::test]
async fn per_item_failures_do_not_abort_the_run() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = test_pool(tmp.path()).await;
    let store = ArtifactStore::new(&cfg.store.root);

    let acq = AcquisitionConfig {
        max_sessions: 2,
        session_start_delay_ms: 0,
        step_delay_ms: 0,
        headless: true,
        max_retries: 2,
    };

    let report = acquire::run(
        Arc::new(FailingCatalog),
        store,
        pool,
        work_items(4),
        &acq,
        Arc::new(NoProgress),
        CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.failed, 4);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.outcomes.len(), 4);
}

/// Captures per-item progress events so tests can check attribution.
#[derive(Default)]
struct RecordingProgress {
    items: std::sync::Mutex<Vec<String>>,
}

impl Progress for RecordingProgress {
    fn begin(&self, _total: u64, _label: &str) {}
    fn advance(&self, _n: u64) {}
    fn item(&self, detail: &str) {
        self.items.lock().unwrap().push(detail.to_string());
    }
    fn finish(&self, _summary: &str) {}
}

#[tokio::test]
async fn every_item_gets_an_attributable_progress_event() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = test_pool(tmp.path()).await;
    let store = ArtifactStore::new(&cfg.store.root);

    let catalog = Arc::new(CountingCatalog {
        current: Arc::new(AtomicUsize::new(0)),
        peak: Arc::new(AtomicUsize::new(0)),
    });

    let acq = AcquisitionConfig {
        max_sessions: 2,
        session_start_delay_ms: 0,
        step_delay_ms: 0,
        headless: true,
        max_retries: 0,
    };

    let recorder = Arc::new(RecordingProgress::default());
    acquire::run(
        catalog,
        store,
        pool,
        work_items(4),
        &acq,
        recorder.clone(),
        CancelToken::new(),
    )
    .await
    .unwrap();

    let items = recorder.items.lock().unwrap();
    assert_eq!(items.len(), 4);
    for i in 0..4 {
        let product_no = format!("100-{}-1", i);
        assert!(
            items.iter().any(|l| l.contains(&product_no) && l.contains("succeeded")),
            "no progress event for {}: {:?}",
            product_no,
            *items
        );
    }
}

/// Panics inside the session for exactly one product.
struct CrashingCatalog;

struct CrashingSession;

#[async_trait]
impl Catalog for CrashingCatalog {
    async fn open_session(&self, _headless: bool) -> Result<Box<dyn CatalogSession>, CatalogError> {
        Ok(Box::new(CrashingSession))
    }
}

#[async_trait]
impl CatalogSession for CrashingSession {
    async fn search(&mut self, product_name: &str) -> Result<Vec<SearchHit>, CatalogError> {
        if product_name == "Product 2" {
            panic!("simulated session crash");
        }
        Ok(vec![SearchHit {
            document_number: format!("doc-{}", product_name),
        }])
    }

    async fn open_detail(&mut self, hit: &SearchHit) -> Result<DocumentDetail, CatalogError> {
        Ok(DocumentDetail {
            document_number: hit.document_number.clone(),
            label_type: Some("PRIMARY LABEL".to_string()),
        })
    }

    async fn download(&mut self, detail: &DocumentDetail) -> Result<Vec<u8>, CatalogError> {
        Ok(format!("%PDF {}", detail.document_number).into_bytes())
    }
}

#[tokio::test]
async fn crashed_session_costs_only_its_own_item() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = test_pool(tmp.path()).await;
    let store = ArtifactStore::new(&cfg.store.root);

    let acq = AcquisitionConfig {
        max_sessions: 1,
        session_start_delay_ms: 0,
        step_delay_ms: 0,
        headless: true,
        max_retries: 0,
    };

    let report = acquire::run(
        Arc::new(CrashingCatalog),
        store.clone(),
        pool,
        work_items(4),
        &acq,
        Arc::new(NoProgress),
        CancelToken::new(),
    )
    .await
    .expect("a single crashed session must not abort the run");

    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 1);
    let (product_no, outcome) = report
        .outcomes
        .iter()
        .find(|(_, o)| matches!(o, acquire::ItemOutcome::Failed(_)))
        .unwrap();
    assert_eq!(product_no, "100-2-1");
    if let acquire::ItemOutcome::Failed(reason) = outcome {
        assert!(reason.contains("crashed"), "reason was: {}", reason);
    }
    assert_eq!(store.inventory().unwrap().len(), 3);
}

#[tokio::test]
async fn cancellation_skips_queued_items() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = test_pool(tmp.path()).await;
    let store = ArtifactStore::new(&cfg.store.root);

    let catalog = Arc::new(CountingCatalog {
        current: Arc::new(AtomicUsize::new(0)),
        peak: Arc::new(AtomicUsize::new(0)),
    });

    let acq = AcquisitionConfig {
        max_sessions: 1,
        session_start_delay_ms: 0,
        step_delay_ms: 0,
        headless: true,
        max_retries: 0,
    };

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = acquire::run(
        catalog,
        store,
        pool,
        work_items(5),
        &acq,
        Arc::new(NoProgress),
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(report.cancelled, 5);
    assert_eq!(report.succeeded + report.failed, 0);
}

// ---------------------------------------------------------------------------
// OCR escalation

/// Per-page canned OCR results.
struct ScriptedBackend {
    pages: Vec<(usize, String)>,
}

#[async_trait]
impl OcrBackend for ScriptedBackend {
    async fn recognize_page(&self, _pdf: &Path, page_index: usize) -> Result<String, OcrError> {
        Ok(self
            .pages
            .iter()
            .find(|(i, _)| *i == page_index)
            .map(|(_, t)| t.clone())
            .unwrap_or_default())
    }
}

fn long_page(seed: &str, len: usize) -> String {
    let mut s = format!("{} directions for use ", seed);
    while s.chars().count() < len {
        s.push_str("apply as directed to the listed crops ");
    }
    s
}

async fn insert_document(pool: &SqlitePool, id: &str, key: &str, verdict: &str, detail: Option<&str>) {
    sqlx::query(
        r#"
        INSERT INTO documents
            (id, artifact_key, product_no, registration_number, product_name,
             label_type, verdict, verdict_detail, acquired_at)
        VALUES (?, ?, '100-1347-1671', '100-1347', 'Concert II', 'PRIMARY LABEL', ?, ?, 0)
        "#,
    )
    .bind(id)
    .bind(key)
    .bind(verdict)
    .bind(detail)
    .execute(pool)
    .await
    .unwrap();
}

fn candidate(id: &str, key: &str, verdict: &str, detail: Option<&str>) -> OcrCandidate {
    OcrCandidate {
        id: id.to_string(),
        artifact_key: key.to_string(),
        product_name: "Concert II".to_string(),
        registration_number: "100-1347".to_string(),
        label_type: Some("PRIMARY LABEL".to_string()),
        verdict: verdict.to_string(),
        verdict_detail: detail.map(|d| d.to_string()),
    }
}

/// Ten original pages: page 0 carries the identity cues and safety phrase,
/// pages 3 and 7 are short.
fn flagged_pages() -> Vec<String> {
    (0..10)
        .map(|i| match i {
            0 => long_page("Concert II EPA Reg No 100-1347 keep out of reach of children", 600),
            3 | 7 => "faint scan".to_string(),
            _ => long_page("crop table", 500),
        })
        .collect()
}

#[tokio::test]
async fn partial_page_recovery_is_still_failing() {
    let tmp = TempDir::new().unwrap();
    let (_cfg, pool) = test_pool(tmp.path()).await;
    let store = ArtifactStore::new(tmp.path().join("labels"));

    insert_document(&pool, "doc-1", "key-1", "page_ocr_needed", Some("[3,7]")).await;
    let original = flagged_pages();
    qa::store_pages(&pool, "doc-1", &original, labelforge::models::TextVersion::Original)
        .await
        .unwrap();

    // Page 3 recovers, page 7 stays unreadable.
    let backend = ScriptedBackend {
        pages: vec![
            (3, long_page("recovered application rates", 500)),
            (7, "still faint".to_string()),
        ],
    };

    let outcome = ocr::process_document(
        &pool,
        &store,
        &backend,
        &candidate("doc-1", "key-1", "page_ocr_needed", Some("[3,7]")),
        &OcrConfig::default(),
        &QaConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(outcome, OcrOutcome::StillFailing);

    let (verdict,): (String,) = sqlx::query_as("SELECT verdict FROM documents WHERE id = 'doc-1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(verdict, "manual_review_needed");

    // Originals retained unmodified; OCR rows stored for both pages.
    let stored = qa::load_pages(&pool, "doc-1", labelforge::models::TextVersion::Original)
        .await
        .unwrap();
    assert_eq!(stored, original);
    let ocr_rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT page_index FROM document_pages WHERE document_id = 'doc-1' AND version = 'ocr' ORDER BY page_index",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(ocr_rows, vec![(3,), (7,)]);

    // The invariant behind the review queue: a manual-review document has
    // a still_failing attempt on its ledger.
    let (attempts,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM ocr_attempts WHERE document_id = 'doc-1' AND outcome = 'still_failing'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn full_page_recovery_is_improved() {
    let tmp = TempDir::new().unwrap();
    let (_cfg, pool) = test_pool(tmp.path()).await;
    let store = ArtifactStore::new(tmp.path().join("labels"));

    insert_document(&pool, "doc-2", "key-2", "page_ocr_needed", Some("[3,7]")).await;
    qa::store_pages(&pool, "doc-2", &flagged_pages(), labelforge::models::TextVersion::Original)
        .await
        .unwrap();

    let backend = ScriptedBackend {
        pages: vec![
            (3, long_page("recovered rates", 500)),
            (7, long_page("recovered precautions", 500)),
        ],
    };

    let outcome = ocr::process_document(
        &pool,
        &store,
        &backend,
        &candidate("doc-2", "key-2", "page_ocr_needed", Some("[3,7]")),
        &OcrConfig::default(),
        &QaConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(outcome, OcrOutcome::Improved);

    let (verdict, accepted): (String, String) =
        sqlx::query_as("SELECT verdict, accepted_version FROM documents WHERE id = 'doc-2'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(verdict, "pass");
    assert_eq!(accepted, "ocr");
}

#[tokio::test]
async fn ocr_run_cancellation_leaves_verdicts_untouched() {
    let tmp = TempDir::new().unwrap();
    let (_cfg, pool) = test_pool(tmp.path()).await;
    let store = ArtifactStore::new(tmp.path().join("labels"));

    insert_document(&pool, "doc-3", "key-3", "page_ocr_needed", Some("[3,7]")).await;
    qa::store_pages(&pool, "doc-3", &flagged_pages(), labelforge::models::TextVersion::Original)
        .await
        .unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let backend = Arc::new(ScriptedBackend { pages: vec![] });
    let report = ocr::run(
        &pool,
        &store,
        backend,
        &OcrConfig::default(),
        &QaConfig::default(),
        None,
        Arc::new(NoProgress),
        cancel,
    )
    .await
    .unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.improved + report.not_necessary + report.still_failing, 0);

    let (verdict,): (String,) = sqlx::query_as("SELECT verdict FROM documents WHERE id = 'doc-3'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(verdict, "page_ocr_needed");
}

/// Panics for one document, recognizes cleanly for the others.
struct CrashOnKeyBackend {
    crash_key: &'static str,
}

#[async_trait]
impl OcrBackend for CrashOnKeyBackend {
    async fn recognize_page(&self, pdf: &Path, _page_index: usize) -> Result<String, OcrError> {
        if pdf.to_string_lossy().contains(self.crash_key) {
            panic!("simulated recognizer crash");
        }
        Ok(long_page("recovered text", 500))
    }
}

#[tokio::test]
async fn crashed_ocr_worker_costs_only_its_own_document() {
    let tmp = TempDir::new().unwrap();
    let (_cfg, pool) = test_pool(tmp.path()).await;
    let store = ArtifactStore::new(tmp.path().join("labels"));

    insert_document(&pool, "doc-4", "key-4", "page_ocr_needed", Some("[3,7]")).await;
    insert_document(&pool, "doc-5", "key-5", "page_ocr_needed", Some("[3,7]")).await;
    for id in ["doc-4", "doc-5"] {
        qa::store_pages(&pool, id, &flagged_pages(), labelforge::models::TextVersion::Original)
            .await
            .unwrap();
    }

    let backend = Arc::new(CrashOnKeyBackend { crash_key: "key-5" });
    let report = ocr::run(
        &pool,
        &store,
        backend,
        &OcrConfig::default(),
        &QaConfig::default(),
        None,
        Arc::new(NoProgress),
        CancelToken::new(),
    )
    .await
    .expect("a single crashed worker must not abort the run");

    assert_eq!(report.improved, 1);
    assert_eq!(report.errored, 1);

    // The crashed document keeps its flag for a later run; the healthy
    // one passed.
    let (verdict,): (String,) = sqlx::query_as("SELECT verdict FROM documents WHERE id = 'doc-5'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(verdict, "page_ocr_needed");
    let (verdict,): (String,) = sqlx::query_as("SELECT verdict FROM documents WHERE id = 'doc-4'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(verdict, "pass");
}

// ---------------------------------------------------------------------------
// Review and re-queue

#[tokio::test]
async fn purge_requeues_the_product() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = test_pool(tmp.path()).await;
    let store = ArtifactStore::new(&cfg.store.root);

    let key = ArtifactStore::artifact_key("100-1347", "Concert II", "doc-9");
    store
        .write_document(
            &key,
            b"%PDF fake",
            labelforge::store::ArtifactMeta {
                product_no: "100-1347-1671".to_string(),
                registration_number: "100-1347".to_string(),
                product_name: "Concert II".to_string(),
                label_type: Some("PRIMARY LABEL".to_string()),
                sha256: String::new(),
                acquired_at: chrono::Utc::now(),
            },
        )
        .unwrap();
    insert_document(&pool, "doc-9", &key, "manual_review_needed", None).await;

    let entries = review::list(&pool).await.unwrap();
    assert_eq!(entries.len(), 1);

    let report = review::purge_all(&pool, &store).await.unwrap();
    assert_eq!(report.purged, 1);
    assert!(store.inventory().unwrap().is_empty());
    assert!(review::list(&pool).await.unwrap().is_empty());

    // The reconciler now treats the product as missing again.
    let snapshot = labelforge::models::RegistrySnapshot {
        version: "v1".to_string(),
        products: vec![labelforge::models::ProductRecord {
            product_no: "100-1347-1671".to_string(),
            registration_number: "100-1347".to_string(),
            product_name: "Concert II".to_string(),
            product_id: None,
            registration_status: Some("REGISTERED".to_string()),
            auth_type: Some("primary label".to_string()),
            product_types: vec!["FUNGICIDE".to_string()],
            use_types: vec!["AGRICULTURAL".to_string()],
            toxicities: vec![],
            formulation: None,
        }],
    };
    sqlx::query("INSERT INTO snapshots (version, ingested_at, product_count) VALUES ('v1', 0, 1)")
        .execute(&pool)
        .await
        .unwrap();
    let (queue, _) = reconcile::build_work_queue(&pool, &snapshot, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].product_no, "100-1347-1671");
}

// ---------------------------------------------------------------------------
// Name canonicalization

struct ScriptedOracle;

#[async_trait]
impl NameOracle for ScriptedOracle {
    async fn classify(&self, names: &[String]) -> Result<Vec<ClassifySuggestion>, OracleError> {
        // Answers for everything except names mentioning "mystery", which
        // the engine must default to Other.
        Ok(names
            .iter()
            .filter(|n| !n.contains("MYSTERY"))
            .map(|n| ClassifySuggestion {
                raw_name: n.clone(),
                category: if n.contains("SCAB") {
                    "Other".to_string()
                } else if n.contains("GRASS") {
                    "Weeds".to_string()
                } else {
                    "Insects".to_string()
                },
            })
            .collect())
    }

    async fn refine(
        &self,
        _crop: &str,
        category: &str,
        group: &[RefineInput],
    ) -> Result<Vec<RefineSuggestion>, OracleError> {
        // Reclassifies scab names out of Other into Disease with a shared
        // canonical name; leaves everything else in place.
        Ok(group
            .iter()
            .map(|row| {
                if row.raw_name.contains("SCAB") {
                    RefineSuggestion {
                        raw_name: row.raw_name.clone(),
                        category: "Disease".to_string(),
                        canonical_name: "Apple Scab".to_string(),
                        scientific_name: Some("Venturia inaequalis".to_string()),
                    }
                } else {
                    RefineSuggestion {
                        raw_name: row.raw_name.clone(),
                        category: category.to_string(),
                        canonical_name: row.raw_name.clone(),
                        scientific_name: None,
                    }
                }
            })
            .collect())
    }
}

async fn insert_name(pool: &SqlitePool, raw_name: &str, crop: &str) {
    sqlx::query("INSERT INTO name_records (raw_name, crop, updated_at) VALUES (?, ?, 0)")
        .bind(raw_name)
        .bind(crop)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn classify_then_refine_reclassifies_other() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = test_pool(tmp.path()).await;

    insert_name(&pool, "APPLE SCAB (VENTURIA INAEQUALIS)", "Apple").await;
    insert_name(&pool, "SCAB OF APPLE", "Apple").await;
    insert_name(&pool, "CRABGRASS", "Apple").await;
    insert_name(&pool, "MYSTERY PEST", "Apple").await;

    let oracle = ScriptedOracle;
    let classify_report =
        canonical::classify(&pool, &oracle, &cfg.oracle, Arc::new(NoProgress))
            .await
            .unwrap();
    assert_eq!(classify_report.classified, 4);
    assert_eq!(classify_report.defaulted_other, 1);

    let mystery = canonical::get_record(&pool, "MYSTERY PEST").await.unwrap().unwrap();
    assert_eq!(mystery.category.as_deref(), Some("Other"));

    let refine_report =
        canonical::refine(&pool, &oracle, &cfg.oracle, false, Arc::new(NoProgress))
            .await
            .unwrap();
    assert!(refine_report.updated >= 2);

    let scab = canonical::get_record(&pool, "SCAB OF APPLE").await.unwrap().unwrap();
    assert_eq!(scab.category.as_deref(), Some("Disease"));
    assert_eq!(scab.canonical_name.as_deref(), Some("Apple Scab"));
    assert_eq!(scab.scientific_name.as_deref(), Some("Venturia inaequalis"));
}

#[tokio::test]
async fn locked_records_survive_repeated_refine() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = test_pool(tmp.path()).await;

    insert_name(&pool, "APPLE SCAB", "Apple").await;
    insert_name(&pool, "SCAB OF APPLE", "Apple").await;
    sqlx::query(
        r#"
        UPDATE name_records
        SET category = 'Disease', canonical_name = 'Scab (manual)',
            scientific_name = 'Venturia sp.', locked = 1
        WHERE raw_name = 'APPLE SCAB'
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("UPDATE name_records SET category = 'Disease' WHERE raw_name = 'SCAB OF APPLE'")
        .execute(&pool)
        .await
        .unwrap();

    // Overwrite mode would rewrite unlocked rows; the lock must hold even
    // then, and across repeated runs.
    let oracle = ScriptedOracle;
    for _ in 0..3 {
        canonical::refine(&pool, &oracle, &cfg.oracle, true, Arc::new(NoProgress))
            .await
            .unwrap();
    }

    let record = canonical::get_record(&pool, "APPLE SCAB").await.unwrap().unwrap();
    assert!(record.locked);
    assert_eq!(record.canonical_name.as_deref(), Some("Scab (manual)"));
    assert_eq!(record.scientific_name.as_deref(), Some("Venturia sp."));

    // The unlocked sibling in the same group did get canonicalized.
    let sibling = canonical::get_record(&pool, "SCAB OF APPLE").await.unwrap().unwrap();
    assert_eq!(sibling.canonical_name.as_deref(), Some("Apple Scab"));
}

#[tokio::test]
async fn disabled_oracle_defers_batches() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = test_pool(tmp.path()).await;

    insert_name(&pool, "CRABGRASS", "Apple").await;
    insert_name(&pool, "CODLING MOTH", "Apple").await;

    let report = canonical::classify(&pool, &DisabledOracle, &cfg.oracle, Arc::new(NoProgress))
        .await
        .unwrap();
    assert_eq!(report.classified, 0);
    assert_eq!(report.errored_batches, 1);

    // Deferred, not dropped or defaulted: a later run with a working
    // oracle picks the rows up again.
    let record = canonical::get_record(&pool, "CRABGRASS").await.unwrap().unwrap();
    assert_eq!(record.category, None);

    let report = canonical::classify(&pool, &ScriptedOracle, &cfg.oracle, Arc::new(NoProgress))
        .await
        .unwrap();
    assert_eq!(report.classified, 2);
}
