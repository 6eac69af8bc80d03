//! Concurrent acquisition scheduler.
//!
//! Drains the work queue through a bounded pool of catalog sessions. Two
//! rate limits apply: the pool bound (`max_sessions`) and a global start
//! throttle, under which a new session may begin only `session_start_delay`
//! after the previous session start, regardless of pool size. The throttle
//! lock is held for the whole wait, serializing starts.
//!
//! Per-item failures are outcomes, not errors: the run always completes and
//! reports a tally. Each retry opens a fresh session; a half-failed session
//! is never reused.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::catalog::{Catalog, CatalogError, DocumentDetail};
use crate::config::AcquisitionConfig;
use crate::models::WorkItem;
use crate::progress::Progress;
use crate::store::{ArtifactMeta, ArtifactStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AcquireReport {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Per-item outcomes in completion order.
    pub outcomes: Vec<(String, ItemOutcome)>,
}

/// Run the scheduler over a work queue.
pub async fn run(
    catalog: Arc<dyn Catalog>,
    store: ArtifactStore,
    pool: SqlitePool,
    queue: Vec<WorkItem>,
    config: &AcquisitionConfig,
    progress: Arc<dyn Progress>,
    cancel: CancelToken,
) -> Result<AcquireReport> {
    progress.begin(queue.len() as u64, "acquiring label documents");

    let semaphore = Arc::new(Semaphore::new(config.max_sessions));
    let throttle: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let pacing = Pacing {
        start_delay: Duration::from_millis(config.session_start_delay_ms),
        step_delay: Duration::from_millis(config.step_delay_ms),
        max_retries: config.max_retries,
        headless: config.headless,
    };

    let mut tasks = JoinSet::new();
    let mut task_items: HashMap<tokio::task::Id, String> = HashMap::new();
    for item in queue {
        let catalog = Arc::clone(&catalog);
        let store = store.clone();
        let pool = pool.clone();
        let semaphore = Arc::clone(&semaphore);
        let throttle = Arc::clone(&throttle);
        let cancel = cancel.clone();
        let pacing = pacing.clone();

        let product_no = item.product_no.clone();
        let handle = tasks.spawn(async move {
            // Closed only on scheduler teardown, which cannot happen while
            // tasks are still running.
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            if cancel.is_cancelled() {
                return (item, ItemOutcome::Cancelled);
            }
            let outcome =
                acquire_one(catalog.as_ref(), &store, &pool, &item, &throttle, &pacing, &cancel)
                    .await;
            (item, outcome)
        });
        task_items.insert(handle.id(), product_no);
    }

    let mut report = AcquireReport::default();
    while let Some(joined) = tasks.join_next_with_id().await {
        // A crashed worker costs only its own item; the rest of the pool
        // keeps running.
        let (product_no, outcome) = match joined {
            Ok((id, (item, outcome))) => {
                task_items.remove(&id);
                (item.product_no, outcome)
            }
            Err(join_error) => {
                let product_no = task_items
                    .remove(&join_error.id())
                    .unwrap_or_else(|| "unknown".to_string());
                (
                    product_no,
                    ItemOutcome::Failed(format!("session worker crashed: {}", join_error)),
                )
            }
        };
        match &outcome {
            ItemOutcome::Succeeded => report.succeeded += 1,
            ItemOutcome::Failed(_) => report.failed += 1,
            ItemOutcome::Cancelled => report.cancelled += 1,
        }
        progress.item(&format!("{} {}", product_no, outcome_word(&outcome)));
        report.outcomes.push((product_no, outcome));
    }

    progress.finish(&format!(
        "{} succeeded, {} failed, {} cancelled",
        report.succeeded, report.failed, report.cancelled
    ));
    Ok(report)
}

fn outcome_word(outcome: &ItemOutcome) -> &'static str {
    match outcome {
        ItemOutcome::Succeeded => "succeeded",
        ItemOutcome::Failed(_) => "failed",
        ItemOutcome::Cancelled => "cancelled",
    }
}

#[derive(Clone)]
struct Pacing {
    start_delay: Duration,
    step_delay: Duration,
    max_retries: u32,
    headless: bool,
}

/// Wait for the global start gate. The lock is held across the sleep so
/// starts serialize at exactly one per delay interval.
async fn wait_for_start_slot(throttle: &Mutex<Option<Instant>>, delay: Duration) {
    let mut last_start = throttle.lock().await;
    if let Some(last) = *last_start {
        let elapsed = last.elapsed();
        if elapsed < delay {
            tokio::time::sleep(delay - elapsed).await;
        }
    }
    *last_start = Some(Instant::now());
}

async fn acquire_one(
    catalog: &dyn Catalog,
    store: &ArtifactStore,
    pool: &SqlitePool,
    item: &WorkItem,
    throttle: &Mutex<Option<Instant>>,
    pacing: &Pacing,
    cancel: &CancelToken,
) -> ItemOutcome {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return ItemOutcome::Cancelled;
        }

        // Every session start passes the gate, retries included.
        wait_for_start_slot(throttle, pacing.start_delay).await;

        match run_session(catalog, item, pacing).await {
            Ok((bytes, detail)) => {
                return match persist(store, pool, item, &bytes, &detail).await {
                    Ok(()) => ItemOutcome::Succeeded,
                    Err(e) => ItemOutcome::Failed(format!("persist failed: {}", e)),
                }
            }
            Err(e) if e.is_retryable() && attempt <= pacing.max_retries => {
                let backoff = 1u64 << (attempt - 1).min(5);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
            Err(e) => return ItemOutcome::Failed(e.to_string()),
        }
    }
}

/// Drive one fresh session through its steps: search by product name, open
/// the first candidate's detail view, download. The candidate is taken as
/// found; its reported label type travels with the document as metadata.
async fn run_session(
    catalog: &dyn Catalog,
    item: &WorkItem,
    pacing: &Pacing,
) -> Result<(Vec<u8>, DocumentDetail), CatalogError> {
    let mut session = catalog.open_session(pacing.headless).await?;

    let hits = session.search(&item.product_name).await?;
    let first = match hits.first() {
        Some(hit) => hit.clone(),
        None => return Err(CatalogError::NotFound(item.product_no.clone())),
    };

    tokio::time::sleep(pacing.step_delay).await;
    let detail = session.open_detail(&first).await?;

    tokio::time::sleep(pacing.step_delay).await;
    let bytes = session.download(&detail).await?;
    Ok((bytes, detail))
}

async fn persist(
    store: &ArtifactStore,
    pool: &SqlitePool,
    item: &WorkItem,
    bytes: &[u8],
    detail: &DocumentDetail,
) -> Result<()> {
    let key = ArtifactStore::artifact_key(
        &item.registration_number,
        &item.product_name,
        &detail.document_number,
    );

    store.write_document(
        &key,
        bytes,
        ArtifactMeta {
            product_no: item.product_no.clone(),
            registration_number: item.registration_number.clone(),
            product_name: item.product_name.clone(),
            label_type: detail.label_type.clone(),
            sha256: String::new(),
            acquired_at: chrono::Utc::now(),
        },
    )?;

    sqlx::query(
        r#"
        INSERT INTO documents
            (id, artifact_key, product_no, registration_number, product_name,
             label_type, acquired_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(artifact_key) DO UPDATE SET
            label_type = excluded.label_type,
            acquired_at = excluded.acquired_at,
            flagged_for_deletion = 0
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&key)
    .bind(&item.product_no)
    .bind(&item.registration_number)
    .bind(&item.product_name)
    .bind(&detail.label_type)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}
