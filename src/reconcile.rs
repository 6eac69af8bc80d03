//! Inventory reconciler: joins a registry snapshot against the local
//! document inventory and produces the filtered acquisition work queue.
//!
//! Filter policy: a product is kept only when its use-type list intersects
//! the allow-list (an empty list is kept) and its product type is not on
//! the exclusion list. Every excluded product is recorded with a reason so
//! filter precision stays auditable.

use std::collections::HashSet;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::models::{RegistrySnapshot, WorkItem};
use crate::store::ArtifactStore;

/// Use types considered agriculturally relevant.
pub const ALLOWED_USE_TYPES: &[&str] = &[
    "AGRICULTURAL",
    "TURF",
    "NURSERY",
    "ORNAMENTAL",
    "COMMERCIAL",
    "GREENHOUSE",
    "HEMP",
    "CANNABIS",
    "HEMP (EPA LABEL)",
    "SEED TREATMENT",
];

/// Product-type combinations with no agricultural use. Matched against the
/// full comma-joined type string, the granularity the registry reports.
pub const EXCLUDED_PRODUCT_TYPES: &[&str] = &[
    "ANTIMICROBIAL, DISINFECTANT",
    "ANTIMICROBIAL, SANITIZER",
    "ALGAECIDE, ANTIMICROBIAL, SANITIZER",
    "ANTIMICROBIAL, DISINFECTANT, MILDEWSTATIC",
    "SANITIZER",
    "ALGAECIDE, ANTIMICROBIAL",
    "DISINFECTANT",
    "ANTIMICROBIAL",
    "ALGAECIDE",
    "DISINFECTANT, SANITIZER",
    "WOOD PRESERVATIVE",
    "ALGAECIDE, DISINFECTANT",
    "ALGAECIDE, ANTIMICROBIAL, DISINFECTANT, MOLLUSCICIDE",
    "ALGAECIDE, ANTIFOULANT",
    "ANTIFOULANT",
    "0",
    "ANTIMICROBIAL, WOOD PRESERVATIVE",
    "ALGAECIDE, SANITIZER",
    "PISCICIDE",
    "CONTRACEPTIVE",
];

/// Keep a product when any use type is allowed. An empty list is kept: the
/// registry frequently omits use data and dropping those rows would lose
/// real agricultural products.
pub fn is_allowed_use(use_types: &[String]) -> bool {
    if use_types.is_empty() {
        return true;
    }
    use_types
        .iter()
        .any(|u| ALLOWED_USE_TYPES.contains(&u.trim().to_ascii_uppercase().as_str()))
}

pub fn is_included_product_type(product_types: &[String]) -> bool {
    if product_types.is_empty() {
        return true;
    }
    let joined = product_types
        .iter()
        .map(|t| t.trim().to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(", ");
    !EXCLUDED_PRODUCT_TYPES.contains(&joined.as_str())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub queued: usize,
    pub already_acquired: usize,
    pub excluded: usize,
}

/// Build the acquisition work queue for a snapshot. `inventory` is the set
/// of artifact keys currently in the store.
pub async fn build_work_queue(
    pool: &SqlitePool,
    snapshot: &RegistrySnapshot,
    inventory: &HashSet<String>,
) -> Result<(Vec<WorkItem>, ReconcileReport)> {
    // Documents flagged for deletion by the review workflow are treated as
    // absent so the product re-queues.
    let held: Vec<(String,)> = sqlx::query_as(
        "SELECT product_no FROM documents WHERE flagged_for_deletion = 0",
    )
    .fetch_all(pool)
    .await?;
    let held: HashSet<String> = held.into_iter().map(|(p,)| p).collect();

    let mut queue = Vec::new();
    let mut report = ReconcileReport::default();

    for product in &snapshot.products {
        let reason = exclusion_reason(product);
        if let Some(reason) = reason {
            record_exclusion(pool, &snapshot.version, &product.product_no, reason).await?;
            report.excluded += 1;
            continue;
        }

        if held.contains(&product.product_no)
            || ArtifactStore::has_document(
                inventory,
                &product.registration_number,
                &product.product_name,
            )
        {
            report.already_acquired += 1;
            continue;
        }

        queue.push(WorkItem {
            product_no: product.product_no.clone(),
            registration_number: product.registration_number.clone(),
            product_name: product.product_name.clone(),
        });
        report.queued += 1;
    }

    Ok((queue, report))
}

fn exclusion_reason(product: &crate::models::ProductRecord) -> Option<&'static str> {
    if let Some(status) = &product.registration_status {
        if !status.trim().eq_ignore_ascii_case("registered") {
            return Some("not_registered");
        }
    }
    if !is_included_product_type(&product.product_types) {
        return Some("product_type_excluded");
    }
    if !is_allowed_use(&product.use_types) {
        return Some("use_type_not_allowed");
    }
    None
}

async fn record_exclusion(
    pool: &SqlitePool,
    snapshot_version: &str,
    product_no: &str,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO exclusions (product_no, snapshot_version, reason, recorded_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(product_no)
    .bind(snapshot_version)
    .bind(reason)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn intersection_keeps_mixed_use_lists() {
        // One allowed use is enough even when others are not on the list.
        assert!(is_allowed_use(&strings(&[
            "ORNAMENTAL",
            "RESIDENTIAL",
            "AGRICULTURAL"
        ])));
        assert!(is_allowed_use(&strings(&["turf"])));
        assert!(!is_allowed_use(&strings(&["RESIDENTIAL", "INDUSTRIAL"])));
    }

    #[test]
    fn empty_use_list_is_kept() {
        assert!(is_allowed_use(&[]));
    }

    #[test]
    fn product_type_exclusion_matches_full_combination() {
        assert!(!is_included_product_type(&strings(&[
            "ANTIMICROBIAL",
            "DISINFECTANT"
        ])));
        assert!(!is_included_product_type(&strings(&["Sanitizer"])));
        // A combination containing an excluded type alongside others is a
        // different registry value and stays included.
        assert!(is_included_product_type(&strings(&[
            "FUNGICIDE",
            "ALGAECIDE"
        ])));
        assert!(is_included_product_type(&strings(&["HERBICIDE"])));
        assert!(is_included_product_type(&[]));
    }
}
