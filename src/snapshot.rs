//! Registry snapshot ingestion.
//!
//! A registry export is either a zip archive or a directory of CSV files:
//! one main product table plus auxiliary tables (product types, use types,
//! toxicities) keyed by the registry's internal product id. Ingestion joins
//! the auxiliary attributes onto each product row and assigns the snapshot
//! a content-derived version, so re-ingesting identical files is a no-op.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::models::{ProductRecord, RegistrySnapshot};

/// Load an export from disk and parse it into a snapshot. Accepts a `.zip`
/// archive or a directory containing the CSV files.
pub fn load_export(path: &Path) -> Result<RegistrySnapshot> {
    let files = read_export_files(path)
        .with_context(|| format!("Failed to read registry export: {}", path.display()))?;
    if files.is_empty() {
        bail!("Registry export contains no CSV files: {}", path.display());
    }
    parse_export(&files)
}

/// Read every CSV in the export into memory, keyed by lowercased file stem.
/// BTreeMap keeps iteration order stable for version hashing.
fn read_export_files(path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();

    if path.is_dir() {
        for entry in walkdir::WalkDir::new(path).max_depth(1) {
            let entry = entry?;
            let p = entry.path();
            if p.extension().and_then(|e| e.to_str()) == Some("csv") {
                let stem = file_stem_key(p);
                files.insert(stem, std::fs::read(p)?);
            }
        }
    } else if path.extension().and_then(|e| e.to_str()) == Some("zip") {
        let reader = std::fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(reader)?;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if !entry.name().to_ascii_lowercase().ends_with(".csv") {
                continue;
            }
            let stem = file_stem_key(Path::new(entry.name()));
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            files.insert(stem, buf);
        }
    } else {
        bail!("Export must be a directory or a .zip archive");
    }

    Ok(files)
}

fn file_stem_key(p: &Path) -> String {
    p.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Parse in-memory export files into a snapshot. The main table is the one
/// carrying a `product no` column; the rest are auxiliary attribute tables.
pub fn parse_export(files: &BTreeMap<String, Vec<u8>>) -> Result<RegistrySnapshot> {
    let version = content_version(files);

    let mut main: Option<&Vec<u8>> = None;
    let mut aux: Vec<(&String, &Vec<u8>)> = Vec::new();
    for (name, bytes) in files {
        if has_column(bytes, "product no")? {
            if main.is_some() {
                bail!("Export contains more than one main product table");
            }
            main = Some(bytes);
        } else {
            aux.push((name, bytes));
        }
    }
    let main = main.context("Export contains no main product table (no 'product no' column)")?;

    // Auxiliary attributes accumulate per internal product id.
    let mut types: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut uses: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut tox: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, bytes) in aux {
        let target = if name.contains("use") {
            &mut uses
        } else if name.contains("tox") {
            &mut tox
        } else if name.contains("type") {
            &mut types
        } else {
            continue;
        };
        collect_aux(bytes, target)
            .with_context(|| format!("Failed to parse auxiliary table '{}'", name))?;
    }

    let products = parse_main(main, &types, &uses, &tox)?;
    Ok(RegistrySnapshot { version, products })
}

/// Stable version tag over the export contents. Twelve hex characters is
/// plenty to distinguish exports while staying readable in paths and logs.
fn content_version(files: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (name, bytes) in files {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(bytes);
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..12].to_string()
}

fn has_column(bytes: &[u8], column: &str) -> Result<bool> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = rdr.headers()?;
    Ok(headers
        .iter()
        .any(|h| h.trim().eq_ignore_ascii_case(column)))
}

fn header_index(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim();
        names.iter().any(|n| h.eq_ignore_ascii_case(n))
    })
}

/// Auxiliary tables are two-column: an internal product id and one
/// attribute value per row. Values accumulate in file order, deduplicated.
fn collect_aux(bytes: &[u8], target: &mut BTreeMap<String, Vec<String>>) -> Result<()> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = rdr.headers()?.clone();
    let id_col =
        header_index(&headers, &["product id"]).context("auxiliary table missing 'product id'")?;
    let value_col = (0..headers.len())
        .find(|&i| i != id_col)
        .context("auxiliary table has no value column")?;

    for record in rdr.records() {
        let record = record?;
        let id = join_key(record.get(id_col).unwrap_or(""));
        let value = record.get(value_col).unwrap_or("").trim().to_string();
        if id.is_empty() || value.is_empty() {
            continue;
        }
        let list = target.entry(id).or_default();
        if !list.contains(&value) {
            list.push(value);
        }
    }
    Ok(())
}

/// Normalized join key: registry exports disagree on punctuation and case
/// in id fields, so joins run on the alphanumeric characters only.
pub fn join_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn parse_main(
    bytes: &[u8],
    types: &BTreeMap<String, Vec<String>>,
    uses: &BTreeMap<String, Vec<String>>,
    tox: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<ProductRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = rdr.headers()?.clone();

    let no_col = header_index(&headers, &["product no", "product number"])
        .context("main table missing 'product no'")?;
    let name_col =
        header_index(&headers, &["product name"]).context("main table missing 'product name'")?;
    let id_col = header_index(&headers, &["product id"]);
    let status_col = header_index(&headers, &["registration status", "status"]);
    let auth_col = header_index(&headers, &["authorization type", "auth type"]);
    let form_col = header_index(&headers, &["formulation", "formulation code"]);

    let mut products = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let product_no = record.get(no_col).unwrap_or("").trim().to_string();
        let product_name = record.get(name_col).unwrap_or("").trim().to_string();
        if product_no.is_empty() || product_name.is_empty() {
            continue;
        }

        let product_id = id_col
            .and_then(|i| record.get(i))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let key = product_id
            .as_deref()
            .map(join_key)
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| join_key(&product_no));

        products.push(ProductRecord {
            registration_number: ProductRecord::derive_registration_number(&product_no),
            product_no,
            product_name,
            product_id,
            registration_status: opt_field(&record, status_col),
            auth_type: opt_field(&record, auth_col),
            product_types: types.get(&key).cloned().unwrap_or_default(),
            use_types: uses.get(&key).cloned().unwrap_or_default(),
            toxicities: tox.get(&key).cloned().unwrap_or_default(),
            formulation: opt_field(&record, form_col).map(|f| describe_formulation(&f)),
        });
    }

    Ok(products)
}

fn opt_field(record: &csv::StringRecord, col: Option<usize>) -> Option<String> {
    col.and_then(|i| record.get(i))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Map registry formulation codes to readable values; unknown codes pass
/// through unchanged.
fn describe_formulation(code: &str) -> String {
    match code.trim().to_ascii_uppercase().as_str() {
        "S" => "Solid".to_string(),
        "L" => "Liquid".to_string(),
        other => other.to_string(),
    }
}

/// Persist a snapshot. Idempotent for an already-ingested version.
pub async fn persist_snapshot(pool: &SqlitePool, snapshot: &RegistrySnapshot) -> Result<bool> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT version FROM snapshots WHERE version = ?")
        .bind(&snapshot.version)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Ok(false);
    }

    sqlx::query("INSERT INTO snapshots (version, ingested_at, product_count) VALUES (?, ?, ?)")
        .bind(&snapshot.version)
        .bind(chrono::Utc::now().timestamp())
        .bind(snapshot.products.len() as i64)
        .execute(pool)
        .await?;

    for p in &snapshot.products {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO products
                (product_no, snapshot_version, registration_number, product_name,
                 product_id, registration_status, auth_type,
                 product_types, use_types, toxicities, formulation)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&p.product_no)
        .bind(&snapshot.version)
        .bind(&p.registration_number)
        .bind(&p.product_name)
        .bind(&p.product_id)
        .bind(&p.registration_status)
        .bind(&p.auth_type)
        .bind(serde_json::to_string(&p.product_types)?)
        .bind(serde_json::to_string(&p.use_types)?)
        .bind(serde_json::to_string(&p.toxicities)?)
        .bind(&p.formulation)
        .execute(pool)
        .await?;
    }

    Ok(true)
}

/// Load a previously ingested snapshot by version.
pub async fn load_snapshot(pool: &SqlitePool, version: &str) -> Result<RegistrySnapshot> {
    let rows: Vec<(String, String, String, Option<String>, Option<String>, Option<String>, String, String, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT product_no, registration_number, product_name, product_id,
               registration_status, auth_type, product_types, use_types,
               toxicities, formulation
        FROM products WHERE snapshot_version = ?
        ORDER BY product_no
        "#,
    )
    .bind(version)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        bail!("No snapshot with version '{}'", version);
    }

    let products = rows
        .into_iter()
        .map(
            |(product_no, registration_number, product_name, product_id, registration_status, auth_type, types, uses, tox, formulation)| {
                Ok(ProductRecord {
                    product_no,
                    registration_number,
                    product_name,
                    product_id,
                    registration_status,
                    auth_type,
                    product_types: serde_json::from_str(&types)?,
                    use_types: serde_json::from_str(&uses)?,
                    toxicities: serde_json::from_str(&tox)?,
                    formulation,
                })
            },
        )
        .collect::<Result<Vec<_>>>()?;

    Ok(RegistrySnapshot {
        version: version.to_string(),
        products,
    })
}

/// Latest ingested snapshot version, if any.
pub async fn latest_version(pool: &SqlitePool) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT version FROM snapshots ORDER BY ingested_at DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(v,)| v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export_with(main: &str, aux: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        let mut files = BTreeMap::new();
        files.insert("product".to_string(), main.as_bytes().to_vec());
        for (name, body) in aux {
            files.insert(name.to_string(), body.as_bytes().to_vec());
        }
        files
    }

    #[test]
    fn joins_auxiliary_attributes() {
        let files = export_with(
            "PRODUCT NO,PRODUCT NAME,PRODUCT ID,AUTHORIZATION TYPE,FORMULATION\n\
             100-1347-1671,Concert II,P-77,primary label,L\n\
             264-1210,Other Product,P-88,SLN,S\n",
            &[
                (
                    "productuse",
                    "PRODUCT ID,PRODUCT USE\nP-77,AGRICULTURAL\nP-77,TURF\nP-77,AGRICULTURAL\n",
                ),
                ("producttype", "PRODUCT ID,PRODUCT TYPE\nP-77,FUNGICIDE\n"),
                ("toxicity", "PRODUCT ID,TOXICITY\nP-88,CAUTION\n"),
            ],
        );
        let snapshot = parse_export(&files).unwrap();
        assert_eq!(snapshot.products.len(), 2);

        let concert = &snapshot.products[0];
        assert_eq!(concert.registration_number, "100-1347");
        assert_eq!(concert.use_types, vec!["AGRICULTURAL", "TURF"]);
        assert_eq!(concert.product_types, vec!["FUNGICIDE"]);
        assert_eq!(concert.formulation.as_deref(), Some("Liquid"));
        assert!(concert.is_primary_label());

        let other = &snapshot.products[1];
        assert!(other.use_types.is_empty());
        assert_eq!(other.toxicities, vec!["CAUTION"]);
        assert_eq!(other.formulation.as_deref(), Some("Solid"));
    }

    #[test]
    fn version_is_content_derived() {
        let files = export_with("PRODUCT NO,PRODUCT NAME\n1-2-3,A\n", &[]);
        let a = parse_export(&files).unwrap();
        let b = parse_export(&files).unwrap();
        assert_eq!(a.version, b.version);

        let changed = export_with("PRODUCT NO,PRODUCT NAME\n1-2-3,B\n", &[]);
        let c = parse_export(&changed).unwrap();
        assert_ne!(a.version, c.version);
    }

    #[test]
    fn join_key_normalizes() {
        assert_eq!(join_key(" P-77 "), "p77");
        assert_eq!(join_key("100-1347-1671"), "10013471671");
    }
}
