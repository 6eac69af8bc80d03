//! Local artifact store for acquired label documents.
//!
//! Each document lands as `{artifact_key}.pdf` with a JSON sidecar carrying
//! provenance metadata and a content digest. The store is the inventory the
//! reconciler joins against, so key construction must stay deterministic.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

/// Provenance sidecar written next to each PDF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub product_no: String,
    pub registration_number: String,
    pub product_name: String,
    pub label_type: Option<String>,
    pub sha256: String,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic artifact key: `{registration_number}_{product_name}_{version}`
    /// with filesystem-hostile characters collapsed to underscores.
    pub fn artifact_key(registration_number: &str, product_name: &str, version: &str) -> String {
        format!(
            "{}_{}_{}",
            sanitize(registration_number),
            sanitize(product_name),
            sanitize(version)
        )
    }

    /// Prefix shared by every version of a product's document. Used to match
    /// inventory entries without knowing the version suffix.
    pub fn key_prefix(registration_number: &str, product_name: &str) -> String {
        format!("{}_{}_", sanitize(registration_number), sanitize(product_name))
    }

    pub fn pdf_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.pdf", key))
    }

    pub fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }

    /// Persist a document and its sidecar. Returns the content digest.
    pub fn write_document(&self, key: &str, bytes: &[u8], mut meta: ArtifactMeta) -> Result<String> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create store root: {}", self.root.display()))?;

        let digest = Sha256::digest(bytes);
        let sha256: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        meta.sha256 = sha256.clone();

        let pdf = self.pdf_path(key);
        std::fs::write(&pdf, bytes)
            .with_context(|| format!("Failed to write artifact: {}", pdf.display()))?;
        let sidecar = self.meta_path(key);
        std::fs::write(&sidecar, serde_json::to_vec_pretty(&meta)?)
            .with_context(|| format!("Failed to write sidecar: {}", sidecar.display()))?;

        Ok(sha256)
    }

    pub fn read_meta(&self, key: &str) -> Result<ArtifactMeta> {
        let path = self.meta_path(key);
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read sidecar: {}", path.display()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Scan the store for PDF artifact keys.
    pub fn inventory(&self) -> Result<HashSet<String>> {
        let mut keys = HashSet::new();
        if !self.root.exists() {
            return Ok(keys);
        }
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("pdf") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.insert(stem.to_string());
                }
            }
        }
        Ok(keys)
    }

    /// Whether the inventory holds any version of this product's document.
    pub fn has_document(
        inventory: &HashSet<String>,
        registration_number: &str,
        product_name: &str,
    ) -> bool {
        let prefix = Self::key_prefix(registration_number, product_name);
        inventory.iter().any(|k| k.starts_with(&prefix))
    }

    /// Delete a document's PDF and sidecar. Missing files are not an error;
    /// purge must be re-runnable after a partial failure.
    pub fn purge(&self, key: &str) -> Result<()> {
        for path in [self.pdf_path(key), self.meta_path(key)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to delete artifact: {}", path.display()))
                }
            }
        }
        Ok(())
    }
}

fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_us = true;
    for c in s.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            last_us = false;
        } else if !last_us {
            out.push('_');
            last_us = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta() -> ArtifactMeta {
        ArtifactMeta {
            product_no: "100-1347-1671".to_string(),
            registration_number: "100-1347".to_string(),
            product_name: "Concert II".to_string(),
            label_type: Some("PRIMARY LABEL".to_string()),
            sha256: String::new(),
            acquired_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn keys_are_deterministic_and_sanitized() {
        let key = ArtifactStore::artifact_key("100-1347", "Concert II (R)", "abc123");
        assert_eq!(key, "100-1347_Concert_II_R_abc123");
        assert!(key.starts_with(&ArtifactStore::key_prefix("100-1347", "Concert II (R)")));
    }

    #[test]
    fn write_inventory_purge_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let key = ArtifactStore::artifact_key("100-1347", "Concert II", "v1");

        let sha = store.write_document(&key, b"%PDF-1.4 fake", meta()).unwrap();
        assert_eq!(sha.len(), 64);
        assert_eq!(store.read_meta(&key).unwrap().sha256, sha);

        let inv = store.inventory().unwrap();
        assert!(inv.contains(&key));
        assert!(ArtifactStore::has_document(&inv, "100-1347", "Concert II"));
        assert!(!ArtifactStore::has_document(&inv, "999-1", "Concert II"));

        store.purge(&key).unwrap();
        store.purge(&key).unwrap();
        assert!(store.inventory().unwrap().is_empty());
    }
}
