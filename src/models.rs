//! Core data models used throughout labelforge.
//!
//! These types represent the registry products, label documents, QA
//! verdicts, OCR attempts, and canonical name records that flow through
//! the acquisition and quality-assurance pipeline.

use serde::{Deserialize, Serialize};

/// One product row from a registry snapshot, with auxiliary attributes
/// joined on. Immutable within a snapshot; refreshed on each ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductRecord {
    /// State product number, e.g. `100-1347-1671`.
    pub product_no: String,
    /// Federal (EPA) registration number derived from the product number:
    /// the first two dash-separated segments, e.g. `100-1347`.
    pub registration_number: String,
    pub product_name: String,
    /// Internal registry product id, when the auxiliary join resolved one.
    pub product_id: Option<String>,
    pub registration_status: Option<String>,
    /// Authorization type, e.g. `ROUTINE`. Primary labels carry
    /// `primary label` in the original data.
    pub auth_type: Option<String>,
    /// Ordered, deduplicated product-type list joined from the
    /// product-type table (a product can carry several).
    pub product_types: Vec<String>,
    /// Ordered, deduplicated use-type list, e.g. `AGRICULTURAL`, `TURF`.
    pub use_types: Vec<String>,
    /// Ordered, deduplicated toxicity categories.
    pub toxicities: Vec<String>,
    /// Formulation code mapped to a readable value (`Solid`/`Liquid`).
    pub formulation: Option<String>,
}

impl ProductRecord {
    /// Derive the federal registration number from a state product number.
    /// `100-1347-1671` → `100-1347`; fewer than three segments pass through.
    pub fn derive_registration_number(product_no: &str) -> String {
        let parts: Vec<&str> = product_no.trim().split('-').collect();
        if parts.len() >= 3 {
            format!("{}-{}", parts[0], parts[1])
        } else {
            product_no.trim().to_string()
        }
    }

    /// Whether this product's documents are primary labels (as opposed to
    /// 2EE/SLN/supplemental). Short overlay documents are an acceptable
    /// baseline for non-primary label types.
    pub fn is_primary_label(&self) -> bool {
        self.auth_type
            .as_deref()
            .map(|a| a.eq_ignore_ascii_case("primary label") || a.eq_ignore_ascii_case("routine"))
            .unwrap_or(false)
    }
}

/// A versioned registry snapshot. Passed explicitly between reconciler
/// runs; never a process-wide singleton.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Content-derived version tag, stable for identical input files.
    pub version: String,
    pub products: Vec<ProductRecord>,
}

/// Which extracted text version is currently accepted for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextVersion {
    Original,
    Ocr,
}

impl TextVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextVersion::Original => "original",
            TextVersion::Ocr => "ocr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "original" => Some(TextVersion::Original),
            "ocr" => Some(TextVersion::Ocr),
            _ => None,
        }
    }
}

/// Evidence for a full-document OCR escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QaEvidence {
    /// No text at all: corrupted or fully scanned document.
    EmptyText,
    /// Total length below the overlay threshold on a primary label.
    OverlayOnlyPrimary,
    /// Neither the product-name token nor the registration number was
    /// found in the text; partial cues cannot be trusted.
    IdentityMismatch,
    /// Primary label missing the mandated safety phrase.
    MissingSafetyPhrase,
}

impl QaEvidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            QaEvidence::EmptyText => "empty_text",
            QaEvidence::OverlayOnlyPrimary => "overlay_only_primary",
            QaEvidence::IdentityMismatch => "identity_mismatch",
            QaEvidence::MissingSafetyPhrase => "missing_safety_phrase",
        }
    }
}

/// Automated judgment of whether a document's extracted text is
/// trustworthy, with the failing signal attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QaVerdict {
    Pass,
    /// Specific pages fell below the per-page threshold; OCR is scoped to
    /// these zero-based page indexes only.
    PageOcrNeeded { pages: Vec<usize> },
    FullOcrNeeded { evidence: QaEvidence },
    /// Post-OCR signals still below policy; requires operator action.
    ManualReviewNeeded,
}

impl QaVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            QaVerdict::Pass => "pass",
            QaVerdict::PageOcrNeeded { .. } => "page_ocr_needed",
            QaVerdict::FullOcrNeeded { .. } => "full_ocr_needed",
            QaVerdict::ManualReviewNeeded => "manual_review_needed",
        }
    }
}

/// Quality signals computed for one document text version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaSignals {
    pub total_chars: usize,
    /// Ordered per-page character counts. Invariant:
    /// `total_chars == page_chars.iter().sum()`.
    pub page_chars: Vec<usize>,
    pub name_match: bool,
    pub reg_no_match: bool,
    pub safety_phrase_match: bool,
}

/// Scope of an OCR escalation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcrScope {
    /// Zero-based page indexes flagged by the classifier.
    Pages(Vec<usize>),
    Full,
}

/// Outcome of an OCR escalation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcrOutcome {
    /// Post-OCR signals satisfy the policy; OCR text accepted for scope.
    Improved,
    /// The original text already satisfies the policy on re-check; the
    /// flag was a false positive.
    NotNecessary,
    /// Signals remain below policy after OCR.
    StillFailing,
}

impl OcrOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrOutcome::Improved => "improved",
            OcrOutcome::NotNecessary => "not_necessary",
            OcrOutcome::StillFailing => "still_failing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "improved" => Some(OcrOutcome::Improved),
            "not_necessary" => Some(OcrOutcome::NotNecessary),
            "still_failing" => Some(OcrOutcome::StillFailing),
            _ => None,
        }
    }
}

/// One append-only OCR attempt record for a document.
#[derive(Debug, Clone)]
pub struct OcrAttempt {
    pub document_id: String,
    pub scope: OcrScope,
    pub before: QaSignals,
    pub after: Option<QaSignals>,
    pub outcome: OcrOutcome,
}

/// Agricultural relevance classification of a document's accepted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    /// Both the agricultural-use and restricted-entry-interval sections.
    Both,
    AgOnly,
    ReiOnly,
    None,
}

impl Relevance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relevance::Both => "both",
            Relevance::AgOnly => "ag",
            Relevance::ReiOnly => "rei",
            Relevance::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "both" => Some(Relevance::Both),
            "ag" => Some(Relevance::AgOnly),
            "rei" => Some(Relevance::ReiOnly),
            "none" => Some(Relevance::None),
            _ => None,
        }
    }
}

/// A raw crop/target name string mapped to the canonical vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct NameRecord {
    /// Raw observed string; unique key of the mapping table.
    pub raw_name: String,
    /// Crop the name was observed against; groups the Refine batches.
    pub crop: String,
    /// Coarse category, e.g. `Disease`, `Insects`, `Weeds`, `Other`.
    pub category: Option<String>,
    pub canonical_name: Option<String>,
    pub scientific_name: Option<String>,
    /// Set by a manual edit; automated passes must never touch the row
    /// again once true.
    pub locked: bool,
}

/// One work-queue entry produced by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub product_no: String,
    pub registration_number: String,
    pub product_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_number_derivation() {
        assert_eq!(
            ProductRecord::derive_registration_number("100-1347-1671"),
            "100-1347"
        );
        assert_eq!(
            ProductRecord::derive_registration_number("100-1347"),
            "100-1347"
        );
        assert_eq!(ProductRecord::derive_registration_number(" 42 "), "42");
    }

    #[test]
    fn verdict_labels() {
        assert_eq!(QaVerdict::Pass.as_str(), "pass");
        assert_eq!(
            QaVerdict::PageOcrNeeded { pages: vec![2] }.as_str(),
            "page_ocr_needed"
        );
        assert_eq!(OcrOutcome::parse("improved"), Some(OcrOutcome::Improved));
        assert_eq!(Relevance::parse("rei"), Some(Relevance::ReiOnly));
    }
}
