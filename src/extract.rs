//! Per-page text extraction from PDF label documents.

use std::fmt;
use std::path::Path;

#[derive(Debug)]
pub enum ExtractError {
    /// File could not be read from the artifact store.
    Io(std::io::Error),
    /// The PDF library rejected the document.
    Pdf(String),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::Io(e) => write!(f, "failed to read document: {}", e),
            ExtractError::Pdf(msg) => write!(f, "failed to parse document: {}", msg),
        }
    }
}

impl std::error::Error for ExtractError {}

impl From<std::io::Error> for ExtractError {
    fn from(e: std::io::Error) -> Self {
        ExtractError::Io(e)
    }
}

/// Extract text page by page. Page order follows the document; a page with
/// no text layer yields an empty string rather than being skipped, so page
/// indexes stay aligned with the rendered pages.
pub fn extract_pages(path: &Path) -> Result<Vec<String>, ExtractError> {
    let bytes = std::fs::read(path)?;
    extract_pages_from_bytes(&bytes)
}

pub fn extract_pages_from_bytes(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(pages.into_iter().map(|p| clean_page(&p)).collect())
}

/// Collapse runs of whitespace and trim. Extraction emits layout artifacts
/// (form feeds, stacked newlines) that would distort character counts.
fn clean_page(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_ws = true;
    for c in raw.chars() {
        if c.is_whitespace() {
            if !last_ws {
                out.push(' ');
            }
            last_ws = true;
        } else {
            out.push(c);
            last_ws = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}
