//! Remote catalog access.
//!
//! The catalog is the state registry's public document search. Acquisition
//! talks to it through the `Catalog`/`CatalogSession` traits so the
//! scheduler can be tested against mock catalogs and so a browser-backed
//! session could be swapped in without touching the scheduler. Sessions are
//! single-use: one session serves one work item, and a retry opens a fresh
//! session rather than reusing state from a failed one.
//!
//! A session proceeds in steps: search by product name, open the detail
//! view of the first candidate, download the document. The first candidate
//! is not verified to be the primary label; its reported label type is
//! surfaced as metadata instead.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::CatalogConfig;

#[derive(Debug)]
pub enum CatalogError {
    /// Transport failure, timeout, or server-side error. Worth a fresh
    /// session.
    TransientNetwork(String),
    /// The session's view of the catalog went stale mid-step. Reported by
    /// browser-backed sessions; also worth a fresh session.
    TransientUiState(String),
    /// The catalog has no document for the product.
    NotFound(String),
    /// Client error or undecodable response; retrying cannot help.
    Fatal(String),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::TransientNetwork(msg) => write!(f, "catalog network failure: {}", msg),
            CatalogError::TransientUiState(msg) => write!(f, "catalog session went stale: {}", msg),
            CatalogError::NotFound(product) => {
                write!(f, "no document found for product {}", product)
            }
            CatalogError::Fatal(msg) => write!(f, "catalog request failed: {}", msg),
        }
    }
}

impl std::error::Error for CatalogError {}

impl CatalogError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalogError::TransientNetwork(_) | CatalogError::TransientUiState(_)
        )
    }
}

/// One row of a catalog search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub document_number: String,
}

/// Metadata from a document's detail view.
#[derive(Debug, Clone)]
pub struct DocumentDetail {
    pub document_number: String,
    /// Label type as stated by the catalog. Surfaced, never verified.
    pub label_type: Option<String>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Open a fresh, isolated session. `headless` is honored by
    /// browser-backed implementations and ignored by plain HTTP ones.
    async fn open_session(&self, headless: bool) -> Result<Box<dyn CatalogSession>, CatalogError>;
}

#[async_trait]
pub trait CatalogSession: Send {
    /// Search the catalog by product name.
    async fn search(&mut self, product_name: &str) -> Result<Vec<SearchHit>, CatalogError>;

    /// Open the detail view of one search hit.
    async fn open_detail(&mut self, hit: &SearchHit) -> Result<DocumentDetail, CatalogError>;

    /// Download the document behind a detail view.
    async fn download(&mut self, detail: &DocumentDetail) -> Result<Vec<u8>, CatalogError>;
}

/// Plain HTTP catalog against the registry's public search endpoints.
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(catalog: &CatalogConfig) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .user_agent(catalog.user_agent.clone())
            .timeout(Duration::from_secs(catalog.timeout_secs))
            .build()
            .map_err(|e| CatalogError::TransientNetwork(e.to_string()))?;
        Ok(Self {
            client,
            base_url: catalog.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn open_session(&self, _headless: bool) -> Result<Box<dyn CatalogSession>, CatalogError> {
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
        }))
    }
}

struct HttpSession {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    documents: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    #[serde(rename = "documentNumber")]
    document_number: String,
}

#[derive(Debug, Deserialize)]
struct DetailResponse {
    #[serde(rename = "documentNumber")]
    document_number: String,
    #[serde(rename = "labelType")]
    label_type: Option<String>,
}

impl HttpSession {
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, CatalogError> {
        let response = request
            .send()
            .await
            .map_err(|e| CatalogError::TransientNetwork(e.to_string()))?;
        let code = response.status().as_u16();
        if response.status().is_success() {
            Ok(response)
        } else if code == 429 || code >= 500 {
            Err(CatalogError::TransientNetwork(format!("status {}", code)))
        } else {
            Err(CatalogError::Fatal(format!("status {}", code)))
        }
    }
}

#[async_trait]
impl CatalogSession for HttpSession {
    async fn search(&mut self, product_name: &str) -> Result<Vec<SearchHit>, CatalogError> {
        let request = self
            .client
            .get(format!("{}/api/products/search", self.base_url))
            .query(&[("name", product_name)]);
        let response: SearchResponse = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| CatalogError::Fatal(format!("bad search response: {}", e)))?;
        Ok(response
            .documents
            .into_iter()
            .map(|d| SearchHit {
                document_number: d.document_number,
            })
            .collect())
    }

    async fn open_detail(&mut self, hit: &SearchHit) -> Result<DocumentDetail, CatalogError> {
        let request = self.client.get(format!(
            "{}/api/documents/{}/detail",
            self.base_url, hit.document_number
        ));
        let detail: DetailResponse = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| CatalogError::Fatal(format!("bad detail response: {}", e)))?;
        Ok(DocumentDetail {
            document_number: detail.document_number,
            label_type: detail.label_type,
        })
    }

    async fn download(&mut self, detail: &DocumentDetail) -> Result<Vec<u8>, CatalogError> {
        let request = self.client.get(format!(
            "{}/api/documents/{}",
            self.base_url, detail.document_number
        ));
        let bytes = self
            .send(request)
            .await?
            .bytes()
            .await
            .map_err(|e| CatalogError::TransientNetwork(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(CatalogError::TransientNetwork("timeout".to_string()).is_retryable());
        assert!(CatalogError::TransientUiState("stale element".to_string()).is_retryable());
        assert!(!CatalogError::NotFound("1-2-3".to_string()).is_retryable());
        assert!(!CatalogError::Fatal("status 404".to_string()).is_retryable());
    }

    #[test]
    fn search_query_is_client_encoded() {
        let client = reqwest::Client::new();
        let request = client
            .get("https://example.test/api/products/search")
            .query(&[("name", "Concert II 10% WP")])
            .build()
            .unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://example.test/api/products/search?name=Concert+II+10%25+WP"
        );
    }
}
