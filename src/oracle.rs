//! External name-classification oracle.
//!
//! Canonicalization needs a language-understanding judgment this crate does
//! not implement: deciding that "APPLE SCAB (VENTURIA INAEQUALIS)" and
//! "scab of apple" are the same disease. That judgment lives behind the
//! `NameOracle` trait; the engine only orchestrates batches and manages
//! convergence around it. Exchange format is TSV in both directions, which
//! survives model output far better than JSON for long name lists.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::OracleConfig;

/// The closed category vocabulary. Anything the oracle returns outside
/// this set is coerced to `Other`.
pub const CATEGORIES: &[&str] = &[
    "Disease",
    "Insects",
    "Weeds",
    "Growth Regulation",
    "Vertebrate",
    "Mollusks",
    "Other",
];

pub fn valid_category(s: &str) -> Option<&'static str> {
    CATEGORIES
        .iter()
        .find(|c| c.eq_ignore_ascii_case(s.trim()))
        .copied()
}

#[derive(Debug)]
pub enum OracleError {
    Http(String),
    Status(u16),
    /// Response did not parse as the expected TSV.
    BadResponse(String),
    MissingApiKey,
    /// No oracle is configured. Batches hitting this are deferred, never
    /// dropped or defaulted.
    Unavailable,
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleError::Http(msg) => write!(f, "oracle request failed: {}", msg),
            OracleError::Status(code) => write!(f, "oracle returned status {}", code),
            OracleError::BadResponse(msg) => write!(f, "unusable oracle response: {}", msg),
            OracleError::MissingApiKey => write!(f, "OPENAI_API_KEY is not set"),
            OracleError::Unavailable => write!(f, "no oracle configured"),
        }
    }
}

impl std::error::Error for OracleError {}

/// One Classify-phase judgment: raw name to category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifySuggestion {
    pub raw_name: String,
    pub category: String,
}

/// One Refine-phase row given to the oracle as context.
#[derive(Debug, Clone)]
pub struct RefineInput {
    pub raw_name: String,
    pub canonical_name: Option<String>,
    pub scientific_name: Option<String>,
}

/// One Refine-phase judgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefineSuggestion {
    pub raw_name: String,
    pub category: String,
    pub canonical_name: String,
    pub scientific_name: Option<String>,
}

#[async_trait]
pub trait NameOracle: Send + Sync {
    /// Assign a category to each raw name. Must return one suggestion per
    /// input; the engine defaults missing rows to `Other`.
    async fn classify(&self, names: &[String]) -> Result<Vec<ClassifySuggestion>, OracleError>;

    /// Unify one (crop, category) group. The whole group is supplied as
    /// context so the oracle can cluster synonyms within it.
    async fn refine(
        &self,
        crop: &str,
        category: &str,
        group: &[RefineInput],
    ) -> Result<Vec<RefineSuggestion>, OracleError>;
}

/// Stand-in for runs with `provider = "disabled"`. Every call reports
/// `Unavailable`, which the engines record as deferred batches; no row is
/// mutated or defaulted.
pub struct DisabledOracle;

#[async_trait]
impl NameOracle for DisabledOracle {
    async fn classify(&self, _names: &[String]) -> Result<Vec<ClassifySuggestion>, OracleError> {
        Err(OracleError::Unavailable)
    }

    async fn refine(
        &self,
        _crop: &str,
        _category: &str,
        _group: &[RefineInput],
    ) -> Result<Vec<RefineSuggestion>, OracleError> {
        Err(OracleError::Unavailable)
    }
}

/// Chat-completions oracle. Retries on throttling and server errors with
/// exponential backoff, fails fast on client errors.
pub struct OpenAiOracle {
    client: reqwest::Client,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiOracle {
    pub fn new(cfg: &OracleConfig) -> Result<Self, OracleError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| OracleError::MissingApiKey)?;
        let model = cfg
            .model
            .clone()
            .ok_or_else(|| OracleError::BadResponse("no model configured".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| OracleError::Http(e.to_string()))?;
        Ok(Self {
            client,
            model,
            api_key,
            max_retries: cfg.max_retries,
        })
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, OracleError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0,
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let backoff = Duration::from_secs(1u64 << (attempt - 1).min(5));

            match self
                .client
                .post("https://api.openai.com/v1/chat/completions")
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let value: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| OracleError::BadResponse(e.to_string()))?;
                        let content = value["choices"][0]["message"]["content"]
                            .as_str()
                            .ok_or_else(|| {
                                OracleError::BadResponse("no message content".to_string())
                            })?;
                        return Ok(content.to_string());
                    }
                    let code = status.as_u16();
                    if (code == 429 || code >= 500) && attempt <= self.max_retries {
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(OracleError::Status(code));
                }
                Err(e) => {
                    if attempt <= self.max_retries {
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(OracleError::Http(e.to_string()));
                }
            }
        }
    }
}

const CLASSIFY_SYSTEM: &str = "You categorize pest and target names from pesticide labels. \
For each input line, output one line: the name, a tab, and exactly one category from \
{Disease, Insects, Weeds, Growth Regulation, Vertebrate, Mollusks, Other}. \
Use Other when unsure. Output nothing else.";

const REFINE_SYSTEM: &str = "You unify pest and target names from pesticide labels into a \
canonical vocabulary. All input names belong to one crop and one category; cluster synonyms \
and spelling variants onto a single canonical common name. For each input line, output one \
line with tab-separated fields: the raw name, the category \
({Disease, Insects, Weeds, Growth Regulation, Vertebrate, Mollusks, Other}), the canonical \
common name, and the scientific name if known (use 'Genus spp.' when only the genus is \
certain, or leave the field empty). Output nothing else.";

#[async_trait]
impl NameOracle for OpenAiOracle {
    async fn classify(&self, names: &[String]) -> Result<Vec<ClassifySuggestion>, OracleError> {
        let user = names.join("\n");
        let content = self.complete(CLASSIFY_SYSTEM, &user).await?;
        parse_classify_tsv(&content)
    }

    async fn refine(
        &self,
        crop: &str,
        category: &str,
        group: &[RefineInput],
    ) -> Result<Vec<RefineSuggestion>, OracleError> {
        let mut user = format!("Crop: {}\nCategory: {}\n\n", crop, category);
        for row in group {
            user.push_str(&format!(
                "{}\t{}\t{}\n",
                row.raw_name,
                row.canonical_name.as_deref().unwrap_or(""),
                row.scientific_name.as_deref().unwrap_or("")
            ));
        }
        let content = self.complete(REFINE_SYSTEM, &user).await?;
        parse_refine_tsv(&content)
    }
}

pub fn parse_classify_tsv(content: &str) -> Result<Vec<ClassifySuggestion>, OracleError> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let raw_name = fields.next().unwrap_or("").trim();
        let category = fields.next().unwrap_or("").trim();
        if raw_name.is_empty() {
            continue;
        }
        out.push(ClassifySuggestion {
            raw_name: raw_name.to_string(),
            category: valid_category(category).unwrap_or("Other").to_string(),
        });
    }
    if out.is_empty() {
        return Err(OracleError::BadResponse("no classify rows".to_string()));
    }
    Ok(out)
}

pub fn parse_refine_tsv(content: &str) -> Result<Vec<RefineSuggestion>, OracleError> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').map(|f| f.trim()).collect();
        if fields.len() < 3 || fields[0].is_empty() || fields[2].is_empty() {
            continue;
        }
        out.push(RefineSuggestion {
            raw_name: fields[0].to_string(),
            category: valid_category(fields[1]).unwrap_or("Other").to_string(),
            canonical_name: fields[2].to_string(),
            scientific_name: fields
                .get(3)
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty()),
        });
    }
    if out.is_empty() {
        return Err(OracleError::BadResponse("no refine rows".to_string()));
    }
    Ok(out)
}
