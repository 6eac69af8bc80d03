//! TOML configuration.
//!
//! Every tunable has a serde default, so a minimal config file only needs
//! the paths. `load_config` validates the combinations that defaults
//! cannot catch.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub qa: QaConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Root directory for acquired PDFs and their metadata sidecars.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_catalog_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_catalog_base_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_catalog_timeout_secs(),
        }
    }
}

fn default_catalog_base_url() -> String {
    "https://extapps.dec.ny.gov/nyspad".to_string()
}
fn default_user_agent() -> String {
    "labelforge/0.3 (research pipeline)".to_string()
}
fn default_catalog_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcquisitionConfig {
    /// Upper bound on concurrently running acquisition sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Global throttle: a new session may start only this long after the
    /// previous session start, regardless of pool size.
    #[serde(default = "default_session_start_delay_ms")]
    pub session_start_delay_ms: u64,
    /// Politeness delay between steps inside one session.
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    /// Forwarded to session construction; honored by browser-backed
    /// catalogs, ignored by the plain HTTP catalog.
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Bounded retries per item; each retry opens a fresh session.
    #[serde(default = "default_acquire_retries")]
    pub max_retries: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            session_start_delay_ms: default_session_start_delay_ms(),
            step_delay_ms: default_step_delay_ms(),
            headless: default_headless(),
            max_retries: default_acquire_retries(),
        }
    }
}

fn default_max_sessions() -> usize {
    6
}
fn default_session_start_delay_ms() -> u64 {
    10_000
}
fn default_step_delay_ms() -> u64 {
    2_000
}
fn default_headless() -> bool {
    true
}
fn default_acquire_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct QaConfig {
    /// Below this total length the document is an overlay-only scan;
    /// acceptable for non-primary label types.
    #[serde(default = "default_min_total_chars")]
    pub min_total_chars: usize,
    /// Pages below this length are flagged for page-level OCR.
    #[serde(default = "default_min_page_chars")]
    pub min_page_chars: usize,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            min_total_chars: default_min_total_chars(),
            min_page_chars: default_min_page_chars(),
        }
    }
}

fn default_min_total_chars() -> usize {
    200
}
fn default_min_page_chars() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// Compute-bound pool size, independent of the acquisition pool.
    #[serde(default = "default_ocr_workers")]
    pub workers: usize,
    /// An OCR page replaces the original page only when it yields at
    /// least this many more characters.
    #[serde(default = "default_min_gain_chars")]
    pub min_gain_chars: usize,
    /// Page render resolution passed to the rasterizer (dpi).
    #[serde(default = "default_ocr_dpi")]
    pub dpi: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            workers: default_ocr_workers(),
            min_gain_chars: default_min_gain_chars(),
            dpi: default_ocr_dpi(),
        }
    }
}

fn default_ocr_workers() -> usize {
    4
}
fn default_min_gain_chars() -> usize {
    100
}
fn default_ocr_dpi() -> u32 {
    400
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Small batches preserve oracle accuracy in the Classify phase.
    #[serde(default = "default_classify_batch_size")]
    pub classify_batch_size: usize,
    /// Larger batches maximize shared context in the Refine phase; capped
    /// below the practical prompt-size ceiling.
    #[serde(default = "default_refine_batch_size")]
    pub refine_batch_size: usize,
    #[serde(default = "default_oracle_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_oracle_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_oracle_provider(),
            model: None,
            classify_batch_size: default_classify_batch_size(),
            refine_batch_size: default_refine_batch_size(),
            max_retries: default_oracle_max_retries(),
            timeout_secs: default_oracle_timeout_secs(),
        }
    }
}

fn default_oracle_provider() -> String {
    "disabled".to_string()
}
fn default_classify_batch_size() -> usize {
    100
}
fn default_refine_batch_size() -> usize {
    250
}
fn default_oracle_max_retries() -> u32 {
    5
}
fn default_oracle_timeout_secs() -> u64 {
    120
}

impl OracleConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.acquisition.max_sessions == 0 {
        anyhow::bail!("acquisition.max_sessions must be >= 1");
    }

    if config.qa.min_page_chars == 0 {
        anyhow::bail!("qa.min_page_chars must be > 0");
    }

    if config.ocr.workers == 0 {
        anyhow::bail!("ocr.workers must be >= 1");
    }

    if config.oracle.is_enabled() {
        if config.oracle.model.is_none() {
            anyhow::bail!(
                "oracle.model must be specified when provider is '{}'",
                config.oracle.provider
            );
        }
        if config.oracle.classify_batch_size == 0 || config.oracle.refine_batch_size == 0 {
            anyhow::bail!("oracle batch sizes must be > 0");
        }
    }

    match config.oracle.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown oracle provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}

impl Config {
    /// Minimal in-memory configuration for tests and scaffold commands.
    pub fn minimal(root: PathBuf) -> Self {
        Self {
            db: DbConfig {
                path: root.join("labelforge.sqlite"),
            },
            store: StoreConfig {
                root: root.join("labels"),
            },
            catalog: CatalogConfig::default(),
            acquisition: AcquisitionConfig::default(),
            qa: QaConfig::default(),
            ocr: OcrConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}
