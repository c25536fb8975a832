//! Service configuration
//!
//! Loads the TOML configuration file, validates the parts that can be checked
//! up front (gateway verb, base URL, workbook layout, cache capacities) and
//! resolves secrets from the environment at runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Label used when the registry reports a payment type missing from the table
pub const UNKNOWN_PAY_TYPE_LABEL: &str = "Unknown";

/// Main service configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    pub gateway: GatewaySection,
    #[serde(default)]
    pub workbook: WorkbookSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub enrichment: EnrichmentSection,
    #[serde(default)]
    pub pay_types: PayTypeTable,
}

/// HTTP service section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where uploaded workbooks are stored
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    /// Root of the per-task result directories
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Upper bound for a single uploaded file
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("materials/uploads")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("materials/results")
}

fn default_max_upload_bytes() -> u64 {
    50 * 1024 * 1024
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            uploads_dir: default_uploads_dir(),
            results_dir: default_results_dir(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Registry gateway section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// Gateway base URL with protocol and port
    pub base_url: String,
    /// Path of the single proxied endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// HTTP verb used for every call (validated into [`HttpVerb`])
    #[serde(default = "default_method")]
    pub method: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Value of the `origin` header
    #[serde(default)]
    pub origin: String,
    /// Value of the `referer` header
    #[serde(default)]
    pub referer: String,
    /// Environment variable containing the gateway API key
    pub api_key_env: String,
}

fn default_endpoint() -> String {
    "/gateway/request".to_string()
}

fn default_method() -> String {
    "post".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl GatewaySection {
    /// Parse the configured verb into the closed set the client supports
    pub fn verb(&self) -> Result<HttpVerb, ConfigError> {
        self.method.parse()
    }

    /// Full URL of the gateway endpoint
    pub fn endpoint_url(&self) -> Result<url::Url, ConfigError> {
        let base = url::Url::parse(&self.base_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        base.join(&self.endpoint)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {e}", self.endpoint)))
    }
}

/// HTTP verbs the gateway client can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpVerb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpVerb {
    pub fn as_method(self) -> reqwest::Method {
        match self {
            HttpVerb::Get => reqwest::Method::GET,
            HttpVerb::Post => reqwest::Method::POST,
            HttpVerb::Put => reqwest::Method::PUT,
            HttpVerb::Patch => reqwest::Method::PATCH,
            HttpVerb::Delete => reqwest::Method::DELETE,
        }
    }
}

impl FromStr for HttpVerb {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "get" => Ok(HttpVerb::Get),
            "post" => Ok(HttpVerb::Post),
            "put" => Ok(HttpVerb::Put),
            "patch" => Ok(HttpVerb::Patch),
            "delete" => Ok(HttpVerb::Delete),
            other => Err(ConfigError::UnsupportedMethod(other.to_string())),
        }
    }
}

impl fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_method())
    }
}

/// Layout of the requisition sheet (1-based, like the spreadsheet itself)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkbookSection {
    /// First row to read
    #[serde(default = "default_start_row")]
    pub start_row: u32,
    /// First column to read
    #[serde(default = "default_min_col")]
    pub min_col: u32,
    /// Last column to read (inclusive)
    #[serde(default = "default_max_col")]
    pub max_col: u32,
}

fn default_start_row() -> u32 {
    1
}

fn default_min_col() -> u32 {
    2
}

fn default_max_col() -> u32 {
    9
}

impl Default for WorkbookSection {
    fn default() -> Self {
        Self {
            start_row: default_start_row(),
            min_col: default_min_col(),
            max_col: default_max_col(),
        }
    }
}

/// LRU capacity per lookup kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSection {
    #[serde(default = "default_cache_capacity")]
    pub person_search: usize,
    #[serde(default = "default_cache_capacity")]
    pub service_catalog: usize,
    #[serde(default = "default_cache_capacity")]
    pub test_history: usize,
    #[serde(default = "default_cache_capacity")]
    pub test_report: usize,
    #[serde(default = "default_cache_capacity")]
    pub medical_history: usize,
    #[serde(default = "default_cache_capacity")]
    pub event_pay_type: usize,
}

fn default_cache_capacity() -> usize {
    1024
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            person_search: default_cache_capacity(),
            service_catalog: default_cache_capacity(),
            test_history: default_cache_capacity(),
            test_report: default_cache_capacity(),
            medical_history: default_cache_capacity(),
            event_pay_type: default_cache_capacity(),
        }
    }
}

impl CacheSection {
    fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("person_search", self.person_search),
            ("service_catalog", self.service_catalog),
            ("test_history", self.test_history),
            ("test_report", self.test_report),
            ("medical_history", self.medical_history),
            ("event_pay_type", self.event_pay_type),
        ];
        for (name, capacity) in capacities {
            if capacity == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "cache.{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Tuning of the enrichment stages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichmentSection {
    /// Size of the medical-history window ending at the visit date
    #[serde(default = "default_history_window_days")]
    pub history_window_days: i64,
}

fn default_history_window_days() -> i64 {
    14
}

impl Default for EnrichmentSection {
    fn default() -> Self {
        Self {
            history_window_days: default_history_window_days(),
        }
    }
}

/// Payment-type identifier to human-readable label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct PayTypeTable(BTreeMap<String, String>);

impl PayTypeTable {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }

    /// Label for a payment-type id, or [`UNKNOWN_PAY_TYPE_LABEL`]
    pub fn label(&self, pay_type_id: &str) -> String {
        self.0
            .get(pay_type_id)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_PAY_TYPE_LABEL.to_string())
    }
}

impl Default for PayTypeTable {
    fn default() -> Self {
        let entries = [
            ("1", "OMS"),
            ("2", "Budget"),
            ("3", "Paid"),
            ("4", "VHI"),
            ("5", "Other"),
        ];
        Self(
            entries
                .into_iter()
                .map(|(id, label)| (id.to_string(), label.to_string()))
                .collect(),
        )
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Unsupported HTTP method for gateway: {0}")]
    UnsupportedMethod(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that does not require the network or the environment
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gateway.verb()?;
        self.gateway.endpoint_url()?;

        if self.gateway.api_key_env.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "gateway.api_key_env must name an environment variable".to_string(),
            ));
        }

        let workbook = &self.workbook;
        if workbook.start_row == 0 || workbook.min_col == 0 {
            return Err(ConfigError::InvalidConfig(
                "workbook rows and columns are 1-based".to_string(),
            ));
        }
        if workbook.max_col < workbook.min_col {
            return Err(ConfigError::InvalidConfig(format!(
                "workbook.max_col ({}) is before workbook.min_col ({})",
                workbook.max_col, workbook.min_col
            )));
        }

        if self.enrichment.history_window_days <= 0 {
            return Err(ConfigError::InvalidConfig(
                "enrichment.history_window_days must be positive".to_string(),
            ));
        }

        self.cache.validate()
    }

    /// Get the gateway API key from its environment variable
    pub fn get_gateway_api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.gateway.api_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.gateway.api_key_env.clone()))
    }

    /// Create a configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[gateway]
base_url = "http://localhost:9000"
api_key_env = "REGISTRY_API_KEY"
origin = "http://registry.local"
referer = "http://registry.local/"

[workbook]
start_row = 3
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
