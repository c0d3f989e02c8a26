//! Layered run configuration (§10.3): deserialised from YAML/JSON, merged
//! with environment overrides by the `config` crate, validated once at load
//! time via `validator`. Vector-store credentials are never part of this
//! struct's on-disk representation — they are read from the environment
//! separately in `main.rs` and passed in after validation.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};
use vecdex_core::CollectionStrategy;
use vecdex_index::StoreAddress;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectionStrategyConfig {
    Fixed {
        name: String,
    },
    PartitionScoped {
        #[serde(default)]
        prefix: Option<String>,
    },
}

impl Default for CollectionStrategyConfig {
    fn default() -> Self {
        CollectionStrategyConfig::PartitionScoped { prefix: None }
    }
}

impl From<CollectionStrategyConfig> for CollectionStrategy {
    fn from(config: CollectionStrategyConfig) -> Self {
        match config {
            CollectionStrategyConfig::Fixed { name } => CollectionStrategy::Fixed { name },
            CollectionStrategyConfig::PartitionScoped { prefix } => CollectionStrategy::PartitionScoped { prefix },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Http {
        host: String,
        #[serde(default = "default_http_port")]
        port: u16,
        #[serde(default)]
        ssl: bool,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Cloud {
        #[serde(default = "default_tenant")]
        tenant: String,
        #[serde(default = "default_database")]
        database: String,
        #[serde(default = "default_cloud_host")]
        host: String,
        #[serde(default = "default_cloud_port")]
        port: u16,
        #[serde(default = "default_true")]
        ssl: bool,
    },
}

impl StoreConfig {
    /// Build the address the fan-out query client / HTTP vector-store
    /// client connect with. `api_key` is only consulted for `Cloud`, and
    /// must come from the environment (§10.3).
    pub fn into_address(self, api_key: Option<String>) -> anyhow::Result<StoreAddress> {
        match self {
            StoreConfig::Http { host, port, ssl, headers } => Ok(StoreAddress::Http { host, port, ssl, headers }),
            StoreConfig::Cloud {
                tenant,
                database,
                host,
                port,
                ssl,
            } => {
                let api_key = api_key.ok_or_else(|| {
                    anyhow::anyhow!("VECDEX_STORE_API_KEY must be set to use a cloud vector store")
                })?;
                Ok(StoreAddress::Cloud {
                    tenant,
                    database,
                    api_key,
                    host,
                    port,
                    ssl,
                })
            }
        }
    }
}

fn default_http_port() -> u16 {
    8000
}
fn default_tenant() -> String {
    "default_tenant".to_string()
}
fn default_database() -> String {
    "default_database".to_string()
}
fn default_cloud_host() -> String {
    "api.trychroma.com".to_string()
}
fn default_cloud_port() -> u16 {
    443
}
fn default_true() -> bool {
    true
}

/// One configured ingest source for the partition writer (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    pub record_type: String,
    pub template: String,
    #[serde(default)]
    pub target_to_source: BTreeMap<String, String>,
    #[serde(default)]
    pub drop_na_columns: Vec<String>,
    #[serde(default)]
    pub malformed_column: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_token_budget"))]
pub struct IndexingConfig {
    #[serde(default = "default_max_docs_per_request")]
    pub max_docs_per_request: usize,
    #[serde(default = "default_max_tokens_per_request")]
    pub max_tokens_per_request: usize,
    #[serde(default = "default_token_safety_limit")]
    pub token_safety_limit: usize,
    #[serde(default = "default_document_size_limit")]
    pub document_size_limit: usize,
    #[serde(default = "default_embedding_token_limit")]
    pub embedding_token_limit: usize,
    #[serde(default = "default_configured_batch_size")]
    pub configured_batch_size: usize,
    #[serde(default = "default_truncation_strategy")]
    #[validate(custom = "validate_truncation_strategy")]
    pub truncation_strategy: String,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_docs_per_request: default_max_docs_per_request(),
            max_tokens_per_request: default_max_tokens_per_request(),
            token_safety_limit: default_token_safety_limit(),
            document_size_limit: default_document_size_limit(),
            embedding_token_limit: default_embedding_token_limit(),
            configured_batch_size: default_configured_batch_size(),
            truncation_strategy: default_truncation_strategy(),
        }
    }
}

fn default_max_docs_per_request() -> usize {
    2048
}
fn default_max_tokens_per_request() -> usize {
    300_000
}
fn default_token_safety_limit() -> usize {
    250_000
}
fn default_document_size_limit() -> usize {
    16_384
}
fn default_embedding_token_limit() -> usize {
    8191
}
fn default_configured_batch_size() -> usize {
    100
}
fn default_truncation_strategy() -> String {
    "auto".to_string()
}

fn validate_truncation_strategy(value: &str) -> Result<(), ValidationError> {
    if vecdex_index::TruncationStrategy::parse(value).is_some() {
        Ok(())
    } else {
        Err(ValidationError::new("invalid truncation_strategy"))
    }
}

fn validate_token_budget(config: &IndexingConfig) -> Result<(), ValidationError> {
    if config.token_safety_limit > config.max_tokens_per_request {
        return Err(ValidationError::new("token_safety_limit must not exceed max_tokens_per_request"));
    }
    if config.max_docs_per_request == 0 || config.max_docs_per_request > 2048 {
        return Err(ValidationError::new("max_docs_per_request must be in 1..=2048"));
    }
    Ok(())
}

fn validate_header_row(value: &str) -> Result<(), ValidationError> {
    match value {
        "all" | "first-only" => Ok(()),
        _ => Err(ValidationError::new("header_row must be 'all' or 'first-only'")),
    }
}

/// The full, layered run configuration (§10.3): one struct, loaded once from
/// file + environment + CLI overrides, validated as a whole before any
/// subcommand runs.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    pub partition_root: PathBuf,
    pub manifest_path: PathBuf,
    pub registry_path: PathBuf,

    #[serde(default)]
    pub directory_size: u64,

    #[serde(default = "default_header_row")]
    #[validate(custom = "validate_header_row")]
    pub header_row: String,

    #[serde(default)]
    pub collection_strategy: CollectionStrategyConfig,

    pub store: StoreConfig,

    #[serde(default)]
    #[validate]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

fn default_header_row() -> String {
    "all".to_string()
}

impl AppConfig {
    /// Load the layered configuration: `file` (if given) is the lowest
    /// precedence layer, `VECDEX_`-prefixed environment variables override
    /// it. CLI flags are applied by the caller afterwards, then the whole
    /// thing is validated once (§10.3).
    pub fn load(file: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("VECDEX").separator("__"));
        let raw = builder.build()?;
        let app_config: AppConfig = raw.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }
}
