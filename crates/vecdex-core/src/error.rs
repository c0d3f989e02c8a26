//! Configuration error kind shared by every crate in the workspace (§7
//! *ConfigError*). Fatal at run start; every other error kind lives in the
//! crate that owns the component it comes from (`vecdex-partition::error`,
//! `vecdex-index::error`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown record type '{0}' referenced in configuration")]
    UnknownRecordType(String),
    #[error("invalid delimiter configuration: {0}")]
    InvalidDelimiter(String),
    #[error("invalid header_row policy '{0}', expected 'all' or 'first-only'")]
    InvalidHeaderRowPolicy(String),
    #[error("column mapping for '{field}' must be a string source column name")]
    NonStringColumnMapping { field: String },
    #[error("partition-scoped collection strategy requires a partition name or a prefix")]
    CollectionStrategyNeedsPartition,
    #[error("token budget misconfigured: TOKEN_SAFETY_LIMIT ({soft}) must be <= MAX_TOKENS_PER_REQUEST ({hard})")]
    TokenBudgetInverted { soft: usize, hard: usize },
    #[error("{field} must be non-negative, got {value}")]
    NegativeValue { field: &'static str, value: i64 },
}
