//! Error kinds owned by the partitioning engine (§7).

use thiserror::Error;
use vecdex_core::ConfigError;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("record type '{record_type}' changed schema but has no configured source")]
    SchemaChangeWithoutSource { record_type: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest at {path} has version {found}, expected {expected}")]
    ManifestVersionMismatch {
        path: String,
        found: u32,
        expected: u32,
    },

    #[error("manifest is malformed: {0}")]
    ManifestMalformed(String),
}
