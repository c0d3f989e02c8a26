//! Error kinds owned by the batch indexer, query client and drop
//! planner/applier (§7).

use thiserror::Error;
use vecdex_core::ConfigError;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Partition(#[from] vecdex_partition::PartitionError),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("document '{id}' exceeds the embedding token hard limit even after truncation")]
    OversizeDocument { id: String },

    #[error("upsert failed for collection '{collection}': {source}")]
    UpsertFailure {
        collection: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("duplicate ids reported by the vector store but none could be identified from its error")]
    UnresolvableDuplicateIds,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("client used before it reached the Connected state")]
    NotConnected,

    #[error("all collections failed to answer the query")]
    TotalFailure,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DropError {
    #[error(transparent)]
    Partition(#[from] vecdex_partition::PartitionError),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
