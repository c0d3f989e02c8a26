//! Collection naming strategies (§4.10). A sealed enum rather than an open
//! trait object: both the batch indexer and the query-config builder match
//! it exhaustively, per the §9 design note on re-expressing the source's
//! structurally-typed `Protocol`.

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub enum CollectionStrategy {
    /// Every partition's documents land in one statically-named collection.
    Fixed { name: String },
    /// The collection name is the partition name, optionally prefixed.
    PartitionScoped { prefix: Option<String> },
}

impl CollectionStrategy {
    /// Resolve the collection name for `partition_name`. `partition_name` is
    /// `None` for run-global operations (e.g. resolving a fixed collection
    /// with no partition in scope).
    pub fn collection_name(&self, partition_name: Option<&str>) -> Result<String, ConfigError> {
        match self {
            CollectionStrategy::Fixed { name } => Ok(name.clone()),
            CollectionStrategy::PartitionScoped { prefix } => match partition_name {
                Some(partition_name) => match prefix {
                    Some(prefix) => Ok(format!("{prefix}_{partition_name}")),
                    None => Ok(partition_name.to_string()),
                },
                None => match prefix {
                    Some(prefix) => Ok(prefix.clone()),
                    None => Err(ConfigError::CollectionStrategyNeedsPartition),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_ignores_partition_name() {
        let strategy = CollectionStrategy::Fixed {
            name: "docs".to_string(),
        };
        assert_eq!(strategy.collection_name(Some("partition_00001")).unwrap(), "docs");
        assert_eq!(strategy.collection_name(None).unwrap(), "docs");
    }

    #[test]
    fn partition_scoped_prefixes_when_configured() {
        let strategy = CollectionStrategy::PartitionScoped {
            prefix: Some("idxr".to_string()),
        };
        assert_eq!(
            strategy.collection_name(Some("partition_00001")).unwrap(),
            "idxr_partition_00001"
        );
    }

    #[test]
    fn partition_scoped_without_partition_or_prefix_is_an_error() {
        let strategy = CollectionStrategy::PartitionScoped { prefix: None };
        assert!(strategy.collection_name(None).is_err());
    }
}
