//! The vector-store interface (§6): a collection handle's `upsert`/`get`/
//! `query`/`count` operations, consumed by both the batch indexer and the
//! fan-out query client.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Error taxonomy for `upsert` (§6, §7 *DuplicateID* / *UpsertFailure*).
#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("duplicate document ids: {ids:?}")]
    DuplicateId { ids: Vec<String> },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Canonical shape of `<record_type>:<40-hex>` document ids, used to parse
/// duplicate ids out of an unstructured error message (§9 design note) when
/// the collaborator does not surface them structurally.
fn duplicate_id_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"[^,\s]+:[0-9a-fA-F]{16,}").expect("valid regex"))
}

/// Parse document ids matching the canonical `<type>:<40hex>` shape out of a
/// free-text error message. Used as the fallback path when a vector-store
/// error does not structurally carry the offending ids.
pub fn parse_duplicate_ids(message: &str) -> Vec<String> {
    duplicate_id_pattern()
        .find_iter(message)
        .map(|m| m.as_str().to_string())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    pub ids: Option<Vec<String>>,
    pub where_: Option<serde_json::Value>,
    pub where_document: Option<serde_json::Value>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub include: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetResult {
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<Option<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadatas: Option<Vec<Option<Metadata>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<Option<Vec<f32>>>>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub query_texts: Option<Vec<String>>,
    pub query_embeddings: Option<Vec<Vec<f32>>>,
    pub n_results: usize,
    pub where_: Option<serde_json::Value>,
    pub where_document: Option<serde_json::Value>,
    pub include: Option<Vec<String>>,
}

/// One `query` response, per query index: `ids[i]`, `distances[i]`, etc.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub ids: Vec<Vec<String>>,
    pub distances: Vec<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadatas: Option<Vec<Vec<Option<Metadata>>>>,
}

/// A single opened collection. Implementations wrap an HTTP/Cloud vector
/// store client; a test double can be an in-memory `Mutex<HashMap<..>>`.
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert(
        &self,
        ids: Vec<String>,
        documents: Vec<String>,
        metadatas: Vec<Metadata>,
    ) -> Result<(), UpsertError>;

    async fn get(&self, request: GetRequest) -> anyhow::Result<GetResult>;

    async fn query(&self, request: QueryRequest) -> anyhow::Result<QueryResult>;

    async fn count(&self) -> anyhow::Result<u64>;
}

/// The vector-store client: resolves collection handles by name, creating
/// them if absent (§3 Collection).
#[async_trait]
pub trait VectorStoreClient: Send + Sync {
    async fn get_or_create_collection(&self, name: &str) -> anyhow::Result<std::sync::Arc<dyn Collection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duplicate_ids_from_free_text() {
        let message = "upsert failed: ids Table:0123456789abcdef0123, Field:fedcba9876543210fedc already exist";
        let ids = parse_duplicate_ids(message);
        assert_eq!(
            ids,
            vec![
                "Table:0123456789abcdef0123".to_string(),
                "Field:fedcba9876543210fedc".to_string(),
            ]
        );
    }

    #[test]
    fn ignores_short_hex_runs() {
        let message = "id foo:abcd is not a real document id";
        assert!(parse_duplicate_ids(message).is_empty());
    }
}
