//! The fan-out query client (§4.9, §5): resolves a record-type selection to
//! a set of collections via the query config, queries each concurrently
//! with per-collection failure isolation, and merges the results by
//! ascending distance.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use vecdex_core::vector_store::{Collection, GetRequest, GetResult, QueryRequest, QueryResult, VectorStoreClient};

use crate::error::QueryError;
use crate::query_config::QueryConfig;

/// Where the underlying vector-store lives (§6): a local/self-hosted HTTP
/// endpoint, or a hosted tenant/database pair.
#[derive(Debug, Clone)]
pub enum StoreAddress {
    Http {
        host: String,
        port: u16,
        ssl: bool,
        headers: HashMap<String, String>,
    },
    Cloud {
        tenant: String,
        database: String,
        api_key: String,
        host: String,
        port: u16,
        ssl: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Uninitialised,
    Connected,
    Closed,
}

/// One merged match across every collection a query fanned out to.
#[derive(Debug, Clone)]
pub struct MergedMatch {
    pub id: String,
    pub distance: f32,
    pub collection: String,
    pub document: Option<String>,
    pub metadata: Option<vecdex_core::vector_store::Metadata>,
}

#[derive(Debug, Default)]
pub struct MergedQueryResult {
    pub matches: Vec<MergedMatch>,
    pub failed_collections: Vec<String>,
}

/// Fan-out client over a [`VectorStoreClient`], resolving which collections
/// a query touches via a [`QueryConfig`] snapshot and caching opened handles.
pub struct QueryClient {
    store: Arc<dyn VectorStoreClient>,
    config: QueryConfig,
    address: StoreAddress,
    state: ClientState,
    handles: tokio::sync::Mutex<HashMap<String, Arc<dyn Collection>>>,
}

impl QueryClient {
    pub fn new(store: Arc<dyn VectorStoreClient>, config: QueryConfig, address: StoreAddress) -> Self {
        Self {
            store,
            config,
            address,
            state: ClientState::Uninitialised,
            handles: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> &StoreAddress {
        &self.address
    }

    /// Transition `Uninitialised -> Connected`. Calling this again once
    /// connected is a no-op; calling it after `close()` is an error.
    pub fn connect(&mut self) -> Result<(), QueryError> {
        match self.state {
            ClientState::Uninitialised => {
                self.state = ClientState::Connected;
                Ok(())
            }
            ClientState::Connected => Ok(()),
            ClientState::Closed => Err(QueryError::NotConnected),
        }
    }

    pub fn close(&mut self) {
        self.state = ClientState::Closed;
    }

    fn require_connected(&self) -> Result<(), QueryError> {
        if self.state == ClientState::Connected {
            Ok(())
        } else {
            Err(QueryError::NotConnected)
        }
    }

    async fn collection_handle(&self, name: &str) -> anyhow::Result<Arc<dyn Collection>> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(name) {
            return Ok(handle.clone());
        }
        let handle = self.store.get_or_create_collection(name).await?;
        handles.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// §4.9: query every collection resolved from `record_types` (`None`/
    /// empty means every known collection) concurrently, merge by ascending
    /// distance with a stable tie-break on first-seen order, and isolate
    /// per-collection failures as warnings rather than aborting the whole
    /// query. Returns [`QueryError::TotalFailure`] only if every collection
    /// failed.
    pub async fn query(
        &self,
        record_types: Option<&[String]>,
        request: QueryRequest,
        n_results: usize,
    ) -> Result<MergedQueryResult, QueryError> {
        self.require_connected()?;
        let collections = self.config.resolve_collections(record_types);
        if collections.is_empty() {
            return Ok(MergedQueryResult::default());
        }

        let mut join_set = JoinSet::new();
        for (order, collection_name) in collections.into_iter().enumerate() {
            let handle = match self.collection_handle(&collection_name).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(collection = %collection_name, error = %e, "query client: failed to resolve collection handle");
                    continue;
                }
            };
            let request = request.clone();
            join_set.spawn(async move {
                let result = handle.query(request).await;
                (order, collection_name, result)
            });
        }

        let mut merged = MergedQueryResult::default();
        let mut per_collection: Vec<(usize, String, QueryResult)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((order, collection_name, Ok(result))) => {
                    per_collection.push((order, collection_name, result));
                }
                Ok((_order, collection_name, Err(e))) => {
                    warn!(collection = %collection_name, error = %e, "query client: collection query failed, isolating");
                    merged.failed_collections.push(collection_name);
                }
                Err(e) => {
                    warn!(error = %e, "query client: query task panicked");
                }
            }
        }

        if per_collection.is_empty() {
            return Err(QueryError::TotalFailure);
        }
        per_collection.sort_by_key(|(order, ..)| *order);

        let mut all_matches = Vec::new();
        for (order, collection_name, result) in per_collection.into_iter() {
            for query_idx in 0..result.ids.len() {
                let ids = &result.ids[query_idx];
                for (i, id) in ids.iter().enumerate() {
                    let distance = result.distances.get(query_idx).and_then(|d| d.get(i)).copied().unwrap_or(f32::MAX);
                    let document = result
                        .documents
                        .as_ref()
                        .and_then(|docs| docs.get(query_idx))
                        .and_then(|docs| docs.get(i))
                        .cloned()
                        .flatten();
                    let metadata = result
                        .metadatas
                        .as_ref()
                        .and_then(|m| m.get(query_idx))
                        .and_then(|m| m.get(i))
                        .cloned()
                        .flatten();
                    all_matches.push((order, MergedMatch {
                        id: id.clone(),
                        distance,
                        collection: collection_name.clone(),
                        document,
                        metadata,
                    }));
                }
            }
        }

        // Stable sort: ties keep the collection-resolution order recorded
        // above, since Rust's `sort_by` is a stable sort.
        all_matches.sort_by(|a, b| a.1.distance.partial_cmp(&b.1.distance).unwrap_or(std::cmp::Ordering::Equal));
        merged.matches = all_matches.into_iter().map(|(_, m)| m).take(n_results.max(1)).collect();
        Ok(merged)
    }

    /// §4.9 `get`: union of per-collection `get` results. `embeddings` is
    /// sparse (§9 open question) — only present for sub-results that
    /// returned it.
    pub async fn get(&self, record_types: Option<&[String]>, request: GetRequest) -> Result<GetResult, QueryError> {
        self.require_connected()?;
        let collections = self.config.resolve_collections(record_types);
        if collections.is_empty() {
            return Ok(GetResult::default());
        }

        let mut join_set = JoinSet::new();
        for collection_name in collections {
            let handle = match self.collection_handle(&collection_name).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(collection = %collection_name, error = %e, "query client: failed to resolve collection handle");
                    continue;
                }
            };
            let request = request.clone();
            join_set.spawn(async move { (collection_name, handle.get(request).await) });
        }

        let mut merged = GetResult::default();
        let mut any_succeeded = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_collection_name, Ok(result))) => {
                    any_succeeded = true;
                    merged.ids.extend(result.ids);
                    if let Some(docs) = result.documents {
                        merged.documents.get_or_insert_with(Vec::new).extend(docs);
                    }
                    if let Some(metas) = result.metadatas {
                        merged.metadatas.get_or_insert_with(Vec::new).extend(metas);
                    }
                    if let Some(embeddings) = result.embeddings {
                        merged.embeddings.get_or_insert_with(Vec::new).extend(embeddings);
                    }
                }
                Ok((collection_name, Err(e))) => {
                    warn!(collection = %collection_name, error = %e, "query client: collection get failed, isolating");
                }
                Err(e) => warn!(error = %e, "query client: get task panicked"),
            }
        }

        if !any_succeeded {
            return Err(QueryError::TotalFailure);
        }
        Ok(merged)
    }

    /// §4.9 `count`: sum of per-collection counts; a collection that fails
    /// to answer is logged and excluded from the sum, not fatal unless every
    /// collection fails.
    pub async fn count(&self, record_types: Option<&[String]>) -> Result<u64, QueryError> {
        self.require_connected()?;
        let collections = self.config.resolve_collections(record_types);
        if collections.is_empty() {
            return Ok(0);
        }

        let mut join_set = JoinSet::new();
        for collection_name in collections {
            let handle = match self.collection_handle(&collection_name).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(collection = %collection_name, error = %e, "query client: failed to resolve collection handle");
                    continue;
                }
            };
            join_set.spawn(async move {
                let result = handle.count().await;
                (collection_name, result)
            });
        }

        let mut total = 0u64;
        let mut any_succeeded = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_collection_name, Ok(count))) => {
                    total += count;
                    any_succeeded = true;
                }
                Ok((collection_name, Err(e))) => {
                    warn!(collection = %collection_name, error = %e, "query client: collection count failed, isolating")
                }
                Err(e) => warn!(error = %e, "query client: count task panicked"),
            }
        }
        if !any_succeeded {
            return Err(QueryError::TotalFailure);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use vecdex_core::vector_store::UpsertError;

    struct FakeCollection {
        name: String,
        ids: Vec<String>,
        distances: Vec<f32>,
        fail: bool,
    }

    #[async_trait]
    impl Collection for FakeCollection {
        fn name(&self) -> &str {
            &self.name
        }

        async fn upsert(&self, _ids: Vec<String>, _documents: Vec<String>, _metadatas: Vec<vecdex_core::vector_store::Metadata>) -> Result<(), UpsertError> {
            Ok(())
        }

        async fn get(&self, _request: GetRequest) -> anyhow::Result<GetResult> {
            Ok(GetResult {
                ids: self.ids.clone(),
                ..Default::default()
            })
        }

        async fn query(&self, _request: QueryRequest) -> anyhow::Result<QueryResult> {
            if self.fail {
                anyhow::bail!("simulated failure");
            }
            Ok(QueryResult {
                ids: vec![self.ids.clone()],
                distances: vec![self.distances.clone()],
                documents: None,
                metadatas: None,
            })
        }

        async fn count(&self) -> anyhow::Result<u64> {
            Ok(self.ids.len() as u64)
        }
    }

    struct FakeStore {
        collections: HashMap<String, Arc<dyn Collection>>,
    }

    #[async_trait]
    impl VectorStoreClient for FakeStore {
        async fn get_or_create_collection(&self, name: &str) -> anyhow::Result<Arc<dyn Collection>> {
            self.collections
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown collection {name}"))
        }
    }

    fn config_with(collections: &[(&str, &str)]) -> QueryConfig {
        let mut config = QueryConfig::default();
        for (collection, record_type) in collections {
            config.collections.entry(collection.to_string()).or_default().insert(record_type.to_string());
            let entry = config.record_types.entry(record_type.to_string()).or_default();
            entry.collections.insert(collection.to_string());
        }
        config.total_collections = config.collections.len();
        config.total_record_types = config.record_types.len();
        config
    }

    #[tokio::test]
    async fn query_before_connect_errors() {
        let store = Arc::new(FakeStore { collections: HashMap::new() });
        let client = QueryClient::new(store, QueryConfig::default(), StoreAddress::Http {
            host: "localhost".to_string(),
            port: 8000,
            ssl: false,
            headers: HashMap::new(),
        });
        let result = client.query(None, QueryRequest::default(), 5).await;
        assert!(matches!(result, Err(QueryError::NotConnected)));
    }

    #[tokio::test]
    async fn merges_matches_by_ascending_distance() {
        let mut collections: HashMap<String, Arc<dyn Collection>> = HashMap::new();
        collections.insert(
            "a".to_string(),
            Arc::new(FakeCollection {
                name: "a".to_string(),
                ids: vec!["x".to_string()],
                distances: vec![0.9],
                fail: false,
            }),
        );
        collections.insert(
            "b".to_string(),
            Arc::new(FakeCollection {
                name: "b".to_string(),
                ids: vec!["y".to_string()],
                distances: vec![0.1],
                fail: false,
            }),
        );
        let store = Arc::new(FakeStore { collections });
        let config = config_with(&[("a", "Table"), ("b", "Table")]);
        let mut client = QueryClient::new(store, config, StoreAddress::Http {
            host: "localhost".to_string(),
            port: 8000,
            ssl: false,
            headers: HashMap::new(),
        });
        client.connect().unwrap();
        let result = client.query(Some(&["Table".to_string()]), QueryRequest::default(), 5).await.unwrap();
        assert_eq!(result.matches[0].id, "y");
        assert_eq!(result.matches[1].id, "x");
    }

    #[tokio::test]
    async fn isolates_a_failing_collection() {
        let mut collections: HashMap<String, Arc<dyn Collection>> = HashMap::new();
        collections.insert(
            "a".to_string(),
            Arc::new(FakeCollection {
                name: "a".to_string(),
                ids: vec!["x".to_string()],
                distances: vec![0.5],
                fail: false,
            }),
        );
        collections.insert(
            "b".to_string(),
            Arc::new(FakeCollection {
                name: "b".to_string(),
                ids: vec![],
                distances: vec![],
                fail: true,
            }),
        );
        let store = Arc::new(FakeStore { collections });
        let config = config_with(&[("a", "Table"), ("b", "Table")]);
        let mut client = QueryClient::new(store, config, StoreAddress::Http {
            host: "localhost".to_string(),
            port: 8000,
            ssl: false,
            headers: HashMap::new(),
        });
        client.connect().unwrap();
        let result = client.query(Some(&["Table".to_string()]), QueryRequest::default(), 5).await.unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.failed_collections, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn unknown_record_type_resolves_to_nothing() {
        let store = Arc::new(FakeStore { collections: HashMap::new() });
        let config = config_with(&[]);
        let mut client = QueryClient::new(store, config, StoreAddress::Http {
            host: "localhost".to_string(),
            port: 8000,
            ssl: false,
            headers: HashMap::new(),
        });
        client.connect().unwrap();
        let result = client.query(Some(&["Ghost".to_string()]), QueryRequest::default(), 5).await.unwrap();
        assert!(result.matches.is_empty());
    }

    #[allow(dead_code)]
    fn assert_send<T: Send>() {}
    #[allow(dead_code)]
    fn check() {
        assert_send::<BTreeSet<String>>();
    }
}
