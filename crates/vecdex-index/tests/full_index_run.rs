//! Full-lifecycle integration test across partitioning, indexing and
//! querying: a real CSV goes through [`vecdex_partition::PartitionWriter`],
//! the resulting partition CSV is indexed into an in-memory fake vector
//! store, and the fan-out query client reads the result back out.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use vecdex_core::registry::{JsonRegistry, RecordType, Registry};
use vecdex_core::token::WhitespaceTokenCounter;
use vecdex_core::vector_store::{Collection, GetRequest, GetResult, Metadata, QueryRequest, QueryResult, UpsertError, VectorStoreClient};
use vecdex_partition::{CsvSourceConfig, Manifest, PartitionWriter, PartitionWriterConfig, SourceSpec};

use vecdex_index::{BatchIndexer, IndexSourceSpec, IndexingPolicy, QueryClient, StoreAddress};

struct FakeCollection {
    name: String,
    docs: Mutex<BTreeMap<String, (String, Metadata)>>,
}

impl FakeCollection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            docs: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl Collection for FakeCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, ids: Vec<String>, documents: Vec<String>, metadatas: Vec<Metadata>) -> Result<(), UpsertError> {
        let mut docs = self.docs.lock().unwrap();
        for ((id, doc), meta) in ids.into_iter().zip(documents).zip(metadatas) {
            docs.insert(id, (doc, meta));
        }
        Ok(())
    }

    async fn get(&self, request: GetRequest) -> anyhow::Result<GetResult> {
        let docs = self.docs.lock().unwrap();
        let ids = request.ids.unwrap_or_default();
        let existing: Vec<String> = ids.into_iter().filter(|id| docs.contains_key(id)).collect();
        Ok(GetResult {
            ids: existing,
            ..Default::default()
        })
    }

    async fn query(&self, request: QueryRequest) -> anyhow::Result<QueryResult> {
        let docs = self.docs.lock().unwrap();
        let n = request.n_results.min(docs.len());
        let (ids, docs): (Vec<String>, Vec<Option<String>>) = docs
            .iter()
            .take(n)
            .map(|(id, (text, _))| (id.clone(), Some(text.clone())))
            .unzip();
        let distances: Vec<f32> = (0..ids.len()).map(|i| i as f32).collect();
        Ok(QueryResult {
            ids: vec![ids],
            distances: vec![distances],
            documents: Some(vec![docs]),
            metadatas: None,
        })
    }

    async fn count(&self) -> anyhow::Result<u64> {
        Ok(self.docs.lock().unwrap().len() as u64)
    }
}

/// Resolves every collection name to its own in-memory [`FakeCollection`],
/// creating it on first use and caching it thereafter — the same contract
/// `HttpVectorStoreClient` fulfils against a real endpoint.
struct FakeStore {
    collections: Mutex<HashMap<String, Arc<dyn Collection>>>,
}

impl FakeStore {
    fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorStoreClient for FakeStore {
    async fn get_or_create_collection(&self, name: &str) -> anyhow::Result<Arc<dyn Collection>> {
        let mut collections = self.collections.lock().unwrap();
        Ok(collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FakeCollection::new(name)) as Arc<dyn Collection>)
            .clone())
    }
}

#[tokio::test]
async fn partitions_then_indexes_then_queries_back_a_cold_source() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("table.csv");
    std::fs::write(&source_path, "id,description\n1,first document\n2,second document\n3,third document\n").unwrap();
    let partition_root = dir.path().join("partitions");

    let registry = JsonRegistry::from_json(
        r#"{
            "Table": {"name": "Table", "schema": {"fields": [{"name": "description", "type": "string"}]}}
        }"#,
    )
    .unwrap();

    let writer = PartitionWriter::open(
        PartitionWriterConfig {
            partition_root: partition_root.clone(),
            directory_size: 0,
            run_id: "run-1".to_string(),
        },
        Manifest::default(),
    )
    .unwrap();
    let source = SourceSpec {
        record_type: "Table".to_string(),
        template: source_path.to_str().unwrap().to_string(),
        target_to_source: BTreeMap::new(),
        drop_na_columns: Vec::new(),
        csv_config: CsvSourceConfig::default(),
    };
    let (manifest, outcome) = writer.run(&[source], &registry).unwrap();
    assert_eq!(outcome.partitions_created.len(), 1);
    let partition = &manifest.partitions[0];
    let partition_name = partition.name.clone();
    let csv_path = partition_root.join(&partition.models["Table"].path);

    let store = Arc::new(FakeStore::new());
    let policy = IndexingPolicy::default();
    let counter = WhitespaceTokenCounter;
    let indexer = BatchIndexer {
        policy,
        token_counter: &counter,
        compactor: None,
        resume_store: vecdex_index::ResumeStateStore::new(partition_root.join(&partition_name), partition_name.clone()),
        errors_dir: dir.path().join("errors"),
    };
    let record_type: RecordType = registry.record_type("Table").unwrap().clone();
    let index_source = IndexSourceSpec {
        record_type: "Table".to_string(),
        csv_path,
        partition_name: Some(partition_name.clone()),
        schema_version: Some(1),
        truncation_override: None,
    };
    let collection = store.get_or_create_collection(&partition_name).await.unwrap();
    let mut sink = ();
    let report = indexer
        .index_record_type(&index_source, &record_type, collection.clone(), &mut sink)
        .await
        .unwrap();
    assert_eq!(report.documents_indexed, 3);
    assert_eq!(collection.count().await.unwrap(), 3);

    // Build the query config straight off the resume-state files the
    // indexer just wrote, then fan out a query through it.
    let query_config = vecdex_index::build_query_config(&partition_root).unwrap();
    assert!(query_config.record_types.contains_key("Table"));
    assert!(query_config.collections_for("Table").contains(&partition_name));

    let mut client = QueryClient::new(
        store.clone(),
        query_config,
        StoreAddress::Http {
            host: "localhost".to_string(),
            port: 8000,
            ssl: false,
            headers: HashMap::new(),
        },
    );
    client.connect().unwrap();
    let result = client
        .query(
            Some(&["Table".to_string()]),
            QueryRequest {
                query_texts: Some(vec!["first document".to_string()]),
                n_results: 2,
                ..Default::default()
            },
            2,
        )
        .await
        .unwrap();
    assert!(!result.matches.is_empty());
    assert!(result.failed_collections.is_empty());
}
